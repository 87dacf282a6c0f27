//! Connection-level behavior: correlation, ordering, timeouts, teardown.
//!
//! These tests drive the agent side of the wire by hand over an in-memory
//! duplex stream, so they can control response ordering and timing exactly.

use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use bedrock_debug_client::{ConnectionConfig, ConnectionEvent, DebugConnection, DebugError};
use bedrock_debug_proto::{encode_envelope, FrameDecoder};
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// The agent side of a duplex wire.
struct WireAgent {
    reader: ReadHalf<DuplexStream>,
    writer: WriteHalf<DuplexStream>,
    decoder: FrameDecoder,
}

impl WireAgent {
    fn new(stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader,
            writer,
            decoder: FrameDecoder::new(),
        }
    }

    async fn recv(&mut self) -> Result<Value> {
        let mut chunk = [0u8; 1024];
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(serde_json::from_slice(&frame)?);
            }
            let n = self.reader.read(&mut chunk).await?;
            if n == 0 {
                return Err(anyhow!("agent: stream ended"));
            }
            self.decoder.push(&chunk[..n]);
        }
    }

    async fn send(&mut self, envelope: &Value) -> Result<()> {
        self.writer.write_all(&encode_envelope(envelope)?).await?;
        Ok(())
    }

    async fn respond(&mut self, request_seq: u64, body: Value) -> Result<()> {
        self.send(&json!({
            "version": 1,
            "type": "response",
            "request_seq": request_seq,
            "body": body,
        }))
        .await
    }

    async fn respond_err(&mut self, request_seq: u64, error: &str) -> Result<()> {
        self.send(&json!({
            "version": 1,
            "type": "response",
            "request_seq": request_seq,
            "error": error,
        }))
        .await
    }
}

fn pair(config: ConnectionConfig) -> (DebugConnection, WireAgent) {
    let (client_stream, agent_stream) = tokio::io::duplex(64 * 1024);
    let conn = DebugConnection::from_stream(client_stream, config);
    (conn, WireAgent::new(agent_stream))
}

fn seq_of(envelope: &Value) -> u64 {
    envelope["request"]["request_seq"].as_u64().expect("request_seq")
}

#[tokio::test(flavor = "current_thread")]
async fn request_seqs_are_monotonic_in_call_order() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());

        let agent_task = tokio::spawn(async move {
            let mut seqs = Vec::new();
            for _ in 0..5 {
                let envelope = agent.recv().await?;
                assert_eq!(envelope["version"], 1);
                assert_eq!(envelope["type"], "request");
                let seq = seq_of(&envelope);
                seqs.push(seq);
                agent.respond(seq, json!({})).await?;
            }
            Ok::<_, anyhow::Error>(seqs)
        });

        for _ in 0..5 {
            conn.send_request("pause", Value::Null).await?;
        }

        let seqs = agent_task.await??;
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn correlates_out_of_order_responses() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());

        let agent_task = tokio::spawn(async move {
            let first = agent.recv().await?;
            let second = agent.recv().await?;
            // Answer the later request first.
            agent.respond(seq_of(&second), json!({"tag": "b"})).await?;
            agent.respond(seq_of(&first), json!({"tag": "a"})).await?;
            Ok::<_, anyhow::Error>(())
        });

        let (a, b) = tokio::join!(
            conn.send_request("evaluate", json!({"expression": "a"})),
            conn.send_request("evaluate", json!({"expression": "b"})),
        );
        assert_eq!(a?, json!({"tag": "a"}));
        assert_eq!(b?, json!({"tag": "b"}));

        agent_task.await??;
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn timeout_rejects_only_the_waiting_request() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let config = ConnectionConfig {
            request_timeout: Duration::from_millis(50),
            ..ConnectionConfig::default()
        };
        let (conn, mut agent) = pair(config);

        let started = Instant::now();
        let err = conn
            .send_request("pause", Value::Null)
            .await
            .expect_err("no response was sent");
        let elapsed = started.elapsed();
        assert!(matches!(err, DebugError::Timeout), "{err:?}");
        assert!(
            elapsed >= Duration::from_millis(45) && elapsed < Duration::from_millis(500),
            "timed out after {elapsed:?}"
        );

        // The request reached the agent; answer it late. The entry is gone,
        // so the reply must be dropped without disturbing anything.
        let envelope = agent.recv().await?;
        agent.respond(seq_of(&envelope), json!({"late": true})).await?;

        // The connection is still usable afterwards.
        let follow_up = tokio::spawn(async move {
            let envelope = agent.recv().await?;
            agent.respond(seq_of(&envelope), json!({"ok": true})).await?;
            Ok::<_, anyhow::Error>(agent)
        });
        let body = conn.send_request("pause", Value::Null).await?;
        assert_eq!(body, json!({"ok": true}));
        follow_up.await??;
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn stream_end_rejects_all_pending_and_emits_end_once() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());
        let mut events = conn.subscribe_events();

        let agent_task = tokio::spawn(async move {
            // Absorb the three requests, then vanish.
            for _ in 0..3 {
                let _ = agent.recv().await?;
            }
            Ok::<_, anyhow::Error>(())
        });

        let (a, b, c) = tokio::join!(
            conn.send_request("continue", Value::Null),
            conn.send_request("pause", Value::Null),
            conn.send_request("next", Value::Null),
        );
        agent_task.await??;

        for outcome in [a, b, c] {
            let err = outcome.expect_err("the stream ended with the request pending");
            assert!(matches!(err, DebugError::ConnectionClosed), "{err:?}");
        }

        let event = events.recv().await?;
        assert!(matches!(event, ConnectionEvent::End), "{event:?}");
        // Nothing further arrives; in particular no second `End`.
        let extra = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(extra.is_err(), "unexpected extra event: {extra:?}");

        assert!(conn.closed_token().is_cancelled());
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn remote_errors_surface_on_the_matching_future() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());

        let agent_task = tokio::spawn(async move {
            let envelope = agent.recv().await?;
            agent.respond_err(seq_of(&envelope), "no frame selected").await?;
            let envelope = agent.recv().await?;
            agent.respond(seq_of(&envelope), json!({"fine": true})).await?;
            Ok::<_, anyhow::Error>(())
        });

        let err = conn
            .send_request("scopes", json!({"frameId": 9}))
            .await
            .expect_err("the agent rejected this request");
        match err {
            DebugError::Remote(message) => assert_eq!(message, "no frame selected"),
            other => panic!("unexpected error: {other:?}"),
        }

        // The failure did not poison the connection.
        let body = conn.send_request("pause", Value::Null).await?;
        assert_eq!(body, json!({"fine": true}));
        agent_task.await??;
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn envelopes_are_stamped_with_version_and_type() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());

        conn.send_envelope("stopOnException", json!({"stopOnException": true}))
            .await?;
        conn.send_envelope("resume", Value::Null).await?;

        let envelope = agent.recv().await?;
        assert_eq!(
            envelope,
            json!({"version": 1, "type": "stopOnException", "stopOnException": true})
        );
        let envelope = agent.recv().await?;
        assert_eq!(envelope, json!({"version": 1, "type": "resume"}));
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn undecodable_frames_tear_the_connection_down() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());
        let mut events = conn.subscribe_events();

        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("pause", Value::Null).await }
        });
        let _ = agent.recv().await?;

        // A well-framed body that is not JSON at all.
        agent
            .writer
            .write_all(&bedrock_debug_proto::encode_frame(b"not json"))
            .await?;

        let event = events.recv().await?;
        assert!(matches!(event, ConnectionEvent::Error(_)), "{event:?}");
        let event = events.recv().await?;
        assert!(matches!(event, ConnectionEvent::End), "{event:?}");

        let err = pending.await?.expect_err("teardown rejects pending requests");
        assert!(matches!(err, DebugError::ConnectionClosed), "{err:?}");
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn malformed_length_headers_are_fatal() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());
        let mut events = conn.subscribe_events();

        agent.writer.write_all(b"xxxxxxxx\n").await?;

        let event = events.recv().await?;
        assert!(matches!(event, ConnectionEvent::Error(_)), "{event:?}");
        let event = events.recv().await?;
        assert!(matches!(event, ConnectionEvent::End), "{event:?}");
        assert!(conn.closed_token().is_cancelled());
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn close_is_idempotent_and_rejects_in_flight_requests() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());
        let mut events = conn.subscribe_events();

        let pending = tokio::spawn({
            let conn = conn.clone();
            async move { conn.send_request("pause", Value::Null).await }
        });
        let _ = agent.recv().await?;

        conn.close();
        conn.close();

        let err = pending.await?.expect_err("close rejects pending requests");
        assert!(matches!(err, DebugError::ConnectionClosed), "{err:?}");

        let event = events.recv().await?;
        assert!(matches!(event, ConnectionEvent::End), "{event:?}");
        let extra = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(extra.is_err(), "unexpected extra event: {extra:?}");
        Ok(())
    })
    .await?
}

#[tokio::test(flavor = "current_thread")]
async fn events_are_dispatched_in_arrival_order() -> Result<()> {
    tokio::time::timeout(TEST_TIMEOUT, async {
        let (conn, mut agent) = pair(ConnectionConfig::default());
        let mut events = conn.subscribe_events();

        for n in 0..3 {
            agent
                .send(&json!({
                    "version": 1,
                    "type": "event",
                    "event": {"type": "PrintEvent", "message": format!("m{n}"), "logLevel": 1},
                }))
                .await?;
        }

        for n in 0..3 {
            match events.recv().await? {
                ConnectionEvent::Event(event) => {
                    assert_eq!(event["message"], format!("m{n}"));
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
        Ok(())
    })
    .await?
}
