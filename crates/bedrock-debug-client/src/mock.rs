//! A tiny scriptable debug agent used for unit/integration testing.
//!
//! It speaks just enough of the framed protocol to exercise the client:
//! canned bodies for the query commands, per-command reply delays and
//! drops, error injection, protocol announcement, and on-demand event
//! emission. Every received envelope is recorded so tests can assert on
//! exactly what went over the wire.

use std::{
    collections::{HashMap, HashSet},
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use serde_json::{json, Value};
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener,
    },
    sync::{mpsc, watch, Mutex},
};
use tokio_util::sync::CancellationToken;

use bedrock_debug_proto::{encode_envelope, FrameDecoder};

#[derive(Clone, Debug)]
pub struct DelayedReply {
    pub command: String,
    pub delay: Duration,
}

#[derive(Clone, Debug, Default)]
pub struct MockAgentConfig {
    /// Announced via a `ProtocolEvent` as soon as a client connects, when
    /// non-zero.
    pub protocol_version: i32,
    /// Response bodies for `evaluate`, keyed by expression. Unknown
    /// expressions get an error reply.
    pub evaluate_results: HashMap<String, Value>,
    /// Response bodies for `variables`, keyed by reference. Unknown
    /// references get an error reply (an expired handle, as far as the
    /// client can tell).
    pub variables: HashMap<i64, Value>,
    /// Body for `stackTrace`.
    pub stack_frames: Option<Value>,
    /// Body for `scopes`.
    pub scopes: Option<Value>,
    /// Replies the agent sits on for a while. Other commands are still
    /// answered while a delayed reply is pending.
    pub delayed_replies: Vec<DelayedReply>,
    /// Commands the agent never answers (timeout tests).
    pub drop_commands: HashSet<String>,
    /// Commands answered with the given error string.
    pub fail_commands: HashMap<String, String>,
}

impl MockAgentConfig {
    fn delay_for(&self, command: &str) -> Option<Duration> {
        self.delayed_replies
            .iter()
            .find(|d| d.command == command)
            .map(|d| d.delay)
    }
}

pub struct MockDebugAgent {
    addr: SocketAddr,
    shutdown: CancellationToken,
    state: Arc<State>,
}

struct State {
    config: MockAgentConfig,
    received: Mutex<Vec<Value>>,
    received_tx: mpsc::UnboundedSender<Value>,
    received_rx: Mutex<mpsc::UnboundedReceiver<Value>>,
    writer: Mutex<Option<OwnedWriteHalf>>,
    connected: watch::Sender<bool>,
}

impl MockDebugAgent {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(MockAgentConfig::default()).await
    }

    pub async fn spawn_with_config(config: MockAgentConfig) -> std::io::Result<Self> {
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0);
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();

        let (received_tx, received_rx) = mpsc::unbounded_channel();
        let (connected, _) = watch::channel(false);
        let state = Arc::new(State {
            config,
            received: Mutex::new(Vec::new()),
            received_tx,
            received_rx: Mutex::new(received_rx),
            writer: Mutex::new(None),
            connected,
        });

        let task_state = state.clone();
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            let _ = run(listener, task_state, task_shutdown).await;
        });

        Ok(Self {
            addr,
            shutdown,
            state,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Every envelope received so far, in arrival order.
    pub async fn received(&self) -> Vec<Value> {
        self.state.received.lock().await.clone()
    }

    /// The next received envelope, in arrival order.
    pub async fn recv_envelope(&self) -> Option<Value> {
        self.state.received_rx.lock().await.recv().await
    }

    /// The next received envelope of the given `type`, discarding others.
    pub async fn recv_envelope_of(&self, kind: &str) -> Option<Value> {
        let mut rx = self.state.received_rx.lock().await;
        while let Some(envelope) = rx.recv().await {
            if envelope.get("type").and_then(Value::as_str) == Some(kind) {
                return Some(envelope);
            }
        }
        None
    }

    /// Emit an event envelope to the connected client, waiting for the
    /// connection first if necessary.
    pub async fn send_event(&self, event: Value) -> std::io::Result<()> {
        let mut connected = self.state.connected.subscribe();
        let _ = connected.wait_for(|c| *c).await;
        self.state.write_envelope(&event_envelope(event)).await
    }

    /// Drop the client connection, simulating the host going away.
    pub async fn disconnect_client(&self) {
        let mut writer = self.state.writer.lock().await;
        if let Some(mut writer) = writer.take() {
            let _ = writer.shutdown().await;
        }
    }
}

impl State {
    async fn write_envelope(&self, envelope: &Value) -> std::io::Result<()> {
        let bytes = encode_envelope(envelope)
            .map_err(|err| std::io::Error::new(std::io::ErrorKind::InvalidData, err))?;
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_all(&bytes).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "no client connected",
            )),
        }
    }
}

fn event_envelope(event: Value) -> Value {
    json!({"version": 1, "type": "event", "event": event})
}

fn response_envelope(request_seq: u64, outcome: Result<Value, String>) -> Value {
    match outcome {
        Ok(body) => json!({
            "version": 1,
            "type": "response",
            "request_seq": request_seq,
            "body": body,
        }),
        Err(error) => json!({
            "version": 1,
            "type": "response",
            "request_seq": request_seq,
            "error": error,
        }),
    }
}

async fn run(
    listener: TcpListener,
    state: Arc<State>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (stream, _peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            res = listener.accept() => res?,
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        {
            let mut slot = state.writer.lock().await;
            *slot = Some(writer);
        }
        state.connected.send_replace(true);

        if state.config.protocol_version > 0 {
            let _ = state
                .write_envelope(&event_envelope(json!({
                    "type": "ProtocolEvent",
                    "version": state.config.protocol_version,
                })))
                .await;
        }

        serve_client(reader, &state, &shutdown).await;
        state.connected.send_replace(false);
    }
}

async fn serve_client(
    mut reader: OwnedReadHalf,
    state: &Arc<State>,
    shutdown: &CancellationToken,
) {
    use tokio::io::AsyncReadExt;

    let mut decoder = FrameDecoder::new();
    let mut chunk = vec![0u8; 4096];
    loop {
        let read = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = reader.read(&mut chunk) => res,
        };
        let n = match read {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };

        decoder.push(&chunk[..n]);
        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            let Ok(envelope) = serde_json::from_slice::<Value>(&frame) else {
                return;
            };

            state.received.lock().await.push(envelope.clone());
            let _ = state.received_tx.send(envelope.clone());

            if envelope.get("type").and_then(Value::as_str) == Some("request") {
                let state = state.clone();
                tokio::spawn(async move {
                    handle_request(&state, &envelope["request"]).await;
                });
            }
        }
    }
}

async fn handle_request(state: &Arc<State>, request: &Value) {
    let Some(request_seq) = request.get("request_seq").and_then(Value::as_u64) else {
        return;
    };
    let command = request
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let args = request.get("args").cloned().unwrap_or(Value::Null);

    if state.config.drop_commands.contains(&command) {
        return;
    }
    if let Some(delay) = state.config.delay_for(&command) {
        tokio::time::sleep(delay).await;
    }

    let outcome = if let Some(error) = state.config.fail_commands.get(&command) {
        Err(error.clone())
    } else {
        canned_reply(&state.config, &command, &args)
    };

    let _ = state
        .write_envelope(&response_envelope(request_seq, outcome))
        .await;
}

fn canned_reply(config: &MockAgentConfig, command: &str, args: &Value) -> Result<Value, String> {
    match command {
        "continue" | "pause" | "next" | "stepIn" | "stepOut" => Ok(json!({})),
        "evaluate" => {
            let expression = args
                .get("expression")
                .and_then(Value::as_str)
                .unwrap_or_default();
            config
                .evaluate_results
                .get(expression)
                .cloned()
                .ok_or_else(|| format!("no result for expression {expression:?}"))
        }
        "variables" => {
            let reference = args
                .get("variablesReference")
                .and_then(Value::as_i64)
                .unwrap_or_default();
            config
                .variables
                .get(&reference)
                .cloned()
                .ok_or_else(|| format!("unknown variables reference {reference}"))
        }
        "stackTrace" => Ok(config.stack_frames.clone().unwrap_or_else(|| json!([]))),
        "scopes" => Ok(config.scopes.clone().unwrap_or_else(|| json!([]))),
        "setBreakpoints" => {
            let breakpoints = args
                .pointer("/breakpoints/breakpoints")
                .and_then(Value::as_array)
                .cloned()
                .unwrap_or_default();
            let statuses: Vec<Value> = breakpoints
                .iter()
                .map(|bp| json!({"verified": true, "line": bp.get("line").cloned()}))
                .collect();
            Ok(json!(statuses))
        }
        other => Err(format!("unknown command {other:?}")),
    }
}
