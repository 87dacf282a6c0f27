//! The correlating connection to a debug agent.
//!
//! A [`DebugConnection`] owns the socket exclusively. One spawned read task
//! drives the frame decoder and dispatches inbound envelopes; responses are
//! matched to their waiting futures by `request_seq`, events are fanned out
//! on a broadcast channel, and anything unrecognized is ignored so newer
//! agents keep working. Closing the connection (explicitly or because the
//! stream ended) rejects every in-flight request with
//! [`DebugError::ConnectionClosed`] and emits [`ConnectionEvent::End`]
//! exactly once.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use serde_json::Value;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf},
    net::TcpStream,
    sync::{broadcast, oneshot, Mutex},
};
use tokio_util::sync::CancellationToken;

use bedrock_debug_proto::{
    decode_incoming, encode_envelope, CommandEnvelope, FrameDecoder, Incoming, RequestEnvelope,
    DEFAULT_MAX_FRAME_LEN,
};

use crate::{error::DebugError, Result, TRACE_TARGET};

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Wall-clock budget for each request; the connection stays open when a
    /// request times out.
    pub request_timeout: Duration,
    pub event_channel_size: usize,
    pub max_frame_len: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            event_channel_size: 64,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// What the read loop fans out to subscribers.
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    /// The inner object of an `"event"` envelope, `type` field included.
    Event(Value),
    /// A fatal transport error; teardown follows immediately.
    Error(String),
    /// The stream ended. Emitted exactly once.
    End,
}

type BoxedStream = Box<dyn AsyncReadWrite>;

trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T> AsyncReadWrite for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

struct Inner {
    writer: Mutex<WriteHalf<BoxedStream>>,
    pending: Mutex<HashMap<u32, oneshot::Sender<Result<Value>>>>,
    next_seq: AtomicU32,
    events: broadcast::Sender<ConnectionEvent>,
    closed: CancellationToken,
    config: ConnectionConfig,
}

#[derive(Clone)]
pub struct DebugConnection {
    inner: Arc<Inner>,
}

impl DebugConnection {
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        Self::connect_with_config(addr, ConnectionConfig::default()).await
    }

    pub async fn connect_with_config(addr: SocketAddr, config: ConnectionConfig) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Self::from_stream(stream, config))
    }

    /// Wrap an already-established duplex stream (tests use
    /// `tokio::io::duplex`).
    pub fn from_stream<S>(stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let stream: BoxedStream = Box::new(stream);
        let (reader, writer) = tokio::io::split(stream);
        let (events, _) = broadcast::channel(config.event_channel_size);

        let inner = Arc::new(Inner {
            writer: Mutex::new(writer),
            pending: Mutex::new(HashMap::new()),
            next_seq: AtomicU32::new(1),
            events,
            closed: CancellationToken::new(),
            config,
        });

        tokio::spawn(read_loop(reader, inner.clone()));

        Self { inner }
    }

    /// Request orderly shutdown. Idempotent; pending requests are rejected
    /// by the read loop's teardown.
    pub fn close(&self) {
        self.inner.closed.cancel();
    }

    /// Cancelled once the connection is closed, whether by [`close`] or by
    /// the agent going away.
    ///
    /// [`close`]: DebugConnection::close
    pub fn closed_token(&self) -> CancellationToken {
        self.inner.closed.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.inner.events.subscribe()
    }

    /// Emit a fire-and-forget envelope of the given type. `payload` fields
    /// are flattened next to the `type` tag; pass `Value::Null` for none.
    pub async fn send_envelope(&self, kind: &str, payload: Value) -> Result<()> {
        let envelope = CommandEnvelope::new(kind, payload);
        let bytes = encode_envelope(&envelope)
            .map_err(|err| DebugError::Decode(err.to_string()))?;
        self.write_all(&bytes).await
    }

    /// Send a `"request"` envelope and await its correlated response body.
    ///
    /// Fails with [`DebugError::Remote`] when the agent answers with an
    /// error string, [`DebugError::Timeout`] when no response arrives in
    /// time (the connection survives), and
    /// [`DebugError::ConnectionClosed`] when the stream ends first.
    pub async fn send_request(&self, command: &str, args: Value) -> Result<Value> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        {
            let mut pending = self.inner.pending.lock().await;
            pending.insert(seq, tx);
        }

        let envelope = RequestEnvelope::new(seq, command, args);
        let bytes = match encode_envelope(&envelope) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.remove_pending(seq).await;
                return Err(DebugError::Decode(err.to_string()));
            }
        };
        if let Err(err) = self.write_all(&bytes).await {
            self.remove_pending(seq).await;
            return Err(err);
        }

        tokio::select! {
            _ = self.inner.closed.cancelled() => {
                self.remove_pending(seq).await;
                Err(DebugError::ConnectionClosed)
            }
            res = tokio::time::timeout(self.inner.config.request_timeout, rx) => {
                match res {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_closed)) => Err(DebugError::ConnectionClosed),
                    Err(_elapsed) => {
                        // Drop the entry so a late response is discarded
                        // instead of waking a dead future.
                        self.remove_pending(seq).await;
                        Err(DebugError::Timeout)
                    }
                }
            }
        }
    }

    async fn write_all(&self, bytes: &[u8]) -> Result<()> {
        let mut writer = self.inner.writer.lock().await;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    async fn remove_pending(&self, seq: u32) {
        let mut pending = self.inner.pending.lock().await;
        pending.remove(&seq);
    }
}

async fn read_loop(mut reader: ReadHalf<BoxedStream>, inner: Arc<Inner>) {
    let mut decoder = FrameDecoder::with_max_frame_len(inner.config.max_frame_len);
    let mut chunk = vec![0u8; 4096];
    let mut fatal: Option<DebugError> = None;

    'read: loop {
        let read = tokio::select! {
            _ = inner.closed.cancelled() => break 'read,
            res = reader.read(&mut chunk) => res,
        };

        let n = match read {
            Ok(0) => break 'read,
            Ok(n) => n,
            Err(err) => {
                fatal = Some(DebugError::Io(err));
                break 'read;
            }
        };

        decoder.push(&chunk[..n]);
        loop {
            let frame = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(err) => {
                    fatal = Some(DebugError::Framing(err));
                    break 'read;
                }
            };

            match decode_incoming(&frame) {
                Ok(Incoming::Response(response)) => {
                    let tx = {
                        let mut pending = inner.pending.lock().await;
                        pending.remove(&response.request_seq)
                    };
                    match tx {
                        Some(tx) => {
                            let outcome = match response.error {
                                Some(error) if !error.is_empty() => {
                                    Err(DebugError::Remote(error))
                                }
                                _ => Ok(response.body),
                            };
                            let _ = tx.send(outcome);
                        }
                        None => {
                            tracing::trace!(
                                target: TRACE_TARGET,
                                event = "orphan_response",
                                request_seq = response.request_seq
                            );
                        }
                    }
                }
                Ok(Incoming::Event(event)) => {
                    let _ = inner.events.send(ConnectionEvent::Event(event));
                }
                Ok(Incoming::Other(kind)) => {
                    tracing::trace!(
                        target: TRACE_TARGET,
                        event = "ignored_envelope",
                        envelope_type = %kind
                    );
                }
                Err(err) => {
                    fatal = Some(DebugError::Decode(err.to_string()));
                    break 'read;
                }
            }
        }
    }

    if let Some(error) = fatal {
        tracing::debug!(target: TRACE_TARGET, event = "read_loop_error", error = %error);
        let _ = inner.events.send(ConnectionEvent::Error(error.to_string()));
    }

    let _ = inner.events.send(ConnectionEvent::End);

    // Clear the map before rejecting: a rejecter that synchronously issues
    // another send must not see its own dead entry.
    let pending = {
        let mut pending = inner.pending.lock().await;
        std::mem::take(&mut *pending)
    };
    for (_seq, tx) in pending {
        let _ = tx.send(Err(DebugError::ConnectionClosed));
    }

    inner.closed.cancel();
}
