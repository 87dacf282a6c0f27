//! Debugger operations over a [`DebugConnection`].
//!
//! [`DebugSession`] is the protocol-neutral core: pause/step/continue,
//! stack and variable queries, evaluation, and the fire-and-forget
//! envelopes. [`MinecraftSession`] layers the host dialect on top:
//! protocol-version tracking and handshake echo, print/stat/profiler
//! events, and the operations that only newer agents understand.

use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::{
    connection::{ConnectionEvent, DebugConnection},
    error::DebugError,
    types::{
        Breakpoint, BreakpointStatus, ContextEvent, EvaluateContext, LogLevel, LogMessage,
        ProtocolInfo, Scope, SessionEvent, StackFrame, StoppedEvent, Variable, VariableInfo,
        VariablesQuery,
    },
    Result, TRACE_TARGET,
};

fn decode<T: DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(|err| DebugError::Decode(err.to_string()))
}

/// The base debugger session: one per connection.
pub struct DebugSession {
    conn: DebugConnection,
    events: broadcast::Sender<SessionEvent>,
}

impl DebugSession {
    pub fn new(conn: DebugConnection) -> Self {
        let (events, _) = broadcast::channel(64);
        tokio::spawn(base_event_pump(
            conn.clone(),
            conn.subscribe_events(),
            events.clone(),
        ));
        Self { conn, events }
    }

    pub fn connection(&self) -> &DebugConnection {
        &self.conn
    }

    pub fn close(&self) {
        self.conn.close();
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub(crate) fn events_sender(&self) -> broadcast::Sender<SessionEvent> {
        self.events.clone()
    }

    pub async fn continue_(&self) -> Result<Value> {
        self.conn.send_request("continue", Value::Null).await
    }

    pub async fn pause(&self) -> Result<Value> {
        self.conn.send_request("pause", Value::Null).await
    }

    pub async fn step_next(&self) -> Result<Value> {
        self.conn.send_request("next", Value::Null).await
    }

    pub async fn step_in(&self) -> Result<Value> {
        self.conn.send_request("stepIn", Value::Null).await
    }

    pub async fn step_out(&self) -> Result<Value> {
        self.conn.send_request("stepOut", Value::Null).await
    }

    /// Evaluate `expression` in the given frame, in the default `watch`
    /// context.
    pub async fn evaluate(&self, frame_id: i64, expression: &str) -> Result<Variable> {
        self.evaluate_in_context(frame_id, expression, EvaluateContext::default())
            .await
    }

    pub async fn evaluate_in_context(
        &self,
        frame_id: i64,
        expression: &str,
        context: EvaluateContext,
    ) -> Result<Variable> {
        let body = self
            .conn
            .send_request(
                "evaluate",
                json!({
                    "frameId": frame_id,
                    "context": context.as_str(),
                    "expression": expression,
                }),
            )
            .await?;
        let mut info: VariableInfo = decode(body)?;
        info.name = "result".to_string();
        Ok(Variable::from_info(info))
    }

    /// The call stack of the halted context, top frame first.
    pub async fn trace_stack(&self) -> Result<Vec<StackFrame>> {
        let body = self.conn.send_request("stackTrace", Value::Null).await?;
        decode(body)
    }

    pub async fn top_stack(&self) -> Result<StackFrame> {
        self.trace_stack()
            .await?
            .into_iter()
            .next()
            .ok_or(DebugError::NotReady)
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        let body = self
            .conn
            .send_request("scopes", json!({"frameId": frame_id}))
            .await?;
        decode(body)
    }

    /// Fetch the children of a variable reference.
    pub async fn variables(
        &self,
        reference: i64,
        query: &VariablesQuery,
    ) -> Result<Vec<Variable>> {
        let mut args = json!({"variablesReference": reference});
        if let Some(filter) = &query.filter {
            args["filter"] = json!(filter);
        }
        if let Some(start) = query.start {
            args["start"] = json!(start);
        }
        if let Some(count) = query.count {
            args["count"] = json!(count);
        }
        let body = self.conn.send_request("variables", args).await?;
        let infos: Vec<VariableInfo> = decode(body)?;
        Ok(infos.into_iter().map(Variable::from_info).collect())
    }

    /// Ask the agent to resume execution. No response is awaited.
    pub async fn resume(&self) -> Result<()> {
        self.conn.send_envelope("resume", Value::Null).await
    }

    /// Push the full breakpoint set for one source path. An empty slice
    /// clears the path (`breakpoints: null` on the wire).
    pub async fn set_breakpoints(&self, path: &str, breakpoints: &[Breakpoint]) -> Result<()> {
        let list = if breakpoints.is_empty() {
            Value::Null
        } else {
            json!(breakpoints)
        };
        self.conn
            .send_envelope(
                "breakpoints",
                json!({"breakpoints": {"path": path, "breakpoints": list}}),
            )
            .await
    }

    pub async fn set_stop_on_exception(&self, enabled: bool) -> Result<()> {
        self.conn
            .send_envelope("stopOnException", json!({"stopOnException": enabled}))
            .await
    }

    /// Evaluate a JavaScript function call in the frame's scope:
    /// `(<fn-source>)(<arg-json>)`.
    pub async fn evaluate_call(
        &self,
        frame_id: i64,
        fn_source: &str,
        arg: &Value,
    ) -> Result<Variable> {
        let source = format!("({fn_source})({arg})");
        self.evaluate(frame_id, &source).await
    }

    /// Evaluate a JavaScript function call in the debuggee's global scope:
    /// `(new Function("return (<fn-source>)(arguments[0])"))(<arg-json>)`.
    pub async fn evaluate_call_global(
        &self,
        frame_id: i64,
        fn_source: &str,
        arg: &Value,
    ) -> Result<Variable> {
        let source =
            format!("(new Function(\"return ({fn_source})(arguments[0])\"))({arg})");
        self.evaluate(frame_id, &source).await
    }
}

/// Bridges connection-level events into the base session events.
async fn base_event_pump(
    conn: DebugConnection,
    mut rx: broadcast::Receiver<ConnectionEvent>,
    tx: broadcast::Sender<SessionEvent>,
) {
    loop {
        match rx.recv().await {
            Ok(ConnectionEvent::Event(event)) => {
                let Some(kind) = event.get("type").and_then(Value::as_str) else {
                    continue;
                };
                match kind {
                    "StoppedEvent" => match serde_json::from_value::<StoppedEvent>(event.clone()) {
                        Ok(stopped) => {
                            let _ = tx.send(SessionEvent::Stopped(stopped));
                        }
                        Err(err) => {
                            tracing::debug!(
                                target: TRACE_TARGET,
                                event = "bad_stopped_event",
                                error = %err
                            );
                        }
                    },
                    "ThreadEvent" => match serde_json::from_value::<ContextEvent>(event.clone()) {
                        Ok(context) => {
                            let _ = tx.send(SessionEvent::Context(context));
                        }
                        Err(err) => {
                            tracing::debug!(
                                target: TRACE_TARGET,
                                event = "bad_thread_event",
                                error = %err
                            );
                        }
                    },
                    "terminated" => {
                        let _ = tx.send(SessionEvent::End);
                        conn.close();
                        return;
                    }
                    _ => {}
                }
            }
            Ok(ConnectionEvent::Error(_)) => {
                // Teardown follows; `End` arrives on the next recv.
            }
            Ok(ConnectionEvent::End) => {
                let _ = tx.send(SessionEvent::End);
                return;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target: TRACE_TARGET, event = "event_pump_lagged", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// The Minecraft host dialect over the base session.
///
/// Construct with [`MinecraftSession::new`]; when a [`ProtocolInfo`] is
/// supplied, every agent `ProtocolEvent` is answered with a `protocol`
/// handshake envelope. Operations below the required protocol version fail
/// with [`DebugError::UnsupportedProtocolVersion`].
pub struct MinecraftSession {
    session: DebugSession,
    handshake: Option<ProtocolInfo>,
    protocol_version: Arc<AtomicI32>,
}

impl MinecraftSession {
    pub fn new(conn: DebugConnection, handshake: Option<ProtocolInfo>) -> Self {
        let session = DebugSession::new(conn.clone());
        let protocol_version = Arc::new(AtomicI32::new(0));
        tokio::spawn(dialect_event_pump(
            conn.clone(),
            conn.subscribe_events(),
            session.events_sender(),
            protocol_version.clone(),
            handshake.clone(),
        ));
        Self {
            session,
            handshake,
            protocol_version,
        }
    }

    pub fn core(&self) -> &DebugSession {
        &self.session
    }

    pub fn connection(&self) -> &DebugConnection {
        self.session.connection()
    }

    pub fn close(&self) {
        self.session.close();
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.session.subscribe_events()
    }

    /// The protocol version the agent last published; 0 until the first
    /// `ProtocolEvent` arrives.
    pub fn protocol_version(&self) -> i32 {
        self.protocol_version.load(Ordering::Relaxed)
    }

    pub async fn continue_(&self) -> Result<Value> {
        self.session.continue_().await
    }

    pub async fn pause(&self) -> Result<Value> {
        self.session.pause().await
    }

    pub async fn step_next(&self) -> Result<Value> {
        self.session.step_next().await
    }

    pub async fn step_in(&self) -> Result<Value> {
        self.session.step_in().await
    }

    pub async fn step_out(&self) -> Result<Value> {
        self.session.step_out().await
    }

    pub async fn evaluate(&self, frame_id: i64, expression: &str) -> Result<Variable> {
        self.session.evaluate(frame_id, expression).await
    }

    pub async fn trace_stack(&self) -> Result<Vec<StackFrame>> {
        self.session.trace_stack().await
    }

    pub async fn top_stack(&self) -> Result<StackFrame> {
        self.session.top_stack().await
    }

    pub async fn scopes(&self, frame_id: i64) -> Result<Vec<Scope>> {
        self.session.scopes(frame_id).await
    }

    pub async fn variables(
        &self,
        reference: i64,
        query: &VariablesQuery,
    ) -> Result<Vec<Variable>> {
        self.session.variables(reference, query).await
    }

    pub async fn resume(&self) -> Result<()> {
        self.session.resume().await
    }

    pub async fn set_stop_on_exception(&self, enabled: bool) -> Result<()> {
        self.session.set_stop_on_exception(enabled).await
    }

    /// Push breakpoints for one source path.
    ///
    /// v6 agents verify each breakpoint: the set travels as an awaitable
    /// `setBreakpoints` request (and only as the request). Older agents get
    /// the fire-and-forget envelope and every breakpoint is reported
    /// verified.
    pub async fn set_breakpoints(
        &self,
        path: &str,
        breakpoints: &[Breakpoint],
    ) -> Result<Vec<BreakpointStatus>> {
        if self.protocol_version() >= 6 {
            let body = self
                .connection()
                .send_request(
                    "setBreakpoints",
                    json!({"breakpoints": {"path": path, "breakpoints": breakpoints}}),
                )
                .await?;
            decode(body)
        } else {
            self.session.set_breakpoints(path, breakpoints).await?;
            Ok(breakpoints
                .iter()
                .map(|bp| BreakpointStatus {
                    verified: true,
                    line: Some(bp.line),
                    message: None,
                })
                .collect())
        }
    }

    /// Run a slash command in the debuggee (v4+). v5 agents take the nested
    /// payload shape, v4 the flattened one.
    pub async fn run_command(&self, command: &str, dimension_type: &str) -> Result<()> {
        let actual = self.require_version(4)?;
        let payload = if actual >= 5 {
            json!({"command": {"command": command, "dimension_type": dimension_type}})
        } else {
            json!({"command": command, "dimension_type": dimension_type})
        };
        self.connection()
            .send_envelope("minecraftCommand", payload)
            .await
    }

    /// Start the script profiler (v5+).
    pub async fn start_profiler(&self) -> Result<()> {
        self.require_version(5)?;
        self.connection()
            .send_envelope(
                "startProfiler",
                json!({"profiler": {"target_module_uuid": self.target_module_uuid()}}),
            )
            .await
    }

    /// Stop the script profiler and ask the agent to write its captures
    /// under `captures_path` (v5+).
    pub async fn stop_profiler(&self, captures_path: &str) -> Result<()> {
        self.require_version(5)?;
        self.connection()
            .send_envelope(
                "stopProfiler",
                json!({"profiler": {
                    "captures_path": captures_path,
                    "target_module_uuid": self.target_module_uuid(),
                }}),
            )
            .await
    }

    fn target_module_uuid(&self) -> Option<&str> {
        self.handshake
            .as_ref()
            .and_then(|info| info.target_module_uuid.as_deref())
    }

    fn require_version(&self, required: i32) -> Result<i32> {
        let actual = self.protocol_version();
        if actual >= required {
            Ok(actual)
        } else {
            Err(DebugError::UnsupportedProtocolVersion { required, actual })
        }
    }
}

/// Handles the host-dialect events the base pump ignores.
async fn dialect_event_pump(
    conn: DebugConnection,
    mut rx: broadcast::Receiver<ConnectionEvent>,
    tx: broadcast::Sender<SessionEvent>,
    protocol_version: Arc<AtomicI32>,
    handshake: Option<ProtocolInfo>,
) {
    loop {
        match rx.recv().await {
            Ok(ConnectionEvent::Event(event)) => {
                let Some(kind) = event.get("type").and_then(Value::as_str) else {
                    continue;
                };
                match kind {
                    "PrintEvent" => {
                        let message = event
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        let level = LogLevel::from_wire(
                            event.get("logLevel").and_then(Value::as_i64).unwrap_or(1),
                        );
                        let _ = tx.send(SessionEvent::Log(LogMessage { message, level }));
                    }
                    "ProtocolEvent" => {
                        let version =
                            event.get("version").and_then(Value::as_i64).unwrap_or(0) as i32;
                        protocol_version.store(version, Ordering::Relaxed);
                        let _ = tx.send(SessionEvent::Protocol { version });
                        if let Some(info) = &handshake {
                            if let Err(err) = send_handshake(&conn, info, version).await {
                                tracing::debug!(
                                    target: TRACE_TARGET,
                                    event = "handshake_send_failed",
                                    error = %err
                                );
                            }
                        }
                    }
                    "StatEvent" | "StatEvent2" => {
                        let _ = tx.send(SessionEvent::Stat(event));
                    }
                    "ProfilerCapture" => {
                        let _ = tx.send(SessionEvent::ProfilerCapture(event));
                    }
                    _ => {}
                }
            }
            Ok(ConnectionEvent::Error(_)) => {}
            Ok(ConnectionEvent::End) => return,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(target: TRACE_TARGET, event = "dialect_pump_lagged", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// Echo the locally configured handshake back at the agent. The module
/// uuid is understood from v2, the passcode from v4.
async fn send_handshake(
    conn: &DebugConnection,
    info: &ProtocolInfo,
    agent_version: i32,
) -> Result<()> {
    let mut payload = json!({"version": info.version});
    if agent_version >= 2 {
        if let Some(uuid) = &info.target_module_uuid {
            payload["target_module_uuid"] = json!(uuid);
        }
    }
    if agent_version >= 4 {
        if let Some(passcode) = &info.passcode {
            payload["passcode"] = json!(passcode);
        }
    }
    conn.send_envelope("protocol", payload).await
}
