//! Data model shared by the session layer: variables and their typed
//! values, stack frames, scopes, breakpoints, and the event payloads the
//! agent pushes at us.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A variable as the agent renders it on the wire.
///
/// `evaluate` responses carry the rendered text under `result` instead of
/// `value`; the alias keeps one shape for both.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableInfo {
    #[serde(default)]
    pub name: String,
    #[serde(default, alias = "result")]
    pub value: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub variables_reference: i64,
    #[serde(default)]
    pub indexed_variables: Option<u32>,
}

/// A decoded scalar.
#[derive(Debug, Clone, PartialEq)]
pub enum PrimitiveValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Null,
    Undefined,
}

/// The typed value of a [`Variable`].
///
/// The agent sends `type` as a free-form string; the known set becomes
/// proper variants and everything else is kept as [`VariableValue::Opaque`]
/// so newer agent types survive round trips.
#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    String(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    Null,
    Undefined,
    Object {
        /// The agent's rendered form, e.g. `"[object Object]"`.
        rendered: String,
        /// Present iff the object is an array; the element count.
        indexed_count: Option<u32>,
    },
    Function {
        rendered: String,
        /// Present iff the function is array-like; the element count.
        indexed_count: Option<u32>,
    },
    Opaque {
        kind: String,
        rendered: String,
    },
}

impl VariableValue {
    pub fn from_wire(kind: Option<&str>, value: Option<String>, indexed: Option<u32>) -> Self {
        let rendered = value.clone().unwrap_or_default();
        match kind.unwrap_or_default() {
            "string" => VariableValue::String(rendered),
            "integer" => match rendered.parse::<i64>() {
                Ok(n) => VariableValue::Integer(n),
                Err(_) => VariableValue::Opaque {
                    kind: "integer".to_string(),
                    rendered,
                },
            },
            "float" => match rendered.parse::<f64>() {
                Ok(n) => VariableValue::Float(n),
                Err(_) => VariableValue::Opaque {
                    kind: "float".to_string(),
                    rendered,
                },
            },
            "boolean" => VariableValue::Boolean(value.as_deref() == Some("true")),
            "null" => VariableValue::Null,
            "undefined" => VariableValue::Undefined,
            "object" => VariableValue::Object {
                rendered,
                indexed_count: indexed,
            },
            "function" => VariableValue::Function {
                rendered,
                indexed_count: indexed,
            },
            other => VariableValue::Opaque {
                kind: other.to_string(),
                rendered,
            },
        }
    }

    pub fn is_primitive(&self) -> bool {
        self.primitive().is_some()
    }

    /// The decoded scalar, for primitive values only.
    pub fn primitive(&self) -> Option<PrimitiveValue> {
        match self {
            VariableValue::String(s) => Some(PrimitiveValue::String(s.clone())),
            VariableValue::Integer(n) => Some(PrimitiveValue::Integer(*n)),
            VariableValue::Float(n) => Some(PrimitiveValue::Float(*n)),
            VariableValue::Boolean(b) => Some(PrimitiveValue::Boolean(*b)),
            VariableValue::Null => Some(PrimitiveValue::Null),
            VariableValue::Undefined => Some(PrimitiveValue::Undefined),
            _ => None,
        }
    }

    /// The agent's rendered string form, for non-primitive values.
    pub fn rendered(&self) -> Option<&str> {
        match self {
            VariableValue::Object { rendered, .. }
            | VariableValue::Function { rendered, .. }
            | VariableValue::Opaque { rendered, .. } => Some(rendered),
            _ => None,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(
            self,
            VariableValue::Object {
                indexed_count: Some(_),
                ..
            } | VariableValue::Function {
                indexed_count: Some(_),
                ..
            }
        )
    }
}

/// A named handle into the debuggee's variable table.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub name: String,
    /// Handle for child expansion; 0 for primitives.
    pub reference: i64,
    pub value: VariableValue,
}

impl Variable {
    pub fn from_info(info: VariableInfo) -> Self {
        let value =
            VariableValue::from_wire(info.kind.as_deref(), info.value, info.indexed_variables);
        Self {
            name: info.name,
            reference: info.variables_reference,
            value,
        }
    }
}

/// One level of the debuggee's call stack.
///
/// `id` is only meaningful until the next resume-like state change.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StackFrame {
    pub id: i64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub file_name: String,
    #[serde(default)]
    pub line_number: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Scope {
    pub name: String,
    #[serde(rename = "variablesReference")]
    pub reference: i64,
    #[serde(default)]
    pub expensive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Breakpoint {
    pub line: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Breakpoint {
    pub fn line(line: u32) -> Self {
        Self { line, column: None }
    }
}

/// Per-breakpoint verification status returned by a v6 agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakpointStatus {
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Child-range selection for a `variables` request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariablesQuery {
    pub filter: Option<String>,
    pub start: Option<u32>,
    pub count: Option<u32>,
}

impl VariablesQuery {
    /// The parameterisation used for array expansion.
    pub fn indexed(start: u32, count: u32) -> Self {
        Self {
            filter: Some("indexed".to_string()),
            start: Some(start),
            count: Some(count),
        }
    }
}

/// The `context` discriminator of an `evaluate` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvaluateContext {
    #[default]
    Watch,
    Repl,
    Hover,
    Clipboard,
    Variables,
}

impl EvaluateContext {
    pub fn as_str(self) -> &'static str {
        match self {
            EvaluateContext::Watch => "watch",
            EvaluateContext::Repl => "repl",
            EvaluateContext::Hover => "hover",
            EvaluateContext::Clipboard => "clipboard",
            EvaluateContext::Variables => "variables",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StoppedReason {
    Entry,
    Exception,
    Breakpoint,
    Pause,
    Step,
    StepIn,
    StepOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StoppedEvent {
    pub thread: i64,
    pub reason: StoppedReason,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextReason {
    New,
    Exited,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ContextEvent {
    pub thread: i64,
    pub reason: ContextReason,
}

/// Severity of an agent `PrintEvent`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Verbose,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn from_wire(level: i64) -> Self {
        match level {
            0 => LogLevel::Verbose,
            1 => LogLevel::Info,
            2 => LogLevel::Warn,
            3 => LogLevel::Error,
            4 => LogLevel::Fatal,
            _ => LogLevel::Info,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub message: String,
    pub level: LogLevel,
}

/// Locally configured handshake reply.
///
/// When set, the session answers every agent `ProtocolEvent` with a
/// `protocol` envelope derived from this.
#[derive(Clone, PartialEq, Eq)]
pub struct ProtocolInfo {
    pub version: i32,
    pub target_module_uuid: Option<String>,
    /// Shared secret required by v4+ agents. Never logged.
    pub passcode: Option<String>,
}

impl fmt::Debug for ProtocolInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolInfo")
            .field("version", &self.version)
            .field("target_module_uuid", &self.target_module_uuid)
            .field("passcode_present", &self.passcode.is_some())
            .finish()
    }
}

/// Typed events surfaced by a session.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Stopped(StoppedEvent),
    Context(ContextEvent),
    Log(LogMessage),
    /// A `StatEvent`/`StatEvent2` payload, passed through for the caller's
    /// stat merger.
    Stat(Value),
    ProfilerCapture(Value),
    /// The agent published its protocol version.
    Protocol { version: i32 },
    /// The session is over: the agent terminated or the stream ended.
    End,
}
