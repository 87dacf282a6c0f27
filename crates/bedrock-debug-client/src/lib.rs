//! Client for the debug agent embedded in the Bedrock scripting host.
//!
//! The agent listens on TCP and speaks framed JSON envelopes (see
//! `bedrock-debug-proto`). This crate layers two abstractions on top of
//! that wire:
//!
//! - [`DebugConnection`] owns the socket, correlates request/response
//!   pairs by `request_seq`, enforces per-request timeouts, and fans out
//!   agent events. One connection per socket; closing it mass-rejects
//!   everything still in flight.
//! - [`DebugSession`] / [`MinecraftSession`]: the debugger operations
//!   themselves: stepping, stack/scope/variable queries, evaluation,
//!   breakpoints, and the recursive object-graph materialiser
//!   ([`DebugSession::inspect`]) that survives cycles and expired
//!   references. `MinecraftSession` adds the host dialect: protocol
//!   handshake echo, log/stat/profiler events, and operations gated on the
//!   agent's published protocol version.
//!
//! The [`mock`] module (tests and the `test-support` feature only) provides
//! a scriptable in-process agent so all of this can be exercised without a
//! running host.

pub mod connection;
pub mod error;
pub mod inspect;
pub mod session;
pub mod types;

#[cfg(any(test, feature = "test-support"))]
pub mod mock;

pub use connection::{ConnectionConfig, ConnectionEvent, DebugConnection};
pub use error::DebugError;
pub use inspect::{
    InspectOptions, InspectedChildren, InspectedNode, InspectedValue, Inspection, NodeId,
};
pub use session::{DebugSession, MinecraftSession};
pub use types::{
    Breakpoint, BreakpointStatus, ContextEvent, ContextReason, EvaluateContext, LogLevel,
    LogMessage, PrimitiveValue, ProtocolInfo, Scope, SessionEvent, StackFrame, StoppedEvent,
    StoppedReason, Variable, VariableValue, VariablesQuery,
};

/// The `tracing` target used by this crate.
pub const TRACE_TARGET: &str = "bedrock_debug.client";

pub type Result<T> = std::result::Result<T, DebugError>;
