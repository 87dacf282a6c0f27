use thiserror::Error;

use bedrock_debug_proto::FramingError;

#[derive(Debug, Error)]
pub enum DebugError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Framing(#[from] FramingError),

    #[error("failed to decode envelope: {0}")]
    Decode(String),

    #[error("request timed out")]
    Timeout,

    #[error("debuggee error: {0}")]
    Remote(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("no halted context to inspect")]
    NotReady,

    #[error("operation requires protocol version {required}, agent reported {actual}")]
    UnsupportedProtocolVersion { required: i32, actual: i32 },
}
