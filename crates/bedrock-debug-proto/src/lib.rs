//! Wire model for the Bedrock script debug protocol.
//!
//! The debug agent embedded in the host application speaks JSON envelopes
//! over TCP, each preceded by a fixed 9-byte hex-length header. This crate
//! owns the two pure layers of that protocol:
//!
//! - [`envelope`]: the envelope shapes themselves (requests, responses,
//!   events, and the fire-and-forget command envelopes) plus the inbound
//!   dispatch that tolerates unknown envelope types.
//! - [`framing`]: the byte-level codec: an incremental [`FrameDecoder`]
//!   that reassembles frames from arbitrarily chunked reads, and the
//!   matching encoder.
//!
//! There is no I/O here; `bedrock-debug-client` drives this crate from its
//! socket read loop.

pub mod envelope;
pub mod framing;

pub use envelope::{
    decode_incoming, CommandEnvelope, DecodeError, Incoming, RequestBody, RequestEnvelope,
    ResponseEnvelope, ENVELOPE_VERSION,
};
pub use framing::{
    decode_frame_bytes, encode_envelope, encode_frame, FrameDecoder, FramingError,
    DEFAULT_MAX_FRAME_LEN, HEADER_LEN,
};
