//! Byte-level framing for debug-agent envelopes.
//!
//! Every envelope on the wire is preceded by an 8-character lowercase hex
//! length followed by a newline, so the header is always exactly
//! [`HEADER_LEN`] bytes. The counted length covers the JSON body *including*
//! its trailing newline:
//!
//! ```text
//! 0000001f\n
//! {"version":1,"type":"resume"}\n
//! ```
//!
//! [`FrameDecoder`] is a push parser: feed it whatever the socket produced,
//! in any chunking, and drain complete frames. The decoder alternates
//! between waiting for the 9 header bytes and waiting for the announced body
//! length; every consumed byte belongs to exactly one frame.

use serde::Serialize;
use thiserror::Error;

/// Fixed size of the length header: 8 hex characters plus a newline.
pub const HEADER_LEN: usize = 9;

/// Upper bound on a single announced body length.
///
/// The length header is attacker-controlled until the peer is trusted, so
/// the decoder refuses to buffer absurd announcements instead of allocating
/// them.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    #[error("invalid frame header {header:?}: expected 8 lowercase hex digits")]
    InvalidHeader { header: String },

    #[error("announced frame length {len} exceeds maximum {max}")]
    FrameTooLong { len: usize, max: usize },
}

/// Serialize `message` and wrap it in a framed envelope ready for the wire.
pub fn encode_envelope<T: Serialize>(message: &T) -> Result<Vec<u8>, serde_json::Error> {
    Ok(encode_frame(&serde_json::to_vec(message)?))
}

/// Frame raw JSON bytes: hex header, newline, body, trailing newline.
///
/// The announced length includes the trailing newline appended here.
pub fn encode_frame(json_bytes: &[u8]) -> Vec<u8> {
    let body_len = json_bytes.len() + 1;
    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(format!("{body_len:08x}\n").as_bytes());
    out.extend_from_slice(json_bytes);
    out.push(b'\n');
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecodeState {
    /// Waiting for the 9-byte length header.
    Length,
    /// Waiting for `len` body bytes.
    Content { len: usize },
}

/// Incremental frame parser.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    state: DecodeState,
    max_frame_len: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_frame_len(DEFAULT_MAX_FRAME_LEN)
    }

    pub fn with_max_frame_len(max_frame_len: usize) -> Self {
        Self {
            buf: Vec::new(),
            state: DecodeState::Length,
            max_frame_len,
        }
    }

    /// Append freshly read bytes to the internal buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered bytes not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drain the next complete frame, if the buffer holds one.
    ///
    /// Returns the body bytes (still ending in the counted newline). Framing
    /// errors are fatal: the decoder is left in an unspecified state and the
    /// connection must be torn down.
    pub fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FramingError> {
        loop {
            match self.state {
                DecodeState::Length => {
                    if self.buf.len() < HEADER_LEN {
                        return Ok(None);
                    }
                    let header: Vec<u8> = self.buf.drain(..HEADER_LEN).collect();
                    let len = parse_header(&header)?;
                    if len > self.max_frame_len {
                        return Err(FramingError::FrameTooLong {
                            len,
                            max: self.max_frame_len,
                        });
                    }
                    self.state = DecodeState::Content { len };
                }
                DecodeState::Content { len } => {
                    if self.buf.len() < len {
                        return Ok(None);
                    }
                    let body: Vec<u8> = self.buf.drain(..len).collect();
                    self.state = DecodeState::Length;
                    return Ok(Some(body));
                }
            }
        }
    }
}

fn parse_header(header: &[u8]) -> Result<usize, FramingError> {
    debug_assert_eq!(header.len(), HEADER_LEN);
    let hex = &header[..HEADER_LEN - 1];
    // The ninth byte is the separator; the agent always sends '\n' and the
    // reference parser discards it without looking.
    std::str::from_utf8(hex)
        .ok()
        .filter(|s| s.bytes().all(|b| b.is_ascii_hexdigit()))
        .and_then(|s| usize::from_str_radix(s, 16).ok())
        .ok_or_else(|| FramingError::InvalidHeader {
            header: String::from_utf8_lossy(header).into_owned(),
        })
}

/// Decode every complete frame in `input`, discarding any trailing partial
/// frame. Exists for the fuzz target: decoding must never panic.
pub fn decode_frame_bytes(input: &[u8]) -> Result<Vec<Vec<u8>>, FramingError> {
    let mut decoder = FrameDecoder::new();
    decoder.push(input);
    let mut frames = Vec::new();
    while let Some(frame) = decoder.next_frame()? {
        frames.push(frame);
    }
    Ok(frames)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn header_is_zero_padded_lowercase_hex() {
        // 30 bytes of JSON plus the trailing newline = 0x1f.
        let json = br#"{"version":1,"type":"xxxxxxx"}"#;
        assert_eq!(json.len(), 30);
        let framed = encode_frame(json);
        assert_eq!(&framed[..HEADER_LEN], b"0000001f\n");
        assert_eq!(framed.len(), HEADER_LEN + 31);
        assert_eq!(framed.last(), Some(&b'\n'));
    }

    #[test]
    fn roundtrips_a_single_frame() {
        let json = br#"{"version":1,"type":"event","event":{"type":"PrintEvent"}}"#;
        let framed = encode_frame(json);

        let mut decoder = FrameDecoder::new();
        decoder.push(&framed);
        let body = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&body[..body.len() - 1], &json[..]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn roundtrips_under_byte_at_a_time_chunking() {
        let bodies: Vec<&[u8]> = vec![br#"{"a":1}"#, br#"{}"#, br#"{"nested":{"b":[1,2,3]}}"#];
        let mut wire = Vec::new();
        for body in &bodies {
            wire.extend_from_slice(&encode_frame(body));
        }

        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in wire {
            decoder.push(&[byte]);
            while let Some(frame) = decoder.next_frame().unwrap() {
                frames.push(frame);
            }
        }

        let got: Vec<&[u8]> = frames.iter().map(|f| &f[..f.len() - 1]).collect();
        assert_eq!(got, bodies);
    }

    #[test]
    fn roundtrips_concatenated_frames_in_one_push() {
        let mut wire = encode_frame(br#"{"first":true}"#);
        wire.extend_from_slice(&encode_frame(br#"{"second":true}"#));

        let frames = decode_frame_bytes(&wire).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..frames[0].len() - 1], br#"{"first":true}"#);
        assert_eq!(&frames[1][..frames[1].len() - 1], br#"{"second":true}"#);
    }

    #[test]
    fn split_inside_the_header_is_reassembled() {
        let framed = encode_frame(br#"{"x":1}"#);
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed[..4]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&framed[4..]);
        let body = decoder.next_frame().unwrap().unwrap();
        assert_eq!(&body[..body.len() - 1], br#"{"x":1}"#);
    }

    #[test]
    fn malformed_hex_header_is_fatal() {
        let mut decoder = FrameDecoder::new();
        decoder.push(b"notahex!\n{}");
        let err = decoder.next_frame().unwrap_err();
        assert!(matches!(err, FramingError::InvalidHeader { .. }));
    }

    #[test]
    fn oversized_announcement_is_rejected_without_buffering() {
        let mut decoder = FrameDecoder::with_max_frame_len(1024);
        decoder.push(b"7fffffff\n");
        let err = decoder.next_frame().unwrap_err();
        assert_eq!(
            err,
            FramingError::FrameTooLong {
                len: 0x7fff_ffff,
                max: 1024
            }
        );
    }

    #[test]
    fn partial_body_waits_for_more_input() {
        let framed = encode_frame(br#"{"partial":true}"#);
        let mut decoder = FrameDecoder::new();
        decoder.push(&framed[..framed.len() - 3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.push(&framed[framed.len() - 3..]);
        assert!(decoder.next_frame().unwrap().is_some());
    }
}
