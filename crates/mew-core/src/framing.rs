//! Wire framing for the two transport formats
//!
//! WebSocket frames carry one JSON envelope per text frame, except frames
//! beginning with `#`, which are stream data chunks framed as
//! `#<streamId>#<payload>` with an opaque payload forwarded verbatim.
//!
//! FIFO/STDIO channels use LSP-style framing: an ASCII header
//! `Content-Length: N\r\n\r\n` followed by exactly N bytes of UTF-8 JSON.
//! The decoder is resumable across arbitrary chunk boundaries, and a
//! malformed header resynchronizes the buffer instead of poisoning the
//! codec.

use thiserror::Error;

/// Upper bound on a single framed payload. Protects the gateway from a
/// hostile `Content-Length` exhausting memory.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Errors produced while decoding LSP-style frames.
#[derive(Debug, Error)]
pub enum FramingError {
    /// Header block did not contain a parseable `Content-Length` line.
    #[error("malformed frame header: {reason}")]
    MalformedHeader { reason: String },

    /// `Content-Length` value was not a non-negative integer.
    #[error("invalid Content-Length value: {value:?}")]
    InvalidLength { value: String },

    /// Declared length exceeds [`MAX_FRAME_BYTES`].
    #[error("frame of {length} bytes exceeds the {max} byte limit")]
    Oversized { length: usize, max: usize },

    /// Frame body was not valid UTF-8.
    #[error("frame payload is not valid UTF-8")]
    InvalidUtf8,
}

/// A parsed stream data frame: `#<streamId>#<payload>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFrame<'a> {
    /// Gateway-assigned stream id, e.g. `stream-1`.
    pub stream_id: &'a str,
    /// Opaque chunk; forwarded without interpretation.
    pub payload: &'a str,
}

/// Parse a text frame as a stream data chunk. Returns `None` when the frame
/// is not stream-framed (does not start with `#`, or has no closing `#`
/// around a non-empty stream id).
pub fn parse_stream_frame(text: &str) -> Option<StreamFrame<'_>> {
    let rest = text.strip_prefix('#')?;
    let close = rest.find('#')?;
    if close == 0 {
        return None;
    }
    Some(StreamFrame {
        stream_id: &rest[..close],
        payload: &rest[close + 1..],
    })
}

/// Encode a stream data chunk.
pub fn encode_stream_frame(stream_id: &str, payload: &str) -> String {
    format!("#{stream_id}#{payload}")
}

/// Resumable decoder for `Content-Length`-framed JSON payloads.
///
/// Feed raw bytes as they arrive, then drain complete frames with
/// [`next_frame`](Self::next_frame) until it returns `Ok(None)`. A header
/// error consumes the offending header block so decoding can continue with
/// the next frame.
#[derive(Debug, Default)]
pub struct LspFrameCodec {
    buffer: Vec<u8>,
    pending_length: Option<usize>,
}

impl LspFrameCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Drop all buffered state. Used when a FIFO writer disconnects and the
    /// read side reopens for the next participant instance.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending_length = None;
    }

    /// Try to extract the next complete frame payload.
    pub fn next_frame(&mut self) -> Result<Option<String>, FramingError> {
        if self.pending_length.is_none() {
            let Some(terminator) = find_subsequence(&self.buffer, HEADER_TERMINATOR) else {
                return Ok(None);
            };
            let header_end = terminator + HEADER_TERMINATOR.len();
            let length = parse_header(&self.buffer[..terminator]);
            // Consume the header block whether or not it parsed; a bad
            // header must not wedge the codec.
            self.buffer.drain(..header_end);
            let length = length?;
            if length > MAX_FRAME_BYTES {
                return Err(FramingError::Oversized {
                    length,
                    max: MAX_FRAME_BYTES,
                });
            }
            self.pending_length = Some(length);
        }

        let length = self.pending_length.expect("pending length was just set");
        if self.buffer.len() < length {
            return Ok(None);
        }

        let body: Vec<u8> = self.buffer.drain(..length).collect();
        self.pending_length = None;
        match String::from_utf8(body) {
            Ok(payload) => Ok(Some(payload)),
            Err(_) => Err(FramingError::InvalidUtf8),
        }
    }

    /// Encode one payload with `Content-Length` framing.
    pub fn encode(payload: &str) -> Vec<u8> {
        let mut frame = format!("Content-Length: {}\r\n\r\n", payload.len()).into_bytes();
        frame.extend_from_slice(payload.as_bytes());
        frame
    }
}

fn parse_header(header: &[u8]) -> Result<usize, FramingError> {
    let text = std::str::from_utf8(header).map_err(|_| FramingError::MalformedHeader {
        reason: "header is not ASCII".to_string(),
    })?;
    for line in text.split("\r\n") {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.trim().eq_ignore_ascii_case("content-length") {
            let value = value.trim();
            return value.parse::<usize>().map_err(|_| FramingError::InvalidLength {
                value: value.to_string(),
            });
        }
    }
    Err(FramingError::MalformedHeader {
        reason: "missing Content-Length".to_string(),
    })
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_frame_in_one_chunk() {
        let mut codec = LspFrameCodec::new();
        codec.feed(b"Content-Length: 13\r\n\r\n{\"kind\":\"x\"}x");
        assert_eq!(codec.next_frame().unwrap().unwrap(), "{\"kind\":\"x\"}x");
        assert!(codec.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_frame_split_across_chunks() {
        let mut codec = LspFrameCodec::new();
        codec.feed(b"Content-Le");
        assert!(codec.next_frame().unwrap().is_none());
        codec.feed(b"ngth: 4\r\n");
        assert!(codec.next_frame().unwrap().is_none());
        codec.feed(b"\r\nab");
        assert!(codec.next_frame().unwrap().is_none());
        codec.feed(b"cd");
        assert_eq!(codec.next_frame().unwrap().unwrap(), "abcd");
    }

    #[test]
    fn test_two_frames_back_to_back() {
        let mut codec = LspFrameCodec::new();
        codec.feed(b"Content-Length: 2\r\n\r\nhiContent-Length: 3\r\n\r\nbye");
        assert_eq!(codec.next_frame().unwrap().unwrap(), "hi");
        assert_eq!(codec.next_frame().unwrap().unwrap(), "bye");
        assert!(codec.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_non_numeric_length_errors_then_resyncs() {
        let mut codec = LspFrameCodec::new();
        codec.feed(b"Content-Length: zzz\r\n\r\nContent-Length: 2\r\n\r\nok");
        assert!(matches!(
            codec.next_frame(),
            Err(FramingError::InvalidLength { .. })
        ));
        assert_eq!(codec.next_frame().unwrap().unwrap(), "ok");
    }

    #[test]
    fn test_missing_content_length_errors() {
        let mut codec = LspFrameCodec::new();
        codec.feed(b"X-Whatever: 3\r\n\r\n");
        assert!(matches!(
            codec.next_frame(),
            Err(FramingError::MalformedHeader { .. })
        ));
    }

    #[test]
    fn test_extra_headers_are_tolerated() {
        let mut codec = LspFrameCodec::new();
        codec.feed(b"Content-Type: application/json\r\nContent-Length: 2\r\n\r\nok");
        assert_eq!(codec.next_frame().unwrap().unwrap(), "ok");
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = LspFrameCodec::new();
        let header = format!("Content-Length: {}\r\n\r\n", MAX_FRAME_BYTES + 1);
        codec.feed(header.as_bytes());
        assert!(matches!(
            codec.next_frame(),
            Err(FramingError::Oversized { .. })
        ));
    }

    #[test]
    fn test_clear_resets_partial_state() {
        let mut codec = LspFrameCodec::new();
        codec.feed(b"Content-Length: 10\r\n\r\npart");
        assert!(codec.next_frame().unwrap().is_none());
        codec.clear();
        codec.feed(b"Content-Length: 2\r\n\r\nok");
        assert_eq!(codec.next_frame().unwrap().unwrap(), "ok");
    }

    #[test]
    fn test_encode_roundtrip() {
        let frame = LspFrameCodec::encode("{\"kind\":\"chat\"}");
        let mut codec = LspFrameCodec::new();
        codec.feed(&frame);
        assert_eq!(codec.next_frame().unwrap().unwrap(), "{\"kind\":\"chat\"}");
    }

    #[test]
    fn test_parse_stream_frame() {
        let frame = parse_stream_frame("#stream-1#hello").unwrap();
        assert_eq!(frame.stream_id, "stream-1");
        assert_eq!(frame.payload, "hello");
    }

    #[test]
    fn test_parse_stream_frame_empty_payload() {
        let frame = parse_stream_frame("#stream-2#").unwrap();
        assert_eq!(frame.stream_id, "stream-2");
        assert_eq!(frame.payload, "");
    }

    #[test]
    fn test_parse_stream_frame_payload_may_contain_hashes() {
        let frame = parse_stream_frame("#stream-1#a#b#c").unwrap();
        assert_eq!(frame.payload, "a#b#c");
    }

    #[test]
    fn test_parse_stream_frame_rejects_non_stream_text() {
        assert!(parse_stream_frame("{\"kind\":\"chat\"}").is_none());
        assert!(parse_stream_frame("#").is_none());
        assert!(parse_stream_frame("##payload").is_none());
        assert!(parse_stream_frame("#stream-1").is_none());
    }

    #[test]
    fn test_encode_stream_frame() {
        assert_eq!(encode_stream_frame("stream-1", "hello"), "#stream-1#hello");
    }
}
