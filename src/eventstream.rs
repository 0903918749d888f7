//! AWS eventstream frame decoding.
//!
//! Bedrock streams responses in the `application/vnd.amazon.eventstream`
//! binary framing: each frame is
//!
//! ```text
//! [u32 total_len][u32 headers_len][u32 prelude_crc]
//! [headers: headers_len bytes][payload][u32 message_crc]
//! ```
//!
//! all integers big-endian. For chunk events the payload is a JSON object
//! whose `bytes` field base64-encodes the actual Anthropic event JSON.
//!
//! The decoder is incremental: network chunks can split frames anywhere, so
//! partial input is buffered until a complete frame arrives. CRCs are not
//! verified; a torn or malformed tail yields whatever complete frames
//! preceded it.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::{Buf, BytesMut};
use serde_json::Value;

/// Prelude (12 bytes) plus trailing message CRC (4 bytes).
const FRAME_OVERHEAD: usize = 16;

#[derive(Debug, Default)]
pub struct EventstreamDecoder {
    buf: BytesMut,
    corrupt: bool,
}

impl EventstreamDecoder {
    pub fn new() -> Self {
        EventstreamDecoder::default()
    }

    /// Feed more bytes, returning the payloads of every frame completed so
    /// far. After a malformed prelude the decoder goes inert and discards
    /// the rest of the stream.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        if self.corrupt {
            return Vec::new();
        }
        self.buf.extend_from_slice(data);

        let mut payloads = Vec::new();
        loop {
            if self.buf.len() < FRAME_OVERHEAD {
                break;
            }
            let total_len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            let headers_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

            if total_len < FRAME_OVERHEAD || headers_len > total_len - FRAME_OVERHEAD {
                self.corrupt = true;
                self.buf.clear();
                break;
            }
            if self.buf.len() < total_len {
                break;
            }

            let frame = self.buf.copy_to_bytes(total_len);
            let payload_start = 12 + headers_len;
            let payload_end = total_len - 4;
            payloads.push(frame[payload_start..payload_end].to_vec());
        }
        payloads
    }

    /// Whether undecoded bytes remain (a torn frame at stream end).
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }
}

/// Unwrap one frame payload into the event JSON it carries.
///
/// Chunk payloads look like `{"bytes":"<base64>", ...}`; the decoded bytes
/// are the event. Payloads without a `bytes` field (exceptions, pings) pass
/// through as-is so they still show up for the client and the journal.
pub fn decode_event_payload(payload: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(payload) {
        if let Some(encoded) = value.get("bytes").and_then(Value::as_str) {
            if let Ok(decoded) = BASE64.decode(encoded) {
                if let Ok(text) = String::from_utf8(decoded) {
                    return text;
                }
            }
        }
    }
    String::from_utf8_lossy(payload).into_owned()
}

/// Build one eventstream frame around a payload. Test-support only; CRC
/// fields are zeroed since the decoder does not verify them.
pub fn encode_frame(payload: &[u8]) -> Vec<u8> {
    let total_len = (FRAME_OVERHEAD + payload.len()) as u32;
    let mut frame = Vec::with_capacity(total_len as usize);
    frame.extend_from_slice(&total_len.to_be_bytes());
    frame.extend_from_slice(&0u32.to_be_bytes()); // headers_len
    frame.extend_from_slice(&0u32.to_be_bytes()); // prelude crc
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&0u32.to_be_bytes()); // message crc
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_payload(event_json: &str) -> Vec<u8> {
        format!(r#"{{"bytes":"{}","p":"abc"}}"#, BASE64.encode(event_json)).into_bytes()
    }

    #[test]
    fn decodes_complete_frames() {
        let events = [
            r#"{"type":"message_start"}"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#,
            r#"{"type":"message_stop"}"#,
        ];
        let mut stream = Vec::new();
        for event in &events {
            stream.extend_from_slice(&encode_frame(&chunk_payload(event)));
        }

        let mut decoder = EventstreamDecoder::new();
        let payloads = decoder.feed(&stream);
        assert_eq!(payloads.len(), 3);
        assert!(!decoder.has_partial());

        for (payload, event) in payloads.iter().zip(events.iter()) {
            assert_eq!(decode_event_payload(payload), *event);
        }
    }

    #[test]
    fn empty_input_yields_nothing() {
        let mut decoder = EventstreamDecoder::new();
        assert!(decoder.feed(&[]).is_empty());
        assert!(!decoder.has_partial());
    }

    #[test]
    fn frames_split_across_feeds() {
        let frame = encode_frame(&chunk_payload(r#"{"type":"message_start"}"#));
        let mut decoder = EventstreamDecoder::new();

        let (a, b) = frame.split_at(7);
        assert!(decoder.feed(a).is_empty());
        assert!(decoder.has_partial());
        let payloads = decoder.feed(b);
        assert_eq!(payloads.len(), 1);
        assert!(!decoder.has_partial());
    }

    #[test]
    fn truncated_tail_keeps_leading_frames() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(&chunk_payload(r#"{"type":"message_start"}"#)));
        stream.extend_from_slice(&encode_frame(&chunk_payload(r#"{"type":"message_stop"}"#)));
        let truncated = &stream[..stream.len() - 5];

        let mut decoder = EventstreamDecoder::new();
        let payloads = decoder.feed(truncated);
        assert_eq!(payloads.len(), 1);
        assert!(decoder.has_partial());
    }

    #[test]
    fn malformed_prelude_goes_inert() {
        let mut decoder = EventstreamDecoder::new();
        // total_len below the minimum frame size
        let bad = [0u8, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert!(decoder.feed(&bad).is_empty());
        // Later good input is ignored rather than misframed.
        let good = encode_frame(&chunk_payload(r#"{"type":"message_start"}"#));
        assert!(decoder.feed(&good).is_empty());
    }

    #[test]
    fn non_chunk_payload_passes_through() {
        let payload = br#"{"message":"Too many requests"}"#;
        assert_eq!(
            decode_event_payload(payload),
            r#"{"message":"Too many requests"}"#
        );
    }
}
