//! Decoder for the binary event-stream framing some upstreams use in place
//! of SSE (`application/vnd.amazon.eventstream`). The relay never produces
//! this format; it only normalizes it back to SSE on the response path.
//!
//! Frame layout: `total_len:u32 | headers_len:u32 | prelude_crc:u32 |
//! headers | payload | message_crc:u32`, lengths big-endian. Headers are
//! `name_len:u8 | name | value_type:u8 | value`. CRCs are carried but not
//! validated; a frame that lies about its lengths is rejected as malformed.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bytes::{Buf, Bytes, BytesMut};

use crate::sse::SseEvent;

const PRELUDE_LEN: usize = 12;
const TRAILER_LEN: usize = 4;
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum EventStreamError {
    #[error("malformed event-stream frame: {0}")]
    Malformed(&'static str),
    #[error("event-stream frame exceeds {MAX_FRAME_LEN} bytes")]
    FrameTooLarge,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventStreamFrame {
    pub event_type: Option<String>,
    pub exception_type: Option<String>,
    pub payload: Bytes,
}

/// Incremental frame decoder. At most one frame is buffered; completed
/// frames are handed out as soon as their trailing bytes arrive.
#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: BytesMut,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<EventStreamFrame>, EventStreamError> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.try_decode()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes still waiting for the rest of a frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn try_decode(&mut self) -> Result<Option<EventStreamFrame>, EventStreamError> {
        if self.buffer.len() < PRELUDE_LEN {
            return Ok(None);
        }
        let total_len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;
        let headers_len = u32::from_be_bytes([
            self.buffer[4],
            self.buffer[5],
            self.buffer[6],
            self.buffer[7],
        ]) as usize;

        if total_len > MAX_FRAME_LEN {
            return Err(EventStreamError::FrameTooLarge);
        }
        if total_len < PRELUDE_LEN + TRAILER_LEN || headers_len > total_len - PRELUDE_LEN - TRAILER_LEN
        {
            return Err(EventStreamError::Malformed("length fields inconsistent"));
        }
        if self.buffer.len() < total_len {
            return Ok(None);
        }

        let mut frame = self.buffer.split_to(total_len);
        frame.advance(PRELUDE_LEN);
        let headers = frame.split_to(headers_len);
        let payload_len = total_len - PRELUDE_LEN - headers_len - TRAILER_LEN;
        let payload = frame.split_to(payload_len).freeze();

        let mut decoded = EventStreamFrame {
            payload,
            ..Default::default()
        };
        parse_headers(&headers, &mut decoded)?;
        Ok(Some(decoded))
    }
}

fn parse_headers(mut raw: &[u8], frame: &mut EventStreamFrame) -> Result<(), EventStreamError> {
    while !raw.is_empty() {
        if raw.len() < 2 {
            return Err(EventStreamError::Malformed("truncated header name"));
        }
        let name_len = raw[0] as usize;
        raw = &raw[1..];
        if raw.len() < name_len + 1 {
            return Err(EventStreamError::Malformed("truncated header"));
        }
        let name = std::str::from_utf8(&raw[..name_len])
            .map_err(|_| EventStreamError::Malformed("header name not utf-8"))?
            .to_string();
        raw = &raw[name_len..];
        let value_type = raw[0];
        raw = &raw[1..];

        let value = match value_type {
            // bool true / bool false
            0 | 1 => None,
            2 => {
                skip(&mut raw, 1)?;
                None
            }
            3 => {
                skip(&mut raw, 2)?;
                None
            }
            4 => {
                skip(&mut raw, 4)?;
                None
            }
            5 | 8 => {
                skip(&mut raw, 8)?;
                None
            }
            6 | 7 => {
                if raw.len() < 2 {
                    return Err(EventStreamError::Malformed("truncated header value"));
                }
                let len = u16::from_be_bytes([raw[0], raw[1]]) as usize;
                raw = &raw[2..];
                if raw.len() < len {
                    return Err(EventStreamError::Malformed("truncated header value"));
                }
                let value = (value_type == 7)
                    .then(|| std::str::from_utf8(&raw[..len]).ok().map(str::to_string))
                    .flatten();
                raw = &raw[len..];
                value
            }
            9 => {
                skip(&mut raw, 16)?;
                None
            }
            _ => return Err(EventStreamError::Malformed("unknown header value type")),
        };

        match name.as_str() {
            ":event-type" => frame.event_type = value,
            ":exception-type" => frame.exception_type = value,
            _ => {}
        }
    }
    Ok(())
}

fn skip(raw: &mut &[u8], n: usize) -> Result<(), EventStreamError> {
    if raw.len() < n {
        return Err(EventStreamError::Malformed("truncated header value"));
    }
    *raw = &raw[n..];
    Ok(())
}

/// Convert one binary frame into the SSE event it stands for.
///
/// Upstreams wrap the real event as `{"bytes": "<base64 JSON>"}`; the inner
/// document's `type` field names the SSE event. Exception frames become
/// `error` events with the payload forwarded as data.
pub fn frame_to_sse(frame: &EventStreamFrame) -> Option<SseEvent> {
    if let Some(exception) = &frame.exception_type {
        let message = String::from_utf8_lossy(&frame.payload);
        let data = serde_json::json!({
            "type": "error",
            "error": {"type": exception, "message": message},
        });
        return Some(SseEvent::new("error", data.to_string()));
    }

    let inner: Bytes = match serde_json::from_slice::<serde_json::Value>(&frame.payload) {
        Ok(value) => match value.get("bytes").and_then(|b| b.as_str()) {
            Some(encoded) => Bytes::from(BASE64.decode(encoded).ok()?),
            None => frame.payload.clone(),
        },
        Err(_) => frame.payload.clone(),
    };

    let data = std::str::from_utf8(&inner).ok()?.to_string();
    let name = serde_json::from_str::<serde_json::Value>(&data)
        .ok()
        .and_then(|value| {
            value
                .get("type")
                .and_then(|t| t.as_str())
                .map(str::to_string)
        })
        .or_else(|| frame.event_type.clone())?;
    Some(SseEvent::new(name, data))
}
