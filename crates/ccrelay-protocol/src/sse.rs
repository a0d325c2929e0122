use bytes::{BufMut, Bytes, BytesMut};

/// One parsed SSE event. `retry` stays 0 when the stream never set it (or set
/// it to something unparseable).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry: u64,
    pub data: String,
}

impl SseEvent {
    pub fn new(event: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            event: Some(event.into()),
            id: None,
            retry: 0,
            data: data.into(),
        }
    }

    /// Serialize in canonical order (`event`, `id`, `retry`, `data…`) with a
    /// terminating blank line. Multi-line data becomes one `data:` line per
    /// segment, the inverse of the parser's `\n` join.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::with_capacity(self.data.len() + 64);
        if let Some(event) = &self.event {
            out.put_slice(b"event: ");
            out.put_slice(event.as_bytes());
            out.put_u8(b'\n');
        }
        if let Some(id) = &self.id {
            out.put_slice(b"id: ");
            out.put_slice(id.as_bytes());
            out.put_u8(b'\n');
        }
        if self.retry > 0 {
            out.put_slice(b"retry: ");
            out.put_slice(self.retry.to_string().as_bytes());
            out.put_u8(b'\n');
        }
        for line in self.data.split('\n') {
            out.put_slice(b"data: ");
            out.put_slice(line.as_bytes());
            out.put_u8(b'\n');
        }
        out.put_u8(b'\n');
        out.freeze()
    }
}

/// Incremental SSE parser. Feed arbitrary byte chunks, collect completed
/// events. CRLF is normalized, comment lines (`:`) are dropped, one leading
/// space after a field colon is trimmed, and `data` accumulates across lines
/// with `\n` joins. An event is emitted on the first blank line after at
/// least one field; a pending event is flushed by `finish`.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
    event: Option<String>,
    id: Option<String>,
    retry: u64,
    data_lines: Vec<String>,
    has_field: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &Bytes) -> Vec<SseEvent> {
        match std::str::from_utf8(chunk) {
            Ok(text) => self.push_str(text),
            Err(_) => Vec::new(),
        }
    }

    pub fn push_str(&mut self, chunk: &str) -> Vec<SseEvent> {
        self.buffer.push_str(chunk);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.find('\n') {
            let mut line = self.buffer[..pos].to_string();
            self.buffer.drain(..=pos);

            if line.ends_with('\r') {
                line.pop();
            }

            if line.is_empty() {
                self.finish_event(&mut events);
                continue;
            }

            self.feed_line(&line);
        }

        events
    }

    /// Flush a pending event at EOF.
    pub fn finish(&mut self) -> Vec<SseEvent> {
        let mut events = Vec::new();
        if !self.buffer.is_empty() {
            let mut line = std::mem::take(&mut self.buffer);
            if line.ends_with('\r') {
                line.pop();
            }
            if !line.is_empty() {
                self.feed_line(&line);
            }
        }
        self.finish_event(&mut events);
        events
    }

    fn feed_line(&mut self, line: &str) {
        if line.starts_with(':') {
            return;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => {
                self.event = if value.is_empty() {
                    None
                } else {
                    Some(value.to_string())
                };
                self.has_field = true;
            }
            "id" => {
                self.id = Some(value.to_string());
                self.has_field = true;
            }
            "retry" => {
                // Malformed retry values are ignored, not zeroed.
                if let Ok(parsed) = value.parse::<u64>() {
                    self.retry = parsed;
                }
                self.has_field = true;
            }
            "data" => {
                self.data_lines.push(value.to_string());
                self.has_field = true;
            }
            _ => {}
        }
    }

    fn finish_event(&mut self, events: &mut Vec<SseEvent>) {
        if !self.has_field {
            return;
        }
        events.push(SseEvent {
            event: self.event.take(),
            id: self.id.take(),
            retry: std::mem::take(&mut self.retry),
            data: self.data_lines.join("\n"),
        });
        self.data_lines.clear();
        self.has_field = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(wire: &str) -> SseEvent {
        let mut parser = SseParser::new();
        let mut events = parser.push_str(wire);
        events.extend(parser.finish());
        assert_eq!(events.len(), 1, "expected one event from {wire:?}");
        events.remove(0)
    }

    #[test]
    fn parses_event_and_data() {
        let event = parse_one("event: message_start\ndata: {\"a\":1}\n\n");
        assert_eq!(event.event.as_deref(), Some("message_start"));
        assert_eq!(event.data, "{\"a\":1}");
    }

    #[test]
    fn joins_multi_line_data() {
        let event = parse_one("data: one\ndata: two\n\n");
        assert_eq!(event.data, "one\ntwo");
    }

    #[test]
    fn normalizes_crlf_and_trims_single_leading_space() {
        let event = parse_one("event: ping\r\ndata:  padded\r\n\r\n");
        assert_eq!(event.event.as_deref(), Some("ping"));
        // Only the first space after the colon is eaten.
        assert_eq!(event.data, " padded");
    }

    #[test]
    fn ignores_comments_and_malformed_retry() {
        let event = parse_one(": keepalive\nretry: soon\nid: 7\ndata: x\n\n");
        assert_eq!(event.retry, 0);
        assert_eq!(event.id.as_deref(), Some("7"));
        assert_eq!(event.data, "x");
    }

    #[test]
    fn flushes_pending_event_on_eof() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("data: tail").is_empty());
        let events = parser.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "tail");
    }

    #[test]
    fn split_across_chunks() {
        let mut parser = SseParser::new();
        assert!(parser.push_str("event: conten").is_empty());
        assert!(parser.push_str("t_block_delta\nda").is_empty());
        let events = parser.push_str("ta: {}\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event.as_deref(), Some("content_block_delta"));
        assert_eq!(events[0].data, "{}");
    }

    #[test]
    fn serialize_is_parse_inverse() {
        for wire in [
            "event: message_stop\ndata: {}\n\n",
            "data: a\ndata: b\n\n",
            "event: e\nid: 42\nretry: 1500\ndata: payload\n\n",
        ] {
            let event = parse_one(wire);
            assert_eq!(event.to_bytes(), Bytes::copy_from_slice(wire.as_bytes()));
        }
    }

    #[test]
    fn bare_field_name_counts_as_empty_value() {
        let event = parse_one("data\ndata: x\n\n");
        assert_eq!(event.data, "\nx");
    }
}
