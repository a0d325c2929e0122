use serde::{Deserialize, Serialize};

use super::types::{ContentBlock, JsonValue};

/// Streaming delta payloads inside `content_block_delta` events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { thinking: String },
    SignatureDelta { signature: String },
    #[serde(untagged)]
    Other(JsonValue),
}

/// Wire events of a streamed messages response. Unknown event shapes pass
/// through untouched; the relay only ever rewrites `signature_delta`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    MessageStart {
        message: JsonValue,
    },
    ContentBlockStart {
        index: usize,
        content_block: ContentBlock,
    },
    ContentBlockDelta {
        index: usize,
        delta: Delta,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        delta: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        usage: Option<JsonValue>,
    },
    MessageStop,
    Ping,
    Error {
        error: JsonValue,
    },
    #[serde(untagged)]
    Other(JsonValue),
}

impl StreamEvent {
    pub fn wire_name(&self) -> Option<&'static str> {
        Some(match self {
            StreamEvent::MessageStart { .. } => "message_start",
            StreamEvent::ContentBlockStart { .. } => "content_block_start",
            StreamEvent::ContentBlockDelta { .. } => "content_block_delta",
            StreamEvent::ContentBlockStop { .. } => "content_block_stop",
            StreamEvent::MessageDelta { .. } => "message_delta",
            StreamEvent::MessageStop => "message_stop",
            StreamEvent::Ping => "ping",
            StreamEvent::Error { .. } => "error",
            StreamEvent::Other(_) => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_delta_parses() {
        let raw = serde_json::json!({
            "type": "content_block_delta",
            "index": 0,
            "delta": {"type": "signature_delta", "signature": "abc=="}
        });
        let event: StreamEvent = serde_json::from_value(raw).unwrap();
        let StreamEvent::ContentBlockDelta { index, delta } = event else {
            panic!("expected content_block_delta");
        };
        assert_eq!(index, 0);
        assert_eq!(
            delta,
            Delta::SignatureDelta {
                signature: "abc==".to_string()
            }
        );
    }

    #[test]
    fn unknown_event_passes_through() {
        let raw = serde_json::json!({"type": "rate_update", "x": 1});
        let event: StreamEvent = serde_json::from_value(raw.clone()).unwrap();
        assert!(matches!(event, StreamEvent::Other(_)));
        assert_eq!(serde_json::to_value(&event).unwrap(), raw);
    }
}
