use serde::{Deserialize, Serialize};

use super::types::{ContentBlock, JsonObject, JsonValue, Message, Role};

/// The inbound `/v1/messages` document. Only the fields the relay inspects
/// are typed; the rest is carried verbatim through `extra` so the body can be
/// re-serialized without loss after thinking-block processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<JsonValue>,
    #[serde(flatten)]
    pub extra: JsonObject,
}

impl MessagesRequest {
    /// True when any assistant message carries a `thinking` block, i.e. the
    /// request continues an extended-thinking conversation.
    pub fn has_thinking_continuation(&self) -> bool {
        self.messages.iter().any(|message| {
            message.role == Role::Assistant
                && message
                    .content
                    .blocks()
                    .is_some_and(|blocks| {
                        blocks
                            .iter()
                            .any(|block| matches!(block, ContentBlock::Thinking(_)))
                    })
        })
    }
}

/// Cheap model/stream sniff for dispatch. Parses just enough of the body to
/// route; the untouched bytes are what actually ship upstream.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestProbe {
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub stream: Option<bool>,
    #[serde(default)]
    pub thinking: Option<JsonValue>,
}
