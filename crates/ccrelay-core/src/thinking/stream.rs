use std::collections::HashMap;
use std::sync::Arc;

use ccrelay_protocol::sse::SseEvent;
use ccrelay_protocol::{ContentBlock, Delta, StreamEvent};

use super::cache::{SignatureCache, hash_text};

/// Streaming counterpart of the response-side signature pass. Accumulates
/// thinking text per block index from `content_block_start` and
/// `thinking_delta` events; when the `signature_delta` arrives, caches the
/// upstream signature against the accumulated text and rewrites the emitted
/// signature to `group#signature`.
pub struct SignatureTap {
    group: String,
    cache: Arc<SignatureCache>,
    thinking_text: HashMap<usize, String>,
}

impl SignatureTap {
    pub fn new(group: impl Into<String>, cache: Arc<SignatureCache>) -> Self {
        Self {
            group: group.into(),
            cache,
            thinking_text: HashMap::new(),
        }
    }

    /// Inspect one SSE event. Returns a replacement when the event had to be
    /// rewritten; `None` forwards the original untouched.
    pub fn on_event(&mut self, event: &SseEvent) -> Option<SseEvent> {
        let parsed: StreamEvent = serde_json::from_str(&event.data).ok()?;
        match parsed {
            StreamEvent::ContentBlockStart {
                index,
                content_block: ContentBlock::Thinking(block),
            } => {
                self.thinking_text.insert(index, block.thinking);
                None
            }
            StreamEvent::ContentBlockDelta { index, delta } => match delta {
                Delta::ThinkingDelta { thinking } => {
                    self.thinking_text.entry(index).or_default().push_str(&thinking);
                    None
                }
                Delta::SignatureDelta { signature } => {
                    let text = self.thinking_text.remove(&index).unwrap_or_default();
                    self.cache
                        .insert(&self.group, hash_text(&text), signature.clone());
                    let rewritten = StreamEvent::ContentBlockDelta {
                        index,
                        delta: Delta::SignatureDelta {
                            signature: format!("{}#{}", self.group, signature),
                        },
                    };
                    let data = serde_json::to_string(&rewritten).ok()?;
                    let mut out = event.clone();
                    out.data = data;
                    Some(out)
                }
                _ => None,
            },
            StreamEvent::ContentBlockStop { index } => {
                self.thinking_text.remove(&index);
                None
            }
            _ => None,
        }
    }
}
