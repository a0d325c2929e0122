//! The extended-thinking signature protocol.
//!
//! Assistant `thinking` blocks carry signatures the upstream validates on
//! the next turn. The relay repairs requests whose blocks lost signatures in
//! transit (from the signature cache), strips the `group#` tag it added on
//! the way out, enforces thinking-first block order, and on the response
//! side caches fresh signatures and tags them with the model group.

mod cache;
mod stream;

pub use cache::{SignatureCache, hash_text};
pub use stream::SignatureTap;

use bytes::Bytes;

use ccrelay_protocol::{
    ContentBlock, MessageContent, MessagesRequest, MessagesResponse, Role, TextBlock,
};

/// Leading model-name segment up to the first `-`; signatures are valid
/// within one group regardless of the exact model revision.
pub fn model_group(model: &str) -> &str {
    model.split('-').next().unwrap_or(model)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub dropped_blocks: usize,
    pub reordered_blocks: usize,
}

/// Request-side pass over every assistant message carrying thinking blocks.
/// Returns counters for the request log.
pub fn process_request(request: &mut MessagesRequest, cache: &SignatureCache) -> ProcessStats {
    let group = model_group(&request.model).to_string();
    let prefix = format!("{group}#");
    let mut stats = ProcessStats::default();

    let message_count = request.messages.len();
    for index in 0..message_count {
        if request.messages[index].role != Role::Assistant {
            continue;
        }
        let next_blocks_tool_result = request
            .messages
            .get(index + 1)
            .is_some_and(|next| next.role == Role::User && contains_tool_result(&next.content));

        let message = &mut request.messages[index];
        let Some(blocks) = message.content.blocks_mut() else {
            continue;
        };
        if !blocks.iter().any(|b| matches!(b, ContentBlock::Thinking(_))) {
            continue;
        }

        let mut drop_indices = Vec::new();
        for (position, block) in blocks.iter_mut().enumerate() {
            let ContentBlock::Thinking(thinking) = block else {
                continue;
            };
            if thinking.signature.is_empty() {
                match cache.get(&group, hash_text(&thinking.thinking)) {
                    Some(signature) => thinking.signature = signature,
                    None => drop_indices.push(position),
                }
            } else if let Some(stripped) = thinking.signature.strip_prefix(&prefix) {
                thinking.signature = stripped.to_string();
            }
            // Signatures with no tag (or another group's tag) pass as-is;
            // the upstream is the authority on their validity.
        }

        if !drop_indices.is_empty() {
            stats.dropped_blocks += drop_indices.len();
            if next_blocks_tool_result {
                // Dropping here would orphan the tool_result that follows;
                // neutralize the whole message instead to keep alternation.
                message.content =
                    MessageContent::Blocks(vec![ContentBlock::Text(TextBlock::default())]);
                continue;
            }
            let mut position = 0;
            blocks.retain(|_| {
                let keep = !drop_indices.contains(&position);
                position += 1;
                keep
            });
            if blocks.is_empty() {
                message.content =
                    MessageContent::Blocks(vec![ContentBlock::Text(TextBlock::default())]);
                continue;
            }
        }

        stats.reordered_blocks += reorder_thinking_first(message);
    }
    stats
}

fn contains_tool_result(content: &MessageContent) -> bool {
    content
        .blocks()
        .is_some_and(|blocks| blocks.iter().any(|b| matches!(b, ContentBlock::ToolResult(_))))
}

/// Stable partition: thinking blocks first, relative order preserved within
/// both groups. Returns how many blocks changed position.
fn reorder_thinking_first(message: &mut ccrelay_protocol::Message) -> usize {
    let Some(blocks) = message.content.blocks_mut() else {
        return 0;
    };
    let original: Vec<bool> = blocks.iter().map(ContentBlock::is_thinking).collect();
    if original.iter().skip_while(|t| **t).all(|t| !t) {
        return 0;
    }
    let mut thinking = Vec::new();
    let mut rest = Vec::new();
    for block in blocks.drain(..) {
        if block.is_thinking() {
            thinking.push(block);
        } else {
            rest.push(block);
        }
    }
    let moved = original
        .iter()
        .take(thinking.len())
        .filter(|was_thinking| !**was_thinking)
        .count()
        + original
            .iter()
            .skip(thinking.len())
            .filter(|was_thinking| **was_thinking)
            .count();
    thinking.extend(rest);
    *blocks = thinking;
    moved
}

/// Non-streaming response pass: cache fresh signatures and tag them with the
/// model group so a later turn can be attributed. Returns `None` when the
/// body is not a parseable message (forward the original bytes).
pub fn process_response_body(
    body: &[u8],
    group: &str,
    cache: &SignatureCache,
) -> Option<Bytes> {
    let mut response: MessagesResponse = serde_json::from_slice(body).ok()?;
    let mut rewritten = false;
    for block in &mut response.content {
        let ContentBlock::Thinking(thinking) = block else {
            continue;
        };
        if thinking.signature.is_empty() {
            continue;
        }
        cache.insert(group, hash_text(&thinking.thinking), thinking.signature.clone());
        thinking.signature = format!("{group}#{}", thinking.signature);
        rewritten = true;
    }
    if !rewritten {
        return None;
    }
    serde_json::to_vec(&response).ok().map(Bytes::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn cache() -> SignatureCache {
        SignatureCache::new(64, Duration::from_secs(60))
    }

    fn request(messages: serde_json::Value) -> MessagesRequest {
        serde_json::from_value(serde_json::json!({
            "model": "claude-sonnet-4",
            "messages": messages
        }))
        .unwrap()
    }

    fn assistant_blocks(request: &MessagesRequest, index: usize) -> &[ContentBlock] {
        request.messages[index].content.blocks().unwrap()
    }

    #[test]
    fn model_group_is_leading_segment() {
        assert_eq!(model_group("claude-sonnet-4"), "claude");
        assert_eq!(model_group("plainmodel"), "plainmodel");
    }

    #[test]
    fn cached_signature_repairs_empty_one() {
        let cache = cache();
        cache.insert("claude", hash_text("deep thought"), "sig-up");
        let mut req = request(serde_json::json!([
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "deep thought"},
                {"type": "text", "text": "answer"}
            ]}
        ]));
        let stats = process_request(&mut req, &cache);
        assert_eq!(stats.dropped_blocks, 0);
        let ContentBlock::Thinking(block) = &assistant_blocks(&req, 0)[0] else {
            panic!("expected thinking first");
        };
        assert_eq!(block.signature, "sig-up");
    }

    #[test]
    fn uncached_empty_signature_drops_the_block() {
        let mut req = request(serde_json::json!([
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "lost"},
                {"type": "text", "text": "answer"}
            ]}
        ]));
        let stats = process_request(&mut req, &cache());
        assert_eq!(stats.dropped_blocks, 1);
        let blocks = assistant_blocks(&req, 0);
        assert_eq!(blocks.len(), 1);
        assert!(matches!(blocks[0], ContentBlock::Text(_)));
    }

    #[test]
    fn drop_is_rejected_when_tool_result_follows() {
        let mut req = request(serde_json::json!([
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "lost"},
                {"type": "tool_use", "id": "tu_1", "name": "get", "input": {}}
            ]},
            {"role": "user", "content": [
                {"type": "tool_result", "tool_use_id": "tu_1", "content": "ok"}
            ]}
        ]));
        let stats = process_request(&mut req, &cache());
        assert_eq!(stats.dropped_blocks, 1);
        let blocks = assistant_blocks(&req, 0);
        assert_eq!(blocks.len(), 1);
        let ContentBlock::Text(text) = &blocks[0] else {
            panic!("expected placeholder text block");
        };
        assert_eq!(text.text, "");
    }

    #[test]
    fn group_prefix_is_stripped_before_forwarding() {
        let mut req = request(serde_json::json!([
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "t", "signature": "claude#sig-raw"},
                {"type": "text", "text": "x"}
            ]}
        ]));
        process_request(&mut req, &cache());
        let ContentBlock::Thinking(block) = &assistant_blocks(&req, 0)[0] else {
            panic!("expected thinking block");
        };
        assert_eq!(block.signature, "sig-raw");
    }

    #[test]
    fn foreign_prefix_is_left_alone() {
        let mut req = request(serde_json::json!([
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "t", "signature": "gemini#other"},
                {"type": "text", "text": "x"}
            ]}
        ]));
        process_request(&mut req, &cache());
        let ContentBlock::Thinking(block) = &assistant_blocks(&req, 0)[0] else {
            panic!("expected thinking block");
        };
        assert_eq!(block.signature, "gemini#other");
    }

    #[test]
    fn thinking_moves_before_text_and_tool_use() {
        let mut req = request(serde_json::json!([
            {"role": "assistant", "content": [
                {"type": "text", "text": "early"},
                {"type": "thinking", "thinking": "t", "signature": "s"},
                {"type": "tool_use", "id": "tu", "name": "f", "input": {}}
            ]}
        ]));
        let stats = process_request(&mut req, &cache());
        assert!(stats.reordered_blocks > 0);
        let blocks = assistant_blocks(&req, 0);
        assert!(matches!(blocks[0], ContentBlock::Thinking(_)));
        assert!(matches!(blocks[1], ContentBlock::Text(_)));
        assert!(matches!(blocks[2], ContentBlock::ToolUse(_)));
    }

    #[test]
    fn response_side_caches_and_tags() {
        let cache = cache();
        let body = serde_json::json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [
                {"type": "thinking", "thinking": "fresh", "signature": "up-sig"},
                {"type": "text", "text": "done"}
            ]
        });
        let rewritten =
            process_response_body(body.to_string().as_bytes(), "claude", &cache).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["content"][0]["signature"], "claude#up-sig");
        assert_eq!(
            cache.get("claude", hash_text("fresh")).as_deref(),
            Some("up-sig")
        );
    }

    #[test]
    fn round_trip_restores_thinking_across_turns() {
        let cache = cache();
        let body = serde_json::json!({
            "id": "msg_1", "type": "message", "role": "assistant",
            "model": "claude-sonnet-4",
            "content": [{"type": "thinking", "thinking": "carry me", "signature": "s1"}]
        });
        process_response_body(body.to_string().as_bytes(), "claude", &cache).unwrap();

        // Next turn arrives with the signature stripped by the client.
        let mut req = request(serde_json::json!([
            {"role": "assistant", "content": [
                {"type": "thinking", "thinking": "carry me"},
                {"type": "text", "text": "prior answer"}
            ]},
            {"role": "user", "content": "continue"}
        ]));
        let stats = process_request(&mut req, &cache);
        assert_eq!(stats.dropped_blocks, 0);
        let ContentBlock::Thinking(block) = &assistant_blocks(&req, 0)[0] else {
            panic!("expected thinking block");
        };
        assert_eq!(block.thinking, "carry me");
        assert_eq!(block.signature, "s1");
    }
}
