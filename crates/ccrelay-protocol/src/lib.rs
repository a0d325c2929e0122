//! Wire-format types for the messages protocol spoken on both sides of the
//! relay, plus the SSE engine used to carry streaming responses.
//!
//! This crate has no IO and no HTTP dependencies. The engine layer parses and
//! re-emits these types; providers only ever see bytes built from them.

pub mod error;
pub mod eventstream;
pub mod messages;
pub mod sse;

pub use error::{ErrorBody, ErrorEnvelope, ErrorKind};
pub use eventstream::{EventStreamDecoder, EventStreamError, EventStreamFrame, frame_to_sse};
pub use messages::request::{MessagesRequest, RequestProbe};
pub use messages::stream::{Delta, StreamEvent};
pub use messages::types::{
    ContentBlock, JsonObject, JsonValue, Message, MessageContent, MessagesResponse, ModelInfo,
    RedactedThinkingBlock, Role, TextBlock, ThinkingBlock, ToolResultBlock, ToolUseBlock,
};
pub use sse::{SseEvent, SseParser};
