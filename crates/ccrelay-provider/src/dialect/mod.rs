mod anthropic;
mod bedrock;

pub use anthropic::AnthropicProvider;
pub use bedrock::BedrockProvider;
