pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("request transform failed: {0}")]
    Transform(String),
    #[error("{0}")]
    Other(String),
}
