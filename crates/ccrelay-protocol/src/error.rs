use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Error kinds the provider wire format understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AuthenticationError,
    InvalidRequestError,
    RateLimitError,
    ApiError,
    ServerBusy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
}

/// `{"type":"error","error":{"type":...,"message":...}}`: the envelope every
/// failure surface renders, so clients see one error shape regardless of
/// which layer produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            error: ErrorBody {
                kind,
                message: message.into(),
            },
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        match serde_json::to_vec(self) {
            Ok(body) => Bytes::from(body),
            Err(_) => Bytes::from_static(
                br#"{"type":"error","error":{"type":"api_error","message":"internal error"}}"#,
            ),
        }
    }
}
