use http::HeaderMap;
use sha2::{Digest, Sha256};

use crate::config::AuthConfig;
use crate::error::RelayError;

/// Byte-wise constant-time equality. Length is allowed to leak; both sides
/// here are fixed-size digests or caller-controlled secrets.
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b) {
        diff |= x ^ y;
    }
    diff == 0
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Client authentication for `/v1/messages`. Built from the live config and
/// cached against the auth section's fingerprint; with nothing configured it
/// degrades to a no-op.
pub struct ClientAuth {
    api_key_digest: Option<[u8; 32]>,
    allow_bearer: bool,
    bearer_secret: Option<String>,
}

impl ClientAuth {
    pub fn from_config(auth: &AuthConfig, api_key: Option<&str>) -> Self {
        let api_key_digest = auth
            .api_key
            .then_some(api_key)
            .flatten()
            .map(|key| sha256(key.as_bytes()));
        Self {
            api_key_digest,
            allow_bearer: auth.allow_bearer || auth.allow_subscription,
            bearer_secret: auth.bearer_secret.clone(),
        }
    }

    fn enabled(&self) -> bool {
        self.api_key_digest.is_some() || self.allow_bearer
    }

    /// Either configured method is sufficient on its own: a failed x-api-key
    /// check never vetoes a valid bearer token, and vice versa.
    pub fn authenticate(&self, headers: &HeaderMap) -> Result<(), RelayError> {
        if !self.enabled() {
            return Ok(());
        }

        let mut rejection = None;

        if let Some(digest) = &self.api_key_digest {
            if let Some(presented) = header_str(headers, "x-api-key") {
                if ct_eq(&sha256(presented.as_bytes()), digest) {
                    return Ok(());
                }
                rejection = Some(RelayError::unauthorized("invalid x-api-key"));
            }
        }

        if self.allow_bearer {
            if let Some(token) = bearer_token(headers) {
                match &self.bearer_secret {
                    Some(secret) => {
                        if ct_eq(token.as_bytes(), secret.as_bytes()) {
                            return Ok(());
                        }
                        rejection = Some(RelayError::unauthorized("invalid bearer token"));
                    }
                    // Bearer enabled without a secret: passthrough mode, any
                    // non-empty token is accepted.
                    None => {
                        if !token.is_empty() {
                            return Ok(());
                        }
                    }
                }
            }
        }

        Err(rejection.unwrap_or_else(|| {
            RelayError::unauthorized(
                "missing credentials: provide x-api-key or Authorization: Bearer",
            )
        }))
    }
}

pub fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let auth = header_str(headers, "authorization")?.trim();
    auth.strip_prefix("Bearer ")
        .or_else(|| auth.strip_prefix("bearer "))
        .map(str::trim)
}

/// Whether the client supplied credentials a transparent provider could
/// forward unchanged.
pub fn has_client_auth(headers: &HeaderMap) -> bool {
    headers.contains_key("authorization") || headers.contains_key("x-api-key")
}
