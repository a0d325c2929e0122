use bytes::Bytes;
use http::HeaderMap;

use ccrelay_protocol::ModelInfo;

use crate::errors::ProviderResult;

/// How a provider frames its streaming responses. Anything that is not SSE
/// gets normalized back to SSE by the engine before reaching the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamingFormat {
    Sse,
    BinaryEventStream,
}

/// Result of a dialect's request transform: the exact bytes to ship and the
/// upstream URL they must be shipped to.
#[derive(Debug, Clone)]
pub struct TransformedRequest {
    pub body: Bytes,
    pub target_url: String,
}

/// One upstream dialect. All hooks are pure: the engine owns every socket.
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    fn base_url(&self) -> &str;

    fn supports_streaming(&self) -> bool {
        true
    }

    /// Whether `transform_request` must run before the body ships upstream.
    fn requires_transform(&self) -> bool {
        false
    }

    /// Whether client-supplied `Authorization`/api-key headers may be
    /// forwarded unchanged instead of injecting a pool credential.
    fn supports_transparent_auth(&self) -> bool {
        false
    }

    fn streaming_format(&self) -> StreamingFormat {
        StreamingFormat::Sse
    }

    /// Install this dialect's auth header(s) for the selected credential.
    fn authenticate(&self, headers: &mut HeaderMap, api_key: &str);

    /// Produce the outbound header set from the inbound one. Emits only a
    /// conservative allow-list (dialect version/beta headers plus
    /// `Content-Type`); everything else is dropped at the boundary.
    fn forward_headers(&self, inbound: &HeaderMap) -> HeaderMap;

    /// Rewrite the body and compute the target URL for dialects whose wire
    /// shape differs from the common one. Only called when
    /// `requires_transform()` is true.
    fn transform_request(&self, body: &[u8], path: &str) -> ProviderResult<TransformedRequest> {
        let _ = path;
        Ok(TransformedRequest {
            body: Bytes::copy_from_slice(body),
            target_url: self.base_url().to_string(),
        })
    }

    /// Map a client-facing model id to the upstream's name for it.
    fn map_model(&self, model: &str) -> String {
        model.to_string()
    }

    /// The model catalog this provider advertises (`GET /v1/models`).
    fn models(&self) -> Vec<ModelInfo>;
}

/// Copy a single header through if present and representable.
pub(crate) fn copy_header(inbound: &HeaderMap, outbound: &mut HeaderMap, name: &str) {
    if let Some(value) = inbound.get(name) {
        if let Ok(name) = http::header::HeaderName::from_bytes(name.as_bytes()) {
            outbound.insert(name, value.clone());
        }
    }
}
