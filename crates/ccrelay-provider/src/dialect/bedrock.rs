use std::collections::HashMap;

use bytes::Bytes;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};

use ccrelay_protocol::ModelInfo;

use crate::errors::{ProviderError, ProviderResult};
use crate::provider::{Provider, StreamingFormat, TransformedRequest};

const ANTHROPIC_VERSION_FIELD: &str = "anthropic_version";
const ANTHROPIC_VERSION_VALUE: &str = "bedrock-2023-05-31";

/// Bedrock-style upstream. The model rides in the URL instead of the body,
/// `stream` is expressed by the endpoint choice, and streaming responses come
/// back as a binary event stream the engine converts to SSE.
pub struct BedrockProvider {
    name: String,
    base_url: String,
    models: Vec<ModelInfo>,
    model_mapping: HashMap<String, String>,
}

impl BedrockProvider {
    pub fn new(name: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            models: Vec::new(),
            model_mapping: HashMap::new(),
        }
    }

    pub fn with_models(mut self, models: Vec<ModelInfo>) -> Self {
        self.models = models;
        self
    }

    pub fn with_model_mapping(mut self, mapping: HashMap<String, String>) -> Self {
        self.model_mapping = mapping;
        self
    }
}

impl Provider for BedrockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn requires_transform(&self) -> bool {
        true
    }

    fn streaming_format(&self) -> StreamingFormat {
        StreamingFormat::BinaryEventStream
    }

    fn authenticate(&self, headers: &mut HeaderMap, api_key: &str) {
        if let Ok(value) = HeaderValue::from_str(&format!("Bearer {api_key}")) {
            headers.insert(http::header::AUTHORIZATION, value);
        }
    }

    fn forward_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut outbound = HeaderMap::new();
        if let Some(value) = inbound.get(CONTENT_TYPE) {
            outbound.insert(CONTENT_TYPE, value.clone());
        } else {
            outbound.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        outbound.insert(ACCEPT, HeaderValue::from_static("application/json"));
        outbound
    }

    /// `/v1/messages` becomes `/model/{model}/invoke[-with-response-stream]`;
    /// `model` and `stream` leave the body, `anthropic_version` enters it.
    fn transform_request(&self, body: &[u8], _path: &str) -> ProviderResult<TransformedRequest> {
        let mut document: serde_json::Value = serde_json::from_slice(body)
            .map_err(|err| ProviderError::Transform(format!("request body is not JSON: {err}")))?;
        let object = document
            .as_object_mut()
            .ok_or_else(|| ProviderError::Transform("request body is not an object".to_string()))?;

        let model = object
            .remove("model")
            .and_then(|value| value.as_str().map(str::to_string))
            .ok_or_else(|| ProviderError::Transform("request body has no model".to_string()))?;
        let model = self.map_model(&model);

        let stream = object
            .remove("stream")
            .and_then(|value| value.as_bool())
            .unwrap_or(false);

        object
            .entry(ANTHROPIC_VERSION_FIELD)
            .or_insert_with(|| serde_json::Value::String(ANTHROPIC_VERSION_VALUE.to_string()));

        let endpoint = if stream {
            "invoke-with-response-stream"
        } else {
            "invoke"
        };
        let target_url = format!("{}/model/{}/{}", self.base_url, model, endpoint);

        let body = serde_json::to_vec(&document)
            .map_err(|err| ProviderError::Transform(err.to_string()))?;
        Ok(TransformedRequest {
            body: Bytes::from(body),
            target_url,
        })
    }

    fn map_model(&self, model: &str) -> String {
        self.model_mapping
            .get(model)
            .cloned()
            .unwrap_or_else(|| model.to_string())
    }

    fn models(&self) -> Vec<ModelInfo> {
        self.models.clone()
    }
}
