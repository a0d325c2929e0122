use std::collections::HashMap;

use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue};

use ccrelay_protocol::ModelInfo;

use crate::provider::{Provider, copy_header};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Native messages-protocol upstream: the official endpoint or any gateway
/// speaking the same dialect. Requests pass through body-unchanged; auth is
/// `x-api-key`, or the client's own credentials in transparent mode.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    transparent: bool,
    models: Vec<ModelInfo>,
    model_mapping: HashMap<String, String>,
}

impl AnthropicProvider {
    pub fn new(name: impl Into<String>, base_url: Option<String>) -> Self {
        Self {
            name: name.into(),
            base_url: base_url
                .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
                .trim_end_matches('/')
                .to_string(),
            transparent: false,
            models: Vec::new(),
            model_mapping: HashMap::new(),
        }
    }

    pub fn with_transparent(mut self, transparent: bool) -> Self {
        self.transparent = transparent;
        self
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

impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_url(&self) -> &str {
        &self.base_url
    }

    fn supports_transparent_auth(&self) -> bool {
        self.transparent
    }

    fn authenticate(&self, headers: &mut HeaderMap, api_key: &str) {
        if let Ok(value) = HeaderValue::from_str(api_key) {
            headers.insert("x-api-key", value);
        }
    }

    fn forward_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut outbound = HeaderMap::new();
        copy_header(inbound, &mut outbound, "anthropic-version");
        copy_header(inbound, &mut outbound, "anthropic-beta");
        if let Some(value) = inbound.get(CONTENT_TYPE) {
            outbound.insert(CONTENT_TYPE, value.clone());
        } else {
            outbound.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        outbound.insert(ACCEPT, HeaderValue::from_static("application/json"));
        outbound
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forwards_only_the_allow_list() {
        let provider = AnthropicProvider::new("anthropic", None);
        let mut inbound = HeaderMap::new();
        inbound.insert("anthropic-version", HeaderValue::from_static("2023-06-01"));
        inbound.insert("anthropic-beta", HeaderValue::from_static("thinking-v2"));
        inbound.insert("x-api-key", HeaderValue::from_static("client-secret"));
        inbound.insert("cookie", HeaderValue::from_static("tracking=1"));

        let outbound = provider.forward_headers(&inbound);
        assert_eq!(outbound.get("anthropic-version").unwrap(), "2023-06-01");
        assert_eq!(outbound.get("anthropic-beta").unwrap(), "thinking-v2");
        assert!(outbound.get("x-api-key").is_none());
        assert!(outbound.get("cookie").is_none());
        assert_eq!(outbound.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn authenticate_sets_api_key_header() {
        let provider = AnthropicProvider::new("anthropic", None);
        let mut headers = HeaderMap::new();
        provider.authenticate(&mut headers, "sk-ant-xyz");
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant-xyz");
    }

    #[test]
    fn model_mapping_applies() {
        let provider = AnthropicProvider::new("gateway", Some("https://gw.local/".into()))
            .with_model_mapping(HashMap::from([(
                "claude-sonnet-4".to_string(),
                "sonnet-latest".to_string(),
            )]));
        assert_eq!(provider.base_url(), "https://gw.local");
        assert_eq!(provider.map_model("claude-sonnet-4"), "sonnet-latest");
        assert_eq!(provider.map_model("claude-opus-4"), "claude-opus-4");
    }
}
