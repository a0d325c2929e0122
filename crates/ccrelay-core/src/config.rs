use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use ccrelay_provider::{HealthConfig, PoolStrategy};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config parse failed: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteStrategy {
    #[default]
    RoundRobin,
    Weighted,
    Priority,
    Failover,
    LeastLoaded,
    ModelBased,
}

impl RouteStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStrategy::RoundRobin => "round_robin",
            RouteStrategy::Weighted => "weighted",
            RouteStrategy::Priority => "priority",
            RouteStrategy::Failover => "failover",
            RouteStrategy::LeastLoaded => "least_loaded",
            RouteStrategy::ModelBased => "model_based",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Validate `x-api-key` against `server.api_key`.
    pub api_key: bool,
    /// Accept `Authorization: Bearer`; equality against `bearer_secret`, or
    /// any non-empty token when no secret is configured.
    pub allow_bearer: bool,
    /// Accept subscription-style bearer tokens for transparent passthrough.
    pub allow_subscription: bool,
    pub bearer_secret: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen: String,
    pub api_key: Option<String>,
    pub auth: AuthConfig,
    pub max_body_bytes: usize,
    pub max_concurrent: usize,
    pub timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8787".to_string(),
            api_key: None,
            auth: AuthConfig::default(),
            max_body_bytes: 10 * 1024 * 1024,
            max_concurrent: 512,
            timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingConfig {
    pub strategy: RouteStrategy,
    pub timeout_ms: u64,
    pub debug: bool,
    pub model_mapping: HashMap<String, String>,
    pub default_provider: Option<String>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: RouteStrategy::default(),
            timeout_ms: 5_000,
            debug: false,
            model_mapping: HashMap::new(),
            default_provider: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub failure_threshold: u32,
    pub open_duration_ms: u64,
    pub half_open_probes: u32,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration_ms: 30_000,
            half_open_probes: 2,
        }
    }
}

impl HealthSection {
    pub fn to_health_config(&self) -> HealthConfig {
        HealthConfig {
            failure_threshold: self.failure_threshold,
            open_duration: Duration::from_millis(self.open_duration_ms),
            half_open_probes: self.half_open_probes,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Json,
    #[default]
    Console,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DebugOptions {
    pub log_request_body: bool,
    pub log_response_headers: bool,
    pub max_body_log_size: usize,
    pub log_tls_metrics: bool,
}

impl Default for DebugOptions {
    fn default() -> Self {
        Self {
            log_request_body: false,
            log_response_headers: false,
            max_body_log_size: 2048,
            log_tls_metrics: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub pretty: bool,
    pub debug_options: DebugOptions,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            pretty: false,
            debug_options: DebugOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// The official endpoint or any gateway speaking the same dialect.
    Anthropic,
    /// Same wire format behind an arbitrary base URL, no transparent auth.
    Custom,
    /// Model-in-URL dialect with binary event-stream responses.
    Bedrock,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    pub api_key: String,
    pub name: Option<String>,
    pub rpm_limit: u32,
    pub itpm_limit: u32,
    pub otpm_limit: u32,
    pub priority: u32,
    pub weight: u32,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            name: None,
            rpm_limit: 60,
            itpm_limit: 1_000_000,
            otpm_limit: 500_000,
            priority: 0,
            weight: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub strategy: PoolStrategy,
    pub keys: Vec<KeyConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProviderType,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_mapping: HashMap<String, String>,
    #[serde(default)]
    pub pool: PoolConfig,
}

fn default_true() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub routing: RoutingConfig,
    pub health: HealthSection,
    pub logging: LoggingConfig,
    pub providers: Vec<ProviderConfig>,
}

impl Config {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for provider in &self.providers {
            if provider.name.is_empty() {
                return Err(ConfigError::Invalid("provider with empty name".to_string()));
            }
            if !seen.insert(provider.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate provider name: {}",
                    provider.name
                )));
            }
            if matches!(provider.kind, ProviderType::Custom | ProviderType::Bedrock)
                && provider.base_url.is_none()
            {
                return Err(ConfigError::Invalid(format!(
                    "provider {} requires base_url",
                    provider.name
                )));
            }
        }
        if !self.providers.iter().any(|p| p.enabled) {
            return Err(ConfigError::Invalid("no enabled providers".to_string()));
        }
        if let Some(default) = &self.routing.default_provider {
            if !self.providers.iter().any(|p| &p.name == default) {
                return Err(ConfigError::Invalid(format!(
                    "routing.default_provider {default} is not a configured provider"
                )));
            }
        }
        Ok(())
    }

    /// Fingerprint of one provider's credential binding: what the lazy proxy
    /// cache keys on so hot-reload rebuilds only the bindings that changed.
    pub fn binding_fingerprint(provider: &ProviderConfig) -> String {
        fingerprint(&(&provider.base_url, &provider.pool))
    }

    pub fn auth_fingerprint(&self) -> String {
        fingerprint(&(&self.server.api_key, &self.server.auth))
    }

    pub fn health_fingerprint(&self) -> String {
        fingerprint(&self.health)
    }
}

/// Compact content fingerprint for config-keyed caches.
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let hash = blake3::hash(&bytes);
    hash.to_hex()[..16].to_string()
}

/// The live configuration, swapped atomically on reload. Every request loads
/// one snapshot up front and never observes a mix of old and new.
pub struct ConfigHandle {
    inner: ArcSwap<Config>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: ArcSwap::from_pointee(config),
        }
    }

    pub fn load(&self) -> Arc<Config> {
        self.inner.load_full()
    }

    pub fn store(&self, config: Config) {
        self.inner.store(Arc::new(config));
    }
}
