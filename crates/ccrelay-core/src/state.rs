use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use tracing::info;

use ccrelay_protocol::ModelInfo;
use ccrelay_provider::{
    AnthropicProvider, BedrockProvider, Credential, CredentialLimits, CredentialPool,
    HealthTracker, Provider, ProviderInfo,
};

use crate::auth::ClientAuth;
use crate::config::{Config, ConfigError, ConfigHandle, ProviderConfig, ProviderType};
use crate::engine::ProviderProxy;
use crate::routing::ProviderRouter;
use crate::thinking::SignatureCache;

const SIGNATURE_CACHE_CAPACITY: usize = 4096;
const SIGNATURE_CACHE_TTL: Duration = Duration::from_secs(3600);

/// Everything a single request reads, captured once at dispatch. Hot-reload
/// swaps the underlying pointers; an in-flight request keeps its snapshot.
#[derive(Clone)]
pub struct Snapshot {
    pub config: Arc<Config>,
    pub providers: Arc<Vec<ProviderInfo>>,
    pub pools: Arc<HashMap<String, Arc<CredentialPool>>>,
    /// Provider name → credential-binding fingerprint, for the proxy cache.
    pub bindings: Arc<HashMap<String, String>>,
}

/// Process-wide state behind the handlers. Credential pools and the health
/// tracker are named singletons keyed by provider name; the proxy cache is
/// lazy and fingerprint-keyed so reloads rebuild only what changed.
pub struct AppState {
    config: ConfigHandle,
    providers: ArcSwap<Vec<ProviderInfo>>,
    pools: ArcSwap<HashMap<String, Arc<CredentialPool>>>,
    bindings: ArcSwap<HashMap<String, String>>,
    health: ArcSwap<HealthTracker>,
    auth: ArcSwap<ClientAuth>,
    fingerprints: Mutex<Fingerprints>,
    proxies: Mutex<HashMap<ProxyKey, Arc<ProviderProxy>>>,
    signatures: Arc<SignatureCache>,
    pub router: ProviderRouter,
    pub inflight: AtomicUsize,
}

type ProxyKey = (String, String, String);

#[derive(Default)]
struct Fingerprints {
    auth: String,
    health: String,
}

impl AppState {
    pub fn new(config: Config) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let health = Arc::new(HealthTracker::new(config.health.to_health_config()));
        let (providers, pools, bindings) = build_provider_set(&config, &health)?;
        let auth = ClientAuth::from_config(&config.server.auth, config.server.api_key.as_deref());
        let fingerprints = Fingerprints {
            auth: config.auth_fingerprint(),
            health: config.health_fingerprint(),
        };

        Ok(Arc::new(Self {
            config: ConfigHandle::new(config),
            providers: ArcSwap::from_pointee(providers),
            pools: ArcSwap::from_pointee(pools),
            bindings: ArcSwap::from_pointee(bindings),
            health: ArcSwap::new(health),
            auth: ArcSwap::from_pointee(auth),
            fingerprints: Mutex::new(fingerprints),
            proxies: Mutex::new(HashMap::new()),
            signatures: Arc::new(SignatureCache::new(
                SIGNATURE_CACHE_CAPACITY,
                SIGNATURE_CACHE_TTL,
            )),
            router: ProviderRouter::new(),
            inflight: AtomicUsize::new(0),
        }))
    }

    /// Swap in a new configuration. Pools whose credential binding did not
    /// change keep their live bucket state; everything else is rebuilt.
    pub fn reload(&self, config: Config) -> Result<(), ConfigError> {
        config.validate()?;

        let mut fingerprints = self.fingerprints.lock().expect("fingerprint lock poisoned");
        let health_fp = config.health_fingerprint();
        if fingerprints.health != health_fp {
            self.health
                .store(Arc::new(HealthTracker::new(config.health.to_health_config())));
            fingerprints.health = health_fp;
        }
        let auth_fp = config.auth_fingerprint();
        if fingerprints.auth != auth_fp {
            self.auth.store(Arc::new(ClientAuth::from_config(
                &config.server.auth,
                config.server.api_key.as_deref(),
            )));
            fingerprints.auth = auth_fp;
        }
        drop(fingerprints);

        let health = self.health.load_full();
        let previous_bindings = self.bindings.load_full();
        let previous_pools = self.pools.load_full();
        let (providers, mut pools, bindings) = build_provider_set(&config, &health)?;
        for (name, pool) in pools.iter_mut() {
            if previous_bindings.get(name) == bindings.get(name) {
                if let Some(existing) = previous_pools.get(name) {
                    *pool = existing.clone();
                }
            }
        }

        self.providers.store(Arc::new(providers));
        self.pools.store(Arc::new(pools));
        self.bindings.store(Arc::new(bindings));
        self.config.store(config);
        info!(event = "config_reloaded");
        Ok(())
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            config: self.config.load(),
            providers: self.providers.load_full(),
            pools: self.pools.load_full(),
            bindings: self.bindings.load_full(),
        }
    }

    pub fn config(&self) -> Arc<Config> {
        self.config.load()
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        self.health.load_full()
    }

    pub fn auth(&self) -> Arc<ClientAuth> {
        self.auth.load_full()
    }

    pub fn signatures(&self) -> Arc<SignatureCache> {
        self.signatures.clone()
    }

    /// Look up or lazily create the proxy for `(provider, binding)`. A stale
    /// entry for the same provider under an old fingerprint is evicted here,
    /// while requests already bound to it keep their `Arc`.
    pub fn proxy_for(
        &self,
        info: &ProviderInfo,
        binding: &str,
        timeout: Duration,
    ) -> Result<Arc<ProviderProxy>, crate::error::RelayError> {
        let key = (
            info.name().to_string(),
            info.provider.base_url().to_string(),
            binding.to_string(),
        );
        let mut proxies = self.proxies.lock().expect("proxy cache lock poisoned");
        if let Some(existing) = proxies.get(&key) {
            return Ok(existing.clone());
        }
        proxies.retain(|(name, url, _), _| !(name == &key.0 && url == &key.1));
        let proxy = Arc::new(ProviderProxy::new(info.provider.clone(), timeout)?);
        proxies.insert(key, proxy.clone());
        Ok(proxy)
    }
}

fn build_provider_set(
    config: &Config,
    health: &Arc<HealthTracker>,
) -> Result<
    (
        Vec<ProviderInfo>,
        HashMap<String, Arc<CredentialPool>>,
        HashMap<String, String>,
    ),
    ConfigError,
> {
    let mut providers = Vec::new();
    let mut pools = HashMap::new();
    let mut bindings = HashMap::new();

    for provider_config in config.providers.iter().filter(|p| p.enabled) {
        let provider = build_provider(provider_config)?;
        providers.push(ProviderInfo::new(
            provider,
            provider_config.weight,
            provider_config.priority,
            health.clone(),
        ));
        pools.insert(
            provider_config.name.clone(),
            Arc::new(build_pool(provider_config)),
        );
        bindings.insert(
            provider_config.name.clone(),
            Config::binding_fingerprint(provider_config),
        );
    }
    Ok((providers, pools, bindings))
}

fn build_provider(config: &ProviderConfig) -> Result<Arc<dyn Provider>, ConfigError> {
    let models: Vec<ModelInfo> = config.models.iter().map(ModelInfo::new).collect();
    let provider: Arc<dyn Provider> = match config.kind {
        ProviderType::Anthropic => Arc::new(
            AnthropicProvider::new(&config.name, config.base_url.clone())
                .with_transparent(true)
                .with_models(models)
                .with_model_mapping(config.model_mapping.clone()),
        ),
        ProviderType::Custom => Arc::new(
            AnthropicProvider::new(&config.name, config.base_url.clone())
                .with_models(models)
                .with_model_mapping(config.model_mapping.clone()),
        ),
        ProviderType::Bedrock => {
            let base_url = config.base_url.clone().ok_or_else(|| {
                ConfigError::Invalid(format!("provider {} requires base_url", config.name))
            })?;
            Arc::new(
                BedrockProvider::new(&config.name, base_url)
                    .with_models(models)
                    .with_model_mapping(config.model_mapping.clone()),
            )
        }
    };
    Ok(provider)
}

fn build_pool(config: &ProviderConfig) -> CredentialPool {
    let credentials = config
        .pool
        .keys
        .iter()
        .enumerate()
        .map(|(index, key)| {
            let id = key
                .name
                .clone()
                .unwrap_or_else(|| format!("key-{}", index + 1));
            Credential::new(
                id,
                key.api_key.clone(),
                CredentialLimits {
                    rpm: key.rpm_limit,
                    itpm: key.itpm_limit,
                    otpm: key.otpm_limit,
                },
                key.priority,
                key.weight,
            )
        })
        .collect();
    CredentialPool::new(&config.name, config.pool.strategy, credentials)
}
