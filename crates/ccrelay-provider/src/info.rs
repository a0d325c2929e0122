use std::sync::Arc;

use crate::health::HealthTracker;
use crate::provider::Provider;

/// Scheduling record the router selects over. Rebuilt from the live config
/// on every routing decision, so hot-reload never mutates one in place.
#[derive(Clone)]
pub struct ProviderInfo {
    pub provider: Arc<dyn Provider>,
    pub weight: u32,
    pub priority: u32,
    health: Arc<HealthTracker>,
}

impl ProviderInfo {
    pub fn new(
        provider: Arc<dyn Provider>,
        weight: u32,
        priority: u32,
        health: Arc<HealthTracker>,
    ) -> Self {
        Self {
            provider,
            weight,
            priority,
            health,
        }
    }

    pub fn name(&self) -> &str {
        self.provider.name()
    }

    pub fn is_healthy(&self) -> bool {
        self.health.is_healthy(self.provider.name())
    }
}

impl std::fmt::Debug for ProviderInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderInfo")
            .field("provider", &self.provider.name())
            .field("weight", &self.weight)
            .field("priority", &self.priority)
            .finish()
    }
}
