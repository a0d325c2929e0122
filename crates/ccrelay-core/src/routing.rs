use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng;

use ccrelay_provider::{CredentialPool, ProviderInfo};

use crate::config::{RouteStrategy, RoutingConfig};
use crate::error::RelayError;

/// What candidate filtering decided, carried into the debug headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterOutcome {
    /// Every candidate was unhealthy and the full set was kept anyway.
    pub degraded: bool,
    /// The set was pinned to the first healthy candidate for signature
    /// continuity.
    pub thinking_affinity: bool,
}

/// Reduce the live provider set to the candidates a strategy may pick from.
///
/// Order: drop unhealthy providers (unless that empties the set, in which
/// case keep all as a degraded fallback); pin to the first remaining
/// candidate when the request continues an extended-thinking conversation;
/// then restrict to the provider the model mapping names. A restriction that
/// would empty the set is skipped, so the affinity pin always survives a
/// mapping that points elsewhere.
pub fn filter_candidates(
    providers: &[ProviderInfo],
    routing: &RoutingConfig,
    model: Option<&str>,
    thinking_continuation: bool,
) -> (Vec<ProviderInfo>, FilterOutcome) {
    let mut outcome = FilterOutcome::default();

    let mut candidates: Vec<ProviderInfo> = providers
        .iter()
        .filter(|info| info.is_healthy())
        .cloned()
        .collect();
    if candidates.is_empty() {
        candidates = providers.to_vec();
        outcome.degraded = !candidates.is_empty();
    }

    if thinking_continuation {
        candidates.truncate(1);
        outcome.thinking_affinity = !candidates.is_empty();
    }

    let mapped = model
        .and_then(|m| routing.model_mapping.get(m))
        .or(routing.default_provider.as_ref());
    if let Some(name) = mapped {
        let restricted: Vec<ProviderInfo> = candidates
            .iter()
            .filter(|info| info.name() == name)
            .cloned()
            .collect();
        if !restricted.is_empty() {
            candidates = restricted;
        }
    }

    (candidates, outcome)
}

/// Strategy state that must survive across requests (the round-robin
/// cursor). Everything else is computed from the per-request snapshot.
#[derive(Debug, Default)]
pub struct ProviderRouter {
    counter: AtomicUsize,
}

impl ProviderRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(
        &self,
        strategy: RouteStrategy,
        candidates: &[ProviderInfo],
        pools: &HashMap<String, Arc<CredentialPool>>,
    ) -> Result<ProviderInfo, RelayError> {
        if candidates.is_empty() {
            return Err(RelayError::no_provider("no healthy provider available"));
        }
        let chosen = match strategy {
            RouteStrategy::RoundRobin => {
                let index = self.counter.fetch_add(1, Ordering::Relaxed) % candidates.len();
                candidates[index].clone()
            }
            RouteStrategy::Weighted => weighted_pick(candidates),
            RouteStrategy::Priority => {
                // Highest tier wins; the earlier candidate wins ties.
                let mut best = candidates[0].clone();
                for candidate in &candidates[1..] {
                    if candidate.priority > best.priority {
                        best = candidate.clone();
                    }
                }
                best
            }
            RouteStrategy::Failover => candidates
                .iter()
                .find(|info| info.is_healthy())
                .cloned()
                .unwrap_or_else(|| candidates[0].clone()),
            RouteStrategy::LeastLoaded => candidates
                .iter()
                .min_by(|a, b| {
                    pool_pressure(pools, a.name()).total_cmp(&pool_pressure(pools, b.name()))
                })
                .cloned()
                .unwrap_or_else(|| candidates[0].clone()),
            // Filtering already pinned the mapped provider; take the first.
            RouteStrategy::ModelBased => candidates[0].clone(),
        };
        Ok(chosen)
    }
}

fn pool_pressure(pools: &HashMap<String, Arc<CredentialPool>>, provider: &str) -> f64 {
    pools.get(provider).map(|pool| pool.pressure()).unwrap_or(0.0)
}

/// Cumulative-weight draw. Zero-weight candidates only win when every weight
/// is zero, in which case the first candidate is returned.
fn weighted_pick(candidates: &[ProviderInfo]) -> ProviderInfo {
    let total: u64 = candidates.iter().map(|c| u64::from(c.weight)).sum();
    if total == 0 {
        return candidates[0].clone();
    }
    let mut cumulative = Vec::with_capacity(candidates.len());
    let mut acc = 0u64;
    for candidate in candidates {
        acc += u64::from(candidate.weight);
        cumulative.push(acc);
    }
    let roll = rand::rng().random_range(0..total);
    let index = cumulative.partition_point(|&edge| edge <= roll);
    candidates[index.min(candidates.len() - 1)].clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccrelay_provider::{AnthropicProvider, HealthConfig, HealthTracker, Outcome, Provider};

    fn fleet(names: &[(&str, u32, u32)]) -> (Vec<ProviderInfo>, Arc<HealthTracker>) {
        let health = Arc::new(HealthTracker::new(HealthConfig {
            failure_threshold: 1,
            open_duration: std::time::Duration::from_secs(60),
            half_open_probes: 1,
        }));
        let providers = names
            .iter()
            .map(|(name, weight, priority)| {
                let provider: Arc<dyn Provider> =
                    Arc::new(AnthropicProvider::new(*name, None));
                ProviderInfo::new(provider, *weight, *priority, health.clone())
            })
            .collect();
        (providers, health)
    }

    fn routing() -> RoutingConfig {
        RoutingConfig::default()
    }

    #[test]
    fn unhealthy_providers_are_filtered() {
        let (providers, health) = fleet(&[("a", 1, 0), ("b", 1, 0)]);
        health.record_outcome("a", Outcome::TransientFailure);
        let (candidates, outcome) = filter_candidates(&providers, &routing(), None, false);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name(), "b");
        assert!(!outcome.degraded);
    }

    #[test]
    fn all_unhealthy_degrades_to_full_set() {
        let (providers, health) = fleet(&[("a", 1, 0), ("b", 1, 0)]);
        health.record_outcome("a", Outcome::TransientFailure);
        health.record_outcome("b", Outcome::TransientFailure);
        let (candidates, outcome) = filter_candidates(&providers, &routing(), None, false);
        assert_eq!(candidates.len(), 2);
        assert!(outcome.degraded);
    }

    #[test]
    fn thinking_affinity_pins_first_healthy() {
        let (providers, _) = fleet(&[("a", 1, 0), ("b", 1, 0)]);
        let (candidates, outcome) = filter_candidates(&providers, &routing(), None, true);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name(), "a");
        assert!(outcome.thinking_affinity);
    }

    #[test]
    fn model_mapping_restricts_the_set() {
        let (providers, _) = fleet(&[("a", 1, 0), ("b", 1, 0)]);
        let mut routing = routing();
        routing
            .model_mapping
            .insert("claude-opus-4".to_string(), "b".to_string());
        let (candidates, _) =
            filter_candidates(&providers, &routing, Some("claude-opus-4"), false);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name(), "b");

        // Unmapped model falls back to the whole set (no default provider).
        let (candidates, _) = filter_candidates(&providers, &routing, Some("other"), false);
        assert_eq!(candidates.len(), 2);
    }

    #[test]
    fn thinking_affinity_wins_over_a_conflicting_model_mapping() {
        let (providers, _) = fleet(&[("a", 1, 0), ("b", 1, 0)]);
        let mut routing = routing();
        routing
            .model_mapping
            .insert("claude-opus-4".to_string(), "b".to_string());

        // The affinity pin lands on "a" first; restricting to "b" would
        // empty the set, so the pin survives and signatures stay valid.
        let (candidates, outcome) =
            filter_candidates(&providers, &routing, Some("claude-opus-4"), true);
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].name(), "a");
        assert!(outcome.thinking_affinity);

        // When the mapping names the pinned provider, both agree.
        routing
            .model_mapping
            .insert("claude-opus-4".to_string(), "a".to_string());
        let (candidates, _) =
            filter_candidates(&providers, &routing, Some("claude-opus-4"), true);
        assert_eq!(candidates[0].name(), "a");
    }

    #[test]
    fn round_robin_cycles() {
        let (providers, _) = fleet(&[("a", 1, 0), ("b", 1, 0)]);
        let router = ProviderRouter::new();
        let pools = HashMap::new();
        let picks: Vec<String> = (0..4)
            .map(|_| {
                router
                    .select(RouteStrategy::RoundRobin, &providers, &pools)
                    .unwrap()
                    .name()
                    .to_string()
            })
            .collect();
        assert_eq!(picks, ["a", "b", "a", "b"]);
    }

    #[test]
    fn priority_takes_highest_tier() {
        let (providers, _) = fleet(&[("low", 1, 1), ("high", 1, 9)]);
        let router = ProviderRouter::new();
        let chosen = router
            .select(RouteStrategy::Priority, &providers, &HashMap::new())
            .unwrap();
        assert_eq!(chosen.name(), "high");
    }

    #[test]
    fn failover_takes_first_healthy_in_config_order() {
        let (providers, health) = fleet(&[("primary", 1, 0), ("backup", 1, 0)]);
        let router = ProviderRouter::new();
        let chosen = router
            .select(RouteStrategy::Failover, &providers, &HashMap::new())
            .unwrap();
        assert_eq!(chosen.name(), "primary");

        health.record_outcome("primary", Outcome::TransientFailure);
        let chosen = router
            .select(RouteStrategy::Failover, &providers, &HashMap::new())
            .unwrap();
        assert_eq!(chosen.name(), "backup");
    }

    #[test]
    fn empty_candidate_set_is_an_error() {
        let router = ProviderRouter::new();
        assert!(
            router
                .select(RouteStrategy::RoundRobin, &[], &HashMap::new())
                .is_err()
        );
    }
}
