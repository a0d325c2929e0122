use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ratelimit::RateLimitUpdate;

mod bucket;

pub use bucket::TokenBucket;

/// Declared per-minute limits for one upstream key, one token bucket each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialLimits {
    pub rpm: u32,
    pub itpm: u32,
    pub otpm: u32,
}

#[derive(Debug)]
struct Clock {
    requests: TokenBucket,
    input_tokens: TokenBucket,
    output_tokens: TokenBucket,
    exhausted_until: Option<Instant>,
}

impl Clock {
    fn dimensions(&mut self) -> [&mut TokenBucket; 3] {
        [
            &mut self.requests,
            &mut self.input_tokens,
            &mut self.output_tokens,
        ]
    }
}

/// One upstream secret plus its live scheduling state. Bucket state is
/// mutated under the credential's own lock; pool-level selection only ever
/// takes one credential lock at a time.
#[derive(Debug)]
pub struct Credential {
    id: String,
    api_key: String,
    priority: u32,
    weight: u32,
    limits: CredentialLimits,
    clock: Mutex<Clock>,
}

impl Credential {
    pub fn new(
        id: impl Into<String>,
        api_key: impl Into<String>,
        limits: CredentialLimits,
        priority: u32,
        weight: u32,
    ) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            api_key: api_key.into(),
            priority,
            weight,
            limits,
            clock: Mutex::new(Clock {
                requests: TokenBucket::new(limits.rpm, now),
                input_tokens: TokenBucket::new(limits.itpm, now),
                output_tokens: TokenBucket::new(limits.otpm, now),
                exhausted_until: None,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    pub fn limits(&self) -> CredentialLimits {
        self.limits
    }

    /// Available iff not in an exhausted window and every dimension holds at
    /// least one token.
    pub fn is_available(&self, now: Instant) -> bool {
        let mut clock = self.clock.lock().expect("credential lock poisoned");
        if let Some(until) = clock.exhausted_until {
            if now < until {
                return false;
            }
            clock.exhausted_until = None;
        }
        clock.dimensions().iter_mut().all(|b| b.available(now) >= 1.0)
    }

    /// Fraction of the scarcest dimension still available, in `[0, 1]`.
    pub fn headroom(&self, now: Instant) -> f64 {
        let mut clock = self.clock.lock().expect("credential lock poisoned");
        clock
            .dimensions()
            .iter_mut()
            .map(|b| {
                let capacity = b.capacity();
                if capacity <= 0.0 {
                    0.0
                } else {
                    b.available(now) / capacity
                }
            })
            .fold(1.0_f64, f64::min)
    }

    /// Consume one token from every dimension, or none at all.
    fn charge(&self, now: Instant) -> bool {
        let mut clock = self.clock.lock().expect("credential lock poisoned");
        if let Some(until) = clock.exhausted_until {
            if now < until {
                return false;
            }
            clock.exhausted_until = None;
        }
        let ready = clock.dimensions().iter_mut().all(|b| b.available(now) >= 1.0);
        if !ready {
            return false;
        }
        for bucket in clock.dimensions() {
            bucket.try_consume(1.0, now);
        }
        true
    }

    /// Earliest instant this credential could serve again.
    fn wait_hint(&self, now: Instant) -> Duration {
        let mut clock = self.clock.lock().expect("credential lock poisoned");
        let exhausted = clock
            .exhausted_until
            .map(|until| until.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO);
        let buckets = clock
            .dimensions()
            .iter_mut()
            .map(|b| b.time_until_available(now))
            .max()
            .unwrap_or(Duration::ZERO);
        exhausted.max(buckets)
    }

    /// Reconcile bucket state from upstream rate-limit response headers.
    /// Remaining counts overwrite the computed tokens; the refill anchor
    /// moves to the dimension's reported reset instant, so a drained bucket
    /// stays drained until the upstream window actually turns over.
    /// Dimensions the update does not carry keep their computed state.
    pub fn update_from_upstream_headers(&self, update: &RateLimitUpdate) {
        let now = Instant::now();
        let mut clock = self.clock.lock().expect("credential lock poisoned");
        if let Some(remaining) = update.requests.remaining {
            let anchor = reset_anchor(update.requests.reset, now);
            clock.requests.reconcile(remaining as f64, anchor);
        }
        if let Some(remaining) = update.input_tokens.remaining {
            let anchor = reset_anchor(update.input_tokens.reset, now);
            clock.input_tokens.reconcile(remaining as f64, anchor);
        }
        if let Some(remaining) = update.output_tokens.remaining {
            let anchor = reset_anchor(update.output_tokens.reset, now);
            clock.output_tokens.reconcile(remaining as f64, anchor);
        }
    }

    pub fn mark_exhausted(&self, retry_after: Duration) {
        let mut clock = self.clock.lock().expect("credential lock poisoned");
        clock.exhausted_until = Some(Instant::now() + retry_after);
    }
}

/// Map an upstream reset timestamp (wall clock) onto the monotonic clock the
/// buckets run on. A reset in the past, or no reset at all, anchors at `now`.
fn reset_anchor(reset: Option<time::OffsetDateTime>, now: Instant) -> Instant {
    let Some(reset) = reset else {
        return now;
    };
    let delta = reset - time::OffsetDateTime::now_utc();
    match std::time::Duration::try_from(delta) {
        Ok(ahead) => now + ahead,
        Err(_) => now,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolStrategy {
    #[default]
    RoundRobin,
    LeastLoaded,
    Priority,
    Weighted,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub available: usize,
    pub exhausted: usize,
    pub total_rpm: u64,
    pub total_itpm: u64,
    pub total_otpm: u64,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AcquireError {
    #[error("all credentials exhausted")]
    AllKeysExhausted {
        /// Earliest reset across the pool, for the `Retry-After` header.
        retry_after: Duration,
    },
}

/// A named bag of credentials owned by one provider. Replaced wholesale on
/// hot-reload; selection never blocks.
pub struct CredentialPool {
    provider: String,
    strategy: PoolStrategy,
    credentials: Vec<Arc<Credential>>,
    cursor: AtomicUsize,
}

impl CredentialPool {
    pub fn new(
        provider: impl Into<String>,
        strategy: PoolStrategy,
        credentials: Vec<Credential>,
    ) -> Self {
        Self {
            provider: provider.into(),
            strategy,
            credentials: credentials.into_iter().map(Arc::new).collect(),
            cursor: AtomicUsize::new(0),
        }
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    pub fn strategy(&self) -> PoolStrategy {
        self.strategy
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Select one available credential and charge one token on each of its
    /// dimensions. The charge re-checks under the credential lock, so two
    /// concurrent acquisitions racing for the last token cannot both win it;
    /// the loser falls through to the next candidate.
    pub fn acquire(&self) -> Result<Arc<Credential>, AcquireError> {
        let now = Instant::now();
        for credential in self.candidate_order(now) {
            if credential.charge(now) {
                return Ok(credential);
            }
        }
        Err(AcquireError::AllKeysExhausted {
            retry_after: self.earliest_reset(now),
        })
    }

    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let mut stats = PoolStats {
            total: self.credentials.len(),
            ..Default::default()
        };
        for credential in &self.credentials {
            let limits = credential.limits();
            stats.total_rpm += u64::from(limits.rpm);
            stats.total_itpm += u64::from(limits.itpm);
            stats.total_otpm += u64::from(limits.otpm);
            if credential.is_available(now) {
                stats.available += 1;
            } else {
                stats.exhausted += 1;
            }
        }
        stats
    }

    /// `1 - available/total`; what the router's `least_loaded` strategy reads.
    pub fn pressure(&self) -> f64 {
        if self.credentials.is_empty() {
            return 1.0;
        }
        let stats = self.stats();
        1.0 - stats.available as f64 / stats.total as f64
    }

    fn earliest_reset(&self, now: Instant) -> Duration {
        self.credentials
            .iter()
            .map(|c| c.wait_hint(now))
            .min()
            .unwrap_or(Duration::from_secs(60))
    }

    fn candidate_order(&self, now: Instant) -> Vec<Arc<Credential>> {
        let len = self.credentials.len();
        if len == 0 {
            return Vec::new();
        }
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % len;
        // Rotation from the round-robin cursor is the shared tie-break.
        let rotation: Vec<Arc<Credential>> = (0..len)
            .map(|offset| self.credentials[(start + offset) % len].clone())
            .collect();

        match self.strategy {
            PoolStrategy::RoundRobin => rotation,
            PoolStrategy::LeastLoaded => {
                let mut scored: Vec<(f64, usize, Arc<Credential>)> = rotation
                    .into_iter()
                    .enumerate()
                    .map(|(pos, c)| (c.headroom(now), pos, c))
                    .collect();
                scored.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
                scored.into_iter().map(|(_, _, c)| c).collect()
            }
            PoolStrategy::Priority => {
                let mut scored: Vec<(u32, f64, usize, Arc<Credential>)> = rotation
                    .into_iter()
                    .enumerate()
                    .map(|(pos, c)| (c.priority(), c.headroom(now), pos, c))
                    .collect();
                scored.sort_by(|a, b| {
                    b.0.cmp(&a.0)
                        .then(b.1.total_cmp(&a.1))
                        .then(a.2.cmp(&b.2))
                });
                scored.into_iter().map(|(_, _, _, c)| c).collect()
            }
            PoolStrategy::Weighted => weighted_order(rotation),
        }
    }
}

/// Draw candidates without replacement, each draw proportional to weight.
/// Zero-weight credentials are excluded entirely.
fn weighted_order(candidates: Vec<Arc<Credential>>) -> Vec<Arc<Credential>> {
    let mut remaining: Vec<Arc<Credential>> = candidates
        .into_iter()
        .filter(|c| c.weight() > 0)
        .collect();
    let mut ordered = Vec::with_capacity(remaining.len());
    let mut rng = rand::rng();
    while !remaining.is_empty() {
        let total: u64 = remaining.iter().map(|c| u64::from(c.weight())).sum();
        let mut roll = rng.random_range(0..total);
        let mut picked = 0;
        for (index, credential) in remaining.iter().enumerate() {
            let weight = u64::from(credential.weight());
            if roll < weight {
                picked = index;
                break;
            }
            roll -= weight;
        }
        ordered.push(remaining.swap_remove(picked));
    }
    ordered
}
