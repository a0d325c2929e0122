use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    TransientFailure,
}

impl Outcome {
    /// 5xx and 429 count against the provider; other 4xx are the client's
    /// fault and do not.
    pub fn from_status(status: u16) -> Self {
        if status < 500 && status != 429 {
            Outcome::Success
        } else {
            Outcome::TransientFailure
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub open_duration: Duration,
    pub half_open_probes: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_duration: Duration::from_secs(30),
            half_open_probes: 2,
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            half_open_successes: 0,
            opened_at: None,
        }
    }

    /// Promote `open` to `half_open` once the open window has elapsed.
    fn settle(&mut self, config: &HealthConfig, now: Instant) {
        if self.state == CircuitState::Open {
            let elapsed = self
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::ZERO);
            if elapsed >= config.open_duration {
                self.state = CircuitState::HalfOpen;
                self.half_open_successes = 0;
            }
        }
    }
}

/// Per-provider circuit breakers driving the router's candidate filter.
/// `is_healthy` answers `false` only while a circuit is open.
pub struct HealthTracker {
    config: HealthConfig,
    breakers: Mutex<HashMap<String, Breaker>>,
}

impl HealthTracker {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_outcome(&self, provider: &str, outcome: Outcome) {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().expect("health lock poisoned");
        let breaker = breakers
            .entry(provider.to_string())
            .or_insert_with(Breaker::new);
        breaker.settle(&self.config, now);

        let before = breaker.state;
        match (breaker.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                breaker.consecutive_failures = 0;
            }
            (CircuitState::Closed, Outcome::TransientFailure) => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.config.failure_threshold {
                    breaker.state = CircuitState::Open;
                    breaker.opened_at = Some(now);
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                breaker.half_open_successes += 1;
                if breaker.half_open_successes >= self.config.half_open_probes {
                    breaker.state = CircuitState::Closed;
                    breaker.consecutive_failures = 0;
                    breaker.opened_at = None;
                }
            }
            (CircuitState::HalfOpen, Outcome::TransientFailure) => {
                breaker.state = CircuitState::Open;
                breaker.opened_at = Some(now);
            }
            // A failure landing while already open just refreshes the window.
            (CircuitState::Open, Outcome::TransientFailure) => {
                breaker.opened_at = Some(now);
            }
            (CircuitState::Open, Outcome::Success) => {}
        }

        if breaker.state != before {
            info!(
                event = "circuit_transition",
                provider = %provider,
                from = ?before,
                to = ?breaker.state,
                consecutive_failures = breaker.consecutive_failures
            );
        }
    }

    pub fn is_healthy(&self, provider: &str) -> bool {
        self.state(provider) != CircuitState::Open
    }

    pub fn state(&self, provider: &str) -> CircuitState {
        let now = Instant::now();
        let mut breakers = self.breakers.lock().expect("health lock poisoned");
        match breakers.get_mut(provider) {
            Some(breaker) => {
                breaker.settle(&self.config, now);
                breaker.state
            }
            None => CircuitState::Closed,
        }
    }
}
