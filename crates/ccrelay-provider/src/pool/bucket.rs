use std::time::{Duration, Instant};

/// A lazily refilled token bucket. Capacity equals the declared per-minute
/// limit; refill is linear at `limit / 60` per second, computed on each
/// inspection rather than by a timer task.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit_per_minute: u32, now: Instant) -> Self {
        let capacity = f64::from(limit_per_minute);
        Self {
            capacity,
            rate_per_sec: capacity / 60.0,
            tokens: capacity,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn available(&mut self, now: Instant) -> f64 {
        self.refill(now);
        self.tokens
    }

    /// Consume `n` tokens if the bucket holds at least that many.
    pub fn try_consume(&mut self, n: f64, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Overwrite live state from an upstream-reported remaining count. The
    /// refill anchor moves to `anchor` (the upstream's reset instant when it
    /// reported one); a future anchor freezes the bucket until it passes.
    pub fn reconcile(&mut self, remaining: f64, anchor: Instant) {
        self.tokens = remaining.clamp(0.0, self.capacity);
        self.last_refill = anchor;
    }

    /// Time until at least one token is available. Zero when already there.
    /// A reconciled refill anchor still in the future counts toward the wait.
    pub fn time_until_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if self.rate_per_sec <= 0.0 {
            return Duration::from_secs(60);
        }
        let lead = self.last_refill.saturating_duration_since(now);
        lead + Duration::from_secs_f64((1.0 - self.tokens) / self.rate_per_sec)
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        if elapsed.is_zero() {
            return;
        }
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_full_and_consumes() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, now);
        assert_eq!(bucket.available(now), 10.0);
        assert!(bucket.try_consume(1.0, now));
        assert_eq!(bucket.available(now), 9.0);
    }

    #[test]
    fn refills_linearly_and_caps_at_limit() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(60, now);
        for _ in 0..60 {
            assert!(bucket.try_consume(1.0, now));
        }
        assert!(!bucket.try_consume(1.0, now));

        // One second restores one token at 60/min.
        let later = now + Duration::from_secs(1);
        assert!(bucket.available(later) >= 1.0);

        let much_later = now + Duration::from_secs(3600);
        assert_eq!(bucket.available(much_later), 60.0);
    }

    #[test]
    fn reconcile_clamps_to_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(10, now);
        bucket.reconcile(500.0, now);
        assert_eq!(bucket.available(now), 10.0);
        bucket.reconcile(2.0, now);
        assert_eq!(bucket.available(now), 2.0);
    }

    #[test]
    fn future_reset_anchor_freezes_refill_until_it_passes() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(60, now);
        bucket.reconcile(0.0, now + Duration::from_secs(10));

        // No refill while the upstream window has not reset yet, and the
        // wait hint covers the remaining lead time.
        assert_eq!(bucket.available(now + Duration::from_secs(5)), 0.0);
        assert!(bucket.time_until_available(now + Duration::from_secs(5)) >= Duration::from_secs(5));
        assert_eq!(bucket.available(now + Duration::from_secs(10)), 0.0);

        // Refill resumes from the anchor, one token per second at 60/min.
        let later = now + Duration::from_secs(13);
        assert!((bucket.available(later) - 3.0).abs() < 0.5);
    }

    #[test]
    fn time_until_available_is_zero_when_ready() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new(60, now);
        assert_eq!(bucket.time_until_available(now), Duration::ZERO);

        for _ in 0..60 {
            bucket.try_consume(1.0, now);
        }
        let wait = bucket.time_until_available(now);
        assert!(wait > Duration::ZERO && wait <= Duration::from_secs(2));
    }
}
