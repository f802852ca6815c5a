use std::time::Duration;

use tokio::time::Instant;

/// Token bucket for a single rate-limit key. Callers hold the per-bucket lock
/// across refill and consume so transitions on `tokens` stay linearizable.
#[derive(Debug, Clone)]
pub struct TokenBucketState {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucketState {
    pub fn new(capacity: f64, refill_per_sec: f64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: now,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    /// Adopts new effective limits. Tokens above the new capacity are dropped.
    pub fn rescale(&mut self, capacity: f64, refill_per_sec: f64) {
        self.capacity = capacity;
        self.refill_per_sec = refill_per_sec;
        self.tokens = self.tokens.min(capacity);
    }

    pub fn refill(&mut self, now: Instant) {
        self.tokens = self.projected_tokens(now);
        self.last_refill = now;
    }

    pub fn projected_tokens(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }

    /// Refill, then take one token if a whole one is available.
    pub fn try_consume(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the bucket holds `target` tokens. `None` when it never will.
    pub fn time_until(&self, target: f64) -> Option<Duration> {
        let target = target.min(self.capacity);
        if self.tokens >= target {
            return Some(Duration::ZERO);
        }
        if self.refill_per_sec <= 0.0 {
            return None;
        }
        Some(Duration::from_secs_f64(
            (target - self.tokens) / self.refill_per_sec,
        ))
    }
}
