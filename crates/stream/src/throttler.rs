//! Lazy token-bucket throttler.
//!
//! Tokens are replenished from elapsed time whenever a caller asks for them;
//! there is no background refill task. Callers queue on a fair (FIFO)
//! [`tokio::sync::Mutex`], so a burst of sends over one connection leaves in
//! arrival order at the configured rate.
//!
//! For `R` operations of cost `C` against `T0` initial tokens and a refill
//! rate of `r` tokens/ms, the total wait is `max(0, R*C - T0) / r` ms.

use std::time::Duration;

use cm_core::config::ThrottleConfig;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Token bucket shared by every operation it paces.
#[derive(Debug)]
pub struct Throttler {
    config: ThrottleConfig,
    bucket: Mutex<Bucket>,
}

#[derive(Debug)]
struct Bucket {
    /// Fractional, may go negative when a cost exceeds the capacity.
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    /// Add tokens for the time elapsed since the last refill, capped at
    /// `capacity`. A bucket seeded above its capacity is never reduced.
    fn refill(&mut self, config: &ThrottleConfig, now: Instant) {
        let elapsed_ms = now.saturating_duration_since(self.last_refill).as_secs_f64() * 1_000.0;
        self.last_refill = now;
        if elapsed_ms <= 0.0 || self.tokens >= config.capacity {
            return;
        }
        self.tokens = (self.tokens + elapsed_ms * config.refill_rate).min(config.capacity);
    }
}

impl Throttler {
    /// Create a bucket holding `config.tokens` tokens.
    ///
    /// A non-positive capacity or refill rate falls back to the default for
    /// that field, so an unvalidated config can never stall or panic a send.
    pub fn new(mut config: ThrottleConfig) -> Self {
        let defaults = ThrottleConfig::default();
        if !(config.refill_rate > 0.0 && config.refill_rate.is_finite()) {
            tracing::warn!(
                refill_rate = config.refill_rate,
                fallback = defaults.refill_rate,
                "invalid throttle refill rate"
            );
            config.refill_rate = defaults.refill_rate;
        }
        if !(config.capacity > 0.0 && config.capacity.is_finite()) {
            tracing::warn!(
                capacity = config.capacity,
                fallback = defaults.capacity,
                "invalid throttle capacity"
            );
            config.capacity = defaults.capacity;
        }
        let bucket = Bucket {
            tokens: config.tokens,
            last_refill: Instant::now(),
        };
        Self {
            config,
            bucket: Mutex::new(bucket),
        }
    }

    /// Bucket parameters.
    pub fn config(&self) -> &ThrottleConfig {
        &self.config
    }

    /// Wait until `cost` tokens (default: the configured cost) are available,
    /// then take them.
    ///
    /// A cost above the capacity waits for a full bucket and leaves it in
    /// debt, which later callers pay off.
    pub async fn throttle(&self, cost: Option<f64>) {
        let cost = cost.unwrap_or(self.config.cost);
        let required = cost.min(self.config.capacity);

        let mut bucket = self.bucket.lock().await;
        bucket.refill(&self.config, Instant::now());

        if bucket.tokens < required {
            let wait_ms = (required - bucket.tokens) / self.config.refill_rate;
            tracing::trace!(
                cost,
                tokens = bucket.tokens,
                wait_ms,
                "throttling until tokens are available"
            );
            let wait = Duration::try_from_secs_f64(wait_ms / 1_000.0).unwrap_or(Duration::MAX);
            tokio::time::sleep(wait).await;
            bucket.refill(&self.config, Instant::now());
            // Timer rounding must not leave the bucket a fraction short.
            bucket.tokens = bucket.tokens.max(required);
        }

        bucket.tokens -= cost;
    }

    /// Tokens available right now, after a lazy refill.
    pub async fn available(&self) -> f64 {
        let mut bucket = self.bucket.lock().await;
        bucket.refill(&self.config, Instant::now());
        bucket.tokens
    }
}
