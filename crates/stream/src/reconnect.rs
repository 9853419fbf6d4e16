//! Reconnect backoff applied by the coordinator before reopening a client.
//!
//! Clients never reconnect on their own. When a `watch` finds its client
//! disconnected after failures, it asks [`ReconnectPolicy::delay_for`] how
//! long the new connection attempt should wait first.

use std::time::Duration;

/// Exponential backoff with jitter and an optional retry cap.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    /// Initial backoff duration before the first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration (backoff is capped at this value).
    pub max_backoff: Duration,
    /// Maximum consecutive failed attempts before giving up (0 = unlimited).
    pub max_retries: u32,
    /// Emit a warning log after this many consecutive failures.
    pub alert_after: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            max_retries: 0, // unlimited
            alert_after: 5,
        }
    }
}

impl From<&cm_core::config::ReconnectConfig> for ReconnectPolicy {
    fn from(config: &cm_core::config::ReconnectConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            max_retries: config.max_retries,
            alert_after: config.alert_after,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before the next connection attempt, given the number of
    /// consecutive failures so far.
    ///
    /// `0` failures means a first connection: no delay. Returns `None` once
    /// `max_retries` is exceeded.
    pub fn delay_for(&self, failures: u32, url: &str) -> Option<Duration> {
        if failures == 0 {
            return Some(Duration::ZERO);
        }
        if self.max_retries > 0 && failures > self.max_retries {
            tracing::error!(
                failures,
                max_retries = self.max_retries,
                url = %cm_core::logging::redact_url(url),
                "giving up on reconnecting"
            );
            return None;
        }

        let backoff = calculate_backoff(&self.initial_backoff, &self.max_backoff, failures - 1);
        tracing::info!(
            attempt = failures,
            backoff_ms = backoff.as_millis() as u64,
            url = %cm_core::logging::redact_url(url),
            "reconnecting to WebSocket"
        );
        if failures >= self.alert_after {
            tracing::warn!(
                attempt = failures,
                url = %cm_core::logging::redact_url(url),
                "WebSocket reconnection attempts exceeded alert threshold"
            );
        }
        Some(backoff)
    }
}

/// Calculate exponential backoff with jitter.
///
/// `backoff = initial * 2^attempt`, capped at `max`. Jitter adds a random
/// amount in `[0, 0.5 * backoff]`.
pub(crate) fn calculate_backoff(initial: &Duration, max: &Duration, attempt: u32) -> Duration {
    let base = initial
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(*max);

    let jitter_frac = rand::random::<f64>() * 0.5;
    let jitter = Duration::from_secs_f64(base.as_secs_f64() * jitter_frac);

    base + jitter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_policy() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.initial_backoff, Duration::from_millis(100));
        assert_eq!(policy.max_backoff, Duration::from_secs(30));
        assert_eq!(policy.max_retries, 0);
        assert_eq!(policy.alert_after, 5);
    }

    #[test]
    fn test_from_config() {
        let config = cm_core::config::ReconnectConfig {
            initial_backoff_ms: 250,
            max_backoff_ms: 4_000,
            max_retries: 7,
            alert_after: 2,
        };
        let policy = ReconnectPolicy::from(&config);
        assert_eq!(policy.initial_backoff, Duration::from_millis(250));
        assert_eq!(policy.max_backoff, Duration::from_secs(4));
        assert_eq!(policy.max_retries, 7);
        assert_eq!(policy.alert_after, 2);
    }

    #[test]
    fn test_exponential_backoff_bounds() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(30);

        for attempt in 0..10 {
            let backoff = calculate_backoff(&initial, &max, attempt);
            let base = initial.saturating_mul(2u32.saturating_pow(attempt)).min(max);
            let upper = base + Duration::from_secs_f64(base.as_secs_f64() * 0.5);
            assert!(backoff >= base, "attempt {attempt}: backoff < base");
            assert!(backoff <= upper, "attempt {attempt}: {backoff:?} > {upper:?}");
        }
    }

    #[test]
    fn test_backoff_capped_at_max() {
        let initial = Duration::from_millis(100);
        let max = Duration::from_secs(30);

        let backoff = calculate_backoff(&initial, &max, 20);
        assert!(backoff >= max);
        assert!(backoff <= max + Duration::from_secs(15));
    }

    #[test]
    fn test_first_connection_has_no_delay() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(0, "wss://feed"), Some(Duration::ZERO));
    }

    #[test]
    fn test_delay_grows_with_failures() {
        let policy = ReconnectPolicy::default();
        // Base 100ms for the first retry, 400ms for the third.
        let first = policy.delay_for(1, "wss://feed").unwrap();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let third = policy.delay_for(3, "wss://feed").unwrap();
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(600));
    }

    #[test]
    fn test_retry_cap() {
        let policy = ReconnectPolicy {
            max_retries: 3,
            ..Default::default()
        };
        assert!(policy.delay_for(3, "wss://feed").is_some());
        assert!(policy.delay_for(4, "wss://feed").is_none());
    }

    #[test]
    fn test_unlimited_retries() {
        let policy = ReconnectPolicy::default();
        assert!(policy.delay_for(1_000, "wss://feed").is_some());
    }
}
