//! Layered configuration for the CM streaming layer.
//!
//! Configuration is loaded in layers with increasing priority:
//! 1. Compiled-in defaults (conservative timeouts and rate limits)
//! 2. TOML configuration file (if provided)
//! 3. Environment variable overrides (prefix `CM_STREAM_`, nested with `__`)
//!
//! `cm-stream` converts these plain-number sections into its runtime
//! configuration types (durations, buckets).

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;

// ── Default value functions ────────────────────────────────────────────

/// Default connection handshake timeout: 10 000 ms.
fn default_connection_timeout_ms() -> u64 {
    10_000
}

/// Default keepalive ping interval: 30 000 ms.
fn default_keepalive_ms() -> u64 {
    30_000
}

/// Default number of unanswered pings tolerated: 3.
fn default_max_ping_pong_misses() -> u32 {
    3
}

/// Default initial reconnect backoff: 100 ms.
fn default_initial_backoff_ms() -> u64 {
    100
}

/// Default maximum reconnect backoff: 30 000 ms.
fn default_max_backoff_ms() -> u64 {
    30_000
}

/// Default maximum reconnect attempts: 0 (unlimited).
fn default_max_retries() -> u32 {
    0
}

/// Default consecutive failures before reconnects are logged as alerts: 5.
fn default_alert_after() -> u32 {
    5
}

/// Default bucket capacity: 1 token.
fn default_capacity() -> f64 {
    1.0
}

/// Default refill rate: one token every 50 ms.
fn default_refill_rate() -> f64 {
    1.0 / 50.0
}

/// Default initial tokens: 0.
fn default_tokens() -> f64 {
    0.0
}

/// Default operation cost: 1 token.
fn default_cost() -> f64 {
    1.0
}

/// Default REST request timeout: 10 000 ms.
fn default_rest_timeout_ms() -> u64 {
    10_000
}

/// Default snapshot fetch attempts per resync: 3.
fn default_book_max_retries() -> u32 {
    3
}

/// Checksum validation is on unless disabled.
fn default_checksum() -> bool {
    true
}

/// Default snapshot depth requested from REST: 1 000 levels.
fn default_snapshot_limit() -> usize {
    1_000
}

/// Default trades kept per stream: 1 000.
fn default_trades_limit() -> usize {
    1_000
}

// ── Configuration structs ──────────────────────────────────────────────

/// Top-level streaming configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Per-connection handshake and keepalive settings.
    pub connection: ConnectionConfig,
    /// Backoff applied by the coordinator when reopening a failed connection.
    pub reconnect: ReconnectConfig,
    /// Token bucket shared by all sends over one connection.
    pub throttle: ThrottleConfig,
    /// REST snapshot fetching.
    pub rest: RestConfig,
    /// Order book reconciliation.
    pub order_book: OrderBookConfig,
    /// Per-stream caches of streamed updates.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Log output format.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Connection handshake and keepalive parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionConfig {
    /// Upper bound for opening a connection, in milliseconds.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
    /// Interval between keepalive pings, in milliseconds.
    #[serde(default = "default_keepalive_ms")]
    pub keepalive_ms: u64,
    /// Unanswered pings tolerated before the connection is declared dead.
    #[serde(default = "default_max_ping_pong_misses")]
    pub max_ping_pong_misses: u32,
}

/// Reconnect parameters with exponential backoff.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectConfig {
    /// Initial backoff delay in milliseconds.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Maximum backoff delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Maximum consecutive reconnect attempts (0 = unlimited).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Consecutive failures after which each reconnect is logged at warn.
    #[serde(default = "default_alert_after")]
    pub alert_after: u32,
}

/// Token bucket parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct ThrottleConfig {
    /// Maximum tokens the bucket holds.
    #[serde(default = "default_capacity")]
    pub capacity: f64,
    /// Tokens added per millisecond.
    #[serde(default = "default_refill_rate")]
    pub refill_rate: f64,
    /// Tokens available at creation.
    #[serde(default = "default_tokens")]
    pub tokens: f64,
    /// Cost charged when the caller does not specify one.
    #[serde(default = "default_cost")]
    pub cost: f64,
}

/// REST snapshot settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RestConfig {
    /// Request timeout in milliseconds.
    #[serde(default = "default_rest_timeout_ms")]
    pub timeout_ms: u64,
    /// Depth requested when fetching a snapshot.
    #[serde(default = "default_snapshot_limit")]
    pub snapshot_limit: usize,
    /// Bucket pacing snapshot requests.
    pub throttle: ThrottleConfig,
}

/// Order book reconciliation settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OrderBookConfig {
    /// Snapshot fetches attempted before a book is declared unrecoverable.
    #[serde(default = "default_book_max_retries")]
    pub max_retries: u32,
    /// Validate exchange-supplied checksums after each delta.
    #[serde(default = "default_checksum")]
    pub checksum: bool,
    /// Levels kept per side (0 = unlimited).
    #[serde(default)]
    pub depth: usize,
}

/// Bounded caches of streamed updates.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Trades kept per message hash; the oldest are dropped first.
    #[serde(default = "default_trades_limit")]
    pub trades_limit: usize,
}

/// Log output settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of pretty output.
    #[serde(default)]
    pub json: bool,
}

impl StreamConfig {
    /// Load configuration using layered sources.
    ///
    /// 1. Compiled-in defaults.
    /// 2. TOML file at `config_path` (if `Some`).
    /// 3. Environment variable overrides with prefix `CM_STREAM_` and `__` as
    ///    the nesting separator (e.g., `CM_STREAM_THROTTLE__CAPACITY=10`).
    pub fn load(config_path: Option<PathBuf>) -> Result<Self> {
        let mut builder = Config::builder()
            // ── Layer 1: compiled-in defaults ───────────────────────
            .set_default("connection.connection_timeout_ms", 10_000i64)?
            .set_default("connection.keepalive_ms", 30_000i64)?
            .set_default("connection.max_ping_pong_misses", 3i64)?
            .set_default("reconnect.initial_backoff_ms", 100i64)?
            .set_default("reconnect.max_backoff_ms", 30_000i64)?
            .set_default("reconnect.max_retries", 0i64)?
            .set_default("reconnect.alert_after", 5i64)?
            .set_default("throttle.capacity", 1.0)?
            .set_default("throttle.refill_rate", 1.0 / 50.0)?
            .set_default("throttle.tokens", 0.0)?
            .set_default("throttle.cost", 1.0)?
            .set_default("rest.timeout_ms", 10_000i64)?
            .set_default("rest.snapshot_limit", 1_000i64)?
            .set_default("rest.throttle.capacity", 1.0)?
            .set_default("rest.throttle.refill_rate", 1.0 / 50.0)?
            .set_default("rest.throttle.tokens", 1.0)?
            .set_default("rest.throttle.cost", 1.0)?
            .set_default("order_book.max_retries", 3i64)?
            .set_default("order_book.checksum", true)?
            .set_default("order_book.depth", 0i64)?
            .set_default("cache.trades_limit", 1_000i64)?
            .set_default("logging.json", false)?;

        // ── Layer 2: TOML file ─────────────────────────────────────
        if let Some(path) = config_path {
            let path_str = path
                .to_str()
                .context("config path is not valid UTF-8")?;
            builder = builder.add_source(File::with_name(path_str).required(true));
        }

        // ── Layer 3: env var overrides (CM_STREAM_ prefix) ────────
        // The prefix separator is `_` while nesting uses `__`; without the
        // explicit prefix separator the crate would expect `cm_stream__`.
        builder = builder.add_source(
            Environment::with_prefix("CM_STREAM")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let cfg: StreamConfig = builder
            .build()
            .context("failed to build configuration")?
            .try_deserialize()
            .context("failed to deserialize configuration")?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate configuration invariants.
    fn validate(&self) -> Result<()> {
        self.throttle.validate("throttle")?;
        self.rest.throttle.validate("rest.throttle")?;
        if self.connection.max_ping_pong_misses == 0 {
            bail!("connection.max_ping_pong_misses must be at least 1");
        }
        if self.connection.connection_timeout_ms == 0 {
            bail!("connection.connection_timeout_ms must be positive");
        }
        if self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms {
            bail!(
                "reconnect.initial_backoff_ms ({}) exceeds reconnect.max_backoff_ms ({})",
                self.reconnect.initial_backoff_ms,
                self.reconnect.max_backoff_ms
            );
        }
        if self.order_book.max_retries == 0 {
            bail!("order_book.max_retries must be at least 1");
        }
        if self.cache.trades_limit == 0 {
            bail!("cache.trades_limit must be at least 1");
        }
        Ok(())
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            reconnect: ReconnectConfig::default(),
            throttle: ThrottleConfig::default(),
            rest: RestConfig::default(),
            order_book: OrderBookConfig::default(),
            cache: CacheConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ThrottleConfig {
    fn validate(&self, section: &str) -> Result<()> {
        if !(self.capacity > 0.0) {
            bail!("{section}.capacity must be positive");
        }
        if !(self.refill_rate > 0.0) {
            bail!("{section}.refill_rate must be positive");
        }
        if self.tokens < 0.0 || self.cost < 0.0 {
            bail!("{section}.tokens and {section}.cost must not be negative");
        }
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connection_timeout_ms: default_connection_timeout_ms(),
            keepalive_ms: default_keepalive_ms(),
            max_ping_pong_misses: default_max_ping_pong_misses(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
            alert_after: default_alert_after(),
        }
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            refill_rate: default_refill_rate(),
            tokens: default_tokens(),
            cost: default_cost(),
        }
    }
}

impl Default for RestConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_rest_timeout_ms(),
            snapshot_limit: default_snapshot_limit(),
            throttle: ThrottleConfig {
                tokens: 1.0,
                ..ThrottleConfig::default()
            },
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            trades_limit: default_trades_limit(),
        }
    }
}

impl Default for OrderBookConfig {
    fn default() -> Self {
        Self {
            max_retries: default_book_max_retries(),
            checksum: default_checksum(),
            depth: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    /// Global mutex to serialize tests that manipulate environment variables.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Clear all env vars that could interfere with config loading.
    fn clear_env() {
        std::env::remove_var("CM_STREAM_THROTTLE__CAPACITY");
        std::env::remove_var("CM_STREAM_CONNECTION__KEEPALIVE_MS");
        std::env::remove_var("CM_STREAM_ORDER_BOOK__CHECKSUM");
    }

    /// Helper: create a temporary TOML config file and return its path.
    fn write_temp_toml(content: &str) -> (tempfile::NamedTempFile, PathBuf) {
        let mut f = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .expect("create temp file");
        write!(f, "{}", content).expect("write temp file");
        let path = f.path().to_path_buf();
        (f, path)
    }

    #[test]
    fn test_load_defaults_only() {
        let _lock = lock_env();
        clear_env();

        let cfg = StreamConfig::load(None).expect("load defaults");
        assert_eq!(cfg.connection.connection_timeout_ms, 10_000);
        assert_eq!(cfg.connection.keepalive_ms, 30_000);
        assert_eq!(cfg.connection.max_ping_pong_misses, 3);
        assert_eq!(cfg.reconnect.initial_backoff_ms, 100);
        assert_eq!(cfg.reconnect.max_retries, 0);
        assert_eq!(cfg.throttle.capacity, 1.0);
        assert!((cfg.throttle.refill_rate - 0.02).abs() < 1e-12);
        assert_eq!(cfg.rest.snapshot_limit, 1_000);
        assert_eq!(cfg.order_book.max_retries, 3);
        assert!(cfg.order_book.checksum);
        assert_eq!(cfg.reconnect.alert_after, 5);
        assert_eq!(cfg.cache.trades_limit, 1_000);
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_defaults_match_compiled_in_layer() {
        let _lock = lock_env();
        clear_env();

        let loaded = StreamConfig::load(None).expect("load defaults");
        let built = StreamConfig::default();
        assert_eq!(loaded.connection.keepalive_ms, built.connection.keepalive_ms);
        assert_eq!(loaded.rest.throttle.tokens, built.rest.throttle.tokens);
        assert_eq!(loaded.order_book.depth, built.order_book.depth);
    }

    #[test]
    fn test_load_from_toml() {
        let _lock = lock_env();
        clear_env();

        let toml_content = r#"
[connection]
connection_timeout_ms = 2500
keepalive_ms = 18000
max_ping_pong_misses = 2

[throttle]
capacity = 10.0
refill_rate = 0.1
tokens = 10.0

[order_book]
max_retries = 5
checksum = false
depth = 50

[reconnect]
alert_after = 8

[cache]
trades_limit = 50

[logging]
json = true
"#;
        let (_f, path) = write_temp_toml(toml_content);
        let cfg = StreamConfig::load(Some(path)).expect("load from toml");

        assert_eq!(cfg.connection.connection_timeout_ms, 2500);
        assert_eq!(cfg.connection.keepalive_ms, 18_000);
        assert_eq!(cfg.connection.max_ping_pong_misses, 2);
        assert_eq!(cfg.throttle.capacity, 10.0);
        assert_eq!(cfg.throttle.tokens, 10.0);
        assert_eq!(cfg.throttle.cost, 1.0);
        assert_eq!(cfg.order_book.max_retries, 5);
        assert!(!cfg.order_book.checksum);
        assert_eq!(cfg.order_book.depth, 50);
        assert_eq!(cfg.reconnect.alert_after, 8);
        assert_eq!(cfg.reconnect.initial_backoff_ms, 100);
        assert_eq!(cfg.cache.trades_limit, 50);
        assert!(cfg.logging.json);
    }

    #[test]
    fn test_env_var_overrides() {
        let _lock = lock_env();
        clear_env();
        std::env::set_var("CM_STREAM_THROTTLE__CAPACITY", "25");
        std::env::set_var("CM_STREAM_ORDER_BOOK__CHECKSUM", "false");

        let cfg = StreamConfig::load(None).expect("load with env override");
        assert_eq!(cfg.throttle.capacity, 25.0);
        assert!(!cfg.order_book.checksum);

        clear_env();
    }

    #[test]
    fn test_zero_refill_rate_rejected() {
        let _lock = lock_env();
        clear_env();

        let (_f, path) = write_temp_toml("[throttle]\nrefill_rate = 0.0\n");
        let err = StreamConfig::load(Some(path)).unwrap_err();
        assert!(format!("{err}").contains("refill_rate"), "{err}");
    }

    #[test]
    fn test_zero_ping_pong_misses_rejected() {
        let _lock = lock_env();
        clear_env();

        let (_f, path) = write_temp_toml("[connection]\nmax_ping_pong_misses = 0\n");
        let err = StreamConfig::load(Some(path)).unwrap_err();
        assert!(format!("{err}").contains("max_ping_pong_misses"), "{err}");
    }

    #[test]
    fn test_inverted_backoff_rejected() {
        let _lock = lock_env();
        clear_env();

        let (_f, path) =
            write_temp_toml("[reconnect]\ninitial_backoff_ms = 5000\nmax_backoff_ms = 1000\n");
        assert!(StreamConfig::load(Some(path)).is_err());
    }
}
