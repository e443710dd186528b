#![expect(
    clippy::module_name_repetitions,
    reason = "Configuration types intentionally mirror the module name for clarity"
)]

use std::time::Duration;

use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use bon::Builder;
use url::Url;

use crate::Result;
use crate::error::Error;

const DEFAULT_HEARTBEAT_INTERVAL_DURATION: Duration = Duration::from_secs(5);
const DEFAULT_HEARTBEAT_TIMEOUT_DURATION: Duration = Duration::from_secs(15);
const DEFAULT_INITIAL_BACKOFF_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_BACKOFF_DURATION: Duration = Duration::from_secs(30);
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_CONNECT_TIMEOUT_DURATION: Duration = Duration::from_secs(10);

/// Configuration for a [`ConnectionManager`](super::ConnectionManager).
///
/// Built once and never mutated for the lifetime of the manager.
///
/// ```
/// use std::time::Duration;
///
/// use catalog_realtime::ws::config::{Config, HeartbeatConfig, ReconnectConfig};
///
/// let config = Config::builder()
///     .url("wss://realtime.example.com/socket")
///     .reconnect(
///         ReconnectConfig::default()
///             .with_max_attempts(Some(3))
///             .with_backoff(Duration::from_millis(100), Duration::from_secs(1)),
///     )
///     .heartbeat(HeartbeatConfig::default())
///     .message_queue_limit(100)
///     .build();
///
/// assert_eq!(config.reconnect.max_attempts, Some(3));
/// ```
#[non_exhaustive]
#[derive(Debug, Clone, Builder)]
pub struct Config {
    /// Endpoint to connect to. Must use the `ws` or `wss` scheme.
    #[builder(into)]
    pub url: String,
    /// Reconnection strategy configuration
    #[builder(default)]
    pub reconnect: ReconnectConfig,
    /// Liveness probing. `None` disables heartbeats.
    pub heartbeat: Option<HeartbeatConfig>,
    /// Maximum number of undelivered outbound messages retained while disconnected.
    /// The oldest message is dropped once the limit is reached. `None` means unbounded.
    pub message_queue_limit: Option<usize>,
    /// Upper bound on a single socket-open attempt
    #[builder(default = DEFAULT_CONNECT_TIMEOUT_DURATION)]
    pub connect_timeout: Duration,
}

impl Config {
    /// Check everything `connect` depends on and return the parsed endpoint.
    pub fn validate(&self) -> Result<Url> {
        if let Some(heartbeat) = &self.heartbeat {
            heartbeat.validate()?;
        }
        self.endpoint()
    }

    /// Validate the configured endpoint and return it parsed.
    pub fn endpoint(&self) -> Result<Url> {
        let raw = self.url.trim();
        if raw.is_empty() {
            return Err(Error::configuration("url must be set before connecting"));
        }

        let url = Url::parse(raw)?;
        match url.scheme() {
            "ws" | "wss" => Ok(url),
            other => Err(Error::configuration(format!(
                "unsupported url scheme `{other}`, expected `ws` or `wss`"
            ))),
        }
    }
}

/// Configuration for automatic reconnection behavior.
#[non_exhaustive]
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Whether to reconnect automatically after an unexpected loss
    pub enabled: bool,
    /// Maximum number of consecutive reconnection attempts before giving up.
    /// `None` means infinite retries.
    pub max_attempts: Option<u32>,
    /// Backoff duration before the first reconnection attempt
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: Some(DEFAULT_MAX_RECONNECT_ATTEMPTS),
            initial_backoff: DEFAULT_INITIAL_BACKOFF_DURATION,
            max_backoff: DEFAULT_MAX_BACKOFF_DURATION,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl ReconnectConfig {
    /// Never reconnect automatically.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: Option<u32>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    #[must_use]
    pub const fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Whether another attempt is allowed after `attempts` consecutive tries.
    #[must_use]
    pub fn allows_attempt(&self, attempts: u32) -> bool {
        self.enabled && self.max_attempts.is_none_or(|max| attempts < max)
    }
}

impl From<&ReconnectConfig> for ExponentialBackoff {
    fn from(config: &ReconnectConfig) -> Self {
        ExponentialBackoffBuilder::default()
            .with_initial_interval(config.initial_backoff)
            .with_max_interval(config.max_backoff)
            .with_multiplier(config.backoff_multiplier)
            // Delays follow `initial * multiplier^(n-1)` exactly, capped at `max_backoff`
            .with_randomization_factor(0.0)
            .with_max_elapsed_time(None) // We handle max attempts separately
            .build()
    }
}

/// Liveness probing for an open connection.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// Interval for sending ping messages to keep the connection alive
    pub interval: Duration,
    /// Maximum time without any inbound traffic before the connection is considered dead
    pub timeout: Duration,
}

impl HeartbeatConfig {
    #[must_use]
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }

    /// Both durations must be non-zero.
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(Error::configuration("heartbeat interval must be non-zero"));
        }
        if self.timeout.is_zero() {
            return Err(Error::configuration("heartbeat timeout must be non-zero"));
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_HEARTBEAT_INTERVAL_DURATION,
            timeout: DEFAULT_HEARTBEAT_TIMEOUT_DURATION,
        }
    }
}
