use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::interval::Interval;

/// Binance spot combined-stream base URL
pub const DEFAULT_FEED_URL: &str = "wss://stream.binance.com:9443";
pub const DEFAULT_HEARTBEAT_SECS: u64 = 15;
pub const DEFAULT_RECONNECT_DELAY_MS: u64 = 3_000;
pub const DEFAULT_THROTTLE_MS: u64 = 2_000;
/// 0.05% expressed as a fraction
pub const DEFAULT_MIN_PCT_MOVE: f64 = 0.0005;
pub const DEFAULT_WINDOW_MS: u64 = 800;
pub const DEFAULT_SECRET_HEADER: &str = "X-Webhook-Secret";
pub const DEFAULT_TIMEOUT_MS: u64 = 8_000;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 32;
pub const DEFAULT_SERVER_ADDR: &str = "0.0.0.0:8080";

/// Environment variable prefix for overrides
const ENV_PREFIX: &str = "TICKRELAY_";

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamKind {
    #[default]
    MiniTicker,
    Kline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_feed_url")]
    pub url: String,
    #[serde(default)]
    pub stream: StreamKind,
    /// Kline intervals to subscribe to (kline streams only)
    #[serde(default)]
    pub kline_intervals: Vec<Interval>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
}

fn default_feed_url() -> String {
    DEFAULT_FEED_URL.to_string()
}

fn default_heartbeat_secs() -> u64 {
    DEFAULT_HEARTBEAT_SECS
}

fn default_reconnect_delay_ms() -> u64 {
    DEFAULT_RECONNECT_DELAY_MS
}

impl FeedConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default = "default_throttle_ms")]
    pub throttle_ms: u64,
    /// Minimum relative move as a fraction (0.0005 == 0.05%)
    #[serde(default = "default_min_pct_move")]
    pub min_pct_move: f64,
}

fn default_throttle_ms() -> u64 {
    DEFAULT_THROTTLE_MS
}

fn default_min_pct_move() -> f64 {
    DEFAULT_MIN_PCT_MOVE
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            throttle_ms: default_throttle_ms(),
            min_pct_move: default_min_pct_move(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
        }
    }
}

impl BatchConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// A named downstream delivery target. A target without a URL is inert.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    pub name: String,
    #[serde(default)]
    pub interval: Option<Interval>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryConfig {
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_secret_header")]
    pub secret_header: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

fn default_secret_header() -> String {
    DEFAULT_SECRET_HEADER.to_string()
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_max_in_flight() -> usize {
    DEFAULT_MAX_IN_FLIGHT
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            secret: None,
            secret_header: default_secret_header(),
            timeout_ms: default_timeout_ms(),
            max_in_flight: default_max_in_flight(),
            targets: Vec::new(),
        }
    }
}

impl DeliveryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_server_addr() -> String {
    DEFAULT_SERVER_ADDR.to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub feed: FeedConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl RelayConfig {
    /// Load from YAML, apply `TICKRELAY_*` environment overrides, then validate.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&content)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: RelayConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Apply overrides from a key lookup (the process environment in production).
    ///
    /// - `TICKRELAY_SYMBOLS`: comma separated symbol list
    /// - `TICKRELAY_SECRET`: shared secret sent with every delivery
    /// - `TICKRELAY_TARGET_URL_<NAME>`: endpoint for the named target; empty disables it
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(symbols) = lookup(&format!("{}SYMBOLS", ENV_PREFIX)) {
            self.feed.symbols = symbols
                .split(',')
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }

        if let Some(secret) = lookup(&format!("{}SECRET", ENV_PREFIX)) {
            self.delivery.secret = Some(secret).filter(|s| !s.is_empty());
        }

        for target in &mut self.delivery.targets {
            let key = format!("{}TARGET_URL_{}", ENV_PREFIX, env_key_suffix(&target.name));
            if let Some(url) = lookup(&key) {
                target.url = Some(url.trim().to_string()).filter(|u| !u.is_empty());
            }
        }
    }

    /// Normalize symbols to upper case and reject configurations the relay cannot run with.
    /// A target without a URL is allowed; it simply never receives anything.
    pub fn validate(&mut self) -> Result<(), ConfigError> {
        for symbol in &mut self.feed.symbols {
            *symbol = symbol.trim().to_ascii_uppercase();
            if symbol.is_empty() || !symbol.chars().all(|ch| ch.is_ascii_alphanumeric()) {
                return Err(ConfigError::Validation(format!(
                    "symbol must be non-empty alphanumeric ASCII: {:?}",
                    symbol
                )));
            }
        }
        let mut seen = HashSet::new();
        self.feed.symbols.retain(|s| seen.insert(s.clone()));

        if self.feed.symbols.is_empty() {
            return Err(ConfigError::Validation("feed.symbols is empty".into()));
        }
        if self.feed.stream == StreamKind::Kline && self.feed.kline_intervals.is_empty() {
            return Err(ConfigError::Validation(
                "feed.kline_intervals is required for kline streams".into(),
            ));
        }
        if self.feed.heartbeat_secs == 0 {
            return Err(ConfigError::Validation("feed.heartbeat_secs must be > 0".into()));
        }
        if self.batch.window_ms == 0 {
            return Err(ConfigError::Validation("batch.window_ms must be > 0".into()));
        }
        if !self.filter.min_pct_move.is_finite() || self.filter.min_pct_move < 0.0 {
            return Err(ConfigError::Validation(
                "filter.min_pct_move must be a finite non-negative fraction".into(),
            ));
        }
        if self.delivery.max_in_flight == 0 {
            return Err(ConfigError::Validation("delivery.max_in_flight must be > 0".into()));
        }
        if self.delivery.targets.is_empty() {
            return Err(ConfigError::Validation("delivery.targets is empty".into()));
        }

        let mut names: Vec<&str> = self.delivery.targets.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|w| w[0] == w[1]) {
            return Err(ConfigError::Validation("delivery target names must be unique".into()));
        }

        // Candles are routed to the target named after their interval
        if self.feed.stream == StreamKind::Kline {
            if let Some(interval) = self
                .feed
                .kline_intervals
                .iter()
                .find(|i| !names.contains(&i.as_str()))
            {
                return Err(ConfigError::Validation(format!(
                    "kline interval {} has no delivery target named {:?}",
                    interval,
                    interval.as_str()
                )));
            }
        }

        // One permit per target so a hung endpoint cannot starve the others
        if self.delivery.max_in_flight < self.delivery.targets.len() {
            return Err(ConfigError::Validation(format!(
                "delivery.max_in_flight ({}) must be at least the number of targets ({})",
                self.delivery.max_in_flight,
                self.delivery.targets.len()
            )));
        }

        Ok(())
    }
}

/// `"1h"` -> `"1H"`, `"alerts-4h"` -> `"ALERTS_4H"`
fn env_key_suffix(name: &str) -> String {
    name.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() {
                ch.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect()
}
