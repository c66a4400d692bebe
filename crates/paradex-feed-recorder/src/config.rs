/*
[INPUT]:  YAML configuration file, PARADEX_BEARER_TOKEN environment variable
[OUTPUT]: Validated recorder configuration and the adapter's ReceiverConfig
[POS]:    Configuration layer - feed setup
[UPDATE]: When adding new configuration options
*/

use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::ValueEnum;
use paradex_feed_adapter::receiver::{DEFAULT_CADENCE, DEFAULT_DEPTH, DEFAULT_PRICE_BUCKET};
use paradex_feed_adapter::ws::connection::{DEFAULT_MAX_AUTH_FAILURES, DEFAULT_WS_URL};
use paradex_feed_adapter::{BookFeed, ConnectionConfig, HeartbeatConfig, ReceiverConfig, ReconnectConfig};
use serde::{Deserialize, Serialize};

/// Overrides `bearer_token` from the file when set.
pub const BEARER_TOKEN_ENV: &str = "PARADEX_BEARER_TOKEN";

/// Which streams to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum StreamSelection {
    Book,
    Trades,
    #[default]
    Both,
}

/// How book snapshots are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BookOutput {
    /// One record per snapshot with nested bid/ask arrays.
    #[default]
    Snapshot,
    /// One record per price level.
    Levels,
}

/// Top-level recorder configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderConfig {
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    /// JWT for the JSON-RPC `auth` call; public channels work without it
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Markets recorded on every selected stream (e.g. "BTC-USD-PERP")
    pub symbols: Vec<String>,
    #[serde(default)]
    pub book: BookConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
    #[serde(default = "default_subscribe_timeout_secs")]
    pub subscribe_timeout_secs: u64,
    #[serde(default = "default_max_auth_failures")]
    pub max_auth_failures: u32,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BookConfig {
    #[serde(default = "default_depth")]
    pub depth: usize,
    /// Snapshot cadence (e.g. "50ms"); only sent for the snapshot feed
    #[serde(default = "default_cadence")]
    pub cadence: String,
    #[serde(default = "default_price_bucket")]
    pub price_bucket: String,
    #[serde(default)]
    pub feed: BookFeed,
}

impl Default for BookConfig {
    fn default() -> Self {
        Self {
            depth: default_depth(),
            cadence: default_cadence(),
            price_bucket: default_price_bucket(),
            feed: BookFeed::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatSettings {
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    #[serde(default = "default_ping_timeout_secs")]
    pub ping_timeout_secs: u64,
    #[serde(default = "default_ping_interval_secs")]
    pub app_ping_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    #[serde(default = "default_watchdog_period_ms")]
    pub watchdog_period_ms: u64,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            ping_interval_secs: default_ping_interval_secs(),
            ping_timeout_secs: default_ping_timeout_secs(),
            app_ping_interval_secs: default_ping_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            watchdog_period_ms: default_watchdog_period_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_reconnect_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub exponential_backoff: bool,
    #[serde(default = "default_max_reconnect_interval_secs")]
    pub max_interval_secs: u64,
    /// Extra random delay as a fraction of the base delay
    #[serde(default)]
    pub jitter_ratio: f64,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_reconnect_interval_secs(),
            exponential_backoff: false,
            max_interval_secs: default_max_reconnect_interval_secs(),
            jitter_ratio: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default)]
    pub book_format: BookOutput,
}

fn default_ws_url() -> String {
    DEFAULT_WS_URL.to_string()
}

fn default_depth() -> usize {
    DEFAULT_DEPTH
}

fn default_cadence() -> String {
    DEFAULT_CADENCE.to_string()
}

fn default_price_bucket() -> String {
    DEFAULT_PRICE_BUCKET.to_string()
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_ping_timeout_secs() -> u64 {
    10
}

fn default_heartbeat_timeout_secs() -> u64 {
    120
}

fn default_watchdog_period_ms() -> u64 {
    1000
}

fn default_reconnect_interval_secs() -> u64 {
    5
}

fn default_max_reconnect_interval_secs() -> u64 {
    60
}

fn default_subscribe_timeout_secs() -> u64 {
    10
}

fn default_max_auth_failures() -> u32 {
    DEFAULT_MAX_AUTH_FAILURES
}

impl RecorderConfig {
    /// Load configuration from YAML file
    pub fn from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_context(|| format!("read {path}"))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(content).context("parse yaml")?;
        Ok(config)
    }

    /// Read the file, apply the environment override, validate.
    pub fn load(path: &str) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_bearer_override(std::env::var(BEARER_TOKEN_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    /// A non-empty override replaces the file's token.
    pub fn apply_bearer_override(&mut self, token: Option<String>) {
        if let Some(token) = token.filter(|token| !token.trim().is_empty()) {
            self.bearer_token = Some(token);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("symbols must not be empty");
        }
        if self.symbols.iter().any(|symbol| symbol.trim().is_empty()) {
            bail!("symbols must not contain blank entries");
        }
        if self.book.depth == 0 {
            bail!("book.depth must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter_ratio) {
            bail!("reconnect.jitter_ratio must be within [0, 1]");
        }
        Ok(())
    }

    /// Build the adapter configuration for the selected streams.
    pub fn receiver_config(&self, streams: StreamSelection) -> ReceiverConfig {
        let symbols = self.symbols.clone();
        let (book_symbols, trade_symbols) = match streams {
            StreamSelection::Book => (symbols, Vec::new()),
            StreamSelection::Trades => (Vec::new(), symbols),
            StreamSelection::Both => (symbols.clone(), symbols),
        };

        let heartbeat = HeartbeatConfig {
            ping_interval: Duration::from_secs(self.heartbeat.ping_interval_secs),
            ping_timeout: Duration::from_secs(self.heartbeat.ping_timeout_secs),
            app_ping_interval: Duration::from_secs(self.heartbeat.app_ping_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat.heartbeat_timeout_secs),
            watchdog_period: Duration::from_millis(self.heartbeat.watchdog_period_ms),
        };
        let reconnect = ReconnectConfig {
            interval: Duration::from_secs(self.reconnect.interval_secs),
            exponential_backoff: self.reconnect.exponential_backoff,
            max_interval: Duration::from_secs(self.reconnect.max_interval_secs),
            jitter_ratio: self.reconnect.jitter_ratio,
        };

        ReceiverConfig {
            connection: ConnectionConfig {
                url: self.ws_url.clone(),
                bearer_token: self.bearer_token.clone(),
                heartbeat,
                reconnect,
                subscribe_timeout: Duration::from_secs(self.subscribe_timeout_secs),
                max_auth_failures: self.max_auth_failures,
                ..ConnectionConfig::default()
            },
            book_symbols,
            trade_symbols,
            depth: self.book.depth,
            cadence: self.book.cadence.clone(),
            price_bucket: self.book.price_bucket.clone(),
            book_feed: self.book.feed,
        }
    }
}
