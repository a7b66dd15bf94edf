//! Crawler configuration
//!
//! Resolution order: built-in defaults, then the TOML file (if any), then
//! `CRAWLER_*` environment variables. `validate()` runs last.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlerConfig {
    #[serde(default)]
    pub market: MarketConfig,

    #[serde(default)]
    pub ingest: IngestConfig,

    #[serde(default)]
    pub feed: FeedConfig,

    #[serde(default)]
    pub api: ApiConfig,
}

/// What to track and how much of it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Candles kept per (symbol, interval)
    pub ring_capacity: usize,
    pub intervals: Vec<String>,
    /// Quote asset a symbol must settle in to be tracked
    pub settlement_asset: String,
    /// Symbols never tracked even if listed
    pub deny_list: Vec<String>,
    pub shard_count: usize,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            ring_capacity: 500,
            intervals: ["5m", "15m", "30m", "1h", "4h", "1d"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            settlement_asset: "USDT".to_string(),
            deny_list: Vec::new(),
            shard_count: 16,
        }
    }
}

/// Warm-up, retry and streaming behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Candles requested per history fetch
    pub history_limit: usize,
    /// Delay between consecutive warm-up fetches of one interval
    pub fetch_pacing_ms: u64,
    pub fetch_timeout_secs: u64,
    /// Consecutive retry attempts before a long cooldown
    pub retry_cooldown_threshold: u64,
    pub retry_cooldown_secs: u64,
    /// Pause after each retry attempt
    pub retry_delay_ms: u64,
    pub retry_queue_capacity: usize,
    /// Fetches admitted per rate window
    pub rate_limit_requests: u32,
    pub rate_limit_window_secs: u64,
    /// Delay between opening consecutive interval subscriptions
    pub subscribe_stagger_ms: u64,
    pub directory_refresh_secs: u64,
    pub publish_interval_secs: u64,
    /// Buffered snapshots per publish subscriber. Each tick sends one snapshot
    /// per tracked symbol, so keep this above the symbol count; a receiver
    /// that falls further behind gets `RecvError::Lagged` and resumes from
    /// the oldest snapshot still buffered.
    pub publish_buffer: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            history_limit: 500,
            fetch_pacing_ms: 1000,
            fetch_timeout_secs: 90,
            retry_cooldown_threshold: 100,
            retry_cooldown_secs: 30 * 60,
            retry_delay_ms: 500,
            retry_queue_capacity: 1024,
            rate_limit_requests: 1200,
            rate_limit_window_secs: 60,
            subscribe_stagger_ms: 2000,
            directory_refresh_secs: 60 * 60,
            publish_interval_secs: 10,
            publish_buffer: 1024,
        }
    }
}

impl IngestConfig {
    pub fn fetch_pacing(&self) -> Duration {
        Duration::from_millis(self.fetch_pacing_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn retry_cooldown(&self) -> Duration {
        Duration::from_secs(self.retry_cooldown_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn subscribe_stagger(&self) -> Duration {
        Duration::from_millis(self.subscribe_stagger_ms)
    }

    pub fn directory_refresh(&self) -> Duration {
        Duration::from_secs(self.directory_refresh_secs)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_secs)
    }
}

/// Binance USDⓈ-M futures endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub rest_url: String,
    /// Combined stream endpoint
    pub ws_url: String,
    /// Streams multiplexed on one WebSocket connection
    pub max_streams_per_connection: usize,
    pub request_timeout_secs: u64,
    /// Events buffered per subscription before the reader applies backpressure
    pub event_buffer: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rest_url: "https://fapi.binance.com".to_string(),
            ws_url: "wss://fstream.binance.com/stream".to_string(),
            max_streams_per_connection: 200,
            request_timeout_secs: 30,
            event_buffer: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub listen_addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: "0.0.0.0:3030".to_string(),
        }
    }
}

impl CrawlerConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// File if it exists, defaults otherwise, then environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) if p.exists() => Self::load(p)?,
            Some(p) => {
                tracing::warn!(path = %p.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        cfg.apply_env();
        cfg
    }

    /// Override fields from `CRAWLER_*` environment variables.
    /// Unparseable values are ignored.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse("CRAWLER_RING_CAPACITY") {
            self.market.ring_capacity = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_INTERVALS") {
            self.market.intervals = split_list(&v);
        }
        if let Ok(v) = std::env::var("CRAWLER_SETTLEMENT_ASSET") {
            self.market.settlement_asset = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_DENY_LIST") {
            self.market.deny_list = split_list(&v);
        }
        if let Some(v) = env_parse("CRAWLER_SHARD_COUNT") {
            self.market.shard_count = v;
        }

        if let Some(v) = env_parse("CRAWLER_HISTORY_LIMIT") {
            self.ingest.history_limit = v;
        }
        if let Some(v) = env_parse("CRAWLER_FETCH_PACING_MS") {
            self.ingest.fetch_pacing_ms = v;
        }
        if let Some(v) = env_parse("CRAWLER_FETCH_TIMEOUT_SECS") {
            self.ingest.fetch_timeout_secs = v;
        }
        if let Some(v) = env_parse("CRAWLER_RETRY_COOLDOWN_THRESHOLD") {
            self.ingest.retry_cooldown_threshold = v;
        }
        if let Some(v) = env_parse("CRAWLER_RETRY_COOLDOWN_SECS") {
            self.ingest.retry_cooldown_secs = v;
        }
        if let Some(v) = env_parse("CRAWLER_RETRY_DELAY_MS") {
            self.ingest.retry_delay_ms = v;
        }
        if let Some(v) = env_parse("CRAWLER_RETRY_QUEUE_CAPACITY") {
            self.ingest.retry_queue_capacity = v;
        }
        if let Some(v) = env_parse("CRAWLER_RATE_LIMIT_REQUESTS") {
            self.ingest.rate_limit_requests = v;
        }
        if let Some(v) = env_parse("CRAWLER_RATE_LIMIT_WINDOW_SECS") {
            self.ingest.rate_limit_window_secs = v;
        }
        if let Some(v) = env_parse("CRAWLER_SUBSCRIBE_STAGGER_MS") {
            self.ingest.subscribe_stagger_ms = v;
        }
        if let Some(v) = env_parse("CRAWLER_DIRECTORY_REFRESH_SECS") {
            self.ingest.directory_refresh_secs = v;
        }
        if let Some(v) = env_parse("CRAWLER_PUBLISH_INTERVAL_SECS") {
            self.ingest.publish_interval_secs = v;
        }

        if let Ok(v) = std::env::var("CRAWLER_REST_URL") {
            self.feed.rest_url = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_WS_URL") {
            self.feed.ws_url = v;
        }
        if let Some(v) = env_parse("CRAWLER_MAX_STREAMS_PER_CONNECTION") {
            self.feed.max_streams_per_connection = v;
        }

        if let Some(v) = env_parse("CRAWLER_API_ENABLED") {
            self.api.enabled = v;
        }
        if let Ok(v) = std::env::var("CRAWLER_LISTEN_ADDR") {
            self.api.listen_addr = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.market.ring_capacity == 0 {
            bail!("market.ring_capacity must be > 0");
        }
        if self.market.intervals.is_empty() {
            bail!("market.intervals must not be empty");
        }
        if self.market.settlement_asset.is_empty() {
            bail!("market.settlement_asset must not be empty");
        }
        if self.ingest.history_limit == 0 {
            bail!("ingest.history_limit must be > 0");
        }
        if self.ingest.rate_limit_requests == 0 || self.ingest.rate_limit_window_secs == 0 {
            bail!("ingest rate limit must admit at least one request per non-empty window");
        }
        if self.ingest.retry_queue_capacity == 0 {
            bail!("ingest.retry_queue_capacity must be > 0");
        }
        if self.ingest.fetch_timeout_secs == 0 {
            bail!("ingest.fetch_timeout_secs must be > 0");
        }
        if self.ingest.publish_buffer == 0 {
            bail!("ingest.publish_buffer must be > 0");
        }
        if self.feed.max_streams_per_connection == 0 {
            bail!("feed.max_streams_per_connection must be > 0");
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
