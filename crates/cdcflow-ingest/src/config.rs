//! Pipeline configuration
//!
//! Values come from, in increasing precedence: built-in defaults, an optional TOML
//! file, and `CDCFLOW_*` environment variables.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::importer::AckMode;
use crate::ratelimit::{RateLimitConfig, RateLimitKind};

pub const DEFAULT_CHANNEL_CAPACITY: usize = 2000;
pub const DEFAULT_CONSUMER_CONCURRENCY: usize = 1;
pub const DEFAULT_IMPORTER_BATCH_SIZE: usize = 1000;
pub const DEFAULT_IMPORTER_FETCH_TIMEOUT: u64 = 100;
pub const DEFAULT_IMPORTER_MAX_PENDING_ACKS: usize = 64;

/// Unit of [`ImporterConfig::fetch_timeout`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    #[default]
    Milliseconds,
    Seconds,
}

impl TimeUnit {
    pub fn duration(&self, amount: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
        }
    }
}

impl FromStr for TimeUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ms" | "millis" | "milliseconds" => Ok(TimeUnit::Milliseconds),
            "s" | "secs" | "seconds" => Ok(TimeUnit::Seconds),
            _ => Err(format!("Invalid time unit: {}", s)),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeUnit::Milliseconds => write!(f, "milliseconds"),
            TimeUnit::Seconds => write!(f, "seconds"),
        }
    }
}

/// Channel settings, applied to every task's channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Buffered batches per channel (per sub-channel when multiplexed)
    pub capacity: usize,
    /// Parallel consumers per task; more than one multiplexes the channel
    pub consumer_concurrency: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CHANNEL_CAPACITY,
            consumer_concurrency: DEFAULT_CONSUMER_CONCURRENCY,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImporterConfig {
    pub batch_size: usize,
    pub fetch_timeout: u64,
    pub fetch_timeout_unit: TimeUnit,
    /// Recover global commit order from record csns
    pub sorted: bool,
    pub ack_mode: AckMode,
    /// Unacknowledged batches an importer may hold before its writes block
    pub max_pending_acks: usize,
}

impl Default for ImporterConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_IMPORTER_BATCH_SIZE,
            fetch_timeout: DEFAULT_IMPORTER_FETCH_TIMEOUT,
            fetch_timeout_unit: TimeUnit::default(),
            sorted: false,
            ack_mode: AckMode::default(),
            max_pending_acks: DEFAULT_IMPORTER_MAX_PENDING_ACKS,
        }
    }
}

impl ImporterConfig {
    pub fn fetch_timeout_duration(&self) -> Duration {
        self.fetch_timeout_unit.duration(self.fetch_timeout)
    }
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub channel: ChannelConfig,
    pub importer: ImporterConfig,
    pub rate_limit: Option<RateLimitConfig>,
}

impl PipelineConfig {
    /// Defaults overridden by environment variables
    pub fn from_env() -> Result<Self> {
        Self::default().merge_env()
    }

    /// Load a TOML file, then apply environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.merge_env()
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields with any `CDCFLOW_*` environment variable that is set.
    pub fn merge_env(mut self) -> Result<Self> {
        if let Some(capacity) = env_var("CDCFLOW_CHANNEL_CAPACITY")? {
            self.channel.capacity = capacity;
        }
        if let Some(concurrency) = env_var("CDCFLOW_CONSUMER_CONCURRENCY")? {
            self.channel.consumer_concurrency = concurrency;
        }
        if let Some(batch_size) = env_var("CDCFLOW_IMPORTER_BATCH_SIZE")? {
            self.importer.batch_size = batch_size;
        }
        if let Some(timeout) = env_var("CDCFLOW_IMPORTER_FETCH_TIMEOUT")? {
            self.importer.fetch_timeout = timeout;
        }
        if let Some(unit) = env_var("CDCFLOW_IMPORTER_FETCH_TIMEOUT_UNIT")? {
            self.importer.fetch_timeout_unit = unit;
        }
        if let Some(sorted) = env_var("CDCFLOW_IMPORTER_SORTED")? {
            self.importer.sorted = sorted;
        }
        if let Some(ack_mode) = env_var("CDCFLOW_IMPORTER_ACK_MODE")? {
            self.importer.ack_mode = ack_mode;
        }
        if let Some(max_pending) = env_var("CDCFLOW_IMPORTER_MAX_PENDING_ACKS")? {
            self.importer.max_pending_acks = max_pending;
        }

        let kind: Option<RateLimitKind> = env_var("CDCFLOW_RATE_LIMIT_KIND")?;
        let permits: Option<u32> = env_var("CDCFLOW_RATE_LIMIT_PERMITS")?;
        match (kind, permits) {
            (Some(kind), Some(permits)) => {
                self.rate_limit = Some(RateLimitConfig::new(kind, permits));
            },
            (Some(kind), None) => match self.rate_limit.as_mut() {
                Some(rate_limit) => rate_limit.kind = kind,
                None => anyhow::bail!("CDCFLOW_RATE_LIMIT_KIND requires CDCFLOW_RATE_LIMIT_PERMITS"),
            },
            (None, Some(permits)) => match self.rate_limit.as_mut() {
                Some(rate_limit) => rate_limit.permits_per_second = permits,
                None => anyhow::bail!("CDCFLOW_RATE_LIMIT_PERMITS requires CDCFLOW_RATE_LIMIT_KIND"),
            },
            (None, None) => {},
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channel.capacity == 0 {
            anyhow::bail!("channel.capacity must be greater than 0");
        }
        if self.channel.consumer_concurrency == 0 {
            anyhow::bail!("channel.consumer_concurrency must be greater than 0");
        }
        if self.importer.batch_size == 0 {
            anyhow::bail!("importer.batch_size must be greater than 0");
        }
        if self.importer.sorted && self.importer.fetch_timeout == 0 {
            anyhow::bail!("importer.fetch_timeout must be greater than 0 in sorted mode");
        }
        if self.importer.max_pending_acks == 0 {
            anyhow::bail!("importer.max_pending_acks must be greater than 0");
        }
        if let Some(rate_limit) = &self.rate_limit {
            if rate_limit.permits_per_second == 0 {
                anyhow::bail!("rate_limit.permits_per_second must be greater than 0");
            }
        }
        Ok(())
    }
}

/// Parse an environment variable if it is set
fn env_var<T>(key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("Invalid {}={:?}: {}", key, raw, e)),
        Err(_) => Ok(None),
    }
}
