//! Configuration management for riverpost
//!
//! Every service reads the same `riverpost.toml`. All sections and fields are
//! optional; anything left out falls back to the defaults below. Durations
//! are written the human way (`"10m"`, `"72h"`) and parsed with `humantime`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, Result};

/// File name looked up inside a configuration directory
pub const CONFIG_FILE_NAME: &str = "riverpost.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub store: StoreConfig,
    pub poller: PollerConfig,
    pub publisher: PublisherConfig,
    pub queue: QueueConfig,
    pub misc: MiscConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: "~/.local/share/riverpost/river.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollerConfig {
    /// Master tick when nothing arrives on its channels
    #[serde(with = "duration_str")]
    pub period: Duration,
    /// Batch size above which the master starts another worker
    pub gid_set_threshold: usize,
    pub workers_min: usize,
    pub workers_max: usize,
    /// Delay before an account is polled again
    #[serde(with = "duration_str")]
    pub poll_interval: Duration,
    /// Extra delay for accounts that are quiet around this time of day
    #[serde(with = "duration_str")]
    pub no_poll_interval: Duration,
    #[serde(with = "duration_str")]
    pub orphan_timeout: Duration,
    /// Half-width of the time-of-day window checked for recent activity, in minutes
    pub activity_spread_min: u32,
    pub batch_limit: usize,
    pub max_results: u32,
    #[serde(with = "duration_str")]
    pub join_timeout: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(2),
            gid_set_threshold: 100,
            workers_min: 3,
            workers_max: 4,
            poll_interval: Duration::from_secs(600),
            no_poll_interval: Duration::from_secs(1800),
            orphan_timeout: Duration::from_secs(3600),
            activity_spread_min: 90,
            batch_limit: 200,
            max_results: 10,
            join_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub max_error_count: u32,
    pub warn_error_count: u32,
    /// Default minimum spacing between two posts to one destination, in minutes
    pub min_time_space_min: i64,
    #[serde(with = "duration_str")]
    pub review_window: Duration,
    /// Delay before picking up the next pending item of a link
    #[serde(with = "duration_str")]
    pub batch_continue: Duration,
    pub max_message_map: usize,
    #[serde(with = "duration_str")]
    pub period: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            max_error_count: 7,
            warn_error_count: 2,
            min_time_space_min: 5,
            review_window: Duration::from_secs(72 * 3600),
            batch_continue: Duration::from_secs(60),
            max_message_map: 128,
            period: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    #[serde(with = "duration_str")]
    pub period: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MiscConfig {
    #[serde(with = "duration_str")]
    pub period: Duration,
    pub workers_min: usize,
    pub workers_max: usize,
}

impl Default for MiscConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5),
            workers_min: 1,
            workers_max: 1,
        }
    }
}

impl Config {
    /// Load configuration from the default location
    ///
    /// A missing file is not an error: the defaults are returned instead.
    pub fn load() -> Result<Self> {
        let config_path = resolve_config_path(None)?;
        Self::load_or_default(&config_path)
    }

    /// Load configuration from a configuration directory (the `--config-path` flag)
    pub fn load_from_dir(dir: &str) -> Result<Self> {
        let config_path = resolve_config_path(Some(dir))?;
        Self::load_or_default(&config_path)
    }

    /// Load configuration from a specific file
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(ConfigError::ReadError)?;
        let config: Config = toml::from_str(&content).map_err(ConfigError::ParseError)?;
        config.validate()?;
        Ok(config)
    }

    fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_path(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Check cross-field constraints that serde cannot express
    pub fn validate(&self) -> Result<()> {
        check_pool("poller", self.poller.workers_min, self.poller.workers_max)?;
        check_pool("misc", self.misc.workers_min, self.misc.workers_max)?;

        if self.publisher.warn_error_count >= self.publisher.max_error_count {
            return Err(ConfigError::InvalidValue {
                field: "publisher.warn_error_count".to_string(),
                reason: "must be below max_error_count".to_string(),
            }
            .into());
        }
        if self.poller.poll_interval <= self.poller.period / 2 {
            return Err(ConfigError::InvalidValue {
                field: "poller.poll_interval".to_string(),
                reason: "must be longer than half of poller.period".to_string(),
            }
            .into());
        }
        if self.poller.batch_limit == 0 {
            return Err(ConfigError::InvalidValue {
                field: "poller.batch_limit".to_string(),
                reason: "must be positive".to_string(),
            }
            .into());
        }
        if self.poller.activity_spread_min >= 720 {
            return Err(ConfigError::InvalidValue {
                field: "poller.activity_spread_min".to_string(),
                reason: "must be below 720 minutes".to_string(),
            }
            .into());
        }
        Ok(())
    }

    /// Store path with `~` expanded
    pub fn store_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.store.path).to_string())
    }
}

fn check_pool(section: &str, min: usize, max: usize) -> Result<()> {
    if max < min {
        return Err(ConfigError::InvalidValue {
            field: format!("{}.workers_max", section),
            reason: format!("{} is below workers_min {}", max, min),
        }
        .into());
    }
    Ok(())
}

/// Resolve the configuration file path following XDG Base Directory spec
///
/// Order: explicit directory, `RIVERPOST_CONFIG` (a file path), then
/// `<config_dir>/riverpost/riverpost.toml`.
pub fn resolve_config_path(dir: Option<&str>) -> Result<PathBuf> {
    if let Some(dir) = dir {
        return Ok(PathBuf::from(shellexpand::tilde(dir).to_string()).join(CONFIG_FILE_NAME));
    }

    if let Ok(path) = std::env::var("RIVERPOST_CONFIG") {
        return Ok(PathBuf::from(shellexpand::tilde(&path).to_string()));
    }

    let config_dir = dirs::config_dir()
        .ok_or_else(|| ConfigError::MissingField("config directory".to_string()))?;

    Ok(config_dir.join("riverpost").join(CONFIG_FILE_NAME))
}

/// Resolve the data directory path following XDG Base Directory spec
pub fn resolve_data_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
        .ok_or_else(|| ConfigError::MissingField("data directory".to_string()))?;

    Ok(data_dir.join("riverpost"))
}

mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}
