//! Application configuration management.
//!
//! Configuration is stored at `~/.config/crowdcache/config.json`. A missing
//! file means defaults. `CROWDCACHE_API_URL` and `CROWDCACHE_DATA_DIR`
//! override the file after loading.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::client::{DEFAULT_API_BASE_URL, REQUEST_TIMEOUT_SECS};
use crate::cache::DEFAULT_MAX_CACHED;
use crate::collector::{CollectorSettings, DEFAULT_BATCH_SIZE, DEFAULT_INTERVAL_SECS};
use crate::coordinator::DEFAULT_REQUEST_DELAY_MS;

/// Application name used for config/cache directory paths
const APP_NAME: &str = "crowdcache";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const ENV_API_URL: &str = "CROWDCACHE_API_URL";
pub const ENV_DATA_DIR: &str = "CROWDCACHE_DATA_DIR";

/// Offset of the city's local time from UTC (KST).
const DEFAULT_UTC_OFFSET_HOURS: i32 = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    /// Where cached snapshots live. Defaults to the platform cache directory.
    pub data_dir: Option<PathBuf>,
    pub request_timeout_secs: u64,
    /// Pause between two upstream requests.
    pub request_delay_ms: u64,
    pub collector_interval_secs: u64,
    pub collector_batch_size: usize,
    pub max_cached: usize,
    /// Local time offset used for peak-hour decisions.
    pub utc_offset_hours: i32,
    pub log_to_file: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            data_dir: None,
            request_timeout_secs: REQUEST_TIMEOUT_SECS,
            request_delay_ms: DEFAULT_REQUEST_DELAY_MS,
            collector_interval_secs: DEFAULT_INTERVAL_SECS,
            collector_batch_size: DEFAULT_BATCH_SIZE,
            max_cached: DEFAULT_MAX_CACHED,
            utc_offset_hours: DEFAULT_UTC_OFFSET_HOURS,
            log_to_file: false,
        }
    }
}

impl Config {
    /// Load from the default location and apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(std::env::var(ENV_API_URL).ok(), std::env::var(ENV_DATA_DIR).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            serde_json::from_str(&contents).with_context(|| format!("Invalid config: {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn apply_overrides(&mut self, api_url: Option<String>, data_dir: Option<String>) {
        if let Some(url) = api_url.filter(|u| !u.trim().is_empty()) {
            debug!(url = %url, "API base URL overridden from environment");
            self.api_base_url = url.trim().to_string();
        }
        if let Some(dir) = data_dir.filter(|d| !d.trim().is_empty()) {
            self.data_dir = Some(PathBuf::from(dir.trim()));
        }
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding cached snapshots and dashboard state.
    pub fn cache_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Directory for rolling log files.
    pub fn log_dir(&self) -> Result<PathBuf> {
        Ok(self.cache_dir()?.join("logs"))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn request_delay(&self) -> Duration {
        Duration::from_millis(self.request_delay_ms)
    }

    pub fn collector_settings(&self) -> CollectorSettings {
        CollectorSettings {
            batch_size: self.collector_batch_size.max(1),
            interval: Duration::from_secs(self.collector_interval_secs),
            fetch_timeout: self.request_timeout(),
            ..CollectorSettings::default()
        }
    }

    /// The configured offset, falling back to KST when out of range.
    pub fn local_offset(&self) -> FixedOffset {
        [self.utc_offset_hours, DEFAULT_UTC_OFFSET_HOURS]
            .into_iter()
            .find_map(|hours| hours.checked_mul(3600).and_then(FixedOffset::east_opt))
            .unwrap_or_else(|| Utc.fix())
    }
}
