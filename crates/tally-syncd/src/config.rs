use anyhow::{Context, Result};
use serde::Deserialize;
use std::{fs, path::Path, path::PathBuf, time::Duration};

/// Fixed name of the persisted local cache; progress must survive a restart
/// under this key.
pub const CACHE_FILE: &str = "tally-progress-v1.db";

/// Sync daemon configuration loaded from TOML file
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncSettings {
    /// Base URL of the tally server, e.g. "http://127.0.0.1:3000".
    /// Absent means local-only mode: edits stay in the cache.
    pub server_url: Option<String>,
    /// Bearer token issued by the identity provider
    pub token: Option<String>,
    /// Seconds between background reconciliation pulls
    #[serde(default = "default_interval")]
    pub interval_seconds: u64,
    /// Debounce window that coalesces rapid edits before a drain
    #[serde(default = "default_debounce")]
    pub debounce_ms: u64,
    /// Bound on any single request so the drain loop cannot stall
    #[serde(default = "default_timeout")]
    pub request_timeout_seconds: u64,
    /// Attempts after which a stuck item is surfaced in `status` output
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSettings {
    /// Directory for the local cache database
    pub data_dir: Option<PathBuf>,
}

fn default_interval() -> u64 {
    20
}

fn default_debounce() -> u64 {
    200
}

fn default_timeout() -> u64 {
    10
}

fn default_max_attempts() -> u32 {
    8
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            server_url: None,
            token: None,
            interval_seconds: default_interval(),
            debounce_ms: default_debounce(),
            request_timeout_seconds: default_timeout(),
            max_attempts: default_max_attempts(),
        }
    }
}

impl Config {
    /// Load configuration; a missing file yields local-only defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    pub fn cache_path(&self) -> Result<PathBuf> {
        let dir = match &self.storage.data_dir {
            Some(d) => d.clone(),
            None => dirs::data_dir()
                .context("cannot determine data directory")?
                .join("tally"),
        };
        Ok(dir.join(CACHE_FILE))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.sync.debounce_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.sync.interval_seconds.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.request_timeout_seconds.max(1))
    }
}
