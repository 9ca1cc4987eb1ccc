use anyhow::Context;
use serde::Deserialize;
use std::{env, fs, path::Path, path::PathBuf};

/// Server configuration loaded from TOML file
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default)]
    pub auth: AuthSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

/// Network settings for the HTTP server
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    /// Host/interface to bind to, e.g. "127.0.0.1"
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on, e.g. 3000
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Token validation settings
#[derive(Debug, Deserialize, Clone)]
pub struct AuthSettings {
    /// Shared secret for validating bearer tokens issued by the identity
    /// provider
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,
}

/// Database location
#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    /// Directory holding the progress database
    pub data_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_jwt_secret() -> String {
    "tally-jwt-demo-secret-goes-here".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        ServerSettings {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for AuthSettings {
    fn default() -> Self {
        AuthSettings {
            jwt_secret: default_jwt_secret(),
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        StorageSettings { data_dir: None }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            server: ServerSettings::default(),
            auth: AuthSettings::default(),
            storage: StorageSettings::default(),
        }
    }
}

impl Settings {
    /// Load and parse the configuration from the given TOML file path.
    /// A missing file yields the defaults.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Settings::default());
        }
        let data = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let settings: Settings = toml::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(settings)
    }

    /// Resolve the SQLite database file, honoring the TALLY_DB environment
    /// variable over the configured data directory.
    pub fn database_path(&self) -> anyhow::Result<PathBuf> {
        if let Ok(file) = env::var("TALLY_DB") {
            let trimmed = file.trim();
            if !trimmed.is_empty() {
                return Ok(PathBuf::from(trimmed));
            }
        }
        let dir = match &self.storage.data_dir {
            Some(d) => d.clone(),
            None => dirs::data_dir()
                .context("cannot determine data directory")?
                .join("tally"),
        };
        Ok(dir.join("progress.db"))
    }
}
