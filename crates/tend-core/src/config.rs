use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::queue::RetryPolicy;

/// Configuration for the tend sync daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub network: NetworkSettings,
    #[serde(default)]
    pub storage: StorageSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncSettings {
    /// Server URL (if None, runs in local-only mode)
    pub server_url: Option<String>,

    /// Bearer token sent with every API request
    pub api_token: Option<String>,

    /// Periodic sweep interval in seconds
    #[serde(default = "default_sync_interval")]
    pub interval_seconds: u64,

    /// Failures after which a mutation is moved to the dead-letter queue
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_base_backoff")]
    pub base_backoff_seconds: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_seconds: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// How long a crashed sync pass keeps other processes from syncing
    #[serde(default = "default_lease")]
    pub lease_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    #[serde(default = "default_probe_interval")]
    pub probe_interval_seconds: u64,

    /// Path appended to the server URL for reachability checks
    #[serde(default = "default_health_path")]
    pub health_path: String,

    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    /// Path to the local SQLite database
    pub database_path: Option<PathBuf>,
}

fn default_sync_interval() -> u64 {
    30 // 30 seconds
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_backoff() -> u64 {
    30
}

fn default_max_backoff() -> u64 {
    300 // 5 minutes
}

fn default_request_timeout() -> u64 {
    10
}

fn default_lease() -> u64 {
    300 // 5 minutes
}

fn default_probe_interval() -> u64 {
    15
}

fn default_health_path() -> String {
    "/api/health".to_string()
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            server_url: None,
            api_token: None,
            interval_seconds: default_sync_interval(),
            max_attempts: default_max_attempts(),
            base_backoff_seconds: default_base_backoff(),
            max_backoff_seconds: default_max_backoff(),
            request_timeout_seconds: default_request_timeout(),
            lease_seconds: default_lease(),
        }
    }
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            probe_interval_seconds: default_probe_interval(),
            health_path: default_health_path(),
            probe_timeout_seconds: default_probe_timeout(),
        }
    }
}

impl Config {
    /// Load configuration from `TEND_CONFIG` or the default location,
    /// writing a default file when none exists yet
    pub fn load() -> Result<Self> {
        if let Ok(custom_path) = std::env::var("TEND_CONFIG") {
            return Self::load_or_init(&PathBuf::from(custom_path));
        }
        Self::load_or_init(&Self::default_path()?)
    }

    /// Load from `path`, creating it with defaults if missing
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load_from(path);
        }
        let config = Self::default();
        config.save_to(path)?;
        tracing::info!("created default config at {}", path.display());
        Ok(config)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, toml_str)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// `~/.config/tend/config.toml` regardless of platform
    pub fn default_path() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home_dir.join(".config").join("tend").join("config.toml"))
    }

    /// Database path, defaulting to `~/.local/share/tend/tend.db`
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(ref path) = self.storage.database_path {
            return Ok(expand_home(path));
        }
        let home_dir = dirs::home_dir().context("Could not determine home directory")?;
        Ok(home_dir
            .join(".local")
            .join("share")
            .join("tend")
            .join("tend.db"))
    }

    pub fn server_url(&self) -> Option<&str> {
        self.sync
            .server_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .filter(|u| !u.is_empty())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.sync.max_attempts.max(1),
            base_delay: Duration::seconds(self.sync.base_backoff_seconds as i64),
            max_delay: Duration::seconds(self.sync.max_backoff_seconds as i64),
        }
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::seconds(self.sync.lease_seconds.max(1) as i64)
    }
}

/// Expand a leading `~/` to the home directory
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn partial_file_falls_back_to_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[sync]\nserver_url = \"https://api.example.com/\"\nmax_attempts = 3\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.server_url(), Some("https://api.example.com"));
        assert_eq!(config.sync.max_attempts, 3);
        assert_eq!(config.sync.interval_seconds, 30);
        assert_eq!(config.network.health_path, "/api/health");

        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.max_delay, Duration::seconds(300));
        assert_eq!(config.lease_ttl(), Duration::seconds(300));
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tend").join("config.toml");

        let config = Config::load_or_init(&path).unwrap();
        assert!(path.exists());
        assert!(config.server_url().is_none());

        let reloaded = Config::load_from(&path).unwrap();
        assert_eq!(reloaded.sync.max_backoff_seconds, 300);
    }

    #[test]
    fn explicit_database_path_wins() {
        let mut config = Config::default();
        config.storage.database_path = Some(PathBuf::from("/tmp/tend-test.db"));
        assert_eq!(
            config.database_path().unwrap(),
            PathBuf::from("/tmp/tend-test.db")
        );
    }
}
