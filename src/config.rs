//! Configuration for the synchronization engine
//!
//! Settings are read from a TOML file. Every field has a default so a missing
//! file, or a file that only overrides a few keys, still yields a usable
//! configuration.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Default name of the configuration file inside the config directory
pub const CONFIG_FILE_NAME: &str = "mailsync.toml";

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Directory holding the SQLite database and the offline stores
    pub data_dir: PathBuf,
    /// Upper bound on sibling folders whose messages sync at the same time
    pub max_concurrent_folder_syncs: usize,
    /// Download message bodies into the offline stores during sync
    pub fetch_bodies: bool,
    /// Bodies whose declared literal size exceeds this are skipped
    pub max_literal_size: u64,
    /// Default tracing filter when RUST_LOG is not set
    pub log_level: String,
    /// Idle database eviction
    pub eviction: EvictionConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            max_concurrent_folder_syncs: 4,
            fetch_bodies: true,
            max_literal_size: 32 * 1024 * 1024,
            log_level: "info".to_string(),
            eviction: EvictionConfig::default(),
        }
    }
}

/// Thresholds for closing idle per-folder databases
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// How often the eviction check runs
    pub check_interval_secs: u64,
    /// Databases unused for longer than this are candidates for closing
    pub idle_threshold_secs: u64,
    /// Databases at least this large are never closed for being idle
    pub keep_open_size_bytes: u64,
    /// Maximum number of databases left open after a check
    pub max_open_databases: usize,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            idle_threshold_secs: 3600,
            keep_open_size_bytes: 64 * 1024 * 1024,
            max_open_databases: 30,
        }
    }
}

impl EvictionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn idle_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.idle_threshold_secs.min(i64::MAX as u64) as i64)
    }
}

/// Get the default data directory (XDG compliant)
pub fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("mailsync")
}

/// Get the default location of the config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mailsync")
        .join(CONFIG_FILE_NAME)
}

impl SyncConfig {
    /// Load configuration from a file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            info!("No config file at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::from_toml(&content)?;
        debug!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        let config: SyncConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_concurrent_folder_syncs == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_folder_syncs must be at least 1".to_string(),
            ));
        }
        if self.eviction.check_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "eviction.check_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.eviction.max_open_databases == 0 {
            return Err(ConfigError::Invalid(
                "eviction.max_open_databases must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Path of the SQLite database
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("mailsync.db")
    }

    /// Directory holding the offline stores of one account
    pub fn store_dir(&self, account_id: &str) -> PathBuf {
        self.data_dir.join("stores").join(sanitize_component(account_id))
    }
}

/// Make an account id safe to use as a single path component
fn sanitize_component(component: &str) -> String {
    let sanitized: String = component
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    let sanitized = sanitized.trim().trim_matches('.').to_string();
    if sanitized.is_empty() {
        "account".to_string()
    } else {
        sanitized
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.max_concurrent_folder_syncs, 4);
        assert!(config.fetch_bodies);
        assert_eq!(config.eviction.check_interval_secs, 60);
        assert_eq!(config.eviction.max_open_databases, 30);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_override() {
        let config = SyncConfig::from_toml(
            r#"
            fetch_bodies = false

            [eviction]
            max_open_databases = 5
            "#,
        )
        .unwrap();

        assert!(!config.fetch_bodies);
        assert_eq!(config.eviction.max_open_databases, 5);
        assert_eq!(config.eviction.check_interval_secs, 60);
        assert_eq!(config.max_concurrent_folder_syncs, 4);
    }

    #[test]
    fn test_rejects_zero_interval() {
        let result = SyncConfig::from_toml(
            r#"
            [eviction]
            check_interval_secs = 0
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let config = SyncConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, SyncConfig::default());
    }

    #[test]
    fn test_round_trip_through_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);

        let mut config = SyncConfig::default();
        config.data_dir = dir.path().join("data");
        config.max_literal_size = 1024;
        fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = SyncConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_store_dir_sanitizes_account() {
        let mut config = SyncConfig::default();
        config.data_dir = PathBuf::from("/data");
        assert_eq!(
            config.store_dir("user@example.com/imap"),
            PathBuf::from("/data/stores/user@example.com_imap")
        );
    }
}
