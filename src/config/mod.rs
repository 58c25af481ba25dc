//! Configuration management for the Nimbus CLI
//!
//! Handles loading, validating, and persisting the service URL, the session
//! token and the engine knobs injected into [`crate::client::Client`].

use crate::client::{ClientSettings, WireLog};
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod auth;
pub mod defaults;

pub use auth::AuthConfig;
pub use defaults::*;

type Result<T> = std::result::Result<T, ConfigError>;

/// Environment variable overriding [`Config::url`]
pub const URL_ENV: &str = "NIMBUS_URL";

/// Environment variable overriding the configured token
pub const TOKEN_ENV: &str = "NIMBUS_TOKEN";

/// Main CLI configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Service base URL
    #[serde(default = "defaults::default_url")]
    pub url: String,

    /// Authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Wait budget for a not-ready response, in seconds
    #[serde(default = "defaults::default_timeout")]
    pub timeout_secs: u64,

    /// Connections per pool key; the pool default when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pool_size: Option<usize>,

    /// Cap for the adaptive thread limit
    #[serde(default = "defaults::default_max_threads")]
    pub max_threads: usize,

    /// Log `X-Auth-Token` values
    #[serde(default)]
    pub log_token: bool,

    /// Log request and response bodies
    #[serde(default)]
    pub log_data: bool,

    /// Write logs to this file instead of stderr
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

impl Config {
    /// Load configuration from default location
    ///
    /// Tries in order:
    /// 1. `XDG_CONFIG_HOME/nimbus/config.toml`
    /// 2. `~/.config/nimbus/config.toml`
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable or malformed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            return Err(ConfigError::NoConfig(path));
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the file is unreadable or malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| ConfigError::ConfigRead {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        toml::from_str(&contents).map_err(|e| ConfigError::InvalidConfig(e.to_string()))
    }

    /// Load from `path` (or the default location), falling back to defaults
    /// when the file does not exist
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file is unreadable or malformed.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::config_path()?,
        };
        if path.exists() {
            Self::load_from(&path)
        } else {
            tracing::debug!(target: "nimbus::client", "no config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save configuration to default location
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save(&self) -> Result<()> {
        let path = Self::config_path()?;
        self.save_to(&path)
    }

    /// Save configuration to a specific path
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| ConfigError::ConfigWrite {
                path: parent.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        let contents =
            toml::to_string_pretty(self).map_err(|e| ConfigError::InvalidConfig(e.to_string()))?;

        fs::write(path, contents).map_err(|e| ConfigError::ConfigWrite {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // Config file holds the session token
        #[cfg(unix)]
        {
            use std::fs::Permissions;
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, Permissions::from_mode(0o600)).map_err(|e| {
                ConfigError::ConfigWrite {
                    path: path.to_path_buf(),
                    reason: format!("Failed to set permissions: {e}"),
                }
            })?;
        }

        Ok(())
    }

    /// Get the path to the config file
    ///
    /// # Errors
    ///
    /// Returns an error if neither `XDG_CONFIG_HOME` nor a home directory is available.
    pub fn config_path() -> Result<PathBuf> {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .filter(|path| !path.is_empty())
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|home| home.join(".config")))
            .map(|path| path.join("nimbus").join("config.toml"))
            .ok_or(ConfigError::NoConfigDir)
    }

    /// Apply `NIMBUS_URL` / `NIMBUS_TOKEN` from the process environment
    pub fn apply_env(&mut self) {
        self.apply_env_from(|name| std::env::var(name).ok());
    }

    /// Apply URL/token overrides from `lookup`; empty values are ignored
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup(URL_ENV).filter(|url| !url.is_empty()) {
            self.url = url;
        }
        if let Some(token) = lookup(TOKEN_ENV).filter(|token| !token.is_empty()) {
            self.auth.token = token;
        }
    }

    /// Merge another config into this one, with other taking precedence
    pub fn merge(&mut self, other: &Self) {
        if !other.auth.token.is_empty() {
            self.auth.token.clone_from(&other.auth.token);
        }
        if other.url != default_url() {
            self.url.clone_from(&other.url);
        }
        if other.timeout_secs != default_timeout() {
            self.timeout_secs = other.timeout_secs;
        }
        if other.pool_size.is_some() {
            self.pool_size = other.pool_size;
        }
        if other.max_threads != default_max_threads() {
            self.max_threads = other.max_threads;
        }
        if other.log_token {
            self.log_token = true;
        }
        if other.log_data {
            self.log_data = true;
        }
        if other.log_file.is_some() {
            self.log_file.clone_from(&other.log_file);
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidConfig`] naming the first bad field.
    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("url cannot be empty".to_string()));
        }

        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.pool_size == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "pool_size must be greater than 0".to_string(),
            ));
        }

        if self.max_threads == 0 {
            return Err(ConfigError::InvalidConfig(
                "max_threads must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Engine settings derived from this config
    pub const fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            timeout: Duration::from_secs(self.timeout_secs),
            pool_size: self.pool_size,
            max_threads: self.max_threads,
            wire_log: WireLog {
                log_token: self.log_token,
                log_data: self.log_data,
            },
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            url: default_url(),
            auth: AuthConfig::default(),
            timeout_secs: default_timeout(),
            pool_size: None,
            max_threads: default_max_threads(),
            log_token: false,
            log_data: false,
            log_file: None,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.url, "http://127.0.0.1/");
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.max_threads, 7);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zeroes() {
        let mut config = Config::default();
        config.url = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool_size = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.max_threads = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = Config::default();
        config.url = "https://compute.example.com/v2".to_string();
        config.auth.token = "tok".to_string();
        config.pool_size = Some(3);
        config.log_data = true;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded, config);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "url = \"https://svc\"\n[auth]\ntoken = \"abc\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.url, "https://svc");
        assert_eq!(config.auth.token, "abc");
        assert_eq!(config.timeout_secs, 60);
        assert_eq!(config.pool_size, None);
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "timeout_secs = \"soon\"").unwrap();

        assert!(matches!(
            Config::load_from(&path),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.toml");
        let config = Config::load_or_default(Some(missing.as_path())).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [(URL_ENV, "https://env"), (TOKEN_ENV, "")].into();
        let mut config = Config::default();
        config.auth.token = "from-file".to_string();

        config.apply_env_from(|name| env.get(name).map(ToString::to_string));
        assert_eq!(config.url, "https://env");
        assert_eq!(config.auth.token, "from-file");
    }

    #[test]
    fn test_merge_prefers_other() {
        let mut base = Config::default();
        base.auth.token = "old".to_string();
        let mut other = Config::default();
        other.url = "https://other".to_string();
        other.max_threads = 3;

        base.merge(&other);
        assert_eq!(base.url, "https://other");
        assert_eq!(base.auth.token, "old");
        assert_eq!(base.max_threads, 3);
        assert_eq!(base.timeout_secs, 60);
    }

    #[test]
    fn test_client_settings() {
        let mut config = Config::default();
        config.timeout_secs = 5;
        config.log_token = true;

        let settings = config.client_settings();
        assert_eq!(settings.timeout, Duration::from_secs(5));
        assert_eq!(settings.max_threads, 7);
        assert!(settings.wire_log.log_token);
        assert!(!settings.wire_log.log_data);
    }
}
