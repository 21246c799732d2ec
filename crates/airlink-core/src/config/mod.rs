//! Configuration management for AirLink.
//!
//! Configuration is layered: defaults, then the TOML file in the platform
//! config directory, then the `HOST`/`PORT` environment variables, then any
//! command-line overrides applied by the CLI.
//!
//! ## Configuration File Locations
//!
//! | Platform | Path |
//! |----------|------|
//! | Linux | `~/.config/airlink/config.toml` |
//! | macOS | `~/Library/Application Support/AirLink/config.toml` |
//! | Windows | `%APPDATA%\AirLink\config.toml` |
//!
//! ## Example
//!
//! ```rust,ignore
//! use airlink_core::config::Config;
//!
//! let config = Config::load()?.with_env_overrides()?;
//! println!("Listening on {}", config.server.bind_addr());
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Main configuration struct for AirLink.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// HTTP listener settings
    pub server: ServerConfig,
    /// Transfer engine settings
    pub transfer: TransferConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port to listen on
    pub port: u16,
    /// Bind to localhost only
    pub localhost_only: bool,
    /// Host advertised in download URLs (auto-detected LAN address if unset)
    pub public_host: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: crate::DEFAULT_PORT,
            localhost_only: false,
            public_host: None,
        }
    }
}

impl ServerConfig {
    /// Get the bind address for the server.
    #[must_use]
    pub fn bind_addr(&self) -> SocketAddr {
        if self.localhost_only {
            SocketAddr::from(([127, 0, 0, 1], self.port))
        } else {
            SocketAddr::from(([0, 0, 0, 0], self.port))
        }
    }
}

/// Transfer engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Bytes read per iteration when ingesting or streaming
    pub chunk_size: usize,
    /// Payload bytes held in memory before spilling to a temp file
    pub spool_threshold: usize,
    /// Minimum gap between two progress events for one recipient
    #[serde(with = "humantime_serde")]
    pub progress_interval: Duration,
    /// Longest a paused stream sleeps before re-checking its flags
    #[serde(with = "humantime_serde")]
    pub pause_recheck: Duration,
    /// Registered transfers allowed at once
    pub max_pending_transfers: usize,
    /// Age after which an unclaimed transfer is evicted
    #[serde(with = "humantime_serde")]
    pub transfer_ttl: Duration,
    /// How often the eviction janitor runs
    #[serde(with = "humantime_serde")]
    pub janitor_interval: Duration,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: crate::DEFAULT_CHUNK_SIZE,
            spool_threshold: crate::DEFAULT_SPOOL_THRESHOLD,
            progress_interval: crate::PROGRESS_INTERVAL,
            pause_recheck: Duration::from_millis(100),
            max_pending_transfers: 64,
            transfer_ttl: Duration::from_secs(60 * 60),
            janitor_interval: Duration::from_secs(60),
        }
    }
}

impl Config {
    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    /// Load configuration from `path`, or defaults if it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigError(format!("Failed to read config: {e}")))?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| Error::ConfigError(format!("Failed to parse config: {e}")))
    }

    /// Save configuration to the default location.
    ///
    /// Creates the configuration directory if it doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration cannot be written.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path())
    }

    /// Save configuration to `path`, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                Error::ConfigError(format!("Failed to create config directory: {e}"))
            })?;
        }

        let content = self.to_toml()?;

        std::fs::write(path, content)
            .map_err(|e| Error::ConfigError(format!("Failed to write config: {e}")))
    }

    /// Render the configuration as pretty TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| Error::ConfigError(format!("Failed to serialize config: {e}")))
    }

    /// Apply the `HOST` and `PORT` environment variables.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply `HOST`/`PORT` overrides read through `lookup`.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup("HOST").filter(|h| !h.trim().is_empty()) {
            self.server.public_host = Some(host.trim().to_string());
        }

        if let Some(port) = lookup("PORT") {
            self.server.port = port.trim().parse().map_err(|_| Error::InvalidConfig {
                key: "PORT".to_string(),
                reason: format!("'{port}' is not a valid port"),
            })?;
        }

        Ok(self)
    }

    /// Reject values the transfer engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        let t = &self.transfer;

        if t.chunk_size == 0 {
            return Err(invalid("transfer.chunk_size", "must be greater than zero"));
        }
        if t.max_pending_transfers == 0 {
            return Err(invalid(
                "transfer.max_pending_transfers",
                "must be greater than zero",
            ));
        }

        for (key, value) in [
            ("transfer.progress_interval", t.progress_interval),
            ("transfer.pause_recheck", t.pause_recheck),
            ("transfer.transfer_ttl", t.transfer_ttl),
            ("transfer.janitor_interval", t.janitor_interval),
        ] {
            if value.is_zero() {
                return Err(invalid(key, "must be a non-zero duration"));
            }
        }

        Ok(())
    }

    /// Get the default configuration directory path.
    #[must_use]
    pub fn config_dir() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "airlink", "AirLink")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the full path to the configuration file.
    #[must_use]
    pub fn config_path() -> PathBuf {
        Self::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("config.toml")
    }
}

fn invalid(key: &str, reason: &str) -> Error {
    Error::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }

    pub(super) fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let (digits, scale_ms) = if let Some(v) = s.strip_suffix("ms") {
            (v, 1)
        } else if let Some(v) = s.strip_suffix('s') {
            (v, 1_000)
        } else if let Some(v) = s.strip_suffix('m') {
            (v, 60_000)
        } else if let Some(v) = s.strip_suffix('h') {
            (v, 3_600_000)
        } else {
            return Err(format!("invalid duration format: '{s}'"));
        };

        let n = digits
            .trim()
            .parse::<u64>()
            .map_err(|e| format!("invalid duration '{s}': {e}"))?;

        n.checked_mul(scale_ms)
            .map(Duration::from_millis)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_config_default() {
        let config = Config::default();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transfer.chunk_size, 256 * 1024);
        assert_eq!(config.transfer.progress_interval, Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_roundtrip() {
        let mut original = Config::default();
        original.server.port = 9090;
        original.server.public_host = Some("192.168.1.20".to_string());
        original.transfer.chunk_size = 64 * 1024;
        original.transfer.pause_recheck = Duration::from_millis(50);

        let content = original.to_toml().expect("serialize");
        let loaded = Config::from_toml(&content).expect("parse");

        assert_eq!(loaded.server.port, 9090);
        assert_eq!(loaded.server.public_host.as_deref(), Some("192.168.1.20"));
        assert_eq!(loaded.transfer.chunk_size, 64 * 1024);
        assert_eq!(loaded.transfer.pause_recheck, Duration::from_millis(50));
    }

    #[test]
    fn test_config_deserialization_partial() {
        let partial_toml = r#"
[transfer]
transfer_ttl = "2h"
progress_interval = "500ms"
"#;

        let config = Config::from_toml(partial_toml).expect("parse partial config");

        assert_eq!(config.transfer.transfer_ttl, Duration::from_secs(7200));
        assert_eq!(config.transfer.progress_interval, Duration::from_millis(500));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.transfer.chunk_size, crate::DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_duration_parse() {
        assert_eq!(humantime_serde::parse("250ms"), Ok(Duration::from_millis(250)));
        assert_eq!(humantime_serde::parse("30s"), Ok(Duration::from_secs(30)));
        assert_eq!(humantime_serde::parse("5m"), Ok(Duration::from_secs(300)));
        assert_eq!(humantime_serde::parse("1h"), Ok(Duration::from_secs(3600)));
        assert!(humantime_serde::parse("soon").is_err());
        assert!(humantime_serde::parse("xs").is_err());
    }

    #[test]
    fn test_duration_parse_overflow() {
        assert!(humantime_serde::parse("99999999999999999h").is_err());
        assert!(humantime_serde::parse(&format!("{}ms", u64::MAX)).is_ok());

        let result = Config::from_toml("[transfer]\ntransfer_ttl = \"99999999999999999h\"\n");
        assert!(matches!(result, Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [("HOST", "10.0.0.5"), ("PORT", "9000")].into();
        let config = Config::default()
            .with_overrides_from(|k| env.get(k).map(ToString::to_string))
            .expect("overrides");

        assert_eq!(config.server.public_host.as_deref(), Some("10.0.0.5"));
        assert_eq!(config.server.port, 9000);
    }

    #[test]
    fn test_env_override_bad_port() {
        let result = Config::default().with_overrides_from(|k| {
            (k == "PORT").then(|| "eighty".to_string())
        });

        assert!(matches!(result, Err(Error::InvalidConfig { ref key, .. }) if key == "PORT"));
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut config = Config::default();
        config.transfer.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.transfer.pause_recheck = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bind_addr() {
        let mut server = ServerConfig::default();
        assert_eq!(server.bind_addr().to_string(), "0.0.0.0:8080");

        server.localhost_only = true;
        assert_eq!(server.bind_addr().to_string(), "127.0.0.1:8080");
    }

    #[test]
    fn test_save_and_load_from_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("config.toml");

        assert_eq!(Config::load_from(&path).unwrap().server.port, 8080);

        let mut config = Config::default();
        config.transfer.max_pending_transfers = 8;
        config.save_to(&path).expect("save");

        let loaded = Config::load_from(&path).expect("load");
        assert_eq!(loaded.transfer.max_pending_transfers, 8);
    }

    #[test]
    fn test_load_from_malformed_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server\nport = ").unwrap();

        assert!(matches!(Config::load_from(&path), Err(Error::ConfigError(_))));
    }

    #[test]
    fn test_config_path() {
        assert!(Config::config_path().ends_with("config.toml"));
    }
}
