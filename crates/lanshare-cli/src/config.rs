//! Configuration system for the lanshare CLI.

use lanshare_core::ServerConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Largest allowed `max_file_size`; its base64 payload must fit a peer's
/// 1 GiB message limit
pub const MAX_FILE_SIZE_LIMIT: u64 = 700 * 1024 * 1024;

/// lanshare configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerSection,
    /// Directory watcher configuration
    #[serde(default)]
    pub watch: WatchConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Shared folder
    #[serde(default = "default_shared_dir")]
    pub shared_dir: PathBuf,
    /// Per-send timeout in seconds
    #[serde(default = "default_send_timeout_secs")]
    pub send_timeout_secs: u64,
    /// Slowest tolerated payload write, in bytes per second
    #[serde(default = "default_min_transfer_rate")]
    pub min_transfer_rate: u64,
    /// Largest file served, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// Largest inbound message, in bytes
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
    /// Grace period for sessions on shutdown, in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,
}

/// Directory watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchConfig {
    /// Poll the shared folder for changes
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Poll interval in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

// Default values

fn default_listen_addr() -> String {
    format!("0.0.0.0:{}", lanshare_core::DEFAULT_PORT)
}

fn default_shared_dir() -> PathBuf {
    PathBuf::from(lanshare_core::DEFAULT_SHARED_DIR)
}

fn default_send_timeout_secs() -> u64 {
    10
}

fn default_min_transfer_rate() -> u64 {
    1024 * 1024 // 1 MiB/s
}

fn default_max_file_size() -> u64 {
    512 * 1024 * 1024 // 512 MiB
}

fn default_max_request_size() -> usize {
    64 * 1024 // 64 KiB
}

fn default_shutdown_timeout_secs() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            shared_dir: default_shared_dir(),
            send_timeout_secs: default_send_timeout_secs(),
            min_transfer_rate: default_min_transfer_rate(),
            max_file_size: default_max_file_size(),
            max_request_size: default_max_request_size(),
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
        }
    }
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("lanshare/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Parse listen address as `SocketAddr`
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be parsed.
    pub fn parse_listen_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.server.listen_addr.parse()?)
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        self.parse_listen_addr()?;

        if self.server.shared_dir.as_os_str().is_empty() {
            anyhow::bail!("Shared directory must not be empty");
        }

        if self.server.send_timeout_secs == 0 || self.server.send_timeout_secs > 3600 {
            anyhow::bail!("Send timeout must be between 1 and 3600 seconds");
        }

        if self.server.max_file_size == 0 || self.server.max_file_size > MAX_FILE_SIZE_LIMIT {
            anyhow::bail!(
                "Max file size must be between 1 byte and {} bytes",
                MAX_FILE_SIZE_LIMIT
            );
        }

        if self.server.min_transfer_rate == 0 {
            anyhow::bail!("Min transfer rate must be greater than zero");
        }

        if self.server.max_request_size < 256 || self.server.max_request_size > 16 * 1024 * 1024
        {
            anyhow::bail!("Max request size must be between 256 bytes and 16MB");
        }

        if self.watch.enabled && self.watch.interval_ms == 0 {
            anyhow::bail!("Watch interval must be greater than zero");
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Build the library server configuration
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address cannot be parsed.
    pub fn server_config(&self) -> anyhow::Result<ServerConfig> {
        Ok(ServerConfig {
            bind_addr: self.parse_listen_addr()?,
            shared_dir: self.server.shared_dir.clone(),
            send_timeout: Duration::from_secs(self.server.send_timeout_secs),
            min_transfer_rate: self.server.min_transfer_rate,
            max_file_size: self.server.max_file_size,
            max_request_size: self.server.max_request_size,
            shutdown_timeout: Duration::from_secs(self.server.shutdown_timeout_secs),
            ..ServerConfig::default()
        })
    }

    /// Watcher poll interval
    #[must_use]
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch.interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:8765");
        assert_eq!(config.server.shared_dir, PathBuf::from("uploads"));
        assert!(config.watch.enabled);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.server.listen_addr = "not an address".to_string();
        assert!(config.validate().is_err());

        config.server.listen_addr = "127.0.0.1:0".to_string();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "DEBUG".to_string();
        config.watch.interval_ms = 0;
        assert!(config.validate().is_err());

        config.watch.enabled = false;
        assert!(config.validate().is_ok());

        config.server.max_request_size = 16;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_size_limits() {
        let mut config = Config::default();

        config.server.max_file_size = 0;
        assert!(config.validate().is_err());

        config.server.max_file_size = MAX_FILE_SIZE_LIMIT;
        assert!(config.validate().is_ok());

        config.server.max_file_size = MAX_FILE_SIZE_LIMIT + 1;
        assert!(config.validate().is_err());

        config.server.max_file_size = 1024;
        config.server.min_transfer_rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            shared_dir = "/srv/share"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.shared_dir, PathBuf::from("/srv/share"));
        assert_eq!(config.server.listen_addr, "0.0.0.0:8765");
        assert_eq!(config.watch.interval_ms, 1000);
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.listen_addr, deserialized.server.listen_addr);
        assert_eq!(config.server.max_file_size, deserialized.server.max_file_size);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:9000".to_string();
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.listen_addr, "127.0.0.1:9000");
    }

    #[test]
    fn test_server_config_mapping() {
        let mut config = Config::default();
        config.server.listen_addr = "127.0.0.1:9100".to_string();
        config.server.send_timeout_secs = 3;

        let server = config.server_config().unwrap();
        assert_eq!(server.bind_addr.port(), 9100);
        assert_eq!(server.send_timeout, Duration::from_secs(3));
        assert_eq!(server.min_transfer_rate, 1024 * 1024);
    }
}
