// 🔧 Configuration - store, server and log settings
//
// Layered, later sources overriding earlier ones: built-in defaults, an
// optional TOML file, then DATAPOINTS_-prefixed environment variables with
// nested keys joined by `__` (DATAPOINTS_STORE__PATH=/var/lib/datapoints.db).
// Command-line flags are applied on top by the binaries.
//
// [store]
// path = "datapoints.db"
// create_if_missing = false
// busy_timeout_ms = 5000
// page_size = 256
//
// [server]
// listen = "0.0.0.0"
// port = 8088
//
// [log]
// level = "info"

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Path that opens a private in-memory database
pub const IN_MEMORY: &str = ":memory:";

/// Store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Database file, or `:memory:`
    pub path: PathBuf,
    /// Create the database file when it does not exist
    #[serde(default)]
    pub create_if_missing: bool,
    /// Upper bound for waiting on the connection or on SQLite locks
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
    /// Rows fetched per round trip by a result stream
    #[serde(default = "default_page_size")]
    pub page_size: u64,
}

const fn default_busy_timeout_ms() -> u64 {
    5_000
}

const fn default_page_size() -> u64 {
    256
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        StoreConfig {
            path: path.into(),
            create_if_missing: false,
            busy_timeout_ms: default_busy_timeout_ms(),
            page_size: default_page_size(),
        }
    }

    pub fn in_memory() -> Self {
        Self::new(IN_MEMORY)
    }

    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn with_page_size(mut self, page_size: u64) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn is_in_memory(&self) -> bool {
        self.path.as_os_str() == IN_MEMORY
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self::new("datapoints.db")
    }
}

/// Network settings for the server adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: "0.0.0.0".to_string(),
            port: 8088,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Default filter directive when `RUST_LOG` is not set
    pub level: String,
    /// Log to this file instead of stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            file: None,
        }
    }
}

/// Complete settings for the binaries.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub log: LogConfig,
}

impl Settings {
    /// Load defaults, then `file` (when given), then the environment.
    pub fn load(file: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&Settings::default())?);

        if let Some(path) = file {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix("DATAPOINTS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_settings() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8088);
        assert_eq!(settings.store.busy_timeout_ms, 5_000);
        assert!(!settings.store.create_if_missing);
        assert_eq!(settings.log.level, "info");
    }

    #[test]
    fn test_in_memory_store_config() {
        let config = StoreConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(!StoreConfig::new("/tmp/points.db").is_in_memory());
        assert_eq!(config.busy_timeout(), Duration::from_millis(5_000));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[store]\npath = \"/var/lib/points.db\"\npage_size = 32\n\n[server]\nport = 9000"
        )
        .unwrap();

        let settings = Settings::load(Some(file.path())).unwrap();
        assert_eq!(settings.store.path, PathBuf::from("/var/lib/points.db"));
        assert_eq!(settings.store.page_size, 32);
        assert_eq!(settings.store.busy_timeout_ms, 5_000);
        assert_eq!(settings.server.port, 9000);
        assert_eq!(settings.server.listen, "0.0.0.0");
    }

    #[test]
    fn test_missing_file_is_an_error() {
        let result = Settings::load(Some(Path::new("/nonexistent/datapoints.toml")));
        assert!(result.is_err());
    }
}
