//! Configuration management using Figment
//!
//! Configuration is loaded from multiple sources with the following precedence (highest to lowest):
//! 1. Environment variables (prefix: `ITEMSTORE_`, nesting separator `__`)
//! 2. XDG config directory: ~/.config/itemstore/config.toml
//! 3. Current working directory: ./config.toml
//! 4. Default values
//!
//! The storage backend is chosen by the `storage.backend` tag:
//!
//! ```toml
//! [storage]
//! backend = "table_store"
//! account_name = "devstoreaccount1"
//! account_key = "..."
//! endpoint = "127.0.0.1:10002"
//! use_emulator = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use base64::Engine as _;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::repository::ResiliencePolicy;

const ENV_PREFIX: &str = "ITEMSTORE_";
const APP_DIR: &str = "itemstore";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Service configuration
    pub service: ServiceConfig,

    /// Backend selection and its connection settings
    pub storage: StorageConfig,

    /// Per-call timeout and read retry
    #[serde(default)]
    pub resilience: ResilienceConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Service name
    pub name: String,

    /// Log level (trace, debug, info, warn, error) or a full filter directive
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Environment (development, staging, production)
    #[serde(default = "default_environment")]
    pub environment: String,
}

/// Which backend to construct, with the settings only that backend needs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum StorageConfig {
    Relational(RelationalConfig),
    TableStore(TableStoreConfig),
}

impl StorageConfig {
    /// Backend tag as written in configuration
    pub fn backend_name(&self) -> &'static str {
        match self {
            StorageConfig::Relational(_) => "relational",
            StorageConfig::TableStore(_) => "table_store",
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Relational(RelationalConfig::default())
    }
}

/// SQL dialect spoken by the relational backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelationalDriver {
    #[default]
    Mysql,
    Sqlite,
}

/// Relational database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelationalConfig {
    /// SQL dialect
    #[serde(default)]
    pub driver: RelationalDriver,

    /// Full connection URL; when set, host/port/user/password/database are ignored
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default = "default_db_host")]
    pub host: String,

    #[serde(default = "default_db_port")]
    pub port: u16,

    #[serde(default = "default_db_user")]
    pub user: String,

    #[serde(default)]
    pub password: String,

    /// Database name (MySQL) or file path (SQLite)
    #[serde(default = "default_db_name")]
    pub database: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_open_connections")]
    pub max_open_connections: u32,

    /// Connections kept open while idle
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: u32,

    /// Close connections idle for longer than this; 0 keeps them forever
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Recycle connections older than this; 0 disables recycling
    #[serde(default = "default_connection_max_lifetime")]
    pub connection_max_lifetime_secs: u64,

    /// Timeout for acquiring a connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Total attempts at establishing the pool; zero still tries once
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Fixed delay between bring-up attempts in seconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
}

impl RelationalConfig {
    /// Connection URL for the configured driver
    ///
    /// Credentials are percent-encoded, so passwords may contain any character.
    pub fn connection_url(&self) -> Result<String> {
        if let Some(url) = self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.to_string());
        }

        match self.driver {
            RelationalDriver::Sqlite => Ok(format!("sqlite://{}?mode=rwc", self.database)),
            RelationalDriver::Mysql => {
                let mut url = Url::parse(&format!(
                    "mysql://{}:{}/{}",
                    self.host, self.port, self.database
                ))
                .map_err(|e| Error::InvalidConfig(format!("invalid MySQL address: {}", e)))?;
                url.set_username(&self.user)
                    .map_err(|_| Error::InvalidConfig("invalid MySQL user".to_string()))?;
                if !self.password.is_empty() {
                    url.set_password(Some(&self.password))
                        .map_err(|_| Error::InvalidConfig("invalid MySQL password".to_string()))?;
                }
                Ok(url.to_string())
            }
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// `None` when idle connections are never reaped
    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// `None` when connections are never recycled
    pub fn max_lifetime(&self) -> Option<Duration> {
        (self.connection_max_lifetime_secs > 0)
            .then(|| Duration::from_secs(self.connection_max_lifetime_secs))
    }

    /// Warm connections the pool maintains, never more than the pool size
    pub fn min_connections(&self) -> u32 {
        self.max_idle_connections.min(self.max_open_connections)
    }

    /// In-memory SQLite settings used by tests and local experiments
    pub fn sqlite_memory() -> Self {
        Self {
            driver: RelationalDriver::Sqlite,
            url: Some("sqlite::memory:".to_string()),
            max_open_connections: 1,
            max_idle_connections: 1,
            idle_timeout_secs: 0,
            connection_max_lifetime_secs: 0,
            max_retries: 0,
            retry_delay_secs: 0,
            ..Self::default()
        }
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(format!("relational: {}", msg)));

        let has_url = self.url.as_deref().is_some_and(|u| !u.trim().is_empty());
        if self.driver == RelationalDriver::Mysql && !has_url {
            if self.host.trim().is_empty() {
                return invalid("host is required");
            }
            if self.port == 0 {
                return invalid("port is required");
            }
            if self.user.trim().is_empty() {
                return invalid("user is required");
            }
            if self.database.trim().is_empty() {
                return invalid("database name is required");
            }
        }
        if self.driver == RelationalDriver::Sqlite && !has_url && self.database.trim().is_empty() {
            return invalid("database path is required");
        }
        if self.max_open_connections == 0 {
            return invalid("max open connections must be positive");
        }
        if self.max_idle_connections == 0 {
            return invalid("max idle connections must be positive");
        }
        if self.driver == RelationalDriver::Mysql && self.connection_max_lifetime_secs == 0 {
            return invalid("connection max lifetime must be positive");
        }
        self.connection_url().map(|_| ())
    }
}

impl Default for RelationalConfig {
    fn default() -> Self {
        Self {
            driver: RelationalDriver::default(),
            url: None,
            host: default_db_host(),
            port: default_db_port(),
            user: default_db_user(),
            password: String::new(),
            database: default_db_name(),
            max_open_connections: default_max_open_connections(),
            max_idle_connections: default_max_idle_connections(),
            idle_timeout_secs: default_idle_timeout(),
            connection_max_lifetime_secs: default_connection_max_lifetime(),
            connect_timeout_secs: default_connect_timeout(),
            max_retries: default_max_retries(),
            retry_delay_secs: default_retry_delay(),
        }
    }
}

/// Wide-column table store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableStoreConfig {
    /// Storage account name
    #[serde(default)]
    pub account_name: String,

    /// Base64-encoded account key
    #[serde(default)]
    pub account_key: String,

    /// Endpoint suffix (e.g. `core.windows.net`) or emulator `host:port`
    #[serde(default)]
    pub endpoint: String,

    /// Table holding the items
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Talk plain HTTP to a local emulator with path-style addressing
    #[serde(default)]
    pub use_emulator: bool,

    /// Per-request HTTP timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl TableStoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::InvalidConfig(format!("table store: {}", msg)));

        if self.account_name.trim().is_empty() {
            return invalid("account name is required");
        }
        if self.account_key.trim().is_empty() {
            return invalid("account key is required");
        }
        if base64::engine::general_purpose::STANDARD
            .decode(self.account_key.trim())
            .is_err()
        {
            return invalid("account key must be base64");
        }
        if self.endpoint.trim().is_empty() {
            return invalid("endpoint is required");
        }
        if !is_valid_table_name(&self.table_name) {
            return invalid("table name must be 3-63 alphanumeric characters starting with a letter");
        }
        Ok(())
    }
}

impl Default for TableStoreConfig {
    fn default() -> Self {
        Self {
            account_name: String::new(),
            account_key: String::new(),
            endpoint: String::new(),
            table_name: default_table_name(),
            use_emulator: false,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn is_valid_table_name(name: &str) -> bool {
    (3..=63).contains(&name.len())
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Resilience configuration (per-call timeout, read retry)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Upper bound for any single repository call in seconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Additional attempts for reads after a retriable failure
    #[serde(default = "default_read_retry_attempts")]
    pub read_retry_attempts: u32,

    /// Fixed delay between read attempts (milliseconds)
    #[serde(default = "default_read_retry_delay_ms")]
    pub read_retry_delay_ms: u64,
}

impl ResilienceConfig {
    /// Convert to Duration types for runtime use
    pub fn policy(&self) -> ResiliencePolicy {
        ResiliencePolicy {
            operation_timeout: Duration::from_secs(self.operation_timeout_secs),
            read_retry_attempts: self.read_retry_attempts,
            read_retry_delay: Duration::from_millis(self.read_retry_delay_ms),
        }
    }
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout(),
            read_retry_attempts: default_read_retry_attempts(),
            read_retry_delay_ms: default_read_retry_delay_ms(),
        }
    }
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_environment() -> String {
    "development".to_string()
}

fn default_db_host() -> String {
    "localhost".to_string()
}

fn default_db_port() -> u16 {
    3306
}

fn default_db_user() -> String {
    "root".to_string()
}

fn default_db_name() -> String {
    "app".to_string()
}

fn default_max_open_connections() -> u32 {
    25
}

fn default_max_idle_connections() -> u32 {
    5
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_connection_max_lifetime() -> u64 {
    300
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_retry_delay() -> u64 {
    2
}

fn default_table_name() -> String {
    "items".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_operation_timeout() -> u64 {
    10
}

fn default_read_retry_attempts() -> u32 {
    2
}

fn default_read_retry_delay_ms() -> u64 {
    200
}

impl Config {
    /// Load configuration from all sources
    ///
    /// Environment variables (`ITEMSTORE_` prefix, `__` between nested keys)
    /// override all file-based configs.
    pub fn load() -> Result<Self> {
        let config_paths = Self::find_config_paths();

        tracing::debug!("Searching for config files in order:");
        for path in &config_paths {
            tracing::debug!("  - {}", path.display());
        }

        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Lowest priority first so later files override earlier ones
        for path in config_paths.iter().rev() {
            if path.exists() {
                tracing::info!("Loading configuration from: {}", path.display());
                figment = figment.merge(Toml::file(path));
            }
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config = figment.extract()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    ///
    /// This bypasses the search path. Environment variables still override
    /// values from the file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;

        Ok(config)
    }

    /// Config file candidates in priority order (highest first)
    fn find_config_paths() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        let xdg_dirs = xdg::BaseDirectories::with_prefix(APP_DIR);
        if let Some(path) = xdg_dirs.find_config_file("config.toml") {
            paths.push(path);
        }

        paths.push(PathBuf::from("config.toml"));

        paths
    }

    /// Reject configurations the factory could not act on
    pub fn validate(&self) -> Result<()> {
        if self.service.name.trim().is_empty() {
            return Err(Error::InvalidConfig("service: name is required".to_string()));
        }
        if self.service.environment.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "service: environment is required".to_string(),
            ));
        }
        if self.resilience.operation_timeout_secs == 0 {
            return Err(Error::InvalidConfig(
                "resilience: operation timeout must be positive".to_string(),
            ));
        }

        match &self.storage {
            StorageConfig::Relational(relational) => relational.validate(),
            StorageConfig::TableStore(table) => table.validate(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig {
                name: "itemstore".to_string(),
                log_level: default_log_level(),
                environment: default_environment(),
            },
            storage: StorageConfig::default(),
            resilience: ResilienceConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const EMULATOR_KEY: &str =
        "Eby8vdM02xNOcqFlqUwJPLlmEtlCDXJ1OUzFT50uSRZ6IFsuFq2UVErCz4I6tq/K1SZFPTOtr/KBHBeksoGMGw==";

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.service.log_level, "info");
        assert_eq!(config.storage.backend_name(), "relational");

        let StorageConfig::Relational(relational) = &config.storage else {
            panic!("default backend should be relational");
        };
        assert_eq!(relational.max_retries, 5);
        assert_eq!(relational.retry_delay_secs, 2);
        assert_eq!(relational.max_open_connections, 25);
        assert_eq!(relational.max_idle_connections, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_table_store_from_file() {
        let file = write_config(&format!(
            r#"
            [service]
            name = "catalog"

            [storage]
            backend = "table_store"
            account_name = "devstoreaccount1"
            account_key = "{}"
            endpoint = "127.0.0.1:10002"
            use_emulator = true
            "#,
            EMULATOR_KEY
        ));

        let config = Config::load_from(file.path()).unwrap();
        assert_eq!(config.service.name, "catalog");

        let StorageConfig::TableStore(table) = &config.storage else {
            panic!("expected table store backend");
        };
        assert_eq!(table.table_name, "items");
        assert!(table.use_emulator);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_relational_overrides() {
        let file = write_config(
            r#"
            [storage]
            backend = "relational"
            host = "db.internal"
            max_retries = 1
            retry_delay_secs = 0

            [resilience]
            read_retry_attempts = 4
            "#,
        );

        let config = Config::load_from(file.path()).unwrap();
        let StorageConfig::Relational(relational) = &config.storage else {
            panic!("expected relational backend");
        };
        assert_eq!(relational.host, "db.internal");
        assert_eq!(relational.port, 3306);
        assert_eq!(relational.max_retries, 1);
        assert_eq!(config.resilience.read_retry_attempts, 4);
        assert_eq!(config.resilience.policy().read_retry_attempts, 4);
    }

    #[test]
    fn test_unknown_backend_is_rejected() {
        let file = write_config(
            r#"
            [storage]
            backend = "mongo"
            "#,
        );
        assert!(matches!(
            Config::load_from(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_validate_table_store_requires_credentials() {
        let mut config = Config {
            storage: StorageConfig::TableStore(TableStoreConfig::default()),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("account name is required"));

        config.storage = StorageConfig::TableStore(TableStoreConfig {
            account_name: "acct".to_string(),
            account_key: "not base64!".to_string(),
            endpoint: "core.windows.net".to_string(),
            ..TableStoreConfig::default()
        });
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("base64"));
    }

    #[test]
    fn test_validate_table_name() {
        assert!(is_valid_table_name("items"));
        assert!(is_valid_table_name("Items2024"));
        assert!(!is_valid_table_name("it"));
        assert!(!is_valid_table_name("1items"));
        assert!(!is_valid_table_name("my-items"));
    }

    #[test]
    fn test_validate_relational_pool_sizes() {
        let config = Config {
            storage: StorageConfig::Relational(RelationalConfig {
                max_open_connections: 0,
                ..RelationalConfig::default()
            }),
            ..Config::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("max open connections"));
    }

    #[test]
    fn test_mysql_url_encodes_credentials() {
        let relational = RelationalConfig {
            user: "app".to_string(),
            password: "p@ss:word".to_string(),
            host: "db".to_string(),
            database: "items".to_string(),
            ..RelationalConfig::default()
        };
        assert_eq!(
            relational.connection_url().unwrap(),
            "mysql://app:p%40ss%3Aword@db:3306/items"
        );
    }

    #[test]
    fn test_url_override_wins() {
        let relational = RelationalConfig::sqlite_memory();
        assert_eq!(relational.connection_url().unwrap(), "sqlite::memory:");
        assert_eq!(relational.min_connections(), 1);
        assert!(relational.idle_timeout().is_none());
        assert!(relational.max_lifetime().is_none());
    }
}
