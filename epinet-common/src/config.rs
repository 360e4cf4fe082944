//! Bootstrap configuration
//!
//! Settings come from a TOML file in which every field is optional. Priority:
//! 1. Command-line arguments (applied by the binary)
//! 2. Environment variables (`EPINET_DATABASE_PATH`)
//! 3. TOML config file
//! 4. Built-in defaults
//!
//! A missing config file is not fatal: a warning is logged and defaults are
//! used. A file that exists but does not parse is a configuration error.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Environment variable overriding `database_path`
pub const DATABASE_PATH_ENV: &str = "EPINET_DATABASE_PATH";

/// Bootstrap configuration loaded from TOML
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TomlConfig {
    /// SQLite database holding funnels, raw events and content
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// HTTP server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// HTTP bind address
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub aggregation: AggregationConfig,

    #[serde(default)]
    pub sankey: SankeyConfig,

    /// Per-tenant database files; tenants not listed use `database_path`
    #[serde(default)]
    pub tenant_databases: BTreeMap<String, PathBuf>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Hourly aggregation tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationConfig {
    /// Retention window; hour buckets older than this are trimmed
    #[serde(default = "default_max_hours")]
    pub max_hours: usize,

    /// Minimum spacing between two load attempts for one tenant
    #[serde(default = "default_throttle_secs")]
    pub throttle_secs: u64,

    /// Size of the first, most recent chunk of a full-range run
    #[serde(default = "default_recent_chunk_hours")]
    pub recent_chunk_hours: usize,

    /// Size of each historical chunk after the recent one
    #[serde(default = "default_historical_chunk_hours")]
    pub historical_chunk_hours: usize,

    /// Pause between historical chunks
    #[serde(default = "default_chunk_yield_ms")]
    pub chunk_yield_ms: u64,

    /// Background refresh ticker period
    #[serde(default = "default_refresh_interval_secs")]
    pub refresh_interval_secs: u64,

    /// Tenants refreshed by the background ticker
    #[serde(default = "default_tenants")]
    pub tenants: Vec<String>,
}

/// Sankey read-model settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SankeyConfig {
    /// Most populous nodes kept in a rendered view
    #[serde(default = "default_max_nodes")]
    pub max_nodes: usize,
}

fn default_database_path() -> PathBuf {
    PathBuf::from("epinet.db")
}

fn default_port() -> u16 {
    5730
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_hours() -> usize {
    672
}

fn default_throttle_secs() -> u64 {
    60
}

fn default_recent_chunk_hours() -> usize {
    48
}

fn default_historical_chunk_hours() -> usize {
    168
}

fn default_chunk_yield_ms() -> u64 {
    10
}

fn default_refresh_interval_secs() -> u64 {
    300
}

fn default_tenants() -> Vec<String> {
    vec!["default".to_string()]
}

fn default_max_nodes() -> usize {
    16
}

impl Default for TomlConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
            port: default_port(),
            bind_address: default_bind_address(),
            logging: LoggingConfig::default(),
            aggregation: AggregationConfig::default(),
            sankey: SankeyConfig::default(),
            tenant_databases: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            max_hours: default_max_hours(),
            throttle_secs: default_throttle_secs(),
            recent_chunk_hours: default_recent_chunk_hours(),
            historical_chunk_hours: default_historical_chunk_hours(),
            chunk_yield_ms: default_chunk_yield_ms(),
            refresh_interval_secs: default_refresh_interval_secs(),
            tenants: default_tenants(),
        }
    }
}

impl Default for SankeyConfig {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
        }
    }
}

impl AggregationConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_secs(self.throttle_secs)
    }

    pub fn chunk_yield(&self) -> Duration {
        Duration::from_millis(self.chunk_yield_ms)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }
}

impl TomlConfig {
    /// Database file holding `tenant`'s funnels and events
    pub fn database_path_for(&self, tenant: &str) -> &Path {
        self.tenant_databases
            .get(tenant)
            .map(PathBuf::as_path)
            .unwrap_or(&self.database_path)
    }

    /// Reject values the aggregation pipeline cannot work with
    pub fn validate(&self) -> Result<()> {
        let agg = &self.aggregation;
        if agg.max_hours == 0 {
            return Err(Error::Config("aggregation.max_hours must be at least 1".to_string()));
        }
        if agg.recent_chunk_hours == 0 || agg.historical_chunk_hours == 0 {
            return Err(Error::Config(
                "aggregation chunk sizes must be at least 1 hour".to_string(),
            ));
        }
        if agg.refresh_interval_secs == 0 {
            return Err(Error::Config(
                "aggregation.refresh_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.sankey.max_nodes == 0 {
            return Err(Error::Config("sankey.max_nodes must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Load configuration from `path` (if any), then apply environment overrides
/// and validate.
pub fn load_config(path: Option<&Path>) -> Result<TomlConfig> {
    let mut config = match path {
        Some(path) if path.exists() => {
            let content = std::fs::read_to_string(path)?;
            let config: TomlConfig = toml::from_str(&content).map_err(|e| {
                Error::Config(format!("Failed to parse {}: {}", path.display(), e))
            })?;
            info!("Loaded configuration from {}", path.display());
            config
        }
        Some(path) => {
            warn!(
                "Config file {} not found, using built-in defaults",
                path.display()
            );
            TomlConfig::default()
        }
        None => {
            info!("No config file given, using built-in defaults");
            TomlConfig::default()
        }
    };

    if let Ok(db_path) = std::env::var(DATABASE_PATH_ENV) {
        if !db_path.trim().is_empty() {
            info!("Database path overridden by {}", DATABASE_PATH_ENV);
            config.database_path = PathBuf::from(db_path);
        }
    }

    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TomlConfig::default();
        assert_eq!(config.port, 5730);
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.aggregation.max_hours, 672);
        assert_eq!(config.aggregation.throttle(), Duration::from_secs(60));
        assert_eq!(config.aggregation.recent_chunk_hours, 48);
        assert_eq!(config.aggregation.historical_chunk_hours, 168);
        assert_eq!(config.aggregation.chunk_yield(), Duration::from_millis(10));
        assert_eq!(config.aggregation.tenants, vec!["default".to_string()]);
        assert_eq!(config.sankey.max_nodes, 16);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: TomlConfig = toml::from_str(
            r#"
            port = 9000

            [aggregation]
            max_hours = 24
            "#,
        )
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.aggregation.max_hours, 24);
        assert_eq!(config.aggregation.throttle_secs, 60);
        assert_eq!(config.database_path, PathBuf::from("epinet.db"));
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = TomlConfig::default();
        config.aggregation.historical_chunk_hours = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = TomlConfig::default();
        config.sankey.max_nodes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tenant_database_override() {
        let config: TomlConfig = toml::from_str(
            r#"
            database_path = "shared.db"

            [tenant_databases]
            acme = "/data/acme.db"
            "#,
        )
        .unwrap();
        assert_eq!(config.database_path_for("acme"), Path::new("/data/acme.db"));
        assert_eq!(config.database_path_for("globex"), Path::new("shared.db"));
    }
}
