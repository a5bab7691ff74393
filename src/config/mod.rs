/// Configuration management for sondeo
pub mod settings;

pub use settings::{ClusterSettings, NodeSettings, PoolSettings};

use crate::core::Endpoint;
use crate::pool::PoolFactory;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Main sondeo configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Cluster seed list
    pub cluster: ClusterConfig,
    /// Node monitoring configuration
    pub monitor: MonitorConfig,
    /// Connection pool configuration
    pub pool: PoolConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Seed endpoints (host:port)
    pub seeds: Vec<String>,
    /// Expected replica set name, if the seeds belong to one
    #[serde(default)]
    pub replica_set: Option<String>,
}

/// Probe loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Idle time between two probes of the same node, in milliseconds
    pub probe_interval_ms: u64,
    /// Budget for one probe (all handshake commands together), in milliseconds
    pub probe_timeout_ms: u64,
}

/// Connection pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum number of pooled connections per node and pool
    pub max_size: usize,
    /// Timeout for opening and initialising a connection, in milliseconds
    pub connect_timeout_ms: u64,
    /// Give every node a shared pool next to its dedicated one
    pub shared: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cluster: ClusterConfig {
                seeds: vec!["127.0.0.1:27017".to_string()],
                replica_set: None,
            },
            monitor: MonitorConfig {
                probe_interval_ms: settings::DEFAULT_PROBE_INTERVAL.as_millis() as u64,
                probe_timeout_ms: settings::DEFAULT_PROBE_TIMEOUT.as_millis() as u64,
            },
            pool: PoolConfig {
                max_size: settings::DEFAULT_POOL_MAX_SIZE,
                connect_timeout_ms: settings::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64,
                shared: true,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content).map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cluster.seeds.is_empty() {
            return Err(ConfigError::ValidationError(
                "cluster seeds cannot be empty".to_string(),
            ));
        }
        self.seed_endpoints()?;

        if let Some(name) = &self.cluster.replica_set {
            if name.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "replica_set name cannot be blank".to_string(),
                ));
            }
        }

        if self.monitor.probe_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "probe_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.monitor.probe_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "probe_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.pool.max_size == 0 {
            return Err(ConfigError::ValidationError(
                "pool max_size must be greater than 0".to_string(),
            ));
        }

        if self.pool.connect_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_ms must be greater than 0".to_string(),
            ));
        }

        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}",
                    self.logging.level
                )))
            }
        }

        match self.logging.format.as_str() {
            "json" | "text" => {}
            _ => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}",
                    self.logging.format
                )))
            }
        }

        Ok(())
    }

    /// Parse the seed list
    pub fn seed_endpoints(&self) -> Result<Vec<Endpoint>, ConfigError> {
        self.cluster
            .seeds
            .iter()
            .map(|seed| {
                seed.parse::<Endpoint>().map_err(|_| {
                    ConfigError::ValidationError(format!("Invalid seed endpoint: {}", seed))
                })
            })
            .collect()
    }

    pub fn pool_settings(&self) -> PoolSettings {
        PoolSettings::default()
            .with_max_size(self.pool.max_size)
            .with_connect_timeout(Duration::from_millis(self.pool.connect_timeout_ms))
            .with_shared(self.pool.shared)
    }

    pub fn node_settings(&self, pool_factory: Arc<dyn PoolFactory>) -> NodeSettings {
        NodeSettings::new(pool_factory)
            .with_probe_interval(Duration::from_millis(self.monitor.probe_interval_ms))
            .with_probe_timeout(Duration::from_millis(self.monitor.probe_timeout_ms))
    }

    pub fn cluster_settings(
        &self,
        pool_factory: Arc<dyn PoolFactory>,
    ) -> Result<ClusterSettings, ConfigError> {
        let settings = ClusterSettings::new(self.seed_endpoints()?, self.node_settings(pool_factory));
        Ok(match &self.cluster.replica_set {
            Some(name) => settings.with_replica_set_name(name.clone()),
            None => settings,
        })
    }

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P, mode: &str) -> Result<(), ConfigError> {
        let config = match mode {
            "standalone" => Config::default(),
            "replicaset" => Config {
                cluster: ClusterConfig {
                    seeds: vec![
                        "10.0.1.10:27017".to_string(),
                        "10.0.1.11:27017".to_string(),
                        "10.0.1.12:27017".to_string(),
                    ],
                    replica_set: Some("rs0".to_string()),
                },
                ..Default::default()
            },
            "sharded" => Config {
                cluster: ClusterConfig {
                    seeds: vec![
                        "10.0.2.10:27017".to_string(),
                        "10.0.2.11:27017".to_string(),
                    ],
                    replica_set: None,
                },
                ..Default::default()
            },
            _ => {
                return Err(ConfigError::ValidationError(
                    "Mode must be 'standalone', 'replicaset' or 'sharded'".to_string(),
                ))
            }
        };

        config.save_to_file(path)
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}
