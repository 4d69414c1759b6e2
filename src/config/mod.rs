/// Configuration management for slotgate
pub use crate::error::ConfigError;
use crate::utils::split_host_port;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main slotgate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Front-end server configuration
    pub server: ServerConfig,
    /// Cluster topology configuration
    pub cluster: ClusterConfig,
    /// Backend connection and request lifecycle tuning
    pub upstream: UpstreamConfig,
    /// Health check configuration
    pub health: HealthConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// When false every request is answered with 204 and nothing is proxied
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Number of worker threads
    pub worker_threads: Option<usize>,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Nodes known at startup
    pub seed_nodes: Vec<String>,
    /// Node used for slots that no table entry covers yet
    pub fallback_node: Option<String>,
    /// Query CLUSTER NODES against the seeds at startup
    #[serde(default = "default_true")]
    pub discover_on_start: bool,
    /// Full slot table refresh interval in seconds (0 disables)
    #[serde(default = "default_slot_refresh")]
    pub slot_refresh_interval_sec: u64,
    /// Hash tag delimiter pair, e.g. "{}". Empty disables hash tags.
    #[serde(default = "default_hash_tag")]
    pub hash_tag: String,
}

/// Upstream configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub connect_timeout_ms: u64,
    pub send_timeout_ms: u64,
    pub read_timeout_ms: u64,
    /// Read buffer size per backend connection
    pub buffer_size: usize,
    /// Concurrency cap per backend node
    pub max_connections_per_node: usize,
    /// How long a request waits for a free connection slot
    pub acquire_timeout_ms: u64,
    /// Maximum number of redirects to follow
    pub max_redirects: u8,
    /// Idle connections older than this are closed
    pub max_idle_sec: u64,
    /// How often the idle eviction sweep runs
    pub eviction_interval_sec: u64,
}

/// Health check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    pub enabled: bool,
    /// Health check interval in seconds
    pub interval_sec: u64,
    /// Health check timeout in seconds
    pub timeout_sec: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (json, text)
    pub format: String,
}

fn default_true() -> bool {
    true
}

fn default_slot_refresh() -> u64 {
    60
}

fn default_hash_tag() -> String {
    "{}".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "0.0.0.0:8080".to_string(),
                enabled: true,
                worker_threads: None,
            },
            cluster: ClusterConfig {
                seed_nodes: vec!["127.0.0.1:7000".to_string()],
                fallback_node: Some("127.0.0.1:7000".to_string()),
                discover_on_start: true,
                slot_refresh_interval_sec: default_slot_refresh(),
                hash_tag: default_hash_tag(),
            },
            upstream: UpstreamConfig::default(),
            health: HealthConfig {
                enabled: true,
                interval_sec: 10,
                timeout_sec: 3,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "text".to_string(),
            },
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 60_000,
            send_timeout_ms: 60_000,
            read_timeout_ms: 60_000,
            buffer_size: 4096,
            max_connections_per_node: 64,
            acquire_timeout_ms: 1000,
            max_redirects: 5,
            max_idle_sec: 60,
            eviction_interval_sec: 10,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_sec)
    }
}

impl ClusterConfig {
    /// Delimiter bytes for hash tag extraction, if enabled
    pub fn hash_tag_delimiters(&self) -> Option<(u8, u8)> {
        let bytes = self.hash_tag.as_bytes();
        match bytes {
            [open, close] => Some((*open, *close)),
            _ => None,
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
        self.server
            .listen_addr
            .parse::<std::net::SocketAddr>()
            .map_err(|_| {
                ConfigError::ValidationError(format!(
                    "Invalid listen_addr: {}",
                    self.server.listen_addr
                ))
            })?;

        if self.server.worker_threads == Some(0) {
            return Err(ConfigError::ValidationError(
                "worker_threads must be greater than 0".to_string(),
            ));
        }

        // Validate cluster config
        if self.cluster.seed_nodes.is_empty() {
            return Err(ConfigError::ValidationError(
                "seed_nodes cannot be empty".to_string(),
            ));
        }

        for node in self
            .cluster
            .seed_nodes
            .iter()
            .chain(self.cluster.fallback_node.iter())
        {
            if split_host_port(node).is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid cluster node address: {}",
                    node
                )));
            }
        }

        if !self.cluster.hash_tag.is_empty() {
            match self.cluster.hash_tag_delimiters() {
                Some((open, close)) if open != close => {}
                _ => {
                    return Err(ConfigError::ValidationError(format!(
                        "hash_tag must be two distinct characters, got {:?}",
                        self.cluster.hash_tag
                    )))
                }
            }
        }

        // Validate upstream config
        let upstream = &self.upstream;
        for (name, value) in [
            ("connect_timeout_ms", upstream.connect_timeout_ms),
            ("send_timeout_ms", upstream.send_timeout_ms),
            ("read_timeout_ms", upstream.read_timeout_ms),
            ("acquire_timeout_ms", upstream.acquire_timeout_ms),
            ("max_idle_sec", upstream.max_idle_sec),
            ("eviction_interval_sec", upstream.eviction_interval_sec),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }

        if upstream.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_size must be greater than 0".to_string(),
            ));
        }

        if upstream.max_connections_per_node == 0 {
            return Err(ConfigError::ValidationError(
                "max_connections_per_node must be greater than 0".to_string(),
            ));
        }

        // Validate health config
        if self.health.enabled {
            if self.health.interval_sec == 0 {
                return Err(ConfigError::ValidationError(
                    "health check interval_sec must be greater than 0".to_string(),
                ));
            }

            if self.health.timeout_sec == 0 {
                return Err(ConfigError::ValidationError(
                    "health check timeout_sec must be greater than 0".to_string(),
                ));
            }

            if self.health.timeout_sec >= self.health.interval_sec {
                return Err(ConfigError::ValidationError(
                    "health check timeout_sec must be less than interval_sec".to_string(),
                ));
            }
        }

        // Validate logging config
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

    /// Create example configuration file
    pub fn create_example_config<P: AsRef<Path>>(path: P) -> Result<(), ConfigError> {
        let config = Config {
            cluster: ClusterConfig {
                seed_nodes: vec![
                    "10.0.1.20:6379".to_string(),
                    "10.0.1.21:6379".to_string(),
                    "10.0.1.22:6379".to_string(),
                ],
                fallback_node: Some("10.0.1.20:6379".to_string()),
                discover_on_start: true,
                slot_refresh_interval_sec: 60,
                hash_tag: default_hash_tag(),
            },
            upstream: UpstreamConfig {
                connect_timeout_ms: 5000,
                send_timeout_ms: 5000,
                read_timeout_ms: 5000,
                ..Default::default()
            },
            ..Default::default()
        };

        config.save_to_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.upstream.connect_timeout(), Duration::from_secs(60));
        assert_eq!(config.upstream.buffer_size, 4096);
        assert_eq!(config.upstream.max_redirects, 5);
        assert_eq!(config.cluster.hash_tag_delimiters(), Some((b'{', b'}')));
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.upstream.max_connections_per_node = 0;
        assert!(config.validate().is_err());
        config.upstream.max_connections_per_node = 8;
        assert!(config.validate().is_ok());

        config.cluster.seed_nodes.clear();
        assert!(config.validate().is_err());
        config.cluster.seed_nodes = vec!["localhost".to_string()];
        assert!(config.validate().is_err());
        config.cluster.seed_nodes = vec!["localhost:7000".to_string()];
        assert!(config.validate().is_ok());

        config.upstream.read_timeout_ms = 0;
        assert!(config.validate().is_err());
        config.upstream.read_timeout_ms = 100;

        // Zero idle lifetime would expire every pooled connection
        config.upstream.max_idle_sec = 0;
        assert!(config.validate().is_err());
        config.upstream.max_idle_sec = 30;
        assert!(config.validate().is_ok());

        config.health.timeout_sec = config.health.interval_sec;
        assert!(config.validate().is_err());
        config.health.enabled = false;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_hash_tag_validation() {
        let mut config = Config::default();

        config.cluster.hash_tag = String::new();
        assert!(config.validate().is_ok());
        assert_eq!(config.cluster.hash_tag_delimiters(), None);

        config.cluster.hash_tag = "{".to_string();
        assert!(config.validate().is_err());

        config.cluster.hash_tag = "||".to_string();
        assert!(config.validate().is_err());

        config.cluster.hash_tag = "[]".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_logging() {
        let mut config = Config::default();
        config.logging.level = "verbose".to_string();
        assert!(config.validate().is_err());

        config.logging.level = "debug".to_string();
        config.logging.format = "xml".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed_config: Config = toml::from_str(&toml_str).unwrap();
        assert!(parsed_config.validate().is_ok());
    }

    #[test]
    fn test_optional_fields_default() {
        let toml_str = r#"
[server]
listen_addr = "127.0.0.1:8080"

[cluster]
seed_nodes = ["127.0.0.1:7000"]

[upstream]
connect_timeout_ms = 100
send_timeout_ms = 100
read_timeout_ms = 100
buffer_size = 1024
max_connections_per_node = 2
acquire_timeout_ms = 50
max_redirects = 3
max_idle_sec = 30
eviction_interval_sec = 5

[health]
enabled = false
interval_sec = 10
timeout_sec = 3

[logging]
level = "info"
format = "json"
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_ok());
        assert!(config.server.enabled);
        assert!(config.cluster.discover_on_start);
        assert_eq!(config.cluster.hash_tag, "{}");
        assert_eq!(config.cluster.fallback_node, None);
        assert_eq!(config.cluster.slot_refresh_interval_sec, 60);
    }

    #[test]
    fn test_config_file_operations() {
        let temp_file = NamedTempFile::new().unwrap();

        Config::create_example_config(temp_file.path()).unwrap();
        let loaded_config = Config::load_from_file(temp_file.path()).unwrap();
        assert_eq!(loaded_config.cluster.seed_nodes.len(), 3);
        assert_eq!(loaded_config.upstream.connect_timeout_ms, 5000);
    }
}
