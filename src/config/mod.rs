/// Configuration management for replipool

use crate::core::{Endpoint, NodeRole, PoolConfig};
use crate::failover::FailoverConfig;
use crate::health::HealthConfig;
use crate::queue::QueueConfig;
use crate::routing::balancer::LoadBalancingStrategy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub use crate::error::ConfigError;

/// Main replipool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Per-node connection pool settings
    pub pool: PoolSection,
    /// The primary node
    pub primary: Endpoint,
    /// Replicas, routing and health checking
    pub replication: ReplicationSection,
    /// Failover behaviour
    pub failover: FailoverSection,
    /// Optional priority admission
    #[serde(default)]
    pub queue: QueueSection,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Connection pool configuration, applied to every node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolSection {
    /// Connections kept open per node
    pub min: usize,
    /// Upper bound on connections per node
    pub max: usize,
    /// Idle time before a connection above `min` is closed
    pub idle_timeout_ms: u64,
    /// Budget for opening a connection
    pub connection_timeout_ms: u64,
    /// Budget for waiting on a pooled connection
    pub acquire_timeout_ms: u64,
    /// Default per-statement budget
    pub statement_timeout_ms: u64,
    /// How often idle connections are checked for eviction
    pub eviction_interval_ms: u64,
    /// Check idle connections before handing them out
    pub validate_on_checkout: bool,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationSection {
    /// Read replicas
    pub replicas: Vec<Endpoint>,
    /// Replicas lagging more than this do not serve reads
    pub lag_threshold_ms: u64,
    /// Health check interval in milliseconds
    pub health_check_interval_ms: u64,
    /// Health check timeout in milliseconds
    pub health_check_timeout_ms: u64,
    /// Consecutive failed primary checks before automatic failover
    pub failure_threshold: u32,
    /// Replica selection strategy
    pub load_balancing_strategy: LoadBalancingStrategy,
}

/// Failover configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailoverSection {
    /// Fail over automatically when the primary stays down
    pub auto_failover: bool,
    /// Budget for a promotion to take effect
    pub timeout_ms: u64,
    /// Minimum time between successful failovers
    pub cooldown_ms: u64,
    /// Replicas lagging more than this are never promoted
    pub max_candidate_lag_ms: u64,
    /// Interval between writability checks during promotion
    pub poll_interval_ms: u64,
}

/// Query queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Route queries through the priority queue
    pub enabled: bool,
    /// In-flight ceiling shared by all priorities
    pub max_concurrent: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (error, warn, info, debug, trace)
    pub level: String,
    /// Log format (text, compact)
    pub format: String,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            enabled: false,
            max_concurrent: 100,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: PoolSection {
                min: 2,
                max: 10,
                idle_timeout_ms: 600_000,
                connection_timeout_ms: 5_000,
                acquire_timeout_ms: 30_000,
                statement_timeout_ms: 30_000,
                eviction_interval_ms: 30_000,
                validate_on_checkout: true,
            },
            primary: Endpoint::new("127.0.0.1", 5432).with_id("primary"),
            replication: ReplicationSection {
                replicas: Vec::new(),
                lag_threshold_ms: 1_000,
                health_check_interval_ms: 5_000,
                health_check_timeout_ms: 2_000,
                failure_threshold: 3,
                load_balancing_strategy: LoadBalancingStrategy::RoundRobin,
            },
            failover: FailoverSection {
                auto_failover: true,
                timeout_ms: 30_000,
                cooldown_ms: 60_000,
                max_candidate_lag_ms: 10_000,
                poll_interval_ms: 500,
            },
            queue: QueueSection::default(),
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
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        fs::write(path, content)
            .map_err(|e| ConfigError::IoError(e.to_string()))?;

        Ok(())
    }

    /// Node ids, endpoints and roles, primary first. Nodes without an
    /// explicit id are named `primary` and `replica-N`.
    pub fn nodes(&self) -> Vec<(String, Endpoint, NodeRole)> {
        let mut nodes = Vec::with_capacity(self.replication.replicas.len() + 1);
        let primary_id = self
            .primary
            .id
            .clone()
            .unwrap_or_else(|| "primary".to_string());
        nodes.push((primary_id, self.primary.clone(), NodeRole::Primary));

        for (i, replica) in self.replication.replicas.iter().enumerate() {
            let id = replica
                .id
                .clone()
                .unwrap_or_else(|| format!("replica-{}", i + 1));
            nodes.push((id, replica.clone(), NodeRole::Replica));
        }
        nodes
    }

    /// Pool settings for one node
    pub fn pool_config(&self, endpoint: &Endpoint) -> PoolConfig {
        PoolConfig {
            endpoint: endpoint.clone(),
            min: self.pool.min,
            max: self.pool.max,
            connect_timeout: Duration::from_millis(self.pool.connection_timeout_ms),
            acquire_timeout: Duration::from_millis(self.pool.acquire_timeout_ms),
            idle_timeout: Duration::from_millis(self.pool.idle_timeout_ms),
            statement_timeout: Duration::from_millis(self.pool.statement_timeout_ms),
            eviction_interval: Duration::from_millis(self.pool.eviction_interval_ms),
            validate_on_checkout: self.pool.validate_on_checkout,
        }
    }

    pub fn health_config(&self) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_millis(self.replication.health_check_interval_ms),
            probe_timeout: Duration::from_millis(self.replication.health_check_timeout_ms),
            lag_threshold_ms: self.replication.lag_threshold_ms,
            failure_threshold: self.replication.failure_threshold,
        }
    }

    pub fn failover_config(&self) -> FailoverConfig {
        FailoverConfig {
            auto_failover: self.failover.auto_failover,
            timeout: Duration::from_millis(self.failover.timeout_ms),
            cooldown: Duration::from_millis(self.failover.cooldown_ms),
            max_candidate_lag_ms: self.failover.max_candidate_lag_ms,
            poll_interval: Duration::from_millis(self.failover.poll_interval_ms),
        }
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_concurrent: self.queue.max_concurrent,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        // Validate pool config
        if self.pool.max == 0 {
            return Err(ConfigError::ValidationError(
                "pool max must be greater than 0".to_string(),
            ));
        }

        if self.pool.min > self.pool.max {
            return Err(ConfigError::ValidationError(format!(
                "pool min ({}) cannot exceed max ({})",
                self.pool.min, self.pool.max
            )));
        }

        for (name, value) in [
            ("connection_timeout_ms", self.pool.connection_timeout_ms),
            ("acquire_timeout_ms", self.pool.acquire_timeout_ms),
            ("statement_timeout_ms", self.pool.statement_timeout_ms),
            ("idle_timeout_ms", self.pool.idle_timeout_ms),
            ("eviction_interval_ms", self.pool.eviction_interval_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "pool {} must be greater than 0",
                    name
                )));
            }
        }

        // Validate nodes
        let mut ids = HashSet::new();
        for (id, endpoint, role) in self.nodes() {
            if endpoint.host.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "{} node '{}' has an empty host",
                    role, id
                )));
            }
            if endpoint.port == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "{} node '{}' has an invalid port",
                    role, id
                )));
            }
            if !ids.insert(id.clone()) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate node id '{}'",
                    id
                )));
            }
        }

        // Validate health config
        if self.replication.health_check_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health_check_interval_ms must be greater than 0".to_string(),
            ));
        }

        if self.replication.health_check_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "health_check_timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.replication.health_check_timeout_ms >= self.replication.health_check_interval_ms {
            return Err(ConfigError::ValidationError(
                "health_check_timeout_ms must be less than health_check_interval_ms".to_string(),
            ));
        }

        if self.replication.failure_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "failure_threshold must be greater than 0".to_string(),
            ));
        }

        // Validate failover config
        if self.failover.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "failover timeout_ms must be greater than 0".to_string(),
            ));
        }

        if self.failover.poll_interval_ms == 0
            || self.failover.poll_interval_ms > self.failover.timeout_ms
        {
            return Err(ConfigError::ValidationError(
                "failover poll_interval_ms must be between 1 and timeout_ms".to_string(),
            ));
        }

        if self.queue.enabled && self.queue.max_concurrent == 0 {
            return Err(ConfigError::ValidationError(
                "queue max_concurrent must be greater than 0".to_string(),
            ));
        }

        // Validate logging config
        match self.logging.level.as_str() {
            "error" | "warn" | "info" | "debug" | "trace" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log level: {}", self.logging.level)
            )),
        }

        match self.logging.format.as_str() {
            "text" | "compact" => {}
            _ => return Err(ConfigError::ValidationError(
                format!("Invalid log format: {}", self.logging.format)
            )),
        }

        Ok(())
    }

    /// Create example configuration file with `replicas` read replicas
    pub fn create_example_config<P: AsRef<Path>>(path: P, replicas: usize) -> Result<(), ConfigError> {
        let config = Config {
            primary: Endpoint::new("10.0.1.10", 5432).with_id("primary"),
            replication: ReplicationSection {
                replicas: (1..=replicas)
                    .map(|i| {
                        Endpoint::new(format!("10.0.1.{}", 10 + i), 5432)
                            .with_id(format!("replica-{}", i))
                    })
                    .collect(),
                ..Config::default().replication
            },
            ..Default::default()
        };

        config.validate()?;
        config.save_to_file(path)
    }
}
