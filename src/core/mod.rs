/// Core abstractions shared by the pools, the router and the failover manager
pub mod connection;
pub mod resource;
pub mod topology;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::SystemTime;

pub use connection::{ConnectionPool, PoolConfig, PoolHealth, PoolStats, PooledConnection, QueryOptions, Transaction};
pub use resource::{ConnectionInfo, PooledResource, ResourceManager, ResourcePool, ResourcePoolConfig};
pub use topology::Topology;

/// Lag recorded for a node whose probe failed. Large enough that every
/// lag-based comparison treats the node as the worst possible choice.
pub const LAG_UNREACHABLE_MS: u64 = u64::MAX;

/// Network location and credentials of a database node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Node identifier; derived from the configuration position when omitted
    #[serde(default)]
    pub id: Option<String>,
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub database: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            id: None,
            host: host.into(),
            port,
            database: None,
            user: None,
            password: None,
        }
    }

    pub fn with_id<S: Into<String>>(mut self, id: S) -> Self {
        self.id = Some(id.into());
        self
    }

    /// `host:port` form used by drivers and in logs
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Role of a node in the replication topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Replica,
}

/// Health of a node as last observed by the health monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeStatus::Healthy => write!(f, "healthy"),
            NodeStatus::Unhealthy => write!(f, "unhealthy"),
            NodeStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// A database node (primary or replica)
#[derive(Debug, Clone)]
pub struct Node {
    pub id: String,
    pub endpoint: Endpoint,
    pub role: NodeRole,
    pub status: NodeStatus,
    /// Replication lag in milliseconds; always 0 for the primary
    pub lag_ms: u64,
    pub last_probe: Option<SystemTime>,
    /// Connections currently checked out of the node's pool
    pub connections: usize,
    /// Queries per second observed between the last two probes
    pub throughput: f64,
}

impl Node {
    pub fn new<S: Into<String>>(id: S, endpoint: Endpoint, role: NodeRole) -> Self {
        Self {
            id: id.into(),
            endpoint,
            role,
            status: NodeStatus::Unknown,
            lag_ms: 0,
            last_probe: None,
            connections: 0,
            throughput: 0.0,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }

    pub fn is_healthy(&self) -> bool {
        self.status == NodeStatus::Healthy
    }
}

/// A statement parameter or a column value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Value {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::Float(v) => Some(*v as i64),
            Value::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            Value::Int(v) => Some(*v != 0),
            Value::Text(s) => match s.trim() {
                "t" | "true" | "TRUE" | "1" => Some(true),
                "f" | "false" | "FALSE" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }
}

/// A result row
pub type Row = Vec<Value>;

/// Rows returned by a statement plus the affected-row count
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

impl QueryResult {
    pub fn from_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            rows_affected: 0,
        }
    }

    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows: Vec::new(),
            rows_affected,
        }
    }

    /// First column of the first row
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.first())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_address() {
        let endpoint = Endpoint::new("10.0.0.5", 5432).with_id("primary");
        assert_eq!(endpoint.address(), "10.0.0.5:5432");
        assert_eq!(endpoint.id.as_deref(), Some("primary"));
    }

    #[test]
    fn test_new_node_is_unknown() {
        let node = Node::new("replica-1", Endpoint::new("localhost", 5433), NodeRole::Replica);
        assert_eq!(node.status, NodeStatus::Unknown);
        assert!(!node.is_healthy());
        assert!(!node.is_primary());
        assert!(node.last_probe.is_none());
    }

    #[test]
    fn test_value_conversions() {
        assert_eq!(Value::Int(42).as_i64(), Some(42));
        assert_eq!(Value::Text(" 17 ".into()).as_i64(), Some(17));
        assert_eq!(Value::Text("t".into()).as_bool(), Some(true));
        assert_eq!(Value::Int(0).as_bool(), Some(false));
        assert_eq!(Value::Null.as_bool(), None);
    }

    #[test]
    fn test_query_result_scalar() {
        let result = QueryResult::from_rows(vec![vec![Value::Int(1), Value::Null]]);
        assert_eq!(result.scalar(), Some(&Value::Int(1)));
        assert_eq!(QueryResult::affected(3).scalar(), None);
    }
}
