/// Unified error handling for replipool
///
/// This module provides the error type system shared by the resource pool,
/// connection pools, the query router, the health monitor and the failover
/// manager. Driver adapters report failures through [`DriverError`], which the
/// connection pool maps onto the pool-level kinds callers act on.

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for replipool operations
#[derive(Debug, Error)]
pub enum PoolError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No resource became available within the acquire window
    #[error("Connection timeout: no connection available for {pool} within {timeout_ms}ms")]
    ConnectionTimeout { pool: String, timeout_ms: u64 },

    /// A statement exceeded its time budget
    #[error("Query timeout on {node_id} after {timeout_ms}ms")]
    QueryTimeout { node_id: String, timeout_ms: u64 },

    /// Transport-level failure talking to a node
    #[error("Node unreachable: {node_id}: {message}")]
    NodeUnreachable { node_id: String, message: String },

    /// The database rejected the statement
    #[error("Query failed on {node_id}: {message}")]
    Query { node_id: String, message: String },

    /// The pool is draining or closed and accepts no new acquires
    #[error("Pool {pool} is closed")]
    PoolClosed { pool: String },

    /// Another failover attempt is running
    #[error("Failover already in progress")]
    FailoverInProgress,

    /// The last successful failover is too recent
    #[error("Failover cooldown active: {remaining_ms}ms remaining")]
    FailoverCooldown { remaining_ms: u64 },

    /// No replica qualified for promotion
    #[error("No failover candidate: {message}")]
    NoFailoverCandidate { message: String },

    /// The promoted replica never became writable
    #[error("Promotion of {node_id} timed out after {timeout_ms}ms")]
    PromotionTimeout { node_id: String, timeout_ms: u64 },

    /// The promotion request was refused by the node
    #[error("Promotion of {node_id} rejected: {message}")]
    PromotionFailed { node_id: String, message: String },

    /// A node in the replica role still accepts writes, e.g. a demoted
    /// primary that never rejoined replication
    #[error("Node {node_id} is listed as a replica but accepts writes")]
    WritableReplica { node_id: String },

    /// A queued query was rejected before it started
    #[error("Queued query rejected: {reason}")]
    QueueCleared { reason: String },

    /// Unknown node identifier
    #[error("Unknown node: {node_id}")]
    UnknownNode { node_id: String },

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
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

/// Errors reported by a database driver adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DriverError {
    /// The connection or network failed; the connection must not be reused
    #[error("transport error: {0}")]
    Transport(String),

    /// The server rejected the statement; the connection is still usable
    #[error("statement error: {0}")]
    Statement(String),

    /// The connection was already closed
    #[error("connection closed")]
    Closed,
}

impl From<io::Error> for DriverError {
    fn from(err: io::Error) -> Self {
        DriverError::Transport(err.to_string())
    }
}

impl DriverError {
    /// Whether the connection that produced this error is broken
    pub fn is_transport(&self) -> bool {
        matches!(self, DriverError::Transport(_) | DriverError::Closed)
    }
}

/// Result type alias for replipool operations
pub type PoolResult<T> = Result<T, PoolError>;

/// Convenience methods for creating specific error types
impl PoolError {
    /// Map a driver error raised while talking to `node_id`
    pub fn from_driver<S: Into<String>>(node_id: S, err: DriverError) -> Self {
        match err {
            DriverError::Statement(message) => PoolError::Query {
                node_id: node_id.into(),
                message,
            },
            other => PoolError::NodeUnreachable {
                node_id: node_id.into(),
                message: other.to_string(),
            },
        }
    }

    /// Create a node unreachable error
    pub fn unreachable<S: Into<String>, M: Into<String>>(node_id: S, message: M) -> Self {
        PoolError::NodeUnreachable {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query<S: Into<String>, M: Into<String>>(node_id: S, message: M) -> Self {
        PoolError::Query {
            node_id: node_id.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        PoolError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is recoverable (the same call may be retried)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            PoolError::ConnectionTimeout { .. }
                | PoolError::QueryTimeout { .. }
                | PoolError::NodeUnreachable { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            PoolError::Config(_) => ErrorSeverity::Critical,
            PoolError::Internal { .. } => ErrorSeverity::Critical,
            PoolError::PromotionTimeout { .. } => ErrorSeverity::Critical,
            PoolError::PromotionFailed { .. } => ErrorSeverity::Critical,
            PoolError::NoFailoverCandidate { .. } => ErrorSeverity::Critical,
            PoolError::WritableReplica { .. } => ErrorSeverity::Critical,
            PoolError::ConnectionTimeout { .. } => ErrorSeverity::Warning,
            PoolError::QueryTimeout { .. } => ErrorSeverity::Warning,
            PoolError::NodeUnreachable { .. } => ErrorSeverity::Warning,
            PoolError::FailoverInProgress => ErrorSeverity::Info,
            PoolError::FailoverCooldown { .. } => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about recoverable issues
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let error = PoolError::unreachable("replica-1", "connection refused");
        assert!(matches!(error, PoolError::NodeUnreachable { .. }));
        assert_eq!(
            error.to_string(),
            "Node unreachable: replica-1: connection refused"
        );
    }

    #[test]
    fn test_driver_error_mapping() {
        let statement = PoolError::from_driver("primary", DriverError::Statement("syntax".into()));
        assert!(matches!(statement, PoolError::Query { .. }));

        let transport = PoolError::from_driver("primary", DriverError::Transport("reset".into()));
        assert!(matches!(transport, PoolError::NodeUnreachable { .. }));

        let closed = PoolError::from_driver("primary", DriverError::Closed);
        assert!(matches!(closed, PoolError::NodeUnreachable { .. }));
    }

    #[test]
    fn test_error_severity() {
        let config_error = PoolError::Config(ConfigError::ValidationError("test".to_string()));
        assert_eq!(config_error.severity(), ErrorSeverity::Critical);

        let timeout = PoolError::QueryTimeout {
            node_id: "primary".into(),
            timeout_ms: 10,
        };
        assert_eq!(timeout.severity(), ErrorSeverity::Warning);
        assert_eq!(PoolError::FailoverInProgress.severity(), ErrorSeverity::Info);
    }

    #[test]
    fn test_error_recoverability() {
        let timeout = PoolError::ConnectionTimeout {
            pool: "primary".into(),
            timeout_ms: 100,
        };
        assert!(timeout.is_recoverable());

        let statement = PoolError::query("primary", "duplicate key");
        assert!(!statement.is_recoverable());

        assert!(!PoolError::FailoverCooldown { remaining_ms: 5 }.is_recoverable());
    }

    #[test]
    fn test_io_error_is_transport() {
        let err: DriverError = io::Error::new(io::ErrorKind::ConnectionReset, "reset").into();
        assert!(err.is_transport());
        assert!(!DriverError::Statement("bad".into()).is_transport());
    }
}
