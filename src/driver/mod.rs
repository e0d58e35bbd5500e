/// Database driver capability
///
/// The pools never speak a wire protocol themselves. A driver adapter
/// supplies connections ([`Driver`], [`Connection`]) and, for replication
/// management, the vendor-specific lag/writability checks
/// ([`ReplicationProbe`]) and promotion primitive ([`Promotable`]).
pub mod memory;

use crate::core::{Endpoint, QueryResult, Value};
use crate::error::DriverError;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

/// Opens connections to an endpoint
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, DriverError>;
}

/// A live database connection
#[async_trait]
pub trait Connection: Send + Sync {
    /// Execute a statement
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<QueryResult, DriverError>;

    /// Start a transaction at the given isolation level
    async fn begin(&self, isolation: IsolationLevel) -> Result<(), DriverError> {
        let sql = format!("BEGIN ISOLATION LEVEL {}", isolation.to_sql());
        self.execute(&sql, &[]).await.map(|_| ())
    }

    async fn commit(&self) -> Result<(), DriverError> {
        self.execute("COMMIT", &[]).await.map(|_| ())
    }

    async fn rollback(&self) -> Result<(), DriverError> {
        self.execute("ROLLBACK", &[]).await.map(|_| ())
    }

    /// Check if the connection is still usable
    async fn is_valid(&self) -> bool {
        self.execute("SELECT 1", &[]).await.is_ok()
    }

    /// Close the connection
    async fn close(&self) -> Result<(), DriverError>;
}

/// Reports replication state of the node a connection points at
#[async_trait]
pub trait ReplicationProbe: Send + Sync {
    /// Replication lag in milliseconds (0 on a primary)
    async fn current_lag_ms(&self, conn: &dyn Connection) -> Result<u64, DriverError>;

    /// Whether the node accepts writes
    async fn is_writable(&self, conn: &dyn Connection) -> Result<bool, DriverError>;
}

/// Promotes a replica to primary
#[async_trait]
pub trait Promotable: Send + Sync {
    /// Request promotion; `Ok(false)` means the node refused
    async fn promote(&self, conn: &dyn Connection) -> Result<bool, DriverError>;
}

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum IsolationLevel {
    ReadUncommitted,
    #[default]
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// SQL spelling used after `ISOLATION LEVEL`
    pub fn to_sql(&self) -> &'static str {
        match self {
            Self::ReadUncommitted => "READ UNCOMMITTED",
            Self::ReadCommitted => "READ COMMITTED",
            Self::RepeatableRead => "REPEATABLE READ",
            Self::Serializable => "SERIALIZABLE",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

/// [`ReplicationProbe`] and [`Promotable`] implemented with plain SQL
/// statements run over the pooled connection
#[derive(Debug, Clone)]
pub struct SqlReplicationProbe {
    pub lag_sql: String,
    pub writable_sql: String,
    pub promote_sql: String,
}

impl SqlReplicationProbe {
    /// PostgreSQL streaming replication
    pub fn postgres() -> Self {
        Self {
            lag_sql: "SELECT COALESCE(CAST(EXTRACT(EPOCH FROM (now() - pg_last_xact_replay_timestamp())) * 1000 AS BIGINT), 0)".to_string(),
            writable_sql: "SELECT NOT pg_is_in_recovery()".to_string(),
            promote_sql: "SELECT pg_promote()".to_string(),
        }
    }

    async fn scalar(&self, conn: &dyn Connection, sql: &str) -> Result<Value, DriverError> {
        let result = conn.execute(sql, &[]).await?;
        result
            .scalar()
            .cloned()
            .ok_or_else(|| DriverError::Statement(format!("no rows returned by `{}`", sql)))
    }
}

impl Default for SqlReplicationProbe {
    fn default() -> Self {
        Self::postgres()
    }
}

#[async_trait]
impl ReplicationProbe for SqlReplicationProbe {
    async fn current_lag_ms(&self, conn: &dyn Connection) -> Result<u64, DriverError> {
        let value = self.scalar(conn, &self.lag_sql).await?;
        match value {
            Value::Null => Ok(0),
            other => other
                .as_i64()
                .map(|lag| lag.max(0) as u64)
                .ok_or_else(|| DriverError::Statement(format!("unexpected lag value {:?}", other))),
        }
    }

    async fn is_writable(&self, conn: &dyn Connection) -> Result<bool, DriverError> {
        let value = self.scalar(conn, &self.writable_sql).await?;
        value
            .as_bool()
            .ok_or_else(|| DriverError::Statement(format!("unexpected writable value {:?}", value)))
    }
}

#[async_trait]
impl Promotable for SqlReplicationProbe {
    async fn promote(&self, conn: &dyn Connection) -> Result<bool, DriverError> {
        let value = self.scalar(conn, &self.promote_sql).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

/// The capabilities a replication pool needs from a driver integration
#[derive(Clone)]
pub struct Adapter {
    pub driver: Arc<dyn Driver>,
    pub probe: Arc<dyn ReplicationProbe>,
    pub promoter: Arc<dyn Promotable>,
}

impl Adapter {
    pub fn new(
        driver: Arc<dyn Driver>,
        probe: Arc<dyn ReplicationProbe>,
        promoter: Arc<dyn Promotable>,
    ) -> Self {
        Self {
            driver,
            probe,
            promoter,
        }
    }

    /// Pair a driver with the SQL-based probe using PostgreSQL statements
    pub fn postgres(driver: Arc<dyn Driver>) -> Self {
        let probe = Arc::new(SqlReplicationProbe::postgres());
        Self {
            driver,
            probe: probe.clone(),
            promoter: probe,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedConnection {
        reply: Value,
        executed: Mutex<Vec<String>>,
    }

    impl ScriptedConnection {
        fn new(reply: Value) -> Self {
            Self {
                reply,
                executed: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl Connection for ScriptedConnection {
        async fn execute(&self, sql: &str, _params: &[Value]) -> Result<QueryResult, DriverError> {
            self.executed.lock().unwrap().push(sql.to_string());
            Ok(QueryResult::from_rows(vec![vec![self.reply.clone()]]))
        }

        async fn close(&self) -> Result<(), DriverError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_default_transaction_statements() {
        let conn = ScriptedConnection::new(Value::Null);
        conn.begin(IsolationLevel::Serializable).await.unwrap();
        conn.commit().await.unwrap();
        conn.rollback().await.unwrap();

        let executed = conn.executed.lock().unwrap().clone();
        assert_eq!(
            executed,
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE", "COMMIT", "ROLLBACK"]
        );
    }

    #[tokio::test]
    async fn test_sql_probe_lag() {
        let probe = SqlReplicationProbe::postgres();

        let conn = ScriptedConnection::new(Value::Int(250));
        assert_eq!(probe.current_lag_ms(&conn).await.unwrap(), 250);

        let conn = ScriptedConnection::new(Value::Null);
        assert_eq!(probe.current_lag_ms(&conn).await.unwrap(), 0);

        let conn = ScriptedConnection::new(Value::Int(-4));
        assert_eq!(probe.current_lag_ms(&conn).await.unwrap(), 0);

        let conn = ScriptedConnection::new(Value::Bytes(vec![1]));
        assert!(probe.current_lag_ms(&conn).await.is_err());
    }

    #[tokio::test]
    async fn test_sql_probe_writable_and_promote() {
        let probe = SqlReplicationProbe::postgres();

        let conn = ScriptedConnection::new(Value::Bool(true));
        assert!(probe.is_writable(&conn).await.unwrap());
        assert!(probe.promote(&conn).await.unwrap());

        let executed = conn.executed.lock().unwrap().clone();
        assert_eq!(executed[0], "SELECT NOT pg_is_in_recovery()");
        assert_eq!(executed[1], "SELECT pg_promote()");
    }

    #[test]
    fn test_isolation_level_sql() {
        assert_eq!(IsolationLevel::default(), IsolationLevel::ReadCommitted);
        assert_eq!(IsolationLevel::RepeatableRead.to_string(), "REPEATABLE READ");
    }
}
