/// In-memory simulated cluster
///
/// Each simulated node answers statements over [`Connection::execute`] the
/// way a PostgreSQL node would for the statements replipool itself issues
/// (liveness, lag, recovery state, promotion). Reachability, lag, latency,
/// injected statement failures and promotion behaviour are adjustable at run
/// time so failure scenarios can be scripted.
use super::{Connection, Driver};
use crate::core::{Endpoint, QueryResult, Value};
use crate::error::DriverError;
use crate::routing::classify::{classify, StatementKind};
use async_trait::async_trait;
use fnv::FnvHashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// How a simulated node reacts to a promotion request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromotionBehavior {
    /// Writable as soon as promotion is requested
    Immediate,
    /// Writable once the given time has passed since the request
    After(Duration),
    /// Accepts the request but never leaves recovery
    Never,
    /// Refuses the request
    Refuse,
}

#[derive(Debug)]
struct Promotion {
    behavior: PromotionBehavior,
    requested_at: Option<Instant>,
}

/// One simulated database server
#[derive(Debug)]
pub struct MemoryNode {
    address: String,
    reachable: AtomicBool,
    writable: AtomicBool,
    lag_ms: AtomicU64,
    latency_ms: AtomicU64,
    failing_statements: AtomicU32,
    dropping_statements: AtomicU32,
    promotion: Mutex<Promotion>,
    executed: Mutex<Vec<String>>,
    open_connections: AtomicUsize,
    connects: AtomicUsize,
}

impl MemoryNode {
    fn new(address: String, writable: bool) -> Self {
        Self {
            address,
            reachable: AtomicBool::new(true),
            writable: AtomicBool::new(writable),
            lag_ms: AtomicU64::new(0),
            latency_ms: AtomicU64::new(0),
            failing_statements: AtomicU32::new(0),
            dropping_statements: AtomicU32::new(0),
            promotion: Mutex::new(Promotion {
                behavior: PromotionBehavior::Immediate,
                requested_at: None,
            }),
            executed: Mutex::new(Vec::new()),
            open_connections: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn set_lag_ms(&self, lag_ms: u64) {
        self.lag_ms.store(lag_ms, Ordering::SeqCst);
    }

    /// Delay applied to every statement
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Make the next `count` ordinary statements fail with a statement error
    pub fn fail_next(&self, count: u32) {
        self.failing_statements.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` statements fail at the transport level
    pub fn drop_next(&self, count: u32) {
        self.dropping_statements.store(count, Ordering::SeqCst);
    }

    pub fn set_promotion(&self, behavior: PromotionBehavior) {
        let mut promotion = self.promotion.lock().unwrap_or_else(|e| e.into_inner());
        promotion.behavior = behavior;
    }

    pub fn is_writable(&self) -> bool {
        if self.writable.load(Ordering::SeqCst) {
            return true;
        }

        let promotion = self.promotion.lock().unwrap_or_else(|e| e.into_inner());
        let promoted = match (promotion.behavior, promotion.requested_at) {
            (PromotionBehavior::Immediate, Some(_)) => true,
            (PromotionBehavior::After(delay), Some(at)) => at.elapsed() >= delay,
            _ => false,
        };
        if promoted {
            self.writable.store(true, Ordering::SeqCst);
        }
        promoted
    }

    /// Demote to a read-only replica
    pub fn set_writable(&self, writable: bool) {
        self.writable.store(writable, Ordering::SeqCst);
        if !writable {
            let mut promotion = self.promotion.lock().unwrap_or_else(|e| e.into_inner());
            promotion.requested_at = None;
        }
    }

    /// Every statement received so far, in order
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of received statements equal to `sql`
    pub fn executed_count(&self, sql: &str) -> usize {
        self.executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.as_str() == sql)
            .count()
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::SeqCst)
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    fn respond(&self, sql: &str) -> Result<QueryResult, DriverError> {
        if sql.contains("pg_last_xact_replay_timestamp") {
            let lag = if self.is_writable() {
                0
            } else {
                self.lag_ms.load(Ordering::SeqCst)
            };
            return Ok(single(Value::Int(lag as i64)));
        }
        if sql.contains("pg_is_in_recovery") {
            return Ok(single(Value::Bool(self.is_writable())));
        }
        if sql.contains("pg_promote") {
            let mut promotion = self.promotion.lock().unwrap_or_else(|e| e.into_inner());
            if promotion.behavior == PromotionBehavior::Refuse {
                return Ok(single(Value::Bool(false)));
            }
            promotion.requested_at.get_or_insert_with(Instant::now);
            return Ok(single(Value::Bool(true)));
        }

        let failing = self.failing_statements.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_statements.store(failing - 1, Ordering::SeqCst);
            return Err(DriverError::Statement("simulated statement failure".to_string()));
        }

        let kind = classify(sql);
        if kind != StatementKind::Read && !self.is_writable() {
            return Err(DriverError::Statement(
                "cannot execute statement in a read-only transaction".to_string(),
            ));
        }

        Ok(QueryResult {
            rows: vec![vec![Value::Text(self.address.clone())]],
            rows_affected: if kind == StatementKind::Write { 1 } else { 0 },
        })
    }
}

fn single(value: Value) -> QueryResult {
    QueryResult::from_rows(vec![vec![value]])
}

/// Connection to a [`MemoryNode`]
pub struct MemoryConnection {
    node: Arc<MemoryNode>,
    open: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn execute(&self, sql: &str, _params: &[Value]) -> Result<QueryResult, DriverError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(DriverError::Closed);
        }

        let latency = self.node.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if !self.node.is_reachable() {
            return Err(DriverError::Transport("connection reset by peer".to_string()));
        }

        let dropping = self.node.dropping_statements.load(Ordering::SeqCst);
        if dropping > 0 {
            self.node
                .dropping_statements
                .store(dropping - 1, Ordering::SeqCst);
            return Err(DriverError::Transport("connection dropped".to_string()));
        }

        self.node
            .executed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sql.to_string());

        self.node.respond(sql)
    }

    async fn close(&self) -> Result<(), DriverError> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.node.open_connections.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

/// A set of simulated nodes addressed by `host:port`
#[derive(Debug, Default)]
pub struct MemoryCluster {
    nodes: RwLock<FnvHashMap<String, Arc<MemoryNode>>>,
}

impl MemoryCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Writable primary plus read-only replicas
    pub fn for_endpoints(primary: &Endpoint, replicas: &[Endpoint]) -> Arc<Self> {
        let cluster = Self::new();
        cluster.add_node(primary, true);
        for replica in replicas {
            cluster.add_node(replica, false);
        }
        cluster
    }

    pub fn add_node(&self, endpoint: &Endpoint, writable: bool) -> Arc<MemoryNode> {
        let node = Arc::new(MemoryNode::new(endpoint.address(), writable));
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(endpoint.address(), Arc::clone(&node));
        node
    }

    pub fn node(&self, address: &str) -> Option<Arc<MemoryNode>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(address).cloned()
    }

    pub fn driver(self: &Arc<Self>) -> MemoryDriver {
        MemoryDriver {
            cluster: Arc::clone(self),
        }
    }
}

/// [`Driver`] connecting to a [`MemoryCluster`]
#[derive(Clone)]
pub struct MemoryDriver {
    cluster: Arc<MemoryCluster>,
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>, DriverError> {
        let address = endpoint.address();
        let node = self
            .cluster
            .node(&address)
            .ok_or_else(|| DriverError::Transport(format!("no route to host {}", address)))?;

        if !node.is_reachable() {
            return Err(DriverError::Transport(format!("connection refused by {}", address)));
        }

        node.connects.fetch_add(1, Ordering::SeqCst);
        node.open_connections.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            node,
            open: AtomicBool::new(true),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{Promotable, ReplicationProbe, SqlReplicationProbe};

    fn cluster() -> (Arc<MemoryCluster>, Endpoint, Endpoint) {
        let primary = Endpoint::new("127.0.0.1", 5432);
        let replica = Endpoint::new("127.0.0.1", 5433);
        let cluster = MemoryCluster::for_endpoints(&primary, &[replica.clone()]);
        (cluster, primary, replica)
    }

    #[tokio::test]
    async fn test_connect_and_execute() {
        let (cluster, primary, _) = cluster();
        let driver = cluster.driver();

        let conn = driver.connect(&primary).await.unwrap();
        let result = conn.execute("SELECT 1", &[]).await.unwrap();
        assert_eq!(result.scalar(), Some(&Value::Text("127.0.0.1:5432".into())));

        let node = cluster.node("127.0.0.1:5432").unwrap();
        assert_eq!(node.open_connections(), 1);
        conn.close().await.unwrap();
        assert_eq!(node.open_connections(), 0);
        assert_eq!(conn.execute("SELECT 1", &[]).await, Err(DriverError::Closed));
    }

    #[tokio::test]
    async fn test_unreachable_node() {
        let (cluster, primary, _) = cluster();
        let driver = cluster.driver();
        let node = cluster.node(&primary.address()).unwrap();

        let conn = driver.connect(&primary).await.unwrap();
        node.set_reachable(false);

        let err = conn.execute("SELECT 1", &[]).await.unwrap_err();
        assert!(err.is_transport());
        assert!(driver.connect(&primary).await.is_err());
    }

    #[tokio::test]
    async fn test_replica_rejects_writes() {
        let (cluster, _, replica) = cluster();
        let conn = cluster.driver().connect(&replica).await.unwrap();

        let err = conn
            .execute("INSERT INTO users VALUES (1)", &[])
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Statement(_)));
        assert!(conn.execute("SELECT * FROM users", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_lag_and_promotion_through_sql_probe() {
        let (cluster, _, replica) = cluster();
        let node = cluster.node(&replica.address()).unwrap();
        node.set_lag_ms(1200);

        let conn = cluster.driver().connect(&replica).await.unwrap();
        let probe = SqlReplicationProbe::postgres();

        assert_eq!(probe.current_lag_ms(conn.as_ref()).await.unwrap(), 1200);
        assert!(!probe.is_writable(conn.as_ref()).await.unwrap());

        assert!(probe.promote(conn.as_ref()).await.unwrap());
        assert!(probe.is_writable(conn.as_ref()).await.unwrap());
        assert_eq!(probe.current_lag_ms(conn.as_ref()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_and_delayed_promotion() {
        let (cluster, _, replica) = cluster();
        let node = cluster.node(&replica.address()).unwrap();
        let conn = cluster.driver().connect(&replica).await.unwrap();
        let probe = SqlReplicationProbe::postgres();

        node.set_promotion(PromotionBehavior::Refuse);
        assert!(!probe.promote(conn.as_ref()).await.unwrap());

        node.set_promotion(PromotionBehavior::After(Duration::from_millis(30)));
        assert!(probe.promote(conn.as_ref()).await.unwrap());
        assert!(!node.is_writable());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(node.is_writable());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let (cluster, primary, _) = cluster();
        let node = cluster.node(&primary.address()).unwrap();
        let conn = cluster.driver().connect(&primary).await.unwrap();

        node.fail_next(1);
        assert!(conn.execute("SELECT 1", &[]).await.is_err());
        assert!(conn.execute("SELECT 1", &[]).await.is_ok());
        assert_eq!(node.executed_count("SELECT 1"), 2);
    }
}
