/// Database connection pooling
///
/// A [`ConnectionPool`] specializes the generic [`ResourcePool`] for
/// connections to one endpoint: statements run under a timeout, transient
/// failures may be retried, transactions are scoped to one connection, and
/// rolling statistics feed the pool's health report.
use crate::core::resource::{ConnectionInfo, PooledResource, ResourceManager, ResourcePool, ResourcePoolConfig};
use crate::core::{Endpoint, QueryResult, Value};
use crate::driver::{Connection, Driver, IsolationLevel};
use crate::error::{PoolError, PoolResult};
use crate::events::EventBus;
use crate::utils::SampleWindow;
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Number of acquire/query timings kept for the rolling averages
pub const SAMPLE_WINDOW: usize = 1000;

const UTILIZATION_WARNING: f64 = 0.8;
const WAITING_WARNING: usize = 10;
const ACQUIRE_TIME_WARNING_MS: f64 = 100.0;
const ERROR_RATE_WARNING: f64 = 0.01;

/// Connection pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Target endpoint and credentials
    pub endpoint: Endpoint,
    pub min: usize,
    pub max: usize,
    pub connect_timeout: Duration,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub statement_timeout: Duration,
    pub eviction_interval: Duration,
    /// Run a liveness check before handing out an idle connection
    pub validate_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::new("127.0.0.1", 5432),
            min: 2,
            max: 10,
            connect_timeout: Duration::from_secs(5),
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            statement_timeout: Duration::from_secs(30),
            eviction_interval: Duration::from_secs(30),
            validate_on_checkout: true,
        }
    }
}

impl PoolConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            ..Default::default()
        }
    }

    pub fn with_min(mut self, min: usize) -> Self {
        self.min = min;
        self
    }

    pub fn with_max(mut self, max: usize) -> Self {
        self.max = max;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }

    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_validate_on_checkout(mut self, validate: bool) -> Self {
        self.validate_on_checkout = validate;
        self
    }

    fn resource_config(&self) -> ResourcePoolConfig {
        ResourcePoolConfig {
            min: self.min,
            max: self.max,
            acquire_timeout: self.acquire_timeout,
            idle_timeout: self.idle_timeout,
            eviction_interval: self.eviction_interval,
        }
    }
}

/// Per-call execution options
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overrides the pool's statement timeout
    pub timeout: Option<Duration>,
    /// Extra attempts allowed after a recoverable failure
    pub retries: u32,
}

impl QueryOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// Opens connections for one endpoint
pub struct ConnectionFactory {
    node_id: String,
    driver: Arc<dyn Driver>,
    endpoint: Endpoint,
    connect_timeout: Duration,
    validate_on_checkout: bool,
}

#[async_trait]
impl ResourceManager for ConnectionFactory {
    type Resource = Arc<dyn Connection>;

    async fn create(&self) -> PoolResult<Arc<dyn Connection>> {
        match tokio::time::timeout(self.connect_timeout, self.driver.connect(&self.endpoint)).await {
            Ok(Ok(conn)) => {
                debug!("Opened connection to {} ({})", self.node_id, self.endpoint.address());
                Ok(Arc::from(conn))
            }
            Ok(Err(e)) => Err(PoolError::from_driver(&self.node_id, e)),
            Err(_) => Err(PoolError::unreachable(
                &self.node_id,
                format!(
                    "connect timed out after {}ms",
                    self.connect_timeout.as_millis()
                ),
            )),
        }
    }

    async fn validate(&self, conn: &Arc<dyn Connection>) -> bool {
        if self.validate_on_checkout {
            conn.is_valid().await
        } else {
            true
        }
    }

    async fn destroy(&self, conn: Arc<dyn Connection>) {
        if let Err(e) = conn.close().await {
            debug!("Error closing connection to {}: {}", self.node_id, e);
        }
    }
}

/// Running counters and timing windows
struct PoolMetrics {
    acquire_ms: Mutex<SampleWindow>,
    query_ms: Mutex<SampleWindow>,
    queries: AtomicU64,
    errors: AtomicU64,
}

impl PoolMetrics {
    fn new() -> Self {
        Self {
            acquire_ms: Mutex::new(SampleWindow::new(SAMPLE_WINDOW)),
            query_ms: Mutex::new(SampleWindow::new(SAMPLE_WINDOW)),
            queries: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    fn record_acquire(&self, elapsed: Duration) {
        let mut window = self.acquire_ms.lock().unwrap_or_else(|e| e.into_inner());
        window.push(elapsed.as_secs_f64() * 1000.0);
    }

    fn record_query(&self, elapsed: Duration) {
        let mut window = self.query_ms.lock().unwrap_or_else(|e| e.into_inner());
        window.push(elapsed.as_secs_f64() * 1000.0);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn avg_acquire_ms(&self) -> f64 {
        self.acquire_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .average()
    }

    fn avg_query_ms(&self) -> f64 {
        self.query_ms
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .average()
    }
}

/// Point-in-time pool statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub active: usize,
    pub creating: usize,
    pub waiting: usize,
    pub max: usize,
    pub avg_acquire_ms: f64,
    pub avg_query_ms: f64,
    pub total_queries: u64,
    pub errors: u64,
}

impl PoolStats {
    /// Fraction of `max` currently checked out
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            0.0
        } else {
            self.active as f64 / self.max as f64
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.errors as f64 / self.total_queries as f64
        }
    }
}

/// Health report derived from [`PoolStats`]
#[derive(Debug, Clone)]
pub struct PoolHealth {
    pub healthy: bool,
    pub warnings: Vec<String>,
    pub stats: PoolStats,
}

/// Run a statement on `conn`, racing the timeout
async fn execute_with_timeout(
    conn: &dyn Connection,
    node_id: &str,
    sql: &str,
    params: &[Value],
    timeout: Duration,
) -> PoolResult<QueryResult> {
    match tokio::time::timeout(timeout, conn.execute(sql, params)).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(e)) => Err(PoolError::from_driver(node_id, e)),
        Err(_) => Err(PoolError::QueryTimeout {
            node_id: node_id.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}

/// Whether an error leaves the connection in an unusable state
fn connection_broken(err: &PoolError) -> bool {
    matches!(
        err,
        PoolError::NodeUnreachable { .. } | PoolError::QueryTimeout { .. }
    )
}

/// Pool of connections to a single database node
pub struct ConnectionPool {
    node_id: String,
    config: PoolConfig,
    pool: ResourcePool<ConnectionFactory>,
    metrics: Arc<PoolMetrics>,
}

impl ConnectionPool {
    pub fn new<S: Into<String>>(
        node_id: S,
        config: PoolConfig,
        driver: Arc<dyn Driver>,
        events: EventBus,
    ) -> Self {
        let node_id = node_id.into();
        let factory = ConnectionFactory {
            node_id: node_id.clone(),
            driver,
            endpoint: config.endpoint.clone(),
            connect_timeout: config.connect_timeout,
            validate_on_checkout: config.validate_on_checkout,
        };
        let pool = ResourcePool::new(node_id.clone(), factory, config.resource_config(), events);

        Self {
            node_id,
            config,
            pool,
            metrics: Arc::new(PoolMetrics::new()),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Open connections until `min` are pooled
    pub async fn warmup(&self) -> PoolResult<usize> {
        self.pool.warmup().await
    }

    pub fn start_eviction(&self) -> JoinHandle<()> {
        self.pool.start_eviction()
    }

    /// Check out a connection; it returns to the pool when released or dropped
    pub async fn get_connection(&self) -> PoolResult<PooledConnection> {
        let started = Instant::now();
        let result = self.pool.acquire().await;
        self.metrics.record_acquire(started.elapsed());

        let resource = result.map_err(|e| {
            self.metrics.record_error();
            e
        })?;
        Ok(self.wrap(resource))
    }

    fn wrap(&self, resource: PooledResource<Arc<dyn Connection>>) -> PooledConnection {
        PooledConnection {
            conn: Arc::clone(resource.resource()),
            resource: Some(resource),
            pool: self.pool.clone(),
            node_id: self.node_id.clone(),
            statement_timeout: self.config.statement_timeout,
            close_on_drop: false,
        }
    }

    /// Execute a statement, retrying recoverable failures up to `opts.retries`
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        opts: &QueryOptions,
    ) -> PoolResult<QueryResult> {
        let timeout = opts.timeout.unwrap_or(self.config.statement_timeout);
        let mut retries = opts.retries;

        loop {
            self.metrics.queries.fetch_add(1, Ordering::Relaxed);
            match self.query_once(sql, params, timeout).await {
                Ok(result) => return Ok(result),
                Err(e) => {
                    self.metrics.record_error();
                    if retries > 0 && e.is_recoverable() {
                        retries -= 1;
                        warn!(
                            "Query on {} failed ({}), retrying ({} retries left)",
                            self.node_id, e, retries
                        );
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn query_once(
        &self,
        sql: &str,
        params: &[Value],
        timeout: Duration,
    ) -> PoolResult<QueryResult> {
        let started = Instant::now();
        let acquired = self.pool.acquire().await;
        self.metrics.record_acquire(started.elapsed());
        let mut conn = self.wrap(acquired?);
        conn.close_on_drop();

        let started = Instant::now();
        let result = execute_with_timeout(
            conn.connection().as_ref(),
            &self.node_id,
            sql,
            params,
            timeout,
        )
        .await;
        self.metrics.record_query(started.elapsed());

        conn.finish(matches!(&result, Err(e) if connection_broken(e))).await;
        result
    }

    /// Run `f` inside a transaction on one connection.
    ///
    /// Commits when `f` succeeds. When `f` fails the transaction is rolled
    /// back and `f`'s error is returned as is. The connection goes back to
    /// the pool on every path, or is discarded if it broke. If this future
    /// is dropped mid-transaction the connection is closed, which ends the
    /// transaction on the server.
    pub async fn transaction<T, E, F, Fut>(&self, isolation: IsolationLevel, f: F) -> Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        let mut conn = self.get_connection().await?;
        // An abandoned transaction must never reach the next borrower
        conn.close_on_drop();

        if let Err(e) = conn.connection().begin(isolation).await {
            self.metrics.record_error();
            let err = PoolError::from_driver(&self.node_id, e);
            conn.finish(connection_broken(&err)).await;
            return Err(err.into());
        }

        let tx = Transaction {
            conn: Arc::clone(conn.connection()),
            node_id: self.node_id.clone(),
            statement_timeout: self.config.statement_timeout,
        };

        match f(tx).await {
            Ok(value) => match conn.connection().commit().await {
                Ok(()) => {
                    conn.release().await;
                    Ok(value)
                }
                Err(e) => {
                    self.metrics.record_error();
                    warn!("Commit on {} failed: {}", self.node_id, e);
                    let err = PoolError::from_driver(&self.node_id, e);
                    let broken = connection_broken(&err) || conn.connection().rollback().await.is_err();
                    conn.finish(broken).await;
                    Err(err.into())
                }
            },
            Err(err) => {
                self.metrics.record_error();
                match conn.connection().rollback().await {
                    Ok(()) => conn.release().await,
                    Err(e) => {
                        warn!("Rollback on {} failed: {}", self.node_id, e);
                        conn.discard().await;
                    }
                }
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        let status = self.pool.status();
        PoolStats {
            total: status.total(),
            idle: status.available,
            active: status.in_use,
            creating: status.creating,
            waiting: status.waiting,
            max: status.max,
            avg_acquire_ms: self.metrics.avg_acquire_ms(),
            avg_query_ms: self.metrics.avg_query_ms(),
            total_queries: self.metrics.queries.load(Ordering::Relaxed),
            errors: self.metrics.errors.load(Ordering::Relaxed),
        }
    }

    /// Threshold-based health report
    pub fn health_status(&self) -> PoolHealth {
        let stats = self.stats();
        let mut warnings = Vec::new();

        if stats.utilization() > UTILIZATION_WARNING {
            warnings.push(format!(
                "High pool utilization: {:.0}%",
                stats.utilization() * 100.0
            ));
        }
        if stats.waiting > WAITING_WARNING {
            warnings.push(format!("{} callers waiting for a connection", stats.waiting));
        }
        if stats.avg_acquire_ms > ACQUIRE_TIME_WARNING_MS {
            warnings.push(format!(
                "Slow connection acquisition: {:.1}ms average",
                stats.avg_acquire_ms
            ));
        }
        if stats.error_rate() > ERROR_RATE_WARNING {
            warnings.push(format!(
                "High error rate: {:.2}%",
                stats.error_rate() * 100.0
            ));
        }

        PoolHealth {
            healthy: warnings.is_empty(),
            warnings,
            stats,
        }
    }

    /// Bookkeeping for idle connections
    pub fn connection_info(&self) -> Vec<ConnectionInfo> {
        self.pool.idle_resources()
    }

    /// Stop handing out connections and close all of them once returned
    pub async fn drain(&self) {
        self.pool.drain().await
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

/// A connection checked out of a [`ConnectionPool`]
pub struct PooledConnection {
    conn: Arc<dyn Connection>,
    resource: Option<PooledResource<Arc<dyn Connection>>>,
    pool: ResourcePool<ConnectionFactory>,
    node_id: String,
    statement_timeout: Duration,
    close_on_drop: bool,
}

impl PooledConnection {
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Execute under the pool's statement timeout
    pub async fn execute(&self, sql: &str, params: &[Value]) -> PoolResult<QueryResult> {
        execute_with_timeout(
            self.conn.as_ref(),
            &self.node_id,
            sql,
            params,
            self.statement_timeout,
        )
        .await
    }

    /// Close the connection, rather than return it, if this handle is
    /// dropped without an explicit release or discard
    pub fn close_on_drop(&mut self) {
        self.close_on_drop = true;
    }

    /// Return the connection to the pool
    pub async fn release(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource).await;
        }
    }

    /// Close the connection instead of returning it
    pub async fn discard(mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.discard(resource).await;
        }
    }

    async fn finish(self, broken: bool) {
        if broken {
            self.discard().await
        } else {
            self.release().await
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    let pool = self.pool.clone();
                    let close = self.close_on_drop;
                    if close {
                        debug!("Closing abandoned connection to {}", self.node_id);
                    }
                    handle.spawn(async move {
                        if close {
                            pool.discard(resource).await;
                        } else {
                            pool.release(resource).await;
                        }
                    });
                }
                Err(_) => warn!(
                    "Connection to {} dropped outside a runtime; it will not be returned",
                    self.node_id
                ),
            }
        }
    }
}

/// Statement handle passed to a [`ConnectionPool::transaction`] callback
#[derive(Clone)]
pub struct Transaction {
    conn: Arc<dyn Connection>,
    node_id: String,
    statement_timeout: Duration,
}

impl Transaction {
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub async fn query(&self, sql: &str, params: &[Value]) -> PoolResult<QueryResult> {
        execute_with_timeout(
            self.conn.as_ref(),
            &self.node_id,
            sql,
            params,
            self.statement_timeout,
        )
        .await
    }
}
