/// replipool - Database connection pooling with primary/replica replication management
///
/// A [`ReplicationPool`] owns one connection pool per node and layers on top:
/// 1. Read/write routing: writes and consistent reads go to the primary, other
///    reads are spread over healthy, caught-up replicas
/// 2. Health monitoring: periodic liveness and lag probes feed the routing table
/// 3. Failover: the least-lagged replica is promoted when the primary is lost
///
/// Database access goes through the driver capability in [`driver`]; the
/// in-memory driver in [`driver::memory`] simulates a cluster.
pub mod config;
pub mod core;
pub mod driver;
pub mod error;
pub mod events;
pub mod failover;
pub mod health;
pub mod queue;
pub mod routing;
pub mod utils;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::core::{ConnectionPool, Node, PoolStats, PooledConnection, QueryResult, Topology, Transaction, Value};
use crate::driver::{Adapter, IsolationLevel};
use crate::error::{PoolError, PoolResult};
use crate::events::{Event, EventBus};
use crate::failover::{FailoverEvent, FailoverManager, FailoverNotifier, LogNotifier};
use crate::health::{HealthMonitor, ProbeResult};
use crate::queue::{QueryQueue, QueueStats};
use crate::routing::{QueryContext, QueryRouter, RouteDecision, RoutingStats};

pub use crate::core::{Endpoint, NodeRole, NodeStatus};
pub use crate::error::ErrorSeverity;
pub use crate::routing::QueryKind;

/// Pool statistics for one node
#[derive(Debug, Clone)]
pub struct NodeStats {
    pub node: Node,
    pub pool: PoolStats,
}

/// Snapshot of the whole replication pool
#[derive(Debug, Clone)]
pub struct ReplicationStats {
    pub primary: String,
    pub nodes: Vec<NodeStats>,
    pub routing: RoutingStats,
    pub queue: Option<QueueStats>,
    pub failovers: usize,
}

/// Main replipool instance
pub struct ReplicationPool {
    config: Config,
    topology: Arc<Topology>,
    router: QueryRouter,
    health: Arc<HealthMonitor>,
    failover: Arc<FailoverManager>,
    queue: Option<QueryQueue>,
    events: EventBus,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    initialized: AtomicBool,
    closed: AtomicBool,
}

impl ReplicationPool {
    /// Build the pool; failovers are reported through the log
    pub fn new(config: Config, adapter: Adapter) -> PoolResult<Self> {
        Self::with_notifiers(config, adapter, vec![Arc::new(LogNotifier)])
    }

    /// Build the pool with custom failover notifiers
    pub fn with_notifiers(
        config: Config,
        adapter: Adapter,
        notifiers: Vec<Arc<dyn FailoverNotifier>>,
    ) -> PoolResult<Self> {
        config.validate()?;
        let events = EventBus::default();

        let members = config
            .nodes()
            .into_iter()
            .map(|(id, endpoint, role)| {
                let pool = ConnectionPool::new(
                    id.clone(),
                    config.pool_config(&endpoint),
                    Arc::clone(&adapter.driver),
                    events.clone(),
                );
                (Node::new(id, endpoint, role), Arc::new(pool))
            })
            .collect();
        let topology = Arc::new(Topology::new(members)?);

        let router = QueryRouter::new(
            Arc::clone(&topology),
            config.replication.load_balancing_strategy,
            config.replication.lag_threshold_ms,
        );

        let failover = notifiers.into_iter().fold(
            FailoverManager::new(
                Arc::clone(&topology),
                Arc::clone(&adapter.probe),
                Arc::clone(&adapter.promoter),
                config.failover_config(),
                events.clone(),
            ),
            |manager, notifier| manager.with_notifier(notifier),
        );
        let failover = Arc::new(failover);

        let health = HealthMonitor::new(
            Arc::clone(&topology),
            Arc::clone(&adapter.probe),
            config.health_config(),
            events.clone(),
        )
        .with_failover(Arc::clone(&failover));

        let queue = if config.queue.enabled {
            Some(QueryQueue::new(config.queue_config()))
        } else {
            None
        };

        Ok(Self {
            config,
            topology,
            router,
            health: Arc::new(health),
            failover,
            queue,
            events,
            tasks: Mutex::new(Vec::new()),
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        })
    }

    /// Get the current configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> PoolResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::PoolClosed {
                pool: "replication".to_string(),
            });
        }
        Ok(())
    }

    /// Warm up every pool, run a first health check and start the
    /// background health and eviction tasks
    pub async fn init(&self) -> PoolResult<()> {
        self.ensure_open()?;
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let opened = match self.warmup().await {
            Ok(opened) => opened,
            Err(e) => {
                self.initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };
        let results = self.health.check_all().await;
        let healthy = results.iter().filter(|r| r.status.is_healthy()).count();

        let mut tasks = Vec::new();
        for (_, pool) in self.topology.pools() {
            tasks.push(pool.start_eviction());
        }
        tasks.push(Arc::clone(&self.health).spawn());
        self.lock_tasks().extend(tasks);

        info!(
            "Replication pool ready: {} nodes ({} healthy), {} connections, strategy {}",
            results.len(),
            healthy,
            opened,
            self.router.strategy()
        );
        Ok(())
    }

    /// Open `min` connections per node. The primary must be reachable;
    /// replicas that fail are left to the health monitor.
    pub async fn warmup(&self) -> PoolResult<usize> {
        let primary_id = self.topology.primary_id().await;
        let mut opened = 0;

        for (id, pool) in self.topology.pools() {
            match pool.warmup().await {
                Ok(count) => opened += count,
                Err(e) if id == primary_id => return Err(e),
                Err(e) => warn!("Warmup of replica {} failed: {}", id, e),
            }
        }
        Ok(opened)
    }

    /// Route and execute a statement, through the priority queue when enabled
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        ctx: &QueryContext,
    ) -> PoolResult<QueryResult> {
        self.ensure_open()?;
        match &self.queue {
            Some(queue) => {
                queue
                    .enqueue(ctx.priority, || self.router.query(sql, params, ctx))
                    .await
            }
            None => self.router.query(sql, params, ctx).await,
        }
    }

    /// Where `sql` would run, without executing it
    pub async fn route(&self, sql: &str, ctx: &QueryContext) -> RouteDecision {
        self.router.route(sql, ctx).await
    }

    /// Run `f` in a transaction on the primary
    pub async fn transaction<T, E, F, Fut>(&self, isolation: IsolationLevel, f: F) -> Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        self.ensure_open()?;
        self.router.transaction(isolation, f).await
    }

    /// Check out a connection to the primary
    pub async fn get_connection(&self) -> PoolResult<PooledConnection> {
        self.ensure_open()?;
        let (_, pool) = self.topology.primary_pool().await?;
        pool.get_connection().await
    }

    pub async fn initiate_failover(&self, reason: &str) -> PoolResult<FailoverEvent> {
        self.ensure_open()?;
        self.failover.initiate_failover(reason).await
    }

    pub fn failover_history(&self) -> Vec<FailoverEvent> {
        self.failover.history()
    }

    /// Run a health check now instead of waiting for the next interval
    pub async fn check_health(&self) -> Vec<ProbeResult> {
        self.health.check_all().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.topology.snapshot().await
    }

    pub async fn primary_id(&self) -> String {
        self.topology.primary_id().await
    }

    pub async fn stats(&self) -> ReplicationStats {
        let nodes = self
            .topology
            .snapshot()
            .await
            .into_iter()
            .filter_map(|node| {
                let pool = self.topology.pool(&node.id).ok()?.stats();
                Some(NodeStats { node, pool })
            })
            .collect();

        ReplicationStats {
            primary: self.topology.primary_id().await,
            nodes,
            routing: self.router.stats(),
            queue: self.queue.as_ref().map(|q| q.stats()),
            failovers: self.failover.history().iter().filter(|e| e.success).count(),
        }
    }

    fn lock_tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop(&self, reason: &str) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(queue) = &self.queue {
            queue.clear(reason);
        }
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }

    /// Reject new work, then wait for checked-out connections to come back
    /// and close everything
    pub async fn drain(&self) {
        self.stop("replication pool draining");
        let pools = self.topology.pools();
        futures::future::join_all(pools.iter().map(|(_, pool)| pool.drain())).await;
        info!("Replication pool drained");
    }

    /// Like [`drain`](Self::drain) but gives up waiting for checked-out
    /// connections after the statement timeout
    pub async fn close(&self) {
        self.stop("replication pool closed");
        let grace = Duration::from_millis(self.config.pool.statement_timeout_ms);
        let pools = self.topology.pools();
        let drain = futures::future::join_all(pools.iter().map(|(_, pool)| pool.drain()));
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("Closed with connections still checked out after {:?}", grace);
        }
        info!("Replication pool closed");
    }
}

impl Drop for ReplicationPool {
    fn drop(&mut self) {
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
    }
}
