/// Health monitoring for the primary and its replicas
///
/// Every interval each node is probed with a liveness statement and, for
/// replicas, a lag query. Results are written to the node table, which the
/// router reads when picking replicas. The monitor is the only writer of
/// node status, lag and load.
use crate::core::{Node, NodeRole, NodeStatus, Topology, LAG_UNREACHABLE_MS};
use crate::driver::ReplicationProbe;
use crate::error::{ErrorSeverity, PoolError, PoolResult};
use crate::events::{Event, EventBus};
use crate::failover::FailoverManager;
use fnv::FnvHashMap;
use futures::future::join_all;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

const LIVENESS_SQL: &str = "SELECT 1";

/// Health monitor configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    /// Budget for one node's probe
    pub probe_timeout: Duration,
    /// Replicas lagging more than this trigger a lag warning
    pub lag_threshold_ms: u64,
    /// Consecutive failed primary probes before auto-failover
    pub failure_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            lag_threshold_ms: 1000,
            failure_threshold: 3,
        }
    }
}

/// Health status of a node after one probe
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
        }
    }
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Outcome of probing one node
#[derive(Debug, Clone)]
pub struct ProbeResult {
    pub node_id: String,
    pub role: NodeRole,
    pub status: HealthStatus,
    /// Measured lag, or the unreachable sentinel when the probe failed
    pub lag_ms: u64,
    pub latency: Duration,
    pub checked_at: SystemTime,
}

/// Throughput bookkeeping per node
struct QueryMark {
    queries: u64,
    at: Instant,
}

/// Periodically probes every node and records the results
pub struct HealthMonitor {
    topology: Arc<Topology>,
    probe: Arc<dyn ReplicationProbe>,
    config: HealthConfig,
    events: EventBus,
    failover: Option<Arc<FailoverManager>>,
    failures: Mutex<FnvHashMap<String, u32>>,
    marks: Mutex<FnvHashMap<String, QueryMark>>,
}

impl HealthMonitor {
    pub fn new(
        topology: Arc<Topology>,
        probe: Arc<dyn ReplicationProbe>,
        config: HealthConfig,
        events: EventBus,
    ) -> Self {
        Self {
            topology,
            probe,
            config,
            events,
            failover: None,
            failures: Mutex::new(FnvHashMap::default()),
            marks: Mutex::new(FnvHashMap::default()),
        }
    }

    /// Let sustained primary failure trigger failover
    pub fn with_failover(mut self, failover: Arc<FailoverManager>) -> Self {
        self.failover = Some(failover);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Consecutive failed probes for a node
    pub fn consecutive_failures(&self, node_id: &str) -> u32 {
        self.failures
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(node_id)
            .copied()
            .unwrap_or(0)
    }

    /// Probe every node concurrently and record the results
    pub async fn check_all(&self) -> Vec<ProbeResult> {
        let nodes = self.topology.snapshot().await;
        let results = join_all(nodes.iter().map(|node| self.check_node(node))).await;

        for result in &results {
            self.record(result).await;
        }

        self.events.emit(Event::HealthCheckComplete {
            results: results.clone(),
        });
        self.maybe_fail_over(&results);
        results
    }

    async fn check_node(&self, node: &Node) -> ProbeResult {
        let started = Instant::now();
        let status = match timeout(self.config.probe_timeout, self.probe_node(node)).await {
            Ok(Ok(lag_ms)) => (HealthStatus::Healthy, lag_ms),
            Ok(Err(e)) => (
                HealthStatus::Unhealthy {
                    reason: e.to_string(),
                },
                LAG_UNREACHABLE_MS,
            ),
            Err(_) => (HealthStatus::Timeout, LAG_UNREACHABLE_MS),
        };

        ProbeResult {
            node_id: node.id.clone(),
            role: node.role,
            status: status.0,
            lag_ms: status.1,
            latency: started.elapsed(),
            checked_at: SystemTime::now(),
        }
    }

    /// Liveness plus lag for replicas; returns the lag.
    ///
    /// A replica that accepts writes has diverged from the primary and is
    /// reported unhealthy so the router stops reading from it.
    async fn probe_node(&self, node: &Node) -> PoolResult<u64> {
        let pool = self.topology.pool(&node.id)?;
        let mut conn = pool.get_connection().await?;
        conn.close_on_drop();

        let outcome = async {
            conn.execute(LIVENESS_SQL, &[]).await?;
            if node.role == NodeRole::Primary {
                return Ok(0);
            }

            let db = conn.connection().as_ref();
            let writable = self
                .probe
                .is_writable(db)
                .await
                .map_err(|e| PoolError::from_driver(&node.id, e))?;
            if writable {
                return Err(PoolError::WritableReplica {
                    node_id: node.id.clone(),
                });
            }
            self.probe
                .current_lag_ms(db)
                .await
                .map_err(|e| PoolError::from_driver(&node.id, e))
        }
        .await;

        match &outcome {
            Err(PoolError::NodeUnreachable { .. }) | Err(PoolError::QueryTimeout { .. }) => {
                conn.discard().await
            }
            _ => conn.release().await,
        }
        outcome
    }

    async fn record(&self, result: &ProbeResult) {
        let healthy = result.status.is_healthy();
        let failures = {
            let mut failures = self.failures.lock().unwrap_or_else(|e| e.into_inner());
            let count = failures.entry(result.node_id.clone()).or_insert(0);
            *count = if healthy { 0 } else { *count + 1 };
            *count
        };

        let (connections, throughput) = self.load(&result.node_id);
        let mut previous = NodeStatus::Unknown;
        self.topology
            .record_probe(&result.node_id, |node| {
                previous = node.status;
                node.status = if healthy {
                    NodeStatus::Healthy
                } else {
                    NodeStatus::Unhealthy
                };
                node.lag_ms = result.lag_ms;
                node.last_probe = Some(result.checked_at);
                node.connections = connections;
                node.throughput = throughput;
            })
            .await;

        if !healthy {
            if previous != NodeStatus::Unhealthy {
                warn!(
                    "Node {} ({}) is unhealthy: {}",
                    result.node_id, result.role, result.status
                );
            } else {
                debug!(
                    "Node {} still unhealthy ({} consecutive failures)",
                    result.node_id, failures
                );
            }
            self.events.emit(Event::NodeUnhealthy {
                node_id: result.node_id.clone(),
                reason: result.status.to_string(),
            });
            return;
        }

        if previous == NodeStatus::Unhealthy {
            info!("Node {} recovered", result.node_id);
        }
        if result.role == NodeRole::Replica && result.lag_ms > self.config.lag_threshold_ms {
            warn!(
                "Replica {} lagging {}ms (threshold {}ms)",
                result.node_id, result.lag_ms, self.config.lag_threshold_ms
            );
            self.events.emit(Event::ReplicationLagWarning {
                node_id: result.node_id.clone(),
                lag_ms: result.lag_ms,
                threshold_ms: self.config.lag_threshold_ms,
            });
        }
    }

    /// Checked-out connections and queries per second since the last probe
    fn load(&self, node_id: &str) -> (usize, f64) {
        let stats = match self.topology.pool(node_id) {
            Ok(pool) => pool.stats(),
            Err(_) => return (0, 0.0),
        };

        let now = Instant::now();
        let mut marks = self.marks.lock().unwrap_or_else(|e| e.into_inner());
        let throughput = match marks.get(node_id) {
            Some(mark) => {
                let elapsed = now.duration_since(mark.at).as_secs_f64();
                if elapsed > 0.0 {
                    stats.total_queries.saturating_sub(mark.queries) as f64 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        marks.insert(
            node_id.to_string(),
            QueryMark {
                queries: stats.total_queries,
                at: now,
            },
        );

        (stats.active, throughput)
    }

    fn maybe_fail_over(&self, results: &[ProbeResult]) {
        let failover = match &self.failover {
            Some(failover) if failover.config().auto_failover => failover,
            _ => return,
        };

        let primary = match results.iter().find(|r| r.role == NodeRole::Primary) {
            Some(primary) if !primary.status.is_healthy() => primary,
            _ => return,
        };

        let failures = self.consecutive_failures(&primary.node_id);
        if failures < self.config.failure_threshold {
            return;
        }

        let failover = Arc::clone(failover);
        let reason = format!(
            "primary {} failed {} consecutive health checks: {}",
            primary.node_id, failures, primary.status
        );
        tokio::spawn(async move {
            if let Err(e) = failover.initiate_failover(&reason).await {
                match e.severity() {
                    ErrorSeverity::Info => debug!("Automatic failover not performed: {}", e),
                    _ => warn!("Automatic failover failed: {}", e),
                }
            }
        });
    }

    /// Run [`check_all`](Self::check_all) on the configured interval
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.config.interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                interval.tick().await;
                let results = self.check_all().await;
                let unhealthy = results.iter().filter(|r| !r.status.is_healthy()).count();
                debug!(
                    "Health check complete: {} nodes, {} unhealthy",
                    results.len(),
                    unhealthy
                );
            }
        })
    }
}
