/// Primary failover
///
/// Promotes the least-lagged replica when the primary is lost. At most one
/// failover runs at a time and a new one is refused until the cooldown since
/// the last successful failover has elapsed.
use crate::core::{NodeRole, Topology};
use crate::driver::{Promotable, ReplicationProbe};
use crate::error::{ErrorSeverity, PoolError, PoolResult};
use crate::events::{Event, EventBus};
use crate::utils::generate_id;
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Failover configuration
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    /// Let the health monitor trigger failover on its own
    pub auto_failover: bool,
    /// Budget for each candidate's lag probe, and for promotion to take
    /// effect
    pub timeout: Duration,
    pub cooldown: Duration,
    /// Replicas lagging more than this are never promoted
    pub max_candidate_lag_ms: u64,
    /// Interval between writability checks while promoting
    pub poll_interval: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            auto_failover: true,
            timeout: Duration::from_secs(30),
            cooldown: Duration::from_secs(60),
            max_candidate_lag_ms: 10_000,
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Record of one failover attempt
#[derive(Debug, Clone)]
pub struct FailoverEvent {
    pub id: String,
    pub previous_primary: String,
    /// Promoted node; `None` when the attempt failed
    pub new_primary: Option<String>,
    pub reason: String,
    pub started_at: SystemTime,
    pub duration: Duration,
    pub success: bool,
    pub error: Option<String>,
}

/// Receives successful failovers, e.g. to page an operator
#[async_trait]
pub trait FailoverNotifier: Send + Sync {
    async fn notify(&self, event: &FailoverEvent);
}

/// Writes successful failovers to the log
pub struct LogNotifier;

#[async_trait]
impl FailoverNotifier for LogNotifier {
    async fn notify(&self, event: &FailoverEvent) {
        info!(
            "Failover {}: {} -> {} in {:?} ({})",
            event.id,
            event.previous_primary,
            event.new_primary.as_deref().unwrap_or("-"),
            event.duration,
            event.reason
        );
    }
}

/// A replica considered for promotion
#[derive(Debug, Clone, PartialEq)]
pub struct FailoverCandidate {
    pub node_id: String,
    pub lag_ms: u64,
    /// Higher is better
    pub score: f64,
}

#[derive(Default)]
struct FailoverState {
    in_progress: bool,
    last_success: Option<Instant>,
}

/// Clears the in-progress flag however the attempt ends
struct InProgress<'a> {
    state: &'a Mutex<FailoverState>,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.in_progress = false;
    }
}

/// Selects, promotes and installs a new primary
pub struct FailoverManager {
    topology: Arc<Topology>,
    probe: Arc<dyn ReplicationProbe>,
    promoter: Arc<dyn Promotable>,
    config: FailoverConfig,
    events: EventBus,
    notifiers: Vec<Arc<dyn FailoverNotifier>>,
    state: Mutex<FailoverState>,
    history: Mutex<Vec<FailoverEvent>>,
}

impl FailoverManager {
    pub fn new(
        topology: Arc<Topology>,
        probe: Arc<dyn ReplicationProbe>,
        promoter: Arc<dyn Promotable>,
        config: FailoverConfig,
        events: EventBus,
    ) -> Self {
        Self {
            topology,
            probe,
            promoter,
            config,
            events,
            notifiers: Vec::new(),
            state: Mutex::new(FailoverState::default()),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn FailoverNotifier>) -> Self {
        self.notifiers.push(notifier);
        self
    }

    pub fn config(&self) -> &FailoverConfig {
        &self.config
    }

    fn lock_state(&self) -> MutexGuard<'_, FailoverState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_in_progress(&self) -> bool {
        self.lock_state().in_progress
    }

    /// Time left before another failover is allowed
    pub fn cooldown_remaining(&self) -> Option<Duration> {
        let state = self.lock_state();
        let elapsed = state.last_success?.elapsed();
        self.config.cooldown.checked_sub(elapsed).filter(|d| !d.is_zero())
    }

    /// Every attempt so far, oldest first
    pub fn history(&self) -> Vec<FailoverEvent> {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn begin(&self) -> PoolResult<InProgress<'_>> {
        let mut state = self.lock_state();
        if state.in_progress {
            return Err(PoolError::FailoverInProgress);
        }
        if let Some(last) = state.last_success {
            let elapsed = last.elapsed();
            if elapsed < self.config.cooldown {
                return Err(PoolError::FailoverCooldown {
                    remaining_ms: (self.config.cooldown - elapsed).as_millis() as u64,
                });
            }
        }
        state.in_progress = true;
        Ok(InProgress { state: &self.state })
    }

    /// Replace the primary with the best replica.
    ///
    /// Returns `FailoverInProgress` or `FailoverCooldown` without side
    /// effects when another attempt is running or one succeeded recently.
    pub async fn initiate_failover(&self, reason: &str) -> PoolResult<FailoverEvent> {
        let _guard = self.begin()?;

        let previous_primary = self.topology.primary_id().await;
        let started_at = SystemTime::now();
        let started = Instant::now();

        warn!("Starting failover away from {}: {}", previous_primary, reason);
        self.events.emit(Event::FailoverStarted {
            previous_primary: previous_primary.clone(),
            reason: reason.to_string(),
        });

        let outcome = self.run(&previous_primary).await;

        let mut event = FailoverEvent {
            id: generate_id("failover"),
            previous_primary: previous_primary.clone(),
            new_primary: None,
            reason: reason.to_string(),
            started_at,
            duration: started.elapsed(),
            success: false,
            error: None,
        };

        match outcome {
            Ok(new_primary) => {
                event.new_primary = Some(new_primary);
                event.success = true;
                self.lock_state().last_success = Some(Instant::now());
                self.record(&event);

                info!(
                    "Failover complete: {} promoted in {:?}",
                    event.new_primary.as_deref().unwrap_or("-"),
                    event.duration
                );
                self.events.emit(Event::FailoverComplete(event.clone()));
                for notifier in &self.notifiers {
                    notifier.notify(&event).await;
                }
                Ok(event)
            }
            Err(err) => {
                event.error = Some(err.to_string());
                self.record(&event);

                match err.severity() {
                    ErrorSeverity::Critical => {
                        error!("Failover away from {} failed: {}", previous_primary, err)
                    }
                    _ => warn!("Failover away from {} failed: {}", previous_primary, err),
                }
                self.events.emit(Event::FailoverFailed {
                    previous_primary,
                    reason: reason.to_string(),
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn record(&self, event: &FailoverEvent) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }

    async fn run(&self, previous_primary: &str) -> PoolResult<String> {
        let candidates = self.candidates().await;
        let best = candidates.into_iter().next().ok_or_else(|| PoolError::NoFailoverCandidate {
            message: format!(
                "no reachable replica within {}ms of the primary",
                self.config.max_candidate_lag_ms
            ),
        })?;

        info!(
            "Promoting {} (lag {}ms, score {:.3})",
            best.node_id, best.lag_ms, best.score
        );
        self.promote(&best.node_id).await?;

        let replaced = self.topology.promote(&best.node_id).await?;
        debug!("Primary {} replaced by {}", replaced, best.node_id);
        if replaced != previous_primary {
            warn!(
                "Primary changed from {} to {} during failover",
                previous_primary, replaced
            );
        }
        Ok(best.node_id)
    }

    /// Replicas ranked by live lag, best first
    pub async fn candidates(&self) -> Vec<FailoverCandidate> {
        let replicas: Vec<_> = self
            .topology
            .snapshot()
            .await
            .into_iter()
            .filter(|n| n.role == NodeRole::Replica)
            .collect();

        let budget = self.config.timeout;
        let probes = replicas.iter().map(|node| async move {
            let lag = match tokio::time::timeout(budget, self.current_lag(&node.id)).await {
                Ok(lag) => lag,
                Err(_) => Err(PoolError::QueryTimeout {
                    node_id: node.id.clone(),
                    timeout_ms: budget.as_millis() as u64,
                }),
            };
            (node.id.clone(), lag)
        });

        let mut candidates: Vec<FailoverCandidate> = join_all(probes)
            .await
            .into_iter()
            .filter_map(|(node_id, lag)| match lag {
                Ok(lag_ms) if lag_ms <= self.config.max_candidate_lag_ms => {
                    Some(FailoverCandidate {
                        node_id,
                        lag_ms,
                        score: 1.0 / (1.0 + lag_ms as f64),
                    })
                }
                Ok(lag_ms) => {
                    debug!("Skipping {}: lag {}ms over the ceiling", node_id, lag_ms);
                    None
                }
                Err(e) => {
                    debug!("Skipping {}: {}", node_id, e);
                    None
                }
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.node_id.cmp(&b.node_id))
        });
        candidates
    }

    async fn current_lag(&self, node_id: &str) -> PoolResult<u64> {
        let pool = self.topology.pool(node_id)?;
        let mut conn = pool.get_connection().await?;
        conn.close_on_drop();
        let lag = self
            .probe
            .current_lag_ms(conn.connection().as_ref())
            .await
            .map_err(|e| PoolError::from_driver(node_id, e));
        conn.release().await;
        lag
    }

    /// Request promotion and wait until the node accepts writes, all within
    /// the failover timeout
    async fn promote(&self, node_id: &str) -> PoolResult<()> {
        match tokio::time::timeout(self.config.timeout, self.request_promotion(node_id)).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::PromotionTimeout {
                node_id: node_id.to_string(),
                timeout_ms: self.config.timeout.as_millis() as u64,
            }),
        }
    }

    async fn request_promotion(&self, node_id: &str) -> PoolResult<()> {
        let pool = self.topology.pool(node_id)?;
        let mut conn = pool.get_connection().await?;
        conn.close_on_drop();

        let accepted = self
            .promoter
            .promote(conn.connection().as_ref())
            .await
            .map_err(|e| PoolError::PromotionFailed {
                node_id: node_id.to_string(),
                message: e.to_string(),
            });
        match accepted {
            Ok(true) => {}
            Ok(false) => {
                conn.release().await;
                return Err(PoolError::PromotionFailed {
                    node_id: node_id.to_string(),
                    message: "promotion request refused".to_string(),
                });
            }
            Err(e) => {
                conn.discard().await;
                return Err(e);
            }
        }

        loop {
            match self.probe.is_writable(conn.connection().as_ref()).await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => debug!("Writability check on {} failed: {}", node_id, e),
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
        conn.release().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ConnectionPool, Endpoint, Node, PoolConfig};
    use crate::driver::memory::{MemoryCluster, MemoryNode, PromotionBehavior};
    use crate::driver::SqlReplicationProbe;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Fixture {
        topology: Arc<Topology>,
        nodes: Vec<Arc<MemoryNode>>,
        events: EventBus,
    }

    impl Fixture {
        fn new(replica_lags: &[u64]) -> Self {
            let endpoints: Vec<Endpoint> = (0..=replica_lags.len())
                .map(|i| Endpoint::new("127.0.0.1", 5432 + i as u16))
                .collect();
            let cluster = MemoryCluster::for_endpoints(&endpoints[0], &endpoints[1..]);
            let driver = Arc::new(cluster.driver());
            let events = EventBus::default();

            let nodes: Vec<_> = endpoints
                .iter()
                .map(|e| cluster.node(&e.address()).unwrap())
                .collect();
            for (node, lag) in nodes[1..].iter().zip(replica_lags) {
                node.set_lag_ms(*lag);
            }

            let members = endpoints
                .iter()
                .enumerate()
                .map(|(i, endpoint)| {
                    let (id, role) = if i == 0 {
                        ("primary".to_string(), NodeRole::Primary)
                    } else {
                        (format!("replica-{}", i), NodeRole::Replica)
                    };
                    let pool = ConnectionPool::new(
                        id.clone(),
                        PoolConfig::new(endpoint.clone()).with_min(0),
                        driver.clone(),
                        events.clone(),
                    );
                    (Node::new(id, endpoint.clone(), role), Arc::new(pool))
                })
                .collect();

            Self {
                topology: Arc::new(Topology::new(members).unwrap()),
                nodes,
                events,
            }
        }

        fn manager(&self, config: FailoverConfig) -> FailoverManager {
            let probe = Arc::new(SqlReplicationProbe::postgres());
            FailoverManager::new(
                self.topology.clone(),
                probe.clone(),
                probe,
                config,
                self.events.clone(),
            )
        }
    }

    fn fast_config() -> FailoverConfig {
        FailoverConfig {
            timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    struct CountingNotifier(AtomicUsize);

    #[async_trait]
    impl FailoverNotifier for CountingNotifier {
        async fn notify(&self, _event: &FailoverEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_promotes_least_lagged_replica() {
        let fixture = Fixture::new(&[800, 120, 400]);
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let manager = fixture.manager(fast_config()).with_notifier(notifier.clone());
        let mut events = fixture.events.subscribe();

        let event = manager.initiate_failover("primary unreachable").await.unwrap();

        assert!(event.success);
        assert_eq!(event.previous_primary, "primary");
        assert_eq!(event.new_primary.as_deref(), Some("replica-2"));
        assert_eq!(fixture.topology.primary_id().await, "replica-2");
        assert!(fixture.nodes[2].is_writable());
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
        assert_eq!(manager.history().len(), 1);

        let mut saw_started = false;
        let mut saw_complete = false;
        while let Ok(event) = events.try_recv() {
            match event {
                Event::FailoverStarted { .. } => saw_started = true,
                Event::FailoverComplete(e) => saw_complete = e.success,
                _ => {}
            }
        }
        assert!(saw_started && saw_complete);
    }

    #[tokio::test]
    async fn test_rapid_second_failover_is_refused() {
        let fixture = Fixture::new(&[100, 200]);
        let manager = fixture.manager(fast_config());

        let (first, second) = tokio::join!(
            manager.initiate_failover("first"),
            manager.initiate_failover("second")
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results.iter().any(|r| matches!(
            r,
            Err(PoolError::FailoverInProgress) | Err(PoolError::FailoverCooldown { .. })
        )));

        let third = manager.initiate_failover("third").await;
        assert!(matches!(third, Err(PoolError::FailoverCooldown { .. })));

        let successes = manager.history().iter().filter(|e| e.success).count();
        assert_eq!(successes, 1);
        assert!(manager.cooldown_remaining().is_some());
    }

    #[tokio::test]
    async fn test_no_candidate_leaves_topology_unchanged() {
        let fixture = Fixture::new(&[20_000, 15_000]);
        let manager = fixture.manager(fast_config());

        let result = manager.initiate_failover("primary unreachable").await;
        assert!(matches!(result, Err(PoolError::NoFailoverCandidate { .. })));
        assert_eq!(fixture.topology.primary_id().await, "primary");
        assert!(!manager.is_in_progress());
        assert!(manager.cooldown_remaining().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_replicas_are_skipped() {
        let fixture = Fixture::new(&[10, 300]);
        fixture.nodes[1].set_reachable(false);
        let manager = fixture.manager(fast_config());

        let candidates = manager.candidates().await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].node_id, "replica-2");
    }

    #[tokio::test]
    async fn test_promotion_timeout_is_fatal_for_attempt() {
        let fixture = Fixture::new(&[50, 60]);
        fixture.nodes[1].set_promotion(PromotionBehavior::Never);
        let notifier = Arc::new(CountingNotifier(AtomicUsize::new(0)));
        let manager = fixture.manager(fast_config()).with_notifier(notifier.clone());

        let result = manager.initiate_failover("primary unreachable").await;
        match result {
            Err(PoolError::PromotionTimeout { node_id, .. }) => assert_eq!(node_id, "replica-1"),
            other => panic!("unexpected result: {:?}", other),
        }

        // No second candidate is tried
        assert_eq!(fixture.topology.primary_id().await, "primary");
        assert!(!fixture.nodes[2].is_writable());
        assert_eq!(notifier.0.load(Ordering::SeqCst), 0);

        let history = manager.history();
        assert_eq!(history.len(), 1);
        assert!(!history[0].success);
        assert!(history[0].error.is_some());

        // Failed attempts do not start the cooldown
        assert!(manager.cooldown_remaining().is_none());
    }

    #[tokio::test]
    async fn test_delayed_promotion_within_timeout() {
        let fixture = Fixture::new(&[5]);
        fixture.nodes[1].set_promotion(PromotionBehavior::After(Duration::from_millis(50)));
        let manager = fixture.manager(fast_config());

        let event = manager.initiate_failover("maintenance").await.unwrap();
        assert_eq!(event.new_primary.as_deref(), Some("replica-1"));
        assert!(event.duration >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_refused_promotion() {
        let fixture = Fixture::new(&[5]);
        fixture.nodes[1].set_promotion(PromotionBehavior::Refuse);
        let manager = fixture.manager(fast_config());

        let result = manager.initiate_failover("maintenance").await;
        assert!(matches!(result, Err(PoolError::PromotionFailed { .. })));
        assert_eq!(fixture.topology.primary_id().await, "primary");
    }

    #[tokio::test]
    async fn test_slow_replica_does_not_stall_failover() {
        let fixture = Fixture::new(&[40, 10]);
        fixture.nodes[2].set_latency(Duration::from_secs(3));
        let manager = fixture.manager(fast_config());

        let started = Instant::now();
        let event = manager.initiate_failover("primary unreachable").await.unwrap();

        // replica-2 has less lag but never answered within the budget
        assert_eq!(event.new_primary.as_deref(), Some("replica-1"));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert!(!manager.is_in_progress());
    }

    #[tokio::test]
    async fn test_unresponsive_promotion_request_times_out() {
        let fixture = Fixture::new(&[5]);
        let manager = fixture.manager(fast_config());
        let candidates = manager.candidates().await;
        assert_eq!(candidates.len(), 1);

        fixture.nodes[1].set_latency(Duration::from_secs(3));
        let started = Instant::now();
        let result = manager.promote("replica-1").await;

        assert!(matches!(result, Err(PoolError::PromotionTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
