/// Read/write query routing across the primary and its replicas
pub mod balancer;
pub mod classify;

use crate::core::{NodeRole, NodeStatus, QueryOptions, QueryResult, Topology, Value};
use crate::driver::IsolationLevel;
use crate::error::{PoolError, PoolResult};
use crate::queue::Priority;
use balancer::{create_balancer, LoadBalancingAlgorithm, LoadBalancingStrategy};
use classify::{classify, StatementKind};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub use crate::core::Transaction;

/// Caller-declared operation kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Read,
    Write,
}

/// Per-call routing intent
#[derive(Debug, Clone, Default)]
pub struct QueryContext {
    /// Overrides keyword classification when set
    pub kind: Option<QueryKind>,
    /// Read must observe the latest committed data
    pub consistent: bool,
    pub priority: Priority,
    pub timeout: Option<Duration>,
    pub retries: u32,
}

impl QueryContext {
    pub fn read() -> Self {
        Self {
            kind: Some(QueryKind::Read),
            ..Default::default()
        }
    }

    pub fn write() -> Self {
        Self {
            kind: Some(QueryKind::Write),
            ..Default::default()
        }
    }

    pub fn consistent(mut self) -> Self {
        self.consistent = true;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    fn options(&self) -> QueryOptions {
        QueryOptions {
            timeout: self.timeout,
            retries: self.retries,
        }
    }
}

/// Why a statement was sent where it was
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteReason {
    Write,
    Consistent,
    RequiresPrimary,
    NoEligibleReplica,
    Replica,
}

impl fmt::Display for RouteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            Self::Write => "write",
            Self::Consistent => "consistent read",
            Self::RequiresPrimary => "requires primary",
            Self::NoEligibleReplica => "no eligible replica",
            Self::Replica => "replica read",
        };
        write!(f, "{}", reason)
    }
}

/// Routing decision for one statement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub node_id: String,
    pub reason: RouteReason,
}

impl RouteDecision {
    pub fn is_replica(&self) -> bool {
        self.reason == RouteReason::Replica
    }
}

/// Routing counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingStats {
    pub replica_reads: u64,
    pub primary_reads: u64,
    pub writes: u64,
    /// Replica failures answered by the primary
    pub fallbacks: u64,
    pub replica_failures: u64,
}

#[derive(Default)]
struct RoutingCounters {
    replica_reads: AtomicU64,
    primary_reads: AtomicU64,
    writes: AtomicU64,
    fallbacks: AtomicU64,
    replica_failures: AtomicU64,
}

/// Routes statements to the primary or to a healthy replica
pub struct QueryRouter {
    topology: Arc<Topology>,
    strategy: LoadBalancingStrategy,
    balancer: Box<dyn LoadBalancingAlgorithm>,
    lag_threshold_ms: u64,
    counters: RoutingCounters,
}

impl QueryRouter {
    pub fn new(
        topology: Arc<Topology>,
        strategy: LoadBalancingStrategy,
        lag_threshold_ms: u64,
    ) -> Self {
        Self {
            topology,
            strategy,
            balancer: create_balancer(strategy),
            lag_threshold_ms,
            counters: RoutingCounters::default(),
        }
    }

    pub fn strategy(&self) -> LoadBalancingStrategy {
        self.strategy
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Decide where `sql` runs without executing it
    pub async fn route(&self, sql: &str, ctx: &QueryContext) -> RouteDecision {
        // Locking reads and data-modifying CTEs stay on the primary even
        // when the caller declares a read
        let reason = match (ctx.kind, classify(sql)) {
            (Some(QueryKind::Write), _) => Some(RouteReason::Write),
            (_, StatementKind::RequiresPrimary) => Some(RouteReason::RequiresPrimary),
            (Some(QueryKind::Read), _) => None,
            (None, StatementKind::Write) => Some(RouteReason::Write),
            (None, StatementKind::Read) => None,
        };
        let reason = reason.or(if ctx.consistent {
            Some(RouteReason::Consistent)
        } else {
            None
        });

        if let Some(reason) = reason {
            return RouteDecision {
                node_id: self.topology.primary_id().await,
                reason,
            };
        }

        match self.select_replica().await {
            Some(node_id) => RouteDecision {
                node_id,
                reason: RouteReason::Replica,
            },
            None => RouteDecision {
                node_id: self.topology.primary_id().await,
                reason: RouteReason::NoEligibleReplica,
            },
        }
    }

    /// Healthy replicas within the lag threshold, ordered by id
    async fn select_replica(&self) -> Option<String> {
        let eligible: Vec<_> = self
            .topology
            .snapshot()
            .await
            .into_iter()
            .filter(|n| {
                n.role == NodeRole::Replica
                    && n.status == NodeStatus::Healthy
                    && n.lag_ms <= self.lag_threshold_ms
            })
            .collect();

        let index = self.balancer.select_node(&eligible)?;
        eligible.into_iter().nth(index).map(|n| n.id)
    }

    /// Route and execute a statement
    pub async fn query(
        &self,
        sql: &str,
        params: &[Value],
        ctx: &QueryContext,
    ) -> PoolResult<QueryResult> {
        let decision = self.route(sql, ctx).await;
        let opts = ctx.options();

        if !decision.is_replica() {
            debug!("Routing to primary {} ({})", decision.node_id, decision.reason);
            if decision.reason == RouteReason::Write {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
            } else {
                self.counters.primary_reads.fetch_add(1, Ordering::Relaxed);
            }
            let pool = self.topology.pool(&decision.node_id)?;
            return pool.query(sql, params, &opts).await;
        }

        let pool = self.topology.pool(&decision.node_id)?;
        match pool.query(sql, params, &opts).await {
            Ok(result) => {
                self.counters.replica_reads.fetch_add(1, Ordering::Relaxed);
                Ok(result)
            }
            Err(replica_err) => {
                self.counters.replica_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Read on replica {} failed ({}), retrying on primary",
                    decision.node_id, replica_err
                );

                let (primary_id, primary) = self.topology.primary_pool().await?;
                let result = primary.query(sql, params, &opts).await;
                if result.is_ok() {
                    debug!("Primary {} answered for replica {}", primary_id, decision.node_id);
                    self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
                    self.counters.primary_reads.fetch_add(1, Ordering::Relaxed);
                }
                result
            }
        }
    }

    /// Run `f` in a transaction on the primary
    pub async fn transaction<T, E, F, Fut>(&self, isolation: IsolationLevel, f: F) -> Result<T, E>
    where
        F: FnOnce(Transaction) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        let (_, primary) = self.topology.primary_pool().await?;
        self.counters.writes.fetch_add(1, Ordering::Relaxed);
        primary.transaction(isolation, f).await
    }

    pub fn stats(&self) -> RoutingStats {
        RoutingStats {
            replica_reads: self.counters.replica_reads.load(Ordering::Relaxed),
            primary_reads: self.counters.primary_reads.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            fallbacks: self.counters.fallbacks.load(Ordering::Relaxed),
            replica_failures: self.counters.replica_failures.load(Ordering::Relaxed),
        }
    }
}
