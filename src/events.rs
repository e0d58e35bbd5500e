/// Typed operational events
///
/// Pools, the health monitor and the failover manager publish onto a shared
/// broadcast channel. Events are for operational tooling only; nothing on the
/// query path waits for a subscriber.
use crate::failover::FailoverEvent;
use crate::health::ProbeResult;
use tokio::sync::broadcast;

const DEFAULT_CAPACITY: usize = 1024;

/// Resource pool lifecycle events
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEventKind {
    Acquire,
    Release,
    Create,
    Destroy,
    Error(String),
}

/// Everything observable about the replication pool
#[derive(Debug, Clone)]
pub enum Event {
    /// Resource churn in the pool named `pool`
    Pool { pool: String, kind: PoolEventKind },
    /// A full health-check pass finished
    HealthCheckComplete { results: Vec<ProbeResult> },
    /// A probe failed
    NodeUnhealthy { node_id: String, reason: String },
    /// A reachable replica lags beyond the configured threshold
    ReplicationLagWarning {
        node_id: String,
        lag_ms: u64,
        threshold_ms: u64,
    },
    FailoverStarted {
        previous_primary: String,
        reason: String,
    },
    FailoverComplete(FailoverEvent),
    FailoverFailed {
        previous_primary: String,
        reason: String,
        error: String,
    },
}

/// Broadcast hub for [`Event`]s
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event; dropped silently when nobody listens
    pub fn emit(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_without_subscribers() {
        let bus = EventBus::default();
        bus.emit(Event::NodeUnhealthy {
            node_id: "replica-1".into(),
            reason: "timeout".into(),
        });
    }

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(Event::Pool {
            pool: "primary".into(),
            kind: PoolEventKind::Create,
        });

        match rx.recv().await.unwrap() {
            Event::Pool { pool, kind } => {
                assert_eq!(pool, "primary");
                assert_eq!(kind, PoolEventKind::Create);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
