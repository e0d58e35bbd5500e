/// Live node table
///
/// Holds every node's role and last measured health alongside the
/// connection pool for that node. Health data is written by the health
/// monitor; the role swap is written by the failover manager. Routing only
/// reads.
use crate::core::{ConnectionPool, Node, NodeRole};
use crate::error::{ConfigError, PoolError, PoolResult};
use fnv::FnvHashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

struct TopologyState {
    nodes: FnvHashMap<String, Node>,
    primary_id: String,
}

/// Node table plus per-node connection pools
pub struct Topology {
    state: RwLock<TopologyState>,
    pools: FnvHashMap<String, Arc<ConnectionPool>>,
}

impl Topology {
    /// Build the table; exactly one node must hold the primary role
    pub fn new(members: Vec<(Node, Arc<ConnectionPool>)>) -> PoolResult<Self> {
        let mut nodes = FnvHashMap::default();
        let mut pools = FnvHashMap::default();
        let mut primaries = Vec::new();

        for (node, pool) in members {
            if nodes.contains_key(&node.id) {
                return Err(ConfigError::ValidationError(format!(
                    "duplicate node id '{}'",
                    node.id
                ))
                .into());
            }
            if node.role == NodeRole::Primary {
                primaries.push(node.id.clone());
            }
            pools.insert(node.id.clone(), pool);
            nodes.insert(node.id.clone(), node);
        }

        if primaries.len() != 1 {
            return Err(ConfigError::ValidationError(format!(
                "expected exactly one primary node, found {}",
                primaries.len()
            ))
            .into());
        }

        Ok(Self {
            state: RwLock::new(TopologyState {
                nodes,
                primary_id: primaries.remove(0),
            }),
            pools,
        })
    }

    pub async fn primary_id(&self) -> String {
        self.state.read().await.primary_id.clone()
    }

    /// Pool of the current primary together with its id
    pub async fn primary_pool(&self) -> PoolResult<(String, Arc<ConnectionPool>)> {
        let primary_id = self.primary_id().await;
        let pool = self.pool(&primary_id)?;
        Ok((primary_id, pool))
    }

    pub fn pool(&self, node_id: &str) -> PoolResult<Arc<ConnectionPool>> {
        self.pools
            .get(node_id)
            .cloned()
            .ok_or_else(|| PoolError::UnknownNode {
                node_id: node_id.to_string(),
            })
    }

    /// Every pool, ordered by node id
    pub fn pools(&self) -> Vec<(String, Arc<ConnectionPool>)> {
        let mut pools: Vec<_> = self
            .pools
            .iter()
            .map(|(id, pool)| (id.clone(), Arc::clone(pool)))
            .collect();
        pools.sort_by(|a, b| a.0.cmp(&b.0));
        pools
    }

    pub async fn node(&self, node_id: &str) -> Option<Node> {
        self.state.read().await.nodes.get(node_id).cloned()
    }

    /// Copy of every node, ordered by id
    pub async fn snapshot(&self) -> Vec<Node> {
        let state = self.state.read().await;
        let mut nodes: Vec<Node> = state.nodes.values().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    /// Nodes currently in the replica role, ordered by id
    pub async fn replicas(&self) -> Vec<Node> {
        self.snapshot()
            .await
            .into_iter()
            .filter(|n| n.role == NodeRole::Replica)
            .collect()
    }

    /// Apply a probe outcome to one node
    pub(crate) async fn record_probe<F>(&self, node_id: &str, update: F) -> bool
    where
        F: FnOnce(&mut Node),
    {
        let mut state = self.state.write().await;
        match state.nodes.get_mut(node_id) {
            Some(node) => {
                update(node);
                true
            }
            None => false,
        }
    }

    /// Make `new_primary` the primary and demote the old one.
    /// Returns the id of the previous primary.
    pub(crate) async fn promote(&self, new_primary: &str) -> PoolResult<String> {
        let mut state = self.state.write().await;
        if !state.nodes.contains_key(new_primary) {
            return Err(PoolError::UnknownNode {
                node_id: new_primary.to_string(),
            });
        }

        let previous = std::mem::replace(&mut state.primary_id, new_primary.to_string());
        if let Some(old) = state.nodes.get_mut(&previous) {
            old.role = NodeRole::Replica;
        }
        if let Some(new) = state.nodes.get_mut(new_primary) {
            new.role = NodeRole::Primary;
            new.lag_ms = 0;
        }
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Endpoint, NodeStatus, PoolConfig};
    use crate::driver::memory::MemoryCluster;
    use crate::events::EventBus;

    fn member(id: &str, port: u16, role: NodeRole) -> (Node, Arc<ConnectionPool>) {
        let endpoint = Endpoint::new("127.0.0.1", port);
        let cluster = MemoryCluster::new();
        cluster.add_node(&endpoint, role == NodeRole::Primary);
        let pool = ConnectionPool::new(
            id,
            PoolConfig::new(endpoint.clone()),
            Arc::new(cluster.driver()),
            EventBus::default(),
        );
        (Node::new(id, endpoint, role), Arc::new(pool))
    }

    #[test]
    fn test_requires_single_primary() {
        let none = Topology::new(vec![member("replica-1", 5433, NodeRole::Replica)]);
        assert!(matches!(none, Err(PoolError::Config(_))));

        let two = Topology::new(vec![
            member("a", 5432, NodeRole::Primary),
            member("b", 5433, NodeRole::Primary),
        ]);
        assert!(matches!(two, Err(PoolError::Config(_))));

        let duplicate = Topology::new(vec![
            member("a", 5432, NodeRole::Primary),
            member("a", 5433, NodeRole::Replica),
        ]);
        assert!(matches!(duplicate, Err(PoolError::Config(_))));
    }

    #[tokio::test]
    async fn test_snapshot_sorted() {
        let topology = Topology::new(vec![
            member("replica-2", 5434, NodeRole::Replica),
            member("primary", 5432, NodeRole::Primary),
            member("replica-1", 5433, NodeRole::Replica),
        ])
        .unwrap();

        let ids: Vec<_> = topology.snapshot().await.into_iter().map(|n| n.id).collect();
        assert_eq!(ids, vec!["primary", "replica-1", "replica-2"]);
        assert_eq!(topology.replicas().await.len(), 2);
        assert_eq!(topology.primary_id().await, "primary");
        assert!(topology.pool("missing").is_err());
    }

    #[tokio::test]
    async fn test_promote_swaps_roles() {
        let topology = Topology::new(vec![
            member("primary", 5432, NodeRole::Primary),
            member("replica-1", 5433, NodeRole::Replica),
        ])
        .unwrap();

        topology
            .record_probe("replica-1", |n| {
                n.status = NodeStatus::Healthy;
                n.lag_ms = 40;
            })
            .await;

        let previous = topology.promote("replica-1").await.unwrap();
        assert_eq!(previous, "primary");
        assert_eq!(topology.primary_id().await, "replica-1");

        let promoted = topology.node("replica-1").await.unwrap();
        assert!(promoted.is_primary());
        assert_eq!(promoted.lag_ms, 0);
        assert_eq!(topology.node("primary").await.unwrap().role, NodeRole::Replica);

        let primaries = topology
            .snapshot()
            .await
            .iter()
            .filter(|n| n.is_primary())
            .count();
        assert_eq!(primaries, 1);
    }
}
