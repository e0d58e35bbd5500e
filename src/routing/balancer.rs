/// Replica selection strategies
use crate::core::Node;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Strategy used to spread reads over eligible replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LoadBalancingStrategy {
    #[default]
    RoundRobin,
    LeastConnections,
    LeastLag,
    Random,
}

impl fmt::Display for LoadBalancingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::RoundRobin => "round-robin",
            Self::LeastConnections => "least-connections",
            Self::LeastLag => "least-lag",
            Self::Random => "random",
        };
        write!(f, "{}", name)
    }
}

/// Load balancing algorithm trait
pub trait LoadBalancingAlgorithm: Send + Sync {
    /// Select a node from the eligible replicas
    fn select_node(&self, nodes: &[Node]) -> Option<usize>;
}

/// Round-robin load balancing algorithm
pub struct RoundRobin {
    counter: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self {
            counter: AtomicUsize::new(0),
        }
    }
}

impl Default for RoundRobin {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancingAlgorithm for RoundRobin {
    fn select_node(&self, nodes: &[Node]) -> Option<usize> {
        if nodes.is_empty() {
            return None;
        }

        let index = self.counter.fetch_add(1, Ordering::Relaxed) % nodes.len();
        Some(index)
    }
}

/// Fewest checked-out connections wins; ties go to the first node
pub struct LeastConnections;

impl LoadBalancingAlgorithm for LeastConnections {
    fn select_node(&self, nodes: &[Node]) -> Option<usize> {
        nodes
            .iter()
            .enumerate()
            .min_by_key(|(_, node)| node.connections)
            .map(|(index, _)| index)
    }
}

/// Lowest measured replication lag wins; ties go to the first node
pub struct LeastLag;

impl LoadBalancingAlgorithm for LeastLag {
    fn select_node(&self, nodes: &[Node]) -> Option<usize> {
        nodes
            .iter()
            .enumerate()
            .min_by_key(|(_, node)| node.lag_ms)
            .map(|(index, _)| index)
    }
}

/// Uniform random choice
pub struct Random;

impl LoadBalancingAlgorithm for Random {
    fn select_node(&self, nodes: &[Node]) -> Option<usize> {
        if nodes.is_empty() {
            return None;
        }
        Some(rand::thread_rng().gen_range(0..nodes.len()))
    }
}

/// Build the algorithm for a strategy
pub fn create_balancer(strategy: LoadBalancingStrategy) -> Box<dyn LoadBalancingAlgorithm> {
    match strategy {
        LoadBalancingStrategy::RoundRobin => Box::new(RoundRobin::new()),
        LoadBalancingStrategy::LeastConnections => Box::new(LeastConnections),
        LoadBalancingStrategy::LeastLag => Box::new(LeastLag),
        LoadBalancingStrategy::Random => Box::new(Random),
    }
}
