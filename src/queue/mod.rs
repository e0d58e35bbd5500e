/// Priority admission for queries
///
/// Three strict-priority FIFO lanes share one concurrency ceiling. A caller
/// waits in its lane until a slot frees up and then runs its query on its
/// own task; the slot is handed back when the query finishes or the caller
/// goes away.
use crate::error::{PoolError, PoolResult};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::debug;

/// Admission priority of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    fn lane(&self) -> usize {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Normal => write!(f, "normal"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Queue configuration
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// In-flight ceiling shared by all lanes
    pub max_concurrent: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { max_concurrent: 100 }
    }
}

/// Queue snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub queued_high: usize,
    pub queued_normal: usize,
    pub queued_low: usize,
    pub in_flight: usize,
    pub max_concurrent: usize,
    pub completed: u64,
    pub rejected: u64,
}

impl QueueStats {
    pub fn queued(&self) -> usize {
        self.queued_high + self.queued_normal + self.queued_low
    }
}

type Admission = Result<Permit, String>;

struct QueueState {
    lanes: [VecDeque<oneshot::Sender<Admission>>; 3],
    in_flight: usize,
    completed: u64,
    rejected: u64,
}

struct Shared {
    max_concurrent: usize,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Admit queued callers while slots are free, highest lane first
    fn dispatch(self: &Arc<Self>) {
        let admitted = self.admit();
        for ticket in admitted {
            let permit = Permit {
                shared: Arc::clone(self),
            };
            // A caller that already gave up drops the permit, freeing the slot
            let _ = ticket.send(Ok(permit));
        }
    }

    fn admit(&self) -> Vec<oneshot::Sender<Admission>> {
        let mut state = self.lock_state();
        let mut admitted = Vec::new();

        while state.in_flight < self.max_concurrent {
            let next = Priority::ALL.iter().find_map(|p| {
                let lane = &mut state.lanes[p.lane()];
                while let Some(ticket) = lane.pop_front() {
                    if !ticket.is_closed() {
                        return Some(ticket);
                    }
                }
                None
            });

            match next {
                Some(ticket) => {
                    state.in_flight += 1;
                    admitted.push(ticket);
                }
                None => break,
            }
        }

        admitted
    }
}

/// An occupied concurrency slot
struct Permit {
    shared: Arc<Shared>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        {
            let mut state = self.shared.lock_state();
            state.in_flight -= 1;
            state.completed += 1;
        }
        self.shared.dispatch();
    }
}

/// Priority-ordered admission queue
#[derive(Clone)]
pub struct QueryQueue {
    shared: Arc<Shared>,
}

impl QueryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                max_concurrent: config.max_concurrent.max(1),
                state: Mutex::new(QueueState {
                    lanes: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                    in_flight: 0,
                    completed: 0,
                    rejected: 0,
                }),
            }),
        }
    }

    /// Wait for a slot in `priority`'s lane, then run `f`
    pub async fn enqueue<T, F, Fut>(&self, priority: Priority, f: F) -> PoolResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = PoolResult<T>>,
    {
        let (tx, rx) = oneshot::channel();
        {
            let mut state = self.shared.lock_state();
            state.lanes[priority.lane()].push_back(tx);
        }
        self.shared.dispatch();

        let permit = match rx.await {
            Ok(Ok(permit)) => permit,
            Ok(Err(reason)) => return Err(PoolError::QueueCleared { reason }),
            Err(_) => {
                return Err(PoolError::internal("query queue dropped a waiting caller"))
            }
        };

        let result = f().await;
        drop(permit);
        result
    }

    /// Reject every caller still waiting; running queries are unaffected
    pub fn clear(&self, reason: &str) -> usize {
        let waiting: Vec<_> = {
            let mut state = self.shared.lock_state();
            let waiting: Vec<_> = state.lanes.iter_mut().flat_map(|lane| lane.drain(..)).collect();
            state.rejected += waiting.len() as u64;
            waiting
        };

        let count = waiting.len();
        for ticket in waiting {
            let _ = ticket.send(Err(reason.to_string()));
        }
        if count > 0 {
            debug!("Query queue cleared {} waiting queries: {}", count, reason);
        }
        count
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.lock_state();
        let live = |p: Priority| state.lanes[p.lane()].iter().filter(|t| !t.is_closed()).count();
        QueueStats {
            queued_high: live(Priority::High),
            queued_normal: live(Priority::Normal),
            queued_low: live(Priority::Low),
            in_flight: state.in_flight,
            max_concurrent: self.shared.max_concurrent,
            completed: state.completed,
            rejected: state.rejected,
        }
    }
}
