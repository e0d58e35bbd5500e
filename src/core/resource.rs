/// Generic resource pooling
///
/// A [`ResourcePool`] owns the lifecycle of any resource produced by a
/// [`ResourceManager`]: creation, validation on checkout, destruction, idle
/// eviction and draining. Callers that find the pool at capacity wait in a
/// FIFO list; a released resource goes straight to the oldest waiter.
use crate::error::{PoolError, PoolResult};
use crate::events::{Event, EventBus, PoolEventKind};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Creates, validates and destroys pooled resources
#[async_trait]
pub trait ResourceManager: Send + Sync + 'static {
    type Resource: Send + Sync + 'static;

    /// Create a new resource
    async fn create(&self) -> PoolResult<Self::Resource>;

    /// Check a resource before handing it out
    async fn validate(&self, _resource: &Self::Resource) -> bool {
        true
    }

    /// Release whatever the resource holds
    async fn destroy(&self, resource: Self::Resource);
}

/// Sizing and timing of a resource pool
#[derive(Debug, Clone)]
pub struct ResourcePoolConfig {
    pub min: usize,
    pub max: usize,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub eviction_interval: Duration,
}

impl Default for ResourcePoolConfig {
    fn default() -> Self {
        Self {
            min: 2,
            max: 10,
            acquire_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(600),
            eviction_interval: Duration::from_secs(30),
        }
    }
}

/// A resource plus the bookkeeping the pool keeps about it
#[derive(Debug)]
pub struct PooledResource<T> {
    id: u64,
    resource: T,
    created_at: Instant,
    last_used: Instant,
    usage_count: u64,
}

impl<T> PooledResource<T> {
    fn new(id: u64, resource: T) -> Self {
        let now = Instant::now();
        Self {
            id,
            resource,
            created_at: now,
            last_used: now,
            usage_count: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn resource(&self) -> &T {
        &self.resource
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used(&self) -> Instant {
        self.last_used
    }

    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// Mark a checkout
    fn touch(&mut self) {
        self.last_used = Instant::now();
        self.usage_count += 1;
    }

    fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            age: self.age(),
            idle_for: self.idle_time(),
            usage_count: self.usage_count,
        }
    }
}

impl<T> Deref for PooledResource<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.resource
    }
}

/// Snapshot of one idle resource
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionInfo {
    pub id: u64,
    pub age: Duration,
    pub idle_for: Duration,
    pub usage_count: u64,
}

/// Snapshot of pool occupancy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourcePoolStatus {
    pub available: usize,
    pub in_use: usize,
    pub creating: usize,
    pub waiting: usize,
    pub min: usize,
    pub max: usize,
}

impl ResourcePoolStatus {
    pub fn total(&self) -> usize {
        self.available + self.in_use + self.creating
    }
}

struct PoolState<T> {
    /// Front holds the least recently used resource
    available: VecDeque<PooledResource<T>>,
    in_use: usize,
    creating: usize,
    waiters: VecDeque<oneshot::Sender<PooledResource<T>>>,
    closed: bool,
}

impl<T> PoolState<T> {
    fn total(&self) -> usize {
        self.available.len() + self.in_use + self.creating
    }

    fn live_waiters(&self) -> usize {
        self.waiters.iter().filter(|w| !w.is_closed()).count()
    }

    fn is_idle(&self) -> bool {
        self.in_use == 0 && self.creating == 0
    }
}

enum Checkout<T> {
    Validate(PooledResource<T>),
    Create,
    Wait(oneshot::Receiver<PooledResource<T>>),
}

/// Slot counter a checkout holds while it awaits the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    InUse,
    Creating,
}

/// Gives a slot back if the acquiring future is dropped mid-checkout.
///
/// A resource caught mid-validation is destroyed in the background.
struct SlotGuard<M: ResourceManager> {
    pool: ResourcePool<M>,
    slot: Slot,
    resource: Option<PooledResource<M::Resource>>,
    armed: bool,
}

impl<M: ResourceManager> SlotGuard<M> {
    fn validating(pool: &ResourcePool<M>, resource: PooledResource<M::Resource>) -> Self {
        Self {
            pool: pool.clone(),
            slot: Slot::InUse,
            resource: Some(resource),
            armed: true,
        }
    }

    fn creating(pool: &ResourcePool<M>) -> Self {
        Self {
            pool: pool.clone(),
            slot: Slot::Creating,
            resource: None,
            armed: true,
        }
    }

    fn disarm(mut self) -> Option<PooledResource<M::Resource>> {
        self.armed = false;
        self.resource.take()
    }
}

impl<M: ResourceManager> Drop for SlotGuard<M> {
    fn drop(&mut self) {
        if self.armed {
            self.pool.abandon(self.slot, self.resource.take());
        }
    }
}

/// Hands a resource that raced a dropped waiter back to the pool
struct WaitGuard<M: ResourceManager> {
    pool: ResourcePool<M>,
    rx: Option<oneshot::Receiver<PooledResource<M::Resource>>>,
}

impl<M: ResourceManager> Drop for WaitGuard<M> {
    fn drop(&mut self) {
        if let Some(mut rx) = self.rx.take() {
            rx.close();
            if let Ok(resource) = rx.try_recv() {
                if let Some(leftover) = self.pool.check_in(resource) {
                    self.pool.destroy_in_background(leftover);
                }
            }
        }
    }
}

struct Shared<M: ResourceManager> {
    name: String,
    manager: M,
    config: ResourcePoolConfig,
    state: Mutex<PoolState<M::Resource>>,
    next_id: AtomicU64,
    drained: Notify,
    events: EventBus,
}

impl<M: ResourceManager> Shared<M> {
    fn lock_state(&self) -> MutexGuard<'_, PoolState<M::Resource>> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn emit(&self, kind: PoolEventKind) {
        self.events.emit(Event::Pool {
            pool: self.name.clone(),
            kind,
        });
    }

    fn wrap(&self, resource: M::Resource) -> PooledResource<M::Resource> {
        PooledResource::new(self.next_id.fetch_add(1, Ordering::Relaxed), resource)
    }
}

/// Bounded pool of resources with FIFO waiters and idle eviction
pub struct ResourcePool<M: ResourceManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ResourceManager> Clone for ResourcePool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ResourceManager> ResourcePool<M> {
    pub fn new<S: Into<String>>(
        name: S,
        manager: M,
        config: ResourcePoolConfig,
        events: EventBus,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                manager,
                config,
                state: Mutex::new(PoolState {
                    available: VecDeque::new(),
                    in_use: 0,
                    creating: 0,
                    waiters: VecDeque::new(),
                    closed: false,
                }),
                next_id: AtomicU64::new(1),
                drained: Notify::new(),
                events,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn config(&self) -> &ResourcePoolConfig {
        &self.shared.config
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    pub fn is_closed(&self) -> bool {
        self.shared.lock_state().closed
    }

    /// Check out a resource, waiting up to the acquire timeout
    pub async fn acquire(&self) -> PoolResult<PooledResource<M::Resource>> {
        let started = Instant::now();

        loop {
            let step = {
                let mut state = self.shared.lock_state();
                if state.closed {
                    return Err(self.closed_error());
                }

                if let Some(resource) = state.available.pop_back() {
                    state.in_use += 1;
                    Checkout::Validate(resource)
                } else if state.total() < self.shared.config.max {
                    state.creating += 1;
                    Checkout::Create
                } else {
                    state.waiters.retain(|w| !w.is_closed());
                    let (tx, rx) = oneshot::channel();
                    state.waiters.push_back(tx);
                    Checkout::Wait(rx)
                }
            };

            match step {
                Checkout::Validate(resource) => {
                    let guard = SlotGuard::validating(self, resource);
                    let valid = match &guard.resource {
                        Some(resource) => self.shared.manager.validate(&resource.resource).await,
                        None => false,
                    };
                    let mut resource = match guard.disarm() {
                        Some(resource) => resource,
                        None => continue,
                    };

                    if valid {
                        resource.touch();
                        self.shared.emit(PoolEventKind::Acquire);
                        return Ok(resource);
                    }

                    debug!(
                        "Pool {}: resource {} failed validation, destroying",
                        self.shared.name, resource.id
                    );
                    {
                        let mut state = self.shared.lock_state();
                        state.in_use -= 1;
                    }
                    self.destroy_resource(resource).await;
                    self.shared.drained.notify_one();
                }
                Checkout::Create => return self.create_for_caller().await,
                Checkout::Wait(rx) => return self.wait_for_release(rx, started).await,
            }
        }
    }

    async fn create_for_caller(&self) -> PoolResult<PooledResource<M::Resource>> {
        let guard = SlotGuard::creating(self);
        let created = self.shared.manager.create().await;
        guard.disarm();

        match created {
            Ok(resource) => {
                let mut pooled = self.shared.wrap(resource);
                let closed = {
                    let mut state = self.shared.lock_state();
                    state.creating -= 1;
                    if state.closed {
                        true
                    } else {
                        state.in_use += 1;
                        false
                    }
                };
                self.shared.emit(PoolEventKind::Create);

                if closed {
                    self.destroy_resource(pooled).await;
                    self.shared.drained.notify_one();
                    return Err(self.closed_error());
                }

                pooled.touch();
                self.shared.emit(PoolEventKind::Acquire);
                Ok(pooled)
            }
            Err(e) => {
                {
                    let mut state = self.shared.lock_state();
                    state.creating -= 1;
                    if state.closed {
                        self.shared.drained.notify_one();
                    }
                }
                warn!("Pool {}: failed to create resource: {}", self.shared.name, e);
                self.shared.emit(PoolEventKind::Error(e.to_string()));
                Err(e)
            }
        }
    }

    async fn wait_for_release(
        &self,
        rx: oneshot::Receiver<PooledResource<M::Resource>>,
        started: Instant,
    ) -> PoolResult<PooledResource<M::Resource>> {
        let remaining = self
            .shared
            .config
            .acquire_timeout
            .saturating_sub(started.elapsed());

        let mut guard = WaitGuard {
            pool: self.clone(),
            rx: Some(rx),
        };
        let waited = match guard.rx.as_mut() {
            Some(rx) => tokio::time::timeout(remaining, rx).await,
            None => return Err(self.closed_error()),
        };
        let mut rx = match guard.rx.take() {
            Some(rx) => rx,
            None => return Err(self.closed_error()),
        };

        match waited {
            Ok(Ok(mut resource)) => {
                resource.touch();
                self.shared.emit(PoolEventKind::Acquire);
                Ok(resource)
            }
            Ok(Err(_)) => Err(self.closed_error()),
            Err(_) => {
                // A release may have raced the deadline
                rx.close();
                if let Ok(mut resource) = rx.try_recv() {
                    resource.touch();
                    self.shared.emit(PoolEventKind::Acquire);
                    return Ok(resource);
                }

                let timeout_ms = self.shared.config.acquire_timeout.as_millis() as u64;
                self.shared.emit(PoolEventKind::Error(format!(
                    "acquire timed out after {}ms",
                    timeout_ms
                )));
                Err(PoolError::ConnectionTimeout {
                    pool: self.shared.name.clone(),
                    timeout_ms,
                })
            }
        }
    }

    /// Return a resource; the oldest waiter gets it first
    pub async fn release(&self, resource: PooledResource<M::Resource>) {
        if let Some(resource) = self.check_in(resource) {
            self.destroy_resource(resource).await;
            self.shared.drained.notify_one();
        }
    }

    /// Hand a checked-out resource to a waiter or the idle list. Returns it
    /// back when the pool is closed and it must be destroyed instead.
    fn check_in(
        &self,
        mut resource: PooledResource<M::Resource>,
    ) -> Option<PooledResource<M::Resource>> {
        resource.last_used = Instant::now();

        let leftover = {
            let mut state = self.shared.lock_state();
            if state.closed {
                state.in_use = state.in_use.saturating_sub(1);
                Some(resource)
            } else {
                let mut pending = resource;
                loop {
                    match state.waiters.pop_front() {
                        Some(waiter) => match waiter.send(pending) {
                            Ok(()) => break None,
                            Err(back) => pending = back,
                        },
                        None => {
                            state.in_use = state.in_use.saturating_sub(1);
                            state.available.push_back(pending);
                            break None;
                        }
                    }
                }
            }
        };

        self.shared.emit(PoolEventKind::Release);
        leftover
    }

    /// Undo the bookkeeping of a checkout whose caller went away
    fn abandon(&self, slot: Slot, resource: Option<PooledResource<M::Resource>>) {
        let replenish = {
            let mut state = self.shared.lock_state();
            match slot {
                Slot::InUse => state.in_use = state.in_use.saturating_sub(1),
                Slot::Creating => state.creating = state.creating.saturating_sub(1),
            }
            if !state.closed
                && state.live_waiters() > 0
                && state.total() < self.shared.config.max
            {
                state.creating += 1;
                true
            } else {
                false
            }
        };

        debug!(
            "Pool {}: checkout abandoned while {}",
            self.shared.name,
            match slot {
                Slot::InUse => "validating",
                Slot::Creating => "creating",
            }
        );

        if let Some(resource) = resource {
            self.destroy_in_background(resource);
        }
        self.shared.drained.notify_one();

        if replenish {
            if tokio::runtime::Handle::try_current().is_ok() {
                self.spawn_replacement();
            } else {
                let mut state = self.shared.lock_state();
                state.creating = state.creating.saturating_sub(1);
            }
        }
    }

    fn destroy_in_background(&self, resource: PooledResource<M::Resource>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let pool = self.clone();
                handle.spawn(async move {
                    pool.destroy_resource(resource).await;
                    pool.shared.drained.notify_one();
                });
            }
            Err(_) => warn!(
                "Pool {}: resource {} dropped outside a runtime without being destroyed",
                self.shared.name, resource.id
            ),
        }
    }

    /// Destroy a checked-out resource instead of returning it.
    ///
    /// If callers are queued and the pool has room, a replacement is created
    /// in the background and handed to the oldest waiter.
    pub async fn discard(&self, resource: PooledResource<M::Resource>) {
        let replenish = {
            let mut state = self.shared.lock_state();
            state.in_use = state.in_use.saturating_sub(1);
            if state.closed {
                false
            } else if state.live_waiters() > 0 && state.total() < self.shared.config.max {
                state.creating += 1;
                true
            } else {
                false
            }
        };

        self.destroy_resource(resource).await;
        self.shared.drained.notify_one();

        if replenish {
            self.spawn_replacement();
        }
    }

    fn spawn_replacement(&self) {
        let pool = self.clone();
        tokio::spawn(async move {
            match pool.shared.manager.create().await {
                Ok(resource) => {
                    let pooled = pool.shared.wrap(resource);
                    {
                        let mut state = pool.shared.lock_state();
                        state.creating -= 1;
                        state.in_use += 1;
                    }
                    pool.shared.emit(PoolEventKind::Create);
                    pool.release(pooled).await;
                }
                Err(e) => {
                    {
                        let mut state = pool.shared.lock_state();
                        state.creating -= 1;
                    }
                    warn!(
                        "Pool {}: failed to create replacement resource: {}",
                        pool.shared.name, e
                    );
                    pool.shared.emit(PoolEventKind::Error(e.to_string()));
                }
            }
        });
    }

    async fn destroy_resource(&self, resource: PooledResource<M::Resource>) {
        self.shared.manager.destroy(resource.resource).await;
        self.shared.emit(PoolEventKind::Destroy);
    }

    /// Create resources until the pool holds at least `min`
    pub async fn warmup(&self) -> PoolResult<usize> {
        let mut created = 0;

        loop {
            {
                let mut state = self.shared.lock_state();
                if state.closed {
                    return Err(self.closed_error());
                }
                if state.total() >= self.shared.config.min {
                    break;
                }
                state.creating += 1;
            }

            match self.shared.manager.create().await {
                Ok(resource) => {
                    let pooled = self.shared.wrap(resource);
                    {
                        let mut state = self.shared.lock_state();
                        state.creating -= 1;
                        state.in_use += 1;
                    }
                    self.shared.emit(PoolEventKind::Create);
                    self.release(pooled).await;
                    created += 1;
                }
                Err(e) => {
                    {
                        let mut state = self.shared.lock_state();
                        state.creating -= 1;
                    }
                    self.shared.emit(PoolEventKind::Error(e.to_string()));
                    return Err(e);
                }
            }
        }

        if created > 0 {
            debug!("Pool {}: warmed up {} resources", self.shared.name, created);
        }
        Ok(created)
    }

    /// Destroy resources idle longer than the idle timeout, keeping at least
    /// `min` available
    pub async fn evict_idle(&self) -> usize {
        let expired = {
            let mut state = self.shared.lock_state();
            let idle_timeout = self.shared.config.idle_timeout;
            let mut removable = state.available.len().saturating_sub(self.shared.config.min);
            let mut expired = Vec::new();
            let mut keep = VecDeque::with_capacity(state.available.len());

            for resource in state.available.drain(..) {
                if removable > 0 && resource.idle_time() > idle_timeout {
                    removable -= 1;
                    expired.push(resource);
                } else {
                    keep.push_back(resource);
                }
            }
            state.available = keep;
            expired
        };

        let count = expired.len();
        for resource in expired {
            self.destroy_resource(resource).await;
        }
        if count > 0 {
            debug!("Pool {}: evicted {} idle resources", self.shared.name, count);
        }
        count
    }

    /// Run [`evict_idle`](Self::evict_idle) on the configured interval until
    /// the pool is drained
    pub fn start_eviction(&self) -> JoinHandle<()> {
        let pool = self.clone();
        let period = self.shared.config.eviction_interval;

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                if pool.is_closed() {
                    break;
                }
                pool.evict_idle().await;
            }
        })
    }

    /// Reject new acquires, fail pending waiters, destroy idle resources and
    /// wait for checked-out ones to come back
    pub async fn drain(&self) {
        let (available, waiters) = {
            let mut state = self.shared.lock_state();
            state.closed = true;
            (
                std::mem::take(&mut state.available),
                std::mem::take(&mut state.waiters),
            )
        };
        drop(waiters);

        for resource in available {
            self.destroy_resource(resource).await;
        }

        loop {
            let idle = self.shared.lock_state().is_idle();
            if idle {
                break;
            }
            self.shared.drained.notified().await;
        }

        info!("Pool {} drained", self.shared.name);
    }

    pub fn status(&self) -> ResourcePoolStatus {
        let state = self.shared.lock_state();
        ResourcePoolStatus {
            available: state.available.len(),
            in_use: state.in_use,
            creating: state.creating,
            waiting: state.live_waiters(),
            min: self.shared.config.min,
            max: self.shared.config.max,
        }
    }

    /// Bookkeeping for every idle resource
    pub fn idle_resources(&self) -> Vec<ConnectionInfo> {
        let state = self.shared.lock_state();
        state.available.iter().map(PooledResource::info).collect()
    }

    fn closed_error(&self) -> PoolError {
        PoolError::PoolClosed {
            pool: self.shared.name.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio_test::{assert_err, assert_ok};

    #[derive(Default)]
    struct CountingManager {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        fail_create: AtomicBool,
        reject_all: AtomicBool,
        create_delay_ms: AtomicU64,
        validate_delay_ms: AtomicU64,
    }

    async fn pause(delay_ms: &AtomicU64) {
        let ms = delay_ms.load(Ordering::SeqCst);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    #[async_trait]
    impl ResourceManager for Arc<CountingManager> {
        type Resource = usize;

        async fn create(&self) -> PoolResult<usize> {
            pause(&self.create_delay_ms).await;
            if self.fail_create.load(Ordering::SeqCst) {
                return Err(PoolError::unreachable("test", "refused"));
            }
            Ok(self.created.fetch_add(1, Ordering::SeqCst))
        }

        async fn validate(&self, _resource: &usize) -> bool {
            pause(&self.validate_delay_ms).await;
            !self.reject_all.load(Ordering::SeqCst)
        }

        async fn destroy(&self, _resource: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_pool(min: usize, max: usize, acquire_ms: u64) -> (ResourcePool<Arc<CountingManager>>, Arc<CountingManager>) {
        let manager = Arc::new(CountingManager::default());
        let config = ResourcePoolConfig {
            min,
            max,
            acquire_timeout: Duration::from_millis(acquire_ms),
            idle_timeout: Duration::from_millis(20),
            eviction_interval: Duration::from_millis(10),
        };
        let pool = ResourcePool::new("test", Arc::clone(&manager), config, EventBus::default());
        (pool, manager)
    }

    #[tokio::test]
    async fn test_acquire_fills_to_max_then_times_out() {
        let (pool, _manager) = test_pool(2, 5, 50);

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire().await.unwrap());
        }
        assert_eq!(pool.status().in_use, 5);

        let started = Instant::now();
        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::ConnectionTimeout { .. })));
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_release_unblocks_waiter() {
        let (pool, _manager) = test_pool(2, 5, 2000);

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire().await.unwrap());
        }

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(pool.status().waiting, 1);

        let released = held.pop().unwrap();
        let released_id = released.id();
        pool.release(released).await;

        let acquired = tokio::time::timeout(Duration::from_millis(100), waiter)
            .await
            .expect("waiter should be unblocked")
            .unwrap()
            .unwrap();
        assert_eq!(acquired.id(), released_id);
        assert_eq!(pool.status().available, 0);
        assert_eq!(pool.status().in_use, 5);
    }

    #[tokio::test]
    async fn test_waiters_are_served_fifo() {
        let (pool, _manager) = test_pool(0, 1, 2000);
        let first = pool.acquire().await.unwrap();

        let p1 = pool.clone();
        let w1 = tokio::spawn(async move { p1.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let p2 = pool.clone();
        let w2 = tokio::spawn(async move { p2.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.release(first).await;

        let got = tokio::time::timeout(Duration::from_millis(100), w1)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!w2.is_finished());

        pool.release(got).await;
        let second = tokio::time::timeout(Duration::from_millis(100), w2)
            .await
            .unwrap()
            .unwrap();
        assert_ok!(second);
    }

    #[tokio::test]
    async fn test_invalid_resources_are_replaced() {
        let (pool, manager) = test_pool(0, 3, 100);

        let r = pool.acquire().await.unwrap();
        pool.release(r).await;
        assert_eq!(pool.status().available, 1);

        manager.reject_all.store(true, Ordering::SeqCst);
        let fresh = pool.acquire().await.unwrap();
        assert_eq!(*fresh, 1);
        assert_eq!(manager.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().in_use, 1);
    }

    #[tokio::test]
    async fn test_create_failure_surfaces() {
        let (pool, manager) = test_pool(0, 3, 100);
        manager.fail_create.store(true, Ordering::SeqCst);

        let result = pool.acquire().await;
        assert!(matches!(result, Err(PoolError::NodeUnreachable { .. })));
        assert_eq!(pool.status().total(), 0);
    }

    #[tokio::test]
    async fn test_eviction_keeps_min() {
        let (pool, manager) = test_pool(2, 5, 100);

        let mut held = Vec::new();
        for _ in 0..5 {
            held.push(pool.acquire().await.unwrap());
        }
        for r in held {
            pool.release(r).await;
        }
        assert_eq!(pool.status().available, 5);

        tokio::time::sleep(Duration::from_millis(40)).await;
        let evicted = pool.evict_idle().await;

        assert_eq!(evicted, 3);
        assert_eq!(pool.status().available, 2);
        assert_eq!(manager.destroyed.load(Ordering::SeqCst), 3);

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(pool.evict_idle().await, 0);
        assert_eq!(pool.status().available, 2);
    }

    #[tokio::test]
    async fn test_warmup_creates_min() {
        let (pool, manager) = test_pool(3, 5, 100);
        assert_eq!(pool.warmup().await.unwrap(), 3);
        assert_eq!(pool.status().available, 3);
        assert_eq!(manager.created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.idle_resources().len(), 3);
        assert!(pool.idle_resources().iter().all(|info| info.usage_count == 0));

        assert_eq!(pool.warmup().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_and_rejects() {
        let (pool, manager) = test_pool(1, 2, 100);
        pool.warmup().await.unwrap();
        let held = pool.acquire().await.unwrap();

        let drain_pool = pool.clone();
        let drain = tokio::spawn(async move { drain_pool.drain().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!drain.is_finished());

        assert_err!(pool.acquire().await);

        pool.release(held).await;
        tokio::time::timeout(Duration::from_millis(100), drain)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(pool.status().total(), 0);
        assert_eq!(manager.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discard_replenishes_waiter() {
        let (pool, manager) = test_pool(0, 1, 1000);
        let broken = pool.acquire().await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        pool.discard(broken).await;
        let replacement = tokio::time::timeout(Duration::from_millis(200), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(*replacement, 1);
        assert_eq!(manager.destroyed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_usage_count_tracks_checkouts() {
        let (pool, _manager) = test_pool(0, 1, 100);
        let r = pool.acquire().await.unwrap();
        assert_eq!(r.usage_count(), 1);
        pool.release(r).await;
        let r = pool.acquire().await.unwrap();
        assert_eq!(r.usage_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_validation_frees_slot() {
        let (pool, manager) = test_pool(0, 1, 100);
        let r = pool.acquire().await.unwrap();
        pool.release(r).await;

        manager.validate_delay_ms.store(200, Ordering::SeqCst);
        assert_err!(tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await);
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The half-validated resource is destroyed rather than leaked
        assert_eq!(pool.status().total(), 0);
        assert_eq!(manager.destroyed.load(Ordering::SeqCst), 1);

        manager.validate_delay_ms.store(0, Ordering::SeqCst);
        let fresh = pool.acquire().await.unwrap();
        assert_eq!(*fresh, 1);
        assert_eq!(pool.status().in_use, 1);
    }

    #[tokio::test]
    async fn test_cancelled_create_frees_slot() {
        let (pool, manager) = test_pool(0, 1, 100);

        manager.create_delay_ms.store(200, Ordering::SeqCst);
        for _ in 0..3 {
            assert_err!(tokio::time::timeout(Duration::from_millis(20), pool.acquire()).await);
        }
        assert_eq!(pool.status().creating, 0);
        assert_eq!(pool.status().total(), 0);

        manager.create_delay_ms.store(0, Ordering::SeqCst);
        assert_ok!(pool.acquire().await);
        assert_eq!(pool.status().in_use, 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_strand_resource() {
        let (pool, _manager) = test_pool(0, 1, 1000);
        let held = pool.acquire().await.unwrap();

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        waiter.abort();
        let _ = waiter.await;

        pool.release(held).await;
        let status = pool.status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.available, 1);
        assert_ok!(pool.acquire().await);
    }

    #[tokio::test]
    async fn test_abandoned_create_replenishes_waiter() {
        let (pool, manager) = test_pool(0, 1, 1000);
        manager.create_delay_ms.store(100, Ordering::SeqCst);

        let first_pool = pool.clone();
        let first = tokio::spawn(async move { first_pool.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter_pool = pool.clone();
        let waiter = tokio::spawn(async move { waiter_pool.acquire().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pool.status().waiting, 1);

        first.abort();
        let _ = first.await;

        let replacement = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .expect("waiter should get the replacement")
            .unwrap();
        assert_ok!(replacement);
    }
}
