//! Bounded pool of reusable resources
//!
//! Idle resources are handed out oldest first. When the pool is at capacity,
//! callers queue in arrival order and a released resource goes straight to
//! the longest waiter. Resources are validated on release; invalid ones are
//! closed and, if someone is waiting, replaced.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use relay_core::{EventBus, EventKind, PoolSettings, RelayError, Result};
use serde::Serialize;
use serde_json::json;
use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Configuration for pool behavior
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Name used in logs and events
    pub name: String,
    /// Resources created up front and kept through idle reclamation
    pub min_connections: usize,
    /// Hard cap on live resources
    pub max_connections: usize,
    /// Period of the idle reclamation pass
    pub idle_timeout: Duration,
    /// Default wait for `acquire`
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_connections: 2,
            max_connections: 10,
            idle_timeout: Duration::from_secs(30),
            acquire_timeout: Duration::from_secs(5),
        }
    }
}

impl PoolConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_pool_size(mut self, min: usize, max: usize) -> Self {
        self.max_connections = max.max(1);
        self.min_connections = min.min(self.max_connections);
        self
    }

    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = timeout;
        self
    }
}

impl From<&PoolSettings> for PoolConfig {
    fn from(settings: &PoolSettings) -> Self {
        Self::default()
            .with_pool_size(settings.min_connections, settings.max_connections)
            .with_idle_timeout(settings.idle_timeout())
            .with_acquire_timeout(settings.acquire_timeout())
    }
}

/// Creates, validates and disposes of pooled resources
#[async_trait]
pub trait ResourceFactory<R: Send + 'static>: Send + Sync {
    /// Build a new resource
    async fn create(&self) -> Result<R>;

    /// Check a returned resource before it is reused
    async fn is_valid(&self, resource: &R) -> bool;

    /// Dispose of a resource
    async fn close(&self, resource: R) -> Result<()> {
        drop(resource);
        Ok(())
    }
}

/// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub available: usize,
    pub active: usize,
    /// Resources being created or validated
    pub pending: usize,
    pub waiting: usize,
    pub max_connections: usize,
    pub created: u64,
    pub destroyed: u64,
    pub timeouts: u64,
}

impl PoolStats {
    pub fn total(&self) -> usize {
        self.available + self.active + self.pending
    }
}

struct Idle<R> {
    id: u64,
    resource: R,
}

struct Waiter<R> {
    id: u64,
    sender: oneshot::Sender<(u64, R)>,
}

struct PoolState<R> {
    available: VecDeque<Idle<R>>,
    active: HashSet<u64>,
    pending: usize,
    waiters: VecDeque<Waiter<R>>,
    next_resource_id: u64,
    next_waiter_id: u64,
    closed: bool,
    created: u64,
    destroyed: u64,
    timeouts: u64,
}

impl<R> PoolState<R> {
    fn total(&self) -> usize {
        self.available.len() + self.active.len() + self.pending
    }

    fn next_resource_id(&mut self) -> u64 {
        self.next_resource_id += 1;
        self.next_resource_id
    }

    /// Give a checked-in resource to the longest live waiter, else park it.
    /// Returns the waiter that received it.
    fn hand_off(&mut self, id: u64, mut resource: R) -> Option<u64> {
        while let Some(waiter) = self.waiters.pop_front() {
            self.active.insert(id);
            match waiter.sender.send((id, resource)) {
                Ok(()) => return Some(waiter.id),
                // The waiter gave up; try the next one
                Err((_, returned)) => {
                    self.active.remove(&id);
                    resource = returned;
                }
            }
        }
        self.available.push_back(Idle { id, resource });
        None
    }
}

struct PoolInner<R: Send + 'static> {
    config: PoolConfig,
    factory: Arc<dyn ResourceFactory<R>>,
    state: Mutex<PoolState<R>>,
    events: Option<EventBus>,
    shutdown: CancellationToken,
}

impl<R: Send + 'static> Drop for PoolInner<R> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

enum Checkout<R> {
    Ready(u64, R),
    Create,
    Wait(u64, oneshot::Receiver<(u64, R)>),
}

/// A reserved unit of `pending`.
///
/// Dropped without [`settle`](Self::settle), it gives the unit back and lets
/// the head waiter use the freed capacity.
struct PendingSlot<R: Send + 'static> {
    inner: Arc<PoolInner<R>>,
    armed: bool,
}

impl<R: Send + 'static> PendingSlot<R> {
    /// Wrap a unit the caller already added to `pending`
    fn reserved(inner: &Arc<PoolInner<R>>) -> Self {
        Self {
            inner: Arc::clone(inner),
            armed: true,
        }
    }

    /// The caller takes back responsibility for the unit
    fn settle(mut self) {
        self.armed = false;
    }
}

impl<R: Send + 'static> Drop for PendingSlot<R> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        self.inner.state.lock().pending -= 1;
        self.inner.replenish();
    }
}

/// A caller's place in the waiter queue.
///
/// Dropped while still armed, it leaves the queue. A resource that was
/// handed over in the meantime goes back to the pool.
struct QueuedWaiter<R: Send + 'static> {
    inner: Arc<PoolInner<R>>,
    id: u64,
    receiver: oneshot::Receiver<(u64, R)>,
    armed: bool,
}

impl<R: Send + 'static> QueuedWaiter<R> {
    /// Remove this waiter from the queue. Returns false if a release or
    /// close already took it off.
    fn leave(&mut self) -> bool {
        let mut state = self.inner.state.lock();
        let before = state.waiters.len();
        state.waiters.retain(|w| w.id != self.id);
        state.waiters.len() != before
    }
}

impl<R: Send + 'static> Drop for QueuedWaiter<R> {
    fn drop(&mut self) {
        if !self.armed || self.leave() {
            return;
        }
        // Hand-offs happen under the state lock, so anything sent is here now
        if let Ok((id, resource)) = self.receiver.try_recv() {
            debug!(pool = %self.inner.config.name, resource_id = id, "Waiter left after hand-off, returning resource");
            self.inner.check_in_detached(id, resource);
        }
    }
}

impl<R: Send + 'static> PoolInner<R> {
    fn publish(&self, kind: EventKind, id: u64, payload: serde_json::Value) {
        if let Some(events) = &self.events {
            events.publish(kind, id.to_string(), payload);
        }
    }

    async fn dispose(&self, id: u64, resource: R, reason: &str) {
        match self.factory.close(resource).await {
            Ok(()) => {
                self.state.lock().destroyed += 1;
                debug!(pool = %self.config.name, resource_id = id, reason = reason, "Closed resource");
                self.publish(
                    EventKind::ResourceClosed,
                    id,
                    json!({ "pool": self.config.name, "reason": reason }),
                );
            }
            Err(e) => {
                self.state.lock().destroyed += 1;
                warn!(pool = %self.config.name, resource_id = id, error = %e, "Failed to close resource");
                self.publish(
                    EventKind::ResourceCloseFailed,
                    id,
                    json!({ "pool": self.config.name, "error": e.to_string() }),
                );
            }
        }
    }

    /// Return a resource from a lease
    async fn check_in(self: &Arc<Self>, id: u64, resource: R) {
        let closed = {
            let mut state = self.state.lock();
            state.active.remove(&id);
            if !state.closed {
                state.pending += 1;
            }
            state.closed
        };
        if closed {
            self.dispose(id, resource, "pool_closed").await;
            return;
        }

        let slot = PendingSlot::reserved(self);
        let valid = self.factory.is_valid(&resource).await;
        slot.settle();

        let outcome = {
            let mut state = self.state.lock();
            state.pending -= 1;
            if state.closed {
                Err(resource)
            } else if valid {
                Ok(state.hand_off(id, resource))
            } else {
                Err(resource)
            }
        };

        match outcome {
            Ok(waiter) => {
                debug!(pool = %self.config.name, resource_id = id, waiter = ?waiter, "Released resource");
                self.publish(
                    EventKind::ResourceReleased,
                    id,
                    json!({ "pool": self.config.name, "handed_to_waiter": waiter.is_some() }),
                );
            }
            Err(resource) if valid => {
                self.dispose(id, resource, "pool_closed").await;
            }
            Err(resource) => {
                warn!(pool = %self.config.name, resource_id = id, "Resource failed validation");
                self.publish(
                    EventKind::ResourceInvalid,
                    id,
                    json!({ "pool": self.config.name }),
                );
                self.dispose(id, resource, "invalid").await;
                self.replenish();
            }
        }
    }

    /// Return a resource from synchronous code, such as a destructor
    fn check_in_detached(self: &Arc<Self>, id: u64, resource: R) {
        match Handle::try_current() {
            Ok(handle) => {
                let inner = Arc::clone(self);
                handle.spawn(async move {
                    inner.check_in(id, resource).await;
                });
            }
            Err(_) => {
                warn!(
                    pool = %self.config.name,
                    resource_id = id,
                    "No runtime to return resource, discarding it"
                );
                {
                    let mut state = self.state.lock();
                    state.active.remove(&id);
                    state.destroyed += 1;
                }
                drop(resource);
                self.publish(
                    EventKind::ResourceCloseFailed,
                    id,
                    json!({ "pool": self.config.name, "error": "dropped outside a runtime" }),
                );
            }
        }
    }

    /// Build a replacement for the head waiter if there is room
    fn replenish(self: &Arc<Self>) {
        let Ok(handle) = Handle::try_current() else {
            debug!(pool = %self.config.name, "No runtime to build a replacement resource");
            return;
        };
        {
            let mut state = self.state.lock();
            if state.closed
                || state.waiters.is_empty()
                || state.total() >= self.config.max_connections
            {
                return;
            }
            state.pending += 1;
        }

        let inner = Arc::clone(self);
        handle.spawn(async move {
            let created = inner.factory.create().await;
            match created {
                Ok(resource) => {
                    let (id, closed) = {
                        let mut state = inner.state.lock();
                        state.pending -= 1;
                        let id = state.next_resource_id();
                        state.created += 1;
                        if state.closed {
                            (id, Some(resource))
                        } else {
                            state.hand_off(id, resource);
                            (id, None)
                        }
                    };
                    inner.publish(
                        EventKind::ResourceCreated,
                        id,
                        json!({ "pool": inner.config.name, "reason": "replacement" }),
                    );
                    if let Some(resource) = closed {
                        inner.dispose(id, resource, "pool_closed").await;
                    }
                }
                Err(e) => {
                    inner.state.lock().pending -= 1;
                    warn!(pool = %inner.config.name, error = %e, "Failed to create replacement resource");
                    if let Some(events) = &inner.events {
                        events.publish(
                            EventKind::ResourceCreateFailed,
                            inner.config.name.as_str(),
                            json!({ "error": e.to_string() }),
                        );
                    }
                }
            }
        });
    }

    /// Close available resources beyond `min_connections`
    async fn reclaim(&self) -> usize {
        let surplus: Vec<Idle<R>> = {
            let mut state = self.state.lock();
            let mut surplus = Vec::new();
            while state.available.len() > self.config.min_connections {
                match state.available.pop_back() {
                    Some(idle) => surplus.push(idle),
                    None => break,
                }
            }
            surplus
        };

        let count = surplus.len();
        for idle in surplus {
            self.dispose(idle.id, idle.resource, "idle").await;
        }

        if count > 0 {
            info!(pool = %self.config.name, reclaimed = count, "Reclaimed idle resources");
            if let Some(events) = &self.events {
                events.publish(
                    EventKind::PoolReclaimed,
                    self.config.name.as_str(),
                    json!({ "reclaimed": count }),
                );
            }
        }
        count
    }
}

/// A checked-out resource.
///
/// Give it back with [`ResourcePool::release`]. A lease that is dropped
/// instead is returned by a background task, or discarded when no runtime
/// is available.
pub struct Pooled<R: Send + 'static> {
    id: u64,
    resource: Option<R>,
    pool: Weak<PoolInner<R>>,
}

impl<R: Send + 'static> Pooled<R> {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<R: Send + 'static> Deref for Pooled<R> {
    type Target = R;

    fn deref(&self) -> &R {
        match &self.resource {
            Some(resource) => resource,
            None => unreachable!("lease used after return"),
        }
    }
}

impl<R: Send + 'static> DerefMut for Pooled<R> {
    fn deref_mut(&mut self) -> &mut R {
        match &mut self.resource {
            Some(resource) => resource,
            None => unreachable!("lease used after return"),
        }
    }
}

impl<R: Send + 'static> std::fmt::Debug for Pooled<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pooled").field("id", &self.id).finish()
    }
}

impl<R: Send + 'static> Drop for Pooled<R> {
    fn drop(&mut self) {
        let Some(resource) = self.resource.take() else {
            return;
        };
        let Some(inner) = self.pool.upgrade() else {
            return;
        };
        debug!(pool = %inner.config.name, resource_id = self.id, "Lease dropped, returning resource");
        inner.check_in_detached(self.id, resource);
    }
}

/// Bounded asynchronous resource pool
pub struct ResourcePool<R: Send + 'static> {
    inner: Arc<PoolInner<R>>,
}

impl<R: Send + 'static> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: Send + 'static> ResourcePool<R> {
    /// Create a pool and fill it to `min_connections`.
    ///
    /// Start-up creation failures are logged and reported; the pool starts
    /// with whatever could be built.
    pub async fn new(factory: Arc<dyn ResourceFactory<R>>, config: PoolConfig) -> Self {
        Self::build(factory, config, None).await
    }

    /// Create a pool that reports its lifecycle on `events`
    pub async fn with_events(
        factory: Arc<dyn ResourceFactory<R>>,
        config: PoolConfig,
        events: EventBus,
    ) -> Self {
        Self::build(factory, config, Some(events)).await
    }

    async fn build(
        factory: Arc<dyn ResourceFactory<R>>,
        config: PoolConfig,
        events: Option<EventBus>,
    ) -> Self {
        let results = join_all((0..config.min_connections).map(|_| factory.create())).await;

        let mut state = PoolState {
            available: VecDeque::new(),
            active: HashSet::new(),
            pending: 0,
            waiters: VecDeque::new(),
            next_resource_id: 0,
            next_waiter_id: 0,
            closed: false,
            created: 0,
            destroyed: 0,
            timeouts: 0,
        };
        let mut created_ids = Vec::new();
        let mut failures = Vec::new();

        for result in results {
            match result {
                Ok(resource) => {
                    let id = state.next_resource_id();
                    state.created += 1;
                    state.available.push_back(Idle { id, resource });
                    created_ids.push(id);
                }
                Err(e) => failures.push(e.to_string()),
            }
        }

        let pool = Self {
            inner: Arc::new(PoolInner {
                config,
                factory,
                state: Mutex::new(state),
                events,
                shutdown: CancellationToken::new(),
            }),
        };

        for id in created_ids {
            pool.inner.publish(
                EventKind::ResourceCreated,
                id,
                json!({ "pool": pool.inner.config.name, "reason": "startup" }),
            );
        }
        for error in failures {
            warn!(pool = %pool.inner.config.name, error = %error, "Failed to create resource at startup");
            if let Some(events) = &pool.inner.events {
                events.publish(
                    EventKind::ResourceCreateFailed,
                    pool.inner.config.name.as_str(),
                    json!({ "error": error }),
                );
            }
        }

        info!(
            pool = %pool.inner.config.name,
            available = pool.stats().available,
            min = pool.inner.config.min_connections,
            max = pool.inner.config.max_connections,
            "Resource pool started"
        );

        if !pool.inner.config.idle_timeout.is_zero() {
            pool.start_reclaimer();
        }

        pool
    }

    fn start_reclaimer(&self) {
        let weak: Weak<PoolInner<R>> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.idle_timeout;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        inner.reclaim().await;
                    }
                }
            }
        });
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    fn lease(&self, id: u64, resource: R) -> Pooled<R> {
        debug!(pool = %self.inner.config.name, resource_id = id, "Acquired resource");
        self.inner.publish(
            EventKind::ResourceAcquired,
            id,
            json!({ "pool": self.inner.config.name }),
        );
        Pooled {
            id,
            resource: Some(resource),
            pool: Arc::downgrade(&self.inner),
        }
    }

    /// Acquire with the configured timeout
    pub async fn acquire(&self) -> Result<Pooled<R>> {
        self.acquire_timeout(self.inner.config.acquire_timeout).await
    }

    /// Acquire a resource, waiting at most `timeout` when the pool is saturated
    pub async fn acquire_timeout(&self, timeout: Duration) -> Result<Pooled<R>> {
        let deadline = Instant::now() + timeout;

        let checkout = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return Err(RelayError::PoolClosed);
            }

            if let Some(idle) = state.available.pop_front() {
                state.active.insert(idle.id);
                Checkout::Ready(idle.id, idle.resource)
            } else if state.total() < self.inner.config.max_connections {
                state.pending += 1;
                Checkout::Create
            } else {
                state.next_waiter_id += 1;
                let waiter_id = state.next_waiter_id;
                let (sender, receiver) = oneshot::channel();
                state.waiters.push_back(Waiter {
                    id: waiter_id,
                    sender,
                });
                Checkout::Wait(waiter_id, receiver)
            }
        };

        match checkout {
            Checkout::Ready(id, resource) => Ok(self.lease(id, resource)),
            Checkout::Create => self.create_for_caller().await,
            Checkout::Wait(waiter_id, receiver) => {
                self.wait_for_hand_off(waiter_id, receiver, deadline, timeout)
                    .await
            }
        }
    }

    async fn create_for_caller(&self) -> Result<Pooled<R>> {
        let slot = PendingSlot::reserved(&self.inner);
        match self.inner.factory.create().await {
            Ok(resource) => {
                slot.settle();
                let (id, closed) = {
                    let mut state = self.inner.state.lock();
                    state.pending -= 1;
                    let id = state.next_resource_id();
                    state.created += 1;
                    if !state.closed {
                        state.active.insert(id);
                    }
                    (id, state.closed)
                };
                self.inner.publish(
                    EventKind::ResourceCreated,
                    id,
                    json!({ "pool": self.inner.config.name, "reason": "demand" }),
                );
                if closed {
                    self.inner.dispose(id, resource, "pool_closed").await;
                    return Err(RelayError::PoolClosed);
                }
                Ok(self.lease(id, resource))
            }
            Err(e) => {
                warn!(pool = %self.inner.config.name, error = %e, "Failed to create resource");
                if let Some(events) = &self.inner.events {
                    events.publish(
                        EventKind::ResourceCreateFailed,
                        self.inner.config.name.as_str(),
                        json!({ "error": e.to_string() }),
                    );
                }
                // The slot this caller reserved is free again
                drop(slot);
                Err(e)
            }
        }
    }

    async fn wait_for_hand_off(
        &self,
        waiter_id: u64,
        receiver: oneshot::Receiver<(u64, R)>,
        deadline: Instant,
        timeout: Duration,
    ) -> Result<Pooled<R>> {
        let mut waiter = QueuedWaiter {
            inner: Arc::clone(&self.inner),
            id: waiter_id,
            receiver,
            armed: true,
        };

        let outcome = tokio::time::timeout_at(deadline, &mut waiter.receiver).await;
        waiter.armed = false;

        match outcome {
            Ok(Ok((id, resource))) => Ok(self.lease(id, resource)),
            // Sender dropped: the pool closed while we waited
            Ok(Err(_)) => Err(RelayError::PoolClosed),
            Err(_) => {
                if !waiter.leave() {
                    // Served between the deadline and deregistration
                    if let Ok((id, resource)) = waiter.receiver.try_recv() {
                        return Ok(self.lease(id, resource));
                    }
                    return Err(RelayError::PoolClosed);
                }

                self.inner.state.lock().timeouts += 1;
                warn!(
                    pool = %self.inner.config.name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Timed out waiting for a resource"
                );
                if let Some(events) = &self.inner.events {
                    events.publish(
                        EventKind::AcquireTimeout,
                        self.inner.config.name.as_str(),
                        json!({ "timeout_ms": timeout.as_millis() as u64 }),
                    );
                }
                Err(RelayError::AcquireTimeout { timeout })
            }
        }
    }

    /// Return a lease to the pool
    pub async fn release(&self, mut lease: Pooled<R>) {
        let Some(resource) = lease.resource.take() else {
            return;
        };
        let id = lease.id;
        drop(lease);
        self.inner.check_in(id, resource).await;
    }

    /// Run one idle reclamation pass now. Returns how many were closed.
    pub async fn reclaim_idle(&self) -> usize {
        self.inner.reclaim().await
    }

    /// Close the pool.
    ///
    /// Idle resources are closed, queued callers fail with `PoolClosed`, and
    /// leases still out are closed when they come back.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.inner.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            let idle: Vec<Idle<R>> = state.available.drain(..).collect();
            let waiters = state.waiters.len();
            // Dropping the senders fails every queued acquire
            state.waiters.clear();
            (idle, waiters)
        };

        self.inner.shutdown.cancel();

        let closed = idle.len();
        for entry in idle {
            self.inner.dispose(entry.id, entry.resource, "pool_closed").await;
        }

        info!(
            pool = %self.inner.config.name,
            closed = closed,
            failed_waiters = waiters,
            "Resource pool closed"
        );
        if let Some(events) = &self.inner.events {
            events.publish(
                EventKind::PoolClosed,
                self.inner.config.name.as_str(),
                json!({ "closed": closed, "failed_waiters": waiters }),
            );
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            available: state.available.len(),
            active: state.active.len(),
            pending: state.pending,
            waiting: state.waiters.len(),
            max_connections: self.inner.config.max_connections,
            created: state.created,
            destroyed: state.destroyed,
            timeouts: state.timeouts,
        }
    }
}
