//! Lifecycle events emitted by the resilience components.
//!
//! Every component reports what it does (resources created, circuits opened,
//! identifiers blocked, operations executed) as a [`LifecycleEvent`] on an
//! [`EventBus`]. Subscribers are plain callbacks; a subscriber that returns an
//! error or panics is logged and skipped, and never aborts the operation that
//! emitted the event.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{trace, warn};
use uuid::Uuid;

/// Component that emitted an event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Component {
    Pool,
    Circuit,
    RateLimiter,
    Cache,
    Dispatcher,
}

/// Closed set of lifecycle event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "pool.resource_created")]
    ResourceCreated,
    #[serde(rename = "pool.resource_acquired")]
    ResourceAcquired,
    #[serde(rename = "pool.resource_released")]
    ResourceReleased,
    #[serde(rename = "pool.resource_invalid")]
    ResourceInvalid,
    #[serde(rename = "pool.resource_closed")]
    ResourceClosed,
    #[serde(rename = "pool.resource_close_failed")]
    ResourceCloseFailed,
    #[serde(rename = "pool.resource_create_failed")]
    ResourceCreateFailed,
    #[serde(rename = "pool.acquire_timeout")]
    AcquireTimeout,
    #[serde(rename = "pool.reclaimed")]
    PoolReclaimed,
    #[serde(rename = "pool.closed")]
    PoolClosed,
    #[serde(rename = "circuit.opened")]
    CircuitOpened,
    #[serde(rename = "circuit.half_opened")]
    CircuitHalfOpened,
    #[serde(rename = "circuit.closed")]
    CircuitClosed,
    #[serde(rename = "rate_limit.triggered")]
    RateLimitTriggered,
    #[serde(rename = "rate_limit.blocked")]
    RateLimitBlocked,
    #[serde(rename = "cache.evicted")]
    CacheEvicted,
    #[serde(rename = "operation.executed")]
    OperationExecuted,
    #[serde(rename = "operation.retrying")]
    OperationRetrying,
    #[serde(rename = "operation.failed")]
    OperationFailed,
    #[serde(rename = "operation.rejected")]
    OperationRejected,
}

impl EventKind {
    /// Dotted event name, e.g. `"pool.resource_created"`
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ResourceCreated => "pool.resource_created",
            EventKind::ResourceAcquired => "pool.resource_acquired",
            EventKind::ResourceReleased => "pool.resource_released",
            EventKind::ResourceInvalid => "pool.resource_invalid",
            EventKind::ResourceClosed => "pool.resource_closed",
            EventKind::ResourceCloseFailed => "pool.resource_close_failed",
            EventKind::ResourceCreateFailed => "pool.resource_create_failed",
            EventKind::AcquireTimeout => "pool.acquire_timeout",
            EventKind::PoolReclaimed => "pool.reclaimed",
            EventKind::PoolClosed => "pool.closed",
            EventKind::CircuitOpened => "circuit.opened",
            EventKind::CircuitHalfOpened => "circuit.half_opened",
            EventKind::CircuitClosed => "circuit.closed",
            EventKind::RateLimitTriggered => "rate_limit.triggered",
            EventKind::RateLimitBlocked => "rate_limit.blocked",
            EventKind::CacheEvicted => "cache.evicted",
            EventKind::OperationExecuted => "operation.executed",
            EventKind::OperationRetrying => "operation.retrying",
            EventKind::OperationFailed => "operation.failed",
            EventKind::OperationRejected => "operation.rejected",
        }
    }

    pub fn component(&self) -> Component {
        match self {
            EventKind::ResourceCreated
            | EventKind::ResourceAcquired
            | EventKind::ResourceReleased
            | EventKind::ResourceInvalid
            | EventKind::ResourceClosed
            | EventKind::ResourceCloseFailed
            | EventKind::ResourceCreateFailed
            | EventKind::AcquireTimeout
            | EventKind::PoolReclaimed
            | EventKind::PoolClosed => Component::Pool,
            EventKind::CircuitOpened | EventKind::CircuitHalfOpened | EventKind::CircuitClosed => {
                Component::Circuit
            }
            EventKind::RateLimitTriggered | EventKind::RateLimitBlocked => Component::RateLimiter,
            EventKind::CacheEvicted => Component::Cache,
            EventKind::OperationExecuted
            | EventKind::OperationRetrying
            | EventKind::OperationFailed
            | EventKind::OperationRejected => Component::Dispatcher,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single lifecycle event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleEvent {
    /// Unique event identifier
    pub id: Uuid,
    /// What happened
    pub kind: EventKind,
    /// Emitting component
    pub component: Component,
    /// Timestamp when the event occurred
    pub timestamp: DateTime<Utc>,
    /// Identifier the event is about (work key, resource id, rate-limit identifier, cache key)
    pub identifier: String,
    /// Event payload
    pub payload: serde_json::Value,
    /// Metadata for the event
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl LifecycleEvent {
    /// Create a new event with the given kind, identifier and payload.
    pub fn new<T: Serialize>(kind: EventKind, identifier: impl Into<String>, payload: T) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            component: kind.component(),
            timestamp: Utc::now(),
            identifier: identifier.into(),
            payload: serde_json::to_value(payload).unwrap_or(serde_json::Value::Null),
            metadata: HashMap::new(),
        }
    }

    /// Add metadata to the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Check if the event matches a given name pattern (`*`, `pool.*`, or an exact name).
    pub fn matches(&self, pattern: &str) -> bool {
        let name = self.kind.as_str();
        if pattern == "*" {
            return true;
        }
        if let Some(prefix) = pattern.strip_suffix(".*") {
            return name
                .strip_prefix(prefix)
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false);
        }
        name == pattern
    }
}

/// Error type a subscriber may return
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&LifecycleEvent) -> Result<(), HandlerError> + Send + Sync>;

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    pattern: String,
    handler: Handler,
}

struct EventBusInner {
    subscriptions: RwLock<Vec<Subscription>>,
    sender: broadcast::Sender<LifecycleEvent>,
    next_id: AtomicU64,
}

/// Fan-out point for lifecycle events.
///
/// Cloning is cheap; clones share subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

impl EventBus {
    /// Create a bus whose broadcast channel buffers `capacity` events per receiver
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(EventBusInner {
                subscriptions: RwLock::new(Vec::new()),
                sender,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register a callback for events whose name matches `pattern`
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&LifecycleEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        self.inner.subscriptions.write().push(Subscription {
            id,
            pattern: pattern.to_string(),
            handler: Arc::new(handler),
        });
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.inner.subscriptions.write();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Receive every event on an async channel. Slow receivers lag, they never block emitters.
    pub fn subscribe_channel(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.inner.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscriptions.read().len()
    }

    /// Deliver an event to every matching subscriber.
    pub fn emit(&self, event: LifecycleEvent) {
        trace!(event = %event.kind, identifier = %event.identifier, "Emitting lifecycle event");

        // Handlers run outside the lock so they may subscribe or unsubscribe.
        let handlers: Vec<(SubscriptionId, Handler)> = self
            .inner
            .subscriptions
            .read()
            .iter()
            .filter(|s| event.matches(&s.pattern))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(&event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(
                        subscription = id.0,
                        event = %event.kind,
                        error = %e,
                        "Event subscriber returned an error"
                    );
                }
                Err(_) => {
                    warn!(
                        subscription = id.0,
                        event = %event.kind,
                        "Event subscriber panicked"
                    );
                }
            }
        }

        // No receivers is fine.
        let _ = self.inner.sender.send(event);
    }

    /// Build and emit an event in one call
    pub fn publish<T: Serialize>(&self, kind: EventKind, identifier: impl Into<String>, payload: T) {
        self.emit(LifecycleEvent::new(kind, identifier, payload));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_event_creation() {
        let event = LifecycleEvent::new(
            EventKind::ResourceCreated,
            "7",
            serde_json::json!({"resource_id": 7}),
        );

        assert!(!event.id.is_nil());
        assert_eq!(event.kind, EventKind::ResourceCreated);
        assert_eq!(event.component, Component::Pool);
        assert_eq!(event.identifier, "7");
        assert!(event.payload.get("resource_id").is_some());
    }

    #[test]
    fn test_event_with_metadata() {
        let event = LifecycleEvent::new(EventKind::CircuitOpened, "k", serde_json::json!({}))
            .with_metadata("source", "test");

        assert_eq!(event.metadata.get("source"), Some(&"test".to_string()));
    }

    #[test]
    fn test_event_matches() {
        let event = LifecycleEvent::new(EventKind::RateLimitBlocked, "user-1", ());

        assert!(event.matches("*"));
        assert!(event.matches("rate_limit.blocked"));
        assert!(event.matches("rate_limit.*"));
        assert!(!event.matches("rate.*"));
        assert!(!event.matches("pool.*"));
        assert!(!event.matches("rate_limit.triggered"));
    }

    #[test]
    fn test_event_kind_serializes_as_dotted_name() {
        let json = serde_json::to_string(&EventKind::OperationExecuted).unwrap();
        assert_eq!(json, "\"operation.executed\"");
    }

    #[test]
    fn test_subscribers_receive_matching_events() {
        let bus = EventBus::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        bus.subscribe("circuit.*", move |event| {
            sink.lock().push(event.kind);
            Ok(())
        });

        bus.publish(EventKind::CircuitOpened, "k", ());
        bus.publish(EventKind::ResourceCreated, "1", ());
        bus.publish(EventKind::CircuitClosed, "k", ());

        assert_eq!(
            *seen.lock(),
            vec![EventKind::CircuitOpened, EventKind::CircuitClosed]
        );
    }

    #[test]
    fn test_failing_and_panicking_subscribers_do_not_abort_emit() {
        let bus = EventBus::default();
        let delivered = Arc::new(AtomicU64::new(0));

        bus.subscribe("*", |_| Err("sink unavailable".into()));
        bus.subscribe("*", |_| panic!("subscriber bug"));
        let counter = Arc::clone(&delivered);
        bus.subscribe("*", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        bus.publish(EventKind::OperationFailed, "k", ());
        bus.publish(EventKind::OperationFailed, "k", ());

        assert_eq!(delivered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::default();
        let id = bus.subscribe("*", |_| Ok(()));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_channel_subscription() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe_channel();

        bus.publish(EventKind::CacheEvicted, "key1", serde_json::json!({"reason": "capacity"}));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::CacheEvicted);
        assert_eq!(event.identifier, "key1");
    }
}
