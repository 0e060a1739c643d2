//! Per-key circuit breaker
//!
//! Stops calls to a dependency that keeps failing, then lets trial calls
//! through once the recovery timeout has elapsed.

use parking_lot::Mutex;
use relay_core::{CircuitSettings, EventBus, EventKind};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitBreakerState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, every request is admitted as a trial call
    HalfOpen,
}

impl CircuitBreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitBreakerState::Closed => "closed",
            CircuitBreakerState::Open => "open",
            CircuitBreakerState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitBreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Name of this circuit breaker (for logging)
    pub name: String,
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// Consecutive half-open successes before the circuit closes
    pub success_threshold: u32,
    /// Time to stay open before admitting trial calls
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 3,
            recovery_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new circuit breaker config with a name
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Set failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    /// Set success threshold
    pub fn with_success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = threshold.max(1);
        self
    }

    /// Set recovery timeout
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

impl From<&CircuitSettings> for CircuitBreakerConfig {
    fn from(settings: &CircuitSettings) -> Self {
        Self::default()
            .with_failure_threshold(settings.failure_threshold)
            .with_success_threshold(settings.success_threshold)
            .with_recovery_timeout(settings.recovery_timeout())
    }
}

#[derive(Debug, Clone)]
struct CircuitEntry {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_transition_at: Instant,
}

impl CircuitEntry {
    fn new(now: Instant) -> Self {
        Self {
            state: CircuitBreakerState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_transition_at: now,
        }
    }
}

/// Point-in-time view of one key's circuit
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub key: String,
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_transition_at: Instant,
}

struct Transition {
    from: CircuitBreakerState,
    to: CircuitBreakerState,
    failures: u32,
}

struct FailureCircuitInner {
    config: CircuitBreakerConfig,
    entries: Mutex<HashMap<String, CircuitEntry>>,
    events: Option<EventBus>,
}

/// Thread-safe map of circuits, one per work key.
///
/// Entries are created on first use and kept until `reset` removes them.
#[derive(Clone)]
pub struct FailureCircuit {
    inner: Arc<FailureCircuitInner>,
}

impl FailureCircuit {
    /// Create a new circuit map with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a circuit map that publishes transitions on `events`
    pub fn with_events(config: CircuitBreakerConfig, events: EventBus) -> Self {
        Self::build(config, Some(events))
    }

    /// Create with default configuration
    pub fn default_config(name: &str) -> Self {
        Self::new(CircuitBreakerConfig::new(name))
    }

    fn build(config: CircuitBreakerConfig, events: Option<EventBus>) -> Self {
        Self {
            inner: Arc::new(FailureCircuitInner {
                config,
                entries: Mutex::new(HashMap::new()),
                events,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Check if a request for `key` should be allowed.
    ///
    /// An open circuit whose recovery timeout has elapsed moves to half-open
    /// and admits the call.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let (allowed, transition) = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| CircuitEntry::new(now));

            match entry.state {
                CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => (true, None),
                CircuitBreakerState::Open => {
                    if now.duration_since(entry.last_transition_at)
                        >= self.inner.config.recovery_timeout
                    {
                        entry.state = CircuitBreakerState::HalfOpen;
                        entry.consecutive_failures = 0;
                        entry.consecutive_successes = 0;
                        entry.last_transition_at = now;
                        let transition = Transition {
                            from: CircuitBreakerState::Open,
                            to: CircuitBreakerState::HalfOpen,
                            failures: 0,
                        };
                        (true, Some(transition))
                    } else {
                        (false, None)
                    }
                }
            }
        };

        if let Some(transition) = transition {
            self.announce(key, transition);
        } else if !allowed {
            debug!(
                circuit_breaker = %self.inner.config.name,
                key = %key,
                "Request rejected, circuit is open"
            );
        }

        allowed
    }

    /// Record the outcome of one call for `key`
    pub fn record_outcome(&self, key: &str, success: bool) {
        let now = Instant::now();
        let transition = {
            let mut entries = self.inner.entries.lock();
            let entry = entries
                .entry(key.to_string())
                .or_insert_with(|| CircuitEntry::new(now));
            self.apply_outcome(entry, success, now)
        };

        if let Some(transition) = transition {
            self.announce(key, transition);
        }
    }

    /// Record a successful operation
    pub fn record_success(&self, key: &str) {
        self.record_outcome(key, true);
    }

    /// Record a failed operation
    pub fn record_failure(&self, key: &str) {
        self.record_outcome(key, false);
    }

    fn apply_outcome(
        &self,
        entry: &mut CircuitEntry,
        success: bool,
        now: Instant,
    ) -> Option<Transition> {
        let config = &self.inner.config;

        if success {
            entry.consecutive_successes = entry.consecutive_successes.saturating_add(1);
            entry.consecutive_failures = 0;

            if entry.state == CircuitBreakerState::HalfOpen
                && entry.consecutive_successes >= config.success_threshold
            {
                entry.state = CircuitBreakerState::Closed;
                entry.consecutive_successes = 0;
                entry.last_transition_at = now;
                return Some(Transition {
                    from: CircuitBreakerState::HalfOpen,
                    to: CircuitBreakerState::Closed,
                    failures: 0,
                });
            }
            return None;
        }

        entry.consecutive_failures = entry.consecutive_failures.saturating_add(1);
        entry.consecutive_successes = 0;

        match entry.state {
            CircuitBreakerState::Closed if entry.consecutive_failures >= config.failure_threshold => {
                entry.state = CircuitBreakerState::Open;
                entry.last_transition_at = now;
                Some(Transition {
                    from: CircuitBreakerState::Closed,
                    to: CircuitBreakerState::Open,
                    failures: entry.consecutive_failures,
                })
            }
            CircuitBreakerState::HalfOpen => {
                entry.state = CircuitBreakerState::Open;
                entry.consecutive_failures = 1;
                entry.last_transition_at = now;
                Some(Transition {
                    from: CircuitBreakerState::HalfOpen,
                    to: CircuitBreakerState::Open,
                    failures: 1,
                })
            }
            // Open: counters only, the recovery clock keeps running
            _ => None,
        }
    }

    fn announce(&self, key: &str, transition: Transition) {
        let kind = match transition.to {
            CircuitBreakerState::Open => {
                warn!(
                    circuit_breaker = %self.inner.config.name,
                    key = %key,
                    from = %transition.from,
                    to = %transition.to,
                    failures = transition.failures,
                    "Circuit breaker state transition"
                );
                EventKind::CircuitOpened
            }
            CircuitBreakerState::HalfOpen => {
                info!(
                    circuit_breaker = %self.inner.config.name,
                    key = %key,
                    from = %transition.from,
                    to = %transition.to,
                    "Circuit breaker state transition"
                );
                EventKind::CircuitHalfOpened
            }
            CircuitBreakerState::Closed => {
                info!(
                    circuit_breaker = %self.inner.config.name,
                    key = %key,
                    from = %transition.from,
                    to = %transition.to,
                    "Circuit breaker state transition"
                );
                EventKind::CircuitClosed
            }
        };

        if let Some(events) = &self.inner.events {
            events.publish(
                kind,
                key,
                json!({
                    "from": transition.from.as_str(),
                    "to": transition.to.as_str(),
                    "failures": transition.failures,
                }),
            );
        }
    }

    /// Current state for `key`; unknown keys report closed
    pub fn state(&self, key: &str) -> CircuitBreakerState {
        self.inner
            .entries
            .lock()
            .get(key)
            .map(|entry| entry.state)
            .unwrap_or(CircuitBreakerState::Closed)
    }

    /// Full entry for `key`, if the key has been seen
    pub fn snapshot(&self, key: &str) -> Option<CircuitSnapshot> {
        self.inner.entries.lock().get(key).map(|entry| CircuitSnapshot {
            key: key.to_string(),
            state: entry.state,
            consecutive_failures: entry.consecutive_failures,
            consecutive_successes: entry.consecutive_successes,
            last_transition_at: entry.last_transition_at,
        })
    }

    /// Drop the entry for `key`. Returns false if the key was unknown.
    pub fn reset(&self, key: &str) -> bool {
        let removed = self.inner.entries.lock().remove(key).is_some();
        if removed {
            debug!(circuit_breaker = %self.inner.config.name, key = %key, "Circuit entry reset");
        }
        removed
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn circuit(failures: u32, successes: u32) -> FailureCircuit {
        FailureCircuit::new(
            CircuitBreakerConfig::new("test")
                .with_failure_threshold(failures)
                .with_success_threshold(successes)
                .with_recovery_timeout(Duration::from_secs(30)),
        )
    }

    #[tokio::test]
    async fn test_circuit_starts_closed() {
        let cb = circuit(3, 2);
        assert_eq!(cb.state("svc:op"), CircuitBreakerState::Closed);
        assert!(cb.allow("svc:op"));
        assert_eq!(cb.len(), 1);
    }

    #[tokio::test]
    async fn test_circuit_opens_on_consecutive_failures() {
        let cb = circuit(3, 2);

        cb.record_failure("svc:op");
        cb.record_failure("svc:op");
        assert_eq!(cb.state("svc:op"), CircuitBreakerState::Closed);

        cb.record_failure("svc:op");
        assert_eq!(cb.state("svc:op"), CircuitBreakerState::Open);
        assert!(!cb.allow("svc:op"));
    }

    #[tokio::test]
    async fn test_success_resets_failure_count() {
        let cb = circuit(3, 2);

        cb.record_failure("svc:op");
        cb.record_failure("svc:op");
        cb.record_success("svc:op");
        cb.record_failure("svc:op");
        cb.record_failure("svc:op");

        assert_eq!(cb.state("svc:op"), CircuitBreakerState::Closed);
        assert_eq!(cb.snapshot("svc:op").unwrap().consecutive_failures, 2);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let cb = circuit(1, 1);

        cb.record_failure("a");
        assert_eq!(cb.state("a"), CircuitBreakerState::Open);
        assert!(cb.allow("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_transitions_to_half_open() {
        let cb = circuit(2, 2);

        cb.record_failure("svc:op");
        cb.record_failure("svc:op");
        assert!(!cb.allow("svc:op"));

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!cb.allow("svc:op"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cb.allow("svc:op"));
        assert_eq!(cb.state("svc:op"), CircuitBreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_admits_every_trial_call() {
        let cb = circuit(1, 3);

        cb.record_failure("svc:op");
        tokio::time::advance(Duration::from_secs(30)).await;

        for _ in 0..10 {
            assert!(cb.allow("svc:op"));
        }
        assert_eq!(cb.state("svc:op"), CircuitBreakerState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_closes_on_success() {
        let cb = circuit(2, 2);

        cb.record_failure("svc:op");
        cb.record_failure("svc:op");
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow("svc:op"));

        cb.record_success("svc:op");
        assert_eq!(cb.state("svc:op"), CircuitBreakerState::HalfOpen);
        cb.record_success("svc:op");
        assert_eq!(cb.state("svc:op"), CircuitBreakerState::Closed);

        let snapshot = cb.snapshot("svc:op").unwrap();
        assert_eq!(snapshot.consecutive_failures, 0);
        assert_eq!(snapshot.consecutive_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let cb = circuit(3, 2);

        for _ in 0..3 {
            cb.record_failure("svc:op");
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(cb.allow("svc:op"));

        cb.record_success("svc:op");
        cb.record_failure("svc:op");

        let snapshot = cb.snapshot("svc:op").unwrap();
        assert_eq!(snapshot.state, CircuitBreakerState::Open);
        assert_eq!(snapshot.consecutive_failures, 1);
        assert_eq!(snapshot.consecutive_successes, 0);
        assert!(!cb.allow("svc:op"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_outcomes_while_open_do_not_move_recovery_clock() {
        let cb = circuit(1, 1);

        cb.record_failure("svc:op");
        let opened_at = cb.snapshot("svc:op").unwrap().last_transition_at;

        tokio::time::advance(Duration::from_secs(10)).await;
        cb.record_failure("svc:op");
        cb.record_success("svc:op");

        let snapshot = cb.snapshot("svc:op").unwrap();
        assert_eq!(snapshot.state, CircuitBreakerState::Open);
        assert_eq!(snapshot.last_transition_at, opened_at);
    }

    #[tokio::test]
    async fn test_entries_persist_until_reset() {
        let cb = circuit(5, 1);

        for i in 0..50 {
            cb.record_success(&format!("connector:{}", i));
        }
        assert_eq!(cb.len(), 50);

        assert!(cb.reset("connector:7"));
        assert!(!cb.reset("connector:7"));
        assert_eq!(cb.len(), 49);
        assert!(cb.snapshot("connector:7").is_none());
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let events = EventBus::default();
        let mut rx = events.subscribe_channel();
        let cb = FailureCircuit::with_events(
            CircuitBreakerConfig::new("test").with_failure_threshold(1),
            events,
        );

        cb.record_failure("svc:op");

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::CircuitOpened);
        assert_eq!(event.identifier, "svc:op");
        assert_eq!(event.payload["to"], "open");
    }
}
