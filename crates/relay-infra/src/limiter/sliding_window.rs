//! Sliding-window rate limiter
//!
//! Each identifier may make `max_requests` calls within any `window`. The
//! strategy decides what happens to the call that goes over.

use parking_lot::Mutex;
use relay_core::{EventBus, EventKind, LimiterSettings, RateLimitStrategy, RelayError, Result};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Name used in logs
    pub name: String,
    /// Calls admitted per identifier per window (inclusive)
    pub max_requests: usize,
    /// Length of the sliding window
    pub window: Duration,
    /// How long the Block strategy shuts an identifier out
    pub block_duration: Duration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            max_requests: 100,
            window: Duration::from_secs(60),
            block_duration: Duration::from_secs(60),
        }
    }
}

impl RateLimiterConfig {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests: max_requests.max(1),
            window,
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.name = name.to_string();
        self
    }

    pub fn with_block_duration(mut self, duration: Duration) -> Self {
        self.block_duration = duration;
        self
    }
}

impl From<&LimiterSettings> for RateLimiterConfig {
    fn from(settings: &LimiterSettings) -> Self {
        Self::new(settings.max_requests, settings.window())
            .with_block_duration(settings.block_duration())
    }
}

/// Usage of one identifier
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterStats {
    pub identifier: String,
    /// Calls counted in the current window
    pub requests_in_window: usize,
    /// Calls still admissible in the current window
    pub remaining: usize,
    /// Time left on an active block
    pub blocked_for: Option<Duration>,
}

#[derive(Debug, Default)]
struct RateLimitEntry {
    timestamps: VecDeque<Instant>,
    blocked_until: Option<Instant>,
}

impl RateLimitEntry {
    fn prune(&mut self, now: Instant, window: Duration) {
        if let Some(cutoff) = now.checked_sub(window) {
            while self.timestamps.front().map_or(false, |ts| *ts <= cutoff) {
                self.timestamps.pop_front();
            }
        }
        if self.blocked_until.map_or(false, |until| until <= now) {
            self.blocked_until = None;
        }
    }

    fn blocked_for(&self, now: Instant) -> Option<Duration> {
        self.blocked_until
            .and_then(|until| until.checked_duration_since(now))
            .filter(|remaining| !remaining.is_zero())
    }

    fn is_idle(&self) -> bool {
        self.timestamps.is_empty() && self.blocked_until.is_none()
    }
}

enum Verdict {
    Allowed,
    /// Already blocked before this call
    Blocked { retry_after: Duration },
    /// Over the limit on this call
    Limited {
        retry_after: Duration,
        newly_blocked: bool,
    },
}

struct LimiterInner {
    config: RateLimiterConfig,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
    /// Per-identifier FIFO gates for queued admission
    gates: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    events: Option<EventBus>,
    sweeper_running: AtomicBool,
    shutdown: CancellationToken,
}

impl Drop for LimiterInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Per-identifier sliding-window limiter
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    inner: Arc<LimiterInner>,
}

impl SlidingWindowLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a limiter that reports denials on `events`
    pub fn with_events(config: RateLimiterConfig, events: EventBus) -> Self {
        Self::build(config, Some(events))
    }

    /// Create with default configuration
    pub fn default_config() -> Self {
        Self::new(RateLimiterConfig::default())
    }

    fn build(config: RateLimiterConfig, events: Option<EventBus>) -> Self {
        let limiter = Self {
            inner: Arc::new(LimiterInner {
                config,
                entries: Mutex::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                events,
                sweeper_running: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        };
        limiter.start_sweeper();
        limiter
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.inner.config
    }

    fn evaluate(&self, identifier: &str, strategy: RateLimitStrategy, now: Instant) -> Verdict {
        let config = &self.inner.config;
        let mut entries = self.inner.entries.lock();
        let entry = entries.entry(identifier.to_string()).or_default();
        entry.prune(now, config.window);

        if let Some(retry_after) = entry.blocked_for(now) {
            return Verdict::Blocked { retry_after };
        }

        if entry.timestamps.len() < config.max_requests {
            entry.timestamps.push_back(now);
            return Verdict::Allowed;
        }

        match strategy {
            RateLimitStrategy::Block => {
                entry.blocked_until = Some(now + config.block_duration);
                entry.timestamps.clear();
                Verdict::Limited {
                    retry_after: config.block_duration,
                    newly_blocked: true,
                }
            }
            RateLimitStrategy::Drop | RateLimitStrategy::Queue => Verdict::Limited {
                retry_after: Self::slot_frees_in(entry, now, config.window),
                newly_blocked: false,
            },
        }
    }

    fn slot_frees_in(entry: &RateLimitEntry, now: Instant, window: Duration) -> Duration {
        entry
            .timestamps
            .front()
            .map(|oldest| (*oldest + window).saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    fn report(&self, identifier: &str, strategy: RateLimitStrategy, verdict: &Verdict) {
        let name = &self.inner.config.name;
        match verdict {
            Verdict::Allowed => {}
            Verdict::Blocked { retry_after } => {
                debug!(
                    rate_limiter = %name,
                    identifier = %identifier,
                    retry_after_ms = retry_after.as_millis() as u64,
                    "Request denied, identifier is blocked"
                );
            }
            Verdict::Limited {
                retry_after,
                newly_blocked,
            } => {
                warn!(
                    rate_limiter = %name,
                    identifier = %identifier,
                    strategy = %strategy,
                    limit = self.inner.config.max_requests,
                    "Rate limit exceeded"
                );
                if let Some(events) = &self.inner.events {
                    events.publish(
                        EventKind::RateLimitTriggered,
                        identifier,
                        json!({
                            "strategy": strategy.as_str(),
                            "limit": self.inner.config.max_requests,
                            "retry_after_ms": retry_after.as_millis() as u64,
                        }),
                    );
                    if *newly_blocked {
                        events.publish(
                            EventKind::RateLimitBlocked,
                            identifier,
                            json!({
                                "block_duration_ms": self.inner.config.block_duration.as_millis() as u64,
                            }),
                        );
                    }
                }
            }
        }
    }

    /// Admit or deny one call without waiting.
    ///
    /// `Queue` denies here like `Drop`; use [`admit`](Self::admit) to wait
    /// for a free slot instead.
    pub fn is_allowed(&self, identifier: &str, strategy: RateLimitStrategy) -> bool {
        self.check(identifier, strategy).is_ok()
    }

    /// Like [`is_allowed`](Self::is_allowed) with a retry-after hint on denial
    pub fn check(&self, identifier: &str, strategy: RateLimitStrategy) -> Result<()> {
        let verdict = self.evaluate(identifier, strategy, Instant::now());
        self.report(identifier, strategy, &verdict);

        match verdict {
            Verdict::Allowed => Ok(()),
            Verdict::Blocked { retry_after } | Verdict::Limited { retry_after, .. } => {
                Err(RelayError::RateLimited {
                    identifier: identifier.to_string(),
                    retry_after,
                })
            }
        }
    }

    fn gate(&self, identifier: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.inner.gates.lock();
        Arc::clone(
            gates
                .entry(identifier.to_string())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Wait up to `max_wait` for a free slot.
    ///
    /// Callers for the same identifier are admitted in arrival order. A
    /// blocked identifier, or one whose next slot frees after `max_wait`,
    /// fails with `RateLimited` straight away.
    pub async fn admit(&self, identifier: &str, max_wait: Duration) -> Result<()> {
        let deadline = Instant::now() + max_wait;
        let gate = self.gate(identifier);

        let _turn = match tokio::time::timeout_at(deadline, gate.lock()).await {
            Ok(turn) => turn,
            Err(_) => {
                let retry_after = self.retry_after(identifier);
                self.report(
                    identifier,
                    RateLimitStrategy::Queue,
                    &Verdict::Limited {
                        retry_after,
                        newly_blocked: false,
                    },
                );
                return Err(RelayError::RateLimited {
                    identifier: identifier.to_string(),
                    retry_after,
                });
            }
        };

        loop {
            let now = Instant::now();
            let verdict = self.evaluate(identifier, RateLimitStrategy::Queue, now);
            let retry_after = match verdict {
                Verdict::Allowed => return Ok(()),
                Verdict::Blocked { retry_after } => {
                    self.report(identifier, RateLimitStrategy::Queue, &verdict);
                    return Err(RelayError::RateLimited {
                        identifier: identifier.to_string(),
                        retry_after,
                    });
                }
                Verdict::Limited { retry_after, .. } => retry_after,
            };

            let wake = now + retry_after;
            if wake > deadline {
                self.report(identifier, RateLimitStrategy::Queue, &verdict);
                return Err(RelayError::RateLimited {
                    identifier: identifier.to_string(),
                    retry_after,
                });
            }

            debug!(
                rate_limiter = %self.inner.config.name,
                identifier = %identifier,
                wait_ms = retry_after.as_millis() as u64,
                "Queued until a slot frees"
            );
            tokio::time::sleep_until(wake).await;
        }
    }

    /// Time until `identifier` could next be admitted, without recording a call
    pub fn retry_after(&self, identifier: &str) -> Duration {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let Some(entry) = entries.get_mut(identifier) else {
            return Duration::ZERO;
        };
        entry.prune(now, self.inner.config.window);

        if let Some(blocked_for) = entry.blocked_for(now) {
            return blocked_for;
        }
        if entry.timestamps.len() < self.inner.config.max_requests {
            return Duration::ZERO;
        }
        Self::slot_frees_in(entry, now, self.inner.config.window)
    }

    /// Forget everything about `identifier`. Returns whether it was tracked.
    pub fn reset(&self, identifier: &str) -> bool {
        self.inner.entries.lock().remove(identifier).is_some()
    }

    /// Current usage for `identifier`, if tracked
    pub fn stats(&self, identifier: &str) -> Option<LimiterStats> {
        let now = Instant::now();
        let mut entries = self.inner.entries.lock();
        let entry = entries.get_mut(identifier)?;
        entry.prune(now, self.inner.config.window);

        let requests_in_window = entry.timestamps.len();
        let blocked_for = entry.blocked_for(now);
        let remaining = if blocked_for.is_some() {
            0
        } else {
            self.inner.config.max_requests.saturating_sub(requests_in_window)
        };

        Some(LimiterStats {
            identifier: identifier.to_string(),
            requests_in_window,
            remaining,
            blocked_for,
        })
    }

    /// Number of tracked identifiers
    pub fn tracked(&self) -> usize {
        self.inner.entries.lock().len()
    }

    /// Drop identifiers with no calls in the window and no active block.
    /// Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let window = self.inner.config.window;

        let removed = {
            let mut entries = self.inner.entries.lock();
            let before = entries.len();
            entries.retain(|_, entry| {
                entry.prune(now, window);
                !entry.is_idle()
            });
            before - entries.len()
        };

        // A gate nobody holds or waits on is only referenced by the map
        self.inner
            .gates
            .lock()
            .retain(|_, gate| Arc::strong_count(gate) > 1);

        if removed > 0 {
            debug!(
                rate_limiter = %self.inner.config.name,
                removed = removed,
                "Swept idle identifiers"
            );
        }
        removed
    }

    /// Start the background sweep, one pass per window.
    ///
    /// Construction already does this when a tokio runtime is available.
    /// Returns false if a sweeper is already running or there is no runtime.
    pub fn start_sweeper(&self) -> bool {
        if self.inner.sweeper_running.swap(true, Ordering::AcqRel) {
            return false;
        }
        let Ok(handle) = Handle::try_current() else {
            self.inner.sweeper_running.store(false, Ordering::Release);
            warn!(
                rate_limiter = %self.inner.config.name,
                "No tokio runtime, background sweep disabled"
            );
            return false;
        };

        let weak: Weak<LimiterInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = self.inner.config.window;

        handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(inner) = weak.upgrade() else { break };
                        SlidingWindowLimiter { inner }.sweep();
                    }
                }
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max: usize, window_ms: u64) -> SlidingWindowLimiter {
        SlidingWindowLimiter::new(
            RateLimiterConfig::new(max, Duration::from_millis(window_ms))
                .with_block_duration(Duration::from_secs(60)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_strategy_blocks_identifier() {
        let limiter = limiter(2, 1000);

        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Block));
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Block));
        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(!limiter.is_allowed("user-1", RateLimitStrategy::Block));

        let stats = limiter.stats("user-1").unwrap();
        assert_eq!(stats.requests_in_window, 0);
        assert_eq!(stats.blocked_for, Some(Duration::from_secs(60)));

        // Still blocked after the window has slid past
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(!limiter.is_allowed("user-1", RateLimitStrategy::Block));

        tokio::time::advance(Duration::from_secs(55)).await;
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Block));
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_strategy_has_no_side_effects() {
        let limiter = limiter(2, 1000);

        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));
        assert!(!limiter.is_allowed("user-1", RateLimitStrategy::Drop));

        let stats = limiter.stats("user-1").unwrap();
        assert_eq!(stats.requests_in_window, 2);
        assert_eq!(stats.blocked_for, None);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_strategy_denies_without_waiting() {
        let limiter = limiter(1, 1000);

        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Queue));
        tokio::time::advance(Duration::from_millis(250)).await;

        match limiter.check("user-1", RateLimitStrategy::Queue) {
            Err(RelayError::RateLimited { retry_after, .. }) => {
                assert_eq!(retry_after, Duration::from_millis(750));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_identifiers_are_independent() {
        let limiter = limiter(1, 1000);

        assert!(limiter.is_allowed("a", RateLimitStrategy::Block));
        assert!(!limiter.is_allowed("a", RateLimitStrategy::Block));
        assert!(limiter.is_allowed("b", RateLimitStrategy::Block));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = limiter(3, 1000);

        for _ in 0..3 {
            assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));
            tokio::time::advance(Duration::from_millis(400)).await;
        }
        // t = 1200ms: the call at t = 0 has left the window
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));
        assert!(!limiter.is_allowed("user-1", RateLimitStrategy::Drop));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_waits_for_slot() {
        let limiter = limiter(1, 1000);
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Queue));

        let start = Instant::now();
        limiter.admit("user-1", Duration::from_secs(5)).await.unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_serves_in_arrival_order() {
        let limiter = limiter(1, 1000);
        let order = Arc::new(Mutex::new(Vec::new()));
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Queue));

        let first = {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                limiter.admit("user-1", Duration::from_secs(5)).await.unwrap();
                order.lock().push("first");
            })
        };
        tokio::task::yield_now().await;

        let second = {
            let limiter = limiter.clone();
            let order = Arc::clone(&order);
            tokio::spawn(async move {
                limiter.admit("user-1", Duration::from_secs(5)).await.unwrap();
                order.lock().push("second");
            })
        };

        first.await.unwrap();
        second.await.unwrap();

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_gives_up_after_max_wait() {
        let limiter = limiter(1, 1000);
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Queue));

        let err = limiter
            .admit("user-1", Duration::from_millis(500))
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "RATE_LIMITED");
    }

    #[tokio::test(start_paused = true)]
    async fn test_admit_fails_fast_when_blocked() {
        let limiter = limiter(1, 1000);
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Block));
        assert!(!limiter.is_allowed("user-1", RateLimitStrategy::Block));

        let start = Instant::now();
        let err = limiter.admit("user-1", Duration::from_secs(120)).await.unwrap_err();

        assert_eq!(start.elapsed(), Duration::ZERO);
        match err {
            RelayError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Duration::from_secs(60));
            }
            other => panic!("expected RateLimited, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_idle_identifiers() {
        let limiter = limiter(1, 1000);

        assert!(limiter.is_allowed("idle", RateLimitStrategy::Drop));
        assert!(limiter.is_allowed("blocked", RateLimitStrategy::Block));
        assert!(!limiter.is_allowed("blocked", RateLimitStrategy::Block));

        tokio::time::advance(Duration::from_millis(1500)).await;

        // The background pass may already have taken it
        assert!(limiter.sweep() <= 1);
        assert_eq!(limiter.tracked(), 1);
        assert!(limiter.stats("idle").is_none());
        assert!(limiter.stats("blocked").is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let limiter = limiter(5, 1000);
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));

        tokio::time::sleep(Duration::from_millis(2500)).await;

        assert_eq!(limiter.tracked(), 0);
        assert!(!limiter.start_sweeper());
    }

    #[test]
    fn test_limiter_works_without_runtime() {
        let limiter = limiter(1, 1000);

        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));
        assert!(!limiter.is_allowed("user-1", RateLimitStrategy::Drop));
        assert!(!limiter.start_sweeper());
    }

    #[tokio::test]
    async fn test_reset() {
        let limiter = limiter(1, 60_000);

        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));
        assert!(!limiter.is_allowed("user-1", RateLimitStrategy::Drop));
        assert!(limiter.reset("user-1"));
        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Drop));
    }

    #[tokio::test(start_paused = true)]
    async fn test_denials_are_published() {
        let events = EventBus::default();
        let mut rx = events.subscribe_channel();
        let limiter = SlidingWindowLimiter::with_events(
            RateLimiterConfig::new(1, Duration::from_secs(1)),
            events,
        );

        assert!(limiter.is_allowed("user-1", RateLimitStrategy::Block));
        assert!(!limiter.is_allowed("user-1", RateLimitStrategy::Block));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::RateLimitTriggered);
        assert_eq!(rx.recv().await.unwrap().kind, EventKind::RateLimitBlocked);
    }
}
