//! End-to-end behaviour of the runtime components working together

use async_trait::async_trait;
use relay_core::{EventBus, EventKind, RateLimitStrategy, RelayError, RetryStrategy};
use relay_infra::{
    CircuitBreakerConfig, CircuitBreakerState, DispatchError, DispatchMetrics, ExecuteOptions,
    FailureCircuit, OperationError, PoolConfig, RateLimiterConfig, ResilientDispatcher,
    ResourceFactory, ResourcePool, SlidingWindowLimiter, TimedCache, TimedCacheConfig,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Session {
    serial: u32,
    requests: u32,
}

#[derive(Default)]
struct SessionFactory {
    created: AtomicU32,
}

#[async_trait]
impl ResourceFactory<Session> for SessionFactory {
    async fn create(&self) -> relay_core::Result<Session> {
        let serial = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Session {
            serial,
            requests: 0,
        })
    }

    async fn is_valid(&self, _session: &Session) -> bool {
        true
    }
}

#[tokio::test(start_paused = true)]
async fn circuit_opens_after_repeated_failures() {
    let dispatcher = ResilientDispatcher::new(
        FailureCircuit::new(CircuitBreakerConfig::new("github").with_failure_threshold(3)),
        DispatchMetrics::new(),
    );
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
        let counter = Arc::clone(&calls);
        let err = dispatcher
            .execute(
                "github:create_issue",
                (),
                move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(OperationError::failed("502 bad gateway")) }
                },
                ExecuteOptions::new().with_retries(0),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Exhausted { attempts: 1, .. }));
    }

    let counter = Arc::clone(&calls);
    let err = dispatcher
        .execute(
            "github:create_issue",
            (),
            move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            },
            ExecuteOptions::new().with_retries(0),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::CircuitOpen { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(
        dispatcher.circuit().state("github:create_issue"),
        CircuitBreakerState::Open
    );

    // Other keys are unaffected
    assert_eq!(
        dispatcher.circuit().state("github:list_issues"),
        CircuitBreakerState::Closed
    );

    let metrics = dispatcher.metrics().get("github:create_issue").unwrap();
    assert_eq!(metrics.executions, 3);
    assert_eq!(metrics.failures, 3);
}

#[tokio::test(start_paused = true)]
async fn saturated_pool_times_out_third_caller() {
    let pool = ResourcePool::new(
        Arc::new(SessionFactory::default()),
        PoolConfig::new("sessions")
            .with_pool_size(1, 2)
            .with_acquire_timeout(Duration::from_millis(100)),
    )
    .await;

    let start = Instant::now();
    let first = pool.acquire().await.unwrap();
    let second = pool.acquire().await.unwrap();
    assert_eq!(start.elapsed(), Duration::ZERO);
    assert_ne!(first.serial, second.serial);

    let err = pool.acquire().await.unwrap_err();
    assert!(matches!(err, RelayError::AcquireTimeout { .. }));
    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(pool.stats().timeouts, 1);
    assert!(pool.stats().total() <= 2);
}

#[tokio::test(start_paused = true)]
async fn saturated_pool_serves_third_caller_after_release() {
    let pool = ResourcePool::new(
        Arc::new(SessionFactory::default()),
        PoolConfig::new("sessions")
            .with_pool_size(1, 2)
            .with_acquire_timeout(Duration::from_millis(100)),
    )
    .await;

    let first = pool.acquire().await.unwrap();
    let _second = pool.acquire().await.unwrap();
    let first_serial = first.serial;

    let releaser = pool.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        releaser.release(first).await;
    });

    let start = Instant::now();
    let third = pool.acquire().await.unwrap();
    assert_eq!(third.serial, first_serial);
    let waited = start.elapsed();
    assert!(waited >= Duration::from_millis(40) && waited < Duration::from_millis(100));
    assert_eq!(pool.stats().created, 2);
}

#[tokio::test(start_paused = true)]
async fn limiter_blocks_identifier_over_budget() {
    let limiter = SlidingWindowLimiter::new(
        RateLimiterConfig::new(2, Duration::from_millis(1000))
            .with_block_duration(Duration::from_secs(5)),
    );

    assert!(limiter.is_allowed("tenant-1", RateLimitStrategy::Block));
    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(limiter.is_allowed("tenant-1", RateLimitStrategy::Block));
    tokio::time::advance(Duration::from_millis(200)).await;
    assert!(!limiter.is_allowed("tenant-1", RateLimitStrategy::Block));

    let stats = limiter.stats("tenant-1").unwrap();
    assert_eq!(stats.blocked_for, Some(Duration::from_secs(5)));

    // Still blocked after the window slides
    tokio::time::advance(Duration::from_millis(1500)).await;
    assert!(!limiter.is_allowed("tenant-1", RateLimitStrategy::Block));

    tokio::time::advance(Duration::from_millis(3500)).await;
    assert!(limiter.is_allowed("tenant-1", RateLimitStrategy::Block));

    // Independent identifier
    assert!(limiter.is_allowed("tenant-2", RateLimitStrategy::Block));
}

#[tokio::test(start_paused = true)]
async fn retries_with_exponential_backoff_then_succeeds() {
    let dispatcher = ResilientDispatcher::new(
        FailureCircuit::default_config("slack"),
        DispatchMetrics::new(),
    );

    let result = dispatcher
        .execute(
            "slack:post_message",
            "hello".to_string(),
            |text, ctx| async move {
                if ctx.attempt <= 2 {
                    Err(OperationError::failed("rate limited upstream"))
                } else {
                    Ok(text.len())
                }
            },
            ExecuteOptions::new()
                .with_retries(2)
                .with_retry_strategy(RetryStrategy::Exponential)
                .with_base_delay(Duration::from_millis(100)),
        )
        .await
        .unwrap();

    assert_eq!(result.value, 5);
    assert_eq!(result.retries(), 2);
    assert!(result.elapsed >= Duration::from_millis(300));
    assert_eq!(
        dispatcher.circuit().state("slack:post_message"),
        CircuitBreakerState::Closed
    );
}

#[tokio::test(start_paused = true)]
async fn admitted_calls_share_pooled_sessions_and_cache_results() {
    let events = EventBus::default();
    let mut rx = events.subscribe_channel();

    let limiter = SlidingWindowLimiter::with_events(
        RateLimiterConfig::new(10, Duration::from_secs(1)),
        events.clone(),
    );
    let pool = ResourcePool::with_events(
        Arc::new(SessionFactory::default()),
        PoolConfig::new("sessions").with_pool_size(1, 1),
        events.clone(),
    )
    .await;
    let dispatcher = ResilientDispatcher::with_events(
        FailureCircuit::default_config("api"),
        DispatchMetrics::new(),
        events.clone(),
    );
    let cache: TimedCache<u32> = TimedCache::new(
        TimedCacheConfig::new(Some(Duration::from_secs(60))).with_cleanup_interval(None),
    );

    for _ in 0..3 {
        limiter.admit("tenant-1", Duration::from_millis(10)).await.unwrap();

        if cache.get("report").is_some() {
            continue;
        }

        let dispatched = dispatcher
            .execute_with_resource(
                "api:report",
                &pool,
                (),
                |_, session: &mut Session, _| {
                    Box::pin(async move {
                        session.requests += 1;
                        Ok(session.requests)
                    })
                },
                ExecuteOptions::new().with_retries(0),
            )
            .await
            .unwrap();
        cache.set("report", dispatched.value);
    }

    assert_eq!(cache.get("report"), Some(1));
    assert_eq!(cache.stats().hits, 3);
    assert_eq!(dispatcher.metrics().get("api:report").unwrap().executions, 1);
    assert_eq!(limiter.stats("tenant-1").unwrap().requests_in_window, 3);
    assert_eq!(pool.stats().available, 1);

    let mut kinds = Vec::new();
    while let Ok(event) = rx.try_recv() {
        kinds.push(event.kind);
    }
    assert!(kinds.contains(&EventKind::OperationExecuted));
}
