//! Runtime components for Relay
//!
//! Everything here is in-process and safe to share across tasks: each
//! component is a cheap `Clone` handle over shared state.

pub mod cache;
pub mod limiter;
pub mod metrics;
pub mod pool;
pub mod resilience;

pub use cache::{CacheStats, TimedCache, TimedCacheConfig};

pub use limiter::{LimiterStats, RateLimiterConfig, SlidingWindowLimiter};

pub use metrics::{DispatchMetrics, KeyMetrics};

pub use pool::{PoolConfig, PoolStats, Pooled, ResourceFactory, ResourcePool};

pub use resilience::{
    AttemptContext, Backoff, BackoffConfig, CircuitBreakerConfig, CircuitBreakerState,
    CircuitSnapshot, DispatchError, Dispatched, ExecuteOptions, FailureCircuit,
    OperationError, ResilientDispatcher,
};

pub use relay_core::{RelayError, Result};
