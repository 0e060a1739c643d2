//! Shared types for the Relay resilience layer
//!
//! Errors, configuration, lifecycle events and logging setup used by the
//! pool, circuit, limiter, cache and dispatcher in `relay-infra`.

pub mod config;
pub mod error;
pub mod events;
pub mod telemetry;
pub mod types;

pub use config::{
    CacheSettings, CircuitSettings, DispatcherSettings, LimiterSettings, PoolSettings, RelayConfig,
};
pub use error::{RelayError, Result};
pub use events::{
    Component, EventBus, EventKind, HandlerError, LifecycleEvent, SubscriptionId,
};
pub use telemetry::{init_tracing, TracingConfig};
pub use types::{RateLimitStrategy, RetryStrategy, WorkKey};
