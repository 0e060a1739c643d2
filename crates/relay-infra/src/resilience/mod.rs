//! Resilience patterns for fault-tolerant dispatch
//!
//! Provides a per-key circuit breaker, retry backoff and the dispatcher that
//! combines them.

pub mod circuit_breaker;
pub mod dispatcher;
pub mod retry;

pub use circuit_breaker::{
    CircuitBreakerConfig, CircuitBreakerState, CircuitSnapshot, FailureCircuit,
};
pub use dispatcher::{
    AttemptContext, DispatchError, Dispatched, ExecuteOptions, OperationError,
    ResilientDispatcher, Validator,
};
pub use retry::{Backoff, BackoffConfig, BackoffSchedule};
