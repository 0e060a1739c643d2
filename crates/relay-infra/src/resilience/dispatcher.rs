//! Resilient operation dispatch
//!
//! Runs a caller-supplied operation behind the per-key circuit breaker with
//! bounded retries and backoff, optionally on a pooled resource, and records
//! the outcome in per-key metrics.

use futures::future::BoxFuture;
use relay_core::{DispatcherSettings, EventBus, EventKind, RelayError, RetryStrategy, WorkKey};
use serde_json::json;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::circuit_breaker::FailureCircuit;
use super::retry::{Backoff, BackoffConfig};
use crate::metrics::DispatchMetrics;
use crate::pool::ResourcePool;

/// Error returned by one attempt of an operation
#[derive(Debug, Error)]
pub enum OperationError {
    /// The operation rejected its input or produced something unusable; never retried
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Transient failure; retried while budget remains
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl OperationError {
    pub fn validation(message: impl Into<String>) -> Self {
        OperationError::Validation(message.into())
    }

    pub fn failed(message: impl std::fmt::Display) -> Self {
        OperationError::Failed(anyhow::anyhow!("{}", message))
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, OperationError::Failed(_))
    }
}

/// Errors surfaced by [`ResilientDispatcher`]
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Rejected by the circuit breaker; the operation never ran
    #[error("Circuit open for key '{key}'")]
    CircuitOpen { key: String },

    /// Input, output or operation-level validation failed
    #[error("Validation failed after {attempts} attempt(s): {message}")]
    Validation { message: String, attempts: u32 },

    /// Every attempt failed
    #[error("Execution failed after {attempts} attempt(s) in {elapsed:?}: {source}")]
    Exhausted {
        attempts: u32,
        elapsed: Duration,
        #[source]
        source: OperationError,
    },

    /// Could not obtain a pooled resource
    #[error(transparent)]
    Resource(RelayError),
}

impl DispatchError {
    pub fn error_code(&self) -> &'static str {
        match self {
            DispatchError::CircuitOpen { .. } => "CIRCUIT_OPEN",
            DispatchError::Validation { .. } => "VALIDATION_FAILED",
            DispatchError::Exhausted { .. } => "EXECUTION_FAILED",
            DispatchError::Resource(e) => e.error_code(),
        }
    }
}

impl From<DispatchError> for RelayError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::CircuitOpen { key } => RelayError::CircuitOpen { key },
            DispatchError::Validation { message, .. } => RelayError::Validation(message),
            DispatchError::Exhausted {
                attempts,
                elapsed,
                source,
            } => RelayError::Execution {
                message: source.to_string(),
                attempts,
                elapsed,
            },
            DispatchError::Resource(e) => e,
        }
    }
}

/// Passed to every attempt
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub key: WorkKey,
    /// One-based attempt number
    pub attempt: u32,
    /// Advisory deadline for the attempt; not enforced by the dispatcher
    pub timeout: Duration,
    /// Opaque caller context (credentials, tenant, trace ids)
    pub context: serde_json::Value,
}

/// Checks a value, returning a message on failure
pub type Validator<T> = Arc<dyn Fn(&T) -> Result<(), String> + Send + Sync>;

/// Per-call dispatch options
pub struct ExecuteOptions<I, T> {
    /// Retries after the first attempt
    pub retries: u32,
    pub retry_strategy: RetryStrategy,
    pub base_delay: Duration,
    pub timeout: Duration,
    pub jitter: bool,
    pub context: serde_json::Value,
    pub validate_input: Option<Validator<I>>,
    pub validate_output: Option<Validator<T>>,
}

impl<I, T> Default for ExecuteOptions<I, T> {
    fn default() -> Self {
        Self {
            retries: 3,
            retry_strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            jitter: false,
            context: serde_json::Value::Null,
            validate_input: None,
            validate_output: None,
        }
    }
}

impl<I, T> Clone for ExecuteOptions<I, T> {
    fn clone(&self) -> Self {
        Self {
            retries: self.retries,
            retry_strategy: self.retry_strategy,
            base_delay: self.base_delay,
            timeout: self.timeout,
            jitter: self.jitter,
            context: self.context.clone(),
            validate_input: self.validate_input.clone(),
            validate_output: self.validate_output.clone(),
        }
    }
}

impl<I, T> std::fmt::Debug for ExecuteOptions<I, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecuteOptions")
            .field("retries", &self.retries)
            .field("retry_strategy", &self.retry_strategy)
            .field("base_delay", &self.base_delay)
            .field("timeout", &self.timeout)
            .field("jitter", &self.jitter)
            .field("validate_input", &self.validate_input.is_some())
            .field("validate_output", &self.validate_output.is_some())
            .finish()
    }
}

impl<I, T> ExecuteOptions<I, T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_settings(settings: &DispatcherSettings) -> Self {
        Self {
            retries: settings.retries,
            retry_strategy: settings.retry_strategy,
            base_delay: settings.base_delay(),
            timeout: settings.timeout(),
            ..Default::default()
        }
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = strategy;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    pub fn with_input_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&I) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate_input = Some(Arc::new(validator));
        self
    }

    pub fn with_output_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&T) -> Result<(), String> + Send + Sync + 'static,
    {
        self.validate_output = Some(Arc::new(validator));
        self
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            BackoffConfig::new(self.retry_strategy, self.base_delay).with_jitter(self.jitter),
        )
    }
}

/// Successful dispatch
#[derive(Debug, Clone)]
pub struct Dispatched<T> {
    pub value: T,
    /// Attempts made, including the successful one
    pub attempts: u32,
    pub elapsed: Duration,
}

impl<T> Dispatched<T> {
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

enum Step<T> {
    Retry(Duration),
    Done(Result<Dispatched<T>, DispatchError>),
}

/// Attempt bookkeeping shared by both dispatch entry points
struct AttemptLoop<'a, I, T> {
    dispatcher: &'a ResilientDispatcher,
    key: &'a WorkKey,
    options: &'a ExecuteOptions<I, T>,
    backoff: Backoff,
    started: Instant,
    attempts: u32,
}

impl<'a, I, T> AttemptLoop<'a, I, T> {
    fn new(
        dispatcher: &'a ResilientDispatcher,
        key: &'a WorkKey,
        options: &'a ExecuteOptions<I, T>,
    ) -> Self {
        Self {
            dispatcher,
            key,
            options,
            backoff: options.backoff(),
            started: Instant::now(),
            attempts: 0,
        }
    }

    fn next_context(&mut self) -> AttemptContext {
        self.attempts += 1;
        debug!(key = %self.key, attempt = self.attempts, "Dispatching attempt");
        AttemptContext {
            key: self.key.clone(),
            attempt: self.attempts,
            timeout: self.options.timeout,
            context: self.options.context.clone(),
        }
    }

    fn observe(&self, outcome: Result<T, OperationError>) -> Step<T> {
        match outcome {
            Ok(value) => {
                if let Some(validate) = &self.options.validate_output {
                    if let Err(message) = validate(&value) {
                        return Step::Done(Err(self.invalid(message)));
                    }
                }
                Step::Done(Ok(self.succeeded(value)))
            }
            Err(OperationError::Validation(message)) => Step::Done(Err(self.invalid(message))),
            Err(err) if self.attempts > self.options.retries => {
                Step::Done(Err(self.exhausted(err)))
            }
            Err(err) => {
                let delay = self.backoff.delay_for(self.attempts - 1);
                warn!(
                    key = %self.key,
                    attempt = self.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Operation attempt failed, retrying"
                );
                self.dispatcher.publish(
                    EventKind::OperationRetrying,
                    self.key,
                    json!({
                        "attempt": self.attempts,
                        "delay_ms": delay.as_millis() as u64,
                        "error": err.to_string(),
                    }),
                );
                Step::Retry(delay)
            }
        }
    }

    fn succeeded(&self, value: T) -> Dispatched<T> {
        let elapsed = self.started.elapsed();
        let dispatcher = self.dispatcher;

        dispatcher.circuit.record_success(self.key.as_str());
        dispatcher.metrics.record(self.key.as_str(), true, elapsed);
        debug!(
            key = %self.key,
            attempts = self.attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            "Operation succeeded"
        );
        dispatcher.publish(
            EventKind::OperationExecuted,
            self.key,
            json!({ "attempts": self.attempts, "elapsed_ms": elapsed.as_millis() as u64 }),
        );

        Dispatched {
            value,
            attempts: self.attempts,
            elapsed,
        }
    }

    /// Terminal validation failure: counted in metrics, invisible to the circuit
    fn invalid(&self, message: String) -> DispatchError {
        let elapsed = self.started.elapsed();
        self.dispatcher
            .metrics
            .record(self.key.as_str(), false, elapsed);
        warn!(key = %self.key, attempts = self.attempts, error = %message, "Operation validation failed");
        self.dispatcher.publish(
            EventKind::OperationFailed,
            self.key,
            json!({
                "attempts": self.attempts,
                "elapsed_ms": elapsed.as_millis() as u64,
                "reason": "validation",
                "error": message,
            }),
        );
        DispatchError::Validation {
            message,
            attempts: self.attempts,
        }
    }

    fn exhausted(&self, source: OperationError) -> DispatchError {
        let elapsed = self.started.elapsed();
        let dispatcher = self.dispatcher;

        dispatcher.circuit.record_failure(self.key.as_str());
        dispatcher.metrics.record(self.key.as_str(), false, elapsed);
        warn!(
            key = %self.key,
            attempts = self.attempts,
            elapsed_ms = elapsed.as_millis() as u64,
            error = %source,
            "Operation failed after all attempts"
        );
        dispatcher.publish(
            EventKind::OperationFailed,
            self.key,
            json!({
                "attempts": self.attempts,
                "elapsed_ms": elapsed.as_millis() as u64,
                "reason": "exhausted",
                "error": source.to_string(),
            }),
        );

        DispatchError::Exhausted {
            attempts: self.attempts,
            elapsed,
            source,
        }
    }
}

/// Executes operations with circuit breaking, retries and metrics
#[derive(Clone)]
pub struct ResilientDispatcher {
    circuit: FailureCircuit,
    metrics: DispatchMetrics,
    events: Option<EventBus>,
}

impl ResilientDispatcher {
    pub fn new(circuit: FailureCircuit, metrics: DispatchMetrics) -> Self {
        Self {
            circuit,
            metrics,
            events: None,
        }
    }

    /// Create a dispatcher that reports operations on `events`
    pub fn with_events(circuit: FailureCircuit, metrics: DispatchMetrics, events: EventBus) -> Self {
        Self {
            circuit,
            metrics,
            events: Some(events),
        }
    }

    pub fn circuit(&self) -> &FailureCircuit {
        &self.circuit
    }

    pub fn metrics(&self) -> &DispatchMetrics {
        &self.metrics
    }

    fn publish(&self, kind: EventKind, key: &WorkKey, payload: serde_json::Value) {
        if let Some(events) = &self.events {
            events.publish(kind, key.as_str(), payload);
        }
    }

    /// Circuit and input checks made before any attempt
    fn admit<I, T>(
        &self,
        key: &WorkKey,
        inputs: &I,
        options: &ExecuteOptions<I, T>,
    ) -> Result<(), DispatchError> {
        if !self.circuit.allow(key.as_str()) {
            debug!(key = %key, "Operation rejected, circuit is open");
            self.publish(EventKind::OperationRejected, key, json!({ "reason": "circuit_open" }));
            return Err(DispatchError::CircuitOpen {
                key: key.to_string(),
            });
        }

        if let Some(validate) = &options.validate_input {
            if let Err(message) = validate(inputs) {
                debug!(key = %key, error = %message, "Operation rejected, invalid input");
                self.publish(
                    EventKind::OperationRejected,
                    key,
                    json!({ "reason": "invalid_input", "error": message }),
                );
                return Err(DispatchError::Validation {
                    message,
                    attempts: 0,
                });
            }
        }

        Ok(())
    }

    /// Run `run` for `key` with up to `options.retries` retries.
    ///
    /// Each attempt gets a fresh clone of `inputs`. Attempts never overlap.
    pub async fn execute<I, T, F, Fut>(
        &self,
        key: impl Into<WorkKey>,
        inputs: I,
        run: F,
        options: ExecuteOptions<I, T>,
    ) -> Result<Dispatched<T>, DispatchError>
    where
        I: Clone,
        F: Fn(I, AttemptContext) -> Fut,
        Fut: Future<Output = Result<T, OperationError>>,
    {
        let key = key.into();
        self.admit(&key, &inputs, &options)?;

        let mut attempts = AttemptLoop::new(self, &key, &options);
        loop {
            let ctx = attempts.next_context();
            let outcome = run(inputs.clone(), ctx).await;
            match attempts.observe(outcome) {
                Step::Retry(delay) => tokio::time::sleep(delay).await,
                Step::Done(result) => return result,
            }
        }
    }

    /// Like [`execute`](Self::execute), with one pooled resource borrowed for
    /// the whole call and returned exactly once.
    pub async fn execute_with_resource<R, I, T, F>(
        &self,
        key: impl Into<WorkKey>,
        pool: &ResourcePool<R>,
        inputs: I,
        run: F,
        options: ExecuteOptions<I, T>,
    ) -> Result<Dispatched<T>, DispatchError>
    where
        R: Send + 'static,
        I: Clone,
        F: for<'r> Fn(I, &'r mut R, AttemptContext) -> BoxFuture<'r, Result<T, OperationError>>,
    {
        let key = key.into();
        self.admit(&key, &inputs, &options)?;

        let mut lease = pool.acquire().await.map_err(|e| {
            warn!(key = %key, error = %e, "Could not acquire resource for operation");
            DispatchError::Resource(e)
        })?;

        let mut attempts = AttemptLoop::new(self, &key, &options);
        let result = loop {
            let ctx = attempts.next_context();
            let outcome = run(inputs.clone(), &mut *lease, ctx).await;
            match attempts.observe(outcome) {
                Step::Retry(delay) => tokio::time::sleep(delay).await,
                Step::Done(result) => break result,
            }
        };

        pool.release(lease).await;
        result
    }
}

impl std::fmt::Debug for ResilientDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientDispatcher")
            .field("circuit", &self.circuit.config().name)
            .field("metrics", &self.metrics)
            .finish()
    }
}
