//! Backoff between dispatch attempts
//!
//! Linear waits `(attempt_index + 1) * base`, exponential waits
//! `base * 2^attempt_index`. Jitter is opt-in.

use rand::Rng;
use relay_core::{DispatcherSettings, RetryStrategy};
use std::time::Duration;

/// Backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Shape of the delay curve
    pub strategy: RetryStrategy,
    /// Delay unit the curve is scaled by
    pub base_delay: Duration,
    /// Upper bound on a single delay
    pub max_delay: Option<Duration>,
    /// Whether to add random jitter
    pub jitter: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay: Duration::from_secs(1),
            max_delay: None,
            jitter: false,
            jitter_factor: 0.3,
        }
    }
}

impl BackoffConfig {
    pub fn new(strategy: RetryStrategy, base_delay: Duration) -> Self {
        Self {
            strategy,
            base_delay,
            ..Default::default()
        }
    }

    /// Set max delay
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Enable or disable jitter
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Set jitter factor
    pub fn with_jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }
}

impl From<&DispatcherSettings> for BackoffConfig {
    fn from(settings: &DispatcherSettings) -> Self {
        Self::new(settings.retry_strategy, settings.base_delay())
    }
}

/// Delay calculator
#[derive(Debug, Clone)]
pub struct Backoff {
    config: BackoffConfig,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    pub fn linear(base_delay: Duration) -> Self {
        Self::new(BackoffConfig::new(RetryStrategy::Linear, base_delay))
    }

    pub fn exponential(base_delay: Duration) -> Self {
        Self::new(BackoffConfig::new(RetryStrategy::Exponential, base_delay))
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Delay to wait after the attempt with the given zero-based index failed
    pub fn delay_for(&self, attempt_index: u32) -> Duration {
        let base = self.config.base_delay;
        let delay = match self.config.strategy {
            RetryStrategy::Linear => base.saturating_mul(attempt_index.saturating_add(1)),
            RetryStrategy::Exponential => {
                base.saturating_mul(2u32.checked_pow(attempt_index).unwrap_or(u32::MAX))
            }
        };

        let delay = match self.config.max_delay {
            Some(max) => delay.min(max),
            None => delay,
        };

        if self.config.jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    /// Add random jitter to a delay
    fn add_jitter(&self, delay: Duration) -> Duration {
        let jitter_range = delay.mul_f64(self.config.jitter_factor);
        if jitter_range.is_zero() {
            return delay;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(Duration::ZERO..jitter_range);
        if rng.gen_bool(0.5) {
            delay + jitter
        } else {
            delay.saturating_sub(jitter)
        }
    }

    /// The delays slept between `retries + 1` attempts
    pub fn schedule(&self, retries: u32) -> BackoffSchedule {
        BackoffSchedule {
            backoff: self.clone(),
            next_index: 0,
            retries,
        }
    }
}

/// Iterator over the delays of one retry budget
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    backoff: Backoff,
    next_index: u32,
    retries: u32,
}

impl Iterator for BackoffSchedule {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next_index >= self.retries {
            return None;
        }
        let delay = self.backoff.delay_for(self.next_index);
        self.next_index += 1;
        Some(delay)
    }
}
