use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::RelayError;

// Newtype wrappers for type safety

/// Stable identifier for a class of work, e.g. `"github:create_issue"`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkKey(String);

impl WorkKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Build the conventional `connector:operation` key
    pub fn for_operation(connector: &str, operation: &str) -> Self {
        Self(format!("{}:{}", connector, operation))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for WorkKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl AsRef<str> for WorkKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Backoff shape used between dispatch attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// `(attempt_index + 1) * base`
    Linear,
    /// `base * 2^attempt_index`
    #[default]
    Exponential,
}

impl RetryStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetryStrategy::Linear => "linear",
            RetryStrategy::Exponential => "exponential",
        }
    }
}

impl std::fmt::Display for RetryStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RetryStrategy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "linear" => Ok(RetryStrategy::Linear),
            "exponential" => Ok(RetryStrategy::Exponential),
            other => Err(RelayError::Configuration(format!(
                "unknown retry strategy '{}'",
                other
            ))),
        }
    }
}

/// What the rate limiter does once an identifier has used its window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateLimitStrategy {
    /// Deny and block the identifier for the configured block duration
    #[default]
    Block,
    /// Deny this call only
    Drop,
    /// Deny on the non-blocking path; use `admit` for deferred admission
    Queue,
}

impl RateLimitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitStrategy::Block => "block",
            RateLimitStrategy::Drop => "drop",
            RateLimitStrategy::Queue => "queue",
        }
    }
}

impl std::fmt::Display for RateLimitStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RateLimitStrategy {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "block" => Ok(RateLimitStrategy::Block),
            "drop" => Ok(RateLimitStrategy::Drop),
            "queue" => Ok(RateLimitStrategy::Queue),
            other => Err(RelayError::Configuration(format!(
                "unknown rate limit strategy '{}'",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_work_key_for_operation() {
        let key = WorkKey::for_operation("slack", "post_message");
        assert_eq!(key.as_str(), "slack:post_message");
        assert_eq!(key.to_string(), "slack:post_message");
        assert_eq!(WorkKey::from("slack:post_message"), key);
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!("linear".parse::<RetryStrategy>().unwrap(), RetryStrategy::Linear);
        assert_eq!(
            "EXPONENTIAL".parse::<RetryStrategy>().unwrap(),
            RetryStrategy::Exponential
        );
        assert!("fibonacci".parse::<RetryStrategy>().is_err());

        assert_eq!("queue".parse::<RateLimitStrategy>().unwrap(), RateLimitStrategy::Queue);
        assert!("throttle".parse::<RateLimitStrategy>().is_err());
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&RetryStrategy::Linear).unwrap();
        assert_eq!(json, "\"linear\"");

        let strategy: RateLimitStrategy = serde_json::from_str("\"drop\"").unwrap();
        assert_eq!(strategy, RateLimitStrategy::Drop);
    }
}
