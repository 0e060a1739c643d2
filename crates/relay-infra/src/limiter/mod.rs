//! Admission control per external identifier

pub mod sliding_window;

pub use sliding_window::{LimiterStats, RateLimiterConfig, SlidingWindowLimiter};
