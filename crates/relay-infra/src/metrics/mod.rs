//! Dispatch metrics
//!
//! Per-key execution counters with Prometheus text exposition.

pub mod dispatch;

pub use dispatch::{DispatchMetrics, KeyMetrics};
