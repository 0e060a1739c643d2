//! Per-key dispatch metrics
//!
//! Counts executions per work key and keeps a running latency average.
//! Rendered in Prometheus text format on demand.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

/// Metrics for one work key
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct KeyMetrics {
    /// Completed dispatches, successful or not
    pub executions: u64,
    pub successes: u64,
    pub failures: u64,
    /// Cumulative mean latency across all executions
    pub average_latency_ms: f64,
    pub last_executed_at: Option<DateTime<Utc>>,
}

impl KeyMetrics {
    fn record(&mut self, success: bool, latency: Duration) {
        self.executions += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }

        let sample = latency.as_nanos() as f64 / 1_000_000.0;
        self.average_latency_ms += (sample - self.average_latency_ms) / self.executions as f64;
        self.last_executed_at = Some(Utc::now());
    }

    /// Get the success rate (0.0 to 1.0)
    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            self.successes as f64 / self.executions as f64
        }
    }
}

/// Shared registry of per-key metrics
#[derive(Clone, Default)]
pub struct DispatchMetrics {
    keys: Arc<Mutex<HashMap<String, KeyMetrics>>>,
}

impl DispatchMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one completed dispatch for `key`
    pub fn record(&self, key: &str, success: bool, latency: Duration) {
        self.keys
            .lock()
            .entry(key.to_string())
            .or_default()
            .record(success, latency);
    }

    pub fn get(&self, key: &str) -> Option<KeyMetrics> {
        self.keys.lock().get(key).cloned()
    }

    /// All keys, sorted by name
    pub fn snapshot(&self) -> Vec<(String, KeyMetrics)> {
        let mut entries: Vec<_> = self
            .keys
            .lock()
            .iter()
            .map(|(key, metrics)| (key.clone(), metrics.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn reset(&self, key: &str) -> bool {
        self.keys.lock().remove(key).is_some()
    }

    /// Render all keys in Prometheus format
    pub fn render_prometheus(&self, prefix: &str) -> String {
        let snapshot = self.snapshot();
        let mut output = String::new();

        let counters: [(&str, &str, fn(&KeyMetrics) -> u64); 3] = [
            ("executions_total", "Completed dispatches", |m: &KeyMetrics| m.executions),
            ("successes_total", "Successful dispatches", |m: &KeyMetrics| m.successes),
            (
                "failures_total",
                "Dispatches that exhausted their retries",
                |m: &KeyMetrics| m.failures,
            ),
        ];

        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {}_dispatch_{} {}", prefix, name, help);
            let _ = writeln!(output, "# TYPE {}_dispatch_{} counter", prefix, name);
            for (key, metrics) in &snapshot {
                let _ = writeln!(
                    output,
                    "{}_dispatch_{}{{key=\"{}\"}} {}",
                    prefix,
                    name,
                    escape_label(key),
                    value(metrics)
                );
            }
        }

        let _ = writeln!(
            output,
            "# HELP {}_dispatch_latency_avg_ms Mean dispatch latency in milliseconds",
            prefix
        );
        let _ = writeln!(output, "# TYPE {}_dispatch_latency_avg_ms gauge", prefix);
        for (key, metrics) in &snapshot {
            let _ = writeln!(
                output,
                "{}_dispatch_latency_avg_ms{{key=\"{}\"}} {}",
                prefix,
                escape_label(key),
                metrics.average_latency_ms
            );
        }

        let _ = writeln!(
            output,
            "# HELP {}_dispatch_last_executed_seconds Unix time of the last dispatch",
            prefix
        );
        let _ = writeln!(output, "# TYPE {}_dispatch_last_executed_seconds gauge", prefix);
        for (key, metrics) in &snapshot {
            if let Some(at) = metrics.last_executed_at {
                let _ = writeln!(
                    output,
                    "{}_dispatch_last_executed_seconds{{key=\"{}\"}} {}",
                    prefix,
                    escape_label(key),
                    at.timestamp()
                );
            }
        }

        output
    }
}

impl std::fmt::Debug for DispatchMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchMetrics")
            .field("keys", &self.keys.lock().len())
            .finish()
    }
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
