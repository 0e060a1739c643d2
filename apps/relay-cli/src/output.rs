//! Output formatting utilities

use colored::Colorize;
use serde::Serialize;

/// Output format types
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text
    Text,
    /// One JSON document per command
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        self == OutputFormat::Json
    }
}

/// Print `value` as pretty JSON
pub fn json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn success(message: &str) {
    println!("{} {}", "✓".green(), message);
}

pub fn failure(message: &str) {
    println!("{} {}", "✗".red(), message);
}

pub fn warning(message: &str) {
    println!("{} {}", "⚠".yellow(), message);
}

pub fn heading(title: &str) {
    println!();
    println!("{}", title.bold().underline());
}

pub fn key_value(key: &str, value: impl std::fmt::Display) {
    println!("  {}: {}", key.cyan(), value);
}

/// Format a duration as milliseconds with sub-millisecond precision
pub fn millis(duration: std::time::Duration) -> String {
    format!("{:.1}ms", duration.as_secs_f64() * 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_millis() {
        assert_eq!(millis(Duration::from_micros(1500)), "1.5ms");
        assert_eq!(millis(Duration::ZERO), "0.0ms");
    }
}
