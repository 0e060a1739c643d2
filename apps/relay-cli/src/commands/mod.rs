//! CLI command implementations

pub mod completions;
pub mod config;
pub mod limit;
pub mod simulate;
