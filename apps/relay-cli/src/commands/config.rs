//! Effective configuration

use crate::output::{self, OutputFormat};
use anyhow::Result;
use relay_core::RelayConfig;

pub fn run(config: &RelayConfig, format: OutputFormat) -> Result<()> {
    if format.is_json() {
        return output::json(config);
    }

    output::heading("circuit");
    output::key_value("failure_threshold", config.circuit.failure_threshold);
    output::key_value("success_threshold", config.circuit.success_threshold);
    output::key_value("recovery_timeout", output::millis(config.circuit.recovery_timeout()));

    output::heading("pool");
    output::key_value("min_connections", config.pool.min_connections);
    output::key_value("max_connections", config.pool.max_connections);
    output::key_value("idle_timeout", output::millis(config.pool.idle_timeout()));
    output::key_value("acquire_timeout", output::millis(config.pool.acquire_timeout()));

    output::heading("limiter");
    output::key_value("max_requests", config.limiter.max_requests);
    output::key_value("window", output::millis(config.limiter.window()));
    output::key_value("block_duration", output::millis(config.limiter.block_duration()));

    output::heading("cache");
    output::key_value(
        "default_ttl",
        config
            .cache
            .default_ttl()
            .map(output::millis)
            .unwrap_or_else(|| "none".to_string()),
    );
    output::key_value("max_entries", config.cache.max_entries);

    output::heading("dispatcher");
    output::key_value("retries", config.dispatcher.retries);
    output::key_value("retry_strategy", config.dispatcher.retry_strategy);
    output::key_value("base_delay", output::millis(config.dispatcher.base_delay()));
    output::key_value("timeout", output::millis(config.dispatcher.timeout()));

    Ok(())
}
