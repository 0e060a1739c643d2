//! Dispatch against a simulated flaky operation

use crate::output::{self, OutputFormat};
use anyhow::Result;
use clap::Args;
use relay_core::{EventBus, RelayConfig};
use relay_infra::{
    CircuitBreakerConfig, DispatchMetrics, ExecuteOptions, FailureCircuit, OperationError,
    ResilientDispatcher,
};
use serde::Serialize;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Args)]
pub struct SimulateArgs {
    /// Work key to dispatch under (connector:operation)
    #[arg(short, long, default_value = "demo:operation")]
    pub key: String,

    /// Attempts that fail before the operation starts succeeding
    #[arg(short, long, default_value_t = 0)]
    pub failures: u32,

    /// Dispatches to run
    #[arg(short, long, default_value_t = 5)]
    pub calls: u32,

    /// Override the configured retry count
    #[arg(long)]
    pub retries: Option<u32>,

    /// Override the configured base backoff delay
    #[arg(long)]
    pub base_delay_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
struct CallReport {
    call: u32,
    outcome: &'static str,
    attempts: u32,
    elapsed_ms: u64,
    circuit: &'static str,
    error: Option<String>,
}

pub async fn run(config: &RelayConfig, args: SimulateArgs, format: OutputFormat) -> Result<()> {
    let events = EventBus::default();
    events.subscribe("circuit.*", |event| {
        tracing::info!(kind = %event.kind, key = %event.identifier, "Circuit transition");
        Ok(())
    });

    let dispatcher = ResilientDispatcher::with_events(
        FailureCircuit::with_events(
            CircuitBreakerConfig::from(&config.circuit),
            events.clone(),
        ),
        DispatchMetrics::new(),
        events,
    );

    let mut options: ExecuteOptions<(), u32> = ExecuteOptions::from_settings(&config.dispatcher)
        .with_context(json!({ "source": "relay-cli" }));
    if let Some(retries) = args.retries {
        options = options.with_retries(retries);
    }
    if let Some(delay) = args.base_delay_ms {
        options = options.with_base_delay(Duration::from_millis(delay));
    }

    let remaining_failures = Arc::new(AtomicU32::new(args.failures));
    let mut reports = Vec::with_capacity(args.calls as usize);

    for call in 1..=args.calls {
        let failures = Arc::clone(&remaining_failures);
        let result = dispatcher
            .execute(
                args.key.as_str(),
                (),
                move |_, ctx| {
                    let failures = Arc::clone(&failures);
                    async move {
                        let fail = failures
                            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                            .is_ok();
                        if fail {
                            Err(OperationError::failed(format!(
                                "simulated failure on attempt {}",
                                ctx.attempt
                            )))
                        } else {
                            Ok(ctx.attempt)
                        }
                    }
                },
                options.clone(),
            )
            .await;

        let circuit = dispatcher.circuit().state(&args.key).as_str();
        let report = match result {
            Ok(dispatched) => CallReport {
                call,
                outcome: "success",
                attempts: dispatched.attempts,
                elapsed_ms: dispatched.elapsed.as_millis() as u64,
                circuit,
                error: None,
            },
            Err(err) => {
                let attempts = match &err {
                    relay_infra::DispatchError::Exhausted { attempts, .. }
                    | relay_infra::DispatchError::Validation { attempts, .. } => *attempts,
                    _ => 0,
                };
                CallReport {
                    call,
                    outcome: err.error_code(),
                    attempts,
                    elapsed_ms: 0,
                    circuit,
                    error: Some(err.to_string()),
                }
            }
        };

        if !format.is_json() {
            let line = format!(
                "call {} {} after {} attempt(s) [circuit {}]",
                report.call, report.outcome, report.attempts, report.circuit
            );
            match &report.error {
                None => output::success(&line),
                Some(error) => output::failure(&format!("{}: {}", line, error)),
            }
        }
        reports.push(report);
    }

    let metrics = dispatcher.metrics().get(&args.key);
    if format.is_json() {
        return output::json(&json!({
            "key": args.key,
            "calls": reports,
            "metrics": metrics,
        }));
    }

    output::heading("metrics");
    match metrics {
        Some(metrics) => {
            output::key_value("executions", metrics.executions);
            output::key_value("successes", metrics.successes);
            output::key_value("failures", metrics.failures);
            output::key_value("success_rate", format!("{:.2}", metrics.success_rate()));
            output::key_value("average_latency", format!("{:.1}ms", metrics.average_latency_ms));
        }
        None => output::warning("no dispatch reached the operation"),
    }

    Ok(())
}
