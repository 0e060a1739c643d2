//! Exercise the sliding-window limiter

use crate::output::{self, OutputFormat};
use anyhow::Result;
use clap::Args;
use relay_core::{RateLimitStrategy, RelayConfig, RelayError};
use relay_infra::{RateLimiterConfig, SlidingWindowLimiter};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Args)]
pub struct LimitArgs {
    /// Identifier being limited (user, tenant, API key)
    #[arg(short, long, default_value = "demo")]
    pub identifier: String,

    /// Calls to make
    #[arg(short, long, default_value_t = 10)]
    pub calls: u32,

    /// What to do once the window is full: block, drop or queue
    #[arg(short, long, default_value = "block")]
    pub strategy: RateLimitStrategy,

    /// Pause between calls
    #[arg(long, default_value_t = 0)]
    pub interval_ms: u64,
}

#[derive(Debug, Serialize)]
struct Admission {
    call: u32,
    allowed: bool,
    retry_after_ms: Option<u64>,
    remaining: usize,
}

pub async fn run(config: &RelayConfig, args: LimitArgs, format: OutputFormat) -> Result<()> {
    let limiter = SlidingWindowLimiter::new(
        RateLimiterConfig::from(&config.limiter).with_name("relay-cli"),
    );
    let max_wait = limiter.config().window;
    let mut admissions = Vec::with_capacity(args.calls as usize);

    for call in 1..=args.calls {
        let verdict = match args.strategy {
            RateLimitStrategy::Queue => limiter.admit(&args.identifier, max_wait).await,
            strategy => limiter.check(&args.identifier, strategy),
        };

        let retry_after = match verdict {
            Ok(()) => None,
            Err(RelayError::RateLimited { retry_after, .. }) => Some(retry_after),
            Err(other) => return Err(other.into()),
        };
        let remaining = limiter
            .stats(&args.identifier)
            .map(|stats| stats.remaining)
            .unwrap_or(0);

        let admission = Admission {
            call,
            allowed: retry_after.is_none(),
            retry_after_ms: retry_after.map(|d| d.as_millis() as u64),
            remaining,
        };

        if !format.is_json() {
            match retry_after {
                None => output::success(&format!("call {} admitted ({} left)", call, remaining)),
                Some(wait) => output::failure(&format!(
                    "call {} denied, retry after {}",
                    call,
                    output::millis(wait)
                )),
            }
        }
        admissions.push(admission);

        if args.interval_ms > 0 {
            tokio::time::sleep(Duration::from_millis(args.interval_ms)).await;
        }
    }

    if format.is_json() {
        return output::json(&serde_json::json!({
            "identifier": args.identifier,
            "strategy": args.strategy,
            "admissions": admissions,
        }));
    }

    let admitted = admissions.iter().filter(|a| a.allowed).count();
    output::heading("summary");
    output::key_value("strategy", args.strategy);
    output::key_value("admitted", format!("{}/{}", admitted, args.calls));

    Ok(())
}
