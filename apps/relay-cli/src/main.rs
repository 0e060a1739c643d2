//! Relay CLI
//!
//! A command-line harness for exercising the Relay runtime components
//! against simulated workloads.

mod commands;
mod output;

use anyhow::Context;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use colored::Colorize;
use output::OutputFormat;
use relay_core::{init_tracing, RelayConfig, TracingConfig};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "relay",
    author = "Relay Team",
    version,
    about = "Relay - resilient dispatch toolkit",
    long_about = "A command-line harness for the Relay runtime components.\n\n\
                  Configuration is read from an optional file and RELAY__* \n\
                  environment variables (for example RELAY__CIRCUIT__FAILURE_THRESHOLD=3)."
)]
pub(crate) struct Cli {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short = 'C', long, env = "RELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset
    #[arg(short, long, env = "RELAY_LOG", default_value = "warn")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = OutputFormat::Text)]
    format: OutputFormat,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,

    /// Print error causes
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the effective configuration
    Config,

    /// Dispatch against an operation that fails its first N attempts
    Simulate(commands::simulate::SimulateArgs),

    /// Push calls through the rate limiter
    Limit(commands::limit::LimitArgs),

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<RelayConfig> {
    let config = match path {
        Some(path) => RelayConfig::load_from_file(path)
            .with_context(|| format!("failed to load {}", path.display()))?,
        None => RelayConfig::load().context("failed to load configuration from environment")?,
    };
    config.validate()?;
    Ok(config)
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::Completions { shell } = cli.command {
        return commands::completions::run(shell);
    }

    init_tracing(&TracingConfig::new(&cli.log_level).with_json(cli.log_json))?;
    let config = load_config(cli.config.as_ref())?;
    tracing::debug!(?config, "Configuration loaded");

    match cli.command {
        Commands::Config => commands::config::run(&config, cli.format),
        Commands::Simulate(args) => commands::simulate::run(&config, args, cli.format).await,
        Commands::Limit(args) => commands::limit::run(&config, args, cli.format).await,
        Commands::Completions { .. } => Ok(()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    if cli.no_color {
        colored::control::set_override(false);
    }
    let verbose = cli.verbose;

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            if verbose {
                for cause in e.chain().skip(1) {
                    eprintln!("{}: {}", "Caused by".yellow(), cause);
                }
            }
            ExitCode::FAILURE
        }
    }
}
