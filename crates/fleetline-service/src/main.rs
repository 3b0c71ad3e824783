//! fleetlined - Fleetline rollout orchestrator
//!
//! Loads the fleet configuration and drives firmware and configuration
//! rollouts to devices, streaming session events as they happen.

#![deny(static_mut_refs)]
#![deny(unused_must_use)]
#![deny(clippy::unwrap_used)]

mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use fleetline_service::config::LoggingSection;
use fleetline_service::{Fleet, ServiceConfig, output};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use crate::commands::{LedgerCommands, RolloutArgs};

#[derive(Parser)]
#[command(name = "fleetlined")]
#[command(about = "Fleetline - firmware and configuration rollouts for device fleets")]
#[command(version)]
#[command(long_about = "
fleetlined pushes firmware images and configuration bundles to devices over
MQTT, BLE or HTTP, retrying and falling back across transports and rolling
devices back when an update fails after it was applied.

Use --json for machine-readable output; session events are then printed as
one JSON object per line.
")]
struct Cli {
    /// Output format (human-readable or JSON)
    #[arg(
        long,
        global = true,
        help = "Output in JSON format for machine parsing"
    )]
    json: bool,

    /// Verbose logging
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file
    #[arg(short, long, global = true, env = "FLEETLINE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration file and summarise it
    CheckConfig,

    /// List configured devices
    Devices,

    /// Probe a device over each of its transports
    Reachability {
        /// Device ID
        device: String,
    },

    /// Configuration ledger commands
    #[command(subcommand)]
    Ledger(LedgerCommands),

    /// Roll a firmware image or configuration version out to a device
    Rollout(RolloutArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match load_config(&cli) {
        Ok(config) => {
            init_tracing(cli.verbose, cli.json, &config.logging);
            execute_command(&cli, config).await
        }
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if cli.json {
                output::print_error_json(&e);
            } else {
                output::print_error_human(&e);
            }
            ExitCode::from(fleetline_service::error::exit_code(&e))
        }
    }
}

fn load_config(cli: &Cli) -> Result<ServiceConfig> {
    match &cli.config {
        Some(path) => Ok(ServiceConfig::load(path)?),
        None => Ok(ServiceConfig::default()),
    }
}

/// `RUST_LOG` wins, then `-v`, then the configured filter. Logs go to stderr
/// so `--json` output on stdout stays parseable.
fn init_tracing(verbose: u8, json: bool, logging: &LoggingSection) {
    let fallback = match verbose {
        0 => logging.filter.clone(),
        1 => "info".to_string(),
        2 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let json = json || logging.json;
    tracing_subscriber::registry()
        .with(filter)
        .with(
            json.then(|| {
                fmt::layer()
                    .json()
                    .with_target(false)
                    .with_writer(std::io::stderr)
            }),
        )
        .with((!json).then(|| fmt::layer().with_target(false).with_writer(std::io::stderr)))
        .init();
}

async fn execute_command(cli: &Cli, config: ServiceConfig) -> Result<()> {
    if let Commands::CheckConfig = &cli.command {
        output::print_config_summary(&config, cli.json);
        return Ok(());
    }

    let fleet = Fleet::builder(config).build().await?;
    match &cli.command {
        Commands::CheckConfig => Ok(()),
        Commands::Devices => {
            commands::device::list(&fleet, cli.json);
            Ok(())
        }
        Commands::Reachability { device } => {
            commands::device::reachability(&fleet, device, cli.json).await
        }
        Commands::Ledger(cmd) => commands::ledger::execute(cmd, &fleet, cli.json).await,
        Commands::Rollout(args) => commands::rollout::execute(args, &fleet, cli.json).await,
    }
}
