//! Command implementations for fleetlined

pub mod device;
pub mod ledger;
pub mod rollout;

use std::path::PathBuf;

use clap::{Args, Subcommand};

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// List a device's configuration versions
    Show {
        /// Device ID
        device: String,
    },

    /// Append a PENDING configuration version
    Propose {
        /// Device ID
        device: String,
        /// YAML or JSON file with the settings mapping
        bundle: PathBuf,
        /// Operator notes
        #[arg(short = 'm', long)]
        change_log: Option<String>,
    },
}

#[derive(Args)]
#[group(required = true, multiple = false)]
pub struct RolloutTarget {
    /// Firmware record to install
    #[arg(long)]
    pub firmware: Option<String>,

    /// Configuration version to apply, by number or row id
    #[arg(long)]
    pub configuration: Option<String>,
}

#[derive(Args)]
pub struct RolloutArgs {
    /// Device ID
    pub device: String,

    #[command(flatten)]
    pub target: RolloutTarget,

    /// Skip the device-type and production checks
    #[arg(long)]
    pub force: bool,

    /// Trust the version the device announces after restart
    #[arg(long)]
    pub skip_verification: bool,

    /// Bytes per transfer chunk
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Overall session deadline in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Run preflight checks only
    #[arg(long)]
    pub dry_run: bool,
}
