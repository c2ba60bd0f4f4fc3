//! CLI argument parsing with clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "warden")]
#[command(author, version, about = "Log-driven intrusion prevention with fleet-wide ban sync")]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config file path
    #[arg(short, long, default_value = "/etc/warden/config.yaml", global = true)]
    pub config: PathBuf,

    /// Quiet mode (errors only)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Verbose mode (debug output)
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Tail the configured logs and ban offenders
    Run {
        /// Read every log once and exit instead of following
        #[arg(long)]
        once: bool,
    },

    /// Validate the configuration and compile every pattern
    Check,

    /// Apply bans recorded by other nodes, then exit
    Reconcile,

    /// Reload saved firewall snapshots
    Restore,

    /// Show version information
    Version,
}
