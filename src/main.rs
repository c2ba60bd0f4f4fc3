//! Warden - log-driven intrusion prevention for Linux hosts.

use anyhow::Result;
use clap::Parser;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use warden::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        Level::DEBUG
    } else if cli.quiet {
        Level::ERROR
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run { once } => warden::commands::run::run(&cli.config, once).await,
        Commands::Check => warden::commands::check::run(&cli.config).await,
        Commands::Reconcile => warden::commands::reconcile::run(&cli.config).await,
        Commands::Restore => warden::commands::restore::run(&cli.config).await,
        Commands::Version => {
            println!("warden {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}
