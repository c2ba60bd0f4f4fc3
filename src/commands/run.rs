//! Run command implementation.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use crate::config::Config;
use crate::daemon::Daemon;
use crate::enforcer::check_root;
use crate::lock::LockGuard;
use crate::signal::{ShutdownGuard, ShutdownToken};

/// Run the daemon in the foreground until SIGINT/SIGTERM.
pub async fn run(config_path: &Path, once: bool) -> Result<()> {
    check_root()?;

    let mut config = Config::load(config_path)?;
    if once {
        config.run_once = true;
    }

    let _lock = LockGuard::acquire()?;

    info!(
        "Starting warden {} with {} rule(s) as '{}'",
        env!("CARGO_PKG_VERSION"),
        config.rules.len(),
        config.node_name()
    );

    let daemon = Daemon::from_config(config)?;

    let token = ShutdownToken::new();
    let _signals = ShutdownGuard::install(token.clone());

    daemon.run(token).await
}
