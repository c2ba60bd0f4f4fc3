//! Restore command implementation.

use anyhow::Result;
use std::path::Path;

use crate::config::Config;
use crate::enforcer::{check_root, Enforcer, IptablesFirewall};

/// Reload saved firewall snapshots.
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    let config = Config::load(config_path)?;
    let enforcer = Enforcer::new(
        Box::new(IptablesFirewall::new()),
        config.deny_action,
        config.snapshot_dir.clone(),
    );

    match enforcer.restore()? {
        0 => println!("No snapshots found in {}", config.snapshot_dir.display()),
        n => println!("[OK] Restored {} snapshot(s)", n),
    }
    Ok(())
}
