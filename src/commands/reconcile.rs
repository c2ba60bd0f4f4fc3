//! Reconcile command implementation.

use anyhow::Result;
use std::path::Path;

use crate::config::{Config, StorageConfig};
use crate::daemon::Daemon;
use crate::enforcer::check_root;
use crate::error::WardenError;
use crate::lock::LockGuard;
use crate::store::BanNotice;
use crate::sync::SyncEngine;

/// Apply every shared ban this node has not applied yet, then exit.
pub async fn run(config_path: &Path) -> Result<()> {
    check_root()?;

    let config = Config::load(config_path)?;
    let StorageConfig::Networked(ref networked) = config.storage else {
        return Err(WardenError::Storage("reconcile needs the networked backend".into()).into());
    };
    let sync_config = networked.sync.clone();

    let _lock = LockGuard::acquire()?;
    let daemon = Daemon::from_config(config)?;
    let sync = SyncEngine::new(daemon.engine().clone(), None, &sync_config);
    let enforcer = daemon.enforcer().clone();
    let store = daemon.engine().store().clone();

    let (applied, recent) = tokio::task::spawn_blocking(move || -> Result<(usize, Vec<BanNotice>)> {
        let applied = sync.reconcile()?;
        enforcer.persist_if_dirty()?;
        Ok((applied, store.recent()?))
    })
    .await??;

    println!("[OK] Applied {} ban(s) from other nodes", applied);
    if !recent.is_empty() {
        println!();
        println!("Latest fleet bans:");
        for notice in recent {
            println!("  {:<40} {}", notice.address, notice.origin_node);
        }
    }
    Ok(())
}
