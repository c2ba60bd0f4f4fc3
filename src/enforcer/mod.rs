//! Firewall enforcement and rule snapshot persistence.

mod iptables;

use anyhow::Result;
use std::fmt;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

pub use iptables::IptablesFirewall;

use crate::config::DenyAction;
use crate::signal::ShutdownToken;

/// Address family; selects iptables vs ip6tables and the snapshot file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub const ALL: [IpVersion; 2] = [IpVersion::V4, IpVersion::V6];

    pub fn of(address: IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => IpVersion::V4,
            IpAddr::V6(_) => IpVersion::V6,
        }
    }

    pub fn snapshot_file(self) -> &'static str {
        match self {
            IpVersion::V4 => "banned.v4",
            IpVersion::V6 => "banned.v6",
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => f.write_str("IPv4"),
            IpVersion::V6 => f.write_str("IPv6"),
        }
    }
}

/// Host firewall collaborator
#[cfg_attr(test, automock)]
pub trait Firewall: Send + Sync {
    /// Block inbound traffic from `address`. Must be harmless when the
    /// rule already exists.
    fn deny(&self, address: IpAddr, version: IpVersion, action: DenyAction) -> Result<()>;

    /// Save the current rule set of one family to `path`
    fn snapshot(&self, version: IpVersion, path: &Path) -> Result<()>;

    /// Load a saved rule set of one family from `path`
    fn restore(&self, version: IpVersion, path: &Path) -> Result<()>;
}

/// Serializes firewall calls and tracks whether a snapshot is due.
pub struct Enforcer {
    firewall: Box<dyn Firewall>,
    action: DenyAction,
    snapshot_dir: PathBuf,
    dirty: AtomicBool,
}

impl Enforcer {
    pub fn new(firewall: Box<dyn Firewall>, action: DenyAction, snapshot_dir: PathBuf) -> Self {
        Self {
            firewall,
            action,
            snapshot_dir,
            dirty: AtomicBool::new(false),
        }
    }

    /// Apply a deny rule. Marks the rule set dirty only on success.
    pub fn enforce(&self, address: IpAddr) -> Result<()> {
        let version = IpVersion::of(address);
        self.firewall.deny(address, version, self.action)?;
        self.dirty.store(true, Ordering::SeqCst);
        info!("Denied {} ({}, {})", address, version, self.action.as_str());
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn snapshot_path(&self, version: IpVersion) -> PathBuf {
        self.snapshot_dir.join(version.snapshot_file())
    }

    /// Snapshot both families if anything changed since the last snapshot.
    /// On failure the dirty flag is restored so the next tick retries.
    pub fn persist_if_dirty(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        for version in IpVersion::ALL {
            let path = self.snapshot_path(version);
            if let Err(e) = self.firewall.snapshot(version, &path) {
                self.dirty.store(true, Ordering::SeqCst);
                return Err(e);
            }
        }
        debug!("Saved firewall snapshots to {:?}", self.snapshot_dir);
        Ok(true)
    }

    /// Reload every snapshot file that exists. Returns how many were loaded.
    pub fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for version in IpVersion::ALL {
            let path = self.snapshot_path(version);
            if !path.exists() {
                debug!("No {} snapshot at {:?}", version, path);
                continue;
            }
            self.firewall.restore(version, &path)?;
            info!("Restored {} rules from {:?}", version, path);
            restored += 1;
        }
        Ok(restored)
    }

    /// Periodic persistence until shutdown.
    pub async fn run_persistence(self: Arc<Self>, interval: Duration, token: ShutdownToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let enforcer = Arc::clone(&self);
            match tokio::task::spawn_blocking(move || enforcer.persist_if_dirty()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("Failed to save firewall snapshots: {:#}", e),
                Err(e) => warn!("Snapshot task failed: {}", e),
            }
        }
    }
}

/// Flushes pending snapshot state when dropped, however the daemon exits.
pub struct PersistGuard {
    enforcer: Arc<Enforcer>,
}

impl PersistGuard {
    pub fn new(enforcer: Arc<Enforcer>) -> Self {
        Self { enforcer }
    }
}

impl Drop for PersistGuard {
    fn drop(&mut self) {
        match self.enforcer.persist_if_dirty() {
            Ok(true) => info!("Saved firewall snapshots on shutdown"),
            Ok(false) => {}
            Err(e) => warn!("Failed to save firewall snapshots on shutdown: {:#}", e),
        }
    }
}

/// Check if running as root (effective UID == 0)
///
/// Installing iptables rules needs CAP_NET_ADMIN; checking for UID 0 covers
/// the usual case of running under sudo or as a system service.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid() has no preconditions, never fails, and doesn't
    // modify any state.
    let euid = unsafe { libc::geteuid() };

    if euid != 0 {
        anyhow::bail!(
            "This operation requires root privileges. Please run with sudo.\n\
             Alternatively, ensure the process has the CAP_NET_ADMIN capability."
        )
    }
    Ok(())
}
