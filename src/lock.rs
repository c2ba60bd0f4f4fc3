//! Single-instance lock for the daemon.
//!
//! Two daemons on one host would race on the firewall and the snapshot
//! files, so `run` holds an flock-style advisory lock for its lifetime.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "/var/run/warden.lock";

/// Holds an exclusive lock; released when dropped.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

impl LockGuard {
    /// Lock the default path.
    pub fn acquire() -> Result<Self> {
        Self::acquire_at(LOCK_FILE)
    }

    /// Lock `path`, failing fast if another instance holds it.
    ///
    /// The file is opened without truncation so creating and locking it
    /// cannot race with a competing instance.
    pub fn acquire_at<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file: {}", path.display()))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("Failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "Another warden instance is already running (lock held on {}).",
                path.display()
            )
        })?;

        Ok(Self {
            _file: file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
