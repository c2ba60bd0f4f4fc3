//! Human-readable record of ban events.
//!
//! Every ban goes to `tracing`. With file logging enabled it is also appended
//! to an hourly file: `directory/YYYY-MM/YYYY-MM-DD/YYYY-MM-DD-HH.log`.

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::LoggingConfig;

#[derive(Debug, Clone, Default)]
pub struct BanLog {
    directory: Option<PathBuf>,
}

impl BanLog {
    pub fn new(config: &LoggingConfig) -> Self {
        Self {
            directory: config.enabled.then(|| config.directory.clone()),
        }
    }

    /// Hourly file holding events that happened at `at`
    pub fn path_for(directory: &Path, at: NaiveDateTime) -> PathBuf {
        directory
            .join(at.format("%Y-%m").to_string())
            .join(at.format("%Y-%m-%d").to_string())
            .join(format!("{}.log", at.format("%Y-%m-%d-%H")))
    }

    /// Log a ban applied on this node. `origin` is the node that decided it.
    pub fn record(&self, address: IpAddr, reason: &str, origin: &str) {
        info!(%address, origin, "Banned {}: {}", address, reason);

        let Some(directory) = &self.directory else {
            return;
        };
        let now = Local::now().naive_local();
        let line = format!(
            "{}: {} banned and firewall rules updated ({}, origin {})\n",
            now.format("%Y-%m-%d %H:%M:%S"),
            address,
            reason,
            origin
        );
        if let Err(e) = append(&Self::path_for(directory, now), &line) {
            warn!("Failed to write ban log: {:#}", e);
        }
    }
}

fn append(path: &Path, line: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {:?}", parent))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {:?}", path))?;
    file.write_all(line.as_bytes())?;
    Ok(())
}
