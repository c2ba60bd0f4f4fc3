//! iptables / ip6tables backend.

use anyhow::{Context, Result};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::debug;

use super::{Firewall, IpVersion};
use crate::cmd_abstraction::{args_to_strings, CommandExecutor, SystemExecutor};
use crate::config::DenyAction;

const CHAIN: &str = "INPUT";

fn iptables(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "iptables",
        IpVersion::V6 => "ip6tables",
    }
}

fn iptables_save(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "iptables-save",
        IpVersion::V6 => "ip6tables-save",
    }
}

fn iptables_restore(version: IpVersion) -> &'static str {
    match version {
        IpVersion::V4 => "iptables-restore",
        IpVersion::V6 => "ip6tables-restore",
    }
}

/// Inserts one `-s <address> -j <action>` rule per ban at the head of INPUT
pub struct IptablesFirewall {
    executor: Box<dyn CommandExecutor>,
}

impl IptablesFirewall {
    pub fn new() -> Self {
        Self::with_executor(Box::new(SystemExecutor))
    }

    pub fn with_executor(executor: Box<dyn CommandExecutor>) -> Self {
        Self { executor }
    }

    fn rule_args(op: &str, address: IpAddr, action: DenyAction) -> Vec<String> {
        let source = address.to_string();
        args_to_strings(&[op, CHAIN, "-s", &source, "-j", action.as_str()])
    }
}

impl Default for IptablesFirewall {
    fn default() -> Self {
        Self::new()
    }
}

impl Firewall for IptablesFirewall {
    fn deny(&self, address: IpAddr, version: IpVersion, action: DenyAction) -> Result<()> {
        let program = iptables(version);

        // -C exits non-zero when the rule is absent
        let check = self
            .executor
            .execute(program, &Self::rule_args("-C", address, action))?;
        if check.success {
            debug!("{} already denied, rule exists", address);
            return Ok(());
        }

        self.executor
            .execute(program, &Self::rule_args("-I", address, action))?
            .ensure_success(program)?;
        Ok(())
    }

    fn snapshot(&self, version: IpVersion, path: &Path) -> Result<()> {
        let program = iptables_save(version);
        let output = self.executor.execute(program, &[])?.ensure_success(program)?;

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {:?}", dir))?;

        // Write to a sibling temp file then rename, so a crash never leaves
        // a truncated snapshot behind
        let mut file = NamedTempFile::new_in(dir)
            .with_context(|| format!("Failed to create temp file in {:?}", dir))?;
        file.write_all(output.stdout.as_bytes())?;
        file.as_file().sync_all()?;
        file.as_file()
            .set_permissions(fs::Permissions::from_mode(0o600))?;
        file.persist(path)
            .with_context(|| format!("Failed to write snapshot {:?}", path))?;
        Ok(())
    }

    fn restore(&self, version: IpVersion, path: &Path) -> Result<()> {
        let rules = fs::read_to_string(path)
            .with_context(|| format!("Failed to read snapshot {:?}", path))?;
        let program = iptables_restore(version);
        self.executor
            .execute_with_stdin(program, &[], &rules)?
            .ensure_success(program)?;
        Ok(())
    }
}
