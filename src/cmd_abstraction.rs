//! Process execution seam for the firewall tools.
//!
//! iptables and friends are driven through [`CommandExecutor`] so the
//! enforcement logic can be tested against a mock instead of the host.

use anyhow::{Context, Result};
use std::io::Write;
use std::process::{Command, Output, Stdio};

#[cfg(test)]
use mockall::automock;

use crate::error::WardenError;

/// Captured result of one external command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit status was zero
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    fn from_output(output: Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }

    /// Turn a non-zero exit into a firewall error naming the program
    pub fn ensure_success(self, program: &str) -> Result<Self, WardenError> {
        if self.success {
            return Ok(self);
        }
        Err(WardenError::Firewall(format!(
            "{} exited with {}: {}",
            program,
            self.code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
            self.stderr.trim()
        )))
    }
}

/// Runs external programs.
///
/// Arguments are `&[String]` rather than `&[&str]` so the trait can be
/// mocked without lifetime gymnastics.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput>;

    /// Same as `execute`, feeding `stdin` to the child
    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput>;
}

/// Executor that spawns real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemExecutor;

impl CommandExecutor for SystemExecutor {
    fn execute(&self, cmd: &str, args: &[String]) -> Result<CommandOutput> {
        let output = Command::new(cmd)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute {}", cmd))?;
        Ok(CommandOutput::from_output(output))
    }

    fn execute_with_stdin(&self, cmd: &str, args: &[String], stdin: &str) -> Result<CommandOutput> {
        let mut child = Command::new(cmd)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", cmd))?;

        // The pipe is closed before waiting so the child sees EOF, and the
        // child is reaped even when the write fails
        let written = match child.stdin.take() {
            Some(mut pipe) => pipe.write_all(stdin.as_bytes()),
            None => Ok(()),
        };

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for {}", cmd))?;
        written.with_context(|| {
            format!(
                "Failed to write to {} stdin (exit code {:?})",
                cmd,
                output.status.code()
            )
        })?;
        Ok(CommandOutput::from_output(output))
    }
}

/// Owned argument list from string literals
pub fn args_to_strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
