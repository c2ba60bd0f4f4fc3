//! Configuration management for Warden.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::env;
use std::path::{Path, PathBuf};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::WardenError;
use crate::validation::{validate_ip_or_cidr, validate_node_name};

/// Default environment variable holding the Redis password
const PASSWORD_ENV: &str = "WARDEN_REDIS_PASSWORD";

/// Secure string type that zeroizes memory on drop
/// Used for sensitive data like the Redis password
#[derive(Clone, Default, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct SecureString(String);

impl SecureString {
    pub fn new(s: String) -> Self {
        Self(s)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Debug for SecureString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl From<&str> for SecureString {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// iptables target used for bans
    pub deny_action: DenyAction,

    /// Reload saved firewall snapshots at startup
    pub reload_firewall_rules_on_start: bool,

    /// Read every log once and exit instead of following it
    pub run_once: bool,

    /// Addresses/CIDRs never banned by any rule
    pub ignored_addresses: Vec<String>,

    /// Directory holding the `banned.v4` / `banned.v6` snapshots
    pub snapshot_dir: PathBuf,

    /// Seconds between snapshot passes (only written when dirty)
    pub persist_interval_seconds: u64,

    /// Tailer timing knobs
    pub tail: TailConfig,

    /// Ban storage backend
    pub storage: StorageConfig,

    /// Ban event log files
    pub logging: LoggingConfig,

    /// Rules by name
    pub rules: BTreeMap<String, RuleConfig>,
}

impl Default for Config {
    fn default() -> Self {
        let mut rules = BTreeMap::new();
        rules.insert("ssh".to_string(), RuleConfig::default());

        Self {
            deny_action: DenyAction::Drop,
            reload_firewall_rules_on_start: true,
            run_once: false,
            ignored_addresses: vec!["127.0.0.1".to_string(), "::1".to_string()],
            snapshot_dir: PathBuf::from("/var/lib/warden"),
            persist_interval_seconds: 300,
            tail: TailConfig::default(),
            storage: StorageConfig::default(),
            logging: LoggingConfig::default(),
            rules,
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), WardenError> {
        if self.rules.is_empty() {
            return Err(WardenError::Config("At least one rule must be configured".into()));
        }

        if self.persist_interval_seconds == 0 {
            return Err(WardenError::Config(
                "persist_interval_seconds must be at least 1".into(),
            ));
        }

        for entry in &self.ignored_addresses {
            validate_ip_or_cidr(entry).map_err(|e| WardenError::Config(e.to_string()))?;
        }

        for (name, rule) in &self.rules {
            rule.validate(name)?;
        }

        if let StorageConfig::Networked(ref networked) = self.storage {
            if networked.url.is_empty() {
                return Err(WardenError::Config("Networked storage requires a url".into()));
            }
            // Presence in the shared store is keyed by node name, so two
            // nodes sharing one would see each other's bans as their own
            validate_node_name(&networked.sync.node_name)
                .map_err(|e| WardenError::Config(e.to_string()))?;
            if networked.sync.enabled {
                if networked.sync.interval_seconds == 0 {
                    return Err(WardenError::Config(
                        "sync.interval_seconds must be at least 1".into(),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Whether the networked sync loop should run
    pub fn sync_enabled(&self) -> bool {
        matches!(self.storage, StorageConfig::Networked(ref n) if n.sync.enabled)
    }

    /// Name this node records as the origin of its bans
    pub fn node_name(&self) -> &str {
        match self.storage {
            StorageConfig::Networked(ref n) if !n.sync.node_name.is_empty() => &n.sync.node_name,
            _ => "local",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DenyAction {
    #[default]
    Drop,
    Reject,
}

impl DenyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenyAction::Drop => "DROP",
            DenyAction::Reject => "REJECT",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TailConfig {
    /// Sleep between end-of-file checks
    pub poll_interval_ms: u64,
    /// Pause after each line to bound CPU under bursts
    pub line_pause_micros: u64,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            line_pause_micros: 100,
        }
    }
}

/// Storage backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Local SQLite database
    Embedded(EmbeddedConfig),
    /// Shared Redis instance
    Networked(NetworkedConfig),
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Embedded(EmbeddedConfig::default())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddedConfig {
    pub path: PathBuf,
}

impl Default for EmbeddedConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/var/lib/warden/bans.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkedConfig {
    /// Redis URL, e.g. redis://10.0.0.5:6379/0
    pub url: String,
    /// Password can be set directly or via WARDEN_REDIS_PASSWORD env var
    pub password: SecureString,
    /// Environment variable name to read the password from (optional)
    pub password_env: Option<String>,
    pub sync: SyncConfig,
}

impl Default for NetworkedConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379/0".to_string(),
            password: SecureString::default(),
            password_env: None,
            sync: SyncConfig::default(),
        }
    }
}

impl NetworkedConfig {
    /// Get the effective password, checking env vars first
    pub fn get_password(&self) -> SecureString {
        if let Some(ref env_name) = self.password_env {
            if let Ok(val) = env::var(env_name) {
                return SecureString::new(val);
            }
        }
        if let Ok(val) = env::var(PASSWORD_ENV) {
            return SecureString::new(val);
        }
        self.password.clone()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub enabled: bool,
    /// Seconds between reconciliation scans
    pub interval_seconds: u64,
    /// Name of this node in the shared store
    pub node_name: String,
    /// Milliseconds between propagation drains
    pub poll_interval_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_seconds: 60,
            node_name: String::new(),
            poll_interval_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Append ban events to hourly files under `directory`
    pub enabled: bool,
    pub directory: PathBuf,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            directory: PathBuf::from("/var/log/warden"),
        }
    }
}

/// Where a log line keeps its address and timestamp captures
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogShape {
    /// syslog style: group 1 = timestamp, group 2 = address
    #[default]
    Auth,
    /// access-log style: group 1 = address, group 2 = timestamp, group 4 = status
    Web,
}

/// One pattern entry of a rule
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatternConfig {
    /// Expression used as written
    Literal { regex: String },
    /// `{}` in the expression is replaced by an alternation of `values`
    Template { regex: String, values: Vec<String> },
    /// Like `template` (values optional); a single match bans
    InstantBan {
        regex: String,
        #[serde(default)]
        values: Vec<String>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConfig {
    pub log_files: Vec<PathBuf>,
    pub shape: LogShape,
    pub patterns: Vec<PatternConfig>,
    /// chrono format of the timestamp capture; a missing year means "this year"
    pub time_format: String,
    pub window_seconds: u64,
    pub failure_threshold: u32,
    /// Status codes that count as offenses (web rules)
    pub http_status_allow_list: Vec<u16>,
    pub ignored_addresses: Vec<String>,
}

impl Default for RuleConfig {
    fn default() -> Self {
        Self {
            log_files: vec![PathBuf::from("/var/log/auth.log")],
            shape: LogShape::Auth,
            patterns: vec![
                PatternConfig::Literal {
                    regex: r"^(\w{3}\s+\d{1,2} \d{2}:\d{2}:\d{2}) \S+ sshd\[\d+\]: Failed password for (?:invalid user )?\S+ from (\S+) port".to_string(),
                },
                PatternConfig::InstantBan {
                    regex: r"^(\w{3}\s+\d{1,2} \d{2}:\d{2}:\d{2}) \S+ sshd\[\d+\]: Invalid user (?:{}) from (\S+)".to_string(),
                    values: vec!["admin".to_string(), "oracle".to_string(), "test".to_string()],
                },
            ],
            time_format: "%b %e %H:%M:%S".to_string(),
            window_seconds: 300,
            failure_threshold: 5,
            http_status_allow_list: Vec::new(),
            ignored_addresses: Vec::new(),
        }
    }
}

impl RuleConfig {
    fn validate(&self, name: &str) -> Result<(), WardenError> {
        let fail = |msg: String| Err(WardenError::Config(format!("Rule '{}': {}", name, msg)));

        if self.log_files.is_empty() {
            return fail("no log_files configured".into());
        }
        if self.patterns.is_empty() {
            return fail("no patterns configured".into());
        }
        if self.time_format.is_empty() {
            return fail("time_format cannot be empty".into());
        }
        if self.window_seconds == 0 {
            return fail("window_seconds must be at least 1".into());
        }
        if self.failure_threshold == 0 {
            return fail("failure_threshold must be at least 1".into());
        }
        if self.shape == LogShape::Web && self.http_status_allow_list.is_empty() {
            return fail("web rules need a non-empty http_status_allow_list".into());
        }
        for entry in &self.ignored_addresses {
            if let Err(e) = validate_ip_or_cidr(entry) {
                return fail(e.to_string());
            }
        }
        Ok(())
    }
}
