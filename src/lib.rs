//! # Warden - log-driven intrusion prevention for Linux hosts
//!
//! Warden follows authentication and access logs, extracts offending source
//! addresses with configurable patterns, counts offenses per address inside a
//! sliding window, and bans through iptables/ip6tables once a rule's
//! threshold (or an instant-ban pattern) is hit. With the networked backend,
//! bans are shared across a fleet through Redis: announced over pub/sub and
//! reconciled by periodic scans so every node converges.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Warden                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  CLI (clap): run, check, reconcile, restore, version        │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Daemon: one tail worker per log file, persistence timer,   │
//! │          sync loop                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Tailer ──▶ PatternEngine ──▶ BanEngine (OffenseTracker)    │
//! │                                  │                          │
//! │                   ┌──────────────┼──────────────┐           │
//! │                   ▼              ▼              ▼           │
//! │              Enforcer        BanStore      BanChannel       │
//! │             (iptables)   (SQLite/Redis)   (Redis pub/sub)   │
//! ├─────────────────────────────────────────────────────────────┤
//! │  SyncEngine: drain notices + reconcile ──▶ BanEngine        │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```no_run
//! use warden::config::Config;
//! use warden::daemon::Daemon;
//! use warden::enforcer::check_root;
//! use warden::signal::{ShutdownGuard, ShutdownToken};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     check_root()?;
//!
//!     let config = Config::load("/etc/warden/config.yaml")?;
//!     let daemon = Daemon::from_config(config)?;
//!
//!     let token = ShutdownToken::new();
//!     let _signals = ShutdownGuard::install(token.clone());
//!     daemon.run(token).await
//! }
//! ```
//!
//! ## Modules
//!
//! - [`banlog`] - Human-readable ban event log
//! - [`cli`] - Command-line interface definitions
//! - [`cmd_abstraction`] - Process execution seam for firewall tools
//! - [`commands`] - CLI command implementations
//! - [`config`] - Configuration parsing and validation
//! - [`daemon`] - Worker lifecycle and shutdown
//! - [`dns`] - Hostname resolution for captured names
//! - [`enforcer`] - Firewall enforcement and snapshot persistence
//! - [`engine`] - Ban decisions under a single lock
//! - [`lock`] - Single-instance lock file
//! - [`pattern`] - Rule compilation and offense extraction
//! - [`signal`] - Graceful shutdown signal handling
//! - [`store`] - Ban storage backends (SQLite, Redis)
//! - [`sync`] - Fleet ban propagation and reconciliation
//! - [`tail`] - Rotation-aware log following
//! - [`tracker`] - Sliding-window offense counting

pub mod banlog;
pub mod cli;
pub mod cmd_abstraction;
pub mod commands;
pub mod config;
pub mod daemon;
pub mod dns;
pub mod enforcer;
pub mod engine;
pub mod error;
pub mod lock;
pub mod pattern;
pub mod signal;
pub mod store;
pub mod sync;
pub mod tail;
pub mod tracker;
pub mod validation;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use error::WardenError;
