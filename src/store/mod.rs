//! Ban storage backends (SQLite, Redis) behind one contract.

mod redis;
mod sqlite;

#[cfg(test)]
pub mod memory;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::info;

pub use self::redis::{RedisChannel, RedisStore, CHANNEL, RECENT_BANS_KEY};
pub use self::sqlite::SqliteStore;

use crate::config::{Config, StorageConfig};
use crate::validation::{classify_address, validate_node_name};

/// Result of an insert; a duplicate is an expected outcome, not an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// A persisted ban
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanRecord {
    pub address: IpAddr,
    pub reason: String,
    pub origin_node: String,
    pub country: Option<String>,
    pub banned_at: Option<NaiveDateTime>,
}

/// Uniform contract over the embedded and the networked backend.
pub trait BanStore: Send + Sync {
    /// Record a ban originating on this node.
    fn insert(&self, address: IpAddr, reason: &str, country: Option<&str>) -> Result<InsertOutcome>;

    /// Look up a ban that applies to this node.
    fn select(&self, address: IpAddr) -> Result<Option<BanRecord>>;

    /// Bans present in the store but not yet applied on this node.
    fn scan(&self) -> Result<Vec<BanRecord>>;

    /// Record that this node has applied a ban.
    fn mark_applied(&self, address: IpAddr) -> Result<()>;

    /// Name this node records as origin.
    fn node_name(&self) -> &str;

    /// Most recent bans first recorded in the store, newest first. Only the
    /// networked backend keeps this list.
    fn recent(&self) -> Result<Vec<BanNotice>> {
        Ok(Vec::new())
    }
}

/// A ban announcement on the broadcast channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BanNotice {
    pub address: IpAddr,
    pub origin_node: String,
}

impl BanNotice {
    /// Parse a `"<address> <origin_node>"` payload.
    pub fn parse(payload: &str) -> Option<Self> {
        let (address, origin) = payload.trim().split_once(' ')?;
        let origin = origin.trim();
        if origin.is_empty() {
            return None;
        }
        Some(Self {
            address: classify_address(address)?,
            origin_node: origin.to_string(),
        })
    }

    pub fn payload(&self) -> String {
        format!("{} {}", self.address, self.origin_node)
    }
}

/// Best-effort broadcast of ban notices between nodes.
pub trait BanChannel: Send + Sync {
    /// Announce a ban originating on this node.
    fn publish(&self, address: IpAddr) -> Result<()>;

    /// Take every notice received so far without blocking.
    fn drain(&self) -> Vec<BanNotice>;
}

/// Storage handles built from configuration
pub struct Backends {
    pub store: Arc<dyn BanStore>,
    /// Present only with the networked backend
    pub channel: Option<Arc<dyn BanChannel>>,
}

/// Open the configured backend. The channel subscribes only when sync is on.
pub fn open(config: &Config) -> Result<Backends> {
    let node = config.node_name().to_string();

    match config.storage {
        StorageConfig::Embedded(ref embedded) => {
            let store = SqliteStore::open(&embedded.path, &node)
                .with_context(|| format!("Failed to open ban database {:?}", embedded.path))?;
            info!("Using embedded ban store at {:?}", embedded.path);
            Ok(Backends {
                store: Arc::new(store),
                channel: None,
            })
        }
        StorageConfig::Networked(ref networked) => {
            validate_node_name(&node)?;
            let client = self::redis::client(networked)?;
            let store = RedisStore::new(client.clone(), &node);
            let channel = if networked.sync.enabled {
                RedisChannel::subscribe(client, &node)
            } else {
                RedisChannel::new(client, &node)
            };
            info!("Using networked ban store as node '{}'", node);
            Ok(Backends {
                store: Arc::new(store),
                channel: Some(Arc::new(channel)),
            })
        }
    }
}
