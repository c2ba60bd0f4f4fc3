//! In-process stand-in for the networked backend, shared between simulated
//! nodes in tests. Mirrors the Redis hash layout and claim semantics.

use anyhow::{bail, Result};
use chrono::Local;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};

use super::{BanChannel, BanNotice, BanRecord, BanStore, InsertOutcome};

const ORIGIN: &str = "origin_node";
const REASON: &str = "reason";
const COUNTRY: &str = "country";

/// State shared by every node attached to the same "server"
#[derive(Default)]
pub struct SharedBackend {
    hashes: Mutex<HashMap<IpAddr, HashMap<String, String>>>,
    subscribers: Mutex<Vec<mpsc::Sender<BanNotice>>>,
    offline: AtomicBool,
}

impl SharedBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every store and channel operation fail until cleared
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn store(self: &Arc<Self>, node: &str) -> MemoryStore {
        MemoryStore {
            shared: Arc::clone(self),
            node: node.to_string(),
        }
    }

    pub fn channel(self: &Arc<Self>, node: &str) -> MemoryChannel {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().unwrap().push(tx);
        MemoryChannel {
            shared: Arc::clone(self),
            node: node.to_string(),
            inbox: Mutex::new(rx),
        }
    }

    /// Raw field access for assertions
    pub fn fields(&self, address: IpAddr) -> HashMap<String, String> {
        self.hashes
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_default()
    }

    fn check_online(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            bail!("backend offline");
        }
        Ok(())
    }
}

fn record(address: IpAddr, fields: &HashMap<String, String>) -> BanRecord {
    BanRecord {
        address,
        reason: fields.get(REASON).cloned().unwrap_or_default(),
        origin_node: fields.get(ORIGIN).cloned().unwrap_or_default(),
        country: fields.get(COUNTRY).cloned(),
        banned_at: None,
    }
}

pub struct MemoryStore {
    shared: Arc<SharedBackend>,
    node: String,
}

impl BanStore for MemoryStore {
    fn insert(&self, address: IpAddr, reason: &str, country: Option<&str>) -> Result<InsertOutcome> {
        self.shared.check_online()?;
        let mut hashes = self.shared.hashes.lock().unwrap();
        let fields = hashes.entry(address).or_default();
        let applied = Local::now().to_string();

        if fields.contains_key(ORIGIN) {
            fields.insert(self.node.clone(), applied);
            return Ok(InsertOutcome::Duplicate);
        }
        fields.insert(ORIGIN.to_string(), self.node.clone());
        fields.insert(REASON.to_string(), reason.to_string());
        if let Some(country) = country {
            fields.insert(COUNTRY.to_string(), country.to_string());
        }
        fields.insert(self.node.clone(), applied);
        Ok(InsertOutcome::Inserted)
    }

    fn select(&self, address: IpAddr) -> Result<Option<BanRecord>> {
        self.shared.check_online()?;
        let hashes = self.shared.hashes.lock().unwrap();
        Ok(hashes
            .get(&address)
            .filter(|fields| fields.contains_key(&self.node))
            .map(|fields| record(address, fields)))
    }

    fn scan(&self) -> Result<Vec<BanRecord>> {
        self.shared.check_online()?;
        let hashes = self.shared.hashes.lock().unwrap();
        Ok(hashes
            .iter()
            .filter(|(_, fields)| !fields.contains_key(&self.node))
            .map(|(address, fields)| record(*address, fields))
            .collect())
    }

    fn mark_applied(&self, address: IpAddr) -> Result<()> {
        self.shared.check_online()?;
        let mut hashes = self.shared.hashes.lock().unwrap();
        hashes
            .entry(address)
            .or_default()
            .insert(self.node.clone(), Local::now().to_string());
        Ok(())
    }

    fn node_name(&self) -> &str {
        &self.node
    }
}

pub struct MemoryChannel {
    shared: Arc<SharedBackend>,
    node: String,
    inbox: Mutex<mpsc::Receiver<BanNotice>>,
}

impl BanChannel for MemoryChannel {
    /// Delivered to every attached channel, the publisher's own included
    fn publish(&self, address: IpAddr) -> Result<()> {
        self.shared.check_online()?;
        let notice = BanNotice {
            address,
            origin_node: self.node.clone(),
        };
        for tx in self.shared.subscribers.lock().unwrap().iter() {
            let _ = tx.send(notice.clone());
        }
        Ok(())
    }

    fn drain(&self) -> Vec<BanNotice> {
        self.inbox.lock().unwrap().try_iter().collect()
    }
}
