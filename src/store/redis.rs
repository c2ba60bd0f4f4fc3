//! Networked Redis backend and the pub/sub ban channel.
//!
//! Each banned address is a hash keyed by the address itself. The hash holds
//! `reason`, `origin_node`, optionally `country`, and one field per node that
//! has applied the ban (field name = node name, value = local time applied).

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use redis::{Commands, Connection, IntoConnectionInfo, RedisResult};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use super::{BanChannel, BanNotice, BanRecord, BanStore, InsertOutcome};
use crate::config::NetworkedConfig;
use crate::validation::classify_address;

/// Pub/sub channel carrying `"<address> <origin_node>"` notices
pub const CHANNEL: &str = "warden:bans";

/// Capped list of `"<address> <origin_node>"` for the latest first claims
pub const RECENT_BANS_KEY: &str = "latest_10_keys";
const RECENT_BANS_LEN: isize = 10;

const FIELD_REASON: &str = "reason";
const FIELD_ORIGIN: &str = "origin_node";
const FIELD_COUNTRY: &str = "country";
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SUBSCRIBE_READ_TIMEOUT: Duration = Duration::from_secs(1);
const SUBSCRIBE_MAX_BACKOFF: Duration = Duration::from_secs(60);
const SCAN_COUNT: usize = 500;

/// Build a client from config, applying the password from env or file
pub(super) fn client(config: &NetworkedConfig) -> Result<redis::Client> {
    let mut info = config
        .url
        .as_str()
        .into_connection_info()
        .with_context(|| format!("Invalid redis url '{}'", config.url))?;

    let password = config.get_password();
    if !password.is_empty() {
        info.redis.password = Some(password.as_str().to_string());
    }

    redis::Client::open(info).context("Failed to create redis client")
}

/// One lazily (re)established connection
struct Link {
    client: redis::Client,
    conn: Mutex<Option<Connection>>,
}

impl Link {
    fn new(client: redis::Client) -> Self {
        Self {
            client,
            conn: Mutex::new(None),
        }
    }

    /// Run `f` on the connection, reconnecting first if the last one broke
    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> RedisResult<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("redis connection lock poisoned"))?;

        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self
                .client
                .get_connection_with_timeout(CONNECT_TIMEOUT)
                .context("Failed to connect to redis")?,
        };

        match f(&mut conn) {
            Ok(value) => {
                *guard = Some(conn);
                Ok(value)
            }
            Err(e) => {
                if !(e.is_io_error() || e.is_connection_dropped() || e.is_timeout()) {
                    *guard = Some(conn);
                }
                Err(e.into())
            }
        }
    }
}

fn now_text() -> String {
    Local::now().format(TIME_FORMAT).to_string()
}

fn record_from(address: IpAddr, mut fields: HashMap<String, String>, node: &str) -> BanRecord {
    let banned_at = fields
        .get(node)
        .and_then(|t| NaiveDateTime::parse_from_str(t, TIME_FORMAT).ok());
    BanRecord {
        address,
        reason: fields.remove(FIELD_REASON).unwrap_or_default(),
        origin_node: fields
            .remove(FIELD_ORIGIN)
            .unwrap_or_else(|| "unknown".to_string()),
        country: fields.remove(FIELD_COUNTRY),
        banned_at,
    }
}

/// Redis-backed ban store shared by all nodes
pub struct RedisStore {
    link: Link,
    node: String,
}

impl RedisStore {
    pub fn new(client: redis::Client, node: &str) -> Self {
        Self {
            link: Link::new(client),
            node: node.to_string(),
        }
    }
}

impl BanStore for RedisStore {
    /// Claims the ban with HSETNX on `origin_node`; losing the claim still
    /// marks this node as having applied it.
    fn insert(&self, address: IpAddr, reason: &str, country: Option<&str>) -> Result<InsertOutcome> {
        let key = address.to_string();
        let applied = now_text();

        self.link.with_conn(|con| {
            let claimed: bool = con.hset_nx(&key, FIELD_ORIGIN, &self.node)?;
            if !claimed {
                con.hset::<_, _, _, ()>(&key, &self.node, &applied)?;
                return Ok(InsertOutcome::Duplicate);
            }

            let mut fields = vec![(self.node.as_str(), applied.as_str()), (FIELD_REASON, reason)];
            if let Some(country) = country {
                fields.push((FIELD_COUNTRY, country));
            }
            con.hset_multiple::<_, _, _, ()>(&key, &fields)?;

            let notice = BanNotice {
                address,
                origin_node: self.node.clone(),
            };
            con.lpush::<_, _, ()>(RECENT_BANS_KEY, notice.payload())?;
            con.ltrim::<_, ()>(RECENT_BANS_KEY, 0, RECENT_BANS_LEN - 1)?;
            Ok(InsertOutcome::Inserted)
        })
    }

    /// Only bans this node has applied count as present here
    fn select(&self, address: IpAddr) -> Result<Option<BanRecord>> {
        let fields: HashMap<String, String> = self
            .link
            .with_conn(|con| con.hgetall(address.to_string()))?;

        if !fields.contains_key(&self.node) {
            return Ok(None);
        }
        Ok(Some(record_from(address, fields, &self.node)))
    }

    fn scan(&self) -> Result<Vec<BanRecord>> {
        self.link.with_conn(|con| {
            let mut keys = Vec::new();
            let mut cursor: u64 = 0;
            loop {
                let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                    .cursor_arg(cursor)
                    .arg("COUNT")
                    .arg(SCAN_COUNT)
                    .query(con)?;
                keys.extend(batch);
                if next == 0 {
                    break;
                }
                cursor = next;
            }

            let mut pending = Vec::new();
            for key in keys {
                let Some(address) = classify_address(&key) else {
                    continue;
                };
                let kind: String = con.key_type(&key)?;
                if kind != "hash" {
                    continue;
                }
                let fields: HashMap<String, String> = con.hgetall(&key)?;
                if fields.is_empty() || fields.contains_key(&self.node) {
                    continue;
                }
                pending.push(record_from(address, fields, &self.node));
            }
            Ok(pending)
        })
    }

    fn mark_applied(&self, address: IpAddr) -> Result<()> {
        let applied = now_text();
        self.link
            .with_conn(|con| con.hset::<_, _, _, ()>(address.to_string(), &self.node, &applied))
    }

    fn node_name(&self) -> &str {
        &self.node
    }

    fn recent(&self) -> Result<Vec<BanNotice>> {
        let entries: Vec<String> = self
            .link
            .with_conn(|con| con.lrange(RECENT_BANS_KEY, 0, RECENT_BANS_LEN - 1))?;
        Ok(entries.iter().filter_map(|e| BanNotice::parse(e)).collect())
    }
}

/// Publishes local bans and, when subscribed, collects notices from peers
pub struct RedisChannel {
    link: Link,
    node: String,
    inbox: Option<Mutex<mpsc::Receiver<BanNotice>>>,
}

impl RedisChannel {
    /// Publish-only channel
    pub fn new(client: redis::Client, node: &str) -> Self {
        Self {
            link: Link::new(client),
            node: node.to_string(),
            inbox: None,
        }
    }

    /// Channel with a background subscriber feeding the inbox
    pub fn subscribe(client: redis::Client, node: &str) -> Self {
        let (tx, rx) = mpsc::channel();
        let subscriber = client.clone();
        let spawned = thread::Builder::new()
            .name("warden-subscriber".to_string())
            .spawn(move || subscriber_loop(subscriber, tx));
        if let Err(e) = spawned {
            warn!("Failed to start ban channel subscriber: {}", e);
        }

        Self {
            link: Link::new(client),
            node: node.to_string(),
            inbox: Some(Mutex::new(rx)),
        }
    }
}

impl BanChannel for RedisChannel {
    fn publish(&self, address: IpAddr) -> Result<()> {
        let notice = BanNotice {
            address,
            origin_node: self.node.clone(),
        };
        let receivers: i64 = self
            .link
            .with_conn(|con| con.publish(CHANNEL, notice.payload()))?;
        debug!("Published ban of {} to {} subscriber(s)", address, receivers);
        Ok(())
    }

    fn drain(&self) -> Vec<BanNotice> {
        let Some(inbox) = &self.inbox else {
            return Vec::new();
        };
        match inbox.lock() {
            Ok(rx) => rx.try_iter().collect(),
            Err(_) => Vec::new(),
        }
    }
}

/// Keep a subscription alive until the receiving side is dropped.
/// Notices missed while disconnected are picked up by reconciliation.
fn subscriber_loop(client: redis::Client, tx: mpsc::Sender<BanNotice>) {
    let mut backoff = Duration::from_secs(1);
    loop {
        match listen(&client, &tx, &mut backoff) {
            Ok(()) => return,
            Err(e) => {
                warn!(
                    "Ban channel subscription lost: {}, retrying in {}s",
                    e,
                    backoff.as_secs()
                );
                thread::sleep(backoff);
                backoff = (backoff * 2).min(SUBSCRIBE_MAX_BACKOFF);
            }
        }
    }
}

fn listen(
    client: &redis::Client,
    tx: &mpsc::Sender<BanNotice>,
    backoff: &mut Duration,
) -> RedisResult<()> {
    let mut con = client.get_connection_with_timeout(CONNECT_TIMEOUT)?;
    let mut pubsub = con.as_pubsub();
    pubsub.subscribe(CHANNEL)?;
    pubsub.set_read_timeout(Some(SUBSCRIBE_READ_TIMEOUT))?;
    *backoff = Duration::from_secs(1);
    debug!("Subscribed to {}", CHANNEL);

    loop {
        let msg = match pubsub.get_message() {
            Ok(msg) => msg,
            Err(e) if e.is_timeout() => continue,
            Err(e) => return Err(e),
        };

        let payload: String = msg.get_payload()?;
        match BanNotice::parse(&payload) {
            Some(notice) => {
                if tx.send(notice).is_err() {
                    return Ok(());
                }
            }
            None => debug!("Ignoring malformed ban notice '{}'", payload),
        }
    }
}
