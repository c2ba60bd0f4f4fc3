//! Embedded SQLite backend.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

use super::{BanRecord, BanStore, InsertOutcome};

/// SQLite store: one row per banned address, unique on `address`
pub struct SqliteStore {
    conn: Mutex<Connection>,
    node: String,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`
    pub fn open<P: AsRef<Path>>(path: P, node: &str) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory {:?}", parent))?;
            }
        }
        let conn = Connection::open(path)?;
        Self::with_connection(conn, node)
    }

    /// Create an in-memory store (for testing and dry runs)
    pub fn in_memory(node: &str) -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?, node)
    }

    fn with_connection(conn: Connection, node: &str) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS bans (
                id INTEGER PRIMARY KEY,
                address TEXT NOT NULL UNIQUE,
                time_banned INTEGER NOT NULL,
                origin_node TEXT NOT NULL,
                reason TEXT NOT NULL,
                country TEXT
            )",
            [],
        )
        .context("Failed to create bans table")?;

        Ok(Self {
            conn: Mutex::new(conn),
            node: node.to_string(),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow::anyhow!("ban database lock poisoned"))
    }
}

impl BanStore for SqliteStore {
    fn insert(&self, address: IpAddr, reason: &str, country: Option<&str>) -> Result<InsertOutcome> {
        let conn = self.lock()?;
        let result = conn.execute(
            "INSERT INTO bans (address, time_banned, origin_node, reason, country)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                address.to_string(),
                Utc::now().timestamp(),
                self.node,
                reason,
                country
            ],
        );

        match result {
            Ok(_) => Ok(InsertOutcome::Inserted),
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                debug!("{} already in the ban database", address);
                Ok(InsertOutcome::Duplicate)
            }
            Err(e) => Err(e).context("Failed to insert ban"),
        }
    }

    fn select(&self, address: IpAddr) -> Result<Option<BanRecord>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT time_banned, origin_node, reason, country FROM bans WHERE address = ?1",
                params![address.to_string()],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()
            .context("Failed to query ban database")?;

        Ok(row.map(|(time_banned, origin_node, reason, country)| BanRecord {
            address,
            reason,
            origin_node,
            country,
            banned_at: DateTime::<Utc>::from_timestamp(time_banned, 0)
                .map(|t| t.with_timezone(&Local).naive_local()),
        }))
    }

    /// Nothing is shared with other nodes, so nothing is ever pending
    fn scan(&self) -> Result<Vec<BanRecord>> {
        Ok(Vec::new())
    }

    fn mark_applied(&self, _address: IpAddr) -> Result<()> {
        Ok(())
    }

    fn node_name(&self) -> &str {
        &self.node
    }
}
