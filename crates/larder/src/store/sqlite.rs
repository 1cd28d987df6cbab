//! SQLite metadata store
//!
//! # Schema
//!
//! The `items` table has columns: `item_key`, `storage_key`, `size_bytes`,
//! `compute_cost_us`, `created_at_ms`, `blob_digest`, `weight`, `description`.
//! The `accesses` table has columns: `item_key`, `at_ms`. The `settings`
//! table holds one JSON configuration blob under the key `config`.
//!
//! A unique index over `storage_key` makes the database refuse two resident
//! items claiming the same blob.

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::item::{CacheItem, MAX_ACCESS_LOG};
use crate::key::{ItemKey, StorageKey};
use crate::store::MetadataStore;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const CONFIG_KEY: &str = "config";

/// Metadata store backed by a SQLite database
///
/// The conventional location is a dot-named file inside the cache directory
/// (e.g. `.metadata.sqlite`), which the filesystem object store ignores when
/// enumerating blobs.
pub struct SqliteMetadataStore {
    conn: Mutex<Connection>,
}

impl SqliteMetadataStore {
    /// Open or create a database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::metadata(format!("open {}: {e}", path.display())))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an ephemeral in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Initialize the database schema
    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS items (
                item_key TEXT PRIMARY KEY,
                storage_key TEXT,
                size_bytes INTEGER NOT NULL DEFAULT 0,
                compute_cost_us INTEGER NOT NULL DEFAULT 0,
                created_at_ms INTEGER NOT NULL,
                blob_digest TEXT,
                weight REAL NOT NULL DEFAULT 1.0,
                description TEXT NOT NULL DEFAULT ''
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_items_storage_key
                ON items(storage_key);
            CREATE TABLE IF NOT EXISTS accesses (
                item_key TEXT NOT NULL REFERENCES items(item_key),
                at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_accesses_item
                ON accesses(item_key, at_ms);
            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::metadata("connection lock poisoned"))
    }

    fn accesses_of(conn: &Connection, item_key: &str) -> Result<Vec<DateTime<Utc>>> {
        let mut stmt =
            conn.prepare("SELECT at_ms FROM accesses WHERE item_key = ?1 ORDER BY at_ms, rowid")?;
        let rows = stmt.query_map(params![item_key], |row| row.get::<_, i64>(0))?;
        let mut log = Vec::new();
        for at_ms in rows {
            log.push(millis_to_datetime(at_ms?)?);
        }
        Ok(log)
    }

    fn item_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(CacheItem, String)> {
        let key_hex: String = row.get(0)?;
        let storage_key: Option<String> = row.get(1)?;
        let size_bytes: i64 = row.get(2)?;
        let compute_cost_us: i64 = row.get(3)?;
        let created_at_ms: i64 = row.get(4)?;
        let blob_digest: Option<String> = row.get(5)?;
        let weight: f64 = row.get(6)?;
        let description: String = row.get(7)?;

        let item_key = ItemKey::from_hex(&key_hex).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;
        let created_at = Utc
            .timestamp_millis_opt(created_at_ms)
            .single()
            .unwrap_or_else(Utc::now);

        let item = CacheItem {
            item_key,
            storage_key: storage_key.map(StorageKey::new),
            size_bytes: u64::try_from(size_bytes).unwrap_or(0),
            compute_cost: Duration::from_micros(u64::try_from(compute_cost_us).unwrap_or(0)),
            created_at,
            access_log: Vec::new(),
            blob_digest,
            weight,
            pretty_description: description,
            last_utility: None,
        };
        Ok((item, key_hex))
    }
}

fn millis_to_datetime(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| Error::metadata(format!("timestamp out of range: {ms}")))
}

const ITEM_COLUMNS: &str =
    "item_key, storage_key, size_bytes, compute_cost_us, created_at_ms, blob_digest, weight, description";

impl MetadataStore for SqliteMetadataStore {
    fn get(&self, item_key: &ItemKey) -> Result<Option<CacheItem>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM items WHERE item_key = ?1"),
                params![item_key.to_hex()],
                Self::item_from_row,
            )
            .optional()?;
        let Some((mut item, key_hex)) = row else {
            return Ok(None);
        };
        item.access_log = Self::accesses_of(&conn, &key_hex)?;
        Ok(Some(item))
    }

    fn upsert(&self, item: &CacheItem) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let key_hex = item.item_key.to_hex();
        // Conflict target pinned to item_key so a storage_key collision with a
        // different item surfaces as a constraint error instead of replacing
        // that item's row
        tx.execute(
            "INSERT INTO items
                (item_key, storage_key, size_bytes, compute_cost_us, created_at_ms,
                 blob_digest, weight, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(item_key) DO UPDATE SET
                storage_key = excluded.storage_key,
                size_bytes = excluded.size_bytes,
                compute_cost_us = excluded.compute_cost_us,
                created_at_ms = excluded.created_at_ms,
                blob_digest = excluded.blob_digest,
                weight = excluded.weight,
                description = excluded.description",
            params![
                key_hex,
                item.storage_key.as_ref().map(StorageKey::as_str),
                i64::try_from(item.size_bytes).unwrap_or(i64::MAX),
                i64::try_from(item.compute_cost.as_micros()).unwrap_or(i64::MAX),
                item.created_at.timestamp_millis(),
                item.blob_digest,
                item.weight,
                item.pretty_description,
            ],
        )?;
        tx.execute("DELETE FROM accesses WHERE item_key = ?1", params![key_hex])?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO accesses (item_key, at_ms) VALUES (?1, ?2)")?;
            for at in &item.access_log {
                stmt.execute(params![key_hex, at.timestamp_millis()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn mark_non_resident(&self, item_key: &ItemKey) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE items SET storage_key = NULL, size_bytes = 0, blob_digest = NULL
             WHERE item_key = ?1",
            params![item_key.to_hex()],
        )?;
        Ok(())
    }

    fn iter_resident(&self) -> Result<Vec<CacheItem>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM items WHERE storage_key IS NOT NULL ORDER BY item_key"
        ))?;
        let rows = stmt.query_map([], Self::item_from_row)?;
        let mut items = Vec::new();
        for row in rows {
            let (mut item, key_hex) = row?;
            item.access_log = Self::accesses_of(&conn, &key_hex)?;
            items.push(item);
        }
        Ok(items)
    }

    fn append_access(&self, item_key: &ItemKey, at: DateTime<Utc>) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let key_hex = item_key.to_hex();

        let known: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM items WHERE item_key = ?1",
                params![key_hex],
                |row| row.get(0),
            )
            .optional()?;
        if known.is_none() {
            return Err(Error::not_found(key_hex));
        }

        // Clamp to the latest recorded access so the log never decreases
        let last: Option<i64> = tx.query_row(
            "SELECT MAX(at_ms) FROM accesses WHERE item_key = ?1",
            params![key_hex],
            |row| row.get(0),
        )?;
        let at_ms = last.map_or(at.timestamp_millis(), |l| l.max(at.timestamp_millis()));

        tx.execute(
            "INSERT INTO accesses (item_key, at_ms) VALUES (?1, ?2)",
            params![key_hex, at_ms],
        )?;
        tx.execute(
            "DELETE FROM accesses WHERE item_key = ?1 AND rowid NOT IN (
                SELECT rowid FROM accesses WHERE item_key = ?1
                ORDER BY at_ms DESC, rowid DESC LIMIT ?2)",
            params![key_hex, MAX_ACCESS_LOG as i64],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn clear_access_logs(&self) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM accesses", [])?;
        Ok(())
    }

    fn delete(&self, item_key: &ItemKey) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let key_hex = item_key.to_hex();
        tx.execute("DELETE FROM accesses WHERE item_key = ?1", params![key_hex])?;
        tx.execute("DELETE FROM items WHERE item_key = ?1", params![key_hex])?;
        tx.commit()?;
        Ok(())
    }

    fn load_config(&self) -> Result<Option<CacheConfig>> {
        let conn = self.lock()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![CONFIG_KEY],
                |row| row.get(0),
            )
            .optional()?;
        match value {
            None => Ok(None),
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::metadata(format!("config blob unreadable: {e}"))),
        }
    }

    fn store_config(&self, config: &CacheConfig) -> Result<()> {
        let json = serde_json::to_string(config)
            .map_err(|e| Error::metadata(format!("config blob unwritable: {e}")))?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![CONFIG_KEY, json],
        )?;
        Ok(())
    }
}
