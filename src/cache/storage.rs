//! Cache storage backends: SQLite and in-memory.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use super::traits::{CacheStore, CachedEntry};
use crate::db::Database;
use crate::net::{Response, ResponseKind};

/// In-memory cache storage.
///
/// Used by tests and when no durable store is wanted; nothing survives the
/// process.
#[derive(Default)]
pub struct MemoryCacheStore {
  namespaces: Mutex<BTreeMap<String, BTreeMap<String, CachedEntry>>>,
}

impl MemoryCacheStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl CacheStore for MemoryCacheStore {
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>> {
    let namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.get(namespace).and_then(|ns| ns.get(key)).cloned())
  }

  fn put(&self, namespace: &str, key: &str, response: &Response) -> Result<()> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    namespaces.entry(namespace.to_string()).or_default().insert(
      key.to_string(),
      CachedEntry {
        response: response.clone(),
        cached_at: Utc::now(),
      },
    );
    Ok(())
  }

  fn put_all(&self, namespace: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let cached_at = Utc::now();
    let ns = namespaces.entry(namespace.to_string()).or_default();
    for (key, response) in entries {
      ns.insert(
        key.clone(),
        CachedEntry {
          response: response.clone(),
          cached_at,
        },
      );
    }
    namespaces.retain(|_, ns| !ns.is_empty());
    Ok(())
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let removed = namespaces
      .get_mut(namespace)
      .map(|ns| ns.remove(key).is_some())
      .unwrap_or(false);
    namespaces.retain(|_, ns| !ns.is_empty());
    Ok(removed)
  }

  fn keys(&self, namespace: &str) -> Result<BTreeSet<String>> {
    let namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(
      namespaces
        .get(namespace)
        .map(|ns| ns.keys().cloned().collect())
        .unwrap_or_default(),
    )
  }

  fn namespaces(&self) -> Result<BTreeSet<String>> {
    let namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.keys().cloned().collect())
  }

  fn drop_namespace(&self, namespace: &str) -> Result<usize> {
    let mut namespaces = self
      .namespaces
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(namespaces.remove(namespace).map(|ns| ns.len()).unwrap_or(0))
  }
}

/// SQLite-based cache storage implementation.
///
/// Rows are addressed by the SHA-256 of the key so that long tile and query
/// URLs stay fixed-length; the original key is kept for enumeration.
#[derive(Clone)]
pub struct SqliteCacheStore {
  db: Database,
}

impl SqliteCacheStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }
}

/// SHA256 hash for stable, fixed-length keys
fn key_hash(key: &str) -> String {
  let mut hasher = Sha256::new();
  hasher.update(key.as_bytes());
  hex::encode(hasher.finalize())
}

impl CacheStore for SqliteCacheStore {
  fn get(&self, namespace: &str, key: &str) -> Result<Option<CachedEntry>> {
    let conn = self.db.lock()?;

    let row: Option<(u16, String, Vec<u8>, String, String)> = conn
      .query_row(
        "SELECT status, headers, body, kind, cached_at FROM cache_entries
         WHERE namespace = ? AND key_hash = ?",
        params![namespace, key_hash(key)],
        |row| {
          Ok((
            row.get(0)?,
            row.get(1)?,
            row.get(2)?,
            row.get(3)?,
            row.get(4)?,
          ))
        },
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

    match row {
      Some((status, headers, body, kind, cached_at_str)) => {
        let headers: Vec<(String, String)> = serde_json::from_str(&headers)
          .map_err(|e| eyre!("Failed to deserialize cached headers: {}", e))?;
        Ok(Some(CachedEntry {
          response: Response {
            status,
            headers,
            body,
            kind: ResponseKind::parse(&kind),
          },
          cached_at: parse_datetime(&cached_at_str)?,
        }))
      }
      None => Ok(None),
    }
  }

  fn put(&self, namespace: &str, key: &str, response: &Response) -> Result<()> {
    let conn = self.db.lock()?;
    insert_entry(&conn, namespace, key, response)
  }

  fn put_all(&self, namespace: &str, entries: &[(String, Response)]) -> Result<()> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    for (key, response) in entries {
      insert_entry(&tx, namespace, key, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit cache entries: {}", e))
  }

  fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ? AND key_hash = ?",
        params![namespace, key_hash(key)],
      )
      .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
    Ok(removed > 0)
  }

  fn keys(&self, namespace: &str) -> Result<BTreeSet<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT identity FROM cache_entries WHERE namespace = ?")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![namespace], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query cache keys: {}", e))?
      .collect::<rusqlite::Result<BTreeSet<String>>>()
      .map_err(|e| eyre!("Failed to read cache keys: {}", e))?;

    Ok(keys)
  }

  fn namespaces(&self) -> Result<BTreeSet<String>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT DISTINCT namespace FROM cache_entries")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let namespaces = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to query namespaces: {}", e))?
      .collect::<rusqlite::Result<BTreeSet<String>>>()
      .map_err(|e| eyre!("Failed to read namespaces: {}", e))?;

    Ok(namespaces)
  }

  fn drop_namespace(&self, namespace: &str) -> Result<usize> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "DELETE FROM cache_entries WHERE namespace = ?",
        params![namespace],
      )
      .map_err(|e| eyre!("Failed to drop namespace {}: {}", namespace, e))
  }
}

fn insert_entry(conn: &Connection, namespace: &str, key: &str, response: &Response) -> Result<()> {
  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO cache_entries
         (namespace, key_hash, identity, status, headers, body, kind, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        namespace,
        key_hash(key),
        key,
        response.status,
        headers,
        response.body,
        response.kind.as_str()
      ],
    )
    .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;

  Ok(())
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
