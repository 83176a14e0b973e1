//! SQLite-backed outbox.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use std::sync::atomic::{AtomicI64, Ordering};
use tracing::debug;

use super::{next_id, DurableOutbox, NewOutboxItem, OutboxItem};
use crate::db::Database;

/// Outbox persisted in the `outbox` table.
///
/// Each enqueue runs in its own transaction under the connection lock, so
/// concurrent enqueues and a concurrent drain serialize cleanly.
pub struct SqliteOutbox {
  db: Database,
  /// Highest id handed out by this process, so ids keep rising after removals
  high_water: AtomicI64,
}

impl SqliteOutbox {
  pub fn new(db: Database) -> Self {
    Self {
      db,
      high_water: AtomicI64::new(i64::MIN),
    }
  }

  /// Number of queued items.
  pub fn len(&self) -> Result<usize> {
    let conn = self.db.lock()?;
    let count: i64 = conn
      .query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to count outbox: {}", e))?;
    usize::try_from(count).map_err(|_| eyre!("Outbox count {} out of range", count))
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.len()? == 0)
  }
}

impl DurableOutbox for SqliteOutbox {
  fn enqueue(&self, item: NewOutboxItem) -> Result<OutboxItem> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let now = Utc::now();
    let id = match item.id {
      Some(id) => id,
      None => {
        let max_stored: Option<i64> = tx
          .query_row("SELECT MAX(id) FROM outbox", [], |row| row.get(0))
          .map_err(|e| eyre!("Failed to read outbox head: {}", e))?;
        let high_water = self.high_water.load(Ordering::SeqCst);
        let last = match (max_stored, high_water) {
          (Some(stored), hw) => Some(stored.max(hw)),
          (None, i64::MIN) => None,
          (None, hw) => Some(hw),
        };
        next_id(last, now.timestamp_millis())
      }
    };

    let body =
      serde_json::to_string(&item.body).map_err(|e| eyre!("Failed to serialize body: {}", e))?;

    tx.execute(
      "INSERT INTO outbox (id, url, method, body, enqueued_at) VALUES (?, ?, ?, ?, ?)",
      params![
        id,
        item.url,
        item.method,
        body,
        now.to_rfc3339_opts(SecondsFormat::AutoSi, true)
      ],
    )
    .map_err(|e| eyre!("Failed to enqueue outbox item {}: {}", id, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit outbox item {}: {}", id, e))?;

    self.high_water.fetch_max(id, Ordering::SeqCst);
    debug!(id, method = %item.method, url = %item.url, "Enqueued outbox item");

    Ok(OutboxItem {
      id,
      url: item.url,
      method: item.method,
      body: item.body,
      enqueued_at: now,
    })
  }

  fn list_all(&self) -> Result<Vec<OutboxItem>> {
    let conn = self.db.lock()?;
    let mut stmt = conn
      .prepare("SELECT id, url, method, body, enqueued_at FROM outbox ORDER BY id ASC")
      .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

    let rows = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to query outbox: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read outbox: {}", e))?;

    rows.into_iter().map(decode_row).collect()
  }

  fn remove_by_id(&self, id: i64) -> Result<bool> {
    let conn = self.db.lock()?;
    let removed = conn
      .execute("DELETE FROM outbox WHERE id = ?", params![id])
      .map_err(|e| eyre!("Failed to remove outbox item {}: {}", id, e))?;
    Ok(removed > 0)
  }
}

impl SqliteOutbox {
  /// Look up a single item.
  pub fn get(&self, id: i64) -> Result<Option<OutboxItem>> {
    let row = {
      let conn = self.db.lock()?;
      conn
        .query_row(
          "SELECT id, url, method, body, enqueued_at FROM outbox WHERE id = ?",
          params![id],
          read_row,
        )
        .optional()
        .map_err(|e| eyre!("Failed to read outbox item {}: {}", id, e))?
    };

    row.map(decode_row).transpose()
  }
}

type OutboxRow = (i64, String, String, String, String);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxRow> {
  Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_row((id, url, method, body, enqueued_at): OutboxRow) -> Result<OutboxItem> {
  Ok(OutboxItem {
    id,
    url,
    method,
    body: serde_json::from_str(&body)
      .map_err(|e| eyre!("Corrupt body for outbox item {}: {}", id, e))?,
    enqueued_at: DateTime::parse_from_rfc3339(&enqueued_at)
      .map_err(|e| eyre!("Corrupt timestamp for outbox item {}: {}", id, e))?
      .with_timezone(&Utc),
  })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::BTreeSet;

  #[test]
  fn test_items_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    let enqueued = {
      let outbox = SqliteOutbox::new(Database::open(&path).unwrap());
      let a = outbox
        .enqueue(NewOutboxItem::new(
          "POST",
          "http://localhost:5000/api/ambulance/mark-arrived",
          json!({"ambulance_id": "AMB-1", "emergency_id": 12}),
        ))
        .unwrap();
      let b = outbox
        .enqueue(NewOutboxItem::new(
          "PUT",
          "http://localhost:5000/api/ambulance/register",
          json!("plain text"),
        ))
        .unwrap();
      vec![a, b]
    };

    // Fresh handle on the same file, as after a restart
    let reopened = SqliteOutbox::new(Database::open(&path).unwrap());
    assert_eq!(reopened.list_all().unwrap(), enqueued);
  }

  #[test]
  fn test_ids_keep_rising_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("offline.db");

    let future_id = Utc::now().timestamp_millis() + 60_000;
    {
      let outbox = SqliteOutbox::new(Database::open(&path).unwrap());
      outbox
        .enqueue(NewOutboxItem {
          id: Some(future_id),
          ..NewOutboxItem::new("POST", "http://x/api/a", json!(null))
        })
        .unwrap();
    }

    let reopened = SqliteOutbox::new(Database::open(&path).unwrap());
    let next = reopened
      .enqueue(NewOutboxItem::new("POST", "http://x/api/b", json!(null)))
      .unwrap();
    assert_eq!(next.id, future_id + 1);
  }

  #[test]
  fn test_enqueue_remove_list_is_identity() {
    let outbox = SqliteOutbox::new(Database::open_in_memory().unwrap());
    outbox
      .enqueue(NewOutboxItem::new("POST", "http://x/api/a", json!({})))
      .unwrap();
    let before: BTreeSet<i64> = outbox.list_all().unwrap().iter().map(|i| i.id).collect();

    let item = outbox
      .enqueue(NewOutboxItem::new("POST", "http://x/api/b", json!({})))
      .unwrap();
    assert!(outbox.remove_by_id(item.id).unwrap());
    assert!(!outbox.remove_by_id(item.id).unwrap());

    let after: BTreeSet<i64> = outbox.list_all().unwrap().iter().map(|i| i.id).collect();
    assert_eq!(before, after);
  }

  #[test]
  fn test_duplicate_explicit_id_leaves_state_unchanged() {
    let outbox = SqliteOutbox::new(Database::open_in_memory().unwrap());
    let item = NewOutboxItem {
      id: Some(7),
      ..NewOutboxItem::new("POST", "http://x/api/a", json!({"v": 1}))
    };
    outbox.enqueue(item.clone()).unwrap();

    let dup = NewOutboxItem {
      body: json!({"v": 2}),
      ..item
    };
    assert!(outbox.enqueue(dup).is_err());

    let listed = outbox.list_all().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].body, json!({"v": 1}));
    assert_eq!(outbox.len().unwrap(), 1);
  }

  #[test]
  fn test_get_single_item() {
    let outbox = SqliteOutbox::new(Database::open_in_memory().unwrap());
    let item = outbox
      .enqueue(NewOutboxItem::new("POST", "http://x/api/a", json!({"k": "v"})))
      .unwrap();
    assert_eq!(outbox.get(item.id).unwrap(), Some(item));
    assert!(outbox.get(1).unwrap().is_none());
    assert!(!outbox.is_empty().unwrap());
  }
}
