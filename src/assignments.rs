//! Last-known-good copy of the current emergency assignment.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::Database;

/// Well-known key the snapshot is stored under.
pub const CACHED_ASSIGNMENT_KEY: &str = "cached-assignment";

/// Denormalized copy of an assignment, replaced wholesale on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAssignmentSnapshot {
  /// The assignment's own id, when the payload carries one
  pub id: Option<String>,
  pub payload: Value,
  pub cached_at: DateTime<Utc>,
}

impl EmergencyAssignmentSnapshot {
  pub fn new(payload: Value) -> Self {
    let id = match payload.get("id") {
      Some(Value::String(s)) => Some(s.clone()),
      Some(Value::Number(n)) => Some(n.to_string()),
      _ => None,
    };

    Self {
      id,
      payload,
      cached_at: Utc::now(),
    }
  }

  /// Body served in place of a failed assignment fetch.
  pub fn fallback_body(&self) -> Value {
    json!({
      "success": true,
      "has_assignment": true,
      "emergency_call": self.payload,
      "offline": true,
      "cached": self.cached_at.timestamp_millis(),
    })
  }
}

/// Snapshot storage in the `emergency_assignments` partition.
#[derive(Clone)]
pub struct AssignmentStore {
  db: Database,
}

impl AssignmentStore {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Replace the stored snapshot.
  pub fn save(&self, snapshot: &EmergencyAssignmentSnapshot) -> Result<()> {
    let conn = self.db.lock()?;
    let payload = serde_json::to_string(&snapshot.payload)
      .map_err(|e| eyre!("Failed to serialize assignment: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO emergency_assignments (cache_key, assignment_id, payload, cached_at)
         VALUES (?, ?, ?, ?)",
        params![
          CACHED_ASSIGNMENT_KEY,
          snapshot.id,
          payload,
          snapshot
            .cached_at
            .to_rfc3339_opts(SecondsFormat::AutoSi, true)
        ],
      )
      .map_err(|e| eyre!("Failed to store assignment snapshot: {}", e))?;

    Ok(())
  }

  /// The current snapshot, if one was ever stored.
  pub fn latest(&self) -> Result<Option<EmergencyAssignmentSnapshot>> {
    let conn = self.db.lock()?;
    let row: Option<(Option<String>, String, String)> = conn
      .query_row(
        "SELECT assignment_id, payload, cached_at FROM emergency_assignments WHERE cache_key = ?",
        params![CACHED_ASSIGNMENT_KEY],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read assignment snapshot: {}", e))?;

    match row {
      Some((id, payload, cached_at)) => Ok(Some(EmergencyAssignmentSnapshot {
        id,
        payload: serde_json::from_str(&payload)
          .map_err(|e| eyre!("Corrupt assignment snapshot: {}", e))?,
        cached_at: DateTime::parse_from_rfc3339(&cached_at)
          .map_err(|e| eyre!("Corrupt assignment timestamp: {}", e))?
          .with_timezone(&Utc),
      })),
      None => Ok(None),
    }
  }
}
