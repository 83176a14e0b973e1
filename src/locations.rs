//! Buffered ambulance position samples.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, error};

use crate::db::Database;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdateRecord {
  pub ambulance_id: String,
  pub latitude: f64,
  pub longitude: f64,
  /// Millisecond timestamp; unique per record
  pub timestamp: i64,
  pub synced: bool,
}

impl LocationUpdateRecord {
  /// Body accepted by the location endpoint.
  pub fn to_request_body(&self) -> Value {
    json!({
      "ambulance_id": self.ambulance_id,
      "latitude": self.latitude,
      "longitude": self.longitude,
    })
  }
}

/// Append-only log of position samples in the `location_updates` partition.
#[derive(Clone)]
pub struct LocationLog {
  db: Database,
}

impl LocationLog {
  pub fn new(db: Database) -> Self {
    Self { db }
  }

  /// Record a position sample. Returns false if it could not be stored.
  pub fn record(&self, ambulance_id: &str, latitude: f64, longitude: f64) -> bool {
    match self.append(ambulance_id, latitude, longitude) {
      Ok(record) => {
        debug!(ambulance_id, timestamp = record.timestamp, "Location update stored for later sync");
        true
      }
      Err(e) => {
        error!(ambulance_id, error = %e, "Error storing location update");
        false
      }
    }
  }

  fn append(&self, ambulance_id: &str, latitude: f64, longitude: f64) -> Result<LocationUpdateRecord> {
    let mut conn = self.db.lock()?;
    let tx = conn
      .transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    let last: Option<i64> = tx
      .query_row("SELECT MAX(timestamp) FROM location_updates", [], |row| row.get(0))
      .map_err(|e| eyre!("Failed to read location log: {}", e))?;
    let now = Utc::now().timestamp_millis();
    let timestamp = last.map_or(now, |last| now.max(last + 1));

    tx.execute(
      "INSERT INTO location_updates (timestamp, ambulance_id, latitude, longitude, synced)
       VALUES (?, ?, ?, ?, 0)",
      params![timestamp, ambulance_id, latitude, longitude],
    )
    .map_err(|e| eyre!("Failed to store location update: {}", e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit location update: {}", e))?;

    Ok(LocationUpdateRecord {
      ambulance_id: ambulance_id.to_string(),
      latitude,
      longitude,
      timestamp,
      synced: false,
    })
  }

  /// Samples not yet delivered, oldest first.
  pub fn unsynced(&self) -> Result<Vec<LocationUpdateRecord>> {
    self.query("WHERE synced = 0")
  }

  /// Every stored sample, oldest first.
  pub fn all(&self) -> Result<Vec<LocationUpdateRecord>> {
    self.query("")
  }

  fn query(&self, filter: &str) -> Result<Vec<LocationUpdateRecord>> {
    let conn = self.db.lock()?;
    let sql = format!(
      "SELECT ambulance_id, latitude, longitude, timestamp, synced FROM location_updates {} ORDER BY timestamp ASC",
      filter
    );
    let mut stmt = conn
      .prepare(&sql)
      .map_err(|e| eyre!("Failed to prepare location query: {}", e))?;

    let records = stmt
      .query_map([], |row| {
        Ok(LocationUpdateRecord {
          ambulance_id: row.get(0)?,
          latitude: row.get(1)?,
          longitude: row.get(2)?,
          timestamp: row.get(3)?,
          synced: row.get(4)?,
        })
      })
      .map_err(|e| eyre!("Failed to query location updates: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read location updates: {}", e))?;

    Ok(records)
  }

  /// Flag a sample as delivered.
  pub fn mark_synced(&self, timestamp: i64) -> Result<()> {
    let conn = self.db.lock()?;
    conn
      .execute(
        "UPDATE location_updates SET synced = 1 WHERE timestamp = ?",
        params![timestamp],
      )
      .map_err(|e| eyre!("Failed to mark location update {} synced: {}", timestamp, e))?;
    Ok(())
  }
}
