//! Durable queue of mutating requests waiting to be replayed.
//!
//! Items are replayed in id order. An item present in the outbox has never
//! been acknowledged by the remote; delivery is at-least-once.

mod sqlite;

pub use sqlite::SqliteOutbox;

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::net::InterceptedRequest;

/// A queued request as persisted and replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboxItem {
  /// Millisecond timestamp, unique and increasing in enqueue order
  pub id: i64,
  pub url: String,
  pub method: String,
  pub body: Value,
  pub enqueued_at: DateTime<Utc>,
}

/// A request about to be queued.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxItem {
  /// Explicit id; assigned by the outbox when `None`
  pub id: Option<i64>,
  pub url: String,
  pub method: String,
  pub body: Value,
}

impl NewOutboxItem {
  pub fn new(method: &str, url: &str, body: Value) -> Self {
    Self {
      id: None,
      url: url.to_string(),
      method: method.to_string(),
      body,
    }
  }

  /// Capture method, URL and body of an intercepted request.
  ///
  /// Request headers are not kept, so replays go out without the original
  /// credentials.
  pub fn from_request(request: &InterceptedRequest) -> Self {
    Self::new(
      request.method.as_str(),
      request.url.as_str(),
      body_to_value(request.body.as_deref()),
    )
  }
}

/// JSON bodies are kept as values, empty bodies as null, anything else as a string.
fn body_to_value(body: Option<&[u8]>) -> Value {
  match body {
    None | Some([]) => Value::Null,
    Some(bytes) => serde_json::from_slice(bytes)
      .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(bytes).into_owned())),
  }
}

/// Storage contract for the outbox.
///
/// Implementations must tolerate concurrent enqueues and a concurrent drain.
pub trait DurableOutbox: Send + Sync {
  /// Append an item, assigning an id if it has none.
  fn enqueue(&self, item: NewOutboxItem) -> Result<OutboxItem>;

  /// Snapshot of every queued item in replay (id ascending) order.
  fn list_all(&self) -> Result<Vec<OutboxItem>>;

  /// Remove an item. Returns whether it was present.
  fn remove_by_id(&self, id: i64) -> Result<bool>;
}

/// Next id given the highest id handed out so far.
fn next_id(last: Option<i64>, now_millis: i64) -> i64 {
  match last {
    Some(last) => now_millis.max(last + 1),
    None => now_millis,
  }
}

/// In-memory outbox. Contents are lost with the process.
#[derive(Default)]
pub struct MemoryOutbox {
  state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
  items: BTreeMap<i64, OutboxItem>,
  high_water: Option<i64>,
}

impl MemoryOutbox {
  pub fn new() -> Self {
    Self::default()
  }
}

impl DurableOutbox for MemoryOutbox {
  fn enqueue(&self, item: NewOutboxItem) -> Result<OutboxItem> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let now = Utc::now();
    let id = match item.id {
      Some(id) if state.items.contains_key(&id) => {
        return Err(eyre!("Outbox already holds an item with id {}", id));
      }
      Some(id) => id,
      None => next_id(state.high_water, now.timestamp_millis()),
    };

    let stored = OutboxItem {
      id,
      url: item.url,
      method: item.method,
      body: item.body,
      enqueued_at: now,
    };
    state.high_water = Some(state.high_water.map_or(id, |hw| hw.max(id)));
    state.items.insert(id, stored.clone());
    Ok(stored)
  }

  fn list_all(&self) -> Result<Vec<OutboxItem>> {
    let state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(state.items.values().cloned().collect())
  }

  fn remove_by_id(&self, id: i64) -> Result<bool> {
    let mut state = self
      .state
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(state.items.remove(&id).is_some())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;
  use std::collections::BTreeSet;
  use std::sync::Arc;
  use url::Url;

  fn ids(outbox: &dyn DurableOutbox) -> BTreeSet<i64> {
    outbox.list_all().unwrap().iter().map(|i| i.id).collect()
  }

  #[test]
  fn test_ids_are_unique_and_increasing() {
    let outbox = MemoryOutbox::new();
    let mut last = 0;
    for n in 0..50 {
      let item = outbox
        .enqueue(NewOutboxItem::new(
          "POST",
          "http://localhost:5000/api/ambulance/mark-arrived",
          json!({"n": n}),
        ))
        .unwrap();
      assert!(item.id > last);
      last = item.id;
    }

    let listed = outbox.list_all().unwrap();
    assert_eq!(listed.len(), 50);
    assert!(listed.windows(2).all(|w| w[0].id < w[1].id));
    assert_eq!(listed[0].body, json!({"n": 0}));
  }

  #[test]
  fn test_enqueue_then_remove_restores_id_set() {
    let outbox = MemoryOutbox::new();
    outbox
      .enqueue(NewOutboxItem::new("POST", "http://localhost:5000/api/a", json!({})))
      .unwrap();
    let before = ids(&outbox);

    let item = outbox
      .enqueue(NewOutboxItem::new("PUT", "http://localhost:5000/api/b", json!({})))
      .unwrap();
    assert!(outbox.remove_by_id(item.id).unwrap());

    assert_eq!(ids(&outbox), before);
  }

  #[test]
  fn test_explicit_id_is_kept_and_duplicates_rejected() {
    let outbox = MemoryOutbox::new();
    let item = NewOutboxItem {
      id: Some(42),
      ..NewOutboxItem::new("POST", "http://localhost:5000/api/a", Value::Null)
    };
    assert_eq!(outbox.enqueue(item.clone()).unwrap().id, 42);
    assert!(outbox.enqueue(item).is_err());
    assert_eq!(outbox.list_all().unwrap().len(), 1);
  }

  #[test]
  fn test_remove_during_iteration_keeps_rest() {
    let outbox = MemoryOutbox::new();
    for path in ["a", "b", "c"] {
      outbox
        .enqueue(NewOutboxItem::new(
          "POST",
          &format!("http://localhost:5000/api/{}", path),
          Value::Null,
        ))
        .unwrap();
    }

    let snapshot = outbox.list_all().unwrap();
    for item in &snapshot {
      if item.url.ends_with("/b") {
        outbox.remove_by_id(item.id).unwrap();
      }
    }

    let remaining: Vec<String> = outbox.list_all().unwrap().into_iter().map(|i| i.url).collect();
    assert_eq!(
      remaining,
      vec!["http://localhost:5000/api/a", "http://localhost:5000/api/c"]
    );
  }

  #[test]
  fn test_concurrent_enqueues_get_distinct_ids() {
    let outbox = Arc::new(MemoryOutbox::new());
    let handles: Vec<_> = (0..8)
      .map(|t| {
        let outbox = Arc::clone(&outbox);
        std::thread::spawn(move || {
          for n in 0..25 {
            outbox
              .enqueue(NewOutboxItem::new("POST", "http://x/api", json!([t, n])))
              .unwrap();
          }
        })
      })
      .collect();
    for h in handles {
      h.join().unwrap();
    }
    assert_eq!(ids(outbox.as_ref()).len(), 200);
  }

  #[test]
  fn test_from_request_body_rules() {
    let url = Url::parse("http://localhost:5000/api/ambulance/mark-completed").unwrap();

    let json_req =
      InterceptedRequest::new(reqwest::Method::POST, url.clone()).with_json(&json!({"id": 7}));
    assert_eq!(NewOutboxItem::from_request(&json_req).body, json!({"id": 7}));

    let empty = InterceptedRequest::new(reqwest::Method::DELETE, url.clone());
    assert_eq!(NewOutboxItem::from_request(&empty).body, Value::Null);

    let text = InterceptedRequest::new(reqwest::Method::POST, url).with_body("status=done");
    let item = NewOutboxItem::from_request(&text);
    assert_eq!(item.body, json!("status=done"));
    assert_eq!(item.method, "POST");
  }

  #[test]
  fn test_wire_shape() {
    let item = OutboxItem {
      id: 1700000000000,
      url: "http://localhost:5000/api/ambulance/mark-arrived".to_string(),
      method: "POST".to_string(),
      body: json!({"ambulance_id": "AMB-1"}),
      enqueued_at: DateTime::parse_from_rfc3339("2026-10-18T08:00:00.123Z")
        .unwrap()
        .with_timezone(&Utc),
    };
    let value = serde_json::to_value(&item).unwrap();
    let keys: BTreeSet<&str> = value.as_object().unwrap().keys().map(|k| k.as_str()).collect();
    assert_eq!(
      keys,
      BTreeSet::from(["id", "url", "method", "body", "enqueuedAt"])
    );
    let back: OutboxItem = serde_json::from_value(value).unwrap();
    assert_eq!(back, item);
  }

  #[test]
  fn test_next_id_never_goes_backwards() {
    assert_eq!(next_id(None, 1000), 1000);
    assert_eq!(next_id(Some(999), 1000), 1000);
    assert_eq!(next_id(Some(1000), 1000), 1001);
    assert_eq!(next_id(Some(5000), 1000), 5001);
  }
}
