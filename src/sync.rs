//! Outbox replay once connectivity returns.

use color_eyre::Result;
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};
use url::Url;

use crate::locations::{LocationLog, LocationUpdateRecord};
use crate::message::EngineMessage;
use crate::net::{FetchError, Fetcher, InterceptedRequest};
use crate::outbox::{DurableOutbox, OutboxItem};

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
  /// Items in the snapshot taken at the start of the pass
  pub attempted: usize,
  /// Items removed from the outbox, `refused` included
  pub delivered: usize,
  /// Removed items the remote answered with a 4xx status
  pub refused: usize,
  pub failed: usize,
  pub locations_synced: usize,
}

/// The remote took the request. 5xx means try again later.
fn acknowledged(status: u16) -> bool {
  status < 500
}

enum Delivery {
  Delivered,
  Refused,
  Kept,
}

/// Replays queued writes and buffered location samples.
///
/// Passes are serialized: a pass started while another runs waits for it and
/// then works on a fresh snapshot.
pub struct SyncReconciler<O: DurableOutbox, F: Fetcher> {
  outbox: Arc<O>,
  fetcher: Arc<F>,
  locations: Option<(LocationLog, Url)>,
  listeners: broadcast::Sender<EngineMessage>,
  pass: Mutex<()>,
}

impl<O: DurableOutbox, F: Fetcher> SyncReconciler<O, F> {
  pub fn new(outbox: Arc<O>, fetcher: Arc<F>) -> Self {
    let (listeners, _) = broadcast::channel(16);
    Self {
      outbox,
      fetcher,
      locations: None,
      listeners,
      pass: Mutex::new(()),
    }
  }

  /// Also drain `log` to `endpoint` after each outbox pass.
  pub fn with_locations(mut self, log: LocationLog, endpoint: Url) -> Self {
    self.locations = Some((log, endpoint));
    self
  }

  /// Register for `sync-complete` notifications.
  pub fn subscribe(&self) -> broadcast::Receiver<EngineMessage> {
    self.listeners.subscribe()
  }

  /// Run one reconciliation pass.
  ///
  /// Each item in the snapshot gets exactly one attempt. Acknowledged items
  /// are removed; the rest stay queued with their ids. Listeners are told how
  /// many items were attempted. Only a failure to read the outbox is an error.
  pub async fn reconcile(&self) -> Result<SyncReport> {
    let _pass = self.pass.lock().await;

    let snapshot = self.outbox.list_all()?;
    let mut report = SyncReport {
      attempted: snapshot.len(),
      ..Default::default()
    };
    if !snapshot.is_empty() {
      info!(items = snapshot.len(), "Replaying outbox");
    }

    for item in &snapshot {
      match self.deliver(item).await {
        Delivery::Delivered => report.delivered += 1,
        Delivery::Refused => {
          report.delivered += 1;
          report.refused += 1;
        }
        Delivery::Kept => report.failed += 1,
      }
    }

    report.locations_synced = self.drain_locations().await;

    // No listeners is fine
    let _ = self.listeners.send(EngineMessage::SyncComplete {
      count: report.attempted,
    });

    info!(
      attempted = report.attempted,
      delivered = report.delivered,
      refused = report.refused,
      failed = report.failed,
      locations = report.locations_synced,
      "Sync complete"
    );
    Ok(report)
  }

  async fn deliver(&self, item: &OutboxItem) -> Delivery {
    let status = match self.replay(item).await {
      Ok(status) => status,
      Err(e) => {
        debug!(id = item.id, error = %e, "Replay failed, keeping item");
        return Delivery::Kept;
      }
    };

    if !acknowledged(status) {
      warn!(id = item.id, status, url = %item.url, "Remote rejected replay, keeping item");
      return Delivery::Kept;
    }

    let delivery = if status >= 400 {
      // Replays carry no credentials, so auth failures land here too
      warn!(
        id = item.id,
        status,
        method = %item.method,
        url = %item.url,
        body = %item.body,
        "Remote refused replay, discarding queued write"
      );
      Delivery::Refused
    } else {
      Delivery::Delivered
    };

    match self.outbox.remove_by_id(item.id) {
      Ok(true) => {
        debug!(id = item.id, status, "Replayed outbox item");
        delivery
      }
      Ok(false) => {
        debug!(id = item.id, "Outbox item already removed");
        delivery
      }
      Err(e) => {
        warn!(id = item.id, error = %e, "Replayed but could not remove outbox item");
        Delivery::Kept
      }
    }
  }

  async fn replay(&self, item: &OutboxItem) -> Result<u16, FetchError> {
    let method = Method::from_bytes(item.method.as_bytes())
      .map_err(|e| FetchError::InvalidRequest(format!("method {}: {}", item.method, e)))?;
    let url = Url::parse(&item.url)
      .map_err(|e| FetchError::InvalidRequest(format!("url {}: {}", item.url, e)))?;

    let mut request =
      InterceptedRequest::new(method, url).with_header(CONTENT_TYPE.as_str(), "application/json");
    if !item.body.is_null() {
      request = request.with_body(item.body.to_string());
    }

    Ok(self.fetcher.fetch(&request).await?.status)
  }

  async fn drain_locations(&self) -> usize {
    let Some((log, endpoint)) = &self.locations else {
      return 0;
    };

    let pending = match log.unsynced() {
      Ok(pending) => pending,
      Err(e) => {
        warn!(error = %e, "Failed to read buffered locations");
        return 0;
      }
    };

    let mut synced = 0;
    for record in &pending {
      if self.send_location(record, endpoint).await {
        match log.mark_synced(record.timestamp) {
          Ok(()) => synced += 1,
          Err(e) => warn!(timestamp = record.timestamp, error = %e, "Failed to flag location synced"),
        }
      }
    }
    synced
  }

  async fn send_location(&self, record: &LocationUpdateRecord, endpoint: &Url) -> bool {
    let request =
      InterceptedRequest::new(Method::POST, endpoint.clone()).with_json(&record.to_request_body());

    match self.fetcher.fetch(&request).await {
      Ok(response) => acknowledged(response.status),
      Err(e) => {
        debug!(timestamp = record.timestamp, error = %e, "Location sync failed");
        false
      }
    }
  }
}
