use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::net::{Fetcher, InterceptedRequest};
use crate::router::Connectivity;

/// Events driving the watch loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
  /// Probe result differs from the previous one
  Connectivity(Connectivity),
  /// Ctrl-C
  Shutdown,
}

/// Event handler that produces events from a connectivity probe and the interrupt signal
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  /// Probe `probe_url` every `interval`. Any HTTP response counts as online.
  pub fn new<F: Fetcher + 'static>(fetcher: Arc<F>, probe_url: Url, interval: Duration) -> Self {
    let (tx, rx) = mpsc::unbounded_channel();

    // Spawn connectivity probe
    let probe_tx = tx.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      let mut last = None;
      loop {
        ticker.tick().await;

        let request = InterceptedRequest::get(probe_url.clone());
        let state = match fetcher.fetch(&request).await {
          Ok(_) => Connectivity::Online,
          Err(e) => {
            debug!(error = %e, "Connectivity probe failed");
            Connectivity::Offline
          }
        };

        if last != Some(state) {
          last = Some(state);
          if probe_tx.send(Event::Connectivity(state)).is_err() {
            break;
          }
        }
      }
    });

    // Spawn interrupt listener
    tokio::spawn(async move {
      if tokio::signal::ctrl_c().await.is_ok() {
        let _ = tx.send(Event::Shutdown);
      }
    });

    Self { rx }
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}
