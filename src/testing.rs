//! Scripted fetcher for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use reqwest::Method;
use url::Url;

use crate::cache::request_key;
use crate::net::{FetchError, Fetcher, InterceptedRequest, Response};

enum Route {
  Respond(Response),
  Fail,
}

/// Fetcher answering from a fixed route table keyed by `"METHOD url"`.
///
/// Unknown routes answer 404. While offline every request fails.
#[derive(Default)]
pub struct StubFetcher {
  routes: Mutex<HashMap<String, Route>>,
  offline: AtomicBool,
  calls: Mutex<Vec<InterceptedRequest>>,
}

impl StubFetcher {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn respond(&self, method: &str, url: &str, response: Response) {
    self.routes.lock().unwrap().insert(key(method, url), Route::Respond(response));
  }

  /// Make one route fail as if the network dropped.
  pub fn fail(&self, method: &str, url: &str) {
    self.routes.lock().unwrap().insert(key(method, url), Route::Fail);
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  /// Every request seen so far, in order.
  pub fn calls(&self) -> Vec<InterceptedRequest> {
    self.calls.lock().unwrap().clone()
  }

  pub fn call_count(&self) -> usize {
    self.calls.lock().unwrap().len()
  }
}

fn key(method: &str, url: &str) -> String {
  let method = Method::from_bytes(method.as_bytes()).unwrap();
  request_key(&method, &Url::parse(url).unwrap())
}

impl Fetcher for StubFetcher {
  async fn fetch(&self, request: &InterceptedRequest) -> Result<Response, FetchError> {
    self.calls.lock().unwrap().push(request.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(FetchError::Unreachable(request.url.to_string()));
    }

    let routes = self.routes.lock().unwrap();
    match routes.get(&request_key(&request.method, &request.url)) {
      Some(Route::Respond(response)) => Ok(response.clone()),
      Some(Route::Fail) => Err(FetchError::Unreachable(request.url.to_string())),
      None => Ok(Response::new(404, "not found")),
    }
  }
}
