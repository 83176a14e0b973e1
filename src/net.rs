//! Network capability: intercepted requests, responses and the fetch seam.
//!
//! The engine never talks to the network directly; every live fetch goes
//! through a [`Fetcher`] so tests can script connectivity.

use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// How the client issued a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  #[default]
  SameOrigin,
  Cors,
  NoCors,
}

/// A request observed by the engine before it reaches the network.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
  pub method: Method,
  pub url: Url,
  pub headers: Vec<(String, String)>,
  pub body: Option<Vec<u8>>,
  pub mode: RequestMode,
}

impl InterceptedRequest {
  pub fn new(method: Method, url: Url) -> Self {
    Self {
      method,
      url,
      headers: Vec::new(),
      body: None,
      mode: RequestMode::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new(Method::GET, url)
  }

  /// A page navigation to `url`.
  pub fn navigate(url: Url) -> Self {
    Self::get(url).with_mode(RequestMode::Navigate)
  }

  pub fn with_mode(mut self, mode: RequestMode) -> Self {
    self.mode = mode;
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  /// JSON body with a matching content type.
  pub fn with_json(self, value: &serde_json::Value) -> Self {
    self
      .with_header(CONTENT_TYPE.as_str(), "application/json")
      .with_body(value.to_string())
  }
}

/// Response type as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseKind {
  /// Same-origin response with readable body
  #[default]
  Basic,
  Cors,
  Opaque,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
    }
  }

  pub fn parse(s: &str) -> Self {
    match s {
      "cors" => Self::Cors,
      "opaque" => Self::Opaque,
      _ => Self::Basic,
    }
  }
}

/// A response payload plus content headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
  pub status: u16,
  pub headers: Vec<(String, String)>,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      headers: Vec::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  /// 200 response carrying a JSON document.
  pub fn json(value: &serde_json::Value) -> Self {
    Self::new(200, value.to_string()).with_header(CONTENT_TYPE.as_str(), "application/json")
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.push((name.to_string(), value.to_string()));
    self
  }

  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }

  /// Status in the 2xx range.
  pub fn is_ok(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Case-insensitive header lookup.
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }

  /// Parse the body as JSON.
  pub fn json_body(&self) -> serde_json::Result<serde_json::Value> {
    serde_json::from_slice(&self.body)
  }
}

#[derive(Error, Debug)]
pub enum FetchError {
  #[error("Network error: {0}")]
  Network(#[from] reqwest::Error),

  #[error("Unreachable: {0}")]
  Unreachable(String),

  #[error("Invalid request: {0}")]
  InvalidRequest(String),
}

/// Live network access.
pub trait Fetcher: Send + Sync {
  /// Perform the request. Any HTTP response, whatever its status, is `Ok`.
  fn fetch(
    &self,
    request: &InterceptedRequest,
  ) -> impl Future<Output = Result<Response, FetchError>> + Send;
}

/// Fetcher backed by reqwest.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
  origin: Url,
}

impl HttpFetcher {
  pub fn new(origin: Url) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()?;
    Ok(Self { client, origin })
  }
}

/// Same-origin responses are readable as-is; anything else is cross-origin.
fn kind_for(origin: &Url, url: &Url) -> ResponseKind {
  if url.origin() == origin.origin() {
    ResponseKind::Basic
  } else {
    ResponseKind::Cors
  }
}

impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &InterceptedRequest) -> Result<Response, FetchError> {
    let mut builder = self
      .client
      .request(request.method.clone(), request.url.clone());

    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| FetchError::InvalidRequest(format!("header {}: {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| FetchError::InvalidRequest(format!("header value: {}", e)))?;
      builder = builder.header(name, value);
    }

    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let headers = response
      .headers()
      .iter()
      .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
      .collect();
    let body = response.bytes().await?.to_vec();

    Ok(Response {
      status,
      headers,
      body,
      kind: kind_for(&self.origin, &request.url),
    })
  }
}
