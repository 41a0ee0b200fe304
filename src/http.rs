//! Request and response types exchanged between the worker, the network and the cache.

use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// How the request was issued by the controlled page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level document load
  Navigate,
  /// Subresource from the same origin (script, stylesheet, image, data)
  SameOrigin,
  /// Subresource from another origin
  Cors,
}

/// Fetch policy chosen for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
  /// Network first, then cache, then the offline shell
  Navigation,
  /// Cache first, then network
  StaticAsset,
}

/// An outgoing request from a controlled page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: impl Into<String>, url: Url, mode: RequestMode) -> Self {
    Self {
      method: method.into().to_uppercase(),
      url,
      mode,
    }
  }

  /// A GET navigation request for `url`.
  pub fn navigate(url: Url) -> Self {
    Self::new("GET", url, RequestMode::Navigate)
  }

  /// A GET subresource request for `url`.
  pub fn asset(url: Url) -> Self {
    Self::new("GET", url, RequestMode::SameOrigin)
  }

  pub fn strategy(&self) -> Strategy {
    match self.mode {
      RequestMode::Navigate => Strategy::Navigation,
      _ => Strategy::StaticAsset,
    }
  }

  pub fn key(&self) -> RequestKey {
    RequestKey::new(&self.method, &self.url)
  }

  /// Whether the URL path ends in an image extension.
  pub fn is_image(&self) -> bool {
    let path = self.url.path().to_lowercase();
    match path.rsplit_once('.') {
      Some((_, ext)) => IMAGE_EXTENSIONS.contains(&ext),
      None => false,
    }
  }
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "svg"];

/// Identity of a request inside a cache version: method plus origin-qualified URL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
  pub method: String,
  pub url: String,
}

impl RequestKey {
  pub fn new(method: &str, url: &Url) -> Self {
    let mut url = url.clone();
    url.set_fragment(None);
    Self {
      method: method.to_uppercase(),
      url: url.to_string(),
    }
  }
}

impl fmt::Display for RequestKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.url)
  }
}

/// Response type as seen by the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseKind {
  /// Same-origin response with full access to status, headers and body
  Basic,
  Cors,
  Opaque,
  Error,
}

impl ResponseKind {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Basic => "basic",
      Self::Cors => "cors",
      Self::Opaque => "opaque",
      Self::Error => "error",
    }
  }

  pub fn parse(s: &str) -> Option<Self> {
    match s {
      "basic" => Some(Self::Basic),
      "cors" => Some(Self::Cors),
      "opaque" => Some(Self::Opaque),
      "error" => Some(Self::Error),
      _ => None,
    }
  }
}

/// A fully materialized response (the body is always read to completion).
///
/// Header values are kept as raw bytes so a stored entry is identical to what
/// the network returned, including values that are not valid UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub headers: Vec<(String, Vec<u8>)>,
  pub body: Vec<u8>,
  pub kind: ResponseKind,
}

impl Response {
  /// Status in the 200-299 range.
  pub fn ok(&self) -> bool {
    (200..300).contains(&self.status)
  }
}

#[cfg(test)]
impl Response {
  pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      url: url.into(),
      status,
      headers: Vec::new(),
      body: body.into(),
      kind: ResponseKind::Basic,
    }
  }

  pub fn with_header(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
    self.headers.push((name.to_lowercase(), value.into()));
    self
  }

  pub fn with_kind(mut self, kind: ResponseKind) -> Self {
    self.kind = kind;
    self
  }
}
