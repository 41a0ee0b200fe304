//! Network layer used by the worker to reach the origin.

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use std::time::Duration;
use tracing::debug;
use url::{Origin, Url};

use crate::error::NetworkError;
use crate::http::{Request, Response, ResponseKind};

/// A fetch-like primitive: returns a fully read response, or a failure when
/// no response could be obtained.
#[async_trait]
pub trait Network: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError>;
}

/// HTTP network backed by reqwest.
#[derive(Clone)]
pub struct HttpNetwork {
  client: reqwest::Client,
  origin: Origin,
}

impl HttpNetwork {
  /// Create a network client for pages served from `origin`.
  pub fn new(origin: &Url, timeout: Option<Duration>) -> Result<Self, NetworkError> {
    let mut builder = reqwest::Client::builder().user_agent(concat!(
      env!("CARGO_PKG_NAME"),
      "/",
      env!("CARGO_PKG_VERSION")
    ));
    if let Some(timeout) = timeout {
      builder = builder.timeout(timeout);
    }

    let client = builder.build().map_err(|e| NetworkError::Unreachable {
      url: origin.to_string(),
      reason: format!("failed to build HTTP client: {}", e),
    })?;

    Ok(Self {
      client,
      origin: origin.origin(),
    })
  }
}

#[async_trait]
impl Network for HttpNetwork {
  async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
    let url = request.url.to_string();
    let method = reqwest::Method::from_bytes(request.method.as_bytes()).map_err(|e| {
      NetworkError::Unreachable {
        url: url.clone(),
        reason: format!("invalid method {}: {}", request.method, e),
      }
    })?;

    debug!(%url, method = %request.method, "network fetch");

    let resp = self
      .client
      .request(method, request.url.clone())
      .send()
      .await
      .map_err(|e| {
        if e.is_timeout() {
          NetworkError::Timeout { url: url.clone() }
        } else {
          NetworkError::Unreachable {
            url: url.clone(),
            reason: e.to_string(),
          }
        }
      })?;

    let final_url = resp.url().clone();
    let status = resp.status().as_u16();
    let headers = header_pairs(resp.headers());

    // The body must be complete before anything can be cached
    let body = resp.bytes().await.map_err(|e| {
      if e.is_timeout() {
        NetworkError::Timeout { url: url.clone() }
      } else {
        NetworkError::Body {
          url: url.clone(),
          reason: e.to_string(),
        }
      }
    })?;

    let kind = if final_url.origin() == self.origin {
      ResponseKind::Basic
    } else {
      ResponseKind::Cors
    };

    Ok(Response {
      url: final_url.to_string(),
      status,
      headers,
      body: body.to_vec(),
      kind,
    })
  }
}

/// Every header as a name and its raw value bytes, in wire order.
fn header_pairs(headers: &HeaderMap) -> Vec<(String, Vec<u8>)> {
  headers
    .iter()
    .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
    .collect()
}
