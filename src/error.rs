//! Error taxonomy for the worker.

use thiserror::Error;

/// Errors raised while handling a lifecycle, fetch, message or sync event.
///
/// Every failure is local to the event that produced it.
#[derive(Debug, Error)]
pub enum WorkerError {
  /// A manifest entry could not be precached. The previous version stays active.
  #[error("install failed while precaching {url}: {reason}")]
  InstallFailure { url: String, reason: String },

  /// The network failed and no cached fallback was available.
  #[error("network request failed: {0}")]
  NetworkFailure(#[from] NetworkError),

  /// The cache store could not complete a read or write.
  #[error("cache storage error: {0}")]
  Storage(String),

  #[error("invalid asset manifest: {0}")]
  InvalidManifest(String),

  /// A lifecycle step was requested from a state that does not allow it.
  #[error("invalid worker state: {0}")]
  InvalidState(String),
}

impl WorkerError {
  pub fn storage(msg: impl Into<String>) -> Self {
    Self::Storage(msg.into())
  }
}

/// Failure reported by the network layer. Receiving any response at all,
/// including a 404, is not a network failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum NetworkError {
  #[error("could not reach {url}: {reason}")]
  Unreachable { url: String, reason: String },

  #[error("request to {url} timed out")]
  Timeout { url: String },

  #[error("failed to read body of {url}: {reason}")]
  Body { url: String, reason: String },
}

pub type WorkerResult<T> = Result<T, WorkerError>;
