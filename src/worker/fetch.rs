//! Per-request fetch policy: network-first for navigations, cache-first for assets.

use std::sync::Arc;
use tracing::{debug, warn};
use url::{Origin, Url};

use crate::cache::{
  CacheHandle, CacheStorage, CacheStore, FetchResult, RegistrationStore, ResponseSource,
};
use crate::error::{WorkerError, WorkerResult};
use crate::http::{Request, RequestKey, Response, ResponseKind, Strategy};
use crate::network::Network;

/// What the worker did with a request.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
  /// The worker answered the request.
  Responded(FetchResult),
  /// The worker did not intercept; the page performs a plain network fetch.
  Passthrough,
}

#[cfg(test)]
impl FetchOutcome {
  pub fn result(&self) -> Option<&FetchResult> {
    match self {
      Self::Responded(result) => Some(result),
      Self::Passthrough => None,
    }
  }
}

/// Decides per request whether to answer from the cache or the network, and
/// keeps the active cache version fresh.
pub struct FetchInterceptor<S, N>
where
  S: CacheStorage + RegistrationStore,
  N: Network,
{
  store: CacheStore<S>,
  registry: Arc<S>,
  network: Arc<N>,
  origin: Origin,
  /// Extra origins intercepted in addition to our own
  allowed_origins: Vec<Origin>,
  shell: RequestKey,
  placeholder: RequestKey,
}

impl<S, N> FetchInterceptor<S, N>
where
  S: CacheStorage + RegistrationStore,
  N: Network,
{
  pub fn new(
    storage: Arc<S>,
    network: Arc<N>,
    origin: &Url,
    allowed_origins: Vec<Origin>,
    shell: &Url,
    placeholder: &Url,
  ) -> Self {
    Self {
      store: CacheStore::new(Arc::clone(&storage)),
      registry: storage,
      network,
      origin: origin.origin(),
      allowed_origins,
      shell: RequestKey::new("GET", shell),
      placeholder: RequestKey::new("GET", placeholder),
    }
  }

  /// Whether this request is handled at all.
  ///
  /// Only GET requests to our origin or an allow-listed origin are intercepted.
  pub fn intercepts(&self, request: &Request) -> bool {
    if request.method != "GET" {
      return false;
    }
    let origin = request.url.origin();
    origin == self.origin || self.allowed_origins.contains(&origin)
  }

  /// Handle one outgoing request from a controlled page.
  pub async fn handle(&self, request: &Request) -> WorkerResult<FetchOutcome> {
    if !self.intercepts(request) {
      debug!(url = %request.url, "not intercepted");
      return Ok(FetchOutcome::Passthrough);
    }

    // Resolve the version once so the whole request stays inside one generation
    let Some(version) = self.registry.registration()?.active else {
      debug!(url = %request.url, "no active version");
      return Ok(FetchOutcome::Passthrough);
    };
    let cache = self.store.handle(&version);

    let result = match request.strategy() {
      Strategy::Navigation => self.network_first(&cache, request).await?,
      Strategy::StaticAsset => self.cache_first(&cache, request).await?,
    };
    Ok(FetchOutcome::Responded(result))
  }

  /// Network first; on failure the cached copy, then the offline shell.
  async fn network_first(
    &self,
    cache: &CacheHandle<S>,
    request: &Request,
  ) -> WorkerResult<FetchResult> {
    match self.network.fetch(request).await {
      Ok(response) => {
        // A failed write must not cost the page its live response
        self.store_copy(cache, request, &response);
        Ok(FetchResult::from_network(response))
      }
      Err(network_error) => {
        debug!(url = %request.url, error = %network_error, "navigation offline, trying cache");

        if let Some(entry) = cache.matches(request)? {
          return Ok(FetchResult::from_cache(entry, ResponseSource::OfflineCache));
        }
        if let Some(entry) = cache.matches_key(&self.shell)? {
          return Ok(FetchResult::from_cache(entry, ResponseSource::OfflineShell));
        }

        warn!(url = %request.url, version = %cache.version(), "navigation failed with no cached fallback");
        Err(WorkerError::NetworkFailure(network_error))
      }
    }
  }

  /// Cache first; on a miss fetch and store cacheable responses.
  async fn cache_first(
    &self,
    cache: &CacheHandle<S>,
    request: &Request,
  ) -> WorkerResult<FetchResult> {
    if let Some(entry) = cache.matches(request)? {
      debug!(key = %entry.key, "cache hit");
      return Ok(FetchResult::from_cache(entry, ResponseSource::Cache));
    }

    match self.network.fetch(request).await {
      Ok(response) => {
        if self.is_cacheable(&response) {
          self.store_copy(cache, request, &response);
        } else {
          debug!(url = %request.url, status = response.status, kind = response.kind.as_str(), "not caching response");
        }
        Ok(FetchResult::from_network(response))
      }
      Err(network_error) => {
        warn!(url = %request.url, error = %network_error, "asset fetch failed");

        if request.is_image() {
          if let Some(entry) = cache.matches_key(&self.placeholder)? {
            return Ok(FetchResult::from_cache(entry, ResponseSource::Placeholder));
          }
        }
        Err(WorkerError::NetworkFailure(network_error))
      }
    }
  }

  /// Write `response` into the version this request started in. Failures are
  /// logged and never reach the page.
  fn store_copy(&self, cache: &CacheHandle<S>, request: &Request, response: &Response) {
    match cache.put(request, response) {
      Ok(true) => {}
      // The version was retired while the network was busy
      Ok(false) => {
        debug!(url = %request.url, version = %cache.version(), "cache version gone, response not stored")
      }
      Err(e) => warn!(url = %request.url, error = %e, "failed to cache response"),
    }
  }

  /// Successful, non-opaque responses from an origin we intercept.
  fn is_cacheable(&self, response: &Response) -> bool {
    if !response.ok() {
      return false;
    }
    let origin = match Url::parse(&response.url) {
      Ok(url) => url.origin(),
      Err(_) => return false,
    };
    match response.kind {
      ResponseKind::Basic => origin == self.origin,
      ResponseKind::Cors => self.allowed_origins.contains(&origin),
      ResponseKind::Opaque | ResponseKind::Error => false,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheVersion, MemoryStorage, Registration};
  use crate::testing::{url, FailingPutStorage, FakeNetwork};

  const V1: &str = "quickmeal-cache-v1";

  fn setup() -> (
    Arc<MemoryStorage>,
    Arc<FakeNetwork>,
    FetchInterceptor<MemoryStorage, FakeNetwork>,
  ) {
    let storage = Arc::new(MemoryStorage::new());
    storage.open(&CacheVersion::new(V1)).unwrap();
    storage
      .set_registration(&Registration {
        active: Some(CacheVersion::new(V1)),
        waiting: None,
      })
      .unwrap();
    let network = Arc::new(FakeNetwork::new());
    let interceptor = FetchInterceptor::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      &url("/"),
      Vec::new(),
      &url("/index.html"),
      &url("/assets/images/placeholder.png"),
    );
    (storage, network, interceptor)
  }

  fn seed(storage: &MemoryStorage, path: &str, body: &str) {
    let request = Request::asset(url(path));
    storage
      .put(
        &CacheVersion::new(V1),
        &request.key(),
        &Response::new(request.url.as_str(), 200, body),
      )
      .unwrap();
  }

  fn responded(outcome: FetchOutcome) -> FetchResult {
    match outcome {
      FetchOutcome::Responded(result) => result,
      FetchOutcome::Passthrough => panic!("expected the worker to respond"),
    }
  }

  #[tokio::test]
  async fn test_cached_asset_skips_network() {
    let (storage, network, interceptor) = setup();
    seed(&storage, "/css/main.css", "body{}");

    let result = responded(interceptor.handle(&Request::asset(url("/css/main.css"))).await.unwrap());

    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(result.response.body, b"body{}");
    assert!(result.cached_at.is_some());
    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_asset_miss_fetches_and_stores() {
    let (storage, network, interceptor) = setup();
    network.serve("/js/app.js", "app");

    let request = Request::asset(url("/js/app.js"));
    let result = responded(interceptor.handle(&request).await.unwrap());
    assert_eq!(result.source, ResponseSource::Network);

    let stored = storage.lookup(&CacheVersion::new(V1), &request.key()).unwrap();
    assert_eq!(stored.unwrap().response.body, b"app");

    // Second request is served from cache
    let result = responded(interceptor.handle(&request).await.unwrap());
    assert_eq!(result.source, ResponseSource::Cache);
    assert_eq!(network.calls(), 1);
  }

  #[tokio::test]
  async fn test_asset_error_status_is_returned_but_not_stored() {
    let (storage, _network, interceptor) = setup();

    let request = Request::asset(url("/missing.js"));
    let result = responded(interceptor.handle(&request).await.unwrap());

    assert_eq!(result.response.status, 404);
    assert!(storage.lookup(&CacheVersion::new(V1), &request.key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_opaque_asset_is_not_stored() {
    let (storage, network, interceptor) = setup();
    network.respond(
      "/font.woff2",
      Response::new(url("/font.woff2").as_str(), 200, "font").with_kind(ResponseKind::Opaque),
    );

    let request = Request::asset(url("/font.woff2"));
    interceptor.handle(&request).await.unwrap();
    assert!(storage.lookup(&CacheVersion::new(V1), &request.key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_offline_image_gets_placeholder() {
    let (storage, network, interceptor) = setup();
    seed(&storage, "/assets/images/placeholder.png", "png");
    network.set_offline(true);

    let result = responded(
      interceptor
        .handle(&Request::asset(url("/assets/images/pasta.jpg")))
        .await
        .unwrap(),
    );
    assert_eq!(result.source, ResponseSource::Placeholder);
    assert_eq!(result.response.body, b"png");
  }

  #[tokio::test]
  async fn test_offline_image_without_placeholder_fails() {
    let (_storage, network, interceptor) = setup();
    network.set_offline(true);

    let err = interceptor
      .handle(&Request::asset(url("/assets/images/pasta.jpg")))
      .await
      .unwrap_err();
    assert!(matches!(err, WorkerError::NetworkFailure(_)));
  }

  #[tokio::test]
  async fn test_offline_non_image_propagates() {
    let (storage, network, interceptor) = setup();
    seed(&storage, "/assets/images/placeholder.png", "png");
    network.set_offline(true);

    let err = interceptor
      .handle(&Request::asset(url("/css/extra.css")))
      .await
      .unwrap_err();
    assert!(matches!(err, WorkerError::NetworkFailure(_)));
  }

  #[tokio::test]
  async fn test_navigation_prefers_network_and_refreshes_cache() {
    let (storage, network, interceptor) = setup();
    seed(&storage, "/index.html", "old shell");
    network.serve("/index.html", "new shell");

    let request = Request::navigate(url("/index.html"));
    let result = responded(interceptor.handle(&request).await.unwrap());

    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.body, b"new shell");
    let stored = storage
      .lookup(&CacheVersion::new(V1), &request.key())
      .unwrap()
      .unwrap();
    assert_eq!(stored.response, result.response);
  }

  #[tokio::test]
  async fn test_offline_navigation_uses_cached_copy() {
    let (storage, network, interceptor) = setup();
    seed(&storage, "/recipes", "recipes page");
    seed(&storage, "/index.html", "shell");
    network.set_offline(true);

    let result = responded(interceptor.handle(&Request::navigate(url("/recipes"))).await.unwrap());
    assert_eq!(result.source, ResponseSource::OfflineCache);
    assert_eq!(result.response.body, b"recipes page");
  }

  #[tokio::test]
  async fn test_offline_navigation_falls_back_to_shell() {
    let (storage, network, interceptor) = setup();
    seed(&storage, "/index.html", "shell");
    network.set_offline(true);

    let result = responded(
      interceptor
        .handle(&Request::navigate(url("/recipe/42")))
        .await
        .unwrap(),
    );
    assert_eq!(result.source, ResponseSource::OfflineShell);
    assert_eq!(result.response.body, b"shell");
  }

  #[tokio::test]
  async fn test_offline_navigation_without_shell_fails() {
    let (_storage, network, interceptor) = setup();
    network.set_offline(true);

    let err = interceptor
      .handle(&Request::navigate(url("/")))
      .await
      .unwrap_err();
    assert!(matches!(err, WorkerError::NetworkFailure(_)));
  }

  #[tokio::test]
  async fn test_cross_origin_and_non_get_pass_through() {
    let (_storage, network, interceptor) = setup();

    let cross = Request::asset(Url::parse("https://fonts.example.com/a.css").unwrap());
    assert!(interceptor.handle(&cross).await.unwrap().result().is_none());

    let post = Request::new("POST", url("/api/favorites"), crate::http::RequestMode::SameOrigin);
    assert!(interceptor.handle(&post).await.unwrap().result().is_none());

    assert_eq!(network.calls(), 0);
  }

  #[tokio::test]
  async fn test_no_active_version_passes_through() {
    let storage = Arc::new(MemoryStorage::new());
    let network = Arc::new(FakeNetwork::new());
    let interceptor = FetchInterceptor::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      &url("/"),
      Vec::new(),
      &url("/index.html"),
      &url("/assets/images/placeholder.png"),
    );

    let outcome = interceptor.handle(&Request::asset(url("/js/app.js"))).await.unwrap();
    assert!(matches!(outcome, FetchOutcome::Passthrough));
  }

  #[tokio::test]
  async fn test_allow_listed_origin_is_intercepted_and_cached() {
    let storage = Arc::new(MemoryStorage::new());
    storage
      .set_registration(&Registration {
        active: Some(CacheVersion::new(V1)),
        waiting: None,
      })
      .unwrap();
    let network = Arc::new(FakeNetwork::new());
    let cdn = Url::parse("https://cdn.example.com/lib.js").unwrap();
    let interceptor = FetchInterceptor::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      &url("/"),
      vec![cdn.origin()],
      &url("/index.html"),
      &url("/assets/images/placeholder.png"),
    );

    assert!(interceptor.is_cacheable(
      &Response::new(cdn.as_str(), 200, "lib").with_kind(ResponseKind::Cors)
    ));
    assert!(!interceptor.is_cacheable(
      &Response::new("https://other.example.com/x.js", 200, "x").with_kind(ResponseKind::Cors)
    ));
    assert!(interceptor.intercepts(&Request::asset(cdn)));
  }

  fn failing_writes() -> (
    Arc<FailingPutStorage>,
    Arc<FakeNetwork>,
    FetchInterceptor<FailingPutStorage, FakeNetwork>,
  ) {
    let storage = Arc::new(FailingPutStorage::new());
    storage.open(&CacheVersion::new(V1)).unwrap();
    storage
      .set_registration(&Registration {
        active: Some(CacheVersion::new(V1)),
        waiting: None,
      })
      .unwrap();
    let network = Arc::new(FakeNetwork::new());
    let interceptor = FetchInterceptor::new(
      Arc::clone(&storage),
      Arc::clone(&network),
      &url("/"),
      Vec::new(),
      &url("/index.html"),
      &url("/assets/images/placeholder.png"),
    );
    (storage, network, interceptor)
  }

  #[tokio::test]
  async fn test_failed_navigation_write_still_returns_live_response() {
    let (storage, network, interceptor) = failing_writes();
    network.serve("/recipes", "recipes page");

    let request = Request::navigate(url("/recipes"));
    let result = responded(interceptor.handle(&request).await.unwrap());

    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.body, b"recipes page");
    assert_eq!(storage.put_attempts(), 1);
    assert!(storage.lookup(&CacheVersion::new(V1), &request.key()).unwrap().is_none());
  }

  #[tokio::test]
  async fn test_failed_asset_write_still_returns_live_response() {
    let (storage, network, interceptor) = failing_writes();
    network.serve("/js/app.js", "app");

    let request = Request::asset(url("/js/app.js"));
    let result = responded(interceptor.handle(&request).await.unwrap());

    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(result.response.body, b"app");
    assert_eq!(storage.put_attempts(), 1);

    // Nothing was stored, so the next request goes back to the network
    let result = responded(interceptor.handle(&request).await.unwrap());
    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(network.calls(), 2);
  }

  #[tokio::test]
  async fn test_response_for_retired_version_is_not_stored() {
    let (storage, network, interceptor) = setup();
    network.serve("/js/late.js", "late").hold("/js/late.js");
    let interceptor = Arc::new(interceptor);

    let request = Request::asset(url("/js/late.js"));
    let task = tokio::spawn({
      let interceptor = Arc::clone(&interceptor);
      let request = request.clone();
      async move { interceptor.handle(&request).await }
    });
    network.wait_for_calls(1).await;

    // A newer version takes over while the request is on the network
    let v2 = CacheVersion::new("quickmeal-cache-v2");
    storage.open(&v2).unwrap();
    storage.delete_version(&CacheVersion::new(V1)).unwrap();
    storage
      .set_registration(&Registration {
        active: Some(v2.clone()),
        waiting: None,
      })
      .unwrap();

    network.release("/js/late.js");
    let result = responded(task.await.unwrap().unwrap());

    assert_eq!(result.source, ResponseSource::Network);
    assert_eq!(storage.list_versions().unwrap(), vec![v2.clone()]);
    assert!(storage.lookup(&v2, &request.key()).unwrap().is_none());
  }
}
