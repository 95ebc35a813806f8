//! Cache-first fetching with background refresh.
//!
//! A fetch answers from the cache when it can and refreshes from the network
//! behind the caller's back. Remote calls for the same key are coalesced:
//! whoever asks while a call is running joins it instead of issuing another.

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheResult, TtlCache};
use crate::connectivity::ConnectivityOracle;
use crate::notify::{Listeners, Subscription};
use crate::remote::{with_timeout, RemoteError};

/// Per-call fetch settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
  /// TTL for the value written back to the cache; None never expires
  pub ttl: Option<Duration>,
  /// Skip the cache and wait for the network
  pub force_refresh: bool,
}

impl FetchOptions {
  pub fn with_ttl(ttl: Duration) -> Self {
    Self {
      ttl: Some(ttl),
      force_refresh: false,
    }
  }

  pub fn force_refresh(mut self, force: bool) -> Self {
    self.force_refresh = force;
    self
  }
}

/// A fresh value published after a successful remote fetch.
#[derive(Debug, Clone)]
pub struct Refreshed<T> {
  pub key: String,
  pub value: T,
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, RemoteError>>>;

struct Inner<T> {
  cache: TtlCache,
  connectivity: Arc<ConnectivityOracle>,
  timeout: Duration,
  in_flight: Mutex<HashMap<String, SharedFetch<T>>>,
  listeners: Listeners<Refreshed<T>>,
}

impl<T> Inner<T> {
  fn in_flight(&self) -> MutexGuard<'_, HashMap<String, SharedFetch<T>>> {
    self
      .in_flight
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}

/// Orchestrates "read cache, answer, refresh in background" for one resource type.
///
/// Resource-specific repositories call into it with a closure performing
/// the remote read.
pub struct CacheFirstFetchCoordinator<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for CacheFirstFetchCoordinator<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> CacheFirstFetchCoordinator<T>
where
  T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// `timeout` bounds every remote call made through this coordinator.
  pub fn new(cache: TtlCache, connectivity: Arc<ConnectivityOracle>, timeout: Duration) -> Self {
    Self {
      inner: Arc::new(Inner {
        cache,
        connectivity,
        timeout,
        in_flight: Mutex::new(HashMap::new()),
        listeners: Listeners::new(),
      }),
    }
  }

  /// Fetch `key` cache-first.
  ///
  /// 1. Live cache entry: returned at once; if online, a background refresh
  ///    is started unless one is already running for this key
  /// 2. No entry and offline: `Ok(None)`
  /// 3. No entry and online (or `force_refresh`): wait for the network;
  ///    remote errors are returned to the caller
  ///
  /// `force_refresh` while offline answers like a normal offline fetch.
  pub async fn fetch<F, Fut>(
    &self,
    key: &str,
    options: FetchOptions,
    fetcher: F,
  ) -> Result<Option<CacheResult<T>>, RemoteError>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    let online = self.inner.connectivity.is_online();

    if online && options.force_refresh {
      let data = self.join_or_start(key, options.ttl, fetcher).await?;
      return Ok(Some(CacheResult::from_network(data)));
    }

    let cached = self.read_cache(key).await;

    if !online {
      debug!(key, hit = cached.is_some(), "offline fetch");
      return Ok(cached.map(|entry| CacheResult::offline(entry.value, entry.stored_at)));
    }

    match cached {
      Some(entry) => {
        // Detached; the shared future is driven by its own task
        drop(self.join_or_start(key, options.ttl, fetcher));
        Ok(Some(CacheResult::from_cache(entry.value, entry.stored_at)))
      }
      None => {
        let data = self.join_or_start(key, options.ttl, fetcher).await?;
        Ok(Some(CacheResult::from_network(data)))
      }
    }
  }

  /// Observe fresh values for `key`.
  pub fn subscribe<F>(&self, key: &str, callback: F) -> Subscription
  where
    F: Fn(&T) + Send + Sync + 'static,
  {
    let key = key.to_string();
    self.inner.listeners.subscribe(move |refreshed: &Refreshed<T>| {
      if refreshed.key == key {
        callback(&refreshed.value);
      }
    })
  }

  /// Whether a remote fetch for `key` is currently running.
  pub fn is_refreshing(&self, key: &str) -> bool {
    self.inner.in_flight().contains_key(key)
  }

  pub fn in_flight_count(&self) -> usize {
    self.inner.in_flight().len()
  }

  pub fn cache(&self) -> &TtlCache {
    &self.inner.cache
  }

  async fn read_cache(&self, key: &str) -> Option<CacheEntry<T>> {
    match self.inner.cache.entry_json::<T>(key).await {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        None
      }
    }
  }

  /// Join the running fetch for `key` or start one.
  ///
  /// A new fetch is spawned immediately so it completes even if every
  /// caller stops waiting.
  fn join_or_start<F, Fut>(&self, key: &str, ttl: Option<Duration>, fetcher: F) -> SharedFetch<T>
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, RemoteError>> + Send + 'static,
  {
    let mut in_flight = self.inner.in_flight();
    if let Some(running) = in_flight.get(key) {
      debug!(key, "joining in-flight fetch");
      return running.clone();
    }

    let epoch = self.inner.cache.epoch(key);
    let fetch = run_fetch(Arc::clone(&self.inner), key.to_string(), ttl, epoch, fetcher)
      .boxed()
      .shared();
    in_flight.insert(key.to_string(), fetch.clone());
    tokio::spawn(fetch.clone());
    fetch
  }
}

/// Perform one remote fetch and reconcile the result into the cache.
///
/// Failures leave the cache untouched and notify nobody. A value whose key
/// was invalidated after `epoch` is returned to waiting callers but neither
/// cached nor published.
async fn run_fetch<T, F, Fut>(
  inner: Arc<Inner<T>>,
  key: String,
  ttl: Option<Duration>,
  epoch: u64,
  fetcher: F,
) -> Result<T, RemoteError>
where
  T: Serialize + Clone + Send + Sync + 'static,
  F: FnOnce() -> Fut,
  Fut: Future<Output = Result<T, RemoteError>>,
{
  debug!(key = %key, "remote fetch started");
  let result = with_timeout(inner.timeout, fetcher()).await;

  match &result {
    Ok(value) => match inner.cache.set_json_if_current(&key, value, ttl, epoch).await {
      Ok(false) => debug!(key = %key, "key invalidated during fetch, result dropped"),
      written => {
        if let Err(e) = written {
          warn!(key = %key, error = %e, "failed to cache fetched value");
        }
        inner.listeners.emit(&Refreshed {
          key: key.clone(),
          value: value.clone(),
        });
      }
    },
    Err(e) => warn!(key = %key, error = %e, "remote fetch failed"),
  }

  inner.in_flight().remove(&key);
  result
}
