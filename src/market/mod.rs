//! Marketplace repository built on the offline layer.

mod types;

pub use types::{Category, Listing, ListingImage, NewListing, Profile};

use color_eyre::{eyre::eyre, Result};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;

use crate::cache::{CacheResult, TtlCache};
use crate::connectivity::ConnectivityOracle;
use crate::fetch::{CacheFirstFetchCoordinator, FetchOptions};
use crate::notify::Subscription;
use crate::queue::OfflineQueue;
use crate::remote::{FetchRemote, RemoteError};
use crate::sync::SyncDriver;

pub const LISTINGS_KEY: &str = "listings";
pub const CATEGORIES_KEY: &str = "categories";

pub fn profile_key(user_id: &str) -> String {
  format!("profile:{}", user_id)
}

/// How long each resource stays in the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceTtls {
  pub listings: Duration,
  pub categories: Duration,
  pub profile: Duration,
}

impl Default for ResourceTtls {
  fn default() -> Self {
    Self {
      listings: Duration::from_secs(30 * 60),
      categories: Duration::from_secs(24 * 60 * 60),
      profile: Duration::from_secs(10 * 60),
    }
  }
}

/// Marketplace data access with transparent caching and write-behind creates.
///
/// Reads go through one cache-first coordinator per resource type; creating
/// a listing always goes through the offline queue.
#[derive(Clone)]
pub struct MarketRepository {
  api: Arc<dyn FetchRemote>,
  listings: CacheFirstFetchCoordinator<Vec<Listing>>,
  categories: CacheFirstFetchCoordinator<Vec<Category>>,
  profiles: CacheFirstFetchCoordinator<Profile>,
  queue: Arc<OfflineQueue>,
  sync: Option<Arc<SyncDriver>>,
  ttls: ResourceTtls,
}

impl MarketRepository {
  pub fn new(
    api: Arc<dyn FetchRemote>,
    cache: TtlCache,
    connectivity: Arc<ConnectivityOracle>,
    fetch_timeout: Duration,
    queue: Arc<OfflineQueue>,
    ttls: ResourceTtls,
  ) -> Self {
    Self {
      api,
      listings: CacheFirstFetchCoordinator::new(cache.clone(), connectivity.clone(), fetch_timeout),
      categories: CacheFirstFetchCoordinator::new(cache.clone(), connectivity.clone(), fetch_timeout),
      profiles: CacheFirstFetchCoordinator::new(cache, connectivity, fetch_timeout),
      queue,
      sync: None,
      ttls,
    }
  }

  /// Poke `driver` after every enqueue.
  pub fn with_sync(mut self, driver: Arc<SyncDriver>) -> Self {
    self.sync = Some(driver);
    self
  }

  /// All listings, cache-first.
  pub async fn listings(
    &self,
    force_refresh: bool,
  ) -> Result<Option<CacheResult<Vec<Listing>>>, RemoteError> {
    let options = FetchOptions::with_ttl(self.ttls.listings).force_refresh(force_refresh);
    let fetcher = self.fetcher("listings".to_string());
    self.listings.fetch(LISTINGS_KEY, options, fetcher).await
  }

  pub async fn categories(&self) -> Result<Option<CacheResult<Vec<Category>>>, RemoteError> {
    let options = FetchOptions::with_ttl(self.ttls.categories);
    let fetcher = self.fetcher("categories".to_string());
    self.categories.fetch(CATEGORIES_KEY, options, fetcher).await
  }

  pub async fn profile(&self, user_id: &str) -> Result<Option<CacheResult<Profile>>, RemoteError> {
    let options = FetchOptions::with_ttl(self.ttls.profile);
    let fetcher = self.fetcher(format!("users/{}", user_id));
    self
      .profiles
      .fetch(&profile_key(user_id), options, fetcher)
      .await
  }

  /// Observe listings fetched by background refreshes.
  pub fn subscribe_listings<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&Vec<Listing>) + Send + Sync + 'static,
  {
    self.listings.subscribe(LISTINGS_KEY, callback)
  }

  /// Queue a new listing for upload and return the operation id.
  ///
  /// Succeeds offline; the sync driver submits it when it can.
  pub async fn create_listing(&self, listing: NewListing) -> Result<String> {
    if listing.title.trim().is_empty() {
      return Err(eyre!("Listing title must not be empty"));
    }

    let payload =
      serde_json::to_value(&listing).map_err(|e| eyre!("Failed to serialize listing: {}", e))?;
    let id = self.queue.enqueue(payload).await?;

    if let Some(sync) = &self.sync {
      sync.request_sync();
    }
    Ok(id)
  }

  pub fn queue(&self) -> &Arc<OfflineQueue> {
    &self.queue
  }

  /// Wait until background refreshes finish, at most `limit`.
  ///
  /// Short-lived processes call this before exiting so refreshed data is
  /// not lost with the runtime.
  pub async fn settle(&self, limit: Duration) {
    let deadline = tokio::time::Instant::now() + limit;
    while self.refreshes_running() && tokio::time::Instant::now() < deadline {
      tokio::time::sleep(Duration::from_millis(20)).await;
    }
  }

  fn refreshes_running(&self) -> bool {
    self.listings.in_flight_count()
      + self.categories.in_flight_count()
      + self.profiles.in_flight_count()
      > 0
  }

  /// Build the remote read for `path`, decoding the body as `T`.
  fn fetcher<T: DeserializeOwned>(
    &self,
    path: String,
  ) -> impl FnOnce() -> futures::future::BoxFuture<'static, Result<T, RemoteError>> + Send + 'static
  where
    T: Send + 'static,
  {
    use futures::FutureExt;

    let api = Arc::clone(&self.api);
    move || {
      async move {
        let value = api.fetch(&path).await?;
        serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))
      }
      .boxed()
    }
  }
}
