//! Startup wiring: one instance of every component, shared by reference.

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use url::Url;

use crate::cache::TtlCache;
use crate::config::Config;
use crate::connectivity::{ConnectivityOracle, HttpProbe};
use crate::db::Database;
use crate::market::MarketRepository;
use crate::queue::OfflineQueue;
use crate::remote::HttpBackend;
use crate::sync::SyncDriver;

pub struct App {
  pub config: Config,
  pub cache: TtlCache,
  pub connectivity: Arc<ConnectivityOracle>,
  pub queue: Arc<OfflineQueue>,
  pub sync: Arc<SyncDriver>,
  pub market: MarketRepository,
  driver: Option<JoinHandle<()>>,
  background: Vec<JoinHandle<()>>,
}

impl App {
  pub async fn new(config: Config) -> Result<Self> {
    let db_path = config.storage_path()?;
    let db = Database::open(&db_path)?;
    info!(path = %db_path.display(), "opened store");

    let backend = Arc::new(HttpBackend::new(
      &config.backend.url,
      config.fetch_timeout(),
      Config::api_token(),
    )?
    .with_submit_timeout(config.submit_timeout()));

    let probe_url = Url::parse(config.probe_url())
      .map_err(|e| eyre!("Invalid probe url {}: {}", config.probe_url(), e))?;
    let probe = Arc::new(HttpProbe::new(probe_url, config.probe_timeout())?);
    let connectivity = Arc::new(ConnectivityOracle::new(probe).await);

    let cache = TtlCache::new(db.clone(), config.cache.namespace.clone());
    let queue = Arc::new(
      OfflineQueue::open(
        db,
        config.retry_policy(),
        config.submit_timeout(),
        backend.clone(),
      )
      .await?,
    );

    let sync = Arc::new(
      SyncDriver::new(queue.clone(), connectivity.clone(), config.sync_interval())
        .with_invalidation(cache.clone(), config.sync.invalidate_keys.clone()),
    );

    let market = MarketRepository::new(
      backend,
      cache.clone(),
      connectivity.clone(),
      config.fetch_timeout(),
      queue.clone(),
      config.resource_ttls(),
    )
    .with_sync(sync.clone());

    Ok(Self {
      config,
      cache,
      connectivity,
      queue,
      sync,
      market,
      driver: None,
      background: Vec::new(),
    })
  }

  /// Start the connectivity monitor, the sync driver and the cache sweep.
  pub fn start_background(&mut self) {
    if self.driver.is_some() {
      return;
    }

    self.driver = Some(self.sync.spawn());
    self
      .background
      .push(self.connectivity.spawn_monitor(self.config.poll_interval()));
    if let Some(interval) = self.config.purge_interval() {
      self.background.push(self.cache.spawn_purge_task(interval));
    }
  }

  /// Stop background tasks, letting the driver finish its current cycle.
  pub async fn shutdown(&mut self) {
    for handle in self.background.drain(..) {
      handle.abort();
    }
    if let Some(driver) = self.driver.take() {
      self.sync.shutdown();
      if let Err(e) = driver.await {
        warn!(error = %e, "sync driver task ended abnormally");
      }
    }
  }
}
