//! Process-wide online/offline state.
//!
//! The oracle owns the state; only its probe can change it. Consumers read
//! the current value, subscribe to transitions with a callback, or hold a
//! `watch` receiver.

use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info};
use url::Url;

use crate::notify::{Listeners, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
  Online,
  Offline,
}

impl ConnectivityState {
  pub fn is_online(self) -> bool {
    self == ConnectivityState::Online
  }

  fn from_reachable(reachable: bool) -> Self {
    if reachable {
      ConnectivityState::Online
    } else {
      ConnectivityState::Offline
    }
  }
}

/// Something that can tell whether the backend is reachable right now.
pub trait Probe: Send + Sync {
  fn check(&self) -> BoxFuture<'_, bool>;
}

/// Reachability probe that sends a `HEAD` request.
///
/// Any HTTP response, including an error status, proves the network works.
pub struct HttpProbe {
  client: reqwest::Client,
  url: Url,
}

impl HttpProbe {
  pub fn new(url: Url, timeout: Duration) -> color_eyre::Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| color_eyre::eyre::eyre!("Failed to create probe client: {}", e))?;
    Ok(Self { client, url })
  }
}

impl Probe for HttpProbe {
  fn check(&self) -> BoxFuture<'_, bool> {
    async move {
      match self.client.head(self.url.clone()).send().await {
        Ok(_) => true,
        Err(e) => {
          debug!(error = %e, "connectivity probe failed");
          false
        }
      }
    }
    .boxed()
  }
}

/// Probe driven by an external signal, e.g. a platform network callback.
#[derive(Debug)]
pub struct ManualProbe {
  online: AtomicBool,
}

impl ManualProbe {
  pub fn new(online: bool) -> Self {
    Self {
      online: AtomicBool::new(online),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }
}

impl Probe for ManualProbe {
  fn check(&self) -> BoxFuture<'_, bool> {
    futures::future::ready(self.online.load(Ordering::SeqCst)).boxed()
  }
}

/// Single source of truth for connectivity.
pub struct ConnectivityOracle {
  probe: Arc<dyn Probe>,
  state: watch::Sender<ConnectivityState>,
  listeners: Listeners<ConnectivityState>,
  /// Serializes probes so transitions are published in order
  refresh_lock: Mutex<()>,
}

impl ConnectivityOracle {
  /// Build the oracle, seeding its state with one probe.
  pub async fn new(probe: Arc<dyn Probe>) -> Self {
    let initial = ConnectivityState::from_reachable(probe.check().await);
    info!(state = ?initial, "connectivity initialized");

    let (state, _) = watch::channel(initial);
    Self {
      probe,
      state,
      listeners: Listeners::new(),
      refresh_lock: Mutex::new(()),
    }
  }

  pub fn state(&self) -> ConnectivityState {
    *self.state.borrow()
  }

  /// Last known state. Call [`refresh`](Self::refresh) to probe again.
  pub fn is_online(&self) -> bool {
    self.state().is_online()
  }

  /// Probe now and publish a transition if the state changed.
  pub async fn refresh(&self) -> ConnectivityState {
    let _guard = self.refresh_lock.lock().await;
    let next = ConnectivityState::from_reachable(self.probe.check().await);

    let changed = self.state.send_if_modified(|current| {
      if *current == next {
        return false;
      }
      *current = next;
      true
    });

    if changed {
      info!(state = ?next, "connectivity changed");
      self.listeners.emit(&next);
    }
    next
  }

  /// Call `callback` on every transition (never on unchanged probes).
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&ConnectivityState) + Send + Sync + 'static,
  {
    self.listeners.subscribe(callback)
  }

  /// Receiver that wakes on every transition.
  pub fn watch(&self) -> watch::Receiver<ConnectivityState> {
    self.state.subscribe()
  }

  /// Probe every `interval` until the oracle is dropped.
  pub fn spawn_monitor(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
    let oracle: Weak<Self> = Arc::downgrade(self);

    tokio::spawn(async move {
      loop {
        tokio::time::sleep(interval).await;
        let Some(oracle) = oracle.upgrade() else {
          break;
        };
        oracle.refresh().await;
      }
    })
  }
}
