//! Drains the offline queue when the network is available.
//!
//! The driver is Idle until something suggests work can be done: the device
//! comes back online, the periodic timer fires with items pending, an
//! operation is enqueued, or the UI asks for a sync. It then drains the
//! queue one operation at a time until nothing is due or the device goes
//! offline again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::cache::TtlCache;
use crate::connectivity::ConnectivityOracle;
use crate::queue::{DrainStatus, OfflineQueue, QueueEvent};
use crate::remote::SubmitReceipt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
  Idle,
  Draining,
}

/// What one drain cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
  pub completed: usize,
  pub retried: usize,
  pub failed: usize,
  /// The cycle stopped early because the device is offline
  pub aborted_offline: bool,
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
  Reconnected,
  Timer,
  Requested,
}

/// Cache keys to drop once a queued operation lands remotely, so the next
/// fetch shows the server's view.
struct Invalidation {
  cache: TtlCache,
  keys: Vec<String>,
}

pub struct SyncDriver {
  queue: Arc<OfflineQueue>,
  connectivity: Arc<ConnectivityOracle>,
  interval: Duration,
  invalidation: Option<Invalidation>,
  state: watch::Sender<SyncState>,
  wake: Arc<Notify>,
  shutdown: Notify,
  /// One drain cycle at a time, whoever triggered it
  cycle_lock: Mutex<()>,
}

impl SyncDriver {
  /// `interval` is how often pending items are retried while idle.
  pub fn new(queue: Arc<OfflineQueue>, connectivity: Arc<ConnectivityOracle>, interval: Duration) -> Self {
    let (state, _) = watch::channel(SyncState::Idle);
    Self {
      queue,
      connectivity,
      interval,
      invalidation: None,
      state,
      wake: Arc::new(Notify::new()),
      shutdown: Notify::new(),
      cycle_lock: Mutex::new(()),
    }
  }

  /// Remove `keys` from `cache` after every completed operation.
  pub fn with_invalidation(mut self, cache: TtlCache, keys: Vec<String>) -> Self {
    self.invalidation = Some(Invalidation { cache, keys });
    self
  }

  pub fn state(&self) -> SyncState {
    *self.state.borrow()
  }

  pub fn watch_state(&self) -> watch::Receiver<SyncState> {
    self.state.subscribe()
  }

  /// Ask the running driver to start a drain cycle soon.
  pub fn request_sync(&self) {
    self.wake.notify_one();
  }

  /// Stop the task started by [`spawn`](Self::spawn).
  pub fn shutdown(&self) {
    self.shutdown.notify_one();
  }

  /// Run one drain cycle now.
  ///
  /// Never fails: submit errors are recorded on the operations and storage
  /// errors end the cycle early.
  pub async fn drain_now(&self) -> DrainReport {
    let _cycle = self.cycle_lock.lock().await;
    self.state.send_replace(SyncState::Draining);

    let mut report = DrainReport::default();
    loop {
      if !self.connectivity.is_online() {
        report.aborted_offline = true;
        break;
      }

      match self.queue.drain_one().await {
        Ok(DrainStatus::Idle) => break,
        Ok(DrainStatus::Completed { id, receipt }) => {
          report.completed += 1;
          self.reconcile(&id, &receipt).await;
        }
        Ok(DrainStatus::Retrying { .. }) => report.retried += 1,
        Ok(DrainStatus::Failed { .. }) => report.failed += 1,
        Ok(DrainStatus::Offline { id }) => {
          debug!(id = %id, "submit found no network, aborting drain");
          report.aborted_offline = true;
          // Let the oracle's own probe confirm the loss
          self.connectivity.refresh().await;
          break;
        }
        Err(e) => {
          error!(error = %e, "queue drain failed");
          break;
        }
      }
    }

    self.state.send_replace(SyncState::Idle);
    info!(
      completed = report.completed,
      retried = report.retried,
      failed = report.failed,
      aborted_offline = report.aborted_offline,
      "drain cycle finished"
    );
    report
  }

  async fn reconcile(&self, id: &str, receipt: &SubmitReceipt) {
    info!(id, remote_id = %receipt.id, "queued operation applied remotely");

    let Some(invalidation) = &self.invalidation else {
      return;
    };
    for key in &invalidation.keys {
      if let Err(e) = invalidation.cache.remove(key).await {
        warn!(key = %key, error = %e, "failed to invalidate cache after sync");
      }
    }
  }

  /// Start the Idle/Draining loop on the runtime.
  pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
    let driver = Arc::clone(self);

    tokio::spawn(async move {
      let wake = Arc::clone(&driver.wake);
      let _queue_events = driver.queue.subscribe(move |event| {
        if matches!(event, QueueEvent::Enqueued { .. } | QueueEvent::Retried { .. }) {
          wake.notify_one();
        }
      });

      let mut connectivity = driver.connectivity.watch();
      let mut ticker = tokio::time::interval(driver.interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      info!(interval = ?driver.interval, "sync driver started");

      loop {
        let trigger = tokio::select! {
          changed = connectivity.changed() => {
            if changed.is_err() {
              break;
            }
            if !connectivity.borrow_and_update().is_online() {
              continue;
            }
            Trigger::Reconnected
          }
          _ = ticker.tick() => Trigger::Timer,
          _ = driver.wake.notified() => Trigger::Requested,
          _ = driver.shutdown.notified() => break,
        };

        if let Trigger::Timer = trigger {
          match driver.queue.pending_count().await {
            Ok(0) => continue,
            Ok(_) => {}
            Err(e) => {
              error!(error = %e, "failed to count pending operations");
              continue;
            }
          }
        }

        debug!(?trigger, "starting drain cycle");
        driver.drain_now().await;
      }

      info!("sync driver stopped");
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::connectivity::ManualProbe;
  use crate::db::Database;
  use crate::queue::{OperationStatus, RetryPolicy};
  use crate::remote::RemoteError;
  use crate::testing::{receipt, ScriptedSubmitter};
  use serde_json::json;

  struct Fixture {
    probe: Arc<ManualProbe>,
    oracle: Arc<ConnectivityOracle>,
    queue: Arc<OfflineQueue>,
    submitter: Arc<ScriptedSubmitter>,
    db: Database,
  }

  async fn fixture(online: bool, submitter: ScriptedSubmitter, policy: RetryPolicy) -> Fixture {
    let db = Database::open_in_memory().unwrap();
    let probe = Arc::new(ManualProbe::new(online));
    let oracle = Arc::new(ConnectivityOracle::new(probe.clone()).await);
    let submitter = Arc::new(submitter);
    let queue = Arc::new(
      OfflineQueue::open(db.clone(), policy, Duration::from_secs(5), submitter.clone())
        .await
        .unwrap(),
    );
    Fixture {
      probe,
      oracle,
      queue,
      submitter,
      db,
    }
  }

  fn no_backoff(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  fn driver(f: &Fixture) -> SyncDriver {
    SyncDriver::new(f.queue.clone(), f.oracle.clone(), Duration::from_secs(3600))
  }

  async fn wait_until_empty(queue: &OfflineQueue) {
    for _ in 0..100 {
      if queue.list_pending().await.unwrap().is_empty() {
        return;
      }
      tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("queue was not drained");
  }

  #[tokio::test]
  async fn test_drain_processes_all_due_operations() {
    let f = fixture(true, ScriptedSubmitter::new(), no_backoff(3)).await;
    let a = f.queue.enqueue(json!({"n": "a"})).await.unwrap();
    let b = f.queue.enqueue(json!({"n": "b"})).await.unwrap();

    let report = driver(&f).drain_now().await;

    assert_eq!(report.completed, 2);
    assert!(!report.aborted_offline);
    assert_eq!(f.submitter.calls(), vec![a, b]);
  }

  #[tokio::test]
  async fn test_failure_does_not_block_later_operations() {
    let submitter = ScriptedSubmitter::new();
    submitter.push(Ok(receipt("r-a")));
    submitter.push(Err(RemoteError::Rejected {
      status: 422,
      message: "missing category".to_string(),
    }));
    let policy = RetryPolicy {
      max_attempts: 3,
      base_delay: Duration::from_secs(60),
      max_delay: Duration::from_secs(60),
    };
    let f = fixture(true, submitter, policy).await;

    let a = f.queue.enqueue(json!({"n": "a"})).await.unwrap();
    let b = f.queue.enqueue(json!({"n": "b"})).await.unwrap();
    let c = f.queue.enqueue(json!({"n": "c"})).await.unwrap();

    let report = driver(&f).drain_now().await;

    assert_eq!(f.submitter.calls(), vec![a, b.clone(), c]);
    assert_eq!(report.completed, 2);
    assert_eq!(report.retried, 1);

    let remaining = f.queue.list_pending().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].id, b);
    assert!(remaining[0].last_error.as_deref().unwrap().contains("missing category"));
  }

  #[tokio::test]
  async fn test_connectivity_loss_aborts_drain() {
    let submitter = ScriptedSubmitter::new();
    submitter.push(Ok(receipt("r-a")));
    submitter.push(Err(RemoteError::Offline));
    let f = fixture(true, submitter, no_backoff(3)).await;

    f.queue.enqueue(json!({"n": "a"})).await.unwrap();
    let b = f.queue.enqueue(json!({"n": "b"})).await.unwrap();
    let c = f.queue.enqueue(json!({"n": "c"})).await.unwrap();

    let report = driver(&f).drain_now().await;

    assert!(report.aborted_offline);
    assert_eq!(report.completed, 1);
    assert_eq!(f.submitter.calls().len(), 2);

    let b = f.queue.get(&b).await.unwrap().unwrap();
    assert_eq!(b.attempt_count, 0);
    let c = f.queue.get(&c).await.unwrap().unwrap();
    assert_eq!(c.status, OperationStatus::Pending);
    assert_eq!(c.attempt_count, 0);
  }

  #[tokio::test]
  async fn test_offline_drain_does_nothing() {
    let f = fixture(false, ScriptedSubmitter::new(), no_backoff(3)).await;
    f.queue.enqueue(json!({})).await.unwrap();

    let report = driver(&f).drain_now().await;

    assert!(report.aborted_offline);
    assert!(f.submitter.calls().is_empty());
    assert_eq!(f.queue.pending_count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_failed_operation_is_not_retried_automatically() {
    let f = fixture(true, ScriptedSubmitter::always_failing(), no_backoff(3)).await;
    f.queue.enqueue(json!({})).await.unwrap();
    let driver = driver(&f);

    let report = driver.drain_now().await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.retried, 2);
    assert_eq!(f.submitter.calls().len(), 3);

    let report = driver.drain_now().await;
    assert_eq!(report, DrainReport::default());
    assert_eq!(f.submitter.calls().len(), 3);
  }

  #[tokio::test]
  async fn test_completed_operation_invalidates_cache_keys() {
    let f = fixture(true, ScriptedSubmitter::new(), no_backoff(3)).await;
    let cache = TtlCache::new(f.db.clone(), "market");
    cache.set_json("listings", &json!(["L1"]), None).await.unwrap();
    cache.set_json("categories", &json!(["tools"]), None).await.unwrap();

    let driver = driver(&f).with_invalidation(cache.clone(), vec!["listings".to_string()]);
    f.queue.enqueue(json!({"title": "Chair"})).await.unwrap();
    driver.drain_now().await;

    assert!(!cache.has("listings").await.unwrap());
    assert!(cache.has("categories").await.unwrap());
  }

  #[tokio::test]
  async fn test_reconnect_triggers_drain() {
    let f = fixture(false, ScriptedSubmitter::new(), no_backoff(3)).await;
    let driver = Arc::new(driver(&f));
    let handle = driver.spawn();

    let id = f
      .queue
      .enqueue(json!({"title": "Chair", "price": 1000}))
      .await
      .unwrap();
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(f.queue.list_pending().await.unwrap().len(), 1);

    f.probe.set_online(true);
    f.oracle.refresh().await;

    wait_until_empty(&f.queue).await;
    assert_eq!(f.submitter.calls(), vec![id]);
    assert_eq!(driver.state(), SyncState::Idle);

    driver.shutdown();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_enqueue_while_online_triggers_drain() {
    let f = fixture(true, ScriptedSubmitter::new(), no_backoff(3)).await;
    let driver = Arc::new(driver(&f));
    let handle = driver.spawn();
    // Let the driver subscribe before enqueueing
    tokio::time::sleep(Duration::from_millis(20)).await;

    f.queue.enqueue(json!({"title": "Lamp"})).await.unwrap();

    wait_until_empty(&f.queue).await;
    assert_eq!(f.submitter.calls().len(), 1);

    driver.shutdown();
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn test_retry_wakes_running_driver() {
    let f = fixture(true, ScriptedSubmitter::always_failing(), no_backoff(1)).await;
    let driver = Arc::new(driver(&f));
    let id = f.queue.enqueue(json!({})).await.unwrap();
    driver.drain_now().await;
    assert_eq!(
      f.queue.get(&id).await.unwrap().unwrap().status,
      OperationStatus::Failed
    );

    let handle = driver.spawn();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let mut states = driver.watch_state();
    states.borrow_and_update();

    // The periodic tick is an hour away; only the retry event can start a cycle
    f.submitter.succeed_from_now();
    assert!(f.queue.retry(&id).await.unwrap());

    wait_until_empty(&f.queue).await;
    assert_eq!(f.submitter.calls().len(), 2);
    assert!(states.has_changed().unwrap());

    driver.shutdown();
    handle.await.unwrap();
  }
}
