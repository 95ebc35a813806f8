//! Durable write-behind queue for mutations made while disconnected.
//!
//! Operations are persisted on enqueue and drained one at a time, oldest
//! first. Each failed attempt is counted; once the retry policy is exhausted
//! the operation stays `Failed` until the user retries or removes it.

mod operation;

pub use operation::{OperationStatus, PendingOperation, RetryPolicy};

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::db::Database;
use crate::notify::{Listeners, Subscription};
use crate::remote::{with_timeout, RemoteError, SubmitReceipt, SubmitRemote};

/// Change notification fired on every enqueue, transition and removal.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
  Enqueued { id: String },
  StatusChanged { id: String, status: OperationStatus },
  /// A failed operation was made eligible again; its status is `Pending`
  Retried { id: String },
  Removed { id: String },
}

/// Outcome of a single `drain_one` call.
#[derive(Debug, Clone, PartialEq)]
pub enum DrainStatus {
  /// Nothing is due
  Idle,
  Completed { id: String, receipt: SubmitReceipt },
  /// Attempt failed; the operation goes back to Pending after a backoff
  Retrying {
    id: String,
    attempt_count: u32,
    next_attempt_at: DateTime<Utc>,
  },
  /// Attempt failed and the retry budget is spent
  Failed { id: String, attempt_count: u32 },
  /// The device could not reach the network; no attempt was consumed
  Offline { id: String },
}

/// Durable FIFO of pending operations.
pub struct OfflineQueue {
  db: Database,
  policy: RetryPolicy,
  submit_timeout: Duration,
  submitter: Arc<dyn SubmitRemote>,
  listeners: Listeners<QueueEvent>,
  /// Held for the whole of a drain so at most one operation is in flight
  drain_lock: Mutex<()>,
}

impl OfflineQueue {
  /// Open the queue on `db`.
  ///
  /// Operations left `InFlight` by a previous process are put back to
  /// `Pending` without counting an attempt.
  pub async fn open(
    db: Database,
    policy: RetryPolicy,
    submit_timeout: Duration,
    submitter: Arc<dyn SubmitRemote>,
  ) -> Result<Self> {
    let recovered = db
      .call(|conn| {
        conn
          .execute(
            "UPDATE pending_operations SET status = ? WHERE status = ?",
            params![
              OperationStatus::Pending.as_str(),
              OperationStatus::InFlight.as_str()
            ],
          )
          .map_err(|e| eyre!("Failed to recover in-flight operations: {}", e))
      })
      .await?;

    if recovered > 0 {
      info!(recovered, "reset interrupted operations to pending");
    }

    Ok(Self {
      db,
      policy,
      submit_timeout,
      submitter,
      listeners: Listeners::new(),
      drain_lock: Mutex::new(()),
    })
  }

  pub fn policy(&self) -> RetryPolicy {
    self.policy
  }

  /// Observe queue changes.
  pub fn subscribe<F>(&self, callback: F) -> Subscription
  where
    F: Fn(&QueueEvent) + Send + Sync + 'static,
  {
    self.listeners.subscribe(callback)
  }

  /// Persist a new operation and return its id. Never touches the network.
  pub async fn enqueue(&self, payload: serde_json::Value) -> Result<String> {
    let now = Utc::now();
    let operation = PendingOperation {
      id: uuid::Uuid::new_v4().to_string(),
      payload,
      status: OperationStatus::Pending,
      attempt_count: 0,
      last_error: None,
      created_at: now,
      next_attempt_at: now,
    };
    let id = operation.id.clone();

    self
      .db
      .call(move |conn| {
        let payload = serde_json::to_string(&operation.payload)
          .map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
        conn
          .execute(
            "INSERT INTO pending_operations
               (id, payload, status, attempt_count, last_error, created_at, next_attempt_at)
             VALUES (?, ?, ?, 0, NULL, ?, ?)",
            params![
              operation.id,
              payload,
              operation.status.as_str(),
              operation.created_at.timestamp_millis(),
              operation.next_attempt_at.timestamp_millis(),
            ],
          )
          .map_err(|e| eyre!("Failed to enqueue operation: {}", e))?;
        Ok(())
      })
      .await?;

    info!(id = %id, "operation enqueued");
    self.listeners.emit(&QueueEvent::Enqueued { id: id.clone() });
    Ok(id)
  }

  /// Attempt the oldest due `Pending` operation.
  ///
  /// Concurrent callers are serialized; the second waits for the first to
  /// finish rather than submitting in parallel.
  pub async fn drain_one(&self) -> Result<DrainStatus> {
    let _guard = self.drain_lock.lock().await;

    let Some(operation) = self.claim_next().await? else {
      return Ok(DrainStatus::Idle);
    };
    self.emit_status(&operation.id, OperationStatus::InFlight);
    debug!(id = %operation.id, attempt = operation.attempt_count + 1, "submitting operation");

    let result = with_timeout(self.submit_timeout, self.submitter.submit(&operation)).await;

    match result {
      Ok(receipt) => {
        self.delete(&operation.id).await?;
        info!(id = %operation.id, remote_id = %receipt.id, "operation completed");
        self.emit_status(&operation.id, OperationStatus::Completed);
        self.listeners.emit(&QueueEvent::Removed {
          id: operation.id.clone(),
        });
        Ok(DrainStatus::Completed {
          id: operation.id,
          receipt,
        })
      }
      Err(error) if error.is_connectivity() => {
        self
          .record_failure(&operation, operation.attempt_count, &error, Utc::now())
          .await?;
        info!(id = %operation.id, "device offline, operation left pending");
        self.emit_status(&operation.id, OperationStatus::Pending);
        Ok(DrainStatus::Offline { id: operation.id })
      }
      Err(error) => self.fail_attempt(operation, error).await,
    }
  }

  async fn fail_attempt(&self, operation: PendingOperation, error: RemoteError) -> Result<DrainStatus> {
    let attempt_count = operation.attempt_count + 1;

    if self.policy.is_exhausted(attempt_count) {
      self
        .record_terminal_failure(&operation.id, attempt_count, &error)
        .await?;
      warn!(id = %operation.id, attempt_count, error = %error, "operation failed permanently");
      self.emit_status(&operation.id, OperationStatus::Failed);
      return Ok(DrainStatus::Failed {
        id: operation.id,
        attempt_count,
      });
    }

    let now = Utc::now();
    let next_attempt_at = chrono::Duration::from_std(self.policy.backoff(attempt_count))
      .ok()
      .and_then(|delay| now.checked_add_signed(delay))
      .unwrap_or(now);

    self
      .record_failure(&operation, attempt_count, &error, next_attempt_at)
      .await?;
    warn!(id = %operation.id, attempt_count, error = %error, "operation attempt failed, will retry");
    self.emit_status(&operation.id, OperationStatus::Pending);
    Ok(DrainStatus::Retrying {
      id: operation.id,
      attempt_count,
      next_attempt_at,
    })
  }

  /// Reset a `Failed` operation so it is drained again.
  ///
  /// Returns false if there is no failed operation with that id.
  pub async fn retry(&self, id: &str) -> Result<bool> {
    let owned = id.to_string();
    let changed = self
      .db
      .call(move |conn| {
        conn
          .execute(
            "UPDATE pending_operations
             SET status = ?, attempt_count = 0, next_attempt_at = ?
             WHERE id = ? AND status = ?",
            params![
              OperationStatus::Pending.as_str(),
              Utc::now().timestamp_millis(),
              owned,
              OperationStatus::Failed.as_str(),
            ],
          )
          .map_err(|e| eyre!("Failed to retry operation: {}", e))
      })
      .await?;

    if changed == 0 {
      return Ok(false);
    }
    info!(id, "failed operation reset for retry");
    self.listeners.emit(&QueueEvent::Retried { id: id.to_string() });
    Ok(true)
  }

  /// Permanently discard an operation. Returns false if the id is unknown.
  pub async fn remove(&self, id: &str) -> Result<bool> {
    if !self.delete(id).await? {
      return Ok(false);
    }
    info!(id, "operation removed");
    self.listeners.emit(&QueueEvent::Removed { id: id.to_string() });
    Ok(true)
  }

  /// Every retained operation, oldest first.
  ///
  /// Rows that cannot be decoded are logged and left out.
  pub async fn list_pending(&self) -> Result<Vec<PendingOperation>> {
    self
      .db
      .call(|conn| {
        let mut stmt = conn
          .prepare(&format!("SELECT seq, {} FROM pending_operations ORDER BY seq", COLUMNS))
          .map_err(|e| eyre!("Failed to prepare queue listing: {}", e))?;

        let rows = stmt
          .query_map([], |row| {
            let seq: i64 = row.get(0)?;
            Ok((seq, read_row_at(row, 1)))
          })
          .map_err(|e| eyre!("Failed to list operations: {}", e))?;

        let mut operations = Vec::new();
        for row in rows {
          let (seq, raw) = row.map_err(|e| eyre!("Failed to read operation: {}", e))?;
          match raw
            .map_err(|e| eyre!("Failed to read operation: {}", e))
            .and_then(RawOperation::decode)
          {
            Ok(operation) => operations.push(operation),
            Err(e) => warn!(seq, error = %e, "skipping unreadable queued operation"),
          }
        }
        Ok(operations)
      })
      .await
  }

  pub async fn get(&self, id: &str) -> Result<Option<PendingOperation>> {
    let id = id.to_string();
    self
      .db
      .call(move |conn| {
        conn
          .query_row(
            &format!("SELECT {} FROM pending_operations WHERE id = ?", COLUMNS),
            params![id],
            read_row,
          )
          .optional()
          .map_err(|e| eyre!("Failed to read operation: {}", e))?
          .map(RawOperation::decode)
          .transpose()
      })
      .await
  }

  /// Number of operations still eligible for automatic draining.
  pub async fn pending_count(&self) -> Result<usize> {
    self
      .db
      .call(|conn| {
        conn
          .query_row(
            "SELECT COUNT(*) FROM pending_operations WHERE status = ?",
            params![OperationStatus::Pending.as_str()],
            |row| row.get::<_, i64>(0),
          )
          .map(|count| count as usize)
          .map_err(|e| eyre!("Failed to count pending operations: {}", e))
      })
      .await
  }

  /// Pick the oldest due Pending operation and mark it InFlight.
  ///
  /// A row that cannot be read back is marked Failed on the way so it never
  /// holds up the operations queued behind it.
  async fn claim_next(&self) -> Result<Option<PendingOperation>> {
    let (claimed, quarantined) = self
      .db
      .call(|conn| {
        let tx = conn
          .transaction()
          .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;
        let now = Utc::now().timestamp_millis();
        let mut quarantined = Vec::new();

        let claimed = loop {
          let seq: Option<i64> = tx
            .query_row(
              "SELECT seq FROM pending_operations
               WHERE status = ? AND next_attempt_at <= ?
               ORDER BY seq LIMIT 1",
              params![OperationStatus::Pending.as_str(), now],
              |row| row.get(0),
            )
            .optional()
            .map_err(|e| eyre!("Failed to select next operation: {}", e))?;

          let Some(seq) = seq else {
            break None;
          };

          let read = tx
            .query_row(
              &format!("SELECT {} FROM pending_operations WHERE seq = ?", COLUMNS),
              params![seq],
              read_row,
            )
            .map_err(|e| eyre!("Failed to read operation: {}", e))
            .and_then(RawOperation::decode);

          match read {
            Ok(mut operation) => {
              tx.execute(
                "UPDATE pending_operations SET status = ? WHERE seq = ?",
                params![OperationStatus::InFlight.as_str(), seq],
              )
              .map_err(|e| eyre!("Failed to mark operation in flight: {}", e))?;
              operation.status = OperationStatus::InFlight;
              break Some(operation);
            }
            Err(e) => {
              let id = tx
                .query_row(
                  "SELECT id FROM pending_operations WHERE seq = ?",
                  params![seq],
                  |row| row.get::<_, String>(0),
                )
                .ok();
              tx.execute(
                "UPDATE pending_operations SET status = ?, last_error = ? WHERE seq = ?",
                params![
                  OperationStatus::Failed.as_str(),
                  format!("unreadable operation: {}", e),
                  seq
                ],
              )
              .map_err(|e| eyre!("Failed to quarantine operation: {}", e))?;
              quarantined.push((seq, id, e.to_string()));
            }
          }
        };

        tx.commit()
          .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;
        Ok((claimed, quarantined))
      })
      .await?;

    for (seq, id, error) in quarantined {
      warn!(seq, id = ?id, error = %error, "unreadable operation marked failed");
      if let Some(id) = id {
        self.emit_status(&id, OperationStatus::Failed);
      }
    }
    Ok(claimed)
  }

  async fn record_failure(
    &self,
    operation: &PendingOperation,
    attempt_count: u32,
    error: &RemoteError,
    next_attempt_at: DateTime<Utc>,
  ) -> Result<()> {
    let id = operation.id.clone();
    let message = error.to_string();
    self
      .db
      .call(move |conn| {
        conn
          .execute(
            "UPDATE pending_operations
             SET status = ?, attempt_count = ?, last_error = ?, next_attempt_at = ?
             WHERE id = ?",
            params![
              OperationStatus::Pending.as_str(),
              attempt_count,
              message,
              next_attempt_at.timestamp_millis(),
              id,
            ],
          )
          .map_err(|e| eyre!("Failed to record failed attempt: {}", e))?;
        Ok(())
      })
      .await
  }

  async fn record_terminal_failure(&self, id: &str, attempt_count: u32, error: &RemoteError) -> Result<()> {
    let id = id.to_string();
    let message = error.to_string();
    self
      .db
      .call(move |conn| {
        conn
          .execute(
            "UPDATE pending_operations SET status = ?, attempt_count = ?, last_error = ? WHERE id = ?",
            params![OperationStatus::Failed.as_str(), attempt_count, message, id],
          )
          .map_err(|e| eyre!("Failed to mark operation failed: {}", e))?;
        Ok(())
      })
      .await
  }

  async fn delete(&self, id: &str) -> Result<bool> {
    let id = id.to_string();
    self
      .db
      .call(move |conn| delete_operation(conn, &id))
      .await
  }

  fn emit_status(&self, id: &str, status: OperationStatus) {
    self.listeners.emit(&QueueEvent::StatusChanged {
      id: id.to_string(),
      status,
    });
  }
}

const COLUMNS: &str =
  "id, payload, status, attempt_count, last_error, created_at, next_attempt_at";

/// Row as stored, before payload and status are parsed.
struct RawOperation {
  id: String,
  payload: String,
  status: String,
  attempt_count: u32,
  last_error: Option<String>,
  created_at: i64,
  next_attempt_at: i64,
}

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawOperation> {
  read_row_at(row, 0)
}

/// Read [`COLUMNS`] starting at column `first`.
fn read_row_at(row: &Row<'_>, first: usize) -> rusqlite::Result<RawOperation> {
  Ok(RawOperation {
    id: row.get(first)?,
    payload: row.get(first + 1)?,
    status: row.get(first + 2)?,
    attempt_count: row.get(first + 3)?,
    last_error: row.get(first + 4)?,
    created_at: row.get(first + 5)?,
    next_attempt_at: row.get(first + 6)?,
  })
}

impl RawOperation {
  fn decode(self) -> Result<PendingOperation> {
    let payload = serde_json::from_str(&self.payload)
      .map_err(|e| eyre!("Failed to parse payload of operation {}: {}", self.id, e))?;
    let status = self.status.parse().map_err(|e: String| eyre!(e))?;

    Ok(PendingOperation {
      payload,
      status,
      attempt_count: self.attempt_count,
      last_error: self.last_error,
      created_at: parse_millis(self.created_at)?,
      next_attempt_at: parse_millis(self.next_attempt_at)?,
      id: self.id,
    })
  }
}

fn parse_millis(ms: i64) -> Result<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| eyre!("Invalid timestamp {}", ms))
}

fn delete_operation(conn: &Connection, id: &str) -> Result<bool> {
  let removed = conn
    .execute("DELETE FROM pending_operations WHERE id = ?", params![id])
    .map_err(|e| eyre!("Failed to delete operation: {}", e))?;
  Ok(removed > 0)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::testing::ScriptedSubmitter;
  use serde_json::json;

  fn policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
      max_attempts,
      base_delay: Duration::ZERO,
      max_delay: Duration::ZERO,
    }
  }

  async fn queue_with(submitter: Arc<ScriptedSubmitter>, max_attempts: u32) -> OfflineQueue {
    OfflineQueue::open(
      Database::open_in_memory().unwrap(),
      policy(max_attempts),
      Duration::from_secs(5),
      submitter,
    )
    .await
    .unwrap()
  }

  #[tokio::test]
  async fn test_enqueue_lists_pending() {
    let queue = queue_with(Arc::new(ScriptedSubmitter::new()), 3).await;
    let id = queue
      .enqueue(json!({"title": "Chair", "price": 1000}))
      .await
      .unwrap();

    let pending = queue.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
    assert_eq!(pending[0].status, OperationStatus::Pending);
    assert_eq!(pending[0].attempt_count, 0);
    assert_eq!(pending[0].payload, json!({"title": "Chair", "price": 1000}));
  }

  #[tokio::test]
  async fn test_drain_success_removes_operation() {
    let submitter = Arc::new(ScriptedSubmitter::new());
    let queue = queue_with(submitter.clone(), 3).await;
    let id = queue.enqueue(json!({"title": "Lamp"})).await.unwrap();

    let status = queue.drain_one().await.unwrap();
    assert!(matches!(status, DrainStatus::Completed { id: ref done, .. } if *done == id));
    assert!(queue.list_pending().await.unwrap().is_empty());
    assert_eq!(submitter.calls(), vec![id]);
  }

  #[tokio::test]
  async fn test_drain_empty_queue_is_idle() {
    let queue = queue_with(Arc::new(ScriptedSubmitter::new()), 3).await;
    assert_eq!(queue.drain_one().await.unwrap(), DrainStatus::Idle);
  }

  #[tokio::test]
  async fn test_bounded_retry_reaches_failed() {
    let submitter = Arc::new(ScriptedSubmitter::always_failing());
    let queue = queue_with(submitter.clone(), 3).await;
    let id = queue.enqueue(json!({"title": "Desk"})).await.unwrap();

    assert!(matches!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Retrying { attempt_count: 1, .. }
    ));
    assert!(matches!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Retrying { attempt_count: 2, .. }
    ));
    assert!(matches!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Failed { attempt_count: 3, .. }
    ));

    // Failed items are not drained automatically
    assert_eq!(queue.drain_one().await.unwrap(), DrainStatus::Idle);
    assert_eq!(submitter.calls().len(), 3);

    let op = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Failed);
    assert_eq!(op.attempt_count, 3);
    assert!(op.last_error.unwrap().contains("500"));
  }

  #[tokio::test]
  async fn test_retry_resets_counter() {
    let submitter = Arc::new(ScriptedSubmitter::always_failing());
    let queue = queue_with(submitter.clone(), 1).await;
    let id = queue.enqueue(json!({"title": "Sofa"})).await.unwrap();

    queue.drain_one().await.unwrap();
    assert_eq!(
      queue.get(&id).await.unwrap().unwrap().status,
      OperationStatus::Failed
    );

    assert!(queue.retry(&id).await.unwrap());
    let op = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.attempt_count, 0);

    submitter.succeed_from_now();
    assert!(matches!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Completed { .. }
    ));
    assert_eq!(submitter.calls().len(), 2);
  }

  #[tokio::test]
  async fn test_retry_only_applies_to_failed() {
    let queue = queue_with(Arc::new(ScriptedSubmitter::new()), 3).await;
    let id = queue.enqueue(json!({})).await.unwrap();

    assert!(!queue.retry(&id).await.unwrap());
    assert!(!queue.retry("missing").await.unwrap());
  }

  #[tokio::test]
  async fn test_offline_failure_does_not_consume_attempt() {
    let submitter = Arc::new(ScriptedSubmitter::new());
    submitter.push(Err(RemoteError::Offline));
    let queue = queue_with(submitter.clone(), 3).await;
    let id = queue.enqueue(json!({"title": "Bike"})).await.unwrap();

    assert_eq!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Offline { id: id.clone() }
    );
    let op = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.attempt_count, 0);
  }

  #[tokio::test]
  async fn test_backoff_gates_next_attempt() {
    let submitter = Arc::new(ScriptedSubmitter::new());
    submitter.push(Err(RemoteError::Transport("reset".to_string())));
    let queue = OfflineQueue::open(
      Database::open_in_memory().unwrap(),
      RetryPolicy {
        max_attempts: 5,
        base_delay: Duration::from_secs(60),
        max_delay: Duration::from_secs(600),
      },
      Duration::from_secs(5),
      submitter.clone(),
    )
    .await
    .unwrap();

    let first = queue.enqueue(json!({"n": 1})).await.unwrap();
    let second = queue.enqueue(json!({"n": 2})).await.unwrap();

    assert!(matches!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Retrying { ref id, .. } if *id == first
    ));
    // The first item is backing off; the younger one is not blocked by it
    assert!(matches!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Completed { ref id, .. } if *id == second
    ));
    assert_eq!(queue.drain_one().await.unwrap(), DrainStatus::Idle);
    assert_eq!(queue.pending_count().await.unwrap(), 1);
  }

  #[tokio::test]
  async fn test_drain_is_fifo() {
    let submitter = Arc::new(ScriptedSubmitter::new());
    let queue = queue_with(submitter.clone(), 3).await;
    let a = queue.enqueue(json!({"n": "a"})).await.unwrap();
    let b = queue.enqueue(json!({"n": "b"})).await.unwrap();
    let c = queue.enqueue(json!({"n": "c"})).await.unwrap();

    while queue.drain_one().await.unwrap() != DrainStatus::Idle {}

    assert_eq!(submitter.calls(), vec![a, b, c]);
  }

  #[tokio::test]
  async fn test_submit_timeout_counts_as_attempt() {
    let submitter = Arc::new(ScriptedSubmitter::new().with_delay(Duration::from_millis(200)));
    let queue = OfflineQueue::open(
      Database::open_in_memory().unwrap(),
      policy(3),
      Duration::from_millis(20),
      submitter,
    )
    .await
    .unwrap();
    let id = queue.enqueue(json!({})).await.unwrap();

    assert!(matches!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Retrying { attempt_count: 1, .. }
    ));
    let op = queue.get(&id).await.unwrap().unwrap();
    assert!(op.last_error.unwrap().contains("timed out"));
  }

  #[tokio::test]
  async fn test_remove_discards_operation() {
    let queue = queue_with(Arc::new(ScriptedSubmitter::new()), 3).await;
    let id = queue.enqueue(json!({})).await.unwrap();

    assert!(queue.remove(&id).await.unwrap());
    assert!(!queue.remove(&id).await.unwrap());
    assert!(queue.list_pending().await.unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_events_follow_lifecycle() {
    let queue = queue_with(Arc::new(ScriptedSubmitter::new()), 3).await;
    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = events.clone();
    let _sub = queue.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    let id = queue.enqueue(json!({})).await.unwrap();
    queue.drain_one().await.unwrap();

    let events = events.lock().unwrap().clone();
    assert_eq!(
      events,
      vec![
        QueueEvent::Enqueued { id: id.clone() },
        QueueEvent::StatusChanged {
          id: id.clone(),
          status: OperationStatus::InFlight
        },
        QueueEvent::StatusChanged {
          id: id.clone(),
          status: OperationStatus::Completed
        },
        QueueEvent::Removed { id },
      ]
    );
  }

  #[tokio::test]
  async fn test_retry_emits_retried_event() {
    let queue = queue_with(Arc::new(ScriptedSubmitter::always_failing()), 1).await;
    let id = queue.enqueue(json!({})).await.unwrap();
    queue.drain_one().await.unwrap();

    let events = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = events.clone();
    let _sub = queue.subscribe(move |event| sink.lock().unwrap().push(event.clone()));

    assert!(queue.retry(&id).await.unwrap());
    assert_eq!(*events.lock().unwrap(), vec![QueueEvent::Retried { id }]);
  }

  async fn insert_raw(queue: &OfflineQueue, id: &'static str, payload: &'static str) {
    queue
      .db
      .call(move |conn| {
        let now = Utc::now().timestamp_millis();
        conn
          .execute(
            "INSERT INTO pending_operations
             (id, payload, status, attempt_count, last_error, created_at, next_attempt_at)
             VALUES (?, ?, 'pending', 0, NULL, ?, ?)",
            params![id, payload, now, now],
          )
          .map_err(|e| eyre!("{}", e))?;
        Ok(())
      })
      .await
      .unwrap();
  }

  async fn raw_status(queue: &OfflineQueue, id: &'static str) -> (String, Option<String>) {
    queue
      .db
      .call(move |conn| {
        conn
          .query_row(
            "SELECT status, last_error FROM pending_operations WHERE id = ?",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .map_err(|e| eyre!("{}", e))
      })
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_unreadable_row_does_not_block_queue() {
    let submitter = Arc::new(ScriptedSubmitter::new());
    let queue = queue_with(submitter.clone(), 3).await;
    insert_raw(&queue, "broken", "{not json").await;
    let id = queue.enqueue(json!({"title": "Chair"})).await.unwrap();

    assert!(matches!(
      queue.drain_one().await.unwrap(),
      DrainStatus::Completed { id: ref done, .. } if *done == id
    ));
    assert_eq!(submitter.calls(), vec![id]);

    let (status, last_error) = raw_status(&queue, "broken").await;
    assert_eq!(status, "failed");
    assert!(last_error.unwrap().contains("unreadable"));
    assert_eq!(queue.drain_one().await.unwrap(), DrainStatus::Idle);
  }

  #[tokio::test]
  async fn test_list_pending_skips_unreadable_rows() {
    let queue = queue_with(Arc::new(ScriptedSubmitter::new()), 3).await;
    insert_raw(&queue, "broken", "{not json").await;
    let id = queue.enqueue(json!({"title": "Lamp"})).await.unwrap();

    let pending = queue.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
  }

  #[tokio::test]
  async fn test_queue_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.db");
    let submitter = Arc::new(ScriptedSubmitter::new());

    let id = {
      let queue = OfflineQueue::open(
        Database::open(&path).unwrap(),
        policy(3),
        Duration::from_secs(5),
        submitter.clone(),
      )
      .await
      .unwrap();
      queue.enqueue(json!({"title": "Chair"})).await.unwrap()
    };

    let queue = OfflineQueue::open(
      Database::open(&path).unwrap(),
      policy(3),
      Duration::from_secs(5),
      submitter,
    )
    .await
    .unwrap();
    let pending = queue.list_pending().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id, id);
  }

  #[tokio::test]
  async fn test_interrupted_operation_recovered_on_open() {
    let db = Database::open_in_memory().unwrap();
    let submitter = Arc::new(ScriptedSubmitter::new());
    let queue = OfflineQueue::open(db.clone(), policy(3), Duration::from_secs(5), submitter.clone())
      .await
      .unwrap();
    let id = queue.enqueue(json!({})).await.unwrap();

    // Simulate a crash between claim and acknowledgement
    let claimed = queue.claim_next().await.unwrap().unwrap();
    assert_eq!(claimed.status, OperationStatus::InFlight);
    drop(queue);

    let queue = OfflineQueue::open(db, policy(3), Duration::from_secs(5), submitter)
      .await
      .unwrap();
    let op = queue.get(&id).await.unwrap().unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.attempt_count, 0);
  }
}
