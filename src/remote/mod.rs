//! Contracts for the remote collaborators the offline layer talks to.

mod http;

pub use http::{HttpBackend, IDEMPOTENCY_HEADER};

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::queue::PendingOperation;

/// Why a remote call failed.
///
/// The client cannot reliably tell transient from permanent failures, so the
/// queue counts every variant except `Offline` as a consumed attempt.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RemoteError {
  /// The request never left the device (no route, connection refused, DNS).
  #[error("no network connectivity")]
  Offline,
  #[error("remote call timed out after {0:?}")]
  Timeout(Duration),
  #[error("transport error: {0}")]
  Transport(String),
  /// The backend answered with a non-success status.
  #[error("rejected with status {status}: {message}")]
  Rejected { status: u16, message: String },
  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl RemoteError {
  /// True when the failure means the device cannot reach the network at all.
  pub fn is_connectivity(&self) -> bool {
    matches!(self, RemoteError::Offline)
  }
}

/// Acknowledgement returned by the backend for a created resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitReceipt {
  pub id: String,
  #[serde(flatten)]
  pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Plain request/response reads of remote JSON resources.
pub trait FetchRemote: Send + Sync {
  fn fetch<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<serde_json::Value, RemoteError>>;
}

/// Creates remote resources from queued operations.
///
/// Implementations receive the whole operation so they can forward its id as
/// an idempotency key. Backends that ignore the key may create duplicates when
/// an acknowledgement is lost and the operation is retried.
pub trait SubmitRemote: Send + Sync {
  fn submit<'a>(&'a self, operation: &'a PendingOperation)
    -> BoxFuture<'a, Result<SubmitReceipt, RemoteError>>;
}

/// Run a remote call with a deadline; an elapsed deadline is a `Timeout`.
pub async fn with_timeout<T, Fut>(limit: Duration, call: Fut) -> Result<T, RemoteError>
where
  Fut: Future<Output = Result<T, RemoteError>>,
{
  match tokio::time::timeout(limit, call).await {
    Ok(result) => result,
    Err(_) => Err(RemoteError::Timeout(limit)),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_only_offline_is_connectivity() {
    assert!(RemoteError::Offline.is_connectivity());
    assert!(!RemoteError::Timeout(Duration::from_secs(1)).is_connectivity());
    assert!(!RemoteError::Rejected {
      status: 422,
      message: "price must be positive".to_string()
    }
    .is_connectivity());
  }

  #[test]
  fn test_receipt_keeps_extra_fields() {
    let receipt: SubmitReceipt =
      serde_json::from_str(r#"{"id":"L-9","status":"draft","views":0}"#).unwrap();

    assert_eq!(receipt.id, "L-9");
    assert_eq!(receipt.extra["status"], "draft");
  }

  #[tokio::test]
  async fn test_with_timeout_maps_elapsed() {
    let result: Result<(), _> = with_timeout(Duration::from_millis(10), async {
      tokio::time::sleep(Duration::from_millis(200)).await;
      Ok(())
    })
    .await;

    assert_eq!(result, Err(RemoteError::Timeout(Duration::from_millis(10))));
  }

  #[tokio::test]
  async fn test_with_timeout_passes_result_through() {
    let result = with_timeout(Duration::from_secs(1), async { Ok::<_, RemoteError>(5) }).await;
    assert_eq!(result, Ok(5));
  }
}
