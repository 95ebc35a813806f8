//! Queued operations and their retry policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// A mutating call recorded locally, waiting to be applied remotely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
  /// Generated at enqueue time; doubles as the idempotency key
  pub id: String,
  /// Everything needed to replay the original call
  pub payload: serde_json::Value,
  pub status: OperationStatus,
  pub attempt_count: u32,
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
  /// Earliest time the next automatic attempt may start
  pub next_attempt_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
  Pending,
  InFlight,
  Failed,
  Completed,
}

impl OperationStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      OperationStatus::Pending => "pending",
      OperationStatus::InFlight => "in_flight",
      OperationStatus::Failed => "failed",
      OperationStatus::Completed => "completed",
    }
  }
}

impl std::fmt::Display for OperationStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for OperationStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(OperationStatus::Pending),
      "in_flight" => Ok(OperationStatus::InFlight),
      "failed" => Ok(OperationStatus::Failed),
      "completed" => Ok(OperationStatus::Completed),
      other => Err(format!("unknown operation status '{}'", other)),
    }
  }
}

/// Bounded retry with capped exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Attempts after which an operation is marked Failed
  pub max_attempts: u32,
  pub base_delay: Duration,
  pub max_delay: Duration,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      base_delay: Duration::from_secs(2),
      max_delay: Duration::from_secs(300),
    }
  }
}

impl RetryPolicy {
  /// Delay before the next attempt once `attempts` have failed.
  ///
  /// `base * 2^(attempts - 1)`, never more than `max_delay`.
  pub fn backoff(&self, attempts: u32) -> Duration {
    if attempts == 0 {
      return Duration::ZERO;
    }
    let factor = 1u32.checked_shl(attempts - 1).unwrap_or(u32::MAX);
    self.base_delay.saturating_mul(factor).min(self.max_delay)
  }

  pub fn is_exhausted(&self, attempts: u32) -> bool {
    attempts >= self.max_attempts
  }
}
