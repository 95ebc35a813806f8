//! Cache entries with optional expiry.

use chrono::{DateTime, Utc};
use std::time::Duration;

/// A single cached value with its timestamps.
///
/// `V` is the raw byte payload when read from storage and the decoded
/// resource once a typed read succeeds.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<V = Vec<u8>> {
  pub key: String,
  pub value: V,
  pub stored_at: DateTime<Utc>,
  /// None = never expires until explicitly removed
  pub expires_at: Option<DateTime<Utc>>,
}

impl<V> CacheEntry<V> {
  /// Build an entry stored at `now` that lives for `ttl`.
  ///
  /// A TTL too large to represent as a timestamp never expires.
  pub fn new(key: impl Into<String>, value: V, ttl: Option<Duration>, now: DateTime<Utc>) -> Self {
    Self {
      key: key.into(),
      value,
      stored_at: now,
      expires_at: ttl.and_then(|ttl| expiry_from(now, ttl)),
    }
  }

  /// An entry is expired once `now` reaches `expires_at`.
  pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
    match self.expires_at {
      Some(expires) => now >= expires,
      None => false,
    }
  }

  /// Time left before expiry. None if the entry never expires or already has.
  pub fn remaining_ttl_at(&self, now: DateTime<Utc>) -> Option<Duration> {
    let expires = self.expires_at?;
    if now >= expires {
      return None;
    }
    (expires - now).to_std().ok()
  }

  /// Replace the payload, keeping key and timestamps.
  pub fn try_map<U, E>(self, f: impl FnOnce(V) -> Result<U, E>) -> Result<CacheEntry<U>, E> {
    Ok(CacheEntry {
      key: self.key,
      value: f(self.value)?,
      stored_at: self.stored_at,
      expires_at: self.expires_at,
    })
  }
}

/// Compute `now + ttl`, or None when the sum is not representable.
pub(crate) fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> Option<DateTime<Utc>> {
  chrono::Duration::from_std(ttl)
    .ok()
    .and_then(|ttl| now.checked_add_signed(ttl))
}
