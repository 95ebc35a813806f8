//! Persistent TTL cache backed by the shared SQLite database.

use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::types::Value;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::entry::{expiry_from, CacheEntry};
use crate::db::Database;

/// Invalidation counters. Both only grow, so their sum changes on every
/// `remove` or `clear`.
#[derive(Default)]
struct Epochs {
  namespace: u64,
  keys: HashMap<String, u64>,
}

impl Epochs {
  fn of(&self, key: &str) -> u64 {
    self.namespace + self.keys.get(key).copied().unwrap_or(0)
  }
}

fn lock(epochs: &Mutex<Epochs>) -> MutexGuard<'_, Epochs> {
  epochs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Namespaced key/value store with per-key expiry.
///
/// Expired and corrupt entries read as a miss and are evicted on the way out.
/// `clear` only touches rows in this store's namespace.
///
/// Clones share invalidation epochs; separately constructed stores over the
/// same namespace do not.
#[derive(Clone)]
pub struct TtlCache {
  db: Database,
  namespace: Arc<str>,
  epochs: Arc<Mutex<Epochs>>,
}

impl TtlCache {
  pub fn new(db: Database, namespace: impl Into<String>) -> Self {
    Self {
      db,
      namespace: Arc::from(namespace.into()),
      epochs: Arc::new(Mutex::new(Epochs::default())),
    }
  }

  pub fn namespace(&self) -> &str {
    &self.namespace
  }

  /// Store `value` under `key`, replacing any existing entry.
  pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
    self.write(key, value, ttl, None).await?;
    Ok(())
  }

  /// Serialize `value` as JSON and store it.
  pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()> {
    let data = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize cache value: {}", e))?;
    self.set(key, data, ttl).await
  }

  /// Invalidation epoch of `key`; changes whenever the key is removed or the
  /// namespace cleared.
  pub fn epoch(&self, key: &str) -> u64 {
    lock(&self.epochs).of(key)
  }

  /// Store `value` only if `key` was not invalidated since `epoch` was read.
  ///
  /// Returns false when the write was dropped.
  pub async fn set_json_if_current<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
    epoch: u64,
  ) -> Result<bool> {
    let data = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize cache value: {}", e))?;
    self.write(key, data, ttl, Some(epoch)).await
  }

  async fn write(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>, expected: Option<u64>) -> Result<bool> {
    let entry = CacheEntry::new(key, value, ttl, Utc::now());
    let namespace = Arc::clone(&self.namespace);
    let epochs = Arc::clone(&self.epochs);

    self
      .db
      .call(move |conn| {
        // Checked under the connection lock: a remove bumps the epoch before
        // it deletes, so either this write is refused or the delete follows it
        if let Some(expected) = expected {
          if lock(&epochs).of(&entry.key) != expected {
            return Ok(false);
          }
        }

        conn
          .execute(
            "INSERT OR REPLACE INTO cache_entries (namespace, key, value, stored_at, expires_at)
             VALUES (?, ?, ?, ?, ?)",
            params![
              &*namespace,
              entry.key,
              entry.value,
              entry.stored_at.timestamp_millis(),
              entry.expires_at.map(|t| t.timestamp_millis()),
            ],
          )
          .map_err(|e| eyre!("Failed to store cache entry: {}", e))?;
        Ok(true)
      })
      .await
  }

  /// Read the live entry for `key`, evicting it if expired or unreadable.
  pub async fn entry(&self, key: &str) -> Result<Option<CacheEntry>> {
    let namespace = Arc::clone(&self.namespace);
    let key = key.to_string();
    self
      .db
      .call(move |conn| load_live(conn, &namespace, &key, Utc::now()))
      .await
  }

  /// Read and decode the entry for `key`.
  ///
  /// A payload that does not decode as `T` is treated as corruption: the
  /// entry is evicted and the read is a miss.
  pub async fn entry_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<CacheEntry<T>>> {
    let Some(entry) = self.entry(key).await? else {
      return Ok(None);
    };

    match entry.try_map(|bytes| serde_json::from_slice::<T>(&bytes)) {
      Ok(typed) => Ok(Some(typed)),
      Err(e) => {
        warn!(namespace = %self.namespace, key, error = %e, "evicting undecodable cache entry");
        self.remove(key).await?;
        Ok(None)
      }
    }
  }

  pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
    Ok(self.entry(key).await?.map(|entry| entry.value))
  }

  pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
    Ok(self.entry_json(key).await?.map(|entry| entry.value))
  }

  /// Equivalent to a successful `get` without returning the payload.
  pub async fn has(&self, key: &str) -> Result<bool> {
    Ok(self.entry(key).await?.is_some())
  }

  pub async fn remove(&self, key: &str) -> Result<()> {
    *lock(&self.epochs).keys.entry(key.to_string()).or_default() += 1;
    let namespace = Arc::clone(&self.namespace);
    let key = key.to_string();
    self
      .db
      .call(move |conn| {
        delete_entry(conn, &namespace, &key)?;
        Ok(())
      })
      .await
  }

  /// Remove every entry in this namespace.
  pub async fn clear(&self) -> Result<()> {
    lock(&self.epochs).namespace += 1;
    let namespace = Arc::clone(&self.namespace);
    self
      .db
      .call(move |conn| {
        conn
          .execute(
            "DELETE FROM cache_entries WHERE namespace = ?",
            params![&*namespace],
          )
          .map_err(|e| eyre!("Failed to clear cache: {}", e))?;
        Ok(())
      })
      .await
  }

  /// Time left before `key` expires. None if absent, expired or without TTL.
  pub async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>> {
    let now = Utc::now();
    Ok(
      self
        .entry(key)
        .await?
        .and_then(|entry| entry.remaining_ttl_at(now)),
    )
  }

  /// Restart the expiry clock of an existing entry without rewriting its value.
  ///
  /// `None` makes the entry permanent. Returns false if the key is absent
  /// (including expired).
  pub async fn update_ttl(&self, key: &str, ttl: Option<Duration>) -> Result<bool> {
    let namespace = Arc::clone(&self.namespace);
    let key = key.to_string();

    self
      .db
      .call(move |conn| {
        let now = Utc::now();
        if load_live(conn, &namespace, &key, now)?.is_none() {
          return Ok(false);
        }

        let expires_at = ttl
          .and_then(|ttl| expiry_from(now, ttl))
          .map(|t| t.timestamp_millis());
        conn
          .execute(
            "UPDATE cache_entries SET expires_at = ? WHERE namespace = ? AND key = ?",
            params![expires_at, &*namespace, key],
          )
          .map_err(|e| eyre!("Failed to update cache ttl: {}", e))?;
        Ok(true)
      })
      .await
  }

  /// Delete every expired entry in the namespace. Returns how many were removed.
  pub async fn purge_expired(&self) -> Result<usize> {
    let namespace = Arc::clone(&self.namespace);
    self
      .db
      .call(move |conn| {
        conn
          .execute(
            "DELETE FROM cache_entries
             WHERE namespace = ? AND expires_at IS NOT NULL AND expires_at <= ?",
            params![&*namespace, Utc::now().timestamp_millis()],
          )
          .map_err(|e| eyre!("Failed to purge expired cache entries: {}", e))
      })
      .await
  }

  /// Spawn a task that purges expired entries every `interval`.
  ///
  /// Abort the returned handle to stop it.
  pub fn spawn_purge_task(&self, interval: Duration) -> JoinHandle<()> {
    let cache = self.clone();

    tokio::spawn(async move {
      info!(namespace = %cache.namespace, ?interval, "starting cache purge task");

      loop {
        tokio::time::sleep(interval).await;

        match cache.purge_expired().await {
          Ok(0) => debug!("cache purge: no expired entries"),
          Ok(removed) => info!(removed, "cache purge: removed expired entries"),
          Err(e) => warn!(error = %e, "cache purge failed"),
        }
      }
    })
  }
}

fn delete_entry(conn: &Connection, namespace: &str, key: &str) -> Result<()> {
  conn
    .execute(
      "DELETE FROM cache_entries WHERE namespace = ? AND key = ?",
      params![namespace, key],
    )
    .map_err(|e| eyre!("Failed to delete cache entry: {}", e))?;
  Ok(())
}

/// Load the entry for `key`, evicting it when expired or malformed.
fn load_live(
  conn: &Connection,
  namespace: &str,
  key: &str,
  now: DateTime<Utc>,
) -> Result<Option<CacheEntry>> {
  let row: Option<(Value, Value, Value)> = conn
    .query_row(
      "SELECT value, stored_at, expires_at FROM cache_entries
       WHERE namespace = ? AND key = ?",
      params![namespace, key],
      |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
    )
    .optional()
    .map_err(|e| eyre!("Failed to read cache entry: {}", e))?;

  let Some((value, stored_at, expires_at)) = row else {
    debug!(namespace, key, "cache miss");
    return Ok(None);
  };

  let Some(entry) = decode_row(key, value, stored_at, expires_at) else {
    warn!(namespace, key, "evicting corrupt cache entry");
    delete_entry(conn, namespace, key)?;
    return Ok(None);
  };

  if entry.is_expired_at(now) {
    debug!(namespace, key, "cache entry expired");
    delete_entry(conn, namespace, key)?;
    return Ok(None);
  }

  debug!(namespace, key, "cache hit");
  Ok(Some(entry))
}

fn decode_row(key: &str, value: Value, stored_at: Value, expires_at: Value) -> Option<CacheEntry> {
  let value = match value {
    Value::Blob(bytes) => bytes,
    Value::Text(text) => text.into_bytes(),
    _ => return None,
  };
  let stored_at = match stored_at {
    Value::Integer(ms) => DateTime::<Utc>::from_timestamp_millis(ms)?,
    _ => return None,
  };
  let expires_at = match expires_at {
    Value::Null => None,
    Value::Integer(ms) => Some(DateTime::<Utc>::from_timestamp_millis(ms)?),
    _ => return None,
  };

  Some(CacheEntry {
    key: key.to_string(),
    value,
    stored_at,
    expires_at,
  })
}
