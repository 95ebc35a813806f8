//! Shared SQLite medium for the cache and the offline queue.

pub mod schema;

use color_eyre::{eyre::eyre, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Database connection wrapper shared by every persistent component.
///
/// All access goes through [`Database::call`], which runs the closure on the
/// blocking pool so async callers are never stalled on disk I/O.
#[derive(Clone)]
pub struct Database {
  conn: Arc<Mutex<Connection>>,
}

impl Database {
  /// Open or create the database at the given path.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create database directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open database at {}: {}", path.display(), e))?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database. Nothing survives the process.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::from_connection(conn)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let db = Self {
      conn: Arc::new(Mutex::new(conn)),
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("marketsync").join("store.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(schema::SCHEMA)
      .map_err(|e| eyre!("Failed to run migrations: {}", e))?;

    Ok(())
  }

  /// Run `f` against the connection on the blocking pool.
  pub async fn call<F, R>(&self, f: F) -> Result<R>
  where
    F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
    R: Send + 'static,
  {
    let conn = Arc::clone(&self.conn);
    tokio::task::spawn_blocking(move || {
      let mut conn = conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))?;
      f(&mut conn)
    })
    .await
    .map_err(|e| eyre!("Database task failed: {}", e))?
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_migrations_create_tables() {
    let db = Database::open_in_memory().unwrap();

    let tables: Vec<String> = db
      .call(|conn| {
        let mut stmt = conn
          .prepare("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
          .map_err(|e| eyre!("{}", e))?;
        let names = stmt
          .query_map([], |row| row.get(0))
          .map_err(|e| eyre!("{}", e))?
          .filter_map(|r| r.ok())
          .collect();
        Ok(names)
      })
      .await
      .unwrap();

    assert!(tables.contains(&"cache_entries".to_string()));
    assert!(tables.contains(&"pending_operations".to_string()));
  }

  #[tokio::test]
  async fn test_open_creates_parent_directory() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("store.db");

    Database::open(&path).unwrap();
    assert!(path.exists());

    // Reopening an existing file re-runs the idempotent migrations
    Database::open(&path).unwrap();
  }
}
