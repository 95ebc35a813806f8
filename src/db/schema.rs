/// Schema for the cache and offline queue tables.
pub const SCHEMA: &str = r#"
-- Namespaced key/value cache with optional expiry (unix millis)
CREATE TABLE IF NOT EXISTS cache_entries (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    expires_at INTEGER,
    PRIMARY KEY (namespace, key)
);

CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry
    ON cache_entries(namespace, expires_at);

-- Write-behind queue; seq preserves enqueue order
CREATE TABLE IF NOT EXISTS pending_operations (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    id TEXT NOT NULL UNIQUE,
    payload TEXT NOT NULL,
    status TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    created_at INTEGER NOT NULL,
    next_attempt_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_operations_status
    ON pending_operations(status, next_attempt_at);
"#;
