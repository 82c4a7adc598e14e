// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor ledger.
//!
//! Holds the latest sync cursor for each (owner, collection). A missing entry
//! reads as the zero token, so a cold start needs no special casing.
//!
//! # Semantics
//!
//! - `put()` is last-write-wins. The session only calls it with the cursor of
//!   the most recent successful exchange, under the lane lock for that
//!   collection, so the store itself does no ordering.
//! - `invalidate()` drops the entry. The next exchange sends `"0"` and the
//!   server starts the collection over.
//!
//! # Persistence
//!
//! [`CursorStore::in_memory()`] keeps everything in the cache. With
//! [`CursorStore::open()`] the cache is backed by SQLite and writes are
//! debounced:
//! - `put()` updates the in-memory cache immediately and marks the key dirty
//! - `flush_dirty()` persists all dirty keys in a batch (upsert or delete)
//! - `close()` flushes and checkpoints the WAL
//!
//! Persisted cursors are reloaded on open. A harness restarted mid-run picks
//! up the server-side sync state it left behind instead of re-priming every
//! collection.
//!
//! # SQLite Busy Handling
//!
//! SQLITE_BUSY/SQLITE_LOCKED are retried with exponential backoff (5 attempts,
//! 10ms doubling to 500ms). The cache is authoritative; a failed flush leaves
//! the key dirty for the next one.

use crate::error::{HarnessError, Result};
use crate::protocol::{CollectionId, Cursor, Owner};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

type CursorKey = (Owner, CollectionId);

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
async fn execute_with_retry<F, Fut, T>(operation_name: &str, mut f: F) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(
                        operation = operation_name,
                        attempts,
                        "SQLite operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::cursor_retries_total(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(
                        operation = operation_name,
                        attempts,
                        "SQLite busy, max retries exceeded"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Latest cursor per (owner, collection), optionally persisted to SQLite.
pub struct CursorStore {
    /// SQLite pool; `None` for an in-memory store
    pool: Option<SqlitePool>,
    /// Authoritative cursor cache
    cache: Arc<RwLock<HashMap<CursorKey, Cursor>>>,
    /// Keys changed since the last flush
    dirty: Arc<RwLock<HashSet<CursorKey>>>,
    path: Option<String>,
}

impl CursorStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            pool: None,
            cache: Arc::new(RwLock::new(HashMap::new())),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: None,
        }
    }

    /// Open (or create) a persistent store at `path` and load its cursors.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        info!(path = %path_str, "Opening cursor store");

        let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path_str))
            .map_err(|e| HarnessError::Config(format!("Invalid SQLite path: {}", e)))?
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                owner TEXT NOT NULL,
                collection TEXT NOT NULL,
                cursor TEXT NOT NULL,
                updated_at INTEGER NOT NULL,
                PRIMARY KEY (owner, collection)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, String, String)> =
            sqlx::query_as("SELECT owner, collection, cursor FROM cursors")
                .fetch_all(&pool)
                .await?;

        let mut cache = HashMap::new();
        for (owner, collection, cursor) in rows {
            debug!(owner = %owner, collection = %collection, cursor = %cursor, "Loaded cursor from disk");
            cache.insert((Owner::from(owner), CollectionId::from(collection)), Cursor::from(cursor));
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cursors from previous run");
        }

        Ok(Self {
            pool: Some(pool),
            cache: Arc::new(RwLock::new(cache)),
            dirty: Arc::new(RwLock::new(HashSet::new())),
            path: Some(path_str),
        })
    }

    /// Stored cursor, or the zero token if there is none.
    pub async fn get(&self, owner: &Owner, collection: &CollectionId) -> Cursor {
        self.cache
            .read()
            .await
            .get(&(owner.clone(), collection.clone()))
            .cloned()
            .unwrap_or_else(Cursor::zero)
    }

    /// Record the cursor returned by the latest successful exchange.
    pub async fn put(&self, owner: &Owner, collection: &CollectionId, cursor: Cursor) {
        let key = (owner.clone(), collection.clone());
        debug!(owner = %owner, collection = %collection, cursor = %cursor, "Cursor updated");
        self.cache.write().await.insert(key.clone(), cursor);
        self.mark_dirty(key).await;
    }

    /// Forget the cursor so the next exchange starts from zero.
    pub async fn invalidate(&self, owner: &Owner, collection: &CollectionId) {
        let key = (owner.clone(), collection.clone());
        let previous = self.cache.write().await.remove(&key);
        if let Some(previous) = previous {
            warn!(owner = %owner, collection = %collection, previous = %previous, "Cursor invalidated");
            crate::metrics::record_cursor_invalidation(owner.as_str());
            self.mark_dirty(key).await;
        }
    }

    /// All cursors held for `owner`.
    pub async fn owner_cursors(&self, owner: &Owner) -> HashMap<CollectionId, Cursor> {
        self.cache
            .read()
            .await
            .iter()
            .filter(|((o, _), _)| o == owner)
            .map(|((_, c), cursor)| (c.clone(), cursor.clone()))
            .collect()
    }

    /// Drop every cursor held for `owner`.
    pub async fn clear_owner(&self, owner: &Owner) -> usize {
        let removed: Vec<CursorKey> = {
            let mut cache = self.cache.write().await;
            let keys: Vec<CursorKey> = cache.keys().filter(|(o, _)| o == owner).cloned().collect();
            for key in &keys {
                cache.remove(key);
            }
            keys
        };
        for key in &removed {
            self.mark_dirty(key.clone()).await;
        }
        if !removed.is_empty() {
            info!(owner = %owner, count = removed.len(), "Cleared cursors");
        }
        removed.len()
    }

    /// Get all cursors (for diagnostics).
    pub async fn get_all(&self) -> HashMap<CursorKey, Cursor> {
        self.cache.read().await.clone()
    }

    async fn mark_dirty(&self, key: CursorKey) {
        if self.pool.is_some() {
            self.dirty.write().await.insert(key);
        }
    }

    /// Persist all dirty keys. Returns the number written.
    ///
    /// No-op for an in-memory store.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };

        let dirty_keys: Vec<CursorKey> = {
            let mut dirty = self.dirty.write().await;
            dirty.drain().collect()
        };

        if dirty_keys.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(CursorKey, Option<Cursor>)> = {
            let cache = self.cache.read().await;
            dirty_keys
                .into_iter()
                .map(|key| {
                    let cursor = cache.get(&key).cloned();
                    (key, cursor)
                })
                .collect()
        };

        let mut flushed = 0;
        let mut errors = 0;

        for ((owner, collection), cursor) in snapshot {
            let result = match &cursor {
                Some(cursor) => {
                    execute_with_retry("cursor_flush", || async {
                        sqlx::query(
                            r#"
                            INSERT INTO cursors (owner, collection, cursor, updated_at)
                            VALUES (?, ?, ?, ?)
                            ON CONFLICT(owner, collection) DO UPDATE SET
                                cursor = excluded.cursor,
                                updated_at = excluded.updated_at
                            "#,
                        )
                        .bind(owner.as_str())
                        .bind(collection.as_str())
                        .bind(cursor.as_str())
                        .bind(now)
                        .execute(pool)
                        .await
                    })
                    .await
                }
                None => {
                    execute_with_retry("cursor_delete", || async {
                        sqlx::query("DELETE FROM cursors WHERE owner = ? AND collection = ?")
                            .bind(owner.as_str())
                            .bind(collection.as_str())
                            .execute(pool)
                            .await
                    })
                    .await
                }
            };

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(owner = %owner, collection = %collection, error = %e, "Failed to flush cursor");
                    self.dirty.write().await.insert((owner, collection));
                }
            }
        }

        if flushed > 0 {
            debug!(flushed, errors, "Flushed dirty cursors");
            crate::metrics::record_cursor_flush(flushed, errors);
        }

        if errors > 0 {
            return Err(HarnessError::Internal(format!(
                "Failed to flush {} cursors",
                errors
            )));
        }

        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Database path, `None` when in memory.
    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    /// Force flush WAL to main database.
    pub async fn checkpoint(&self) -> Result<()> {
        let Some(pool) = &self.pool else {
            return Ok(());
        };

        execute_with_retry("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(pool)
                .await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush, checkpoint and close the pool.
    pub async fn close(&self) {
        let Some(pool) = &self.pool else {
            return;
        };

        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) => {
                    if count > 0 {
                        info!(count, "Flushed dirty cursors on close");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to flush dirty cursors on close");
                }
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        pool.close().await;
        info!("Cursor store closed");
    }
}
