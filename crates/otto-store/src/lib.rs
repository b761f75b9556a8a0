//! otto-store: SQLite-based persistence for automation state.
//!
//! Stores JSON documents keyed by string. The scheduler keeps whole
//! lists under single keys (the automation list, one run history per
//! automation) and rewrites a key's document atomically on every
//! update. [`KeyLocks`] serializes read-modify-write sequences per key
//! so concurrent updates cannot drop each other's writes.

mod locks;

pub use locks::KeyLocks;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;

/// Key holding the full automation list.
pub const AUTOMATIONS_KEY: &str = "automations";

/// Key holding one automation's run history.
pub fn runs_key(automation_id: &str) -> String {
    format!("runs:{automation_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Blocking task join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("invalid JSON stored at key `{key}`: {source}")]
    Json {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Async key-value persistence for JSON documents.
///
/// Callers that read a document, mutate it, and write it back must hold
/// the key's [`KeyLocks`] lock across the whole sequence.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Read the document stored at `key`, if any.
    async fn read(&self, key: &str) -> Result<Option<Value>>;
    /// Write `value` at `key`, replacing any existing document.
    async fn write(&self, key: &str, value: Value) -> Result<()>;
    /// Delete the document at `key`. Deleting an absent key is fine.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// SQLite-backed [`PersistentStore`].
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the SQLite database at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL keeps readers unblocked while the scheduler writes
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;

        tracing::info!("Store opened: {}", path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS documents (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

#[async_trait]
impl PersistentStore for SqliteStore {
    async fn read(&self, key: &str) -> Result<Option<Value>> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM documents WHERE key = ?1",
                    rusqlite::params![key],
                    |row| row.get(0),
                )
                .optional()?;
            match raw {
                Some(text) => {
                    let value = serde_json::from_str(&text)
                        .map_err(|source| StoreError::Json { key, source })?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        })
        .await?
    }

    async fn write(&self, key: &str, value: Value) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        let text = value.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "INSERT INTO documents (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![key, text],
            )?;
            Ok(())
        })
        .await?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let conn = self.conn.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            conn.execute(
                "DELETE FROM documents WHERE key = ?1",
                rusqlite::params![key],
            )?;
            Ok(())
        })
        .await?
    }
}
