use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Context;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use super::{CasResult, DocumentStore, Versioned};
use crate::errors::{AutomationError, Result};

/// SQLite-backed document store.
///
/// Wraps the connection behind `Arc<Mutex>` and runs every statement on
/// tokio's blocking pool via `spawn_blocking`, so synchronous SQLite I/O never
/// ties up async worker threads. Version checks happen inside the `UPDATE`
/// statement itself, which makes each compare-and-put atomic.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) a database at the given path and run migrations.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .context("Failed to create metadata directory")
                .map_err(AutomationError::Storage)?;
        }
        let conn = Connection::open(path)
            .context("Failed to open SQLite database")
            .map_err(AutomationError::Storage)?;
        Self::init(conn)
    }

    /// Create an in-memory database (for testing).
    pub fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .context("Failed to open in-memory SQLite database")
            .map_err(AutomationError::Storage)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA busy_timeout = 5000;

            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                body TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                PRIMARY KEY (collection, id)
            );
            ",
        )
        .context("Failed to create documents table")
        .map_err(AutomationError::Storage)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure with the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> anyhow::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
            f(&guard)
        })
        .await
        .context("DB task panicked")
        .map_err(AutomationError::Storage)?
        .map_err(AutomationError::Storage)
    }
}

fn decode(version: i64, body: &str) -> anyhow::Result<Versioned> {
    Ok(Versioned {
        version: u64::try_from(version).context("Negative document version")?,
        body: serde_json::from_str(body).context("Corrupt document body")?,
    })
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Versioned>> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.call(move |conn| {
            let row: Option<(i64, String)> = conn
                .query_row(
                    "SELECT version, body FROM documents WHERE collection = ?1 AND id = ?2",
                    params![collection, id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .context("Failed to query document")?;
            row.map(|(version, body)| decode(version, &body)).transpose()
        })
        .await
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Versioned)>> {
        let collection = collection.to_string();
        self.call(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT id, version, body FROM documents WHERE collection = ?1 ORDER BY id",
                )
                .context("Failed to prepare list")?;
            let rows = stmt
                .query_map(params![collection], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })
                .context("Failed to list documents")?;
            let mut docs = Vec::new();
            for row in rows {
                let (id, version, body) = row.context("Failed to read document row")?;
                docs.push((id, decode(version, &body)?));
            }
            Ok(docs)
        })
        .await
    }

    async fn create(&self, collection: &str, id: &str, body: Value) -> Result<bool> {
        let (collection, id) = (collection.to_string(), id.to_string());
        let body = serde_json::to_string(&body)?;
        self.call(move |conn| {
            let inserted = conn
                .execute(
                    "INSERT OR IGNORE INTO documents (collection, id, version, body) VALUES (?1, ?2, 1, ?3)",
                    params![collection, id, body],
                )
                .context("Failed to insert document")?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let (collection, id) = (collection.to_string(), id.to_string());
        self.call(move |conn| {
            conn.execute(
                "DELETE FROM documents WHERE collection = ?1 AND id = ?2",
                params![collection, id],
            )
            .context("Failed to delete document")?;
            Ok(())
        })
        .await
    }

    async fn compare_and_put(
        &self,
        collection: &str,
        id: &str,
        expected_version: Option<u64>,
        body: Value,
    ) -> Result<CasResult> {
        let (collection, id) = (collection.to_string(), id.to_string());
        let body = serde_json::to_string(&body)?;
        self.call(move |conn| {
            let result = match expected_version {
                None => {
                    let inserted = conn
                        .execute(
                            "INSERT OR IGNORE INTO documents (collection, id, version, body) VALUES (?1, ?2, 1, ?3)",
                            params![collection, id, body],
                        )
                        .context("Failed to insert document")?;
                    if inserted == 1 {
                        CasResult::Success { version: 1 }
                    } else {
                        CasResult::Conflict
                    }
                }
                Some(expected) => {
                    let expected = i64::try_from(expected).context("Version overflow")?;
                    let updated = conn
                        .execute(
                            "UPDATE documents SET version = version + 1, body = ?1, updated_at = datetime('now')
                             WHERE collection = ?2 AND id = ?3 AND version = ?4",
                            params![body, collection, id, expected],
                        )
                        .context("Failed to update document")?;
                    if updated == 1 {
                        CasResult::Success {
                            version: expected as u64 + 1,
                        }
                    } else {
                        CasResult::Conflict
                    }
                }
            };
            Ok(result)
        })
        .await
    }
}
