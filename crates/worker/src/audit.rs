//! Audit trail of raw inbound worker messages.
//!
//! [`AuditLog`] never blocks the dispatch path: records are queued with
//! `try_send` and a background task writes them to SQLite.

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use proto::DatabaseError;
use serde::Serialize;
use sqlx::{Row, sqlite::SqlitePool};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default bound of the audit queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

const CREATE_AUDIT_TABLE: &str = "CREATE TABLE IF NOT EXISTS audit_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    raw_message TEXT NOT NULL,
    received_at TEXT NOT NULL
)";

/// Fire-and-forget recorder for inbound messages
pub trait AuditSink: Send + Sync {
    /// Records one raw message. Must not block or fail.
    fn record(&self, raw: &str);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopAudit;

impl AuditSink for NoopAudit {
    fn record(&self, _raw: &str) {}
}

/// One persisted audit row
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditEntry {
    pub id: i64,
    pub raw_message: String,
    pub received_at: DateTime<Utc>,
}

/// SQLite-backed audit table
#[derive(Debug, Clone)]
pub struct AuditStore {
    pool: SqlitePool,
}

impl AuditStore {
    /// Opens (or creates) the database and ensures the audit table exists.
    pub async fn open(db_url: &str) -> Result<Self, DatabaseError> {
        let path = expand_tilde(db_url);

        if let Some(parent) = Path::new(&path).parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        }

        let pool = SqlitePool::connect(&format!("sqlite:{path}?mode=rwc"))
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        sqlx::query(CREATE_AUDIT_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;

        info!("Audit database opened: {path}");
        Ok(Self { pool })
    }

    /// Inserts one raw message.
    pub async fn insert(&self, raw: &str, received_at: DateTime<Utc>) -> Result<(), DatabaseError> {
        sqlx::query("INSERT INTO audit_log (raw_message, received_at) VALUES (?, ?)")
            .bind(raw)
            .bind(received_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(())
    }

    /// Most recent entries, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<AuditEntry>, DatabaseError> {
        let rows = sqlx::query(
            "SELECT id, raw_message, received_at FROM audit_log ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let received_at: String = row.get("received_at");
                let received_at = DateTime::parse_from_rfc3339(&received_at)
                    .map_err(|e| DatabaseError::Sqlx(e.to_string()))?
                    .with_timezone(&Utc);
                Ok(AuditEntry {
                    id: row.get("id"),
                    raw_message: row.get("raw_message"),
                    received_at,
                })
            })
            .collect()
    }

    /// Total number of rows.
    pub async fn count(&self) -> Result<i64, DatabaseError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM audit_log")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| DatabaseError::Sqlx(e.to_string()))?;
        Ok(row.get("n"))
    }

    /// Closes the connection pool.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

struct AuditRecord {
    raw: String,
    received_at: DateTime<Utc>,
}

/// Queue-backed [`AuditSink`] that persists through an [`AuditStore`]
pub struct AuditLog {
    tx: Mutex<Option<mpsc::Sender<AuditRecord>>>,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl AuditLog {
    /// Opens the store at `db_url` and starts the background writer.
    pub async fn open(db_url: &str, queue_capacity: usize) -> Result<Self, DatabaseError> {
        let store = AuditStore::open(db_url).await?;
        Ok(Self::with_store(store, queue_capacity))
    }

    /// Starts the background writer over an already opened store.
    pub fn with_store(store: AuditStore, queue_capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditRecord>(queue_capacity.max(1));
        let writer = tokio::spawn(async move {
            while let Some(record) = rx.recv().await {
                if let Err(e) = store.insert(&record.raw, record.received_at).await {
                    warn!("Failed to persist audit record: {e}");
                }
            }
            store.close().await;
            debug!("Audit writer stopped");
        });

        Self {
            tx: Mutex::new(Some(tx)),
            writer: Mutex::new(Some(writer)),
        }
    }

    /// Stops accepting records and waits until queued ones are written.
    pub async fn close(&self) {
        drop(self.tx.lock().take());
        let writer = self.writer.lock().take();
        if let Some(writer) = writer
            && let Err(e) = writer.await
        {
            warn!("Audit writer task failed: {e}");
        }
    }
}

impl AuditSink for AuditLog {
    fn record(&self, raw: &str) {
        let guard = self.tx.lock();
        let Some(tx) = guard.as_ref() else {
            debug!("Audit log closed, dropping record");
            return;
        };
        let record = AuditRecord {
            raw: raw.to_string(),
            received_at: Utc::now(),
        };
        match tx.try_send(record) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => warn!("Audit queue full, dropping record"),
            Err(TrySendError::Closed(_)) => debug!("Audit writer gone, dropping record"),
        }
    }
}

/// Expands `~` at the start of a path to `$HOME`.
fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix('~') {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        format!("{home}{rest}")
    } else {
        path.to_string()
    }
}
