//! Outbox Module - Pending mutation intents awaiting remote confirmation
//!
//! Every local create/update/delete appends one entry here in the same
//! transaction as the entity write. Entries are consumed only when the remote
//! authority confirms the entity; failures keep the entry and raise its
//! retry counter.
//!
//! Features:
//! - SQLite-backed persistent ledger
//! - Creation-ordered draining in bounded batches
//! - Per-entity removal on confirmation (pending intents for one entity are
//!   coalesced into a single removal)
//! - Retry/error accounting and queue statistics

use super::models::{BatchItem, Operation, OutboxPayload};
use crate::db::{format_timestamp, parse_timestamp, Database};
use crate::ids::IdGenerator;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

// ============================================================================
// Data Types
// ============================================================================

/// Outbox entry stored in database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEntry {
    /// Queue-entry id, distinct from the entity id
    pub id: String,
    /// Insertion sequence, tie-breaker for equal creation timestamps
    pub seq: i64,
    pub task_id: String,
    pub payload: OutboxPayload,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl OutboxEntry {
    pub fn operation(&self) -> Operation {
        self.payload.operation()
    }

    /// Wire representation for a batch call
    pub fn to_batch_item(&self) -> BatchItem {
        BatchItem {
            entity_id: self.task_id.clone(),
            change: self.payload.clone(),
            retry_count: self.retry_count,
            error_message: self.error_message.clone(),
        }
    }
}

/// Outbox statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total_count: i64,
    pub failed_count: i64,
    pub entity_count: i64,
    pub max_retry_count: i64,
}

const SELECT_COLUMNS: &str = r#"
    SELECT id, seq, task_id, operation, data, retry_count, error_message, created_at
    FROM sync_queue
"#;

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxEntry> {
    let operation: String = row.get(3)?;
    let data: String = row.get(4)?;
    let payload: OutboxPayload = serde_json::from_str(&data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
    })?;

    if payload.operation().as_str() != operation {
        log::warn!(
            "Outbox entry operation column '{}' disagrees with payload '{}'",
            operation,
            payload.operation()
        );
    }

    Ok(OutboxEntry {
        id: row.get(0)?,
        seq: row.get(1)?,
        task_id: row.get(2)?,
        payload,
        retry_count: row.get(5)?,
        error_message: row.get(6)?,
        created_at: parse_timestamp(7, &row.get::<_, String>(7)?)?,
    })
}

// ============================================================================
// Outbox
// ============================================================================

/// Manages the persistent sync outbox
pub struct Outbox {
    db: Arc<Database>,
    ids: Arc<dyn IdGenerator>,
}

impl Outbox {
    /// Create new outbox over `db`
    pub fn new(db: Arc<Database>, ids: Arc<dyn IdGenerator>) -> Result<Self, QueueError> {
        let outbox = Self { db, ids };
        outbox.initialize_schema()?;
        Ok(outbox)
    }

    /// Initialize database schema for the outbox
    fn initialize_schema(&self) -> Result<(), QueueError> {
        self.db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                task_id TEXT NOT NULL,
                operation TEXT NOT NULL
                    CHECK (operation IN ('create', 'update', 'delete')),
                data TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                error_message TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_queue_task_id
                ON sync_queue(task_id);

            CREATE INDEX IF NOT EXISTS idx_queue_created_at
                ON sync_queue(created_at, seq);
            "#
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Append an intent on its own. Local mutations use [`Outbox::append_in`]
    /// so the entity write and the entry land together.
    pub fn append(&self, task_id: &str, payload: OutboxPayload) -> Result<OutboxEntry, QueueError> {
        let entry_id = self.ids.next_id();
        self.db
            .transaction(|tx| Ok(Self::append_in(tx, &entry_id, task_id, &payload)?))
            .map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Append an intent on an open connection or transaction
    pub fn append_in(
        conn: &Connection,
        entry_id: &str,
        task_id: &str,
        payload: &OutboxPayload,
    ) -> Result<OutboxEntry, QueueError> {
        let data = serde_json::to_string(payload)
            .map_err(|e| QueueError::InvalidPayload(e.to_string()))?;
        let created_at = Utc::now();

        conn.execute(
            r#"
            INSERT INTO sync_queue (id, task_id, operation, data, retry_count, created_at)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            "#,
            params![
                entry_id,
                task_id,
                payload.operation().as_str(),
                data,
                format_timestamp(&created_at),
            ],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        let seq = conn.last_insert_rowid();
        log::debug!("Queued {} for task {} (entry {})", payload.operation(), task_id, entry_id);

        Ok(OutboxEntry {
            id: entry_id.to_string(),
            seq,
            task_id: task_id.to_string(),
            payload: payload.clone(),
            retry_count: 0,
            error_message: None,
            created_at,
        })
    }

    /// All entries in creation order
    pub fn list_pending(&self) -> Result<Vec<OutboxEntry>, QueueError> {
        let sql = format!("{} ORDER BY created_at ASC, seq ASC", SELECT_COLUMNS);
        let items = self.db.query(&sql, [], map_entry)
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::debug!("Found {} pending outbox entries", items.len());
        Ok(items)
    }

    /// All entries in creation order, sliced into consecutive batches of at
    /// most `batch_size`
    pub fn drain(&self, batch_size: usize) -> Result<Vec<Vec<OutboxEntry>>, QueueError> {
        if batch_size == 0 {
            return Err(QueueError::InvalidBatchSize);
        }

        let items = self.list_pending()?;
        Ok(items.chunks(batch_size).map(|chunk| chunk.to_vec()).collect())
    }

    /// Entries for one entity in creation order
    pub fn entries_for_entity(&self, task_id: &str) -> Result<Vec<OutboxEntry>, QueueError> {
        let sql = format!("{} WHERE task_id = ?1 ORDER BY created_at ASC, seq ASC", SELECT_COLUMNS);
        self.db.query(&sql, params![task_id], map_entry)
            .map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Get entry by id
    pub fn get_entry(&self, entry_id: &str) -> Result<OutboxEntry, QueueError> {
        let sql = format!("{} WHERE id = ?1", SELECT_COLUMNS);
        let conn = self.db.get_conn()
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        conn.query_row(&sql, params![entry_id], map_entry)
            .optional()
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?
            .ok_or_else(|| QueueError::ItemNotFound(entry_id.to_string()))
    }

    /// Delete every entry for `task_id`
    pub fn remove_by_entity(&self, task_id: &str) -> Result<usize, QueueError> {
        let conn = self.db.get_conn()
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;
        Self::remove_by_entity_in(&conn, task_id, None)
    }

    /// Delete entries for `task_id`, limited to `seq <= through_seq` when given
    pub fn remove_by_entity_in(
        conn: &Connection,
        task_id: &str,
        through_seq: Option<i64>,
    ) -> Result<usize, QueueError> {
        let deleted = conn.execute(
            "DELETE FROM sync_queue WHERE task_id = ?1 AND (?2 IS NULL OR seq <= ?2)",
            params![task_id, through_seq],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::debug!("Removed {} outbox entries for task {}", deleted, task_id);
        Ok(deleted)
    }

    /// Increment the entry's retry counter and store the error text
    pub fn record_failure(&self, entry_id: &str, error_message: &str) -> Result<(), QueueError> {
        let conn = self.db.get_conn()
            .map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        let updated = Self::record_failure_in(&conn, entry_id, error_message)?;
        if updated == 0 {
            return Err(QueueError::ItemNotFound(entry_id.to_string()));
        }
        Ok(())
    }

    /// Transactional form of [`Outbox::record_failure`]; returns rows touched
    pub fn record_failure_in(
        conn: &Connection,
        entry_id: &str,
        error_message: &str,
    ) -> Result<usize, QueueError> {
        log::warn!("Outbox entry {} failed: {}", entry_id, error_message);

        conn.execute(
            r#"
            UPDATE sync_queue
            SET retry_count = retry_count + 1, error_message = ?1
            WHERE id = ?2
            "#,
            params![error_message, entry_id],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Record a failure on every entry of `task_id` up to `through_seq`
    pub fn record_entity_failure_in(
        conn: &Connection,
        task_id: &str,
        through_seq: i64,
        error_message: &str,
    ) -> Result<usize, QueueError> {
        log::warn!("Outbox entries for task {} failed: {}", task_id, error_message);

        conn.execute(
            r#"
            UPDATE sync_queue
            SET retry_count = retry_count + 1, error_message = ?1
            WHERE task_id = ?2 AND seq <= ?3
            "#,
            params![error_message, task_id, through_seq],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Number of entries for `task_id` newer than `after_seq`
    pub fn count_newer_in(conn: &Connection, task_id: &str, after_seq: i64) -> Result<i64, QueueError> {
        conn.query_row(
            "SELECT COUNT(*) FROM sync_queue WHERE task_id = ?1 AND seq > ?2",
            params![task_id, after_seq],
            |row| row.get(0),
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))
    }

    /// Get outbox statistics
    pub fn get_stats(&self) -> Result<QueueStats, QueueError> {
        let stats = self.db.query_row(
            r#"
            SELECT
                COUNT(*),
                COALESCE(SUM(CASE WHEN error_message IS NOT NULL THEN 1 ELSE 0 END), 0),
                COUNT(DISTINCT task_id),
                COALESCE(MAX(retry_count), 0)
            FROM sync_queue
            "#,
            [],
            |row| {
                Ok(QueueStats {
                    total_count: row.get(0)?,
                    failed_count: row.get(1)?,
                    entity_count: row.get(2)?,
                    max_retry_count: row.get(3)?,
                })
            },
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        Ok(stats)
    }

    /// Clear retry counters and error text for manual retry
    pub fn reset_failures(&self) -> Result<usize, QueueError> {
        let updated = self.db.execute(
            r#"
            UPDATE sync_queue
            SET retry_count = 0, error_message = NULL
            WHERE retry_count > 0 OR error_message IS NOT NULL
            "#,
            [],
        ).map_err(|e| QueueError::DatabaseError(e.to_string()))?;

        log::info!("Reset {} failed outbox entries for retry", updated);
        Ok(updated)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    DatabaseError(String),

    #[error("Outbox entry not found: {0}")]
    ItemNotFound(String),

    #[error("Invalid outbox payload: {0}")]
    InvalidPayload(String),

    #[error("Batch size must be at least 1")]
    InvalidBatchSize,
}

impl From<QueueError> for crate::db::DbError {
    fn from(e: QueueError) -> Self {
        match e {
            QueueError::ItemNotFound(id) => crate::db::DbError::NotFound(id),
            QueueError::InvalidPayload(msg) => crate::db::DbError::Serialization(msg),
            other => crate::db::DbError::Constraint(other.to_string()),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
