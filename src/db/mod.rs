//! Database module for Taskbox
//!
//! Provides SQLite access for the record store, the sync outbox and settings.
//! All writes that must be observed together (entity row + outbox entry) go
//! through [`Database::transaction`].

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

const BUSY_TIMEOUT_MS: u32 = 5_000;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Format a timestamp for storage.
///
/// Fixed microsecond precision keeps lexical order equal to chronological
/// order, which `ORDER BY created_at` and `MAX(last_synced_at)` rely on.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored timestamp, mapping failures to a rusqlite conversion error
/// so it can be used inside row mappers.
pub fn parse_timestamp(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
        })
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool backed by a file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch(&format!(
                "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {};",
                BUSY_TIMEOUT_MS
            ))
        });

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(2))
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            "#,
        )?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        log::info!("Database opened at {:?}", db_path);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every in-memory SQLite connection is its own database, so the pool is
    /// capped at a single connection.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));

        let pool = Pool::builder()
            .max_size(1)
            .connection_timeout(Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;
        Self::initialize_schema(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn initialize_schema(conn: &Connection) -> DbResult<()> {
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        Ok(())
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    /// Run `f` inside a single IMMEDIATE transaction.
    ///
    /// The transaction commits only when `f` returns `Ok`; any error rolls it
    /// back. `f` must use the handed-in transaction and never acquire another
    /// pooled connection.
    pub fn transaction<T, F>(&self, f: F) -> DbResult<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> DbResult<T>,
    {
        let mut conn = self.get_conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get a setting value
    pub fn get_setting<T: serde::de::DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, key: &str, value: &T) -> DbResult<()> {
        let conn = self.get_conn()?;
        let json = serde_json::to_string(value)
            .map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    // =========================================================================
    // HELPER METHODS (for queue module and other internal use)
    // =========================================================================

    /// Execute a SQL statement and return affected rows
    pub fn execute<P>(&self, sql: &str, params: P) -> DbResult<usize>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;

        let affected = conn.execute(sql, params)?;
        Ok(affected)
    }

    /// Query database and map results
    pub fn query<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<Vec<T>>
    where
        P: rusqlite::Params,
        F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, f)?;

        rows.collect::<rusqlite::Result<Vec<T>>>()
            .map_err(DbError::from)
    }

    /// Query single row
    pub fn query_row<T, P, F>(&self, sql: &str, params: P, f: F) -> DbResult<T>
    where
        P: rusqlite::Params,
        F: FnOnce(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
    {
        let conn = self.get_conn()?;

        conn.query_row(sql, params, f).map_err(DbError::from)
    }

    /// Execute batch SQL
    pub fn execute_batch(&self, sql: &str) -> DbResult<()> {
        let conn = self.get_conn()?;

        conn.execute_batch(sql).map_err(DbError::from)
    }
}
