//! Database module for Eunio preference storage
//!
//! Provides SQLite persistence for preference documents, backup snapshots,
//! and local key/value settings. Uses an r2d2 connection pool with WAL mode
//! for concurrent access from async tasks.
//!
//! The narrow [`LocalStore`] trait is what the rest of the engine consumes;
//! [`SqliteLocalStore`] is the shipped implementation.

use rusqlite::params;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use chrono::Utc;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

use crate::models::{PreferenceDocument, SyncStatus};

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Could not determine application data directory")]
    NoDataDir,

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool at the given path
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(10)
            .min_idle(Some(2))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        // Performance PRAGMAs
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        // Initialize schema
        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;

        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Open the database at the platform's default data location
    pub fn open_default() -> DbResult<Self> {
        let mut path = dirs::data_dir().ok_or(DbError::NoDataDir)?;
        path.push("eunio");
        std::fs::create_dir_all(&path)?;
        path.push("preferences.db");
        Self::new(path)
    }

    /// Create an in-memory database (for testing). The pool is capped at a
    /// single connection so every checkout sees the same in-memory database.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;

        let schema = include_str!("schema.sql");
        conn.execute_batch(schema)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    // =========================================================================
    // PREFERENCE DOCUMENTS
    // =========================================================================

    /// Load a user's preference document, if one has ever been saved
    pub fn load_document(&self, user_id: &str) -> DbResult<Option<PreferenceDocument>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT payload FROM preference_documents WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        );

        match result {
            Ok(payload) => {
                let doc: PreferenceDocument = serde_json::from_str(&payload)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(doc))
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Insert or replace a user's preference document
    pub fn save_document(&self, doc: &PreferenceDocument) -> DbResult<()> {
        let payload =
            serde_json::to_string(doc).map_err(|e| DbError::Serialization(e.to_string()))?;

        let conn = self.get_conn()?;
        conn.execute(
            "INSERT INTO preference_documents (
                user_id, payload, last_modified, write_counter, sync_status, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(user_id) DO UPDATE SET
                payload = excluded.payload,
                last_modified = excluded.last_modified,
                write_counter = excluded.write_counter,
                sync_status = excluded.sync_status,
                updated_at = excluded.updated_at",
            params![
                doc.user_id,
                payload,
                doc.last_modified.to_rfc3339(),
                doc.write_counter,
                doc.sync_status.as_str(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        Ok(())
    }

    /// Read just the sync status column without parsing the payload
    pub fn document_sync_status(&self, user_id: &str) -> DbResult<Option<SyncStatus>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT sync_status FROM preference_documents WHERE user_id = ?1",
            [user_id],
            |row| row.get(0),
        );

        match result {
            Ok(status) => Ok(Some(SyncStatus::from_str(&status))),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
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
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
            params![key, json],
        )?;

        Ok(())
    }

    /// Stable per-install device identifier, generated on first use
    pub fn device_id(&self) -> DbResult<String> {
        if let Some(id) = self.get_setting::<String>("device_id")? {
            return Ok(id);
        }
        let id = uuid::Uuid::new_v4().to_string();
        self.set_setting("device_id", &id)?;
        Ok(id)
    }

    // =========================================================================
    // HELPER METHODS (for backup module and other internal use)
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

    /// Execute an INSERT statement and return the last inserted row ID
    pub fn execute_insert<P>(&self, sql: &str, params: P) -> DbResult<i64>
    where
        P: rusqlite::Params,
    {
        let conn = self.get_conn()?;
        conn.execute(sql, params)?;
        Ok(conn.last_insert_rowid())
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
}

// ============================================================================
// Local Store Interface
// ============================================================================

/// Narrow persistence interface the engine reads and writes through.
/// No transactional multi-document semantics are required.
pub trait LocalStore: Send + Sync {
    fn load_document(&self, user_id: &str) -> DbResult<Option<PreferenceDocument>>;
    fn save_document(&self, doc: &PreferenceDocument) -> DbResult<()>;
}

/// SQLite-backed local store
#[derive(Clone)]
pub struct SqliteLocalStore {
    db: Database,
}

impl SqliteLocalStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

impl LocalStore for SqliteLocalStore {
    fn load_document(&self, user_id: &str) -> DbResult<Option<PreferenceDocument>> {
        self.db.load_document(user_id)
    }

    fn save_document(&self, doc: &PreferenceDocument) -> DbResult<()> {
        self.db.save_document(doc)
    }
}

// ============================================================================
// Tests
// ============================================================================
