// ABOUTME: Error taxonomy for table synchronization
// ABOUTME: Separates chunk-, table- and run-fatal failures so callers can isolate them

use std::time::Duration;
use thiserror::Error;

/// Failure reported by a [`DatabaseAccess`](crate::db::DatabaseAccess) implementation.
///
/// The engine only cares whether the connection itself is gone (run-fatal),
/// whether a statement exceeded its time budget, or whether a single query failed.
#[derive(Error, Debug)]
pub enum AccessError {
    /// The connection to the database was lost or could not be established
    #[error("connection error: {0:#}")]
    Connection(anyhow::Error),

    /// A single query or statement failed
    #[error("{0:#}")]
    Query(anyhow::Error),

    /// A statement exceeded the per-statement execution timeout
    #[error("statement timed out after {0:?}")]
    Timeout(Duration),
}

impl AccessError {
    pub fn is_connection(&self) -> bool {
        matches!(self, AccessError::Connection(_))
    }
}

/// Errors produced while synchronizing tables between databases.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Introspection of a source table failed (table-fatal)
    #[error("failed to read schema of table {table}: {source}")]
    SchemaRead {
        table: String,
        #[source]
        source: AccessError,
    },

    /// The table cannot be synchronized with keyed upserts (table-fatal)
    #[error("table {table} cannot be synchronized: {reason}")]
    UnsupportedTable { table: String, reason: String },

    /// Counting source rows failed (table-fatal)
    #[error("failed to count rows of table {table}: {source}")]
    Count {
        table: String,
        #[source]
        source: AccessError,
    },

    /// Reading one page from the source failed (chunk-fatal)
    #[error("failed to fetch chunk at offset {offset} of table {table}: {source}")]
    ChunkFetch {
        table: String,
        offset: u64,
        #[source]
        source: AccessError,
    },

    /// A fetched record does not match the introspected column list (chunk-fatal)
    #[error("invalid record in chunk at offset {offset} of table {table}: {reason}")]
    InvalidRecord {
        table: String,
        offset: u64,
        reason: String,
    },

    /// An upsert or delete statement failed (chunk-fatal)
    #[error("write to table {table} failed: {source}")]
    Write {
        table: String,
        #[source]
        source: AccessError,
    },

    /// Connection to a database was lost (run-fatal)
    #[error("lost connection to database {database}: {source}")]
    Connection {
        database: String,
        #[source]
        source: AccessError,
    },

    /// Invalid tunables or environment configuration
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Only connection-level failures abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Connection { .. })
    }

    /// Wrap an access error with the given table-level constructor unless the
    /// connection itself failed, in which case it is promoted to a fatal error.
    pub fn classify(
        database: &str,
        err: AccessError,
        wrap: impl FnOnce(AccessError) -> SyncError,
    ) -> SyncError {
        if err.is_connection() {
            SyncError::Connection {
                database: database.to_string(),
                source: err,
            }
        } else {
            wrap(err)
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
