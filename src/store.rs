//! SQLite persistence for assignment attempts and per-policy pagination
//! cursors. Both tables live in the same database so a cursor is only ever
//! advanced after the page it covers has been committed.

pub mod attempts;
pub mod cursor;
pub mod record;

pub use attempts::{AttemptStore, RetrySweep, MAX_RETRY_CHUNK};
pub use cursor::{CursorStore, PolicyCursor};
pub use record::AssignmentAttempt;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

const FILE_POOL_CONNECTIONS: u32 = 5;

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS label_assignments (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  file_id TEXT NOT NULL,
  file_owner TEXT NOT NULL,
  classification_name TEXT NOT NULL,
  source_policy_id TEXT NOT NULL,
  file_name TEXT NULL,
  applied INTEGER NOT NULL DEFAULT 0,
  attempts INTEGER NOT NULL DEFAULT 1,
  error_forbidden INTEGER NULL,
  error_no_identity INTEGER NULL,
  error_message TEXT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS la_retry_idx
  ON label_assignments(applied, attempts, id);
CREATE INDEX IF NOT EXISTS la_file_idx
  ON label_assignments(file_id, classification_name);

CREATE TABLE IF NOT EXISTS policy_cursors (
  policy_id TEXT NOT NULL,
  classification_name TEXT NOT NULL,
  pagination_offset INTEGER NOT NULL,
  last_drained_at TEXT NULL,
  updated_at TEXT NOT NULL,
  PRIMARY KEY (policy_id, classification_name)
);
"#;

const DROP_SCHEMA: &str = r#"
DROP TABLE IF EXISTS label_assignments;
DROP TABLE IF EXISTS policy_cursors;
"#;

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Storage failure tagged with the operation that hit it.
#[derive(Debug)]
pub enum StoreError {
    Database {
        operation: &'static str,
        source: sqlx::Error,
    },
    Corrupt {
        operation: &'static str,
        detail: String,
    },
}

impl StoreError {
    pub(crate) fn database(operation: &'static str) -> impl FnOnce(sqlx::Error) -> StoreError {
        move |source| StoreError::Database { operation, source }
    }

    pub(crate) fn corrupt(operation: &'static str, detail: impl Into<String>) -> StoreError {
        StoreError::Corrupt {
            operation,
            detail: detail.into(),
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            StoreError::Database { operation, .. } | StoreError::Corrupt { operation, .. } => {
                operation
            }
        }
    }
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::Database { operation, source } => {
                write!(f, "database error during {operation}: {source}")
            }
            StoreError::Corrupt { operation, detail } => {
                write!(f, "corrupt row during {operation}: {detail}")
            }
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            StoreError::Database { source, .. } => Some(source),
            StoreError::Corrupt { .. } => None,
        }
    }
}

/// Handle to the sync database. Cheap to clone.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database at `url` and ensures the
    /// schema exists.
    ///
    /// In-memory URLs are pinned to a single long-lived connection, since
    /// every new SQLite memory connection would see an empty database.
    pub async fn connect(url: &str) -> StoreResult<Self> {
        let memory = is_memory_url(url);
        let mut options = SqliteConnectOptions::from_str(url)
            .map_err(StoreError::database("connect options"))?
            .create_if_missing(true);
        if !memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        let pool_options = if memory {
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(FILE_POOL_CONNECTIONS)
        };

        let pool = pool_options
            .connect_with(options)
            .await
            .map_err(StoreError::database("connect"))?;

        let database = Self { pool };
        database.create_schema().await?;
        tracing::debug!(memory, "sync database ready");
        Ok(database)
    }

    pub async fn create_schema(&self) -> StoreResult<()> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database("create schema"))?;
        Ok(())
    }

    pub async fn drop_schema(&self) -> StoreResult<()> {
        sqlx::query(DROP_SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database("drop schema"))?;
        Ok(())
    }

    pub fn attempts(&self, max_attempts: u32) -> AttemptStore {
        AttemptStore::new(self.pool.clone(), max_attempts)
    }

    pub fn cursors(&self) -> CursorStore {
        CursorStore::new(self.pool.clone())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

fn is_memory_url(url: &str) -> bool {
    url.contains(":memory:") || url.contains("mode=memory")
}

pub(crate) fn parse_timestamp(operation: &'static str, raw: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| StoreError::corrupt(operation, format!("bad timestamp {raw:?}: {err}")))
}
