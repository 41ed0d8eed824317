//! Database error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// A row the caller expected to exist is gone, e.g. a build or its
    /// preparation record vanished mid-attempt.
    #[error("missing {0}")]
    Missing(String),

    /// A write that must happen at most once was attempted again, e.g. a
    /// second input commit for one build.
    #[error("already recorded: {0}")]
    AlreadyRecorded(String),

    /// A value failed to cross the column boundary: an unknown status
    /// string, or a JSON blob that no longer maps onto its domain type.
    #[error("malformed value: {0}")]
    Malformed(String),

    #[error("query failed: {0}")]
    Query(#[from] sqlx::Error),

    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
