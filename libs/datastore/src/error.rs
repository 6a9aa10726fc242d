//! Datastore error types.

use thiserror::Error;

/// Errors from datastore operations.
#[derive(Debug, Error)]
pub enum DatastoreError {
    /// The requested row does not exist.
    #[error("not found")]
    NotFound,

    /// Uniqueness violation, e.g. a second non-deleted target for the same
    /// (scope, CI domain).
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Failed to connect to the backing database.
    #[error("failed to connect to database: {0}")]
    Connect(#[source] sqlx::Error),

    /// Failed to execute a query.
    #[error("query failed: {0}")]
    Query(#[source] sqlx::Error),

    /// A stored value could not be decoded into its entity form.
    #[error("invalid stored value: {0}")]
    InvalidValue(String),

    /// JSON payload (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DatastoreError {
    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connect(_) => true,
            Self::Query(e) => is_retryable_sqlx_error(e),
            _ => false,
        }
    }
}

fn is_retryable_sqlx_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            if let Some(code) = db_err.code() {
                matches!(
                    code.as_ref(),
                    "40001" | // serialization_failure
                    "40P01" | // deadlock_detected
                    "57P01" | // admin_shutdown
                    "57P03"   // cannot_connect_now
                )
            } else {
                false
            }
        }
        _ => false,
    }
}
