//! Error taxonomy shared by the server store, the migrator and sync remotes.

use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing or malformed input. Rejected before any store mutation.
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    /// A create reused a client identifier. Indicates a client-side
    /// identifier generation bug; never retried.
    #[error("client_id {0} already exists")]
    DuplicateClientId(Uuid),

    #[error("client_id column does not exist. Run migration first.")]
    MigrationRequired,

    /// Pool exhaustion, connection failure or a degraded server. Retryable.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("database error: {0}")]
    Database(String),

    /// The remote answered with something this client does not understand.
    #[error("remote error: {0}")]
    Remote(String),
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut => {
                Self::Unavailable("timed out acquiring a database connection".to_string())
            }
            sqlx::Error::PoolClosed => Self::Unavailable("connection pool is closed".to_string()),
            sqlx::Error::Io(e) => Self::Unavailable(e.to_string()),
            other => Self::Database(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_timeout_is_retryable() {
        let err = Error::from(sqlx::Error::PoolTimedOut);
        assert!(err.is_retryable());
        assert!(Error::from(sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn duplicate_and_validation_are_not_retryable() {
        assert!(!Error::DuplicateClientId(Uuid::new_v4()).is_retryable());
        assert!(!Error::validation("feeding_time is required").is_retryable());
        assert!(!Error::MigrationRequired.is_retryable());
    }

    #[test]
    fn row_not_found_maps_to_database_error() {
        let err = Error::from(sqlx::Error::RowNotFound);
        assert!(matches!(err, Error::Database(_)));
    }
}
