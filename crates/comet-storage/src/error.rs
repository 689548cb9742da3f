use comet_core::MessageId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("invalid query: {0}")]
    QueryInvalid(String),
    #[error("message not found: {0}")]
    NotFound(MessageId),
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("data error: {0}")]
    Data(String),
}

impl StorageError {
    /// Failures of the store itself rather than of the request.
    pub fn is_unavailable(&self) -> bool {
        match self {
            StorageError::Unavailable(_) | StorageError::Io(_) | StorageError::Migrate(_) => true,
            StorageError::Sqlx(err) => matches!(
                err,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
                    | sqlx::Error::Database(_)
            ),
            StorageError::QueryInvalid(_) | StorageError::NotFound(_) | StorageError::Data(_) => {
                false
            }
        }
    }
}
