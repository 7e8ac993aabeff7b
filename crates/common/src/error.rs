use thiserror::Error;

/// Errors raised by a [`LockStore`](crate::traits::LockStore) backend
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backend itself failed (I/O, connection, poisoned state)
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The addressed record is missing or is not an object
    #[error("Invalid record at {path}: {reason}")]
    InvalidRecord { path: String, reason: String },

    /// A collection, key or field segment is not addressable
    #[error("Invalid path: {0}")]
    InvalidPath(String),
}

/// Result type alias for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl StoreError {
    pub fn missing_record(path: impl Into<String>) -> Self {
        StoreError::InvalidRecord {
            path: path.into(),
            reason: "record not found".to_string(),
        }
    }

    pub fn not_an_object(path: impl Into<String>) -> Self {
        StoreError::InvalidRecord {
            path: path.into(),
            reason: "record is not an object".to_string(),
        }
    }
}

/// Error context helper for backend results
pub trait ErrorContext<T> {
    fn with_context(self, context: &str) -> StoreResult<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::fmt::Display,
{
    fn with_context(self, context: &str) -> StoreResult<T> {
        self.map_err(|e| StoreError::Backend(format!("{}: {}", context, e)))
    }
}
