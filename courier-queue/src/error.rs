//! Error types for queue stores.

use std::io;

use thiserror::Error;

use crate::QueueItemId;

#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O operation failed (file read/write/delete).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    #[error("Queue item not found: {0}")]
    NotFound(QueueItemId),

    #[error("Queue item already exists: {0}")]
    AlreadyExists(QueueItemId),

    /// The store location is unusable.
    #[error("Invalid queue store: {0}")]
    Validation(String),

    /// A record lock could not be taken in time.
    #[error("Timed out waiting for the lock on {0}")]
    Lock(QueueItemId),
}

#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        Self::Serialization(e.into())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        Self::Serialization(e.into())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err = StoreError::from(io_err);

        assert!(matches!(err, StoreError::Io(_)));
        assert!(err.to_string().contains("access denied"));
    }

    #[test]
    fn not_found_names_the_item() {
        let id = QueueItemId::generate();
        assert!(StoreError::NotFound(id.clone()).to_string().contains(&id.to_string()));
    }
}
