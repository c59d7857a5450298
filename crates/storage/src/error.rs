//! Error types for remote object operations.

use thiserror::Error;

/// Errors from remote object-store operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Remote reported no such key.
    #[error("no such object: {0}")]
    NotFound(String),

    /// The target bucket does not exist or is not accessible.
    #[error("no such bucket: {0}")]
    NoSuchBucket(String),

    /// Local IO failure while staging an upload or download.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other remote failure (network, auth, 5xx). Not retried at
    /// this layer; retry policy belongs to the transport.
    #[error("remote error: {0}")]
    Remote(String),
}

impl StorageError {
    /// True when the remote reported a missing key.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound(_))
    }
}
