//! Error type for filesystem operations and its errno mapping.

use minfs_meta::MetaError;
use minfs_storage::StorageError;
use thiserror::Error;

/// Errors surfaced by filesystem operations.
///
/// Every kernel-facing operation funnels through [`FsError::errno`] so
/// the FUSE shim replies with one consistent mapping.
#[derive(Debug, Error)]
pub enum FsError {
    /// Entry or remote object does not exist.
    #[error("no such entry")]
    NotFound,

    /// Bounded wait on a path lock timed out.
    #[error("path is locked")]
    Busy,

    /// Operation is not supported by this filesystem.
    #[error("operation not supported")]
    Unsupported,

    /// Malformed request (non-UTF-8 name, bad handle).
    #[error("invalid argument")]
    Invalid,

    /// Stale or unknown file handle.
    #[error("bad file handle: {0}")]
    BadHandle(u64),

    /// Metadata store failure.
    #[error(transparent)]
    Meta(MetaError),

    /// Remote object-store failure.
    #[error(transparent)]
    Storage(StorageError),

    /// Local IO failure on a staging or cache file.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The sync worker's completion channel closed without a verdict.
    #[error("sync worker terminated")]
    WorkerGone,

    /// Mount-time failure.
    #[error("mount failed: {0}")]
    Mount(String),
}

impl FsError {
    /// Kernel error code for this failure.
    pub fn errno(&self) -> libc::c_int {
        match self {
            FsError::NotFound => libc::ENOENT,
            FsError::Busy => libc::EPERM,
            FsError::Unsupported => libc::ENOSYS,
            FsError::Invalid => libc::EINVAL,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }
}

impl From<MetaError> for FsError {
    fn from(err: MetaError) -> Self {
        if err.is_no_such_object() {
            FsError::NotFound
        } else {
            FsError::Meta(err)
        }
    }
}

impl From<StorageError> for FsError {
    fn from(err: StorageError) -> Self {
        if err.is_not_found() {
            FsError::NotFound
        } else {
            FsError::Storage(err)
        }
    }
}
