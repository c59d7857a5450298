//! Remote object-store abstraction for MinFS.
//!
//! The filesystem core consumes a small set of object operations through
//! the [`ObjectStore`] trait; the production implementation speaks to any
//! S3-compatible endpoint via the AWS SDK. Tests substitute an in-memory
//! implementation.

mod error;
mod s3;
mod sized;
mod traits;

pub use error::StorageError;
pub use s3::{S3Config, S3ObjectStore};
pub use sized::{content_type_for, read_sized};
pub use traits::{EventBatch, EventRecord, ObjectInfo, ObjectStat, ObjectStore};
