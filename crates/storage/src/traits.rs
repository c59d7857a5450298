//! Object-store trait and result types.

use std::path::Path;

use async_trait::async_trait;

use crate::error::StorageError;

/// Information about a remote object from list operations.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    /// Full object key (directory prefixes end with `/`).
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modified timestamp (Unix epoch seconds).
    pub last_modified: i64,
    /// ETag (usually MD5 for non-multipart uploads).
    pub etag: String,
}

/// Object metadata from stat operations.
#[derive(Debug, Clone)]
pub struct ObjectStat {
    /// Object size in bytes.
    pub size: u64,
    /// Last modified timestamp (Unix epoch seconds).
    pub last_modified: i64,
    /// ETag of the object.
    pub etag: String,
    /// Content type, when the remote reports one.
    pub content_type: Option<String>,
}

/// One record from a bucket notification stream.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Event name, e.g. `s3:ObjectCreated:Put`.
    pub event_name: String,
    /// Object key the event refers to.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// ETag of the object.
    pub etag: String,
}

/// A batch of notification records delivered together.
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    pub records: Vec<EventRecord>,
}

/// Remote operations consumed by the filesystem core.
///
/// Exactly the surface the mount needs: existence check, listing, byte
/// transfer, server-side copy, and delete. Implementations do not retry;
/// transient failures surface verbatim.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Check whether the target bucket exists and is accessible.
    async fn bucket_exists(&self) -> Result<bool, StorageError>;

    /// List objects under `prefix`.
    ///
    /// # Arguments
    /// * `prefix` - Key prefix to list under (`""` for the whole bucket)
    /// * `recursive` - When false, common prefixes are returned as
    ///   `/`-terminated directory keys with zero size
    ///
    /// # Returns
    /// The drained listing. An error means the listing must be treated
    /// as partial.
    async fn list_objects(
        &self,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Stat a single object.
    ///
    /// Missing keys surface as [`StorageError::NotFound`].
    async fn stat_object(&self, key: &str) -> Result<ObjectStat, StorageError>;

    /// Download an object body into `dest`, returning the number of
    /// bytes written.
    async fn get_object(&self, key: &str, dest: &Path) -> Result<u64, StorageError>;

    /// Upload `body` under `key` with the given content type. The body
    /// length is the object's Content-Length, exactly.
    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError>;

    /// Server-side copy `src` to `dst` within the bucket.
    async fn copy_object(&self, src: &str, dst: &str) -> Result<(), StorageError>;

    /// Remove the object under `key`.
    async fn remove_object(&self, key: &str) -> Result<(), StorageError>;
}
