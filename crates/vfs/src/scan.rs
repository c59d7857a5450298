//! Directory reconciliation against the remote listing.
//!
//! A directory is scanned lazily, on its first lookup or readdir of the
//! session. The scan folds a non-recursive remote listing into the
//! directory's bucket inside one write transaction: observed children
//! are inserted or refreshed, and children the listing no longer
//! mentions are purged. The purge runs only after the listing drained
//! completely; a listing error aborts the transaction and leaves the
//! directory unscanned so the next access retries.

use std::collections::HashMap;

use minfs_meta::Bucket;
use minfs_storage::ObjectInfo;

use crate::error::FsError;
use crate::fs::MinFs;
use crate::node::{DirRecord, Entry, FileRecord, DEFAULT_DIR_MODE};

impl MinFs {
    /// Reconcile `dir_path`'s children with the remote.
    pub(crate) fn scan_directory(&self, dir_path: &str) -> Result<(), FsError> {
        let prefix: String = self.config.remote_prefix(dir_path);

        // List first: a failed listing must not touch the index at all.
        let listing: Vec<ObjectInfo> = self
            .runtime
            .block_on(self.store.list_objects(&prefix, false))?;

        let tx = self.db.begin(true)?;
        let bucket: Bucket<'_> = Self::bucket_for(&tx, dir_path);

        // Working map of currently persisted children. Entries still
        // present remotely are cleared to None as the listing replays.
        let mut known: HashMap<String, Option<Entry>> = HashMap::new();
        bucket.for_each::<Entry, _>(|name, entry| {
            known.insert(name.to_string(), Some(entry));
            Ok(())
        })?;

        for object in &listing {
            let key: &str = object.key.strip_prefix(&prefix).unwrap_or(&object.key);
            if key.is_empty() {
                continue;
            }
            let leaf: &str = key.trim_end_matches('/').rsplit('/').next().unwrap_or(key);

            known.insert(leaf.to_string(), None);

            if key.ends_with('/') {
                self.store_scanned_dir(&tx, &bucket, leaf, object)?;
            } else {
                self.store_scanned_file(&tx, &bucket, leaf, object)?;
            }
        }

        // Purge children the (complete) listing never mentioned.
        for (name, stale) in &known {
            let Some(entry) = stale else { continue };
            bucket.delete(name)?;
            if matches!(entry, Entry::Dir(_)) {
                bucket.delete_bucket(&format!("{}/", name))?;
            }
        }

        tx.commit()?;

        self.index
            .lock()
            .expect("node index mutex poisoned")
            .set_scanned(dir_path);
        tracing::debug!(
            "scanned {:?}: {} remote children",
            dir_path,
            listing.len()
        );
        Ok(())
    }

    /// Upsert one listed file into the directory bucket.
    ///
    /// An existing entry keeps its inode; size and ETag follow the
    /// remote, and timestamps only ever advance.
    fn store_scanned_file(
        &self,
        tx: &minfs_meta::Tx<'_>,
        bucket: &Bucket<'_>,
        leaf: &str,
        object: &ObjectInfo,
    ) -> Result<(), FsError> {
        match bucket.get::<Entry>(leaf) {
            Ok(Entry::File(mut record)) => {
                record.size = object.size;
                record.etag = object.etag.clone();
                record.atime = record.atime.max(object.last_modified);
                record.mtime = record.mtime.max(object.last_modified);
                record.chgtime = record.chgtime.max(object.last_modified);
                record.crtime = record.crtime.max(object.last_modified);
                bucket.put(leaf, &Entry::File(record))?;
                Ok(())
            }
            Ok(Entry::Dir(_)) => {
                // Kind flip: the remote replaced a directory with an
                // object of the same name. Re-create as a file.
                bucket.delete_bucket(&format!("{}/", leaf))?;
                self.insert_scanned_file(tx, bucket, leaf, object)
            }
            Err(err) if err.is_no_such_object() => {
                self.insert_scanned_file(tx, bucket, leaf, object)
            }
            Err(err) => Err(err.into()),
        }
    }

    fn insert_scanned_file(
        &self,
        tx: &minfs_meta::Tx<'_>,
        bucket: &Bucket<'_>,
        leaf: &str,
        object: &ObjectInfo,
    ) -> Result<(), FsError> {
        let record = FileRecord {
            path: leaf.to_string(),
            inode: self.next_inode(tx)?,
            mode: self.config.mode,
            size: object.size,
            etag: object.etag.clone(),
            atime: object.last_modified,
            mtime: object.last_modified,
            chgtime: object.last_modified,
            crtime: object.last_modified,
            bkuptime: 0,
            uid: self.config.uid,
            gid: self.config.gid,
            flags: 0,
            hash: None,
        };
        bucket.put(leaf, &Entry::File(record))?;
        Ok(())
    }

    /// Upsert one listed directory prefix into the directory bucket.
    fn store_scanned_dir(
        &self,
        tx: &minfs_meta::Tx<'_>,
        bucket: &Bucket<'_>,
        leaf: &str,
        object: &ObjectInfo,
    ) -> Result<(), FsError> {
        let existing = bucket.get::<Entry>(leaf);
        match existing {
            Ok(Entry::Dir(_)) => return Ok(()),
            Ok(Entry::File(_)) => {}
            Err(err) if err.is_no_such_object() => {}
            Err(err) => return Err(err.into()),
        }

        let record = DirRecord {
            path: leaf.to_string(),
            inode: self.next_inode(tx)?,
            mode: DEFAULT_DIR_MODE,
            size: 0,
            atime: object.last_modified,
            mtime: object.last_modified,
            chgtime: object.last_modified,
            crtime: object.last_modified,
            uid: self.config.uid,
            gid: self.config.gid,
            flags: 0,
        };
        bucket.put(leaf, &Entry::Dir(record))?;
        bucket.create_bucket_if_not_exists(&format!("{}/", leaf))?;
        Ok(())
    }
}
