//! Optional bucket-notification listener.
//!
//! Applies out-of-band object-created events to the index so another
//! client's uploads appear without a rescan. Each batch is folded into
//! one write transaction; a bad record rolls the whole batch back and
//! processing continues with the next one.
//!
//! The listener is fed from a channel rather than a concrete remote
//! subscription: plain S3 exposes no push stream without extra queue
//! wiring, so production mounts may never start one, while tests drive
//! synthetic batches.

use std::sync::Arc;

use minfs_meta::Bucket;
use minfs_storage::{EventBatch, EventRecord};
use tokio::sync::{mpsc, oneshot};

use crate::error::FsError;
use crate::fs::{MinFs, ROOT_BUCKET};
use crate::index::split_path;
use crate::node::{now_epoch, DirRecord, Entry, FileRecord, DEFAULT_DIR_MODE};

/// Event-name prefix for object creation.
const OBJECT_CREATED: &str = "s3:ObjectCreated:";

/// Spawn the listener. It stops when the stop handle fires or the
/// event channel closes.
pub fn spawn_notification_listener(
    fs: Arc<MinFs>,
    mut events: mpsc::Receiver<EventBatch>,
) -> oneshot::Sender<()> {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
    let runtime = fs.runtime_handle();

    runtime.spawn(async move {
        loop {
            tokio::select! {
                batch = events.recv() => {
                    let Some(batch) = batch else { break };
                    if let Err(err) = fs.apply_event_batch(&batch) {
                        tracing::error!("notification batch dropped: {}", err);
                    }
                }
                _ = &mut stop_rx => break,
            }
        }
        tracing::debug!("notification listener stopped");
    });

    stop_tx
}

impl MinFs {
    /// Fold one notification batch into the index.
    ///
    /// Only `s3:ObjectCreated:*` records apply; entries that already
    /// exist are left alone (the next scan refreshes their attributes).
    /// Any record error rolls the batch back.
    pub fn apply_event_batch(&self, batch: &EventBatch) -> Result<(), FsError> {
        let tx = self.db.begin(true)?;

        for record in &batch.records {
            if !record.event_name.starts_with(OBJECT_CREATED) {
                continue;
            }
            self.apply_created_record(&tx, record)?;
        }

        tx.commit()?;
        Ok(())
    }

    fn apply_created_record(
        &self,
        tx: &minfs_meta::Tx<'_>,
        record: &EventRecord,
    ) -> Result<(), FsError> {
        let (dir, leaf): (&str, &str) = split_path(&record.key);
        if leaf.is_empty() {
            return Ok(());
        }
        let now: i64 = now_epoch();

        // Synthesize ancestor directories for nested keys.
        let mut bucket: Bucket<'_> = tx.bucket(ROOT_BUCKET);
        for segment in dir.split('/').filter(|s| !s.is_empty()) {
            match bucket.get::<Entry>(segment) {
                Ok(_) => {}
                Err(err) if err.is_no_such_object() => {
                    let dir_record = DirRecord {
                        path: segment.to_string(),
                        inode: self.next_inode(tx)?,
                        mode: DEFAULT_DIR_MODE,
                        size: 0,
                        atime: now,
                        mtime: now,
                        chgtime: now,
                        crtime: now,
                        uid: self.config.uid,
                        gid: self.config.gid,
                        flags: 0,
                    };
                    bucket.put(segment, &Entry::Dir(dir_record))?;
                }
                Err(err) => return Err(err.into()),
            }
            bucket = bucket.create_bucket_if_not_exists(&format!("{}/", segment))?;
        }

        // Existing entries win; the scanner reconciles sizes later.
        match bucket.get::<Entry>(leaf) {
            Ok(_) => return Ok(()),
            Err(err) if err.is_no_such_object() => {}
            Err(err) => return Err(err.into()),
        }

        let file_record = FileRecord {
            path: leaf.to_string(),
            inode: self.next_inode(tx)?,
            mode: self.config.mode,
            size: record.size,
            etag: record.etag.clone(),
            atime: now,
            mtime: now,
            chgtime: now,
            crtime: now,
            bkuptime: 0,
            uid: self.config.uid,
            gid: self.config.gid,
            flags: 0,
            hash: None,
        };
        bucket.put(leaf, &Entry::File(file_record))?;
        Ok(())
    }
}
