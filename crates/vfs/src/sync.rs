//! The serialized remote mutation worker.
//!
//! All remote writes (uploads, server-side copies, moves) flow through a
//! single task consuming an operation channel, so there is no
//! parallelism in the upload path and operations from one caller run in
//! FIFO order. Each operation carries a single-slot completion channel;
//! the worker terminates every operation by sending exactly one verdict.

use std::path::PathBuf;
use std::sync::Arc;

use minfs_storage::{content_type_for, read_sized, ObjectStore, StorageError};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

/// One unit of remote write work.
#[derive(Debug)]
pub enum Operation {
    /// Upload a staging file as `target`, advertising exactly `length`
    /// bytes.
    Put {
        source: PathBuf,
        target: String,
        length: u64,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
    /// Server-side copy `source` to `target`.
    Copy {
        source: String,
        target: String,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
    /// Server-side copy then delete of `source`.
    Move {
        source: String,
        target: String,
        done: oneshot::Sender<Result<(), StorageError>>,
    },
}

/// Spawn the sync worker on the runtime and return its input channel.
///
/// Dropping every sender shuts the worker down.
pub fn spawn_sync_worker(
    runtime: &Handle,
    store: Arc<dyn ObjectStore>,
) -> mpsc::UnboundedSender<Operation> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Operation>();

    runtime.spawn(async move {
        while let Some(op) = rx.recv().await {
            match op {
                Operation::Move {
                    source,
                    target,
                    done,
                } => {
                    let result: Result<(), StorageError> = move_op(&store, &source, &target).await;
                    let _ = done.send(result);
                }
                Operation::Copy {
                    source,
                    target,
                    done,
                } => {
                    let result: Result<(), StorageError> =
                        store.copy_object(&source, &target).await;
                    let _ = done.send(result);
                }
                Operation::Put {
                    source,
                    target,
                    length,
                    done,
                } => {
                    let result: Result<(), StorageError> =
                        put_op(&store, &source, &target, length).await;
                    let _ = done.send(result);
                }
            }
        }
        tracing::debug!("sync worker stopped");
    });

    tx
}

async fn move_op(
    store: &Arc<dyn ObjectStore>,
    source: &str,
    target: &str,
) -> Result<(), StorageError> {
    store.copy_object(source, target).await?;
    store.remove_object(source).await
}

async fn put_op(
    store: &Arc<dyn ObjectStore>,
    source: &std::path::Path,
    target: &str,
    length: u64,
) -> Result<(), StorageError> {
    let body: Vec<u8> = read_sized(source, length)?;
    store
        .put_object(target, body, content_type_for(target))
        .await?;
    tracing::info!("upload finished: {} -> {}", source.display(), target);
    Ok(())
}
