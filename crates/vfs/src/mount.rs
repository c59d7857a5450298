//! Mount driver: owns the FUSE session lifecycle.
//!
//! Opens the metadata database, builds the remote client, verifies the
//! bucket, starts the sync worker, mounts, and serves until the session
//! ends or a signal asks for a clean unmount.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use minfs_meta::MetaDb;
use minfs_storage::{ObjectStore, S3Config, S3ObjectStore};

use crate::config::MountConfig;
use crate::error::FsError;
use crate::fs::{MinFs, MinFsSession};
use crate::sync::spawn_sync_worker;

/// Mount `config` and serve kernel requests until unmount.
///
/// Returns when the session ends (signal or external unmount). The
/// database closes when the filesystem is dropped on the way out.
pub fn serve(config: MountConfig) -> Result<(), FsError> {
    config.validate()?;

    let runtime: tokio::runtime::Runtime = tokio::runtime::Runtime::new()?;

    tracing::info!("opening cache database at {}", config.db_path().display());
    let db: MetaDb = MetaDb::open(&config.db_path())?;

    let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(&S3Config {
        endpoint: config.endpoint.clone(),
        bucket: config.bucket.clone(),
        region: "us-east-1".to_string(),
        access_key: config.access_key.clone(),
        secret_key: config.secret_key.clone(),
        session_token: config.secret_token.clone(),
        insecure: config.insecure,
    }));

    // Refuse to mount a bucket that does not exist.
    let exists: bool = runtime.block_on(store.bucket_exists())?;
    if !exists {
        return Err(FsError::Mount(format!(
            "bucket {} does not exist",
            config.bucket
        )));
    }

    let sync_tx = spawn_sync_worker(runtime.handle(), store.clone());
    let fs: Arc<MinFs> = Arc::new(MinFs::new(
        config.clone(),
        db,
        store,
        runtime.handle().clone(),
        sync_tx,
    )?);

    let options: Vec<MountOption> = vec![
        MountOption::FSName("MinFS".to_string()),
        MountOption::Subtype("MinFS".to_string()),
        MountOption::AllowOther,
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ];

    tracing::info!("mounting at {}", config.mountpoint.display());
    let session = fuser::spawn_mount2(MinFsSession::new(fs), &config.mountpoint, &options)
        .map_err(|e| FsError::Mount(e.to_string()))?;

    // One-shot signal trap: first INT/TERM triggers the shutdown path.
    let running: Arc<AtomicBool> = Arc::new(AtomicBool::new(true));
    let trap: Arc<AtomicBool> = running.clone();
    ctrlc::set_handler(move || {
        tracing::info!("signal received, unmounting");
        trap.store(false, Ordering::SeqCst);
    })
    .map_err(|e| FsError::Mount(format!("signal trap: {}", e)))?;

    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }

    // Dropping the session unmounts; dropping the filesystem afterwards
    // closes the database exactly once.
    drop(session);
    tracing::info!("unmounted cleanly");
    Ok(())
}
