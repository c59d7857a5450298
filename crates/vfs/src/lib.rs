//! FUSE filesystem core for MinFS.
//!
//! Exposes an S3-compatible bucket as a locally mounted filesystem. The
//! bucket's namespace is mirrored into a transactional local index;
//! file bodies stage through a local disk cache, and all remote writes
//! funnel through a single serialized sync worker.
//!
//! # Architecture
//!
//! ```text
//! kernel -> fuser session -> MinFs operations
//!             reads:  content-addressed cache file (downloaded on miss)
//!             writes: staging file -> flush -> sync worker -> PUT
//!             index:  minfs-meta transactions, reconciled by the scanner
//! ```

pub mod cache;
pub mod config;
pub mod error;
pub mod fs;
pub mod handle;
pub mod index;
pub mod lock;
pub mod mount;
pub mod node;
pub mod notify;
pub mod scan;
pub mod sync;

pub use config::{AccessConfig, MountConfig};
pub use error::FsError;
pub use fs::{DirEntryOut, MinFs, MinFsSession, SetattrArgs, ROOT_BUCKET};
pub use index::{NodeIndex, NodeKind, ROOT_INODE};
pub use node::{DirRecord, Entry, FileRecord};
pub use lock::LockTable;
pub use mount::serve;
pub use notify::spawn_notification_listener;
pub use sync::{spawn_sync_worker, Operation};
