//! Open-file handles and the mount's handle table.

use std::path::PathBuf;
use std::sync::Arc;

use crate::error::FsError;
use crate::node::FileRecord;

/// An open file: a staging file on local disk backing one kernel handle.
#[derive(Debug)]
pub struct FileHandle {
    /// Slot index in the handle table, surfaced to the kernel as `fh`.
    pub id: u64,
    /// Parent directory path (`""` for root).
    pub dir_path: String,
    /// The file's attribute record. `size` here is authoritative while
    /// the handle is dirty.
    pub record: FileRecord,
    /// Local staging or cache file backing reads and writes.
    pub file: Arc<std::fs::File>,
    /// Path of the backing file.
    pub cache_path: PathBuf,
    /// Whether the staging file has been written since open.
    pub dirty: bool,
    /// Content-addressed cache files are retained on release; staging
    /// files are removed.
    pub content_addressed: bool,
}

/// Grow-only table of open handles.
///
/// Slots are cleared on release and never reused, so a handle id is
/// unambiguous for the life of the mount.
#[derive(Debug, Default)]
pub struct HandleTable {
    slots: Vec<Option<FileHandle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a handle, assigning its slot id.
    pub fn acquire(&mut self, mut handle: FileHandle) -> u64 {
        let id: u64 = self.slots.len() as u64;
        handle.id = id;
        self.slots.push(Some(handle));
        id
    }

    /// Borrow a live handle.
    pub fn get(&self, id: u64) -> Result<&FileHandle, FsError> {
        self.slots
            .get(id as usize)
            .and_then(|slot| slot.as_ref())
            .ok_or(FsError::BadHandle(id))
    }

    /// Mutably borrow a live handle.
    pub fn get_mut(&mut self, id: u64) -> Result<&mut FileHandle, FsError> {
        self.slots
            .get_mut(id as usize)
            .and_then(|slot| slot.as_mut())
            .ok_or(FsError::BadHandle(id))
    }

    /// Take a handle out of the table, clearing its slot.
    pub fn release(&mut self, id: u64) -> Result<FileHandle, FsError> {
        self.slots
            .get_mut(id as usize)
            .and_then(|slot| slot.take())
            .ok_or(FsError::BadHandle(id))
    }

    /// Number of live handles.
    pub fn live(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Iterate over live handles.
    pub fn iter_live(&self) -> impl Iterator<Item = &FileHandle> {
        self.slots.iter().filter_map(|slot| slot.as_ref())
    }

    /// Iterate over live handles mutably.
    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut FileHandle> {
        self.slots.iter_mut().filter_map(|slot| slot.as_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::now_epoch;
    use tempfile::TempDir;

    fn sample_handle(dir: &TempDir, name: &str) -> FileHandle {
        let cache_path = dir.path().join(name);
        let file = std::fs::File::create(&cache_path).unwrap();
        let now = now_epoch();
        FileHandle {
            id: 0,
            dir_path: String::new(),
            record: FileRecord {
                path: name.to_string(),
                inode: 2,
                mode: 0o660,
                size: 0,
                etag: String::new(),
                atime: now,
                mtime: now,
                chgtime: now,
                crtime: now,
                bkuptime: 0,
                uid: 0,
                gid: 0,
                flags: 0,
                hash: None,
            },
            file: Arc::new(file),
            cache_path,
            dirty: false,
            content_addressed: false,
        }
    }

    #[test]
    fn test_acquire_assigns_sequential_slots() {
        let dir = TempDir::new().unwrap();
        let mut table = HandleTable::new();

        let a = table.acquire(sample_handle(&dir, "a"));
        let b = table.acquire(sample_handle(&dir, "b"));
        assert_eq!((a, b), (0, 1));
        assert_eq!(table.live(), 2);
    }

    #[test]
    fn test_release_clears_slot_without_reuse() {
        let dir = TempDir::new().unwrap();
        let mut table = HandleTable::new();

        let a = table.acquire(sample_handle(&dir, "a"));
        table.release(a).unwrap();
        assert!(table.get(a).is_err());

        // The slot is not recycled; the next handle takes a fresh one.
        let b = table.acquire(sample_handle(&dir, "b"));
        assert_eq!(b, 1);
    }

    #[test]
    fn test_unknown_handle_is_ebadf() {
        let table = HandleTable::new();
        let err = table.get(42).unwrap_err();
        assert_eq!(err.errno(), libc::EBADF);
    }
}
