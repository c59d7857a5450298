//! Persisted node records and kernel attribute conversion.
//!
//! The index stores one tagged entry per directory child. The `type` tag
//! lets the decoder tell files from directories without a schema hint;
//! timestamps are Unix epoch seconds, modes are plain permission bits
//! (the kind lives in the tag, not the mode).

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType};
use serde::{Deserialize, Serialize};

/// Block size advertised to the kernel.
pub const BLOCK_SIZE: u32 = 512;

/// Default mode for directories materialized from a remote listing.
pub const DEFAULT_DIR_MODE: u32 = 0o770;

/// Mode of the synthesized root directory.
pub const ROOT_DIR_MODE: u32 = 0o750;

/// Persisted attributes of a regular file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Leaf name within the parent directory.
    pub path: String,
    /// Mount-unique inode number.
    pub inode: u64,
    /// Permission bits.
    pub mode: u32,
    /// Size in bytes as of the last scan or successful upload.
    pub size: u64,
    /// Remote content identifier.
    pub etag: String,
    pub atime: i64,
    pub mtime: i64,
    pub chgtime: i64,
    pub crtime: i64,
    pub bkuptime: i64,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
    /// Content hash of the last downloaded body. Computed and stored,
    /// not yet consumed by this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<Vec<u8>>,
}

/// Persisted attributes of a directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirRecord {
    /// Leaf name within the parent directory.
    pub path: String,
    /// Mount-unique inode number.
    pub inode: u64,
    /// Permission bits.
    pub mode: u32,
    pub size: u64,
    pub atime: i64,
    pub mtime: i64,
    pub chgtime: i64,
    pub crtime: i64,
    pub uid: u32,
    pub gid: u32,
    pub flags: u32,
}

/// A directory child: either a file or a subdirectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Entry {
    #[serde(rename = "file")]
    File(FileRecord),
    #[serde(rename = "dir")]
    Dir(DirRecord),
}

impl Entry {
    /// Inode of the underlying record.
    pub fn inode(&self) -> u64 {
        match self {
            Entry::File(f) => f.inode,
            Entry::Dir(d) => d.inode,
        }
    }

    /// Leaf name of the underlying record.
    pub fn name(&self) -> &str {
        match self {
            Entry::File(f) => &f.path,
            Entry::Dir(d) => &d.path,
        }
    }

    /// Kernel file type for this entry.
    pub fn file_type(&self) -> FileType {
        match self {
            Entry::File(_) => FileType::RegularFile,
            Entry::Dir(_) => FileType::Directory,
        }
    }

    /// Kernel attributes for this entry.
    pub fn attr(&self) -> FileAttr {
        match self {
            Entry::File(f) => f.attr(),
            Entry::Dir(d) => d.attr(),
        }
    }
}

impl FileRecord {
    /// Kernel attributes for this file.
    pub fn attr(&self) -> FileAttr {
        FileAttr {
            ino: self.inode,
            size: self.size,
            blocks: self.size.div_ceil(BLOCK_SIZE as u64),
            atime: epoch_to_system(self.atime),
            mtime: epoch_to_system(self.mtime),
            ctime: epoch_to_system(self.chgtime),
            crtime: epoch_to_system(self.crtime),
            kind: FileType::RegularFile,
            perm: (self.mode & 0o7777) as u16,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: self.flags,
        }
    }
}

impl DirRecord {
    /// Kernel attributes for this directory.
    pub fn attr(&self) -> FileAttr {
        FileAttr {
            ino: self.inode,
            size: self.size,
            blocks: 0,
            atime: epoch_to_system(self.atime),
            mtime: epoch_to_system(self.mtime),
            ctime: epoch_to_system(self.chgtime),
            crtime: epoch_to_system(self.crtime),
            kind: FileType::Directory,
            perm: (self.mode & 0o7777) as u16,
            nlink: 2,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: BLOCK_SIZE,
            flags: self.flags,
        }
    }
}

/// Current time as Unix epoch seconds.
pub fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Convert epoch seconds to `SystemTime`.
pub fn epoch_to_system(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

/// Convert `SystemTime` to epoch seconds.
pub fn system_to_epoch(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_file() -> FileRecord {
        FileRecord {
            path: "a.txt".to_string(),
            inode: 7,
            mode: 0o660,
            size: 1024,
            etag: "abc".to_string(),
            atime: 100,
            mtime: 200,
            chgtime: 300,
            crtime: 50,
            bkuptime: 0,
            uid: 1000,
            gid: 1000,
            flags: 0,
            hash: None,
        }
    }

    #[test]
    fn test_tagged_roundtrip() {
        let entry = Entry::File(sample_file());
        let raw: String = serde_json::to_string(&entry).unwrap();
        assert!(raw.contains("\"type\":\"file\""));

        let back: Entry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, entry);
    }

    #[test]
    fn test_dir_and_file_distinguished() {
        let dir = Entry::Dir(DirRecord {
            path: "docs".to_string(),
            inode: 3,
            mode: DEFAULT_DIR_MODE,
            size: 0,
            atime: 0,
            mtime: 0,
            chgtime: 0,
            crtime: 0,
            uid: 0,
            gid: 0,
            flags: 0,
        });
        let raw: String = serde_json::to_string(&dir).unwrap();
        let back: Entry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.file_type(), FileType::Directory);
    }

    #[test]
    fn test_file_attr_fields() {
        let attr: FileAttr = sample_file().attr();
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.size, 1024);
        assert_eq!(attr.blocks, 2);
        assert_eq!(attr.perm, 0o660);
        assert_eq!(attr.kind, FileType::RegularFile);
        assert_eq!(attr.mtime, epoch_to_system(200));
        assert_eq!(attr.ctime, epoch_to_system(300));
    }

    #[test]
    fn test_epoch_conversions() {
        assert_eq!(system_to_epoch(epoch_to_system(12345)), 12345);
        assert_eq!(epoch_to_system(0), UNIX_EPOCH);
    }
}
