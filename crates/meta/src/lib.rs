//! Transactional metadata store for the MinFS mount index.
//!
//! The store mirrors the mounted bucket's namespace as nested buckets:
//! every directory owns a bucket (its path ends with `/`) holding one
//! entry per child, keyed by leaf name. Values are self-describing tagged
//! JSON, so a decoder can tell a file entry from a directory entry without
//! a schema hint.
//!
//! # Storage layout
//!
//! Backed by a single SQLite file:
//!
//! ```text
//! buckets(path PRIMARY KEY, seq)        -- one row per nested bucket
//! entries(bucket, key, value)           -- tagged JSON per child entry
//! ```
//!
//! Bucket paths are `/`-terminated chains (`minio/`, `minio/docs/`, ...).
//! Because nested buckets live in their own table, iteration over a
//! bucket's entries never yields directory marker keys.
//!
//! # Transactions
//!
//! Write transactions take the SQLite write lock up front (`BEGIN
//! IMMEDIATE`) and are therefore serialized; a [`Tx`] that is dropped
//! without [`Tx::commit`] rolls back. Every mutating caller opens a
//! transaction, performs its changes, and commits on the success path
//! only.

use std::cell::Cell;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Errors from metadata store operations.
#[derive(Debug, Error)]
pub enum MetaError {
    /// Lookup key is not present in the bucket.
    #[error("no such object")]
    NoSuchObject,

    /// Bucket has not been created.
    #[error("no such bucket: {0}")]
    NoSuchBucket(String),

    /// Underlying SQLite failure.
    #[error("store error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Persisted value failed to decode.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// Filesystem error while opening the database.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MetaError {
    /// True when the error is the missing-key sentinel.
    pub fn is_no_such_object(&self) -> bool {
        matches!(self, MetaError::NoSuchObject)
    }
}

/// Handle to the metadata database.
///
/// The connection is shared by every FUSE request thread; access is
/// serialized through a single mutex, with SQLite's own locking as the
/// crash-consistency layer underneath.
pub struct MetaDb {
    conn: Mutex<Connection>,
}

impl MetaDb {
    /// Open (or create) the database at `path`.
    ///
    /// Creates the parent directory when missing and bootstraps the
    /// schema. WAL mode keeps commits durable without blocking readers
    /// of other connections.
    pub fn open(path: &Path) -> Result<Self, MetaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn: Connection = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS buckets (
                 path TEXT PRIMARY KEY,
                 seq  INTEGER NOT NULL DEFAULT 0
             );
             CREATE TABLE IF NOT EXISTS entries (
                 bucket TEXT NOT NULL,
                 key    TEXT NOT NULL,
                 value  TEXT NOT NULL,
                 PRIMARY KEY (bucket, key)
             );",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Begin a transaction.
    ///
    /// # Arguments
    /// * `writable` - Take the write lock immediately when true
    ///
    /// # Returns
    /// A transaction handle that rolls back on drop unless committed.
    pub fn begin(&self, writable: bool) -> Result<Tx<'_>, MetaError> {
        let guard: MutexGuard<'_, Connection> = self.conn.lock().expect("meta db mutex poisoned");
        if writable {
            guard.execute_batch("BEGIN IMMEDIATE")?;
        } else {
            guard.execute_batch("BEGIN")?;
        }
        Ok(Tx {
            guard,
            done: Cell::new(false),
        })
    }

    /// Run `f` inside a write transaction, committing on success.
    pub fn update<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, MetaError>) -> Result<T, MetaError> {
        let tx: Tx<'_> = self.begin(true)?;
        let out: T = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Run `f` inside a read transaction.
    pub fn view<T>(&self, f: impl FnOnce(&Tx<'_>) -> Result<T, MetaError>) -> Result<T, MetaError> {
        let tx: Tx<'_> = self.begin(false)?;
        let out: T = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}

/// An open transaction on the metadata database.
///
/// Dropping an uncommitted transaction rolls it back, so every exit path
/// releases the transaction exactly once.
pub struct Tx<'db> {
    guard: MutexGuard<'db, Connection>,
    done: Cell<bool>,
}

impl<'db> Tx<'db> {
    /// Navigate to a top-level bucket by name (`/`-terminated).
    pub fn bucket(&self, name: &str) -> Bucket<'_> {
        Bucket {
            conn: &self.guard,
            path: name.to_string(),
        }
    }

    /// Create a top-level bucket when absent, then navigate to it.
    pub fn create_bucket_if_not_exists(&self, name: &str) -> Result<Bucket<'_>, MetaError> {
        self.guard.execute(
            "INSERT OR IGNORE INTO buckets (path) VALUES (?1)",
            params![name],
        )?;
        Ok(self.bucket(name))
    }

    /// Commit the transaction. On failure the drop path still rolls the
    /// transaction back.
    pub fn commit(self) -> Result<(), MetaError> {
        self.guard.execute_batch("COMMIT")?;
        self.done.set(true);
        Ok(())
    }
}

impl Drop for Tx<'_> {
    fn drop(&mut self) {
        if !self.done.get() {
            // Rollback failure here means the connection is gone; there
            // is nothing the caller can still do about it.
            let _ = self.guard.execute_batch("ROLLBACK");
        }
    }
}

/// A (possibly nested) bucket within a transaction.
pub struct Bucket<'tx> {
    conn: &'tx Connection,
    path: String,
}

impl<'tx> Bucket<'tx> {
    /// Full `/`-terminated path of this bucket.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Navigate to a child bucket.
    ///
    /// # Arguments
    /// * `name` - Child bucket name, `/`-terminated
    pub fn bucket(&self, name: &str) -> Bucket<'tx> {
        Bucket {
            conn: self.conn,
            path: format!("{}{}", self.path, name),
        }
    }

    /// Create a child bucket when absent, then navigate to it.
    pub fn create_bucket_if_not_exists(&self, name: &str) -> Result<Bucket<'tx>, MetaError> {
        let child: String = format!("{}{}", self.path, name);
        self.conn.execute(
            "INSERT OR IGNORE INTO buckets (path) VALUES (?1)",
            params![child],
        )?;
        Ok(Bucket {
            conn: self.conn,
            path: child,
        })
    }

    /// Delete a child bucket, its entries, and every descendant bucket.
    pub fn delete_bucket(&self, name: &str) -> Result<(), MetaError> {
        let child: String = format!("{}{}", self.path, name);
        self.conn.execute(
            "DELETE FROM entries WHERE bucket = ?1 OR bucket LIKE ?1 || '%'",
            params![child],
        )?;
        self.conn.execute(
            "DELETE FROM buckets WHERE path = ?1 OR path LIKE ?1 || '%'",
            params![child],
        )?;
        Ok(())
    }

    /// Fetch and decode the entry stored under `key`.
    ///
    /// # Returns
    /// The decoded value, or [`MetaError::NoSuchObject`] when the key is
    /// absent.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, MetaError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM entries WHERE bucket = ?1 AND key = ?2",
                params![self.path, key],
                |row| row.get(0),
            )
            .optional()?;

        match value {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Err(MetaError::NoSuchObject),
        }
    }

    /// Store `value` under `key`, replacing any previous entry.
    pub fn put<T: Serialize>(&self, key: &str, value: &T) -> Result<(), MetaError> {
        let raw: String = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO entries (bucket, key, value) VALUES (?1, ?2, ?3)",
            params![self.path, key, raw],
        )?;
        Ok(())
    }

    /// Delete the entry under `key`. Deleting a missing key is a no-op,
    /// matching the underlying store's semantics.
    pub fn delete(&self, key: &str) -> Result<(), MetaError> {
        self.conn.execute(
            "DELETE FROM entries WHERE bucket = ?1 AND key = ?2",
            params![self.path, key],
        )?;
        Ok(())
    }

    /// Iterate this bucket's entries in key order.
    ///
    /// Only child entries are visited; nested bucket markers are never
    /// yielded.
    pub fn for_each<T, F>(&self, mut f: F) -> Result<(), MetaError>
    where
        T: DeserializeOwned,
        F: FnMut(&str, T) -> Result<(), MetaError>,
    {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM entries WHERE bucket = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![self.path], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        for row in rows {
            let (key, raw): (String, String) = row?;
            let value: T = serde_json::from_str(&raw)?;
            f(&key, value)?;
        }
        Ok(())
    }

    /// Return the next value of this bucket's monotonic sequence.
    ///
    /// The sequence starts at 1 and never repeats within the database's
    /// lifetime. The bucket row must exist.
    pub fn next_sequence(&self) -> Result<u64, MetaError> {
        let seq: Option<u64> = self
            .conn
            .query_row(
                "UPDATE buckets SET seq = seq + 1 WHERE path = ?1 RETURNING seq",
                params![self.path],
                |row| row.get(0),
            )
            .optional()?;
        seq.ok_or_else(|| MetaError::NoSuchBucket(self.path.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type")]
    enum TestEntry {
        #[serde(rename = "file")]
        File { size: u64, etag: String },
        #[serde(rename = "dir")]
        Dir { inode: u64 },
    }

    fn open_temp() -> (MetaDb, TempDir) {
        let dir = TempDir::new().unwrap();
        let db = MetaDb::open(&dir.path().join("cache.db")).unwrap();
        (db, dir)
    }

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("a/b/cache.db");
        MetaDb::open(&nested).unwrap();
        assert!(nested.exists());
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            let b = tx.create_bucket_if_not_exists("minio/")?;
            b.put(
                "a.txt",
                &TestEntry::File {
                    size: 5,
                    etag: "abc".to_string(),
                },
            )
        })
        .unwrap();

        let got: TestEntry = db
            .view(|tx| tx.bucket("minio/").get("a.txt"))
            .unwrap();
        assert_eq!(
            got,
            TestEntry::File {
                size: 5,
                etag: "abc".to_string()
            }
        );
    }

    #[test]
    fn test_get_missing_is_no_such_object() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            tx.create_bucket_if_not_exists("minio/")?;
            Ok(())
        })
        .unwrap();

        let err = db
            .view(|tx| tx.bucket("minio/").get::<TestEntry>("missing"))
            .unwrap_err();
        assert!(err.is_no_such_object());
    }

    #[test]
    fn test_tagged_decode_distinguishes_variants() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            let b = tx.create_bucket_if_not_exists("minio/")?;
            b.put("docs", &TestEntry::Dir { inode: 7 })?;
            b.put(
                "a.txt",
                &TestEntry::File {
                    size: 1,
                    etag: "e".to_string(),
                },
            )
        })
        .unwrap();

        db.view(|tx| {
            let b = tx.bucket("minio/");
            assert!(matches!(b.get::<TestEntry>("docs")?, TestEntry::Dir { .. }));
            assert!(matches!(b.get::<TestEntry>("a.txt")?, TestEntry::File { .. }));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_rollback_on_drop() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            tx.create_bucket_if_not_exists("minio/")?;
            Ok(())
        })
        .unwrap();

        {
            let tx = db.begin(true).unwrap();
            let b = tx.bucket("minio/");
            b.put("a.txt", &TestEntry::Dir { inode: 1 }).unwrap();
            // dropped without commit
        }

        let err = db
            .view(|tx| tx.bucket("minio/").get::<TestEntry>("a.txt"))
            .unwrap_err();
        assert!(err.is_no_such_object());
    }

    #[test]
    fn test_next_sequence_is_monotonic() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            tx.create_bucket_if_not_exists("minio/")?;
            Ok(())
        })
        .unwrap();

        let seqs: Vec<u64> = db
            .update(|tx| {
                let b = tx.bucket("minio/");
                Ok(vec![
                    b.next_sequence()?,
                    b.next_sequence()?,
                    b.next_sequence()?,
                ])
            })
            .unwrap();
        assert_eq!(seqs, vec![1, 2, 3]);

        // Survives the transaction boundary.
        let next: u64 = db.update(|tx| tx.bucket("minio/").next_sequence()).unwrap();
        assert_eq!(next, 4);
    }

    #[test]
    fn test_next_sequence_missing_bucket() {
        let (db, _dir) = open_temp();
        let err = db
            .update(|tx| tx.bucket("nope/").next_sequence())
            .unwrap_err();
        assert!(matches!(err, MetaError::NoSuchBucket(_)));
    }

    #[test]
    fn test_nested_buckets_are_isolated() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            let root = tx.create_bucket_if_not_exists("minio/")?;
            let docs = root.create_bucket_if_not_exists("docs/")?;
            root.put("top", &TestEntry::Dir { inode: 2 })?;
            docs.put("inner", &TestEntry::Dir { inode: 3 })
        })
        .unwrap();

        db.view(|tx| {
            let root = tx.bucket("minio/");
            assert!(root.get::<TestEntry>("inner").unwrap_err().is_no_such_object());
            let docs = root.bucket("docs/");
            assert!(matches!(docs.get::<TestEntry>("inner")?, TestEntry::Dir { .. }));
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_for_each_in_key_order() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            let b = tx.create_bucket_if_not_exists("minio/")?;
            b.put("b.txt", &TestEntry::Dir { inode: 1 })?;
            b.put("a.txt", &TestEntry::Dir { inode: 2 })?;
            b.put("c.txt", &TestEntry::Dir { inode: 3 })
        })
        .unwrap();

        let mut keys: Vec<String> = Vec::new();
        db.view(|tx| {
            tx.bucket("minio/").for_each::<TestEntry, _>(|k, _| {
                keys.push(k.to_string());
                Ok(())
            })
        })
        .unwrap();
        assert_eq!(keys, vec!["a.txt", "b.txt", "c.txt"]);
    }

    #[test]
    fn test_for_each_skips_nested_bucket_markers() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            let b = tx.create_bucket_if_not_exists("minio/")?;
            b.create_bucket_if_not_exists("docs/")?;
            b.put("docs", &TestEntry::Dir { inode: 1 })?;
            b.put("a.txt", &TestEntry::Dir { inode: 2 })
        })
        .unwrap();

        let mut keys: Vec<String> = Vec::new();
        db.view(|tx| {
            tx.bucket("minio/").for_each::<TestEntry, _>(|k, _| {
                keys.push(k.to_string());
                Ok(())
            })
        })
        .unwrap();

        assert!(keys.iter().all(|k| !k.ends_with('/')));
        assert_eq!(keys, vec!["a.txt", "docs"]);
    }

    #[test]
    fn test_delete_bucket_removes_descendants() {
        let (db, _dir) = open_temp();

        db.update(|tx| {
            let root = tx.create_bucket_if_not_exists("minio/")?;
            let docs = root.create_bucket_if_not_exists("docs/")?;
            let deep = docs.create_bucket_if_not_exists("deep/")?;
            root.put("docs", &TestEntry::Dir { inode: 1 })?;
            docs.put("x.txt", &TestEntry::Dir { inode: 2 })?;
            deep.put("y.txt", &TestEntry::Dir { inode: 3 })
        })
        .unwrap();

        db.update(|tx| {
            let root = tx.bucket("minio/");
            root.delete("docs")?;
            root.delete_bucket("docs/")
        })
        .unwrap();

        db.view(|tx| {
            let root = tx.bucket("minio/");
            assert!(root.get::<TestEntry>("docs").unwrap_err().is_no_such_object());
            assert!(root
                .bucket("docs/")
                .get::<TestEntry>("x.txt")
                .unwrap_err()
                .is_no_such_object());
            assert!(root
                .bucket("docs/")
                .bucket("deep/")
                .get::<TestEntry>("y.txt")
                .unwrap_err()
                .is_no_such_object());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_persistence_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("cache.db");

        {
            let db = MetaDb::open(&path).unwrap();
            db.update(|tx| {
                let b = tx.create_bucket_if_not_exists("minio/")?;
                b.put(
                    "a.txt",
                    &TestEntry::File {
                        size: 9,
                        etag: "z".to_string(),
                    },
                )
            })
            .unwrap();
        }

        let db = MetaDb::open(&path).unwrap();
        let got: TestEntry = db.view(|tx| tx.bucket("minio/").get("a.txt")).unwrap();
        assert_eq!(
            got,
            TestEntry::File {
                size: 9,
                etag: "z".to_string()
            }
        );
    }
}
