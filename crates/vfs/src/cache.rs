//! Local cache-file management.
//!
//! Two kinds of files live under the cache directory, next to the
//! metadata database:
//!
//! - **Staging files** back dirty handles (new files, truncating opens).
//!   Their names are random suffixes; they are removed on release.
//! - **Content-addressed files** back clean reads. They are named after
//!   the object's ETag, so a body already on disk is reused without a
//!   download, and they are retained across releases.

use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Allocate a fresh staging path under `cache_dir`.
///
/// Appends a random suffix and retries until the path does not exist.
pub fn new_staging_path(cache_dir: &Path) -> std::io::Result<PathBuf> {
    loop {
        let candidate: PathBuf = cache_dir.join(Uuid::new_v4().simple().to_string());
        match std::fs::metadata(&candidate) {
            Ok(_) => continue,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(candidate),
            Err(err) => return Err(err),
        }
    }
}

/// Content-addressed cache path for an object body.
pub fn etag_cache_path(cache_dir: &Path, etag: &str) -> PathBuf {
    cache_dir.join(etag)
}

/// Whether `path` is a content-addressed cache file for `etag`.
pub fn is_content_addressed(path: &Path, etag: &str) -> bool {
    !etag.is_empty()
        && path
            .file_name()
            .map(|n| n == std::ffi::OsStr::new(etag))
            .unwrap_or(false)
}

/// SHA-256 of a file's contents.
///
/// The digest is stored on the file record for future use (encrypting
/// cached bodies); nothing consumes it yet.
pub fn hash_file(path: &Path) -> std::io::Result<Vec<u8>> {
    let mut file: std::fs::File = std::fs::File::open(path)?;
    let mut hasher: Sha256 = Sha256::new();
    let mut buf: [u8; 64 * 1024] = [0; 64 * 1024];
    loop {
        let n: usize = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_staging_paths_are_unique_and_vacant() {
        let dir = TempDir::new().unwrap();
        let a = new_staging_path(dir.path()).unwrap();
        let b = new_staging_path(dir.path()).unwrap();

        assert_ne!(a, b);
        assert!(!a.exists());
        assert_eq!(a.parent().unwrap(), dir.path());
    }

    #[test]
    fn test_etag_cache_path() {
        let dir = TempDir::new().unwrap();
        let p = etag_cache_path(dir.path(), "abc123");
        assert_eq!(p.file_name().unwrap(), "abc123");
        assert!(is_content_addressed(&p, "abc123"));
        assert!(!is_content_addressed(&p, "other"));
        assert!(!is_content_addressed(&p, ""));
    }

    #[test]
    fn test_hash_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("body");
        std::fs::write(&path, b"hello").unwrap();

        let digest = hash_file(&path).unwrap();
        assert_eq!(digest.len(), 32);

        // Deterministic for identical content.
        let path2 = dir.path().join("body2");
        std::fs::write(&path2, b"hello").unwrap();
        assert_eq!(digest, hash_file(&path2).unwrap());

        // Differs for different content.
        std::fs::write(&path2, b"world").unwrap();
        assert_ne!(digest, hash_file(&path2).unwrap());
    }
}
