//! Upload-body sizing and content-type inference.
//!
//! Uploads always advertise the node's declared size, which is what the
//! kernel saw through `Attr`; the staging file on disk may briefly
//! disagree. [`read_sized`] materializes a body of exactly the declared
//! length regardless.

use std::io::Read;
use std::path::Path;

/// Read `path` into a buffer of exactly `length` bytes.
///
/// A longer staging file is truncated; a shorter one is zero-filled up
/// to the declared length, so the remote always receives a body whose
/// size matches the advertised Content-Length.
pub fn read_sized(path: &Path, length: u64) -> std::io::Result<Vec<u8>> {
    let file: std::fs::File = std::fs::File::open(path)?;
    let mut body: Vec<u8> = Vec::with_capacity(length as usize);
    file.take(length).read_to_end(&mut body)?;
    body.resize(length as usize, 0);
    Ok(body)
}

/// Infer a content type from the object key's extension.
///
/// Covers the types the gateway side cares about; everything else is an
/// opaque octet stream.
pub fn content_type_for(key: &str) -> &'static str {
    let ext: &str = key.rsplit('.').next().unwrap_or_default();
    match ext {
        "txt" | "log" => "text/plain",
        "html" | "htm" => "text/html",
        "css" => "text/css",
        "csv" => "text/csv",
        "md" => "text/markdown",
        "js" => "text/javascript",
        "json" => "application/json",
        "xml" => "application/xml",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_temp(contents: &[u8]) -> (std::path::PathBuf, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("staging");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents).unwrap();
        (path, dir)
    }

    #[test]
    fn test_read_sized_exact() {
        let (path, _dir) = write_temp(b"hello");
        let body = read_sized(&path, 5).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_read_sized_truncates_longer_file() {
        let (path, _dir) = write_temp(b"hello world");
        let body = read_sized(&path, 5).unwrap();
        assert_eq!(body, b"hello");
    }

    #[test]
    fn test_read_sized_pads_shorter_file() {
        let (path, _dir) = write_temp(b"hi");
        let body = read_sized(&path, 4).unwrap();
        assert_eq!(body, b"hi\0\0");
    }

    #[test]
    fn test_read_sized_empty() {
        let (path, _dir) = write_temp(b"leftover");
        let body = read_sized(&path, 0).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_content_type_for() {
        assert_eq!(content_type_for("docs/readme.txt"), "text/plain");
        assert_eq!(content_type_for("a/b/photo.jpeg"), "image/jpeg");
        assert_eq!(content_type_for("archive.tar"), "application/x-tar");
        assert_eq!(content_type_for("no_extension"), "application/octet-stream");
    }
}
