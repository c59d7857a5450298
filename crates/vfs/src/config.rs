//! Mount configuration and persisted access credentials.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::FsError;

/// Default cache/database directory.
pub const DEFAULT_CACHE_DIR: &str = "/var/lib/minfs";

/// Default mode for files materialized from a remote listing.
pub const DEFAULT_FILE_MODE: u32 = 0o660;

/// Configuration for one mount.
#[derive(Debug, Clone)]
pub struct MountConfig {
    /// Remote endpoint, scheme and host only (`https://play.min.io:9000`).
    pub endpoint: String,
    /// Bucket to mount.
    pub bucket: String,
    /// Key prefix within the bucket (`""` for the whole bucket).
    pub base_path: String,
    /// Where to mount.
    pub mountpoint: PathBuf,
    /// Cache and database directory.
    pub cache_dir: PathBuf,
    /// Owner uid applied to all entries.
    pub uid: u32,
    /// Owner gid applied to all entries.
    pub gid: u32,
    /// Default file mode.
    pub mode: u32,
    /// Skip TLS certificate verification.
    pub insecure: bool,
    /// Per-request debug logging.
    pub debug: bool,
    /// Access key for the remote.
    pub access_key: String,
    /// Secret key for the remote.
    pub secret_key: String,
    /// Optional session token.
    pub secret_token: Option<String>,
}

impl MountConfig {
    /// Build a config from the CLI's positional arguments.
    ///
    /// # Arguments
    /// * `target` - `http[s]://host[:port]/bucket[/base/path]`
    /// * `mountpoint` - Local mount directory
    pub fn new(target: &str, mountpoint: &Path) -> Result<Self, FsError> {
        let url: Url =
            Url::parse(target).map_err(|e| FsError::Mount(format!("bad target URL: {}", e)))?;

        let host: &str = url
            .host_str()
            .ok_or_else(|| FsError::Mount("target has no host".to_string()))?;
        let endpoint: String = match url.port() {
            Some(port) => format!("{}://{}:{}", url.scheme(), host, port),
            None => format!("{}://{}", url.scheme(), host),
        };

        let mut segments = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()))
            .ok_or_else(|| FsError::Mount("target has no bucket".to_string()))?;
        let bucket: String = segments
            .next()
            .ok_or_else(|| FsError::Mount("target has no bucket".to_string()))?
            .to_string();
        let base_path: String = segments.collect::<Vec<_>>().join("/");

        Ok(Self {
            endpoint,
            bucket,
            base_path,
            mountpoint: mountpoint.to_path_buf(),
            cache_dir: PathBuf::from(DEFAULT_CACHE_DIR),
            uid: 0,
            gid: 0,
            mode: DEFAULT_FILE_MODE,
            insecure: false,
            debug: false,
            access_key: String::new(),
            secret_key: String::new(),
            secret_token: None,
        })
    }

    /// Path of the metadata database.
    pub fn db_path(&self) -> PathBuf {
        self.cache_dir.join("cache.db")
    }

    /// Remote key prefix for a directory path within the mount.
    pub fn remote_prefix(&self, dir_path: &str) -> String {
        let joined: String = self.remote_key(dir_path);
        if joined.is_empty() {
            joined
        } else {
            format!("{}/", joined)
        }
    }

    /// Remote key for a node path within the mount.
    pub fn remote_key(&self, path: &str) -> String {
        match (self.base_path.is_empty(), path.is_empty()) {
            (true, _) => path.to_string(),
            (false, true) => self.base_path.clone(),
            (false, false) => format!("{}/{}", self.base_path, path),
        }
    }

    /// Validate the config before mounting.
    pub fn validate(&self) -> Result<(), FsError> {
        if self.bucket.is_empty() {
            return Err(FsError::Mount("bucket not set".to_string()));
        }
        if self.mountpoint.as_os_str().is_empty() {
            return Err(FsError::Mount("mountpoint not set".to_string()));
        }
        Ok(())
    }
}

/// Access credentials persisted as `config.json` in the cache directory.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessConfig {
    pub version: String,
    #[serde(rename = "accessKey")]
    pub access_key: String,
    #[serde(rename = "secretKey")]
    pub secret_key: String,
    #[serde(rename = "secretToken")]
    pub secret_token: String,
}

impl AccessConfig {
    /// Load `config.json` from `cache_dir`, creating it from the
    /// environment on first run. Environment variables override
    /// persisted values when set.
    pub fn load_or_init(cache_dir: &Path) -> Result<Self, FsError> {
        std::fs::create_dir_all(cache_dir)?;
        let path: PathBuf = cache_dir.join("config.json");

        let mut config: AccessConfig = if path.exists() {
            let raw: String = std::fs::read_to_string(&path)?;
            serde_json::from_str(&raw).map_err(|e| FsError::Mount(format!("bad config.json: {}", e)))?
        } else {
            let fresh = AccessConfig {
                version: "1".to_string(),
                access_key: std::env::var("MINFS_ACCESS_KEY").unwrap_or_default(),
                secret_key: std::env::var("MINFS_SECRET_KEY").unwrap_or_default(),
                secret_token: std::env::var("MINFS_SECRET_TOKEN").unwrap_or_default(),
            };
            let raw: String = serde_json::to_string(&fresh)
                .map_err(|e| FsError::Mount(format!("encode config.json: {}", e)))?;
            std::fs::write(&path, raw)?;
            fresh
        };

        if let Ok(v) = std::env::var("MINFS_ACCESS_KEY") {
            if !v.is_empty() {
                config.access_key = v;
            }
        }
        if let Ok(v) = std::env::var("MINFS_SECRET_KEY") {
            if !v.is_empty() {
                config.secret_key = v;
            }
        }
        if let Ok(v) = std::env::var("MINFS_SECRET_TOKEN") {
            if !v.is_empty() {
                config.secret_token = v;
            }
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_parsing() {
        let config = MountConfig::new("https://play.min.io:9000/testbucket", Path::new("/mnt/b"))
            .unwrap();
        assert_eq!(config.endpoint, "https://play.min.io:9000");
        assert_eq!(config.bucket, "testbucket");
        assert_eq!(config.base_path, "");
    }

    #[test]
    fn test_target_with_base_path() {
        let config =
            MountConfig::new("http://localhost:9000/bucket/some/prefix", Path::new("/mnt/b"))
                .unwrap();
        assert_eq!(config.endpoint, "http://localhost:9000");
        assert_eq!(config.bucket, "bucket");
        assert_eq!(config.base_path, "some/prefix");
    }

    #[test]
    fn test_target_without_bucket_fails() {
        assert!(MountConfig::new("http://localhost:9000", Path::new("/mnt/b")).is_err());
        assert!(MountConfig::new("http://localhost:9000/", Path::new("/mnt/b")).is_err());
    }

    #[test]
    fn test_remote_key_and_prefix() {
        let mut config =
            MountConfig::new("http://localhost:9000/bucket", Path::new("/mnt/b")).unwrap();
        assert_eq!(config.remote_key("a/b.txt"), "a/b.txt");
        assert_eq!(config.remote_prefix(""), "");
        assert_eq!(config.remote_prefix("docs"), "docs/");

        config.base_path = "base".to_string();
        assert_eq!(config.remote_key("a/b.txt"), "base/a/b.txt");
        assert_eq!(config.remote_key(""), "base");
        assert_eq!(config.remote_prefix(""), "base/");
        assert_eq!(config.remote_prefix("docs"), "base/docs/");
    }

    #[test]
    fn test_access_config_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();

        // First run writes the file.
        let first = AccessConfig::load_or_init(dir.path()).unwrap();
        assert!(dir.path().join("config.json").exists());

        // Second run reads it back.
        let second = AccessConfig::load_or_init(dir.path()).unwrap();
        assert_eq!(second.version, "1");
        assert_eq!(first.access_key, second.access_key);
    }
}
