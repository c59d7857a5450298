//! Shared test infrastructure: an in-memory object store and a mounted
//! filesystem fixture.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use minfs_meta::MetaDb;
use minfs_storage::{ObjectInfo, ObjectStat, ObjectStore, StorageError};
use minfs_vfs::{spawn_sync_worker, MinFs, MountConfig};
use tempfile::TempDir;

/// One stored object in the mock remote.
#[derive(Debug, Clone)]
pub struct MockObject {
    pub data: Vec<u8>,
    pub etag: String,
    pub last_modified: i64,
    pub content_type: String,
}

/// In-memory object store standing in for the remote bucket.
///
/// Tracks download calls so tests can verify cache behavior.
#[derive(Debug, Default)]
pub struct MockStore {
    objects: RwLock<BTreeMap<String, MockObject>>,
    etag_seq: AtomicU64,
    get_calls: AtomicU64,
}

impl MockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_etag(&self) -> String {
        format!("etag-{}", self.etag_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Seed an object, as another client's upload would.
    pub fn insert(&self, key: &str, data: &[u8], last_modified: i64) -> String {
        let etag: String = self.next_etag();
        self.objects.write().unwrap().insert(
            key.to_string(),
            MockObject {
                data: data.to_vec(),
                etag: etag.clone(),
                last_modified,
                content_type: "application/octet-stream".to_string(),
            },
        );
        etag
    }

    /// Drop an object, as another client's delete would.
    pub fn delete(&self, key: &str) {
        self.objects.write().unwrap().remove(key);
    }

    pub fn object(&self, key: &str) -> Option<MockObject> {
        self.objects.read().unwrap().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.read().unwrap().keys().cloned().collect()
    }

    pub fn get_calls(&self) -> u64 {
        self.get_calls.load(Ordering::SeqCst)
    }
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[async_trait]
impl ObjectStore for MockStore {
    async fn bucket_exists(&self) -> Result<bool, StorageError> {
        Ok(true)
    }

    async fn list_objects(
        &self,
        prefix: &str,
        recursive: bool,
    ) -> Result<Vec<ObjectInfo>, StorageError> {
        let objects = self.objects.read().unwrap();
        let mut out: Vec<ObjectInfo> = Vec::new();
        let mut seen_prefixes: BTreeSet<String> = BTreeSet::new();

        for (key, object) in objects.range(prefix.to_string()..) {
            if !key.starts_with(prefix) {
                break;
            }
            let rest: &str = &key[prefix.len()..];
            if rest.is_empty() {
                continue;
            }

            if !recursive {
                if let Some(pos) = rest.find('/') {
                    let dir_key: String = format!("{}{}/", prefix, &rest[..pos]);
                    if seen_prefixes.insert(dir_key.clone()) {
                        out.push(ObjectInfo {
                            key: dir_key,
                            size: 0,
                            last_modified: 0,
                            etag: String::new(),
                        });
                    }
                    continue;
                }
            }

            out.push(ObjectInfo {
                key: key.clone(),
                size: object.data.len() as u64,
                last_modified: object.last_modified,
                etag: object.etag.clone(),
            });
        }
        Ok(out)
    }

    async fn stat_object(&self, key: &str) -> Result<ObjectStat, StorageError> {
        let objects = self.objects.read().unwrap();
        let object: &MockObject = objects
            .get(key)
            .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectStat {
            size: object.data.len() as u64,
            last_modified: object.last_modified,
            etag: object.etag.clone(),
            content_type: Some(object.content_type.clone()),
        })
    }

    async fn get_object(&self, key: &str, dest: &Path) -> Result<u64, StorageError> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let data: Vec<u8> = {
            let objects = self.objects.read().unwrap();
            objects
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?
                .data
                .clone()
        };
        std::fs::write(dest, &data)?;
        Ok(data.len() as u64)
    }

    async fn put_object(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
    ) -> Result<(), StorageError> {
        let etag: String = self.next_etag();
        self.objects.write().unwrap().insert(
            key.to_string(),
            MockObject {
                data: body,
                etag,
                last_modified: now_epoch(),
                content_type: content_type.to_string(),
            },
        );
        Ok(())
    }

    async fn copy_object(&self, src: &str, dst: &str) -> Result<(), StorageError> {
        let mut objects = self.objects.write().unwrap();
        let object: MockObject = objects
            .get(src)
            .ok_or_else(|| StorageError::NotFound(src.to_string()))?
            .clone();
        objects.insert(dst.to_string(), object);
        Ok(())
    }

    async fn remove_object(&self, key: &str) -> Result<(), StorageError> {
        // Removing a missing key succeeds, matching S3.
        self.objects.write().unwrap().remove(key);
        Ok(())
    }
}

/// A filesystem wired to a mock remote and scratch directories.
pub struct TestFs {
    pub fs: Arc<MinFs>,
    pub store: Arc<MockStore>,
    pub runtime: tokio::runtime::Runtime,
    _dir: TempDir,
}

/// Build a fresh filesystem fixture.
pub fn test_fs() -> TestFs {
    let dir: TempDir = TempDir::new().unwrap();
    let runtime: tokio::runtime::Runtime = tokio::runtime::Runtime::new().unwrap();

    let mut config: MountConfig =
        MountConfig::new("http://localhost:9000/testbucket", Path::new("/mnt/test")).unwrap();
    config.cache_dir = dir.path().join("cache");
    config.uid = 1000;
    config.gid = 1000;

    let db: MetaDb = MetaDb::open(&config.db_path()).unwrap();
    let store: Arc<MockStore> = Arc::new(MockStore::new());
    let sync_tx = spawn_sync_worker(runtime.handle(), store.clone());

    let fs: Arc<MinFs> = Arc::new(
        MinFs::new(
            config,
            db,
            store.clone(),
            runtime.handle().clone(),
            sync_tx,
        )
        .unwrap(),
    );

    TestFs {
        fs,
        store,
        runtime,
        _dir: dir,
    }
}
