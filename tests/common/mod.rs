#![allow(dead_code)]

use async_trait::async_trait;
use cloud_offload::config::{App, Config, Optimizer, Storage, Sweeps};
use cloud_offload::db::{self, Pool};
use cloud_offload::model::NewAttachment;
use cloud_offload::storage::{ListPage, ObjectEntry, ObjectStorage, StorageError, UploadedObject};
use sqlx::sqlite::SqlitePoolOptions;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// In-memory database shared by every query of a test. A single connection,
/// since each `sqlite::memory:` connection is its own database.
pub async fn setup_pool() -> Pool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn test_config(uploads: &Path) -> Config {
    Config {
        app: App {
            data_dir: uploads.display().to_string(),
            uploads_dir: uploads.display().to_string(),
            poll_interval_ms: 10,
            max_retries: 2,
            retry_base_delay_ms: 10,
        },
        storage: Storage {
            endpoint: String::new(),
            token: String::new(),
            bucket: "media".into(),
            base_prefix: String::new(),
            public_url: "https://cdn.test".into(),
            request_timeout_secs: 5,
            list_page_size: 2,
        },
        sweeps: Sweeps {
            batch_size: 10,
            error_log_limit: 5,
            remove_local: false,
            auto_fix: false,
        },
        optimizer: Optimizer::default(),
    }
}

/// Register `u/1.jpg ..= u/{n}.jpg`; ids follow insertion order from 1.
pub async fn seed_attachments(pool: &Pool, n: i64) -> Vec<i64> {
    let mut ids = Vec::new();
    for i in 1..=n {
        let id = db::insert_attachment(
            pool,
            &NewAttachment {
                relative_path: format!("u/{}.jpg", i),
                byte_size: 100,
                mime_type: Some("image/jpeg".into()),
                variants: Vec::new(),
            },
        )
        .await
        .unwrap();
        ids.push(id);
    }
    ids
}

pub async fn write_file(root: &Path, rel: &str, len: usize) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.unwrap();
    }
    tokio::fs::write(&path, vec![7u8; len]).await.unwrap();
}

/// Bucket fake: sorted keys, numeric continuation tokens.
#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<BTreeMap<String, i64>>,
    list_calls: AtomicUsize,
    uploads: Mutex<Vec<String>>,
    fail_listing: AtomicBool,
}

impl MemoryStorage {
    pub fn with_objects(objects: &[(&str, i64)]) -> Self {
        let storage = Self::default();
        {
            let mut map = storage.objects.lock().unwrap();
            for (key, size) in objects {
                map.insert(key.to_string(), *size);
            }
        }
        storage
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }

    pub fn uploads(&self) -> Vec<String> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn list_page(
        &self,
        prefix: &str,
        limit: u32,
        continuation_token: Option<&str>,
    ) -> Result<ListPage, StorageError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(StorageError::Transient("listing unavailable".into()));
        }
        let start: usize = continuation_token
            .map(|t| t.parse().unwrap())
            .unwrap_or(0);
        let matching: Vec<ObjectEntry> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, size)| ObjectEntry {
                key: k.clone(),
                size: *size,
            })
            .collect();
        let end = (start + limit as usize).min(matching.len());
        let is_truncated = end < matching.len();
        Ok(ListPage {
            entries: matching[start..end].to_vec(),
            next_token: is_truncated.then(|| end.to_string()),
            is_truncated,
        })
    }

    async fn upload(&self, local_path: &Path, key: &str) -> Result<UploadedObject, StorageError> {
        let size = tokio::fs::metadata(local_path).await?.len() as i64;
        self.objects.lock().unwrap().insert(key.to_string(), size);
        self.uploads.lock().unwrap().push(key.to_string());
        Ok(UploadedObject {
            key: key.to_string(),
            url: format!("https://cdn.test/{}", key),
        })
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.lock().unwrap().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.contains(key))
    }
}
