//! Attachment registry access: the repository seam used by sweeps, its SQLite
//! implementation, and the local uploads directory.
use crate::db::{self, AttachmentCounts, Pool};
use crate::model::{AttachmentFilter, AttachmentRecord, NewAttachment};
use crate::storage::{content_type_for, keys};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info, instrument};

#[async_trait]
pub trait AttachmentRepository: Send + Sync {
    async fn count(&self, filter: AttachmentFilter) -> Result<i64>;

    /// Up to `limit` records with `id > after_id`, ascending by id.
    async fn page(
        &self,
        filter: AttachmentFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<AttachmentRecord>>;

    async fn get(&self, id: i64) -> Result<Option<AttachmentRecord>>;

    async fn mark_migrated(&self, id: i64, remote_key: &str, remote_url: &str) -> Result<()>;

    async fn update_remote_location(&self, id: i64, remote_key: &str, remote_url: &str)
        -> Result<()>;

    async fn clear_migrated(&self, id: i64) -> Result<()>;

    async fn mark_optimized(&self, id: i64, byte_size: i64) -> Result<()>;

    async fn counts(&self) -> Result<AttachmentCounts>;
}

#[derive(Debug, Clone)]
pub struct SqliteAttachments {
    pool: Pool,
}

impl SqliteAttachments {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AttachmentRepository for SqliteAttachments {
    async fn count(&self, filter: AttachmentFilter) -> Result<i64> {
        db::count_attachments(&self.pool, filter).await
    }

    async fn page(
        &self,
        filter: AttachmentFilter,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<AttachmentRecord>> {
        db::page_attachments(&self.pool, filter, after_id, limit).await
    }

    async fn get(&self, id: i64) -> Result<Option<AttachmentRecord>> {
        db::fetch_attachment(&self.pool, id).await
    }

    async fn mark_migrated(&self, id: i64, remote_key: &str, remote_url: &str) -> Result<()> {
        db::mark_migrated(&self.pool, id, remote_key, remote_url).await
    }

    async fn update_remote_location(
        &self,
        id: i64,
        remote_key: &str,
        remote_url: &str,
    ) -> Result<()> {
        db::update_remote_location(&self.pool, id, remote_key, remote_url).await
    }

    async fn clear_migrated(&self, id: i64) -> Result<()> {
        db::clear_migrated(&self.pool, id).await
    }

    async fn mark_optimized(&self, id: i64, byte_size: i64) -> Result<()> {
        db::mark_optimized(&self.pool, id, byte_size).await
    }

    async fn counts(&self) -> Result<AttachmentCounts> {
        db::attachment_counts(&self.pool).await
    }
}

/// The local uploads directory that attachment paths are relative to.
#[derive(Debug, Clone)]
pub struct LocalFiles {
    root: PathBuf,
}

impl LocalFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, relative_path: &str) -> PathBuf {
        self.root.join(relative_path.trim_start_matches('/'))
    }

    pub async fn exists(&self, relative_path: &str) -> bool {
        fs::try_exists(self.path_for(relative_path))
            .await
            .unwrap_or(false)
    }

    /// Delete a local file. Returns `false` when it was already gone.
    pub async fn remove(&self, relative_path: &str) -> std::io::Result<bool> {
        match fs::remove_file(self.path_for(relative_path)).await {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterReport {
    pub registered: usize,
    pub variants: usize,
    /// Thumbnails whose original is not present locally.
    pub orphan_thumbnails: usize,
}

/// Register every original under the uploads directory and attach its
/// thumbnail siblings as variants. Already-registered paths keep their id.
#[instrument(skip_all)]
pub async fn register_local_files(pool: &Pool, files: &LocalFiles) -> Result<RegisterReport> {
    let mut originals: BTreeMap<String, i64> = BTreeMap::new();
    let mut thumbnails: Vec<String> = Vec::new();

    let mut pending = vec![files.root().to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to read {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            let path = entry.path();
            if file_type.is_dir() {
                pending.push(path);
                continue;
            }
            if !file_type.is_file() {
                continue;
            }
            let Some(rel) = relative_to(files.root(), &path) else {
                continue;
            };
            if keys::is_thumbnail(&rel) {
                thumbnails.push(rel);
            } else {
                let size = entry.metadata().await?.len() as i64;
                originals.insert(rel, size);
            }
        }
    }

    let mut variants: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut report = RegisterReport::default();
    for thumb in thumbnails {
        match keys::original_for_thumbnail(&thumb) {
            Some(original) if originals.contains_key(&original) => {
                variants.entry(original).or_default().push(thumb);
            }
            _ => {
                debug!(path = %thumb, "thumbnail without local original");
                report.orphan_thumbnails += 1;
            }
        }
    }

    for (rel, size) in &originals {
        let mut own_variants = variants.remove(rel).unwrap_or_default();
        own_variants.sort();
        let existing = db::find_attachment_id_by_path(pool, rel).await?;
        let id = db::insert_attachment(
            pool,
            &NewAttachment {
                relative_path: rel.clone(),
                byte_size: *size,
                mime_type: Some(content_type_for(Path::new(rel)).to_string()),
                variants: own_variants.clone(),
            },
        )
        .await?;
        if existing.is_some() {
            db::set_attachment_variants(pool, id, &own_variants).await?;
        } else {
            report.registered += 1;
        }
        report.variants += own_variants.len();
    }

    info!(
        registered = report.registered,
        variants = report.variants,
        orphan_thumbnails = report.orphan_thumbnails,
        "registered local files"
    );
    Ok(report)
}

fn relative_to(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}
