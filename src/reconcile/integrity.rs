use super::{build_remote_map, RemoteMap};
use crate::attachments::{AttachmentRepository, LocalFiles};
use crate::error::{ItemProcessingError, SweepError};
use crate::model::{AttachmentFilter, AttachmentRecord, BatchJobState, ItemAction, SweepOptions};
use crate::storage::{KeyMapper, ObjectStorage};
use crate::sweep::{upload_attachment, ItemProcessor};
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Verifies migrated attachments against the bucket.
///
/// The remote map is built on the first batch of a run and reused by every
/// later batch of the same run.
pub struct IntegrityProcessor {
    attachments: Arc<dyn AttachmentRepository>,
    storage: Option<Arc<dyn ObjectStorage>>,
    files: LocalFiles,
    keys: KeyMapper,
    page_size: u32,
    remote: Mutex<Option<(Uuid, Arc<RemoteMap>)>>,
}

impl IntegrityProcessor {
    pub fn new(
        attachments: Arc<dyn AttachmentRepository>,
        storage: Option<Arc<dyn ObjectStorage>>,
        files: LocalFiles,
        keys: KeyMapper,
        page_size: u32,
    ) -> Self {
        Self {
            attachments,
            storage,
            files,
            keys,
            page_size,
            remote: Mutex::new(None),
        }
    }

    fn cached_map(&self, run_id: Option<Uuid>) -> Option<Arc<RemoteMap>> {
        let guard = self.remote.lock().ok()?;
        match guard.as_ref() {
            Some((cached_run, map)) if run_id.map_or(true, |id| id == *cached_run) => {
                Some(Arc::clone(map))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl ItemProcessor for IntegrityProcessor {
    fn filter(&self) -> AttachmentFilter {
        AttachmentFilter::Migrated
    }

    async fn check_ready(&self, _options: &SweepOptions) -> Result<(), SweepError> {
        if self.storage.is_none() {
            return Err(SweepError::PermanentConfiguration(
                "object storage is not configured".into(),
            ));
        }
        Ok(())
    }

    async fn prepare(&self, state: &BatchJobState) -> Result<(), SweepError> {
        if self.cached_map(Some(state.run_id)).is_some() {
            return Ok(());
        }
        let storage = self.storage.as_deref().ok_or_else(|| {
            SweepError::PermanentConfiguration("object storage is not configured".into())
        })?;
        let map = build_remote_map(storage, &self.keys, self.page_size).await?;
        info!(run_id = %state.run_id, originals = map.len(), "remote map built");
        if let Ok(mut guard) = self.remote.lock() {
            *guard = Some((state.run_id, Arc::new(map)));
        }
        Ok(())
    }

    async fn process(
        &self,
        item: &AttachmentRecord,
        options: &SweepOptions,
    ) -> Result<ItemAction, ItemProcessingError> {
        if !item.migrated {
            return Ok(ItemAction::Skipped);
        }
        let map = self
            .cached_map(None)
            .ok_or_else(|| anyhow!("remote map not prepared for this run"))?;

        if let Some((_, remote)) = map.lookup(&self.keys, item) {
            if item.remote_key.as_deref() == Some(remote.key.as_str()) && item.remote_url.is_some() {
                return Ok(ItemAction::Verified);
            }
            let url = self.keys.public_url(&remote.key);
            self.attachments
                .update_remote_location(item.id, &remote.key, &url)
                .await?;
            info!(item_id = item.id, key = %remote.key, "corrected stale remote key");
            return Ok(ItemAction::KeyCorrected);
        }

        if !options.auto_fix {
            debug!(item_id = item.id, "missing on remote; reporting only");
            return Ok(ItemAction::Reported);
        }

        if self.files.exists(&item.relative_path).await {
            let storage = self.storage.as_deref().ok_or_else(|| {
                ItemProcessingError::Storage(crate::storage::StorageError::NotConfigured(
                    "no object storage configured".into(),
                ))
            })?;
            let uploaded = upload_attachment(storage, &self.files, &self.keys, item).await?;
            self.attachments
                .update_remote_location(item.id, &uploaded.key, &uploaded.url)
                .await?;
            info!(item_id = item.id, key = %uploaded.key, "re-uploaded missing object");
            Ok(ItemAction::Reuploaded)
        } else {
            self.attachments.clear_migrated(item.id).await?;
            warn!(
                item_id = item.id,
                path = %item.relative_path,
                "no remote or local copy; cleared migrated flag"
            );
            Ok(ItemAction::MetadataCleared)
        }
    }
}
