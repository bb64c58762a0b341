use super::ItemProcessor;
use crate::attachments::{AttachmentRepository, LocalFiles};
use crate::error::{ItemProcessingError, SweepError};
use crate::model::{AttachmentFilter, AttachmentRecord, ItemAction, SweepOptions};
use crate::storage::{KeyMapper, ObjectStorage, UploadedObject};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Upload an attachment's original and every variant present locally.
/// Returns the location of the original.
pub async fn upload_attachment(
    storage: &dyn ObjectStorage,
    files: &LocalFiles,
    keys: &KeyMapper,
    item: &AttachmentRecord,
) -> Result<UploadedObject, ItemProcessingError> {
    let local = files.path_for(&item.relative_path);
    if !files.exists(&item.relative_path).await {
        return Err(ItemProcessingError::LocalFileMissing(local));
    }
    let uploaded = storage
        .upload(&local, &keys.object_key(&item.relative_path))
        .await?;

    for variant in &item.variants {
        if !files.exists(variant).await {
            debug!(item_id = item.id, variant = %variant, "variant missing locally; skipped");
            continue;
        }
        storage
            .upload(&files.path_for(variant), &keys.object_key(variant))
            .await?;
    }
    Ok(uploaded)
}

/// Moves not-yet-migrated attachments to object storage. Used by both the
/// migration and cloud-sync sweeps.
pub struct UploadProcessor {
    attachments: Arc<dyn AttachmentRepository>,
    storage: Option<Arc<dyn ObjectStorage>>,
    files: LocalFiles,
    keys: KeyMapper,
}

impl UploadProcessor {
    pub fn new(
        attachments: Arc<dyn AttachmentRepository>,
        storage: Option<Arc<dyn ObjectStorage>>,
        files: LocalFiles,
        keys: KeyMapper,
    ) -> Self {
        Self {
            attachments,
            storage,
            files,
            keys,
        }
    }

    fn storage(&self) -> Result<&dyn ObjectStorage, ItemProcessingError> {
        self.storage.as_deref().ok_or_else(|| {
            ItemProcessingError::Storage(crate::storage::StorageError::NotConfigured(
                "no object storage configured".into(),
            ))
        })
    }

    async fn remove_local_copies(&self, item: &AttachmentRecord) {
        for path in std::iter::once(&item.relative_path).chain(item.variants.iter()) {
            match self.files.remove(path).await {
                Ok(true) => debug!(item_id = item.id, path = %path, "removed local copy"),
                Ok(false) => {}
                Err(err) => warn!(item_id = item.id, path = %path, %err, "failed to remove local copy"),
            }
        }
    }
}

#[async_trait]
impl ItemProcessor for UploadProcessor {
    fn filter(&self) -> AttachmentFilter {
        AttachmentFilter::NotMigrated
    }

    async fn check_ready(&self, _options: &SweepOptions) -> Result<(), SweepError> {
        if self.storage.is_none() {
            return Err(SweepError::PermanentConfiguration(
                "object storage is not configured".into(),
            ));
        }
        Ok(())
    }

    async fn process(
        &self,
        item: &AttachmentRecord,
        options: &SweepOptions,
    ) -> Result<ItemAction, ItemProcessingError> {
        if item.migrated {
            return Ok(ItemAction::Skipped);
        }
        let uploaded = upload_attachment(self.storage()?, &self.files, &self.keys, item).await?;
        self.attachments
            .mark_migrated(item.id, &uploaded.key, &uploaded.url)
            .await?;
        info!(item_id = item.id, key = %uploaded.key, "attachment migrated");

        // Only after the record points at the remote copy.
        if options.remove_local {
            self.remove_local_copies(item).await;
        }
        Ok(ItemAction::Uploaded)
    }
}
