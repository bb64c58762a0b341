use super::ItemProcessor;
use crate::attachments::{AttachmentRepository, LocalFiles};
use crate::error::{ItemProcessingError, SweepError};
use crate::model::{AttachmentFilter, AttachmentRecord, ItemAction, SweepOptions};
use crate::optimizer::ImageOptimizer;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

const OPTIMIZABLE: &[&str] = &["image/jpeg", "image/png", "image/webp", "image/gif"];

/// Recompresses local originals before they are synced.
pub struct OptimizationProcessor {
    attachments: Arc<dyn AttachmentRepository>,
    optimizer: Option<Arc<dyn ImageOptimizer>>,
    files: LocalFiles,
}

impl OptimizationProcessor {
    pub fn new(
        attachments: Arc<dyn AttachmentRepository>,
        optimizer: Option<Arc<dyn ImageOptimizer>>,
        files: LocalFiles,
    ) -> Self {
        Self {
            attachments,
            optimizer,
            files,
        }
    }
}

fn is_optimizable(item: &AttachmentRecord) -> bool {
    item.mime_type
        .as_deref()
        .map(|mime| OPTIMIZABLE.contains(&mime))
        .unwrap_or(false)
}

#[async_trait]
impl ItemProcessor for OptimizationProcessor {
    fn filter(&self) -> AttachmentFilter {
        AttachmentFilter::PendingOptimization
    }

    async fn check_ready(&self, _options: &SweepOptions) -> Result<(), SweepError> {
        if self.optimizer.is_none() {
            return Err(SweepError::PermanentConfiguration(
                "optimizer.command is not configured".into(),
            ));
        }
        Ok(())
    }

    async fn process(
        &self,
        item: &AttachmentRecord,
        _options: &SweepOptions,
    ) -> Result<ItemAction, ItemProcessingError> {
        let Some(optimizer) = self.optimizer.as_ref() else {
            return Err(ItemProcessingError::Optimizer("no optimizer configured".into()));
        };
        if !is_optimizable(item) {
            // Nothing to do; mark it so later sweeps stop enumerating it.
            self.attachments.mark_optimized(item.id, item.byte_size).await?;
            debug!(item_id = item.id, mime = ?item.mime_type, "not an optimizable image");
            return Ok(ItemAction::Skipped);
        }

        let path = self.files.path_for(&item.relative_path);
        if !self.files.exists(&item.relative_path).await {
            return Err(ItemProcessingError::LocalFileMissing(path));
        }
        let outcome = optimizer
            .optimize(&path)
            .await
            .map_err(|e| ItemProcessingError::Optimizer(format!("{:#}", e)))?;
        self.attachments
            .mark_optimized(item.id, outcome.bytes_after)
            .await?;
        info!(
            item_id = item.id,
            before = outcome.bytes_before,
            after = outcome.bytes_after,
            saved = outcome.saved(),
            "attachment optimized"
        );
        Ok(ItemAction::Optimized)
    }
}
