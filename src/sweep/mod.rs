//! Resumable batch sweeps over the attachment registry.
//!
//! A sweep is driven by [`BatchJobController`], which owns the persisted
//! [`BatchJobState`] for one [`SweepKind`] and delegates the per-item work to
//! an [`ItemProcessor`]. Migration, optimization and both reconciliation modes
//! share the same controller and differ only in the processor they plug in.
//!
//! [`SweepKind`]: crate::model::SweepKind

use crate::error::{ItemProcessingError, SweepError};
use crate::model::{AttachmentFilter, AttachmentRecord, BatchJobState, ItemAction, SweepOptions};
use async_trait::async_trait;

pub mod controller;
pub mod optimize;
pub mod upload;

pub use controller::{BatchJobController, RetryReport};
pub use optimize::OptimizationProcessor;
pub use upload::{upload_attachment, UploadProcessor};

#[async_trait]
pub trait ItemProcessor: Send + Sync {
    /// Which attachments the sweep enumerates and counts.
    fn filter(&self) -> AttachmentFilter;

    /// Checked once by `start()`; configuration problems surface here instead
    /// of failing every item.
    async fn check_ready(&self, _options: &SweepOptions) -> Result<(), SweepError> {
        Ok(())
    }

    /// Runs before the items of each batch. A failure aborts the batch without
    /// touching the persisted state.
    async fn prepare(&self, _state: &BatchJobState) -> Result<(), SweepError> {
        Ok(())
    }

    async fn process(
        &self,
        item: &AttachmentRecord,
        options: &SweepOptions,
    ) -> Result<ItemAction, ItemProcessingError>;
}
