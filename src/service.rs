//! Request surface over the four sweep controllers.
use crate::attachments::{AttachmentRepository, LocalFiles, SqliteAttachments};
use crate::config::Config;
use crate::db::Pool;
use crate::error::SweepError;
use crate::model::{
    BatchJobState, BatchResult, ItemError, ItemReport, SweepKind, SweepOptions, SweepStatus,
};
use crate::optimizer::ImageOptimizer;
use crate::reconcile::{CloudReconciliationEngine, IntegrityProcessor, ReconciliationStats};
use crate::storage::{KeyMapper, ObjectStorage};
use crate::sweep::{BatchJobController, ItemProcessor, OptimizationProcessor, UploadProcessor};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateView {
    pub status: SweepStatus,
    /// Absent while idle.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<i64>,
    pub processed: i64,
    pub total: i64,
    pub failed: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,
}

impl From<&BatchJobState> for StateView {
    fn from(state: &BatchJobState) -> Self {
        let idle = state.status == SweepStatus::Idle;
        Self {
            status: state.status,
            cursor: (!idle).then_some(state.cursor),
            processed: state.processed,
            total: state.total,
            failed: state.failed,
            run_id: (!idle).then_some(state.run_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepResponse {
    pub success: bool,
    pub kind: SweepKind,
    pub state: StateView,
    pub batch_processed: u32,
    pub batch_failed: u32,
    pub batch_errors: Vec<ItemError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub batch_actions: Vec<ItemReport>,
    pub complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<ReconciliationStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SweepResponse {
    pub fn from_state(state: &BatchJobState) -> Self {
        Self {
            success: true,
            kind: state.kind,
            state: StateView::from(state),
            batch_processed: 0,
            batch_failed: 0,
            batch_errors: Vec::new(),
            batch_actions: Vec::new(),
            complete: state.status == SweepStatus::Completed,
            stats: None,
            error: None,
        }
    }

    pub fn from_batch(result: BatchResult) -> Self {
        Self {
            success: true,
            kind: result.state.kind,
            state: StateView::from(&result.state),
            batch_processed: result.batch_processed,
            batch_failed: result.batch_failed,
            batch_errors: result.batch_errors,
            batch_actions: result.batch_actions,
            complete: result.complete,
            stats: None,
            error: None,
        }
    }

    /// Error envelope for callers that serialize failures instead of
    /// propagating them.
    pub fn failure(kind: SweepKind, err: &SweepError) -> Self {
        let mut response = Self::from_state(&BatchJobState::idle(kind, SweepOptions::new(kind, 1)));
        response.success = false;
        response.error = Some(err.to_string());
        response
    }
}

/// The per-kind operations a client drives.
#[async_trait]
pub trait SweepApi: Send + Sync {
    /// `options: None` starts with the configured defaults.
    async fn start(
        &self,
        kind: SweepKind,
        options: Option<SweepOptions>,
    ) -> Result<SweepResponse, SweepError>;
    async fn process_batch(&self, kind: SweepKind) -> Result<SweepResponse, SweepError>;
    async fn pause(&self, kind: SweepKind) -> Result<SweepResponse, SweepError>;
    async fn resume(&self, kind: SweepKind) -> Result<SweepResponse, SweepError>;
    async fn stop(&self, kind: SweepKind) -> Result<SweepResponse, SweepError>;
    async fn status(&self, kind: SweepKind) -> Result<SweepResponse, SweepError>;
    async fn retry_failed(&self, kind: SweepKind) -> Result<SweepResponse, SweepError>;
}

/// Collaborators shared by every controller.
pub struct ServiceDeps {
    pub pool: Pool,
    pub attachments: Arc<dyn AttachmentRepository>,
    pub storage: Option<Arc<dyn ObjectStorage>>,
    pub optimizer: Option<Arc<dyn ImageOptimizer>>,
    pub files: LocalFiles,
}

impl ServiceDeps {
    pub fn sqlite(
        pool: Pool,
        files: LocalFiles,
        storage: Option<Arc<dyn ObjectStorage>>,
        optimizer: Option<Arc<dyn ImageOptimizer>>,
    ) -> Self {
        Self {
            attachments: Arc::new(SqliteAttachments::new(pool.clone())),
            pool,
            storage,
            optimizer,
            files,
        }
    }
}

pub struct SweepService {
    migration: BatchJobController,
    optimization: BatchJobController,
    reconciliation: BatchJobController,
    cloudsync: BatchJobController,
    engine: Arc<CloudReconciliationEngine>,
}

impl SweepService {
    pub fn new(cfg: &Config, deps: ServiceDeps) -> Self {
        let keys = KeyMapper::new(&cfg.storage.base_prefix, &cfg.storage.public_url);
        let page_size = cfg.storage.list_page_size;

        let upload: Arc<dyn ItemProcessor> = Arc::new(UploadProcessor::new(
            deps.attachments.clone(),
            deps.storage.clone(),
            deps.files.clone(),
            keys.clone(),
        ));
        let optimize: Arc<dyn ItemProcessor> = Arc::new(OptimizationProcessor::new(
            deps.attachments.clone(),
            deps.optimizer.clone(),
            deps.files.clone(),
        ));
        let integrity: Arc<dyn ItemProcessor> = Arc::new(IntegrityProcessor::new(
            deps.attachments.clone(),
            deps.storage.clone(),
            deps.files.clone(),
            keys.clone(),
            page_size,
        ));

        let controller = |kind: SweepKind, processor: Arc<dyn ItemProcessor>| {
            let mut options = SweepOptions::new(kind, cfg.sweeps.batch_size);
            options.remove_local = cfg.sweeps.remove_local;
            options.auto_fix = cfg.sweeps.auto_fix;
            BatchJobController::new(kind, deps.pool.clone(), deps.attachments.clone(), processor)
                .with_defaults(options, cfg.sweeps.error_log_limit)
        };

        Self {
            migration: controller(SweepKind::Migration, upload.clone()),
            optimization: controller(SweepKind::Optimization, optimize),
            reconciliation: controller(SweepKind::Reconciliation, integrity),
            cloudsync: controller(SweepKind::CloudSync, upload),
            engine: Arc::new(CloudReconciliationEngine::new(
                deps.pool.clone(),
                deps.attachments.clone(),
                deps.storage.clone(),
                deps.files.clone(),
                keys,
                page_size,
            )),
        }
    }

    pub fn controller(&self, kind: SweepKind) -> &BatchJobController {
        match kind {
            SweepKind::Migration => &self.migration,
            SweepKind::Optimization => &self.optimization,
            SweepKind::Reconciliation => &self.reconciliation,
            SweepKind::CloudSync => &self.cloudsync,
        }
    }

    pub fn engine(&self) -> &CloudReconciliationEngine {
        &self.engine
    }

    /// Reconciliation sweeps carry the cheap summary in their responses.
    async fn with_stats(&self, mut response: SweepResponse) -> SweepResponse {
        if matches!(response.kind, SweepKind::CloudSync | SweepKind::Reconciliation) {
            match self.engine.analyze().await {
                Ok(report) => response.stats = Some(report.stats),
                Err(err) => warn!(%err, "failed to attach reconciliation stats"),
            }
        }
        response
    }
}

#[async_trait]
impl SweepApi for SweepService {
    async fn start(
        &self,
        kind: SweepKind,
        options: Option<SweepOptions>,
    ) -> Result<SweepResponse, SweepError> {
        let controller = self.controller(kind);
        let options = options.unwrap_or_else(|| controller.default_options().clone());
        let state = controller.start(options).await?;
        Ok(self.with_stats(SweepResponse::from_state(&state)).await)
    }

    async fn process_batch(&self, kind: SweepKind) -> Result<SweepResponse, SweepError> {
        let result = self.controller(kind).process_batch().await?;
        let complete = result.complete;
        let response = SweepResponse::from_batch(result);
        if complete {
            Ok(self.with_stats(response).await)
        } else {
            Ok(response)
        }
    }

    async fn pause(&self, kind: SweepKind) -> Result<SweepResponse, SweepError> {
        let state = self.controller(kind).pause().await?;
        Ok(SweepResponse::from_state(&state))
    }

    async fn resume(&self, kind: SweepKind) -> Result<SweepResponse, SweepError> {
        let state = self.controller(kind).resume().await?;
        Ok(SweepResponse::from_state(&state))
    }

    async fn stop(&self, kind: SweepKind) -> Result<SweepResponse, SweepError> {
        let controller = self.controller(kind);
        controller.stop().await?;
        let state = controller.get_status().await?;
        Ok(SweepResponse::from_state(&state))
    }

    async fn status(&self, kind: SweepKind) -> Result<SweepResponse, SweepError> {
        let state = self.controller(kind).get_status().await?;
        Ok(self.with_stats(SweepResponse::from_state(&state)).await)
    }

    async fn retry_failed(&self, kind: SweepKind) -> Result<SweepResponse, SweepError> {
        let controller = self.controller(kind);
        let report = controller.retry_failed().await?;
        let state = controller.get_status().await?;
        let mut response = SweepResponse::from_state(&state);
        response.batch_processed = report.succeeded;
        response.batch_failed = report.still_failing;
        response.batch_errors = state.errors.clone();
        response.batch_actions = report.actions;
        Ok(response)
    }
}
