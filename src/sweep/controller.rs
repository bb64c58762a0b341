use super::ItemProcessor;
use crate::attachments::AttachmentRepository;
use crate::db::{self, Pool};
use crate::error::SweepError;
use crate::model::{
    BatchJobState, BatchResult, ItemError, ItemReport, SweepKind, SweepOptions, SweepStatus,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Attempts `stop()` makes before giving up on a contended state row.
const STOP_ATTEMPTS: usize = 5;

/// Outcome of re-running the processor over the error log.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryReport {
    pub retried: u32,
    pub succeeded: u32,
    pub still_failing: u32,
    pub actions: Vec<ItemReport>,
}

/// Drives one sweep kind through start -> batch -> {pause|stop|complete}.
///
/// The controller keeps no state of its own between calls: every operation
/// loads the persisted row, applies one transition and writes it back with a
/// compare-and-swap on `version`, so any process can serve any call.
#[derive(Clone)]
pub struct BatchJobController {
    kind: SweepKind,
    pool: Pool,
    attachments: Arc<dyn AttachmentRepository>,
    processor: Arc<dyn ItemProcessor>,
    default_options: SweepOptions,
    error_log_limit: usize,
}

impl BatchJobController {
    pub fn new(
        kind: SweepKind,
        pool: Pool,
        attachments: Arc<dyn AttachmentRepository>,
        processor: Arc<dyn ItemProcessor>,
    ) -> Self {
        Self {
            kind,
            pool,
            attachments,
            processor,
            default_options: SweepOptions::new(kind, 50),
            error_log_limit: 50,
        }
    }

    pub fn with_defaults(mut self, options: SweepOptions, error_log_limit: usize) -> Self {
        self.default_options = options.normalized(self.kind);
        self.error_log_limit = error_log_limit.max(1);
        self
    }

    pub fn kind(&self) -> SweepKind {
        self.kind
    }

    pub fn default_options(&self) -> &SweepOptions {
        &self.default_options
    }

    /// Start a fresh sweep. Rejects with `AlreadyRunning` while one is running
    /// or paused.
    pub async fn start(&self, options: SweepOptions) -> Result<BatchJobState, SweepError> {
        self.start_inner(options, false).await
    }

    /// Like `start`, but an active sweep is resumed (paused) or returned as is
    /// (running) instead of rejected. The stored options win over `options`.
    pub async fn start_or_resume(&self, options: SweepOptions) -> Result<BatchJobState, SweepError> {
        self.start_inner(options, true).await
    }

    #[instrument(skip_all, fields(kind = %self.kind))]
    async fn start_inner(
        &self,
        options: SweepOptions,
        resume: bool,
    ) -> Result<BatchJobState, SweepError> {
        let existing = db::load_sweep_state(&self.pool, self.kind).await?;
        if let Some(current) = &existing {
            if current.status.is_active() {
                if !resume {
                    debug!(status = current.status.as_str(), "start rejected");
                    return Err(SweepError::AlreadyRunning(self.kind));
                }
                if current.status == SweepStatus::Paused {
                    return self.resume().await;
                }
                return Ok(current.clone());
            }
        }

        let options = options.normalized(self.kind);
        self.processor.check_ready(&options).await?;
        let total = self.attachments.count(self.processor.filter()).await?;
        let mut state = BatchJobState::fresh(self.kind, options, total);

        match existing {
            None => {
                if !db::insert_sweep_state(&self.pool, &state).await? {
                    return Err(SweepError::AlreadyRunning(self.kind));
                }
            }
            Some(previous) => self.write(&mut state, previous.version).await?,
        }
        info!(
            run_id = %state.run_id,
            total,
            batch_size = state.options.batch_size,
            "sweep started"
        );
        Ok(state)
    }

    /// Process the next batch. A no-op unless the sweep is running.
    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn process_batch(&self) -> Result<BatchResult, SweepError> {
        let mut state = self.load().await?;
        if state.status != SweepStatus::Running {
            debug!(status = state.status.as_str(), "batch skipped");
            return Ok(BatchResult::noop(state));
        }
        let expected = state.version;
        let base = state.clone();

        let mut result = BatchResult::noop(state.clone());
        if state.remaining() > 0 {
            self.processor.prepare(&state).await?;

            let limit = i64::from(state.options.batch_size).min(state.remaining());
            let items = self
                .attachments
                .page(self.processor.filter(), state.cursor, limit)
                .await?;
            if items.is_empty() {
                debug!(cursor = state.cursor, "item source exhausted");
                state.complete();
            }

            for item in items {
                match self.processor.process(&item, &state.options).await {
                    Ok(action) => {
                        state.processed += 1;
                        result.batch_processed += 1;
                        result.batch_actions.push(ItemReport {
                            item_id: item.id,
                            action,
                        });
                    }
                    Err(err) => {
                        warn!(item_id = item.id, %err, "item failed");
                        let error = ItemError {
                            item_id: item.id,
                            error: err.to_string(),
                        };
                        state.failed += 1;
                        state.push_error(error.clone(), self.error_log_limit);
                        result.batch_failed += 1;
                        result.batch_errors.push(error);
                    }
                }
                // Failed items advance the cursor too; they are retried explicitly.
                state.cursor = item.id;
            }
        }
        if state.remaining() == 0 && state.status == SweepStatus::Running {
            state.complete();
        }

        match self.write(&mut state, expected).await {
            Ok(()) => {}
            // A pause that landed mid-batch keeps the work already done.
            Err(SweepError::StateConflict { .. }) => {
                state = self
                    .merge_into_paused(&base, &state, &result.batch_errors)
                    .await?;
            }
            Err(err) => return Err(err),
        }
        info!(
            cursor = state.cursor,
            processed = state.processed,
            failed = state.failed,
            total = state.total,
            batch_processed = result.batch_processed,
            batch_failed = result.batch_failed,
            "batch processed"
        );
        result.complete = state.status == SweepStatus::Completed;
        result.state = state;
        Ok(result)
    }

    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn pause(&self) -> Result<BatchJobState, SweepError> {
        let mut state = self.load().await?;
        if state.status != SweepStatus::Running {
            return Err(SweepError::NotRunning(self.kind));
        }
        let expected = state.version;
        state.status = SweepStatus::Paused;
        self.write(&mut state, expected).await?;
        info!(cursor = state.cursor, "sweep paused");
        Ok(state)
    }

    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn resume(&self) -> Result<BatchJobState, SweepError> {
        let mut state = self.load().await?;
        if state.status != SweepStatus::Paused {
            return Err(SweepError::NotPaused(self.kind));
        }
        let expected = state.version;
        state.status = SweepStatus::Running;
        self.write(&mut state, expected).await?;
        info!(cursor = state.cursor, "sweep resumed");
        Ok(state)
    }

    /// Abandon the sweep: status idle, cursor and counters cleared. Retries
    /// through concurrent batch writes so that stop always wins.
    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn stop(&self) -> Result<(), SweepError> {
        for _ in 0..STOP_ATTEMPTS {
            let Some(mut state) = db::load_sweep_state(&self.pool, self.kind).await? else {
                return Ok(());
            };
            if state.status == SweepStatus::Idle {
                return Ok(());
            }
            let expected = state.version;
            state.status = SweepStatus::Idle;
            state.cursor = 0;
            state.total = 0;
            state.processed = 0;
            state.failed = 0;
            state.errors.clear();
            state.completed_at = None;
            match self.write(&mut state, expected).await {
                Ok(()) => {
                    info!("sweep stopped");
                    return Ok(());
                }
                Err(SweepError::StateConflict { .. }) => continue,
                Err(err) => return Err(err),
            }
        }
        Err(SweepError::StateConflict {
            kind: self.kind,
            expected: -1,
        })
    }

    /// Read-only snapshot; an idle placeholder when nothing was ever started.
    pub async fn get_status(&self) -> Result<BatchJobState, SweepError> {
        self.load().await
    }

    /// Re-run the processor for the items in the error log. Allowed while the
    /// sweep is paused or completed.
    #[instrument(skip_all, fields(kind = %self.kind))]
    pub async fn retry_failed(&self) -> Result<RetryReport, SweepError> {
        let mut state = self.load().await?;
        match state.status {
            SweepStatus::Running => return Err(SweepError::AlreadyRunning(self.kind)),
            SweepStatus::Idle => return Ok(RetryReport::default()),
            SweepStatus::Paused | SweepStatus::Completed => {}
        }
        if state.errors.is_empty() {
            return Ok(RetryReport::default());
        }
        let expected = state.version;
        self.processor.prepare(&state).await?;

        let mut report = RetryReport::default();
        let mut remaining_errors = Vec::new();
        for entry in std::mem::take(&mut state.errors) {
            let Some(item) = self.attachments.get(entry.item_id).await? else {
                debug!(item_id = entry.item_id, "failed item no longer exists");
                remaining_errors.push(ItemError {
                    item_id: entry.item_id,
                    error: format!("attachment {} no longer exists", entry.item_id),
                });
                continue;
            };
            report.retried += 1;
            match self.processor.process(&item, &state.options).await {
                Ok(action) => {
                    report.succeeded += 1;
                    report.actions.push(ItemReport {
                        item_id: item.id,
                        action,
                    });
                    state.failed = (state.failed - 1).max(0);
                    state.processed += 1;
                }
                Err(err) => {
                    warn!(item_id = item.id, %err, "retry failed");
                    report.still_failing += 1;
                    remaining_errors.push(ItemError {
                        item_id: item.id,
                        error: err.to_string(),
                    });
                }
            }
        }
        state.errors = remaining_errors;
        self.write(&mut state, expected).await?;
        info!(
            retried = report.retried,
            succeeded = report.succeeded,
            still_failing = report.still_failing,
            "retried failed items"
        );
        Ok(report)
    }

    /// Fold a batch computed from `base` into a row paused since. Anything
    /// else (stopped, restarted, advanced by another batch) discards it.
    async fn merge_into_paused(
        &self,
        base: &BatchJobState,
        batch: &BatchJobState,
        batch_errors: &[ItemError],
    ) -> Result<BatchJobState, SweepError> {
        let conflict = SweepError::StateConflict {
            kind: self.kind,
            expected: base.version,
        };
        let Some(mut current) = db::load_sweep_state(&self.pool, self.kind).await? else {
            return Err(conflict);
        };
        if current.status != SweepStatus::Paused
            || current.run_id != base.run_id
            || current.cursor != base.cursor
        {
            return Err(conflict);
        }
        let expected = current.version;
        current.cursor = batch.cursor;
        current.processed += batch.processed - base.processed;
        current.failed += batch.failed - base.failed;
        for error in batch_errors {
            current.push_error(error.clone(), self.error_log_limit);
        }
        self.write(&mut current, expected).await?;
        info!(cursor = current.cursor, "batch merged into paused sweep");
        Ok(current)
    }

    async fn load(&self) -> Result<BatchJobState, SweepError> {
        Ok(db::load_sweep_state(&self.pool, self.kind)
            .await?
            .unwrap_or_else(|| BatchJobState::idle(self.kind, self.default_options.clone())))
    }

    async fn write(&self, state: &mut BatchJobState, expected: i64) -> Result<(), SweepError> {
        state.updated_at = Utc::now();
        if !db::update_sweep_state(&self.pool, state, expected).await? {
            warn!(expected, "sweep state changed underneath this call");
            return Err(SweepError::StateConflict {
                kind: self.kind,
                expected,
            });
        }
        state.version = expected + 1;
        Ok(())
    }
}
