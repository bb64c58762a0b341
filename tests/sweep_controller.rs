mod common;

use anyhow::anyhow;
use async_trait::async_trait;
use cloud_offload::attachments::SqliteAttachments;
use cloud_offload::db::{self, Pool};
use cloud_offload::error::{ItemProcessingError, SweepError};
use cloud_offload::model::{
    AttachmentFilter, AttachmentRecord, ItemAction, SweepKind, SweepOptions, SweepStatus,
};
use cloud_offload::sweep::{BatchJobController, ItemProcessor};
use common::{seed_attachments, setup_pool};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

/// Records every item it sees and fails the ones in `fail`.
#[derive(Default)]
struct ScriptedProcessor {
    fail: Mutex<HashSet<i64>>,
    seen: Mutex<Vec<i64>>,
}

impl ScriptedProcessor {
    fn failing(ids: &[i64]) -> Self {
        Self {
            fail: Mutex::new(ids.iter().copied().collect()),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn seen(&self) -> Vec<i64> {
        self.seen.lock().unwrap().clone()
    }

    fn heal(&self) {
        self.fail.lock().unwrap().clear();
    }
}

#[async_trait]
impl ItemProcessor for ScriptedProcessor {
    fn filter(&self) -> AttachmentFilter {
        AttachmentFilter::All
    }

    async fn process(
        &self,
        item: &AttachmentRecord,
        _options: &SweepOptions,
    ) -> Result<ItemAction, ItemProcessingError> {
        self.seen.lock().unwrap().push(item.id);
        if self.fail.lock().unwrap().contains(&item.id) {
            return Err(anyhow!("boom {}", item.id).into());
        }
        Ok(ItemAction::Verified)
    }
}

fn controller(pool: &Pool, processor: Arc<dyn ItemProcessor>) -> BatchJobController {
    BatchJobController::new(
        SweepKind::Migration,
        pool.clone(),
        Arc::new(SqliteAttachments::new(pool.clone())),
        processor,
    )
}

fn options(batch_size: u32) -> SweepOptions {
    SweepOptions::new(SweepKind::Migration, batch_size)
}

#[tokio::test]
async fn completes_after_exact_number_of_batches() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 250).await;
    let ctl = controller(&pool, Arc::new(ScriptedProcessor::default()));

    let state = ctl.start(options(50)).await.unwrap();
    assert_eq!(state.total, 250);
    assert_eq!(state.status, SweepStatus::Running);

    for call in 1..=5 {
        let result = ctl.process_batch().await.unwrap();
        assert_eq!(result.batch_processed, 50);
        assert_eq!(result.complete, call == 5, "call {}", call);
    }
    let state = ctl.get_status().await.unwrap();
    assert_eq!(state.status, SweepStatus::Completed);
    assert_eq!(state.processed, 250);
    assert!(state.completed_at.is_some());

    // terminal: further calls change nothing
    let again = ctl.process_batch().await.unwrap();
    assert!(!again.complete);
    assert_eq!(again.batch_processed, 0);
    assert_eq!(again.state.version, state.version);
}

#[tokio::test]
async fn counters_are_monotonic_and_cursor_increases() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 23).await;
    let processor = Arc::new(ScriptedProcessor::failing(&[3, 11]));
    let ctl = controller(&pool, processor.clone());
    ctl.start(options(5)).await.unwrap();

    let mut last_done = 0;
    let mut last_cursor = 0;
    loop {
        let result = ctl.process_batch().await.unwrap();
        let s = &result.state;
        let done = s.processed + s.failed;
        assert!(done >= last_done);
        assert!(done <= s.total);
        if result.batch_processed + result.batch_failed > 0 {
            assert!(s.cursor > last_cursor);
        }
        last_done = done;
        last_cursor = s.cursor;
        if result.complete {
            break;
        }
    }
    let state = ctl.get_status().await.unwrap();
    assert_eq!(state.processed, 21);
    assert_eq!(state.failed, 2);
    let failed: Vec<i64> = state.errors.iter().map(|e| e.item_id).collect();
    assert_eq!(failed, vec![3, 11]);
    assert_eq!(processor.seen(), (1..=23).collect::<Vec<_>>());
}

#[tokio::test]
async fn batch_errors_are_reported_and_cursor_still_advances() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 4).await;
    let ctl = controller(&pool, Arc::new(ScriptedProcessor::failing(&[2])));
    ctl.start(options(3)).await.unwrap();

    let result = ctl.process_batch().await.unwrap();
    assert_eq!(result.batch_processed, 2);
    assert_eq!(result.batch_failed, 1);
    assert_eq!(result.batch_errors.len(), 1);
    assert_eq!(result.batch_errors[0].item_id, 2);
    assert!(result.batch_errors[0].error.contains("boom 2"));
    assert_eq!(result.state.cursor, 3);
    assert_eq!(result.batch_actions.len(), 2);
}

#[tokio::test]
async fn pause_and_resume_continue_after_cursor() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 200).await;
    let processor = Arc::new(ScriptedProcessor::default());
    let ctl = controller(&pool, processor.clone());
    ctl.start(options(40)).await.unwrap();
    for _ in 0..3 {
        ctl.process_batch().await.unwrap();
    }

    let paused = ctl.pause().await.unwrap();
    assert_eq!(paused.status, SweepStatus::Paused);
    assert_eq!(paused.cursor, 120);

    let noop = ctl.process_batch().await.unwrap();
    assert!(!noop.complete);
    assert_eq!(noop.state.cursor, 120);
    assert_eq!(processor.seen().len(), 120);

    ctl.resume().await.unwrap();
    let result = ctl.process_batch().await.unwrap();
    assert_eq!(processor.seen()[120], 121);
    assert_eq!(result.state.cursor, 160);
}

#[tokio::test]
async fn state_machine_rejections() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 10).await;
    let ctl = controller(&pool, Arc::new(ScriptedProcessor::default()));

    assert!(matches!(ctl.pause().await, Err(SweepError::NotRunning(_))));
    assert!(matches!(ctl.resume().await, Err(SweepError::NotPaused(_))));

    let started = ctl.start(options(2)).await.unwrap();
    assert!(matches!(
        ctl.start(options(2)).await,
        Err(SweepError::AlreadyRunning(SweepKind::Migration))
    ));
    assert!(matches!(ctl.resume().await, Err(SweepError::NotPaused(_))));

    ctl.process_batch().await.unwrap();
    ctl.pause().await.unwrap();
    assert!(matches!(ctl.pause().await, Err(SweepError::NotRunning(_))));
    assert!(matches!(
        ctl.start(options(2)).await,
        Err(SweepError::AlreadyRunning(_))
    ));

    // explicit resume through start keeps the run and its cursor
    let resumed = ctl.start_or_resume(options(9)).await.unwrap();
    assert_eq!(resumed.status, SweepStatus::Running);
    assert_eq!(resumed.run_id, started.run_id);
    assert_eq!(resumed.cursor, 2);
    assert_eq!(resumed.options.batch_size, 2);
}

#[tokio::test]
async fn stop_resets_and_allows_fresh_start() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 10).await;
    let ctl = controller(&pool, Arc::new(ScriptedProcessor::failing(&[1])));
    let first = ctl.start(options(4)).await.unwrap();
    ctl.process_batch().await.unwrap();

    ctl.stop().await.unwrap();
    let state = ctl.get_status().await.unwrap();
    assert_eq!(state.status, SweepStatus::Idle);
    assert_eq!(state.cursor, 0);
    assert_eq!(state.processed + state.failed + state.total, 0);
    assert!(state.errors.is_empty());
    // stopping twice is harmless
    ctl.stop().await.unwrap();

    let second = ctl.start(options(4)).await.unwrap();
    assert_ne!(second.run_id, first.run_id);
    assert_eq!(second.cursor, 0);
    assert_eq!(second.total, 10);
}

#[tokio::test]
async fn state_survives_controller_restart() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 30).await;
    {
        let ctl = controller(&pool, Arc::new(ScriptedProcessor::default()));
        ctl.start(options(7)).await.unwrap();
        ctl.process_batch().await.unwrap();
        ctl.process_batch().await.unwrap();
    }

    let processor = Arc::new(ScriptedProcessor::default());
    let ctl = controller(&pool, processor.clone());
    let state = ctl.get_status().await.unwrap();
    assert_eq!(state.cursor, 14);
    assert_eq!(state.status, SweepStatus::Running);

    ctl.process_batch().await.unwrap();
    assert_eq!(processor.seen().first().copied(), Some(15));
}

#[tokio::test]
async fn empty_registry_completes_on_first_batch() {
    let pool = setup_pool().await;
    let ctl = controller(&pool, Arc::new(ScriptedProcessor::default()));
    let state = ctl.start(options(10)).await.unwrap();
    assert_eq!(state.total, 0);
    let result = ctl.process_batch().await.unwrap();
    assert!(result.complete);
    assert_eq!(result.state.status, SweepStatus::Completed);
}

#[tokio::test]
async fn error_log_keeps_most_recent_entries() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 10).await;
    let all: Vec<i64> = (1..=10).collect();
    let ctl = controller(&pool, Arc::new(ScriptedProcessor::failing(&all)))
        .with_defaults(options(10), 3);
    ctl.start(options(10)).await.unwrap();
    let result = ctl.process_batch().await.unwrap();
    assert_eq!(result.batch_failed, 10);
    assert_eq!(result.batch_errors.len(), 10);
    let kept: Vec<i64> = result.state.errors.iter().map(|e| e.item_id).collect();
    assert_eq!(kept, vec![8, 9, 10]);
    assert_eq!(result.state.failed, 10);
}

#[tokio::test]
async fn retry_failed_moves_items_to_processed() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 6).await;
    let processor = Arc::new(ScriptedProcessor::failing(&[2, 5]));
    let ctl = controller(&pool, processor.clone());

    // nothing to retry before any sweep
    assert_eq!(ctl.retry_failed().await.unwrap().retried, 0);

    ctl.start(options(3)).await.unwrap();
    ctl.process_batch().await.unwrap();
    assert!(matches!(
        ctl.retry_failed().await,
        Err(SweepError::AlreadyRunning(_))
    ));
    let done = ctl.process_batch().await.unwrap();
    assert!(done.complete);
    assert_eq!(done.state.failed, 2);

    // still failing: counters unchanged, message refreshed
    let report = ctl.retry_failed().await.unwrap();
    assert_eq!((report.retried, report.succeeded, report.still_failing), (2, 0, 2));

    processor.heal();
    let report = ctl.retry_failed().await.unwrap();
    assert_eq!((report.retried, report.succeeded, report.still_failing), (2, 2, 0));
    let state = ctl.get_status().await.unwrap();
    assert_eq!(state.failed, 0);
    assert_eq!(state.processed, 6);
    assert!(state.errors.is_empty());
    assert_eq!(state.status, SweepStatus::Completed);
    assert_eq!(state.cursor, 6);
}

/// Simulates `stop()` from another process landing while a batch runs.
struct StopMidBatch {
    pool: Pool,
    trigger: i64,
}

#[async_trait]
impl ItemProcessor for StopMidBatch {
    fn filter(&self) -> AttachmentFilter {
        AttachmentFilter::All
    }

    async fn process(
        &self,
        item: &AttachmentRecord,
        _options: &SweepOptions,
    ) -> Result<ItemAction, ItemProcessingError> {
        if item.id == self.trigger {
            let mut state = db::load_sweep_state(&self.pool, SweepKind::Migration)
                .await?
                .ok_or_else(|| anyhow!("no state"))?;
            let version = state.version;
            state.status = SweepStatus::Idle;
            state.cursor = 0;
            state.processed = 0;
            state.failed = 0;
            state.total = 0;
            assert!(db::update_sweep_state(&self.pool, &state, version).await?);
        }
        Ok(ItemAction::Verified)
    }
}

#[tokio::test]
async fn batch_losing_race_with_stop_is_discarded() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 5).await;
    let ctl = controller(
        &pool,
        Arc::new(StopMidBatch {
            pool: pool.clone(),
            trigger: 2,
        }),
    );
    ctl.start(options(5)).await.unwrap();

    let err = ctl.process_batch().await.unwrap_err();
    assert!(matches!(err, SweepError::StateConflict { .. }));
    assert!(err.is_transient());

    let state = ctl.get_status().await.unwrap();
    assert_eq!(state.status, SweepStatus::Idle);
    assert_eq!(state.cursor, 0);
    assert_eq!(state.processed, 0);

    let retried = ctl.process_batch().await.unwrap();
    assert!(!retried.complete);
    assert_eq!(retried.batch_processed, 0);
}

/// Marks every item migrated and pauses the sweep, as a client would, while
/// item `trigger` is being processed.
struct PauseMidBatch {
    pool: Pool,
    trigger: i64,
}

#[async_trait]
impl ItemProcessor for PauseMidBatch {
    fn filter(&self) -> AttachmentFilter {
        AttachmentFilter::NotMigrated
    }

    async fn process(
        &self,
        item: &AttachmentRecord,
        _options: &SweepOptions,
    ) -> Result<ItemAction, ItemProcessingError> {
        db::mark_migrated(&self.pool, item.id, &item.relative_path, "https://cdn.test/x").await?;
        if item.id == self.trigger {
            let mut state = db::load_sweep_state(&self.pool, SweepKind::Migration)
                .await?
                .ok_or_else(|| anyhow!("no state"))?;
            let version = state.version;
            state.status = SweepStatus::Paused;
            assert!(db::update_sweep_state(&self.pool, &state, version).await?);
        }
        Ok(ItemAction::Uploaded)
    }
}

#[tokio::test]
async fn batch_overlapping_pause_keeps_its_progress() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 10).await;
    let ctl = controller(
        &pool,
        Arc::new(PauseMidBatch {
            pool: pool.clone(),
            trigger: 2,
        }),
    );
    ctl.start(options(5)).await.unwrap();

    let first = ctl.process_batch().await.unwrap();
    assert!(!first.complete);
    assert_eq!(first.batch_processed, 5);
    assert_eq!(first.state.status, SweepStatus::Paused);
    assert_eq!(first.state.cursor, 5);
    assert_eq!(first.state.processed, 5);

    // paused: nothing happens until resumed
    let idle = ctl.process_batch().await.unwrap();
    assert_eq!(idle.batch_processed, 0);

    ctl.resume().await.unwrap();
    let second = ctl.process_batch().await.unwrap();
    assert!(second.complete);
    assert_eq!(second.state.processed, 10);
    assert_eq!(second.state.processed, second.state.total);
    assert_eq!(second.state.cursor, 10);
}

#[tokio::test]
async fn retry_keeps_entries_for_deleted_items() {
    let pool = setup_pool().await;
    seed_attachments(&pool, 3).await;
    let ctl = controller(&pool, Arc::new(ScriptedProcessor::failing(&[2])));
    ctl.start(options(3)).await.unwrap();
    assert!(ctl.process_batch().await.unwrap().complete);

    sqlx::query("DELETE FROM attachments WHERE id = ?")
        .bind(2_i64)
        .execute(&pool)
        .await
        .unwrap();

    let report = ctl.retry_failed().await.unwrap();
    assert_eq!(report.retried, 0);
    let state = ctl.get_status().await.unwrap();
    assert_eq!(state.failed, 1);
    assert_eq!(state.processed + state.failed, state.total);
    assert_eq!(state.errors.len(), 1);
    assert_eq!(state.errors[0].item_id, 2);
    assert!(state.errors[0].error.contains("no longer exists"));
}
