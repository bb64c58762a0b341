//! Cloud reconciliation: compares the attachment registry with the remote
//! bucket, ranks remediation work and drives the integrity sweep.
use crate::attachments::{AttachmentRepository, LocalFiles};
use crate::db::{self, AttachmentCounts, Pool};
use crate::error::SweepError;
use crate::model::{AttachmentFilter, Discrepancy, DiscrepancyKind, RemoteObjectRecord, SweepKind};
use crate::storage::{keys, KeyMapper, ObjectStorage, RemoteListing};
use chrono::{DateTime, Utc};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub mod classify;
pub mod integrity;

pub use classify::{Classification, ClassificationCounts, Classifier, RemoteMap};
pub use integrity::IntegrityProcessor;

const ATTACHMENT_PAGE: i64 = 500;

/// List every original under the base prefix into a [`RemoteMap`].
/// Any listing failure aborts the scan.
pub async fn build_remote_map(
    storage: &dyn ObjectStorage,
    keys: &KeyMapper,
    page_size: u32,
) -> Result<RemoteMap, SweepError> {
    let listing = RemoteListing::new(storage, keys.list_prefix(), page_size);
    let mut entries = listing.entries();
    let mut map = RemoteMap::new();
    let mut thumbnails = 0usize;
    let mut foreign = 0usize;
    while let Some(entry) = entries
        .try_next()
        .await
        .map_err(|e| SweepError::ScanFailure(e.to_string()))?
    {
        if keys::is_thumbnail(&entry.key) {
            thumbnails += 1;
            continue;
        }
        let Some(rel) = keys.relative_path(&entry.key) else {
            foreign += 1;
            continue;
        };
        map.insert(
            rel,
            RemoteObjectRecord {
                key: entry.key,
                size: entry.size,
            },
        );
    }
    debug!(
        originals = map.len(),
        thumbnails, foreign, "remote listing complete"
    );
    Ok(map)
}

/// Aggregates shown to the user. `estimated` is set when discrepancy counts
/// come from the last deep scan rather than a fresh one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationStats {
    pub total_attachments: i64,
    pub migrated: i64,
    pub pending_sync: i64,
    pub pending_optimization: i64,
    pub percent_synced: f64,
    pub local_bytes: i64,
    pub migrated_bytes: i64,
    pub remote_objects: i64,
    pub remote_bytes: i64,
    pub not_on_remote: i64,
    pub not_marked_migrated: i64,
    pub orphan_remote: i64,
    pub local_missing: i64,
    pub integrity_issues: i64,
    pub estimated: bool,
}

impl ReconciliationStats {
    fn from_counts(counts: &AttachmentCounts) -> Self {
        let percent_synced = if counts.total == 0 {
            100.0
        } else {
            (counts.migrated as f64 / counts.total as f64 * 1000.0).round() / 10.0
        };
        Self {
            total_attachments: counts.total,
            migrated: counts.migrated,
            pending_sync: counts.total - counts.migrated,
            pending_optimization: counts.pending_optimization,
            percent_synced,
            local_bytes: counts.local_bytes,
            migrated_bytes: counts.migrated_bytes,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationKind {
    FixIntegrity,
    OptimizeBeforeSync,
    SyncPending,
    CleanOrphans,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemediationAction {
    pub kind: RemediationKind,
    pub count: i64,
    /// Whether the action may run without explicit confirmation.
    pub auto_apply: bool,
    /// Sweep that carries the action out, if any.
    pub sweep: Option<SweepKind>,
    pub description: String,
}

/// Remediation work in priority order; actions with nothing to do are left out.
pub fn rank_actions(stats: &ReconciliationStats) -> Vec<RemediationAction> {
    let candidates = [
        (
            RemediationKind::FixIntegrity,
            stats.integrity_issues,
            true,
            Some(SweepKind::Reconciliation),
            "repair records that disagree with the bucket",
        ),
        (
            RemediationKind::OptimizeBeforeSync,
            stats.pending_optimization,
            true,
            Some(SweepKind::Optimization),
            "optimize local images before uploading them",
        ),
        (
            RemediationKind::SyncPending,
            stats.pending_sync,
            true,
            Some(SweepKind::CloudSync),
            "upload attachments that only exist locally",
        ),
        (
            RemediationKind::CleanOrphans,
            stats.orphan_remote,
            false,
            None,
            "delete remote objects no attachment refers to",
        ),
    ];
    candidates
        .into_iter()
        .filter(|(_, count, ..)| *count > 0)
        .map(|(kind, count, auto_apply, sweep, description)| RemediationAction {
            kind,
            count,
            auto_apply,
            sweep,
            description: description.to_string(),
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub deep: bool,
    pub scanned_at: Option<DateTime<Utc>>,
    pub stats: ReconciliationStats,
    pub discrepancies: Vec<Discrepancy>,
    pub actions: Vec<RemediationAction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CachedScan {
    scanned_at: DateTime<Utc>,
    stats: ReconciliationStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OrphanCleanup {
    pub deleted: usize,
    pub already_gone: usize,
    pub failed: usize,
}

pub struct CloudReconciliationEngine {
    pool: Pool,
    attachments: Arc<dyn AttachmentRepository>,
    storage: Option<Arc<dyn ObjectStorage>>,
    files: LocalFiles,
    keys: KeyMapper,
    page_size: u32,
}

impl CloudReconciliationEngine {
    pub fn new(
        pool: Pool,
        attachments: Arc<dyn AttachmentRepository>,
        storage: Option<Arc<dyn ObjectStorage>>,
        files: LocalFiles,
        keys: KeyMapper,
        page_size: u32,
    ) -> Self {
        Self {
            pool,
            attachments,
            storage,
            files,
            keys,
            page_size,
        }
    }

    fn storage(&self) -> Result<&dyn ObjectStorage, SweepError> {
        self.storage.as_deref().ok_or_else(|| {
            SweepError::PermanentConfiguration("object storage is not configured".into())
        })
    }

    /// Full scan: lists the bucket, streams the registry and classifies every
    /// attachment. The resulting aggregates are cached for [`Self::analyze`].
    #[instrument(skip_all)]
    pub async fn analyze_deep(&self) -> Result<ReconciliationReport, SweepError> {
        let remote = build_remote_map(self.storage()?, &self.keys, self.page_size).await?;

        let mut classifier = Classifier::new(&remote, &self.keys);
        let mut cursor = 0;
        loop {
            let page = self
                .attachments
                .page(AttachmentFilter::All, cursor, ATTACHMENT_PAGE)
                .await?;
            let Some(last) = page.last() else {
                break;
            };
            cursor = last.id;
            for record in &page {
                let local_exists = self.files.exists(&record.relative_path).await;
                classifier.observe(record, local_exists);
            }
        }
        let classification = classifier.finish();

        let counts = self.attachments.counts().await?;
        let mut stats = ReconciliationStats::from_counts(&counts);
        let c = &classification.counts;
        stats.remote_objects = remote.len() as i64;
        stats.remote_bytes = remote.total_bytes();
        stats.not_on_remote = c.not_on_remote;
        stats.not_marked_migrated = c.not_marked_migrated;
        stats.orphan_remote = c.orphan_remote;
        stats.local_missing = c.local_missing;
        stats.integrity_issues = c.not_on_remote + c.not_marked_migrated;

        let scanned_at = Utc::now();
        let cached = CachedScan {
            scanned_at,
            stats: stats.clone(),
        };
        let payload = serde_json::to_string(&cached).map_err(anyhow::Error::from)?;
        db::store_reconcile_cache(&self.pool, &payload, scanned_at).await?;

        info!(
            attachments = c.attachments,
            remote_objects = stats.remote_objects,
            not_on_remote = stats.not_on_remote,
            not_marked_migrated = stats.not_marked_migrated,
            orphan_remote = stats.orphan_remote,
            "deep analysis complete"
        );
        Ok(ReconciliationReport {
            deep: true,
            scanned_at: Some(scanned_at),
            actions: rank_actions(&stats),
            stats,
            discrepancies: classification.discrepancies,
        })
    }

    /// Cheap summary from registry counters and the last deep scan. Never
    /// touches the bucket.
    #[instrument(skip_all)]
    pub async fn analyze(&self) -> Result<ReconciliationReport, SweepError> {
        let counts = self.attachments.counts().await?;
        let mut stats = ReconciliationStats::from_counts(&counts);
        let mut scanned_at = None;

        match db::load_reconcile_cache(&self.pool).await? {
            Some(payload) => match serde_json::from_str::<CachedScan>(&payload) {
                Ok(cached) => {
                    let last = cached.stats;
                    stats.remote_objects = last.remote_objects;
                    stats.remote_bytes = last.remote_bytes;
                    stats.not_on_remote = last.not_on_remote;
                    stats.not_marked_migrated = last.not_marked_migrated;
                    stats.orphan_remote = last.orphan_remote;
                    stats.local_missing = last.local_missing;
                    stats.integrity_issues = last.integrity_issues;
                    scanned_at = Some(cached.scanned_at);
                }
                Err(err) => warn!(%err, "ignoring unreadable reconcile cache"),
            },
            None => debug!("no deep scan cached yet"),
        }
        stats.estimated = true;

        Ok(ReconciliationReport {
            deep: false,
            scanned_at,
            actions: rank_actions(&stats),
            stats,
            discrepancies: Vec::new(),
        })
    }

    /// Delete the orphaned remote objects listed in `report`. Per-key failures
    /// are logged and counted; they do not stop the cleanup.
    #[instrument(skip_all)]
    pub async fn clean_orphans(
        &self,
        report: &ReconciliationReport,
    ) -> Result<OrphanCleanup, SweepError> {
        let storage = self.storage()?;
        let mut outcome = OrphanCleanup::default();
        for discrepancy in &report.discrepancies {
            if discrepancy.kind != DiscrepancyKind::OrphanRemote {
                continue;
            }
            let Some(remote) = &discrepancy.remote else {
                continue;
            };
            match storage.delete(&remote.key).await {
                Ok(true) => outcome.deleted += 1,
                Ok(false) => outcome.already_gone += 1,
                Err(err) => {
                    warn!(key = %remote.key, %err, "failed to delete orphan");
                    outcome.failed += 1;
                }
            }
        }
        info!(
            deleted = outcome.deleted,
            already_gone = outcome.already_gone,
            failed = outcome.failed,
            "orphan cleanup finished"
        );
        Ok(outcome)
    }
}
