use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Largest batch a single `process_batch` call may fetch.
pub const MAX_BATCH_SIZE: u32 = 500;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum SweepKind {
    Migration,
    Optimization,
    Reconciliation,
    CloudSync,
}

impl SweepKind {
    pub const ALL: [SweepKind; 4] = [
        SweepKind::Migration,
        SweepKind::Optimization,
        SweepKind::Reconciliation,
        SweepKind::CloudSync,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SweepKind::Migration => "migration",
            SweepKind::Optimization => "optimization",
            SweepKind::Reconciliation => "reconciliation",
            SweepKind::CloudSync => "cloudsync",
        }
    }

    pub fn parse_kind(s: &str) -> Option<Self> {
        match s {
            "migration" => Some(SweepKind::Migration),
            "optimization" => Some(SweepKind::Optimization),
            "reconciliation" => Some(SweepKind::Reconciliation),
            "cloudsync" => Some(SweepKind::CloudSync),
            _ => None,
        }
    }

    /// Processing mode a sweep of this kind runs in.
    pub fn mode(&self) -> SweepMode {
        match self {
            SweepKind::Migration => SweepMode::Migrate,
            SweepKind::Optimization => SweepMode::Optimize,
            SweepKind::Reconciliation => SweepMode::Integrity,
            SweepKind::CloudSync => SweepMode::Sync,
        }
    }
}

impl fmt::Display for SweepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SweepKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_kind(&s.to_ascii_lowercase()).ok_or_else(|| {
            format!(
                "unknown sweep kind '{}' (expected migration, optimization, reconciliation or cloudsync)",
                s
            )
        })
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SweepStatus {
    Idle,
    Running,
    Paused,
    Completed,
}

impl SweepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepStatus::Idle => "idle",
            SweepStatus::Running => "running",
            SweepStatus::Paused => "paused",
            SweepStatus::Completed => "completed",
        }
    }

    pub fn parse_status(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(SweepStatus::Idle),
            "running" => Some(SweepStatus::Running),
            "paused" => Some(SweepStatus::Paused),
            "completed" => Some(SweepStatus::Completed),
            _ => None,
        }
    }

    /// Running and paused sweeps block a second sweep of the same kind.
    pub fn is_active(&self) -> bool {
        matches!(self, SweepStatus::Running | SweepStatus::Paused)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SweepMode {
    Migrate,
    Optimize,
    Sync,
    Integrity,
}

/// Options captured at `start()` and reused by every batch of the sweep.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SweepOptions {
    pub batch_size: u32,
    #[serde(default)]
    pub remove_local: bool,
    #[serde(default)]
    pub auto_fix: bool,
    pub mode: SweepMode,
}

impl SweepOptions {
    pub fn new(kind: SweepKind, batch_size: u32) -> Self {
        Self {
            batch_size,
            remove_local: false,
            auto_fix: false,
            mode: kind.mode(),
        }
    }

    /// Clamp the batch size into `1..=MAX_BATCH_SIZE` and pin the mode to the kind.
    pub fn normalized(mut self, kind: SweepKind) -> Self {
        self.batch_size = self.batch_size.clamp(1, MAX_BATCH_SIZE);
        self.mode = kind.mode();
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemError {
    pub item_id: i64,
    pub error: String,
}

/// Persisted progress of one sweep kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BatchJobState {
    pub kind: SweepKind,
    pub run_id: Uuid,
    pub status: SweepStatus,
    pub cursor: i64,
    pub total: i64,
    pub processed: i64,
    pub failed: i64,
    pub options: SweepOptions,
    pub errors: Vec<ItemError>,
    pub version: i64,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl BatchJobState {
    /// State reported for a kind that has never been started or was stopped.
    pub fn idle(kind: SweepKind, options: SweepOptions) -> Self {
        let now = Utc::now();
        Self {
            kind,
            run_id: Uuid::nil(),
            status: SweepStatus::Idle,
            cursor: 0,
            total: 0,
            processed: 0,
            failed: 0,
            options,
            errors: Vec::new(),
            version: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn fresh(kind: SweepKind, options: SweepOptions, total: i64) -> Self {
        let now = Utc::now();
        Self {
            kind,
            run_id: Uuid::new_v4(),
            status: SweepStatus::Running,
            cursor: 0,
            total,
            processed: 0,
            failed: 0,
            options,
            errors: Vec::new(),
            version: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Items still owed before the sweep reaches `total`.
    pub fn remaining(&self) -> i64 {
        (self.total - self.processed - self.failed).max(0)
    }

    /// Append a failure, keeping only the most recent `limit` entries.
    pub fn push_error(&mut self, error: ItemError, limit: usize) {
        self.errors.retain(|e| e.item_id != error.item_id);
        self.errors.push(error);
        if self.errors.len() > limit {
            let excess = self.errors.len() - limit;
            self.errors.drain(..excess);
        }
    }

    pub fn complete(&mut self) {
        self.status = SweepStatus::Completed;
        self.completed_at = Some(Utc::now());
    }
}

/// Predicate scoping which attachments a sweep enumerates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachmentFilter {
    All,
    Migrated,
    NotMigrated,
    PendingOptimization,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AttachmentRecord {
    pub id: i64,
    pub relative_path: String,
    pub byte_size: i64,
    pub mime_type: Option<String>,
    /// Relative paths of derived thumbnail files.
    pub variants: Vec<String>,
    pub migrated: bool,
    pub remote_key: Option<String>,
    pub remote_url: Option<String>,
    pub optimized: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NewAttachment {
    pub relative_path: String,
    pub byte_size: i64,
    pub mime_type: Option<String>,
    pub variants: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteObjectRecord {
    pub key: String,
    pub size: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DiscrepancyKind {
    NotOnRemote,
    NotMarkedMigrated,
    OrphanRemote,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Discrepancy {
    pub kind: DiscrepancyKind,
    pub attachment_id: Option<i64>,
    pub relative_path: String,
    pub remote: Option<RemoteObjectRecord>,
    pub local_exists: Option<bool>,
}

/// What an item processor did with one attachment.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemAction {
    Uploaded,
    Verified,
    KeyCorrected,
    Reuploaded,
    MetadataCleared,
    Reported,
    Optimized,
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ItemReport {
    pub item_id: i64,
    pub action: ItemAction,
}

/// Outcome of one `process_batch` call.
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub state: BatchJobState,
    pub batch_processed: u32,
    pub batch_failed: u32,
    pub batch_errors: Vec<ItemError>,
    pub batch_actions: Vec<ItemReport>,
    pub complete: bool,
}

impl BatchResult {
    /// Result for a call that did nothing because the sweep is not running.
    pub fn noop(state: BatchJobState) -> Self {
        Self {
            state,
            batch_processed: 0,
            batch_failed: 0,
            batch_errors: Vec::new(),
            batch_actions: Vec::new(),
            complete: false,
        }
    }
}
