//! Row mapping between SQLite and the domain types.
//!
//! Keep these helpers focused on decoding query results. Business logic
//! lives in the sweep and reconcile layers.

use crate::model::{
    AttachmentFilter, AttachmentRecord, BatchJobState, ItemError, SweepKind, SweepOptions,
    SweepStatus,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

/// Aggregate counters over the attachment registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AttachmentCounts {
    pub total: i64,
    pub migrated: i64,
    pub pending_optimization: i64,
    /// Bytes still held only locally (not migrated).
    pub local_bytes: i64,
    pub migrated_bytes: i64,
}

pub(crate) fn filter_clause(filter: AttachmentFilter) -> &'static str {
    match filter {
        AttachmentFilter::All => "1 = 1",
        AttachmentFilter::Migrated => "migrated = 1",
        AttachmentFilter::NotMigrated => "migrated = 0",
        AttachmentFilter::PendingOptimization => "migrated = 0 AND optimized = 0",
    }
}

pub(crate) fn attachment_from_row(row: &SqliteRow) -> Result<AttachmentRecord> {
    let variants_json: String = row.try_get("variants")?;
    let variants: Vec<String> = serde_json::from_str(&variants_json)
        .with_context(|| format!("invalid variants column: {}", variants_json))?;
    Ok(AttachmentRecord {
        id: row.try_get("id")?,
        relative_path: row.try_get("relative_path")?,
        byte_size: row.try_get("byte_size")?,
        mime_type: row.try_get::<Option<String>, _>("mime_type")?,
        variants,
        migrated: row.try_get("migrated")?,
        remote_key: row
            .try_get::<Option<String>, _>("remote_key")?
            .filter(|k| !k.trim().is_empty()),
        remote_url: row.try_get::<Option<String>, _>("remote_url")?,
        optimized: row.try_get("optimized")?,
    })
}

pub(crate) fn sweep_state_from_row(row: &SqliteRow) -> Result<BatchJobState> {
    let kind_str: String = row.try_get("kind")?;
    let kind = SweepKind::parse_kind(&kind_str)
        .ok_or_else(|| anyhow!("unknown sweep kind {}", kind_str))?;
    let status_str: String = row.try_get("status")?;
    let status = SweepStatus::parse_status(&status_str)
        .ok_or_else(|| anyhow!("{} sweep has unknown status {}", kind, status_str))?;
    let run_id_str: String = row.try_get("run_id")?;
    let run_id = Uuid::parse_str(&run_id_str)
        .with_context(|| format!("{} sweep has invalid run id {}", kind, run_id_str))?;

    let options_json: String = row.try_get("options")?;
    let options: SweepOptions = serde_json::from_str(&options_json)
        .with_context(|| format!("{} sweep has invalid options", kind))?;
    let errors_json: String = row.try_get("errors")?;
    let errors: Vec<ItemError> = serde_json::from_str(&errors_json)
        .with_context(|| format!("{} sweep has invalid error log", kind))?;

    Ok(BatchJobState {
        kind,
        run_id,
        status,
        cursor: row.try_get("cursor")?,
        total: row.try_get("total")?,
        processed: row.try_get("processed")?,
        failed: row.try_get("failed")?,
        options,
        errors,
        version: row.try_get("version")?,
        started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
        completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
    })
}
