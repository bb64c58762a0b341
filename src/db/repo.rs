use super::model::{attachment_from_row, filter_clause, sweep_state_from_row, AttachmentCounts};
use crate::model::{AttachmentFilter, AttachmentRecord, BatchJobState, NewAttachment, SweepKind};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::instrument;

pub type Pool = SqlitePool;

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true);
    let pool = SqlitePool::connect_with(options).await?;
    // Enable WAL and stricter durability.
    sqlx::query("PRAGMA journal_mode=WAL;")
        .execute(&pool)
        .await?;
    sqlx::query("PRAGMA synchronous=FULL;")
        .execute(&pool)
        .await?;
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched. Returns possibly-updated URL.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Attachments
// ---------------------------------------------------------------------------

/// Register an attachment. Returns the id of the existing row when the path is
/// already known.
#[instrument(skip_all)]
pub async fn insert_attachment(pool: &Pool, new: &NewAttachment) -> Result<i64> {
    let variants = serde_json::to_string(&new.variants)?;
    let inserted: Option<i64> = sqlx::query_scalar(
        "INSERT INTO attachments (relative_path, byte_size, mime_type, variants) VALUES (?, ?, ?, ?) \
         ON CONFLICT(relative_path) DO NOTHING RETURNING id",
    )
    .bind(&new.relative_path)
    .bind(new.byte_size)
    .bind(&new.mime_type)
    .bind(variants)
    .fetch_optional(pool)
    .await?;
    if let Some(id) = inserted {
        return Ok(id);
    }
    let id: i64 = sqlx::query_scalar("SELECT id FROM attachments WHERE relative_path = ?")
        .bind(&new.relative_path)
        .fetch_one(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn find_attachment_id_by_path(pool: &Pool, relative_path: &str) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM attachments WHERE relative_path = ?")
        .bind(relative_path)
        .fetch_optional(pool)
        .await?;
    Ok(id)
}

#[instrument(skip_all)]
pub async fn count_attachments(pool: &Pool, filter: AttachmentFilter) -> Result<i64> {
    let sql = format!(
        "SELECT COUNT(*) FROM attachments WHERE {}",
        filter_clause(filter)
    );
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(count)
}

/// Up to `limit` attachments with `id > after_id`, ascending by id.
#[instrument(skip_all)]
pub async fn page_attachments(
    pool: &Pool,
    filter: AttachmentFilter,
    after_id: i64,
    limit: i64,
) -> Result<Vec<AttachmentRecord>> {
    let sql = format!(
        "SELECT id, relative_path, byte_size, mime_type, variants, migrated, remote_key, remote_url, optimized \
         FROM attachments WHERE id > ? AND {} ORDER BY id ASC LIMIT ?",
        filter_clause(filter)
    );
    let rows = sqlx::query(&sql)
        .bind(after_id)
        .bind(limit)
        .fetch_all(pool)
        .await?;
    rows.iter().map(attachment_from_row).collect()
}

#[instrument(skip_all)]
pub async fn fetch_attachment(pool: &Pool, id: i64) -> Result<Option<AttachmentRecord>> {
    let row = sqlx::query(
        "SELECT id, relative_path, byte_size, mime_type, variants, migrated, remote_key, remote_url, optimized \
         FROM attachments WHERE id = ?",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(attachment_from_row).transpose()
}

#[instrument(skip_all)]
pub async fn mark_migrated(pool: &Pool, id: i64, remote_key: &str, remote_url: &str) -> Result<()> {
    sqlx::query(
        "UPDATE attachments SET migrated = 1, remote_key = ?, remote_url = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(remote_key)
    .bind(remote_url)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark attachment migrated")?;
    Ok(())
}

/// Rewrite key/URL without touching the migrated flag.
#[instrument(skip_all)]
pub async fn update_remote_location(
    pool: &Pool,
    id: i64,
    remote_key: &str,
    remote_url: &str,
) -> Result<()> {
    sqlx::query(
        "UPDATE attachments SET remote_key = ?, remote_url = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(remote_key)
    .bind(remote_url)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update attachment remote location")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn clear_migrated(pool: &Pool, id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE attachments SET migrated = 0, remote_key = NULL, remote_url = NULL, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to clear attachment migration")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn mark_optimized(pool: &Pool, id: i64, byte_size: i64) -> Result<()> {
    sqlx::query(
        "UPDATE attachments SET optimized = 1, optimized_bytes = ?, byte_size = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?",
    )
    .bind(byte_size)
    .bind(byte_size)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to mark attachment optimized")?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn set_attachment_variants(pool: &Pool, id: i64, variants: &[String]) -> Result<()> {
    sqlx::query("UPDATE attachments SET variants = ?, updated_at = CURRENT_TIMESTAMP WHERE id = ?")
        .bind(serde_json::to_string(variants)?)
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn attachment_counts(pool: &Pool) -> Result<AttachmentCounts> {
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, \
                COALESCE(SUM(CASE WHEN migrated = 1 THEN 1 ELSE 0 END), 0) AS migrated, \
                COALESCE(SUM(CASE WHEN migrated = 0 AND optimized = 0 THEN 1 ELSE 0 END), 0) AS pending_optimization, \
                COALESCE(SUM(CASE WHEN migrated = 0 THEN byte_size ELSE 0 END), 0) AS local_bytes, \
                COALESCE(SUM(CASE WHEN migrated = 1 THEN byte_size ELSE 0 END), 0) AS migrated_bytes \
         FROM attachments",
    )
    .fetch_one(pool)
    .await?;
    Ok(AttachmentCounts {
        total: row.try_get("total")?,
        migrated: row.try_get("migrated")?,
        pending_optimization: row.try_get("pending_optimization")?,
        local_bytes: row.try_get("local_bytes")?,
        migrated_bytes: row.try_get("migrated_bytes")?,
    })
}

// ---------------------------------------------------------------------------
// Sweep state
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn load_sweep_state(pool: &Pool, kind: SweepKind) -> Result<Option<BatchJobState>> {
    let row = sqlx::query(
        "SELECT kind, run_id, status, cursor, total, processed, failed, options, errors, version, \
                started_at, updated_at, completed_at \
         FROM sweep_state WHERE kind = ?",
    )
    .bind(kind.as_str())
    .fetch_optional(pool)
    .await?;
    row.as_ref().map(sweep_state_from_row).transpose()
}

/// Insert the first state row for a kind. Returns `false` when a row already
/// exists (another caller won the race).
#[instrument(skip_all)]
pub async fn insert_sweep_state(pool: &Pool, state: &BatchJobState) -> Result<bool> {
    let res = sqlx::query(
        "INSERT INTO sweep_state (kind, run_id, status, cursor, total, processed, failed, options, errors, version, started_at, updated_at, completed_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?) ON CONFLICT(kind) DO NOTHING",
    )
    .bind(state.kind.as_str())
    .bind(state.run_id.to_string())
    .bind(state.status.as_str())
    .bind(state.cursor)
    .bind(state.total)
    .bind(state.processed)
    .bind(state.failed)
    .bind(serde_json::to_string(&state.options)?)
    .bind(serde_json::to_string(&state.errors)?)
    .bind(state.started_at)
    .bind(state.updated_at)
    .bind(state.completed_at)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

/// Compare-and-swap write: succeeds only while the stored version still equals
/// `expected_version`, and bumps it by one.
#[instrument(skip_all)]
pub async fn update_sweep_state(
    pool: &Pool,
    state: &BatchJobState,
    expected_version: i64,
) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE sweep_state SET run_id = ?, status = ?, cursor = ?, total = ?, processed = ?, failed = ?, \
                options = ?, errors = ?, version = version + 1, started_at = ?, updated_at = ?, completed_at = ? \
         WHERE kind = ? AND version = ?",
    )
    .bind(state.run_id.to_string())
    .bind(state.status.as_str())
    .bind(state.cursor)
    .bind(state.total)
    .bind(state.processed)
    .bind(state.failed)
    .bind(serde_json::to_string(&state.options)?)
    .bind(serde_json::to_string(&state.errors)?)
    .bind(state.started_at)
    .bind(state.updated_at)
    .bind(state.completed_at)
    .bind(state.kind.as_str())
    .bind(expected_version)
    .execute(pool)
    .await?;
    Ok(res.rows_affected() == 1)
}

// ---------------------------------------------------------------------------
// Reconciliation cache
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn store_reconcile_cache(pool: &Pool, payload: &str, scanned_at: DateTime<Utc>) -> Result<()> {
    sqlx::query(
        "INSERT INTO reconcile_cache (id, payload, scanned_at) VALUES (1, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET payload = excluded.payload, scanned_at = excluded.scanned_at",
    )
    .bind(payload)
    .bind(scanned_at)
    .execute(pool)
    .await?;
    Ok(())
}

#[instrument(skip_all)]
pub async fn load_reconcile_cache(pool: &Pool) -> Result<Option<String>> {
    let payload = sqlx::query_scalar::<_, String>("SELECT payload FROM reconcile_cache WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SweepOptions, SweepStatus};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_pool() -> Pool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn new_attachment(path: &str, size: i64) -> NewAttachment {
        NewAttachment {
            relative_path: path.into(),
            byte_size: size,
            mime_type: Some("image/jpeg".into()),
            variants: vec![],
        }
    }

    #[tokio::test]
    async fn test_attachment_paging_and_filters() {
        let pool = setup_pool().await;
        let mut ids = Vec::new();
        for i in 1..=5 {
            ids.push(
                insert_attachment(&pool, &new_attachment(&format!("2024/01/{}.jpg", i), 100))
                    .await
                    .unwrap(),
            );
        }
        // duplicate path returns the existing id
        let dup = insert_attachment(&pool, &new_attachment("2024/01/1.jpg", 1))
            .await
            .unwrap();
        assert_eq!(dup, ids[0]);

        mark_migrated(&pool, ids[1], "u/2.jpg", "https://cdn/u/2.jpg")
            .await
            .unwrap();

        assert_eq!(count_attachments(&pool, AttachmentFilter::All).await.unwrap(), 5);
        assert_eq!(count_attachments(&pool, AttachmentFilter::Migrated).await.unwrap(), 1);
        assert_eq!(count_attachments(&pool, AttachmentFilter::NotMigrated).await.unwrap(), 4);

        let page = page_attachments(&pool, AttachmentFilter::NotMigrated, ids[0], 2)
            .await
            .unwrap();
        let page_ids: Vec<i64> = page.iter().map(|a| a.id).collect();
        assert_eq!(page_ids, vec![ids[2], ids[3]]);

        let migrated = fetch_attachment(&pool, ids[1]).await.unwrap().unwrap();
        assert!(migrated.migrated);
        assert_eq!(migrated.remote_key.as_deref(), Some("u/2.jpg"));

        clear_migrated(&pool, ids[1]).await.unwrap();
        let cleared = fetch_attachment(&pool, ids[1]).await.unwrap().unwrap();
        assert!(!cleared.migrated);
        assert!(cleared.remote_key.is_none());

        let counts = attachment_counts(&pool).await.unwrap();
        assert_eq!(counts.total, 5);
        assert_eq!(counts.migrated, 0);
        assert_eq!(counts.local_bytes, 500);
    }

    #[tokio::test]
    async fn test_sweep_state_compare_and_swap() {
        let pool = setup_pool().await;
        assert!(load_sweep_state(&pool, SweepKind::Migration).await.unwrap().is_none());

        let options = SweepOptions::new(SweepKind::Migration, 25);
        let mut state = BatchJobState::fresh(SweepKind::Migration, options, 10);
        assert!(insert_sweep_state(&pool, &state).await.unwrap());
        assert!(!insert_sweep_state(&pool, &state).await.unwrap());

        let loaded = load_sweep_state(&pool, SweepKind::Migration).await.unwrap().unwrap();
        assert_eq!(loaded.version, 0);
        assert_eq!(loaded.run_id, state.run_id);
        assert_eq!(loaded.options.batch_size, 25);

        state.cursor = 7;
        state.processed = 3;
        assert!(update_sweep_state(&pool, &state, 0).await.unwrap());
        // stale writer loses
        assert!(!update_sweep_state(&pool, &state, 0).await.unwrap());

        let loaded = load_sweep_state(&pool, SweepKind::Migration).await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.cursor, 7);
        assert_eq!(loaded.status, SweepStatus::Running);
    }

    #[tokio::test]
    async fn test_reconcile_cache_upsert() {
        let pool = setup_pool().await;
        assert!(load_reconcile_cache(&pool).await.unwrap().is_none());
        store_reconcile_cache(&pool, "{\"a\":1}", Utc::now()).await.unwrap();
        store_reconcile_cache(&pool, "{\"a\":2}", Utc::now()).await.unwrap();
        assert_eq!(
            load_reconcile_cache(&pool).await.unwrap().as_deref(),
            Some("{\"a\":2}")
        );
    }

    #[test]
    fn test_prepare_sqlite_url_passthrough() {
        assert_eq!(prepare_sqlite_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(prepare_sqlite_url("postgres://x"), "postgres://x");
    }
}
