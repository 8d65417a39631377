//! SQL query functions for all tables.
//!
//! Every function takes `impl PgExecutor` so it can run against the pool or
//! inside a transaction; callers pick the transactional boundary.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgExecutor;
use uuid::Uuid;

use super::models::*;

// ── Funds ────────────────────────────────────────────────────────

pub async fn upsert_fund(
    ex: impl PgExecutor<'_>,
    scheme_code: &str,
    scheme_name: &str,
    amc: &str,
    category: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO funds (scheme_code, scheme_name, amc, category)
         VALUES ($1, $2, $3, $4)
         ON CONFLICT (scheme_code) DO UPDATE SET
             scheme_name = EXCLUDED.scheme_name,
             amc = EXCLUDED.amc,
             category = EXCLUDED.category,
             updated_at = now()",
    )
    .bind(scheme_code)
    .bind(scheme_name)
    .bind(amc)
    .bind(category)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_fund(ex: impl PgExecutor<'_>, scheme_code: &str) -> anyhow::Result<Option<Fund>> {
    let row = sqlx::query_as::<_, Fund>(
        "SELECT scheme_code, scheme_name, amc, category FROM funds WHERE scheme_code = $1",
    )
    .bind(scheme_code)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn list_funds(
    ex: impl PgExecutor<'_>,
    category: Option<&str>,
    amc: Option<&str>,
) -> anyhow::Result<Vec<Fund>> {
    let rows = sqlx::query_as::<_, Fund>(
        "SELECT scheme_code, scheme_name, amc, category FROM funds
         WHERE ($1::text IS NULL OR category = $1)
           AND ($2::text IS NULL OR amc = $2)
         ORDER BY scheme_code",
    )
    .bind(category)
    .bind(amc)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn count_funds_by_category(
    ex: impl PgExecutor<'_>,
    category: &str,
) -> anyhow::Result<i64> {
    let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM funds WHERE category = $1")
        .bind(category)
        .fetch_one(ex)
        .await?;
    Ok(count)
}

// ── NAV history ──────────────────────────────────────────────────

pub async fn upsert_nav_point(
    ex: impl PgExecutor<'_>,
    scheme_code: &str,
    nav_date: NaiveDate,
    nav_value: Decimal,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO nav_history (scheme_code, nav_date, nav_value)
         VALUES ($1, $2, $3)
         ON CONFLICT (scheme_code, nav_date) DO UPDATE SET nav_value = EXCLUDED.nav_value",
    )
    .bind(scheme_code)
    .bind(nav_date)
    .bind(nav_value)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn list_nav_history(
    ex: impl PgExecutor<'_>,
    scheme_code: &str,
) -> anyhow::Result<Vec<NavPoint>> {
    let rows = sqlx::query_as::<_, NavPoint>(
        "SELECT scheme_code, nav_date, nav_value FROM nav_history
         WHERE scheme_code = $1 ORDER BY nav_date",
    )
    .bind(scheme_code)
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn get_latest_nav(
    ex: impl PgExecutor<'_>,
    scheme_code: &str,
) -> anyhow::Result<Option<NavPoint>> {
    let row = sqlx::query_as::<_, NavPoint>(
        "SELECT scheme_code, nav_date, nav_value FROM nav_history
         WHERE scheme_code = $1 ORDER BY nav_date DESC LIMIT 1",
    )
    .bind(scheme_code)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

// ── Fund analytics ───────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn upsert_fund_analytics(
    ex: impl PgExecutor<'_>,
    scheme_code: &str,
    window_label: &str,
    rolling_min: Option<Decimal>,
    rolling_max: Option<Decimal>,
    rolling_median: Option<Decimal>,
    rolling_p25: Option<Decimal>,
    rolling_p75: Option<Decimal>,
    max_drawdown: Option<Decimal>,
    cagr_min: Option<Decimal>,
    cagr_max: Option<Decimal>,
    cagr_median: Option<Decimal>,
    data_start_date: NaiveDate,
    data_end_date: NaiveDate,
    nav_points: i32,
    rolling_periods: i32,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO fund_analytics (
             scheme_code, window_label,
             rolling_min, rolling_max, rolling_median, rolling_p25, rolling_p75,
             max_drawdown, cagr_min, cagr_max, cagr_median,
             data_start_date, data_end_date, nav_points, rolling_periods, computed_at
         )
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, now())
         ON CONFLICT (scheme_code, window_label) DO UPDATE SET
             rolling_min = EXCLUDED.rolling_min,
             rolling_max = EXCLUDED.rolling_max,
             rolling_median = EXCLUDED.rolling_median,
             rolling_p25 = EXCLUDED.rolling_p25,
             rolling_p75 = EXCLUDED.rolling_p75,
             max_drawdown = EXCLUDED.max_drawdown,
             cagr_min = EXCLUDED.cagr_min,
             cagr_max = EXCLUDED.cagr_max,
             cagr_median = EXCLUDED.cagr_median,
             data_start_date = EXCLUDED.data_start_date,
             data_end_date = EXCLUDED.data_end_date,
             nav_points = EXCLUDED.nav_points,
             rolling_periods = EXCLUDED.rolling_periods,
             computed_at = now()",
    )
    .bind(scheme_code)
    .bind(window_label)
    .bind(rolling_min)
    .bind(rolling_max)
    .bind(rolling_median)
    .bind(rolling_p25)
    .bind(rolling_p75)
    .bind(max_drawdown)
    .bind(cagr_min)
    .bind(cagr_max)
    .bind(cagr_median)
    .bind(data_start_date)
    .bind(data_end_date)
    .bind(nav_points)
    .bind(rolling_periods)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn get_fund_analytics(
    ex: impl PgExecutor<'_>,
    scheme_code: &str,
    window_label: &str,
) -> anyhow::Result<Option<FundAnalytics>> {
    let row = sqlx::query_as::<_, FundAnalytics>(
        "SELECT * FROM fund_analytics WHERE scheme_code = $1 AND window_label = $2",
    )
    .bind(scheme_code)
    .bind(window_label)
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

const RANK_FUNDS_SELECT: &str =
    "SELECT f.scheme_code, f.scheme_name, f.amc,
            a.rolling_median, a.max_drawdown,
            n.nav_value AS current_nav, n.nav_date AS last_updated
     FROM fund_analytics a
     JOIN funds f ON f.scheme_code = a.scheme_code
     LEFT JOIN LATERAL (
         SELECT nav_value, nav_date FROM nav_history nh
         WHERE nh.scheme_code = f.scheme_code
         ORDER BY nav_date DESC LIMIT 1
     ) n ON TRUE
     WHERE f.category = $1 AND a.window_label = $2";

pub async fn rank_funds_by_median_return(
    ex: impl PgExecutor<'_>,
    category: &str,
    window_label: &str,
    limit: i32,
) -> anyhow::Result<Vec<RankedFund>> {
    let sql = format!(
        "{RANK_FUNDS_SELECT} AND a.rolling_median IS NOT NULL
         ORDER BY a.rolling_median DESC LIMIT $3"
    );
    let rows = sqlx::query_as::<_, RankedFund>(&sql)
        .bind(category)
        .bind(window_label)
        .bind(limit)
        .fetch_all(ex)
        .await?;
    Ok(rows)
}

pub async fn rank_funds_by_max_drawdown(
    ex: impl PgExecutor<'_>,
    category: &str,
    window_label: &str,
    limit: i32,
) -> anyhow::Result<Vec<RankedFund>> {
    // Drawdowns are <= 0; "best" is the shallowest, i.e. the largest value.
    let sql = format!(
        "{RANK_FUNDS_SELECT} AND a.max_drawdown IS NOT NULL
         ORDER BY a.max_drawdown DESC LIMIT $3"
    );
    let rows = sqlx::query_as::<_, RankedFund>(&sql)
        .bind(category)
        .bind(window_label)
        .bind(limit)
        .fetch_all(ex)
        .await?;
    Ok(rows)
}

// ── Sync runs ────────────────────────────────────────────────────

pub async fn create_sync_run(
    ex: impl PgExecutor<'_>,
    run_id: Uuid,
    run_type: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO sync_runs (run_id, run_type, status, started_at)
         VALUES ($1, $2, 'RUNNING', now())",
    )
    .bind(run_id)
    .bind(run_type)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn latest_running_run(ex: impl PgExecutor<'_>) -> anyhow::Result<Option<SyncRun>> {
    let row = sqlx::query_as::<_, SyncRun>(
        "SELECT * FROM sync_runs WHERE status = 'RUNNING'
         ORDER BY started_at DESC LIMIT 1",
    )
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn latest_run(ex: impl PgExecutor<'_>) -> anyhow::Result<Option<SyncRun>> {
    let row =
        sqlx::query_as::<_, SyncRun>("SELECT * FROM sync_runs ORDER BY started_at DESC LIMIT 1")
            .fetch_optional(ex)
            .await?;
    Ok(row)
}

pub async fn finish_sync_run_success(ex: impl PgExecutor<'_>, run_id: Uuid) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE sync_runs SET status = 'SUCCEEDED', finished_at = now()
         WHERE run_id = $1 AND status = 'RUNNING'",
    )
    .bind(run_id)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn finish_sync_run_failure(
    ex: impl PgExecutor<'_>,
    run_id: Uuid,
    error_summary: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE sync_runs SET status = 'FAILED', finished_at = now(), error_summary = $2
         WHERE run_id = $1 AND status = 'RUNNING'",
    )
    .bind(run_id)
    .bind(error_summary)
    .execute(ex)
    .await?;
    Ok(())
}

// ── Sync state ───────────────────────────────────────────────────

/// Manual runs re-verify everything that is not currently being worked on.
pub async fn reset_all_sync_state_to_pending(ex: impl PgExecutor<'_>) -> anyhow::Result<u64> {
    let res = sqlx::query("UPDATE sync_state SET status = 'PENDING' WHERE status <> 'IN_PROGRESS'")
        .execute(ex)
        .await?;
    Ok(res.rows_affected())
}

/// Incremental runs only revisit schemes that have been attempted before.
pub async fn reset_attempted_sync_state_to_pending(ex: impl PgExecutor<'_>) -> anyhow::Result<u64> {
    let res = sqlx::query(
        "UPDATE sync_state SET status = 'PENDING' WHERE status IN ('SUCCEEDED', 'FAILED')",
    )
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

/// Requeue schemes left IN_PROGRESS by crashed workers.
pub async fn requeue_stale_in_progress(
    ex: impl PgExecutor<'_>,
    cutoff: DateTime<Utc>,
) -> anyhow::Result<u64> {
    let res = sqlx::query(
        "UPDATE sync_state SET status = 'PENDING', last_attempt_at = NULL
         WHERE status = 'IN_PROGRESS' AND last_attempt_at < $1",
    )
    .bind(cutoff)
    .execute(ex)
    .await?;
    Ok(res.rows_affected())
}

/// Claim one PENDING scheme. SKIP LOCKED keeps concurrent workers from
/// grabbing the same row. Returns the claimed row (pre-claim metadata,
/// status already flipped to IN_PROGRESS).
pub async fn claim_next_pending(ex: impl PgExecutor<'_>) -> anyhow::Result<Option<SyncState>> {
    let row = sqlx::query_as::<_, SyncState>(
        "UPDATE sync_state SET status = 'IN_PROGRESS', last_attempt_at = now()
         WHERE scheme_code = (
             SELECT scheme_code FROM sync_state
             WHERE status = 'PENDING'
             ORDER BY scheme_code
             FOR UPDATE SKIP LOCKED
             LIMIT 1
         )
         RETURNING scheme_code, status, last_synced_date, retry_count, last_error, last_attempt_at",
    )
    .fetch_optional(ex)
    .await?;
    Ok(row)
}

pub async fn mark_sync_state_succeeded(
    ex: impl PgExecutor<'_>,
    scheme_code: &str,
    last_synced_date: Option<NaiveDate>,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE sync_state SET status = 'SUCCEEDED', last_synced_date = $2, last_error = NULL
         WHERE scheme_code = $1",
    )
    .bind(scheme_code)
    .bind(last_synced_date)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn mark_sync_state_failed(
    ex: impl PgExecutor<'_>,
    scheme_code: &str,
    last_error: &str,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE sync_state SET status = 'FAILED', retry_count = retry_count + 1, last_error = $2
         WHERE scheme_code = $1",
    )
    .bind(scheme_code)
    .bind(last_error)
    .execute(ex)
    .await?;
    Ok(())
}

pub async fn count_sync_state_by_status(
    ex: impl PgExecutor<'_>,
) -> anyhow::Result<Vec<(String, i64)>> {
    let rows = sqlx::query_as::<_, (String, i64)>(
        "SELECT status, COUNT(*) FROM sync_state GROUP BY status",
    )
    .fetch_all(ex)
    .await?;
    Ok(rows)
}

pub async fn list_sync_state(ex: impl PgExecutor<'_>) -> anyhow::Result<Vec<SyncState>> {
    let rows = sqlx::query_as::<_, SyncState>("SELECT * FROM sync_state ORDER BY scheme_code")
        .fetch_all(ex)
        .await?;
    Ok(rows)
}

// ── Rate limiter state ───────────────────────────────────────────

/// Make sure a lockable row exists for the window; never touches live counts.
pub async fn init_rate_limiter_state(
    ex: impl PgExecutor<'_>,
    window_type: &str,
    window_start: DateTime<Utc>,
) -> anyhow::Result<()> {
    sqlx::query(
        "INSERT INTO rate_limiter_state (window_type, window_start, request_count)
         VALUES ($1, $2, 0)
         ON CONFLICT (window_type) DO NOTHING",
    )
    .bind(window_type)
    .bind(window_start)
    .execute(ex)
    .await?;
    Ok(())
}

/// Read-and-lock one window row; the row lock is held until the enclosing
/// transaction commits or rolls back.
pub async fn lock_rate_limiter_state(
    ex: impl PgExecutor<'_>,
    window_type: &str,
) -> anyhow::Result<RateLimiterState> {
    let row = sqlx::query_as::<_, RateLimiterState>(
        "SELECT window_type, window_start, request_count
         FROM rate_limiter_state WHERE window_type = $1 FOR UPDATE",
    )
    .bind(window_type)
    .fetch_one(ex)
    .await?;
    Ok(row)
}

pub async fn update_rate_limiter_state(
    ex: impl PgExecutor<'_>,
    window_type: &str,
    window_start: DateTime<Utc>,
    request_count: i32,
) -> anyhow::Result<()> {
    sqlx::query(
        "UPDATE rate_limiter_state SET window_start = $2, request_count = $3
         WHERE window_type = $1",
    )
    .bind(window_type)
    .bind(window_start)
    .bind(request_count)
    .execute(ex)
    .await?;
    Ok(())
}
