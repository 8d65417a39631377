//! HTTP route handlers for the read API.
//!
//! Dates serialize as `YYYY-MM-DD`, timestamps as RFC 3339 UTC, and metric
//! values as nullable numbers; everything is snake_case JSON.

use std::collections::BTreeMap;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::db::queries;
use crate::sync::{enqueue_manual_run, EnqueueOutcome};

use super::server::AppState;

/// Build all API routes.
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/funds", get(funds_list))
        .route("/funds/rank", get(funds_rank))
        .route("/funds/{code}", get(fund_details))
        .route("/funds/{code}/analytics", get(fund_analytics))
        .route("/sync/trigger", post(sync_trigger))
        .route("/sync/status", get(sync_status))
        .route("/health", get(health))
}

fn error_json(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message.into() })))
}

fn internal_error(err: anyhow::Error) -> (StatusCode, Json<Value>) {
    error_json(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

fn decimal_f64(d: Option<Decimal>) -> Option<f64> {
    d.and_then(|v| v.to_f64())
}

const VALID_WINDOWS: [&str; 4] = ["1Y", "3Y", "5Y", "10Y"];

fn is_valid_window(window: &str) -> bool {
    VALID_WINDOWS.contains(&window)
}

// ── Funds ────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct FundsListParams {
    category: Option<String>,
    amc: Option<String>,
}

/// GET /funds — list known funds, optionally filtered by category and AMC.
async fn funds_list(
    State(state): State<AppState>,
    Query(params): Query<FundsListParams>,
) -> (StatusCode, Json<Value>) {
    match queries::list_funds(
        &state.db,
        params.category.as_deref(),
        params.amc.as_deref(),
    )
    .await
    {
        Ok(funds) => (StatusCode::OK, Json(json!({ "funds": funds }))),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Serialize)]
struct FundDetailsResponse {
    scheme_code: String,
    scheme_name: String,
    amc: String,
    category: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest_nav: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nav_date: Option<NaiveDate>,
}

/// GET /funds/{code} — one fund plus its most recent NAV.
async fn fund_details(
    State(state): State<AppState>,
    Path(code): Path<String>,
) -> Result<Json<FundDetailsResponse>, (StatusCode, Json<Value>)> {
    let fund = queries::get_fund(&state.db, &code)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| error_json(StatusCode::NOT_FOUND, "fund not found"))?;

    let mut out = FundDetailsResponse {
        scheme_code: fund.scheme_code,
        scheme_name: fund.scheme_name,
        amc: fund.amc,
        category: fund.category,
        latest_nav: None,
        nav_date: None,
    };

    if let Ok(Some(nav)) = queries::get_latest_nav(&state.db, &code).await {
        out.latest_nav = nav.nav_value.to_f64();
        out.nav_date = Some(nav.nav_date);
    }

    Ok(Json(out))
}

// ── Analytics ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AnalyticsParams {
    #[serde(default)]
    window: String,
}

#[derive(Debug, Default, Serialize)]
struct DataAvailability {
    #[serde(skip_serializing_if = "Option::is_none")]
    start_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_days: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    nav_data_points: Option<i32>,
}

#[derive(Debug, Default, Serialize)]
struct RollingReturns {
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    median: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p25: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    p75: Option<f64>,
}

#[derive(Debug, Default, Serialize)]
struct CagrStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    median: Option<f64>,
}

#[derive(Debug, Serialize)]
struct FundAnalyticsResponse {
    fund_code: String,
    fund_name: String,
    category: String,
    amc: String,
    window: String,
    data_availability: DataAvailability,
    rolling_periods_analyzed: i32,
    rolling_returns: RollingReturns,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_drawdown: Option<f64>,
    cagr: CagrStats,
    computed_at: DateTime<Utc>,
}

/// GET /funds/{code}/analytics?window=1Y|3Y|5Y|10Y
async fn fund_analytics(
    State(state): State<AppState>,
    Path(code): Path<String>,
    Query(params): Query<AnalyticsParams>,
) -> Result<Json<FundAnalyticsResponse>, (StatusCode, Json<Value>)> {
    let window = params.window.trim();
    if !is_valid_window(window) {
        return Err(error_json(
            StatusCode::BAD_REQUEST,
            "window must be one of 1Y|3Y|5Y|10Y",
        ));
    }

    let fund = queries::get_fund(&state.db, &code)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| error_json(StatusCode::NOT_FOUND, "fund not found"))?;

    let analytics = queries::get_fund_analytics(&state.db, &code, window)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| error_json(StatusCode::NOT_FOUND, "analytics not computed yet"))?;

    let total_days =
        (analytics.data_end_date - analytics.data_start_date).num_days() + 1;

    Ok(Json(FundAnalyticsResponse {
        fund_code: code,
        fund_name: fund.scheme_name,
        category: fund.category,
        amc: fund.amc,
        window: window.to_string(),
        data_availability: DataAvailability {
            start_date: Some(analytics.data_start_date),
            end_date: Some(analytics.data_end_date),
            total_days: Some(total_days),
            nav_data_points: Some(analytics.nav_points),
        },
        rolling_periods_analyzed: analytics.rolling_periods,
        rolling_returns: RollingReturns {
            min: decimal_f64(analytics.rolling_min),
            max: decimal_f64(analytics.rolling_max),
            median: decimal_f64(analytics.rolling_median),
            p25: decimal_f64(analytics.rolling_p25),
            p75: decimal_f64(analytics.rolling_p75),
        },
        max_drawdown: decimal_f64(analytics.max_drawdown),
        cagr: CagrStats {
            min: decimal_f64(analytics.cagr_min),
            max: decimal_f64(analytics.cagr_max),
            median: decimal_f64(analytics.cagr_median),
        },
        computed_at: analytics.computed_at,
    }))
}

// ── Ranking ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RankParams {
    #[serde(default)]
    category: String,
    #[serde(default)]
    window: String,
    sort_by: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Serialize)]
struct RankedFundEntry {
    rank: usize,
    fund_code: String,
    fund_name: String,
    amc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    median_return: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_drawdown: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    current_nav: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_updated: Option<NaiveDate>,
}

#[derive(Debug, Serialize)]
struct RankResponse {
    category: String,
    window: String,
    sorted_by: String,
    total_funds: i64,
    showing: usize,
    funds: Vec<RankedFundEntry>,
}

/// GET /funds/rank?category=..&window=..&sort_by=..&limit=N
async fn funds_rank(
    State(state): State<AppState>,
    Query(params): Query<RankParams>,
) -> Result<Json<RankResponse>, (StatusCode, Json<Value>)> {
    let category = params.category.trim();
    let window = params.window.trim();
    if category.is_empty() {
        return Err(error_json(StatusCode::BAD_REQUEST, "category is required"));
    }
    if !is_valid_window(window) {
        return Err(error_json(
            StatusCode::BAD_REQUEST,
            "window must be one of 1Y|3Y|5Y|10Y",
        ));
    }

    let sort_by = params.sort_by.as_deref().unwrap_or("median_return");
    if sort_by != "median_return" && sort_by != "max_drawdown" {
        return Err(error_json(
            StatusCode::BAD_REQUEST,
            "sort_by must be one of median_return|max_drawdown",
        ));
    }

    let limit = match params.limit.as_deref() {
        None | Some("") => 5,
        Some(raw) => match raw.parse::<i32>() {
            Ok(v) if v > 0 => v,
            _ => {
                return Err(error_json(
                    StatusCode::BAD_REQUEST,
                    "limit must be a positive integer",
                ))
            }
        },
    };

    let total_funds = queries::count_funds_by_category(&state.db, category)
        .await
        .map_err(internal_error)?;

    let rows = if sort_by == "max_drawdown" {
        queries::rank_funds_by_max_drawdown(&state.db, category, window, limit).await
    } else {
        queries::rank_funds_by_median_return(&state.db, category, window, limit).await
    }
    .map_err(internal_error)?;

    let funds: Vec<RankedFundEntry> = rows
        .into_iter()
        .enumerate()
        .map(|(i, row)| RankedFundEntry {
            rank: i + 1,
            fund_code: row.scheme_code,
            fund_name: row.scheme_name,
            amc: row.amc,
            median_return: decimal_f64(row.rolling_median),
            max_drawdown: decimal_f64(row.max_drawdown),
            current_nav: decimal_f64(row.current_nav),
            last_updated: row.last_updated,
        })
        .collect();

    Ok(Json(RankResponse {
        category: category.to_string(),
        window: window.to_string(),
        sorted_by: sort_by.to_string(),
        total_funds,
        showing: funds.len(),
        funds,
    }))
}

// ── Sync control ─────────────────────────────────────────────────

/// POST /sync/trigger — enqueue a manual run.
/// 202 with the new run id, or 409 with the id of the run already active.
async fn sync_trigger(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    match enqueue_manual_run(&state.db).await {
        Ok(EnqueueOutcome::Accepted(run_id)) => {
            (StatusCode::ACCEPTED, Json(json!({ "run_id": run_id })))
        }
        Ok(EnqueueOutcome::AlreadyRunning(run_id)) => (
            StatusCode::CONFLICT,
            Json(json!({
                "error": "a sync run is already running",
                "run_id": run_id,
            })),
        ),
        Err(e) => internal_error(e),
    }
}

#[derive(Debug, Default, Serialize)]
struct LatestRun {
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<uuid::Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error_summary: Option<String>,
}

#[derive(Debug, Serialize)]
struct SchemeStatus {
    scheme_code: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_synced_date: Option<NaiveDate>,
    retry_count: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
struct SyncStatusResponse {
    latest_run: LatestRun,
    counts: BTreeMap<String, i64>,
    schemes: Vec<SchemeStatus>,
}

/// GET /sync/status — latest run, per-status counts, full per-scheme list.
async fn sync_status(
    State(state): State<AppState>,
) -> Result<Json<SyncStatusResponse>, (StatusCode, Json<Value>)> {
    let mut out = SyncStatusResponse {
        latest_run: LatestRun::default(),
        counts: BTreeMap::new(),
        schemes: Vec::new(),
    };

    if let Some(run) = queries::latest_run(&state.db).await.map_err(internal_error)? {
        out.latest_run = LatestRun {
            run_id: Some(run.run_id),
            run_type: Some(run.run_type),
            status: Some(run.status),
            started_at: Some(run.started_at),
            finished_at: run.finished_at,
            error_summary: run.error_summary,
        };
    }

    for (status, count) in queries::count_sync_state_by_status(&state.db)
        .await
        .map_err(internal_error)?
    {
        out.counts.insert(status, count);
    }

    out.schemes = queries::list_sync_state(&state.db)
        .await
        .map_err(internal_error)?
        .into_iter()
        .map(|st| SchemeStatus {
            scheme_code: st.scheme_code,
            status: st.status,
            last_synced_date: st.last_synced_date,
            retry_count: st.retry_count,
            last_error: st.last_error,
            last_attempt_at: st.last_attempt_at,
        })
        .collect();

    Ok(Json(out))
}

/// GET /health — simple liveness probe.
async fn health(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match crate::db::pool::health_check(&state.db).await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(_) => (StatusCode::SERVICE_UNAVAILABLE, "db unavailable"),
    }
}
