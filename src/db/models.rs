//! Database row types for all tables.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Fund {
    pub scheme_code: String,
    pub scheme_name: String,
    pub amc: String,
    pub category: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct NavPoint {
    pub scheme_code: String,
    pub nav_date: NaiveDate,
    pub nav_value: Decimal,
}

#[derive(Debug, Clone, FromRow)]
pub struct FundAnalytics {
    pub scheme_code: String,
    pub window_label: String,
    pub rolling_min: Option<Decimal>,
    pub rolling_max: Option<Decimal>,
    pub rolling_median: Option<Decimal>,
    pub rolling_p25: Option<Decimal>,
    pub rolling_p75: Option<Decimal>,
    pub max_drawdown: Option<Decimal>,
    pub cagr_min: Option<Decimal>,
    pub cagr_max: Option<Decimal>,
    pub cagr_median: Option<Decimal>,
    pub data_start_date: NaiveDate,
    pub data_end_date: NaiveDate,
    pub nav_points: i32,
    pub rolling_periods: i32,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncRun {
    pub run_id: Uuid,
    pub run_type: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error_summary: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct SyncState {
    pub scheme_code: String,
    pub status: String,
    pub last_synced_date: Option<NaiveDate>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct RateLimiterState {
    pub window_type: String,
    pub window_start: DateTime<Utc>,
    pub request_count: i32,
}

/// One row of the category ranking query (fund identity + the metrics it is
/// ranked by, plus the most recent NAV).
#[derive(Debug, Clone, FromRow)]
pub struct RankedFund {
    pub scheme_code: String,
    pub scheme_name: String,
    pub amc: String,
    pub rolling_median: Option<Decimal>,
    pub max_drawdown: Option<Decimal>,
    pub current_nav: Option<Decimal>,
    pub last_updated: Option<NaiveDate>,
}
