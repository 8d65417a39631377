//! End-to-end sync orchestration tests against a real Postgres and a stub
//! upstream served on an ephemeral port.
//!
//! Gated on TEST_DATABASE_URL. The sync tables are shared global state, so
//! the tests in this file serialize on a mutex.

use std::env;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::Path;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;

use mf_analytics::mfapi::MfApiClient;
use mf_analytics::ratelimiter::{RateLimiter, WindowConfig};
use mf_analytics::sync::{
    enqueue_incremental_run, enqueue_manual_run, EnqueueOutcome, SyncRunner,
};

static DB_GUARD: Mutex<()> = Mutex::const_new(());

async fn test_pool() -> Option<PgPool> {
    let Ok(dsn) = env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set; skipping integration test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&dsn)
        .await
        .expect("connect test database");
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("apply migrations");
    Some(pool)
}

async fn reset_sync_tables(pool: &PgPool) {
    for table in ["sync_runs", "sync_state", "nav_history", "fund_analytics", "funds"] {
        sqlx::query(&format!("DELETE FROM {table}"))
            .execute(pool)
            .await
            .expect("reset table");
    }
}

async fn seed_scheme(pool: &PgPool, scheme_code: &str) {
    sqlx::query("INSERT INTO sync_state (scheme_code) VALUES ($1)")
        .bind(scheme_code)
        .execute(pool)
        .await
        .expect("seed scheme");
}

/// Stub provider: 5001 always fails with a 500, 5003 has a single NAV
/// observation, everything else gets three days of history.
async fn spawn_stub_upstream() -> String {
    let app = Router::new().route(
        "/mf/{code}",
        get(|Path(code): Path<i64>| async move {
            match code {
                5001 => (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
                5003 => Json(serde_json::json!({
                    "meta": {
                        "fund_house": "Stub AMC",
                        "scheme_category": "Equity - Mid Cap",
                        "scheme_code": code,
                        "scheme_name": "Stub Single Point Fund"
                    },
                    "data": [
                        {"date": "11-01-2024", "nav": "10.00"}
                    ]
                }))
                .into_response(),
                _ => Json(serde_json::json!({
                    "meta": {
                        "fund_house": "Stub AMC",
                        "scheme_category": "Equity - Large Cap",
                        "scheme_code": code,
                        "scheme_name": "Stub Growth Fund"
                    },
                    "data": [
                        {"date": "09-01-2024", "nav": "41.00"},
                        {"date": "10-01-2024", "nav": "42.10"},
                        {"date": "11-01-2024", "nav": "42.50"}
                    ]
                }))
                .into_response(),
            }
        }),
    );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind stub upstream");
    let addr = listener.local_addr().expect("stub addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("stub upstream");
    });
    format!("http://{addr}")
}

fn runner_for(pool: &PgPool, base_url: &str, key: &str) -> SyncRunner {
    let limiter = Arc::new(
        RateLimiter::new(
            pool.clone(),
            vec![WindowConfig {
                window_type: key.into(),
                duration: Duration::from_secs(1),
                limit: 1000,
            }],
        )
        .unwrap(),
    );
    let client = MfApiClient::new(base_url, Duration::from_secs(5), limiter).unwrap();
    SyncRunner::new(pool.clone(), client, Duration::from_secs(15 * 60))
}

async fn sync_state_row(
    pool: &PgPool,
    scheme_code: &str,
) -> (String, Option<NaiveDate>, i32, Option<String>) {
    sqlx::query_as(
        "SELECT status, last_synced_date, retry_count, last_error
         FROM sync_state WHERE scheme_code = $1",
    )
    .bind(scheme_code)
    .fetch_one(pool)
    .await
    .expect("sync_state row")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[tokio::test]
async fn manual_run_drains_with_partial_failures() {
    let _guard = DB_GUARD.lock().await;
    let Some(pool) = test_pool().await else {
        return;
    };
    reset_sync_tables(&pool).await;
    for code in ["5001", "5002", "5003"] {
        seed_scheme(&pool, code).await;
    }

    let base_url = spawn_stub_upstream().await;

    // First enqueue wins; the second sees the conflict and gets the same id.
    let EnqueueOutcome::Accepted(run_id) = enqueue_manual_run(&pool).await.unwrap() else {
        panic!("expected a fresh run");
    };
    match enqueue_manual_run(&pool).await.unwrap() {
        EnqueueOutcome::AlreadyRunning(existing) => assert_eq!(existing, run_id),
        EnqueueOutcome::Accepted(_) => panic!("second enqueue must conflict"),
    }

    let runner = runner_for(&pool, &base_url, "sf_manual");
    assert!(runner.run_latest().await.unwrap());

    // Upstream 500 is a soft per-scheme failure.
    let (status, last_synced, retries, last_error) = sync_state_row(&pool, "5001").await;
    assert_eq!(status, "FAILED");
    assert_eq!(retries, 1);
    assert!(last_synced.is_none());
    assert!(last_error.unwrap().contains("http 500"));

    // Healthy scheme lands with NAVs, analytics, and fund metadata.
    let (status, last_synced, retries, last_error) = sync_state_row(&pool, "5002").await;
    assert_eq!(status, "SUCCEEDED");
    assert_eq!(last_synced, Some(date(2024, 1, 11)));
    assert_eq!(retries, 0);
    assert!(last_error.is_none());

    let navs: Vec<(NaiveDate, Decimal)> = sqlx::query_as(
        "SELECT nav_date, nav_value FROM nav_history WHERE scheme_code = '5002' ORDER BY nav_date",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    assert_eq!(navs.len(), 3);
    assert_eq!(navs[2].0, date(2024, 1, 11));
    assert_eq!(navs[2].1, Decimal::new(4250, 2));

    let analytics: Vec<(String, i32, i32, Option<Decimal>)> = sqlx::query_as(
        "SELECT window_label, nav_points, rolling_periods, rolling_median
         FROM fund_analytics WHERE scheme_code = '5002' ORDER BY window_label",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    // A row per window even though three days of history can't fill any of
    // them: availability populated, metrics NULL.
    assert_eq!(analytics.len(), 4);
    for (_, nav_points, rolling_periods, rolling_median) in &analytics {
        assert_eq!(*nav_points, 3);
        assert_eq!(*rolling_periods, 0);
        assert!(rolling_median.is_none());
    }

    let fund_name: String =
        sqlx::query_scalar("SELECT scheme_name FROM funds WHERE scheme_code = '5002'")
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(fund_name, "Stub Growth Fund");

    // A single usable observation is not analyzable.
    let (status, _, retries, last_error) = sync_state_row(&pool, "5003").await;
    assert_eq!(status, "FAILED");
    assert_eq!(retries, 1);
    assert!(last_error.unwrap().contains("insufficient usable nav points"));

    // Two failed schemes fail the run as a whole.
    let (run_status, summary): (String, Option<String>) =
        sqlx::query_as("SELECT status, error_summary FROM sync_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(run_status, "FAILED");
    assert_eq!(summary.as_deref(), Some("2 scheme(s) failed"));

    // Finalization is terminal: nothing RUNNING remains to pick up.
    assert!(!runner.run_latest().await.unwrap());
}

#[tokio::test]
async fn incremental_run_revisits_only_attempted_schemes() {
    let _guard = DB_GUARD.lock().await;
    let Some(pool) = test_pool().await else {
        return;
    };
    reset_sync_tables(&pool).await;
    for code in ["5001", "5002", "5004"] {
        seed_scheme(&pool, code).await;
    }
    // 5002 synced before, 5001 failed before; 5004 was never attempted.
    sqlx::query(
        "UPDATE sync_state SET status = 'SUCCEEDED', last_synced_date = '2024-01-11'
         WHERE scheme_code = '5002'",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query(
        "UPDATE sync_state SET status = 'FAILED', retry_count = 1, last_error = 'earlier failure'
         WHERE scheme_code = '5001'",
    )
    .execute(&pool)
    .await
    .unwrap();

    let base_url = spawn_stub_upstream().await;

    let EnqueueOutcome::Accepted(run_id) = enqueue_incremental_run(&pool).await.unwrap() else {
        panic!("expected a fresh run");
    };

    // Never-attempted schemes stay out of incremental runs.
    let (status, ..) = sync_state_row(&pool, "5004").await;
    assert_eq!(status, "PENDING");
    let never_attempted_pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM sync_state WHERE status = 'PENDING' AND scheme_code <> '5004'",
    )
    .fetch_one(&pool)
    .await
    .unwrap();
    assert_eq!(never_attempted_pending, 2);

    // 5004 was seeded PENDING, so exclude it from the drain by flipping it
    // out of the queue; incremental enqueue itself never touched it.
    sqlx::query("UPDATE sync_state SET status = 'SUCCEEDED' WHERE scheme_code = '5004'")
        .execute(&pool)
        .await
        .unwrap();

    let runner = runner_for(&pool, &base_url, "sf_incremental");
    assert!(runner.run_latest().await.unwrap());

    // Upstream had nothing newer than 2024-01-11: the scheme re-stamps
    // SUCCEEDED with an unchanged watermark.
    let (status, last_synced, retries, _) = sync_state_row(&pool, "5002").await;
    assert_eq!(status, "SUCCEEDED");
    assert_eq!(last_synced, Some(date(2024, 1, 11)));
    assert_eq!(retries, 0);

    // The previously failed scheme was retried (backfill: no watermark) and
    // failed again, bumping retry_count.
    let (status, _, retries, _) = sync_state_row(&pool, "5001").await;
    assert_eq!(status, "FAILED");
    assert_eq!(retries, 2);

    let (run_status, summary): (String, Option<String>) =
        sqlx::query_as("SELECT status, error_summary FROM sync_runs WHERE run_id = $1")
            .bind(run_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(run_status, "FAILED");
    assert_eq!(summary.as_deref(), Some("1 scheme(s) failed"));
}

#[tokio::test]
async fn stale_in_progress_schemes_are_requeued() {
    let _guard = DB_GUARD.lock().await;
    let Some(pool) = test_pool().await else {
        return;
    };
    reset_sync_tables(&pool).await;
    seed_scheme(&pool, "5002").await;

    // A crashed worker left the scheme claimed 30 minutes ago.
    sqlx::query(
        "UPDATE sync_state SET status = 'IN_PROGRESS',
         last_attempt_at = now() - interval '30 minutes'
         WHERE scheme_code = '5002'",
    )
    .execute(&pool)
    .await
    .unwrap();

    let base_url = spawn_stub_upstream().await;
    let EnqueueOutcome::Accepted(_) = enqueue_manual_run(&pool).await.unwrap() else {
        panic!("expected a fresh run");
    };

    // Manual enqueue must leave IN_PROGRESS rows alone...
    let (status, ..) = sync_state_row(&pool, "5002").await;
    assert_eq!(status, "IN_PROGRESS");

    // ...but the drain's staleness sweep requeues and completes it.
    let runner = runner_for(&pool, &base_url, "sf_stale");
    assert!(runner.run_latest().await.unwrap());

    let (status, last_synced, _, _) = sync_state_row(&pool, "5002").await;
    assert_eq!(status, "SUCCEEDED");
    assert_eq!(last_synced, Some(date(2024, 1, 11)));
}
