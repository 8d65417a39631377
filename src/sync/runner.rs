//! The worker drain loop.
//!
//! `run_latest` picks up the current RUNNING run, requeues stale claims left
//! behind by crashed workers, then claims PENDING schemes one at a time and
//! syncs each through the upstream client and the analytics kernel.
//! Per-scheme failures are soft: the scheme is marked FAILED and the loop
//! moves on. Only store errors in the claim/requeue/finalize path abort the
//! iteration, leaving the run RUNNING for the next worker poll.

use std::str::FromStr;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{Days, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{info, warn};

use crate::analytics;
use crate::db::models::SyncState;
use crate::db::queries;
use crate::error::ServiceError;
use crate::mfapi::{MfApiClient, SchemeResponse};

pub struct SyncRunner {
    pool: PgPool,
    client: MfApiClient,
    stale_after: Duration,
}

impl SyncRunner {
    pub fn new(pool: PgPool, client: MfApiClient, stale_after: Duration) -> Self {
        let stale_after = if stale_after.is_zero() {
            Duration::from_secs(15 * 60)
        } else {
            stale_after
        };
        Self {
            pool,
            client,
            stale_after,
        }
    }

    /// Drain the current RUNNING run to completion and finalize it.
    /// Returns false immediately when no run is RUNNING.
    pub async fn run_latest(&self) -> anyhow::Result<bool> {
        let Some(run) = queries::latest_running_run(&self.pool).await? else {
            return Ok(false);
        };
        info!(run_id = %run.run_id, run_type = %run.run_type, "sync run picked up");

        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.stale_after).unwrap_or(chrono::Duration::zero());
        let requeued = queries::requeue_stale_in_progress(&self.pool, cutoff).await?;
        if requeued > 0 {
            warn!(requeued, "requeued stale in-progress schemes");
        }

        loop {
            let Some(state) = queries::claim_next_pending(&self.pool).await? else {
                break;
            };
            info!(
                scheme_code = %state.scheme_code,
                run_type = %run.run_type,
                has_prior_sync = state.last_synced_date.is_some(),
                "claimed scheme"
            );

            let outcome = match run.run_type.as_str() {
                // MANUAL goes through the incremental path too; it falls back
                // to a full backfill when the scheme was never synced.
                "INCREMENTAL" | "MANUAL" => self.sync_incremental(&state).await,
                _ => self.sync_backfill(&state).await,
            };

            match outcome {
                Ok(()) => info!(scheme_code = %state.scheme_code, "scheme synced"),
                // Soft failure: recorded on sync_state, run keeps draining.
                Err(e) => warn!(scheme_code = %state.scheme_code, error = %e, "scheme failed"),
            }
        }

        let counts = queries::count_sync_state_by_status(&self.pool).await?;
        let failed = counts
            .iter()
            .find(|(status, _)| status == "FAILED")
            .map(|(_, count)| *count)
            .unwrap_or(0);

        if failed > 0 {
            warn!(run_id = %run.run_id, failed, "sync run finished with failures");
            queries::finish_sync_run_failure(
                &self.pool,
                run.run_id,
                &format!("{failed} scheme(s) failed"),
            )
            .await?;
        } else {
            info!(run_id = %run.run_id, "sync run finished");
            queries::finish_sync_run_success(&self.pool, run.run_id).await?;
        }

        Ok(true)
    }

    /// Sync only the days after `last_synced_date`. Schemes that were never
    /// synced delegate to the full backfill.
    async fn sync_incremental(&self, state: &SyncState) -> anyhow::Result<()> {
        let Some(last_synced) = state.last_synced_date else {
            return self.sync_backfill(state).await;
        };

        let scheme_code = match parse_scheme_code(&state.scheme_code) {
            Ok(code) => code,
            Err(e) => return self.fail_scheme(state, e).await,
        };

        let start = last_synced + Days::new(1);
        let end = Utc::now().date_naive();
        // startDate/endDate are inclusive; nothing to fetch when start passes end.
        if start > end {
            return queries::mark_sync_state_succeeded(
                &self.pool,
                &state.scheme_code,
                Some(last_synced),
            )
            .await;
        }

        let resp = match self.client.get_scheme_range(scheme_code, start, end).await {
            Ok(resp) => resp,
            Err(e) => return self.fail_scheme(state, e).await,
        };

        let max_date = match self.ingest(state, &resp, Some(last_synced)).await {
            Ok(max_date) => max_date,
            Err(e) => return self.fail_scheme(state, e).await,
        };

        if let Err(e) = analytics::compute_and_upsert(&self.pool, &state.scheme_code).await {
            return self.fail_scheme(state, e.context("compute analytics")).await;
        }

        queries::mark_sync_state_succeeded(&self.pool, &state.scheme_code, max_date).await
    }

    /// Fetch and store the full NAV history for one scheme.
    async fn sync_backfill(&self, state: &SyncState) -> anyhow::Result<()> {
        let scheme_code = match parse_scheme_code(&state.scheme_code) {
            Ok(code) => code,
            Err(e) => return self.fail_scheme(state, e).await,
        };

        let resp = match self.client.get_scheme(scheme_code).await {
            Ok(resp) => resp,
            Err(e) => return self.fail_scheme(state, e).await,
        };

        if resp.data.is_empty() {
            // Scheme exists upstream but carries no observations.
            return self
                .fail_scheme(state, anyhow!("no nav data returned"))
                .await;
        }

        let max_date = match self.ingest(state, &resp, None).await {
            Ok(max_date) => max_date,
            Err(e) => return self.fail_scheme(state, e).await,
        };

        if let Err(e) = analytics::compute_and_upsert(&self.pool, &state.scheme_code).await {
            return self.fail_scheme(state, e.context("compute analytics")).await;
        }

        queries::mark_sync_state_succeeded(&self.pool, &state.scheme_code, max_date).await
    }

    /// Parse and upsert every returned NAV row, refresh the fund metadata,
    /// and report the largest NAV date seen (seeded with any prior date).
    async fn ingest(
        &self,
        state: &SyncState,
        resp: &SchemeResponse,
        prior: Option<NaiveDate>,
    ) -> anyhow::Result<Option<NaiveDate>> {
        let mut max_date = prior;

        for row in &resp.data {
            let date = NaiveDate::parse_from_str(&row.date, "%d-%m-%Y")
                .map_err(|e| ServiceError::Parse(format!("parse date {:?}: {e}", row.date)))?;
            let value = Decimal::from_str(&row.nav)
                .map_err(|e| ServiceError::Parse(format!("parse nav {:?}: {e}", row.nav)))?;

            queries::upsert_nav_point(&self.pool, &state.scheme_code, date, value).await?;

            if max_date.map_or(true, |m| date > m) {
                max_date = Some(date);
            }
        }

        queries::upsert_fund(
            &self.pool,
            &state.scheme_code,
            &resp.meta.scheme_name,
            &resp.meta.fund_house,
            &resp.meta.scheme_category,
        )
        .await?;

        Ok(max_date)
    }

    /// Record the failure on sync_state and hand the cause back to the loop.
    /// The bookkeeping write is best-effort: if it fails too, the original
    /// cause still wins.
    async fn fail_scheme(&self, state: &SyncState, cause: anyhow::Error) -> anyhow::Result<()> {
        // `{:#}` flattens the context chain into one line for last_error.
        let message = format!("{cause:#}");
        if let Err(e) =
            queries::mark_sync_state_failed(&self.pool, &state.scheme_code, &message).await
        {
            warn!(scheme_code = %state.scheme_code, error = %e, "failed to record scheme failure");
        }
        Err(cause)
    }
}

fn parse_scheme_code(raw: &str) -> anyhow::Result<i64> {
    raw.parse::<i64>()
        .map_err(|e| ServiceError::Parse(format!("invalid scheme_code {raw:?}: {e}")).into())
}
