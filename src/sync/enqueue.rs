//! Transactional creation of sync runs.
//!
//! Both entry points run a single transaction: check for a RUNNING run,
//! insert the new run, and mark eligible schemes PENDING. The unique partial
//! index on `sync_runs(status) WHERE status = 'RUNNING'` backs the check so
//! two racing enqueues cannot both commit.

use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::db::queries;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new run was created.
    Accepted(Uuid),
    /// A run is already RUNNING; its id is returned instead.
    AlreadyRunning(Uuid),
}

impl EnqueueOutcome {
    pub fn run_id(&self) -> Uuid {
        match self {
            EnqueueOutcome::Accepted(id) | EnqueueOutcome::AlreadyRunning(id) => *id,
        }
    }
}

/// Enqueue a MANUAL run. Every scheme that is not currently IN_PROGRESS is
/// reset to PENDING; a manual trigger re-verifies the whole universe.
pub async fn enqueue_manual_run(pool: &PgPool) -> anyhow::Result<EnqueueOutcome> {
    let mut tx = pool.begin().await?;

    if let Some(existing) = queries::latest_running_run(&mut *tx).await? {
        return Ok(EnqueueOutcome::AlreadyRunning(existing.run_id));
    }

    let run_id = Uuid::new_v4();
    queries::create_sync_run(&mut *tx, run_id, "MANUAL").await?;
    let queued = queries::reset_all_sync_state_to_pending(&mut *tx).await?;

    tx.commit().await?;
    info!(%run_id, queued, "manual sync run enqueued");
    Ok(EnqueueOutcome::Accepted(run_id))
}

/// Enqueue an INCREMENTAL run. Only schemes that have been attempted before
/// (SUCCEEDED or FAILED) are queued; never-synced schemes wait for a manual
/// run to pick them up.
pub async fn enqueue_incremental_run(pool: &PgPool) -> anyhow::Result<EnqueueOutcome> {
    let mut tx = pool.begin().await?;

    if let Some(existing) = queries::latest_running_run(&mut *tx).await? {
        return Ok(EnqueueOutcome::AlreadyRunning(existing.run_id));
    }

    let run_id = Uuid::new_v4();
    queries::create_sync_run(&mut *tx, run_id, "INCREMENTAL").await?;
    let queued = queries::reset_attempted_sync_state_to_pending(&mut *tx).await?;

    tx.commit().await?;
    info!(%run_id, queued, "incremental sync run enqueued");
    Ok(EnqueueOutcome::Accepted(run_id))
}
