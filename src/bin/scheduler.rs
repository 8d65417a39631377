//! Scheduler process: enqueues INCREMENTAL sync runs on a cron schedule.
//!
//! Also fires once at startup so a fresh deployment does not wait a full day
//! for its first refresh. A run already in flight makes the tick a no-op.

use anyhow::Context;
use mf_analytics::config::Config;
use mf_analytics::sync::{enqueue_incremental_run, EnqueueOutcome};
use mf_analytics::{db, logging, shutdown_signal};
use sqlx::PgPool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    logging::init_logging(&config.logging);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        cron = %config.scheduler.incremental_cron,
        timezone = %config.scheduler.timezone,
        "scheduler starting"
    );

    let pool = db::pool::create_pool(&config.database_url).await?;
    db::pool::run_migrations(&pool).await?;

    let timezone: chrono_tz::Tz = config
        .scheduler
        .timezone
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid timezone {:?}", config.scheduler.timezone))?;

    let mut scheduler = JobScheduler::new().await.context("creating scheduler")?;

    let job_pool = pool.clone();
    let job = Job::new_async_tz(
        cron_with_seconds(&config.scheduler.incremental_cron).as_str(),
        timezone,
        move |_id, _lock| {
            let pool = job_pool.clone();
            Box::pin(async move {
                enqueue(&pool).await;
            })
        },
    )
    .with_context(|| {
        format!(
            "creating scheduler job for cron {:?}",
            config.scheduler.incremental_cron
        )
    })?;
    scheduler.add(job).await.context("adding scheduler job")?;
    scheduler.start().await.context("starting scheduler")?;

    enqueue(&pool).await;

    shutdown_signal().await;
    scheduler.shutdown().await.context("stopping scheduler")?;

    info!("scheduler shutdown complete");
    Ok(())
}

async fn enqueue(pool: &PgPool) {
    match enqueue_incremental_run(pool).await {
        Ok(EnqueueOutcome::Accepted(run_id)) => {
            info!(%run_id, "incremental sync run enqueued");
        }
        Ok(EnqueueOutcome::AlreadyRunning(run_id)) => {
            info!(%run_id, "sync run already active; skipping");
        }
        Err(e) => error!(error = %e, "enqueue incremental run"),
    }
}

/// The configured schedule is a standard 5-field cron, but the scheduler
/// crate parses with a leading seconds field. Translate at the boundary;
/// expressions that already carry a seconds field pass through untouched.
fn cron_with_seconds(expr: &str) -> String {
    let expr = expr.trim();
    if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    }
}
