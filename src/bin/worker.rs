//! Worker process: polls for the current RUNNING sync run and drains it.
//!
//! Any number of workers may run concurrently; the claim query's SKIP LOCKED
//! semantics keep them from stepping on each other.

use std::sync::Arc;
use std::time::Duration;

use mf_analytics::config::Config;
use mf_analytics::mfapi::MfApiClient;
use mf_analytics::ratelimiter::RateLimiter;
use mf_analytics::sync::SyncRunner;
use mf_analytics::{db, logging, shutdown_signal};
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    let config = Config::load()?;
    logging::init_logging(&config.logging);

    info!(version = env!("CARGO_PKG_VERSION"), "worker starting");

    let pool = db::pool::create_pool(&config.database_url).await?;
    db::pool::run_migrations(&pool).await?;

    let limiter = Arc::new(RateLimiter::new(
        pool.clone(),
        config.rate_limiter_windows()?,
    )?);
    let client = MfApiClient::new(
        config.upstream.base_url.clone(),
        Duration::from_secs(config.upstream.timeout_secs),
        limiter,
    )?;
    let runner = SyncRunner::new(pool.clone(), client, config.stale_after()?);

    let poll_every = Duration::from_secs(config.sync.poll_interval_secs.max(1));
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            result = runner.run_latest() => {
                match result {
                    Ok(true) => info!("finished a sync run; waiting for the next"),
                    Ok(false) => {}
                    // The run stays RUNNING; this or another worker resumes it
                    // on a later poll after the staleness sweep.
                    Err(e) => error!(error = %e, "worker iteration failed"),
                }
            }
        }

        tokio::select! {
            _ = &mut shutdown => break,
            _ = tokio::time::sleep(poll_every) => {}
        }
    }

    info!("worker shutdown complete");
    Ok(())
}
