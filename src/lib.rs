//! Mutual-fund NAV sync and analytics service.
//!
//! Three binaries share this library: `api` (read API + manual trigger),
//! `worker` (drains sync runs scheme-by-scheme), and `scheduler` (cron
//! enqueue of incremental runs). All coordination goes through Postgres;
//! the processes themselves are stateless and independently restartable.

pub mod analytics;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod mfapi;
pub mod ratelimiter;
pub mod sync;
pub mod web;

use tracing::info;

/// Resolves when SIGINT or SIGTERM arrives.
pub async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => { info!("received SIGINT"); }
            _ = sigterm.recv() => { info!("received SIGTERM"); }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("received SIGINT");
    }
}
