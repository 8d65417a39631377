//! Cross-process fixed-window rate limiter backed by Postgres.
//!
//! Every worker that talks to the upstream provider shares the same counter
//! rows, so the configured limits hold across any number of processes. Each
//! attempt is one transaction: the per-window `FOR UPDATE` locks serialize
//! concurrent acquires, and a denied attempt rolls back without consuming
//! anything.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::{debug, trace};

use crate::db::queries;
use crate::error::ServiceError;

/// One fixed window: `limit` requests per aligned `duration` bucket.
#[derive(Debug, Clone)]
pub struct WindowConfig {
    /// Unique row key, e.g. "second" / "minute" / "hour".
    pub window_type: String,
    pub duration: Duration,
    pub limit: i32,
}

/// Stock windows used when the config file does not set any.
pub fn default_windows() -> Vec<WindowConfig> {
    vec![
        WindowConfig {
            window_type: "second".into(),
            duration: Duration::from_secs(1),
            limit: 2,
        },
        WindowConfig {
            window_type: "minute".into(),
            duration: Duration::from_secs(60),
            limit: 50,
        },
        WindowConfig {
            window_type: "hour".into(),
            duration: Duration::from_secs(3600),
            limit: 300,
        },
    ]
}

/// Outcome of a single acquire attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    Acquired,
    /// Denied; retry no earlier than the contained wait. The wait is the
    /// maximum across all denying windows, so the retry cannot bounce off
    /// the same window again.
    Blocked(Duration),
}

pub struct RateLimiter {
    pool: PgPool,
    windows: Vec<WindowConfig>,
}

impl RateLimiter {
    pub fn new(pool: PgPool, windows: Vec<WindowConfig>) -> Result<Self, ServiceError> {
        if windows.is_empty() {
            return Err(ServiceError::Config(
                "rate limiter needs at least one window".into(),
            ));
        }
        for w in &windows {
            if w.window_type.is_empty() {
                return Err(ServiceError::Config("rate limiter window type is required".into()));
            }
            if w.duration.is_zero() {
                return Err(ServiceError::Config(format!(
                    "rate limiter window {:?} duration must be > 0",
                    w.window_type
                )));
            }
            if w.limit <= 0 {
                return Err(ServiceError::Config(format!(
                    "rate limiter window {:?} limit must be > 0",
                    w.window_type
                )));
            }
        }
        Ok(Self { pool, windows })
    }

    /// Block until a request is permitted by *all* configured windows.
    ///
    /// The in-between sleeps are plain tokio sleeps, so dropping the future
    /// (e.g. from a `select!` losing to shutdown) cancels the acquire.
    pub async fn acquire(&self) -> anyhow::Result<()> {
        loop {
            match self.try_acquire().await? {
                Attempt::Acquired => return Ok(()),
                Attempt::Blocked(wait) => {
                    debug!(wait_ms = wait.as_millis() as u64, "rate limited, sleeping");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// One transactional attempt across every window.
    pub async fn try_acquire(&self) -> anyhow::Result<Attempt> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        // Ensure rows exist so FOR UPDATE has something to lock.
        for w in &self.windows {
            queries::init_rate_limiter_state(
                &mut *tx,
                &w.window_type,
                truncate_to(now, w.duration),
            )
            .await?;
        }

        let mut denied = false;
        let mut max_wait = Duration::ZERO;
        let mut writes: Vec<(String, DateTime<Utc>, i32)> = Vec::with_capacity(self.windows.len());

        for w in &self.windows {
            let state = queries::lock_rate_limiter_state(&mut *tx, &w.window_type).await?;

            let mut window_start = state.window_start;
            let mut count = state.request_count;
            if elapsed_since(now, window_start) >= w.duration {
                // Window expired: reset to the current aligned boundary.
                window_start = truncate_to(now, w.duration);
                count = 0;
            }

            if count >= w.limit {
                let until = window_start
                    + chrono::Duration::from_std(w.duration).unwrap_or(chrono::Duration::zero());
                let wait = (until - now).to_std().unwrap_or(Duration::ZERO);
                denied = true;
                if wait > max_wait {
                    max_wait = wait;
                }
                debug!(
                    window = %w.window_type,
                    count,
                    limit = w.limit,
                    wait_ms = wait.as_millis() as u64,
                    "window exhausted"
                );
                continue;
            }

            trace!(window = %w.window_type, count, limit = w.limit, "window admits");
            writes.push((w.window_type.clone(), window_start, count + 1));
        }

        if denied {
            // Dropping the transaction rolls it back; nothing was consumed.
            return Ok(Attempt::Blocked(max_wait));
        }

        for (window_type, window_start, count) in &writes {
            queries::update_rate_limiter_state(&mut *tx, window_type, *window_start, *count)
                .await?;
        }
        tx.commit().await?;

        Ok(Attempt::Acquired)
    }
}

/// Align a timestamp down to a multiple of `step` since the Unix epoch.
/// This is the `window_start = truncate(now, duration)` rule: windows are
/// fixed buckets, not sliding.
fn truncate_to(t: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step_us = step.as_micros().max(1) as i64;
    let us = t.timestamp_micros();
    DateTime::from_timestamp_micros(us - us.rem_euclid(step_us)).unwrap_or(t)
}

fn elapsed_since(now: DateTime<Utc>, start: DateTime<Utc>) -> Duration {
    (now - start).to_std().unwrap_or(Duration::ZERO)
}
