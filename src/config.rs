//! Configuration — YAML file defaults + environment variable overrides.
//!
//! The file path comes from `CONFIG_PATH` (default `config.yml`) and the file
//! is optional; deployment-specific values (`DATABASE_URL`, `HTTP_ADDR`, the
//! cron schedule, log settings) are expected from the environment.

use std::env;
use std::time::Duration;

use serde::Deserialize;

use crate::ratelimiter::WindowConfig;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub database_url: String,
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub rate_limiter: RateLimiterConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_http_addr() -> String {
    ":8080".into()
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_base_url")]
    pub base_url: String,
    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_upstream_base_url() -> String {
    "https://api.mfapi.in".into()
}
fn default_upstream_timeout_secs() -> u64 {
    20
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_upstream_base_url(),
            timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RateLimiterConfig {
    #[serde(default)]
    pub windows: Vec<RateLimiterWindow>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimiterWindow {
    #[serde(rename = "type")]
    pub window_type: String,
    pub duration: String,
    pub limit: i32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// IN_PROGRESS schemes older than this are requeued as PENDING.
    #[serde(default = "default_stale_after")]
    pub stale_after: String,
    /// Seconds the worker waits between drain attempts.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_stale_after() -> String {
    "15m".into()
}
fn default_poll_interval_secs() -> u64 {
    2
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stale_after: default_stale_after(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_incremental_cron")]
    pub incremental_cron: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_incremental_cron() -> String {
    "0 2 * * *".into()
}
fn default_timezone() -> String {
    "UTC".into()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            incremental_cron: default_incremental_cron(),
            timezone: default_timezone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "text".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    /// Load configuration from the YAML file (if present) merged with env vars.
    pub fn load() -> anyhow::Result<Self> {
        let path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.yml".into());

        let builder = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .build()?;

        let mut cfg: Config = builder.try_deserialize()?;

        if let Ok(v) = env::var("DATABASE_URL") {
            cfg.database_url = v;
        }
        if let Ok(v) = env::var("HTTP_ADDR") {
            cfg.http_addr = v;
        }
        if let Ok(v) = env::var("INCREMENTAL_CRON") {
            cfg.scheduler.incremental_cron = v;
        }
        if let Ok(v) = env::var("TZ") {
            cfg.scheduler.timezone = v;
        }
        if let Ok(v) = env::var("SYNC_STALE_AFTER") {
            cfg.sync.stale_after = v;
        }
        if let Ok(v) = env::var("LOG_LEVEL") {
            cfg.logging.log_level = v;
        }
        if let Ok(v) = env::var("LOG_FORMAT") {
            cfg.logging.format = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.is_empty() {
            anyhow::bail!("database_url/DATABASE_URL is required");
        }
        self.rate_limiter_windows()?;
        self.stale_after()?;
        Ok(())
    }

    /// Limiter windows from the file, or the stock defaults when none are set.
    pub fn rate_limiter_windows(&self) -> anyhow::Result<Vec<WindowConfig>> {
        if self.rate_limiter.windows.is_empty() {
            return Ok(crate::ratelimiter::default_windows());
        }

        self.rate_limiter
            .windows
            .iter()
            .map(|w| {
                if w.window_type.is_empty() {
                    anyhow::bail!("rate_limiter.windows[].type is required");
                }
                if w.limit <= 0 {
                    anyhow::bail!("rate_limiter.windows[{}].limit must be > 0", w.window_type);
                }
                let duration = humantime::parse_duration(&w.duration).map_err(|_| {
                    anyhow::anyhow!(
                        "rate_limiter.windows[{}].duration must be a valid duration (e.g. 1s, 1m, 1h)",
                        w.window_type
                    )
                })?;
                if duration.is_zero() {
                    anyhow::bail!("rate_limiter.windows[{}].duration must be > 0", w.window_type);
                }
                Ok(WindowConfig {
                    window_type: w.window_type.clone(),
                    duration,
                    limit: w.limit,
                })
            })
            .collect()
    }

    pub fn stale_after(&self) -> anyhow::Result<Duration> {
        humantime::parse_duration(&self.sync.stale_after)
            .map_err(|_| anyhow::anyhow!("sync.stale_after must be a valid duration (e.g. 15m)"))
    }

    /// Bind address for the HTTP server. A bare `:port` binds all interfaces.
    pub fn bind_addr(&self) -> String {
        if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_config() -> Config {
        Config {
            database_url: "postgres://localhost/test".into(),
            http_addr: default_http_addr(),
            upstream: UpstreamConfig::default(),
            rate_limiter: RateLimiterConfig::default(),
            sync: SyncConfig::default(),
            scheduler: SchedulerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn empty_windows_fall_back_to_defaults() {
        let cfg = base_config();
        let windows = cfg.rate_limiter_windows().unwrap();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].window_type, "second");
        assert_eq!(windows[0].limit, 2);
        assert_eq!(windows[1].limit, 50);
        assert_eq!(windows[2].limit, 300);
    }

    #[test]
    fn invalid_window_duration_is_rejected() {
        let mut cfg = base_config();
        cfg.rate_limiter.windows = vec![RateLimiterWindow {
            window_type: "second".into(),
            duration: "soon".into(),
            limit: 2,
        }];
        assert!(cfg.rate_limiter_windows().is_err());
    }

    #[test]
    fn non_positive_limit_is_rejected() {
        let mut cfg = base_config();
        cfg.rate_limiter.windows = vec![RateLimiterWindow {
            window_type: "second".into(),
            duration: "1s".into(),
            limit: 0,
        }];
        assert!(cfg.rate_limiter_windows().is_err());
    }

    #[test]
    fn stale_after_parses_duration_strings() {
        let mut cfg = base_config();
        cfg.sync.stale_after = "15m".into();
        assert_eq!(cfg.stale_after().unwrap(), Duration::from_secs(900));
        cfg.sync.stale_after = "whenever".into();
        assert!(cfg.stale_after().is_err());
    }

    #[test]
    fn bare_port_binds_all_interfaces() {
        let mut cfg = base_config();
        cfg.http_addr = ":8080".into();
        assert_eq!(cfg.bind_addr(), "0.0.0.0:8080");
        cfg.http_addr = "127.0.0.1:9090".into();
        assert_eq!(cfg.bind_addr(), "127.0.0.1:9090");
    }
}
