//! Upstream NAV provider client.
//!
//! Thin GET wrapper over the provider's `/mf` endpoints. Every request takes
//! one token from the shared rate limiter before touching the network, so
//! the provider sees the configured request budget no matter how many
//! workers are running.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::ratelimiter::RateLimiter;

#[derive(Debug, Clone, Deserialize)]
pub struct SchemeListItem {
    #[serde(rename = "schemeCode")]
    pub scheme_code: i64,
    #[serde(rename = "schemeName")]
    pub scheme_name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemeMeta {
    #[serde(default)]
    pub fund_house: String,
    #[serde(default)]
    pub scheme_type: String,
    #[serde(default)]
    pub scheme_category: String,
    #[serde(default)]
    pub scheme_code: i64,
    #[serde(default)]
    pub scheme_name: String,
}

/// One NAV observation as the provider ships it: `date` is `dd-mm-yyyy`,
/// `nav` is a decimal in a string.
#[derive(Debug, Clone, Deserialize)]
pub struct SchemeNavRow {
    pub date: String,
    pub nav: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SchemeResponse {
    #[serde(default)]
    pub meta: SchemeMeta,
    #[serde(default)]
    pub data: Vec<SchemeNavRow>,
}

pub struct MfApiClient {
    base_url: String,
    http: Client,
    limiter: Arc<RateLimiter>,
}

impl MfApiClient {
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        limiter: Arc<RateLimiter>,
    ) -> crate::error::Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
            limiter,
        })
    }

    /// Search schemes by free text. Not used by the sync pipeline itself.
    pub async fn search(&self, q: &str) -> anyhow::Result<Vec<SchemeListItem>> {
        let url = format!("{}/mf/search", self.base_url);
        self.get_json(&url, &[("q", q.to_string())]).await
    }

    /// Full NAV history for one scheme.
    pub async fn get_scheme(&self, scheme_code: i64) -> anyhow::Result<SchemeResponse> {
        let url = format!("{}/mf/{}", self.base_url, scheme_code);
        self.get_json(&url, &[]).await
    }

    /// NAV history bounded by `[start_date, end_date]`, both inclusive.
    pub async fn get_scheme_range(
        &self,
        scheme_code: i64,
        start_date: NaiveDate,
        end_date: NaiveDate,
    ) -> anyhow::Result<SchemeResponse> {
        let url = format!("{}/mf/{}", self.base_url, scheme_code);
        self.get_json(
            &url,
            &[
                ("startDate", start_date.format("%Y-%m-%d").to_string()),
                ("endDate", end_date.format("%Y-%m-%d").to_string()),
            ],
        )
        .await
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> anyhow::Result<T> {
        let started = std::time::Instant::now();
        debug!(url, "upstream request");

        self.limiter.acquire().await?;

        let response = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(ServiceError::Http)?;
        let status = response.status();

        if !status.is_success() {
            warn!(
                url,
                status = status.as_u16(),
                duration_ms = started.elapsed().as_millis() as u64,
                "upstream non-2xx"
            );
            return Err(ServiceError::Upstream(format!("{url}: http {}", status.as_u16())).into());
        }

        let body = response.json::<T>().await.map_err(ServiceError::Http)?;
        info!(
            url,
            duration_ms = started.elapsed().as_millis() as u64,
            "upstream ok"
        );
        Ok(body)
    }
}
