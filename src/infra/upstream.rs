//! HTTP adapter for the upstream series store.

use std::time::Duration;

use async_trait::async_trait;
use bucketcast_wire::TimeBucketSeries;
use reqwest::{Client, StatusCode};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use url::Url;

use crate::application::datasource::{DataSource, SourceError};
use crate::cache::CacheKey;
use crate::config::UpstreamSettings;

use super::error::InfraError;

/// Fetches `GET {base}/series/{subject_id}?resolution=..&now=..`.
#[derive(Debug, Clone)]
pub struct HttpDataSource {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl HttpDataSource {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, InfraError> {
        if base.cannot_be_a_base() {
            return Err(InfraError::configuration(format!(
                "upstream url `{base}` cannot be used as a base"
            )));
        }
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(timeout)
            .build()
            .map_err(|err| InfraError::upstream(err.to_string()))?;
        Ok(Self {
            client,
            base,
            timeout,
        })
    }

    pub fn from_settings(settings: &UpstreamSettings) -> Result<Self, InfraError> {
        let base = settings
            .url
            .clone()
            .ok_or_else(|| InfraError::configuration("upstream.url must be set to serve"))?;
        Self::new(base, settings.timeout)
    }

    pub fn user_agent() -> &'static str {
        concat!("bucketcast/", env!("CARGO_PKG_VERSION"))
    }

    /// Request URL for `key` at business time `now`.
    pub fn series_url(&self, key: &CacheKey, now: OffsetDateTime) -> Result<Url, SourceError> {
        let mut url = self.base.clone();
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| SourceError::unavailable("upstream url cannot be a base"))?;
            segments.pop_if_empty().push("series").push(&key.subject_id);
        }
        let now = now
            .format(&Rfc3339)
            .map_err(|err| SourceError::unavailable(format!("timestamp formatting: {err}")))?;
        url.query_pairs_mut()
            .clear()
            .append_pair("resolution", key.resolution.as_str())
            .append_pair("now", &now);
        Ok(url)
    }
}

#[async_trait]
impl DataSource for HttpDataSource {
    async fn fetch(
        &self,
        key: &CacheKey,
        now: OffsetDateTime,
    ) -> Result<TimeBucketSeries, SourceError> {
        let url = self.series_url(key, now)?;
        let response = self.client.get(url).send().await.map_err(|err| {
            if err.is_timeout() {
                SourceError::Timeout(self.timeout)
            } else {
                SourceError::unavailable(err.to_string())
            }
        })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(SourceError::Status(status.as_u16()));
        }

        let series: TimeBucketSeries = response
            .json()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))?;
        if series.subject_id != key.subject_id || series.resolution != key.resolution {
            return Err(SourceError::Decode(format!(
                "upstream answered {}@{} for {key}",
                series.subject_id, series.resolution
            )));
        }
        Ok(series)
    }
}
