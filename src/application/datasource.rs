//! Upstream series provider consulted on a cache miss.

use std::time::Duration;

use async_trait::async_trait;
use bucketcast_wire::TimeBucketSeries;
use thiserror::Error;
use time::OffsetDateTime;

use crate::cache::CacheKey;

/// A transient upstream failure. Sessions skip the tick and stay open.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("upstream fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("upstream responded with status {0}")]
    Status(u16),
    #[error("upstream payload could not be decoded: {0}")]
    Decode(String),
}

impl SourceError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }
}

/// Idempotent, retry-safe fetch of one subject at one resolution.
#[async_trait]
pub trait DataSource: Send + Sync + 'static {
    async fn fetch(
        &self,
        key: &CacheKey,
        now: OffsetDateTime,
    ) -> Result<TimeBucketSeries, SourceError>;
}
