use std::fmt;

use bucketcast_wire::Resolution;
use serde::Serialize;

/// Composite cache key: one subject at one bucket width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CacheKey {
    pub subject_id: String,
    pub resolution: Resolution,
}

impl CacheKey {
    pub fn new(subject_id: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            subject_id: subject_id.into(),
            resolution,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.subject_id, self.resolution)
    }
}
