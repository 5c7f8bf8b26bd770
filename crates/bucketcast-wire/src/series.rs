use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::Resolution;

/// One aggregated bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    #[serde(with = "time::serde::rfc3339")]
    pub start: OffsetDateTime,
    pub value: f64,
    pub samples: u64,
}

/// Series of buckets for one subject at one resolution.
///
/// Produced by the upstream data source; the cache treats it as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBucketSeries {
    pub subject_id: String,
    pub resolution: Resolution,
    #[serde(default)]
    pub buckets: Vec<Bucket>,
}

impl TimeBucketSeries {
    pub fn new(subject_id: impl Into<String>, resolution: Resolution, buckets: Vec<Bucket>) -> Self {
        Self {
            subject_id: subject_id.into(),
            resolution,
            buckets,
        }
    }

    /// Start of the most recent bucket, if any.
    pub fn latest_start(&self) -> Option<OffsetDateTime> {
        self.buckets.iter().map(|bucket| bucket.start).max()
    }
}

/// `data` of a `bucket_update` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketUpdate {
    pub subject_id: String,
    pub resolution: Resolution,
    /// Server time the frame was built; clients derive end-to-end latency from it.
    #[serde(with = "time::serde::rfc3339")]
    pub origin_timestamp: OffsetDateTime,
    pub series: TimeBucketSeries,
}

/// `data` of a `heartbeat` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;

    #[test]
    fn bucket_update_json_shape() {
        let series = TimeBucketSeries::new(
            "AAPL",
            Resolution::FiveMinutes,
            vec![Bucket {
                start: datetime!(2024-03-01 10:05:00 UTC),
                value: 0.42,
                samples: 17,
            }],
        );
        let update = BucketUpdate {
            subject_id: "AAPL".to_string(),
            resolution: Resolution::FiveMinutes,
            origin_timestamp: datetime!(2024-03-01 10:07:30 UTC),
            series,
        };

        let value = serde_json::to_value(&update).expect("serialize");
        assert_eq!(value["resolution"], "5m");
        assert_eq!(value["origin_timestamp"], "2024-03-01T10:07:30Z");
        assert_eq!(value["series"]["buckets"][0]["samples"], 17);

        let back: BucketUpdate = serde_json::from_value(value).expect("deserialize");
        assert_eq!(back, update);
    }

    #[test]
    fn latest_start_picks_newest_bucket() {
        let series = TimeBucketSeries::new(
            "BTC",
            Resolution::OneHour,
            vec![
                Bucket {
                    start: datetime!(2024-03-01 11:00:00 UTC),
                    value: 1.0,
                    samples: 1,
                },
                Bucket {
                    start: datetime!(2024-03-01 09:00:00 UTC),
                    value: 2.0,
                    samples: 1,
                },
            ],
        );
        assert_eq!(series.latest_start(), Some(datetime!(2024-03-01 11:00:00 UTC)));
        assert_eq!(
            TimeBucketSeries::new("BTC", Resolution::OneHour, Vec::new()).latest_start(),
            None
        );
    }
}
