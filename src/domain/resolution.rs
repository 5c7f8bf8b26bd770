//! Resolution policy: how long data for a bucket width stays fresh and where
//! its buckets start.
//!
//! A bucket's contents cannot change once its window has closed, so the
//! time-to-live of cached data equals the bucket width.

use bucketcast_wire::Resolution;
use time::{Duration, OffsetDateTime, UtcOffset};

use super::error::DomainError;

pub fn ttl(resolution: Resolution) -> Duration {
    Duration::seconds(resolution.bucket_seconds())
}

/// Floor `timestamp` to the start of its containing bucket (UTC).
pub fn align(timestamp: OffsetDateTime, resolution: Resolution) -> OffsetDateTime {
    let timestamp = timestamp.to_offset(UtcOffset::UTC);
    let width = resolution.bucket_seconds();
    let into_bucket = timestamp.unix_timestamp().rem_euclid(width);
    timestamp
        - Duration::seconds(into_bucket)
        - Duration::nanoseconds(i64::from(timestamp.nanosecond()))
}

/// Start of the bucket following the one containing `timestamp`.
pub fn next_boundary(timestamp: OffsetDateTime, resolution: Resolution) -> OffsetDateTime {
    align(timestamp, resolution) + ttl(resolution)
}

/// Parse a client-supplied resolution, rejecting anything outside the
/// enumerated set before it can reach the cache.
pub fn parse(raw: &str) -> Result<Resolution, DomainError> {
    raw.parse::<Resolution>()
        .map_err(|err| DomainError::validation(err.to_string()))
}

#[cfg(test)]
mod tests {
    use time::macros::{datetime, offset};

    use super::*;

    #[test]
    fn ttl_equals_bucket_width() {
        for resolution in Resolution::ALL {
            assert_eq!(ttl(resolution).whole_seconds(), resolution.bucket_seconds());
        }
        assert_eq!(ttl(Resolution::TenMinutes), Duration::minutes(10));
    }

    #[test]
    fn align_floors_to_bucket_start() {
        let ts = datetime!(2024-03-01 10:07:31.250 UTC);
        assert_eq!(align(ts, Resolution::OneMinute), datetime!(2024-03-01 10:07:00 UTC));
        assert_eq!(align(ts, Resolution::FiveMinutes), datetime!(2024-03-01 10:05:00 UTC));
        assert_eq!(align(ts, Resolution::ThreeHours), datetime!(2024-03-01 09:00:00 UTC));
        assert_eq!(align(ts, Resolution::OneDay), datetime!(2024-03-01 00:00:00 UTC));
    }

    #[test]
    fn align_is_idempotent_on_boundaries() {
        let boundary = datetime!(2024-03-01 12:00:00 UTC);
        for resolution in Resolution::ALL {
            let aligned = align(boundary, resolution);
            assert_eq!(align(aligned, resolution), aligned);
        }
    }

    #[test]
    fn align_normalises_offsets_to_utc() {
        let ts = datetime!(2024-03-01 12:30:00 +02:00);
        let aligned = align(ts, Resolution::OneHour);
        assert_eq!(aligned, datetime!(2024-03-01 10:00:00 UTC));
        assert_eq!(aligned.offset(), offset!(UTC));
    }

    #[test]
    fn align_handles_pre_epoch_timestamps() {
        let ts = datetime!(1969-12-31 23:59:30 UTC);
        assert_eq!(align(ts, Resolution::OneMinute), datetime!(1969-12-31 23:59:00 UTC));
    }

    #[test]
    fn next_boundary_is_one_ttl_after_alignment() {
        let ts = datetime!(2024-03-01 10:07:31 UTC);
        assert_eq!(
            next_boundary(ts, Resolution::TenMinutes),
            datetime!(2024-03-01 10:10:00 UTC)
        );
    }

    #[test]
    fn parse_rejects_unknown_resolution() {
        assert_eq!(parse("1h").expect("valid"), Resolution::OneHour);
        assert!(matches!(parse("90s"), Err(DomainError::Validation { .. })));
    }
}
