use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Aggregation bucket width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Resolution {
    OneMinute,
    FiveMinutes,
    TenMinutes,
    OneHour,
    ThreeHours,
    SixHours,
    TwelveHours,
    OneDay,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown resolution `{0}` (expected one of 1m, 5m, 10m, 1h, 3h, 6h, 12h, 24h)")]
pub struct UnknownResolution(pub String);

impl Resolution {
    pub const ALL: [Resolution; 8] = [
        Resolution::OneMinute,
        Resolution::FiveMinutes,
        Resolution::TenMinutes,
        Resolution::OneHour,
        Resolution::ThreeHours,
        Resolution::SixHours,
        Resolution::TwelveHours,
        Resolution::OneDay,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Resolution::OneMinute => "1m",
            Resolution::FiveMinutes => "5m",
            Resolution::TenMinutes => "10m",
            Resolution::OneHour => "1h",
            Resolution::ThreeHours => "3h",
            Resolution::SixHours => "6h",
            Resolution::TwelveHours => "12h",
            Resolution::OneDay => "24h",
        }
    }

    /// Width of one bucket in seconds.
    pub fn bucket_seconds(self) -> i64 {
        const MINUTE: i64 = 60;
        const HOUR: i64 = 60 * MINUTE;
        match self {
            Resolution::OneMinute => MINUTE,
            Resolution::FiveMinutes => 5 * MINUTE,
            Resolution::TenMinutes => 10 * MINUTE,
            Resolution::OneHour => HOUR,
            Resolution::ThreeHours => 3 * HOUR,
            Resolution::SixHours => 6 * HOUR,
            Resolution::TwelveHours => 12 * HOUR,
            Resolution::OneDay => 24 * HOUR,
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = UnknownResolution;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Resolution::ALL
            .into_iter()
            .find(|resolution| resolution.as_str().eq_ignore_ascii_case(trimmed))
            .ok_or_else(|| UnknownResolution(s.to_string()))
    }
}

impl Serialize for Resolution {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Resolution {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
