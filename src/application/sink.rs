//! Structured record emission.
//!
//! Delivery is best effort: a sink never reports failure back to the caller.

use std::sync::Mutex;

use serde::Serialize;

use crate::cache::MetricsRecord;

/// A session-level failure worth recording outside the log stream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionErrorRecord {
    pub connection_id: String,
    pub subject_id: String,
    pub resolution: String,
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorKind {
    UpstreamUnavailable,
    WriteFailed,
    Encode,
}

impl SessionErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionErrorKind::UpstreamUnavailable => "upstream_unavailable",
            SessionErrorKind::WriteFailed => "write_failed",
            SessionErrorKind::Encode => "encode",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "record", rename_all = "snake_case")]
pub enum SinkRecord {
    CacheMetrics(MetricsRecord),
    SessionError(SessionErrorRecord),
}

pub trait Sink: Send + Sync + 'static {
    fn emit(&self, record: SinkRecord);
}

/// Keeps every record in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    records: Mutex<Vec<SinkRecord>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<SinkRecord> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn metrics_records(&self) -> Vec<MetricsRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                SinkRecord::CacheMetrics(metrics) => Some(metrics),
                SinkRecord::SessionError(_) => None,
            })
            .collect()
    }

    pub fn session_errors(&self) -> Vec<SessionErrorRecord> {
        self.records()
            .into_iter()
            .filter_map(|record| match record {
                SinkRecord::SessionError(error) => Some(error),
                SinkRecord::CacheMetrics(_) => None,
            })
            .collect()
    }
}

impl Sink for RecordingSink {
    fn emit(&self, record: SinkRecord) {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_error_serializes_with_tag() {
        let record = SinkRecord::SessionError(SessionErrorRecord {
            connection_id: "c1".into(),
            subject_id: "AAPL".into(),
            resolution: "5m".into(),
            kind: SessionErrorKind::UpstreamUnavailable,
            message: "timed out".into(),
        });
        let value = serde_json::to_value(&record).expect("serialize");
        assert_eq!(value["record"], "session_error");
        assert_eq!(value["kind"], "upstream_unavailable");
    }

    #[test]
    fn recording_sink_splits_by_kind() {
        let sink = RecordingSink::new();
        sink.emit(SinkRecord::SessionError(SessionErrorRecord {
            connection_id: "c1".into(),
            subject_id: "AAPL".into(),
            resolution: "1m".into(),
            kind: SessionErrorKind::WriteFailed,
            message: "gone".into(),
        }));
        assert_eq!(sink.records().len(), 1);
        assert_eq!(sink.session_errors().len(), 1);
        assert!(sink.metrics_records().is_empty());
    }
}
