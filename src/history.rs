use crate::matcher::TriggerKind;
use crate::prediction::PredictionStatus;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

/// One audit entry per detected start/win/lose
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: TriggerKind,
    pub score: f32,
    /// Empty when no prediction was involved
    pub prediction_id: String,
    pub status: PredictionStatus,
}

impl HistoryRecord {
    pub fn new(
        kind: TriggerKind,
        score: f32,
        prediction_id: Option<&str>,
        status: PredictionStatus,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            score,
            prediction_id: prediction_id.unwrap_or_default().to_string(),
            status,
        }
    }
}

/// Receives history records. Fire-and-forget: implementations must not
/// block and their failures are their own.
pub trait HistorySink: Send + Sync {
    fn record(&self, record: HistoryRecord);
}

/// Emits one structured log line per record
#[derive(Debug, Default)]
pub struct TracingHistorySink;

impl HistorySink for TracingHistorySink {
    fn record(&self, record: HistoryRecord) {
        info!(
            target: "cuewatch::history",
            kind = %record.kind,
            score = record.score,
            prediction_id = %record.prediction_id,
            status = %record.status,
            timestamp = %record.timestamp.to_rfc3339(),
            "History"
        );
    }
}

/// Keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryHistorySink {
    records: Mutex<Vec<HistoryRecord>>,
}

impl MemoryHistorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.records.lock().clone()
    }

    pub fn kinds(&self) -> Vec<TriggerKind> {
        self.records.lock().iter().map(|r| r.kind).collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl HistorySink for MemoryHistorySink {
    fn record(&self, record: HistoryRecord) {
        self.records.lock().push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_keeps_order() {
        let sink = MemoryHistorySink::new();
        assert!(sink.is_empty());

        sink.record(HistoryRecord::new(TriggerKind::Start, 0.95, Some("p1"), PredictionStatus::Created));
        sink.record(HistoryRecord::new(TriggerKind::Lose, 0.88, None, PredictionStatus::None));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.kinds(), vec![TriggerKind::Start, TriggerKind::Lose]);
        let records = sink.records();
        assert_eq!(records[0].prediction_id, "p1");
        assert_eq!(records[1].prediction_id, "");
        assert!(records[0].timestamp <= records[1].timestamp);
    }

    #[test]
    fn test_record_serialization() {
        let record = HistoryRecord::new(TriggerKind::Win, 0.9, Some("p2"), PredictionStatus::Resolved);
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["kind"], "win");
        assert_eq!(json["status"], "resolved");
    }

    #[test]
    fn test_tracing_sink_does_not_panic() {
        TracingHistorySink.record(HistoryRecord::new(TriggerKind::Start, 1.0, None, PredictionStatus::None));
    }
}
