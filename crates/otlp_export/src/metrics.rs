//! Per-exporter running counters.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use uuid::Uuid;

/// Thread-safe export statistics of one exporter (uses atomics).
///
/// Updated from concurrent flush tasks and read through [`snapshot`].
///
/// [`snapshot`]: ExporterStats::snapshot
#[derive(Debug, Default)]
pub struct ExporterStats {
    /// Spans accepted by the collector
    pub spans_exported: AtomicU64,
    /// Requests accepted by the collector
    pub batches_exported: AtomicU64,
    /// Failed flushes
    pub export_errors: AtomicU64,
    /// Spans dropped by a full queue or a failed flush
    pub spans_dropped: AtomicU64,
    /// Spans the collector reported as rejected in a partial success
    pub spans_rejected: AtomicU64,
    /// Flushes currently running
    pub inflight_exports: AtomicU64,
    total_latency_micros: AtomicU64,
    last_export_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<(String, DateTime<Utc>)>>,
}

/// Serialisable view of [`ExporterStats`].
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterStatsSnapshot {
    pub exported_count: u64,
    pub error_count: u64,
    pub dropped_count: u64,
    pub rejected_count: u64,
    pub batches_exported: u64,
    pub inflight_exports: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_export_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,
    /// Mean latency of accepted requests
    pub avg_export_latency_ms: f64,
}

impl ExporterStats {
    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    /// Records one request accepted by the collector.
    pub fn record_success(&self, span_count: u64, latency: Duration) {
        self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
        self.batches_exported.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        *self
            .last_export_at
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Utc::now());
    }

    /// Records a failed flush whose `span_count` spans are lost.
    pub fn record_error(&self, error: &impl ToString, span_count: u64) {
        self.export_errors.fetch_add(1, Ordering::Relaxed);
        self.spans_dropped.fetch_add(span_count, Ordering::Relaxed);
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) =
            Some((error.to_string(), Utc::now()));
    }

    pub fn record_dropped(&self, span_count: u64) {
        self.spans_dropped.fetch_add(span_count, Ordering::Relaxed);
    }

    pub fn record_rejected(&self, span_count: u64) {
        self.spans_rejected.fetch_add(span_count, Ordering::Relaxed);
    }

    pub(crate) fn inc_inflight(&self) {
        self.inflight_exports.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dec_inflight(&self) {
        self.inflight_exports.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ExporterStatsSnapshot {
        let batches = self.batches_exported.load(Ordering::Relaxed);
        let latency_micros = self.total_latency_micros.load(Ordering::Relaxed);
        let last_error = self
            .last_error
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        ExporterStatsSnapshot {
            exported_count: self.spans_exported(),
            error_count: self.export_errors(),
            dropped_count: self.spans_dropped(),
            rejected_count: self.spans_rejected.load(Ordering::Relaxed),
            batches_exported: batches,
            inflight_exports: self.inflight_exports.load(Ordering::Relaxed),
            last_export_at: *self
                .last_export_at
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            last_error_at: last_error.as_ref().map(|(_, at)| *at),
            last_error: last_error.map(|(message, _)| message),
            avg_export_latency_ms: if batches == 0 {
                0.0
            } else {
                latency_micros as f64 / batches as f64 / 1000.0
            },
        }
    }
}

/// Statistics of every exporter, keyed by exporter id.
#[derive(Debug, Default)]
pub struct StatsRegistry {
    stats: RwLock<HashMap<Uuid, Arc<ExporterStats>>>,
}

impl StatsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the statistics of `exporter_id`, creating them on first use.
    pub fn for_exporter(&self, exporter_id: Uuid) -> Arc<ExporterStats> {
        if let Some(stats) = self
            .stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&exporter_id)
        {
            return Arc::clone(stats);
        }
        let mut stats = self.stats.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(stats.entry(exporter_id).or_default())
    }

    pub fn snapshot(&self, exporter_id: Uuid) -> Option<ExporterStatsSnapshot> {
        self.stats
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&exporter_id)
            .map(|s| s.snapshot())
    }

    pub fn remove(&self, exporter_id: Uuid) {
        self.stats
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&exporter_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exporter::ExportError;

    #[test]
    fn test_snapshot_aggregates() {
        let stats = ExporterStats::default();
        stats.record_success(10, Duration::from_millis(20));
        stats.record_success(5, Duration::from_millis(40));
        stats.record_error(&ExportError::Timeout, 3);
        stats.record_dropped(2);
        stats.record_rejected(1);

        let snap = stats.snapshot();
        assert_eq!(snap.exported_count, 15);
        assert_eq!(snap.batches_exported, 2);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.dropped_count, 5);
        assert_eq!(snap.rejected_count, 1);
        assert_eq!(snap.avg_export_latency_ms, 30.0);
        assert_eq!(snap.last_error.as_deref(), Some("export operation timed out"));
        assert!(snap.last_error_at.is_some());
        assert!(snap.last_export_at.is_some());
    }

    #[test]
    fn test_registry_shares_per_exporter() {
        let registry = StatsRegistry::new();
        let id = Uuid::new_v4();
        registry.for_exporter(id).record_dropped(4);

        assert_eq!(registry.for_exporter(id).spans_dropped(), 4);
        assert_eq!(registry.snapshot(id).unwrap().dropped_count, 4);
        assert!(registry.snapshot(Uuid::new_v4()).is_none());

        registry.remove(id);
        assert!(registry.snapshot(id).is_none());
    }

    #[test]
    fn test_snapshot_serializes_camel_case() {
        let json = serde_json::to_value(ExporterStats::default().snapshot()).unwrap();
        assert_eq!(json["exportedCount"], 0);
        assert!(json.get("lastError").is_none());
    }
}
