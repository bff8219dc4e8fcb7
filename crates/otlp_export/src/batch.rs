//! Batch Manager
//!
//! One [`ExportBatch`] per exporter id holds the spans waiting to be sent.
//! A batch is flushed when an enqueue brings it to `maxBatchSize`, or by the
//! service's periodic scan once it is older than `batchTimeoutMs`.
//!
//! # Locking
//!
//! The batch map lock is taken only to look up or insert a batch; span lists
//! are guarded by each batch's own lock and never touched under the map lock.
//! A flush swaps the pending list for an empty one under the batch lock and
//! hands the detached spans to a task, so the network call never holds a lock
//! and enqueues keep accumulating into the fresh list.

use crate::config::ExporterConfig;
use crate::exporter::{ExportError, ExporterFactory, SpanExporterBoxed};
use crate::metrics::{ExporterStats, StatsRegistry};
use crate::span::{OtelSpan, SpanBatch};
use std::collections::HashMap;
use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::time::Instant;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

/// What happened to one enqueued group of spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// The exporter is disabled; spans were discarded.
    Disabled,
    /// The sampling draw discarded the whole group.
    SampledOut,
    /// Nothing to enqueue.
    Empty,
    /// The trace did not match the exporter's name or metadata filters.
    Filtered,
    /// Spans are pending; `pending` is the batch size after the append.
    Queued { pending: usize },
    /// The append filled the batch and a flush of `spans` was dispatched.
    FlushScheduled { spans: usize },
}

/// Sampling decision for one enqueue call. The whole group is kept or
/// dropped together so one ingestion call is never split.
pub fn keep_group(sampling_rate: f64, draw: impl FnOnce() -> f64) -> bool {
    if sampling_rate >= 1.0 {
        true
    } else if sampling_rate <= 0.0 || sampling_rate.is_nan() {
        false
    } else {
        draw() < sampling_rate
    }
}

#[derive(Debug)]
struct Pending {
    spans: Vec<OtelSpan>,
    last_send: Instant,
}

/// Pending spans of one exporter.
pub struct ExportBatch {
    config: Arc<ExporterConfig>,
    exporter: Arc<dyn SpanExporterBoxed>,
    stats: Arc<ExporterStats>,
    pending: Mutex<Pending>,
}

impl ExportBatch {
    fn new(
        config: Arc<ExporterConfig>,
        exporter: Arc<dyn SpanExporterBoxed>,
        stats: Arc<ExporterStats>,
    ) -> Self {
        Self {
            config,
            exporter,
            stats,
            pending: Mutex::new(Pending {
                spans: Vec::new(),
                last_send: Instant::now(),
            }),
        }
    }

    /// Configuration the batch was created with.
    pub fn config(&self) -> &Arc<ExporterConfig> {
        &self.config
    }

    pub fn exporter_name(&self) -> &str {
        self.exporter.name()
    }

    pub fn pending_len(&self) -> usize {
        self.lock().spans.len()
    }

    fn lock(&self) -> MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Swaps the pending list for an empty one and stamps the send time.
    fn take_pending(pending: &mut Pending, now: Instant) -> Vec<OtelSpan> {
        let spans = mem::take(&mut pending.spans);
        pending.last_send = now;
        debug_assert_detached!(pending.spans);
        spans
    }

    /// Detaches the pending spans if the batch is non-empty and has waited
    /// at least `batchTimeoutMs` since its last send.
    fn take_if_due(&self, now: Instant) -> Option<Vec<OtelSpan>> {
        let mut pending = self.lock();
        let due = !pending.spans.is_empty()
            && now.saturating_duration_since(pending.last_send)
                >= self.config.batch_config.batch_timeout();
        due.then(|| Self::take_pending(&mut pending, now))
    }

    fn take_all(&self) -> Vec<OtelSpan> {
        Self::take_pending(&mut self.lock(), Instant::now())
    }

    /// Sends detached spans in chunks of at most `maxBatchSize`, in order.
    /// The whole flush is bounded by `exportTimeoutMs`.
    async fn export(&self, spans: Vec<OtelSpan>) {
        let total = spans.len();
        let deadline = self.config.batch_config.export_timeout();
        let mut settled = 0usize;

        let finished = tokio::time::timeout(deadline, self.send_chunks(spans, &mut settled)).await;
        if finished.is_err() {
            let unsent = total - settled;
            self.stats.record_error(&ExportError::Timeout, unsent as u64);
            tracing::error!(
                exporter_id = %self.config.id,
                endpoint = %self.config.endpoint,
                span_count = unsent,
                deadline_ms = deadline.as_millis() as u64,
                "Flush exceeded export timeout, dropping unsent spans"
            );
        }
    }

    async fn send_chunks(&self, spans: Vec<OtelSpan>, settled: &mut usize) {
        let chunk_size = self.config.batch_config.max_batch_size.max(1);
        let mut spans = spans.into_iter().peekable();

        while spans.peek().is_some() {
            let chunk: Vec<OtelSpan> = spans.by_ref().take(chunk_size).collect();
            let count = chunk.len();
            let started = Instant::now();

            match self
                .exporter
                .export_boxed(SpanBatch::with_spans(self.config.id, chunk))
                .await
            {
                Ok(()) => {
                    self.stats.record_success(count as u64, started.elapsed());
                    tracing::debug!(
                        exporter_id = %self.config.id,
                        exporter = self.exporter.name(),
                        span_count = count,
                        "Flushed batch"
                    );
                }
                Err(e) => {
                    self.stats.record_error(&e, count as u64);
                    if e.is_breaker_rejection() {
                        tracing::debug!(
                            exporter_id = %self.config.id,
                            span_count = count,
                            error = %e,
                            "Dropped batch rejected by circuit breaker"
                        );
                    } else {
                        tracing::error!(
                            exporter_id = %self.config.id,
                            endpoint = %self.config.endpoint,
                            span_count = count,
                            error = %e,
                            "Failed to export batch"
                        );
                    }
                }
            }
            *settled += count;
        }
    }
}

/// Owns every exporter's batch and the flush tasks they spawn.
pub struct BatchManager {
    batches: RwLock<HashMap<Uuid, Arc<ExportBatch>>>,
    factory: Arc<dyn ExporterFactory>,
    stats: Arc<StatsRegistry>,
    tracker: TaskTracker,
    handle: Handle,
    closed: AtomicBool,
}

impl BatchManager {
    /// Flush tasks are spawned on `handle`, so enqueue may be called from
    /// threads outside the runtime.
    pub fn new(handle: Handle, factory: Arc<dyn ExporterFactory>, stats: Arc<StatsRegistry>) -> Self {
        Self {
            batches: RwLock::new(HashMap::new()),
            factory,
            stats,
            tracker: TaskTracker::new(),
            handle,
            closed: AtomicBool::new(false),
        }
    }

    /// Appends `spans` to the exporter's batch, dispatching a flush when the
    /// batch reaches `maxBatchSize`. Never waits on network I/O.
    pub fn enqueue(
        &self,
        config: &Arc<ExporterConfig>,
        spans: Vec<OtelSpan>,
    ) -> Result<EnqueueOutcome, ExportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ExportError::ShutDown);
        }
        if !config.enabled {
            return Ok(EnqueueOutcome::Disabled);
        }
        if spans.is_empty() {
            return Ok(EnqueueOutcome::Empty);
        }
        if !keep_group(config.sampling_rate, rand::random::<f64>) {
            return Ok(EnqueueOutcome::SampledOut);
        }

        let batch = self.batch_for(config);
        let limits = batch.config.batch_config;
        let mut pending = batch.lock();

        if limits.max_queue_size > 0 && pending.spans.len() + spans.len() > limits.max_queue_size {
            let pending_len = pending.spans.len();
            drop(pending);
            batch.stats.record_dropped(spans.len() as u64);
            tracing::warn!(
                exporter_id = %config.id,
                span_count = spans.len(),
                pending = pending_len,
                max_queue_size = limits.max_queue_size,
                "Export queue full, dropping spans"
            );
            return Err(ExportError::QueueFull);
        }

        pending.spans.extend(spans);
        if pending.spans.len() < limits.max_batch_size {
            return Ok(EnqueueOutcome::Queued {
                pending: pending.spans.len(),
            });
        }

        let detached = ExportBatch::take_pending(&mut pending, Instant::now());
        drop(pending);
        let count = detached.len();
        self.spawn_flush(batch, detached);
        Ok(EnqueueOutcome::FlushScheduled { spans: count })
    }

    /// Flushes every batch whose timeout has passed. Returns the number of
    /// flushes dispatched.
    pub fn flush_due(&self) -> usize {
        let now = Instant::now();
        let mut dispatched = 0;
        for batch in self.snapshot() {
            if let Some(spans) = batch.take_if_due(now) {
                self.spawn_flush(batch, spans);
                dispatched += 1;
            }
        }
        dispatched
    }

    /// Flushes the exporter's pending spans regardless of age. Returns the
    /// number of spans dispatched.
    pub fn flush(&self, exporter_id: Uuid) -> usize {
        let Some(batch) = self.get(exporter_id) else {
            return 0;
        };
        let spans = batch.take_all();
        let count = spans.len();
        if count > 0 {
            self.spawn_flush(batch, spans);
        }
        count
    }

    /// Flushes and forgets the exporter's batch. The next enqueue builds a
    /// new batch from the configuration it is given.
    pub fn remove(&self, exporter_id: Uuid) -> usize {
        let flushed = self.flush(exporter_id);
        self.batches
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&exporter_id);
        flushed
    }

    pub fn get(&self, exporter_id: Uuid) -> Option<Arc<ExportBatch>> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&exporter_id)
            .cloned()
    }

    pub fn pending_spans(&self, exporter_id: Uuid) -> usize {
        self.get(exporter_id).map_or(0, |b| b.pending_len())
    }

    pub fn len(&self) -> usize {
        self.batches.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush tasks still running.
    pub fn inflight(&self) -> usize {
        self.tracker.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuses further enqueues, drops spans that were never dispatched and
    /// waits up to `grace` for running flushes. Returns whether they all
    /// finished in time.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return self.tracker.is_empty();
        }

        for batch in self.snapshot() {
            let dropped = batch.take_all().len();
            if dropped > 0 {
                batch.stats.record_dropped(dropped as u64);
                tracing::warn!(
                    exporter_id = %batch.config.id,
                    span_count = dropped,
                    "Dropping unflushed spans at shutdown"
                );
            }
        }

        self.tracker.close();
        let finished = tokio::time::timeout(grace, self.tracker.wait()).await.is_ok();
        if !finished {
            tracing::warn!(
                inflight = self.tracker.len(),
                grace_ms = grace.as_millis() as u64,
                "Flushes still running after shutdown grace period"
            );
        }
        finished
    }

    fn snapshot(&self) -> Vec<Arc<ExportBatch>> {
        self.batches
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn batch_for(&self, config: &Arc<ExporterConfig>) -> Arc<ExportBatch> {
        if let Some(batch) = self.get(config.id) {
            return batch;
        }
        let mut batches = self.batches.write().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(batches.entry(config.id).or_insert_with(|| {
            tracing::debug!(exporter_id = %config.id, name = %config.name, "Created export batch");
            Arc::new(ExportBatch::new(
                Arc::clone(config),
                self.factory.build(config),
                self.stats.for_exporter(config.id),
            ))
        }))
    }

    fn spawn_flush(&self, batch: Arc<ExportBatch>, spans: Vec<OtelSpan>) {
        batch.stats.inc_inflight();
        self.tracker.spawn_on(
            async move {
                batch.export(spans).await;
                batch.stats.dec_inflight();
            },
            &self.handle,
        );
    }
}
