//! Exporter Service
//!
//! Owns the exporter configurations, the batch manager, the transports and
//! the periodic flush loop. The flush loop is a task owned by the service:
//! [`ExporterService::start`] spawns it and [`ExporterService::stop`] ends it.

use crate::batch::{BatchManager, EnqueueOutcome};
use crate::circuit_breaker::BreakerStats;
use crate::config::{
    self, ConfigError, ExporterConfig, ExporterInput, ExporterStatus, ServiceConfig,
};
use crate::convert::SpanConverter;
use crate::exporter::{ExportError, ExporterFactory};
use crate::metrics::ExporterStatsSnapshot;
use crate::record::{ObservationRecord, TraceRecord};
use crate::span::{
    unix_nanos, ExportRequest, InstrumentationScope, OtelSpan, Resource, ResourceSpans, SpanKind,
    SpanStatus,
};
use crate::transport::{Transport, TransportContext, TransportFactory};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

const TEST_TRACE_ID: &str = "00000000000000000000000000000001";
const TEST_SPAN_ID: &str = "0000000000000001";

/// The export pipeline of one process.
pub struct ExporterService {
    config: ServiceConfig,
    transports: TransportContext,
    batches: Arc<BatchManager>,
    converter: SpanConverter,
    exporters: RwLock<HashMap<Uuid, Arc<ExporterConfig>>>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    stopped: AtomicBool,
}

impl ExporterService {
    /// Starts a service that ships batches over the configured transports.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: ServiceConfig) -> Self {
        let transports = TransportContext::new(config.breaker, config.resource.clone());
        let factory = Arc::new(TransportFactory::new(transports.clone()));
        Self::assemble(config, transports, factory)
    }

    /// Starts a service whose batches are shipped by exporters from
    /// `factory`. `test_exporter` still uses the real transports.
    pub fn with_factory(config: ServiceConfig, factory: Arc<dyn ExporterFactory>) -> Self {
        let transports = TransportContext::new(config.breaker, config.resource.clone());
        Self::assemble(config, transports, factory)
    }

    fn assemble(
        config: ServiceConfig,
        transports: TransportContext,
        factory: Arc<dyn ExporterFactory>,
    ) -> Self {
        let handle = Handle::current();
        let batches = Arc::new(BatchManager::new(
            handle.clone(),
            factory,
            Arc::clone(transports.stats()),
        ));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let tick = config.flush_interval.max(Duration::from_millis(1));
        let loop_batches = Arc::clone(&batches);
        let flush_task = handle.spawn(async move {
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let dispatched = loop_batches.flush_due();
                        if dispatched > 0 {
                            tracing::trace!(dispatched, "Periodic flush dispatched batches");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        tracing::info!(
            flush_interval_ms = tick.as_millis() as u64,
            max_failures = config.breaker.max_failures,
            "OTLP exporter service started"
        );

        Self {
            converter: SpanConverter::new(config.resource.clone()),
            config,
            transports,
            batches,
            exporters: RwLock::new(HashMap::new()),
            flush_task: Mutex::new(Some(flush_task)),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            stopped: AtomicBool::new(false),
        }
    }

    /// Preset input for a named backend.
    pub fn default_exporter_config(backend: &str) -> ExporterInput {
        config::default_exporter_config(backend)
    }

    /// Validates `input`, applies defaults and registers the exporter.
    pub fn create_exporter(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        input: ExporterInput,
    ) -> Result<Arc<ExporterConfig>, ConfigError> {
        let exporter = Arc::new(ExporterConfig::from_input(project_id, user_id, input)?);
        self.exporters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(exporter.id, Arc::clone(&exporter));

        tracing::info!(
            exporter_id = %exporter.id,
            project_id = %project_id,
            name = %exporter.name,
            exporter_type = ?exporter.exporter_type,
            endpoint = %exporter.endpoint,
            "Created OTLP exporter"
        );
        Ok(exporter)
    }

    /// The registered exporter with its export counters filled in.
    pub fn exporter(&self, exporter_id: Uuid) -> Option<Arc<ExporterConfig>> {
        let exporter = self
            .exporters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&exporter_id)
            .cloned()?;
        match self.stats(exporter_id) {
            Some(stats) => Some(Arc::new(exporter.with_stats(&stats))),
            None => Some(exporter),
        }
    }

    /// Flushes and forgets the exporter. Returns whether it was known.
    pub fn remove_exporter(&self, exporter_id: Uuid) -> bool {
        let flushed = self.batches.remove(exporter_id);
        let known = self
            .exporters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&exporter_id)
            .is_some();
        if known || flushed > 0 {
            tracing::info!(exporter_id = %exporter_id, flushed, "Removed OTLP exporter");
        }
        known
    }

    pub fn convert_trace(
        &self,
        trace: &TraceRecord,
        observations: &[ObservationRecord],
        resource_overrides: &BTreeMap<String, String>,
    ) -> ResourceSpans {
        self.converter.convert(trace, observations, resource_overrides)
    }

    /// Queues spans for the exporter. Never waits on the network.
    pub fn queue_spans_for_export(
        &self,
        exporter: &Arc<ExporterConfig>,
        spans: Vec<OtelSpan>,
    ) -> Result<EnqueueOutcome, ExportError> {
        self.batches.enqueue(exporter, spans)
    }

    /// Applies the exporter's trace filters, converts the trace and queues
    /// its spans.
    pub fn export_trace(
        &self,
        exporter: &Arc<ExporterConfig>,
        trace: &TraceRecord,
        observations: &[ObservationRecord],
    ) -> Result<EnqueueOutcome, ExportError> {
        if !matches_filters(exporter, trace) {
            tracing::trace!(exporter_id = %exporter.id, trace_id = %trace.id, "Trace filtered out");
            return Ok(EnqueueOutcome::Filtered);
        }
        let converted = self.convert_trace(trace, observations, &exporter.resource_attributes);
        let spans = converted
            .scope_spans
            .into_iter()
            .flat_map(|scope| scope.spans)
            .collect();
        self.queue_spans_for_export(exporter, spans)
    }

    /// Sends one synthetic span straight through the exporter's transport,
    /// bypassing batching and retry.
    pub async fn test_exporter(&self, exporter: &ExporterConfig) -> Result<(), ExportError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(ExportError::ShutDown);
        }

        let transport = Transport::for_config(Arc::new(exporter.clone()), &self.transports);
        let now = unix_nanos(SystemTime::now());
        let mut span = OtelSpan::new(TEST_TRACE_ID, TEST_SPAN_ID, "agenttrace.test", SpanKind::Internal);
        span.start_time_unix_nano = now;
        span.end_time_unix_nano = now + 1_000_000;
        span.set_attribute("test", true);
        span.status = SpanStatus::ok();

        let defaults = &self.config.resource;
        let request = ExportRequest::single(
            Resource::from_pairs([("service.name", "agenttrace-test")]),
            InstrumentationScope {
                name: defaults.scope_name.clone(),
                version: defaults.scope_version.clone(),
            },
            vec![span],
        );

        match transport.send(&request).await {
            Ok(()) => {
                tracing::info!(
                    exporter_id = %exporter.id,
                    endpoint = %exporter.endpoint,
                    "OTLP exporter test succeeded"
                );
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    exporter_id = %exporter.id,
                    endpoint = %exporter.endpoint,
                    error = %e,
                    "OTLP exporter test failed"
                );
                Err(e)
            }
        }
    }

    /// Status the exporter should be stored with, decided by a test send.
    pub async fn health_check(&self, exporter: &ExporterConfig) -> ExporterStatus {
        if !exporter.enabled {
            return ExporterStatus::Inactive;
        }
        match self.test_exporter(exporter).await {
            Ok(()) => ExporterStatus::Active,
            Err(_) => ExporterStatus::Error,
        }
    }

    pub fn stats(&self, exporter_id: Uuid) -> Option<ExporterStatsSnapshot> {
        self.transports.stats().snapshot(exporter_id)
    }

    pub fn circuit_breaker_stats(&self) -> Vec<BreakerStats> {
        self.transports.breakers().stats()
    }

    pub fn pending_spans(&self, exporter_id: Uuid) -> usize {
        self.batches.pending_spans(exporter_id)
    }

    /// gRPC connections opened since start.
    pub fn grpc_connections_created(&self) -> u64 {
        self.transports.channels().connections_created()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stops the flush loop, drops spans that were never dispatched, waits
    /// up to the shutdown grace for running flushes and closes cached gRPC
    /// connections. Later calls return immediately.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }

        let shutdown_tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = shutdown_tx {
            let _ = tx.send(());
        }
        let flush_task = self
            .flush_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = flush_task {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Flush loop ended abnormally");
            }
        }

        let flushed_in_time = self.batches.shutdown(self.config.shutdown_grace).await;
        let closed = self.transports.channels().close_all();
        tracing::info!(
            flushed_in_time,
            closed_connections = closed,
            "OTLP exporter service stopped"
        );
    }
}

impl Drop for ExporterService {
    fn drop(&mut self) {
        if let Some(task) = self
            .flush_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}

/// Whether `trace` passes the exporter's name substring filter and every
/// metadata filter. Metadata filters compare against top-level keys of the
/// trace's JSON metadata; non-string values compare by their JSON text.
fn matches_filters(exporter: &ExporterConfig, trace: &TraceRecord) -> bool {
    if let Some(filter) = &exporter.trace_name_filter {
        if !trace.name.contains(filter.as_str()) {
            return false;
        }
    }
    if exporter.metadata_filters.is_empty() {
        return true;
    }

    let metadata = trace
        .metadata
        .as_deref()
        .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok());
    let Some(metadata) = metadata else {
        return false;
    };

    exporter
        .metadata_filters
        .iter()
        .all(|(key, expected)| match metadata.get(key) {
            Some(serde_json::Value::String(actual)) => actual == expected,
            Some(other) => other.to_string() == *expected,
            None => false,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::config::{BatchConfig, ExporterType};
    use crate::exporter::testing::RecordingExporter;
    use crate::exporter::SpanExporterBoxed;
    use crate::record::ObservationType;

    fn recording_service(flush_interval: Duration) -> (ExporterService, Arc<RecordingExporter>) {
        let recording = Arc::new(RecordingExporter::new());
        let shared: Arc<dyn SpanExporterBoxed> = recording.clone();
        let factory = move |_: &Arc<ExporterConfig>| Arc::clone(&shared);
        let service = ExporterService::with_factory(
            ServiceConfig::default().with_flush_interval(flush_interval),
            Arc::new(factory),
        );
        (service, recording)
    }

    fn input(batch_timeout_ms: u64) -> ExporterInput {
        ExporterInput {
            name: "local".into(),
            endpoint: "http://localhost:4318/v1/traces".into(),
            exporter_type: ExporterType::Http,
            batch_config: Some(BatchConfig {
                max_batch_size: 10,
                batch_timeout_ms,
                ..BatchConfig::default()
            }),
            ..ExporterInput::default()
        }
    }

    fn trace(name: &str, metadata: Option<&str>) -> TraceRecord {
        let mut trace = TraceRecord::new("trace-1", Uuid::nil(), name);
        trace.metadata = metadata.map(str::to_owned);
        trace
    }

    #[tokio::test]
    async fn test_create_exporter_registers_and_validates() {
        let (service, _) = recording_service(Duration::from_secs(1));
        let exporter = service
            .create_exporter(Uuid::nil(), Uuid::nil(), input(5000))
            .unwrap();
        assert_eq!(service.exporter(exporter.id).unwrap().name, "local");

        let missing = ExporterInput::default();
        assert_eq!(
            service.create_exporter(Uuid::nil(), Uuid::nil(), missing).unwrap_err(),
            ConfigError::MissingName
        );
        service.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_loop_flushes_old_batches() {
        let (service, recording) = recording_service(Duration::from_millis(10));
        let exporter = service
            .create_exporter(Uuid::nil(), Uuid::nil(), input(100))
            .unwrap();

        let span = OtelSpan::new("1", "1", "op", SpanKind::Internal);
        service.queue_spans_for_export(&exporter, vec![span]).unwrap();

        tokio::time::sleep(Duration::from_millis(95)).await;
        assert_eq!(recording.exported_count(), 0);

        tokio::time::sleep(Duration::from_millis(55)).await;
        assert_eq!(recording.exported_count(), 1);
        assert_eq!(service.stats(exporter.id).unwrap().exported_count, 1);

        let live = service.exporter(exporter.id).unwrap();
        assert_eq!(live.exported_count, 1);
        assert_eq!(live.error_count, 0);
        assert!(live.last_export_at.is_some());

        service.stop().await;
    }

    #[tokio::test]
    async fn test_export_trace_applies_filters() {
        let (service, _) = recording_service(Duration::from_secs(1));
        let mut with_filters = input(5000);
        with_filters.trace_name_filter = Some("chat".into());
        with_filters
            .metadata_filters
            .insert("env".into(), "prod".into());
        with_filters
            .metadata_filters
            .insert("tier".into(), "2".into());
        let exporter = service
            .create_exporter(Uuid::nil(), Uuid::nil(), with_filters)
            .unwrap();

        let obs = ObservationRecord::new("obs-1", "trace-1", ObservationType::Generation, "llm");

        let wrong_name = trace("summarize", Some(r#"{"env":"prod","tier":2}"#));
        assert_eq!(
            service.export_trace(&exporter, &wrong_name, &[obs.clone()]).unwrap(),
            EnqueueOutcome::Filtered
        );

        let wrong_env = trace("chat-completion", Some(r#"{"env":"dev","tier":2}"#));
        assert_eq!(
            service.export_trace(&exporter, &wrong_env, &[obs.clone()]).unwrap(),
            EnqueueOutcome::Filtered
        );

        let no_metadata = trace("chat-completion", None);
        assert_eq!(
            service.export_trace(&exporter, &no_metadata, &[obs.clone()]).unwrap(),
            EnqueueOutcome::Filtered
        );

        let matching = trace("chat-completion", Some(r#"{"env":"prod","tier":2,"x":1}"#));
        assert_eq!(
            service.export_trace(&exporter, &matching, &[obs]).unwrap(),
            EnqueueOutcome::Queued { pending: 2 }
        );
        service.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_refuses_work() {
        let (service, recording) = recording_service(Duration::from_secs(1));
        let exporter = service
            .create_exporter(Uuid::nil(), Uuid::nil(), input(5000))
            .unwrap();
        let span = OtelSpan::new("1", "1", "op", SpanKind::Internal);
        service.queue_spans_for_export(&exporter, vec![span.clone()]).unwrap();

        service.stop().await;
        service.stop().await;

        assert!(service.is_stopped());
        assert_eq!(recording.exported_count(), 0);
        assert_eq!(
            service.queue_spans_for_export(&exporter, vec![span]),
            Err(ExportError::ShutDown)
        );
        assert_eq!(service.test_exporter(&exporter).await, Err(ExportError::ShutDown));
    }

    #[tokio::test]
    async fn test_remove_exporter_flushes_pending() {
        let (service, recording) = recording_service(Duration::from_secs(60));
        let exporter = service
            .create_exporter(Uuid::nil(), Uuid::nil(), input(5000))
            .unwrap();
        let span = OtelSpan::new("1", "1", "op", SpanKind::Internal);
        service.queue_spans_for_export(&exporter, vec![span]).unwrap();
        assert_eq!(service.pending_spans(exporter.id), 1);

        assert!(service.remove_exporter(exporter.id));
        assert!(service.exporter(exporter.id).is_none());
        assert!(!service.remove_exporter(exporter.id));

        service.stop().await;
        assert_eq!(recording.exported_count(), 1);
    }

    #[tokio::test]
    async fn test_health_check_against_unreachable_collector() {
        let service = ExporterService::start(ServiceConfig::default());
        let mut unreachable = input(5000);
        unreachable.endpoint = "http://127.0.0.1:1/v1/traces".into();
        unreachable.timeout_seconds = Some(2);
        let exporter = service
            .create_exporter(Uuid::nil(), Uuid::nil(), unreachable)
            .unwrap();

        assert_eq!(service.health_check(&exporter).await, ExporterStatus::Error);

        let breakers = service.circuit_breaker_stats();
        assert_eq!(breakers.len(), 1);
        assert_eq!(breakers[0].name, "otel:127.0.0.1:1");
        assert_eq!(breakers[0].state, CircuitState::Closed);
        assert_eq!(breakers[0].failures, 1);

        let mut disabled = (*exporter).clone();
        disabled.enabled = false;
        assert_eq!(service.health_check(&disabled).await, ExporterStatus::Inactive);
        service.stop().await;
    }

    #[test]
    fn test_metadata_filter_rendering() {
        let mut exporter = ExporterConfig::from_input(Uuid::nil(), Uuid::nil(), input(5000)).unwrap();
        exporter.metadata_filters.insert("beta".into(), "true".into());

        assert!(matches_filters(&exporter, &trace("t", Some(r#"{"beta":true}"#))));
        assert!(matches_filters(&exporter, &trace("t", Some(r#"{"beta":"true"}"#))));
        assert!(!matches_filters(&exporter, &trace("t", Some(r#"{"beta":false}"#))));
        assert!(!matches_filters(&exporter, &trace("t", Some("not json"))));
    }
}
