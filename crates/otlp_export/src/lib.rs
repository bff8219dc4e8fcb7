//! OTLP Trace Export
//!
//! Ships recorded traces to external OpenTelemetry collectors. Traces and
//! their observations are converted into OTLP spans, queued per exporter,
//! flushed on size or age, and sent over OTLP/JSON HTTP or OTLP/gRPC behind a
//! per-destination circuit breaker.
//!
//! ```text
//! TraceRecord + observations
//!        │ convert
//!        ▼
//!   ExporterService ──enqueue──► BatchManager ──flush task──► Transport
//!        │                        (one batch per exporter)     (HTTP | gRPC)
//!        └── periodic flush loop                                  │
//!                                                        CircuitBreakerRegistry
//! ```
//!
//! Delivery is at most once per batch: a failed flush is counted and its
//! spans are dropped, never re-queued.
//!
//! The [`SpanExporter`] trait uses native async fn in traits; use
//! [`SpanExporterBoxed`] behind an `Arc<dyn _>` for dynamic dispatch.

#[macro_use]
mod invariants;

pub mod batch;
pub mod circuit_breaker;
pub mod config;
pub mod convert;
pub mod exporter;
pub mod ids;
pub mod metrics;
pub mod observability;
pub mod record;
pub mod retry;
pub mod service;
pub mod span;
pub mod transport;

// Re-export main types
pub use batch::{BatchManager, EnqueueOutcome, ExportBatch};
pub use circuit_breaker::{
    BreakerStats, CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitState,
};
pub use config::{
    default_exporter_config, BatchConfig, Compression, ConfigError, ExporterConfig, ExporterInput,
    ExporterStatus, ExporterType, ResourceDefaults, RetryConfig, ServiceConfig, TlsConfig,
};
pub use convert::{convert_trace, SpanConverter};
pub use exporter::{ExportError, ExporterFactory, SpanExporter, SpanExporterBoxed};
pub use metrics::{ExporterStats, ExporterStatsSnapshot, StatsRegistry};
pub use record::{ObservationRecord, ObservationType, TraceRecord};
pub use retry::RetryingExporter;
pub use service::ExporterService;
pub use span::{
    AttributeValue, ExportRequest, OtelSpan, ResourceSpans, SpanBatch, SpanKind, SpanStatus,
    StatusCode,
};
pub use transport::{Transport, TransportContext, TransportFactory};
