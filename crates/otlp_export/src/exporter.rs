use crate::config::ExporterConfig;
use crate::span::SpanBatch;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Error types for span export operations
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ExportError {
    /// Network-level failure (DNS, connect, reset, gRPC unavailable)
    #[error("transport error: {0}")]
    Transport(String),
    /// Payload could not be encoded
    #[error("serialization error: {0}")]
    Serialization(String),
    /// Collector answered with an HTTP status >= 400
    #[error("export failed with status {status}: {body}")]
    Status { status: u16, body: String },
    /// Collector refused the request for a non-transient reason (gRPC status)
    #[error("export rejected: {0}")]
    Rejected(String),
    /// Call deadline elapsed
    #[error("export operation timed out")]
    Timeout,
    /// Circuit breaker is open for the destination
    #[error("circuit breaker open: {destination} temporarily unavailable")]
    CircuitOpen { destination: String },
    /// Circuit breaker is half-open and its probe slots are taken
    #[error("circuit breaker half-open: too many concurrent requests to {destination}")]
    TooManyRequests { destination: String },
    /// Certificate material could not be loaded
    #[error("tls configuration error: {0}")]
    Tls(String),
    /// Endpoint could not be parsed into a target
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ExportError> },
    /// Pending queue is at `maxQueueSize`
    #[error("export queue full")]
    QueueFull,
    /// The exporter service has been stopped
    #[error("exporter service is shut down")]
    ShutDown,
}

impl ExportError {
    /// Whether a later attempt may succeed.
    ///
    /// Breaker rejections are not retryable: the breaker already decided the
    /// destination should be left alone.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExportError::Transport(_) | ExportError::Timeout => true,
            ExportError::Status { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Whether the error was produced by a circuit breaker without a call
    /// being attempted.
    pub fn is_breaker_rejection(&self) -> bool {
        matches!(
            self,
            ExportError::CircuitOpen { .. } | ExportError::TooManyRequests { .. }
        )
    }
}

/// Trait for exporting span batches to a collector.
///
/// Uses native async fn in traits instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn SpanExporterBoxed>`.
pub trait SpanExporter: Send + Sync {
    /// Exports a batch of spans.
    fn export(&self, batch: SpanBatch) -> impl Future<Output = Result<(), ExportError>> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Boxed export future.
pub type ExportFuture<'a> = Pin<Box<dyn Future<Output = Result<(), ExportError>> + Send + 'a>>;

/// Object-safe version of `SpanExporter` for dynamic dispatch.
pub trait SpanExporterBoxed: Send + Sync {
    /// Exports a batch of spans (boxed future for object safety).
    fn export_boxed(&self, batch: SpanBatch) -> ExportFuture<'_>;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Every `SpanExporter` is usable behind `Arc<dyn SpanExporterBoxed>`.
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed(&self, batch: SpanBatch) -> ExportFuture<'_> {
        Box::pin(self.export(batch))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }
}

/// Builds the exporter used to ship one configuration's batches.
///
/// Called once per exporter when its batch is created, so the transport choice
/// is fixed at configuration time.
pub trait ExporterFactory: Send + Sync {
    fn build(&self, config: &Arc<ExporterConfig>) -> Arc<dyn SpanExporterBoxed>;
}

impl<F> ExporterFactory for F
where
    F: Fn(&Arc<ExporterConfig>) -> Arc<dyn SpanExporterBoxed> + Send + Sync,
{
    fn build(&self, config: &Arc<ExporterConfig>) -> Arc<dyn SpanExporterBoxed> {
        self(config)
    }
}
