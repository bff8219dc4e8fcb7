//! Transport Layer
//!
//! Ships export requests to a collector over one of two transports, chosen
//! once per exporter configuration:
//!
//! - [`HttpExporter`]: OTLP/JSON over HTTP POST, optionally gzip-compressed
//! - [`GrpcExporter`]: OTLP/protobuf over the gRPC `Export` RPC on a cached
//!   channel per endpoint
//!
//! Both share a [`Destination`]: the exporter configuration, the circuit
//! breaker of the endpoint's host and the exporter's statistics. Every call
//! runs inside the breaker with `timeoutSeconds` as a hard deadline, so a
//! timed-out call counts as a failure.

pub mod grpc;
pub mod http;
pub mod json;
pub mod proto;
pub mod tls;

pub use grpc::{ChannelCache, GrpcExporter};
pub use http::HttpExporter;

use crate::circuit_breaker::{
    CallError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
};
use crate::config::{ExporterConfig, ExporterType, ResourceDefaults};
use crate::convert::attr;
use crate::exporter::{ExportError, ExporterFactory, SpanExporter, SpanExporterBoxed};
use crate::metrics::{ExporterStats, StatsRegistry};
use crate::retry::RetryingExporter;
use crate::span::{ExportRequest, InstrumentationScope, OtelSpan, Resource, SpanBatch};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

/// Expands `${VAR}` placeholders using `lookup`. Unset variables expand to
/// the empty string; an unterminated `${` is kept literally.
pub fn interpolate_env(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;
    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        out.push_str(&lookup(&rest[start + 2..start + 2 + len]).unwrap_or_default());
        rest = &rest[start + 2 + len + 1..];
    }
    out.push_str(rest);
    out
}

/// Header values with placeholders resolved from the process environment.
pub fn resolve_headers(headers: &BTreeMap<String, String>) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(k, v)| (k.clone(), interpolate_env(v, |name| std::env::var(name).ok())))
        .collect()
}

/// Circuit breaker key of an endpoint: `otel:` followed by its host (and
/// explicit port), or by the raw endpoint when it has no URL host, as with
/// `collector:4317`.
pub fn destination_key(endpoint: &str) -> String {
    let host = reqwest::Url::parse(endpoint).ok().and_then(|url| {
        url.host_str().map(|host| match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_owned(),
        })
    });
    format!("otel:{}", host.unwrap_or_else(|| endpoint.to_owned()))
}

/// State shared by every transport of one service.
#[derive(Clone)]
pub struct TransportContext {
    channels: Arc<ChannelCache>,
    breakers: Arc<CircuitBreakerRegistry>,
    stats: Arc<StatsRegistry>,
    resource: ResourceDefaults,
}

impl TransportContext {
    /// Context whose breakers log their state changes.
    pub fn new(breaker: CircuitBreakerConfig, resource: ResourceDefaults) -> Self {
        Self::with_breakers(Arc::new(CircuitBreakerRegistry::with_logging(breaker)), resource)
    }

    pub fn with_breakers(breakers: Arc<CircuitBreakerRegistry>, resource: ResourceDefaults) -> Self {
        Self {
            channels: Arc::new(ChannelCache::new()),
            breakers,
            stats: Arc::new(StatsRegistry::new()),
            resource,
        }
    }

    pub fn channels(&self) -> &Arc<ChannelCache> {
        &self.channels
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    pub fn stats(&self) -> &Arc<StatsRegistry> {
        &self.stats
    }

    pub fn resource(&self) -> &ResourceDefaults {
        &self.resource
    }
}

/// Everything a transport needs to know about where it sends.
pub struct Destination {
    config: Arc<ExporterConfig>,
    breaker: Arc<CircuitBreaker>,
    stats: Arc<ExporterStats>,
    resource: Resource,
    scope: InstrumentationScope,
}

impl Destination {
    pub fn new(config: Arc<ExporterConfig>, ctx: &TransportContext) -> Self {
        let defaults = ctx.resource();
        let mut resource = Resource::from_pairs([
            (attr::SERVICE_NAME, defaults.service_name.as_str()),
            (attr::SERVICE_VERSION, defaults.service_version.as_str()),
        ]);
        for (key, value) in &config.resource_attributes {
            resource.attributes.insert(key.clone(), value.as_str().into());
        }

        Self {
            breaker: ctx.breakers().get(&destination_key(&config.endpoint)),
            stats: ctx.stats().for_exporter(config.id),
            resource,
            scope: InstrumentationScope {
                name: defaults.scope_name.clone(),
                version: defaults.scope_version.clone(),
            },
            config,
        }
    }

    pub fn config(&self) -> &Arc<ExporterConfig> {
        &self.config
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    /// Wraps queued spans under this exporter's resource and scope.
    pub fn request_for(&self, spans: Vec<OtelSpan>) -> ExportRequest {
        ExportRequest::single(self.resource.clone(), self.scope.clone(), spans)
    }

    /// Runs one outbound call inside the circuit breaker with the per-call
    /// deadline.
    pub(crate) async fn guarded<T, F>(&self, call: F) -> Result<T, ExportError>
    where
        F: Future<Output = Result<T, ExportError>>,
    {
        let deadline = self.config.timeout();
        let result = self
            .breaker
            .call(async move {
                match tokio::time::timeout(deadline, call).await {
                    Ok(result) => result,
                    Err(_) => Err(ExportError::Timeout),
                }
            })
            .await;

        result.map_err(|e| match e {
            CallError::Open(destination) => {
                tracing::warn!(
                    exporter_id = %self.config.id,
                    endpoint = %self.config.endpoint,
                    destination = %destination,
                    "OTLP export blocked by circuit breaker"
                );
                ExportError::CircuitOpen { destination }
            }
            CallError::TooManyRequests(destination) => {
                tracing::warn!(
                    exporter_id = %self.config.id,
                    endpoint = %self.config.endpoint,
                    destination = %destination,
                    "OTLP export rejected, circuit breaker half-open probe in flight"
                );
                ExportError::TooManyRequests { destination }
            }
            CallError::Inner(e) => e,
        })
    }

    pub(crate) fn record_partial_success(&self, rejected_spans: i64, message: &str) {
        tracing::warn!(
            exporter_id = %self.config.id,
            endpoint = %self.config.endpoint,
            rejected_spans,
            error_message = message,
            "OTLP export had partial success"
        );
        self.stats.record_rejected(rejected_spans.max(0) as u64);
    }
}

/// The transport of one exporter, selected from its `type`.
pub enum Transport {
    Http(HttpExporter),
    Grpc(GrpcExporter),
}

impl Transport {
    pub fn for_config(config: Arc<ExporterConfig>, ctx: &TransportContext) -> Self {
        let exporter_type = config.exporter_type;
        let destination = Destination::new(config, ctx);
        match exporter_type {
            ExporterType::Http => Transport::Http(HttpExporter::new(destination)),
            ExporterType::Grpc => {
                Transport::Grpc(GrpcExporter::new(destination, Arc::clone(ctx.channels())))
            }
        }
    }

    pub fn destination(&self) -> &Destination {
        match self {
            Transport::Http(http) => http.destination(),
            Transport::Grpc(grpc) => grpc.destination(),
        }
    }

    /// Sends one fully built request.
    pub async fn send(&self, request: &ExportRequest) -> Result<(), ExportError> {
        match self {
            Transport::Http(http) => http.send(request).await,
            Transport::Grpc(grpc) => grpc.send(request).await,
        }
    }
}

impl SpanExporter for Transport {
    async fn export(&self, batch: SpanBatch) -> Result<(), ExportError> {
        let request = self.destination().request_for(batch.spans);
        self.send(&request).await
    }

    fn name(&self) -> &str {
        match self {
            Transport::Http(_) => "otlp-http",
            Transport::Grpc(_) => "otlp-grpc",
        }
    }
}

/// Builds a [`Transport`] per exporter, wrapped in a [`RetryingExporter`]
/// when the exporter's retry policy is enabled.
#[derive(Clone)]
pub struct TransportFactory {
    ctx: TransportContext,
}

impl TransportFactory {
    pub fn new(ctx: TransportContext) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &TransportContext {
        &self.ctx
    }
}

impl ExporterFactory for TransportFactory {
    fn build(&self, config: &Arc<ExporterConfig>) -> Arc<dyn SpanExporterBoxed> {
        let transport = Transport::for_config(Arc::clone(config), &self.ctx);
        if config.retry_config.enabled {
            Arc::new(RetryingExporter::new(transport, config.retry_config))
        } else {
            Arc::new(transport)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::config::{default_exporter_config, ExporterInput, RetryConfig};
    use crate::span::SpanKind;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    fn exporter(endpoint: &str, exporter_type: ExporterType) -> Arc<ExporterConfig> {
        let input = ExporterInput {
            name: "test".into(),
            endpoint: endpoint.into(),
            exporter_type,
            timeout_seconds: Some(1),
            ..ExporterInput::default()
        };
        Arc::new(ExporterConfig::from_input(Uuid::nil(), Uuid::nil(), input).unwrap())
    }

    fn context(max_failures: u32) -> TransportContext {
        TransportContext::new(
            CircuitBreakerConfig {
                max_failures,
                ..CircuitBreakerConfig::default()
            },
            ResourceDefaults::default(),
        )
    }

    #[test]
    fn test_interpolate_env() {
        let lookup = |name: &str| (name == "API_KEY").then(|| "secret".to_owned());

        assert_eq!(interpolate_env("${API_KEY}", lookup), "secret");
        assert_eq!(interpolate_env("Bearer ${API_KEY}", lookup), "Bearer secret");
        assert_eq!(interpolate_env("${MISSING}", lookup), "");
        assert_eq!(interpolate_env("a${API_KEY}b${API_KEY}", lookup), "asecretbsecret");
        assert_eq!(interpolate_env("${UNTERMINATED", lookup), "${UNTERMINATED");
        assert_eq!(interpolate_env("plain", lookup), "plain");
        assert_eq!(interpolate_env("$API_KEY", lookup), "$API_KEY");
    }

    #[test]
    fn test_destination_key() {
        assert_eq!(destination_key("http://localhost:4318/v1/traces"), "otel:localhost:4318");
        assert_eq!(
            destination_key("https://trace.agent.datadoghq.com/api/v0.2/traces"),
            "otel:trace.agent.datadoghq.com"
        );
        assert_eq!(destination_key("localhost:4317"), "otel:localhost:4317");
        assert_eq!(destination_key("api.honeycomb.io:443"), "otel:api.honeycomb.io:443");
    }

    #[test]
    fn test_transport_selected_by_type() {
        let ctx = context(5);
        let http = Transport::for_config(exporter("http://localhost:4318/v1/traces", ExporterType::Http), &ctx);
        let grpc = Transport::for_config(exporter("localhost:4317", ExporterType::Grpc), &ctx);

        assert_eq!(SpanExporter::name(&http), "otlp-http");
        assert_eq!(SpanExporter::name(&grpc), "otlp-grpc");
        assert_eq!(http.destination().breaker().name(), "otel:localhost:4318");
        assert_eq!(ctx.breakers().len(), 2);
    }

    #[test]
    fn test_destinations_share_breaker_by_host() {
        let ctx = context(5);
        let a = Destination::new(exporter("http://collector:4318/v1/traces", ExporterType::Http), &ctx);
        let b = Destination::new(exporter("http://collector:4318/other", ExporterType::Http), &ctx);
        assert!(Arc::ptr_eq(a.breaker(), b.breaker()));
    }

    #[test]
    fn test_request_resource_applies_overrides() {
        let mut input = default_exporter_config("zipkin");
        input.resource_attributes.insert("service.name".into(), "custom".into());
        input.resource_attributes.insert("deployment.environment".into(), "staging".into());
        let config = Arc::new(ExporterConfig::from_input(Uuid::nil(), Uuid::nil(), input).unwrap());

        let destination = Destination::new(config, &context(5));
        let request = destination.request_for(Vec::new());
        let attrs = &request.resource_spans[0].resource.attributes;

        assert_eq!(attrs["service.name"].to_string(), "custom");
        assert_eq!(attrs["service.version"].to_string(), "1.0.0");
        assert_eq!(attrs["deployment.environment"].to_string(), "staging");
        assert_eq!(request.resource_spans[0].scope_spans[0].scope.name, "agenttrace");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_counts_against_breaker() {
        let ctx = context(2);
        let destination = Destination::new(exporter("http://slow:4318", ExporterType::Http), &ctx);

        for _ in 0..2 {
            let result = destination
                .guarded(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
                .await;
            assert_eq!(result, Err(ExportError::Timeout));
        }
        assert_eq!(destination.breaker().state(), CircuitState::Open);

        let rejected = destination.guarded(async { Ok(()) }).await;
        assert_eq!(
            rejected,
            Err(ExportError::CircuitOpen {
                destination: "otel:slow:4318".into()
            })
        );
    }

    /// Collector answering every export with 503, counting requests.
    async fn unavailable_collector() -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let app = Router::new().route(
            "/v1/traces",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { (StatusCode::SERVICE_UNAVAILABLE, "busy") }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (format!("http://{addr}/v1/traces"), hits)
    }

    #[tokio::test]
    async fn test_factory_retries_when_enabled() {
        let (endpoint, hits) = unavailable_collector().await;
        let factory = TransportFactory::new(context(100));
        let mut config = (*exporter(&endpoint, ExporterType::Http)).clone();
        config.retry_config = RetryConfig {
            enabled: true,
            initial_interval_ms: 10,
            max_interval_ms: 10,
            max_elapsed_time_ms: 200,
            multiplier: 1.0,
        };
        let batch = SpanBatch::with_spans(
            config.id,
            vec![OtelSpan::new("1", "1", "op", SpanKind::Internal)],
        );

        let retrying = factory.build(&Arc::new(config.clone()));
        match retrying.export_boxed(batch.clone()).await {
            Err(ExportError::RetriesExhausted { attempts, last }) => {
                assert!(attempts > 1, "only {attempts} attempt(s)");
                assert_eq!(hits.load(Ordering::SeqCst), attempts as usize);
                assert!(matches!(*last, ExportError::Status { status: 503, .. }));
            }
            other => panic!("expected RetriesExhausted, got {other:?}"),
        }

        hits.store(0, Ordering::SeqCst);
        config.retry_config.enabled = false;
        let single = factory.build(&Arc::new(config));
        let err = single.export_boxed(batch).await.unwrap_err();
        assert!(matches!(err, ExportError::Status { status: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
