//! Exporter configuration.
//!
//! `ExporterConfig` is the stored shape of one configured destination;
//! `ExporterInput` is what callers submit to create one. Field names follow the
//! stored camelCase JSON layout.

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::metrics::ExporterStatsSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Transport used to reach the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterType {
    /// OTLP/JSON over HTTP POST
    Http,
    /// OTLP/protobuf over the gRPC `Export` RPC
    #[default]
    Grpc,
}

/// Lifecycle status of an exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterStatus {
    #[default]
    Active,
    Inactive,
    Error,
}

/// Request body compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

/// TLS material for a destination. Paths point at PEM files.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    /// Overrides the name used for certificate verification
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Batching behaviour of one exporter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    /// Pending span count that triggers an immediate flush, and the size of
    /// each outgoing request
    pub max_batch_size: usize,
    /// Upper bound on pending spans
    pub max_queue_size: usize,
    /// Age after which a non-empty batch is flushed by the periodic scan
    pub batch_timeout_ms: u64,
    /// Deadline for one whole flush
    pub export_timeout_ms: u64,
    /// Interval of the periodic scan (stored, the service tick applies)
    pub schedule_delay_ms: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 512,
            max_queue_size: 2048,
            batch_timeout_ms: 5000,
            export_timeout_ms: 30000,
            schedule_delay_ms: 1000,
        }
    }
}

impl BatchConfig {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn export_timeout(&self) -> Duration {
        Duration::from_millis(self.export_timeout_ms)
    }
}

/// Retry policy for failed sends.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    pub enabled: bool,
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub max_elapsed_time_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_interval_ms: 1000,
            max_interval_ms: 30000,
            max_elapsed_time_ms: 300_000,
            multiplier: 1.5,
        }
    }
}

impl RetryConfig {
    /// Wait before retry number `attempt` (1-based). Attempt 0 never waits.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = if self.multiplier.is_finite() && self.multiplier >= 1.0 {
            self.multiplier
        } else {
            1.0
        };
        let delay_ms =
            self.initial_interval_ms as f64 * multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis(delay_ms.min(self.max_interval_ms as f64) as u64)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_time_ms)
    }
}

/// A configured export destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterConfig {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub enabled: bool,
    #[serde(rename = "type")]
    pub exporter_type: ExporterType,
    #[serde(default)]
    pub status: ExporterStatus,

    pub endpoint: String,
    /// Values may contain `${VAR}` placeholders resolved at send time
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub compression: Compression,
    pub timeout_seconds: u64,
    /// Skip certificate verification
    #[serde(default)]
    pub insecure: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls_config: Option<TlsConfig>,

    #[serde(default)]
    pub batch_config: BatchConfig,
    #[serde(default)]
    pub retry_config: RetryConfig,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub resource_attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_name_filter: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata_filters: BTreeMap<String, String>,
    pub sampling_rate: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_export_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exported_count: u64,
    #[serde(default)]
    pub error_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: Uuid,
}

/// Caller input for creating an exporter. Unset fields take defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExporterInput {
    pub name: String,
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(rename = "type")]
    pub exporter_type: ExporterType,
    pub endpoint: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub compression: Option<Compression>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub insecure: Option<bool>,
    #[serde(default)]
    pub tls_config: Option<TlsConfig>,
    #[serde(default)]
    pub batch_config: Option<BatchConfig>,
    #[serde(default)]
    pub retry_config: Option<RetryConfig>,
    #[serde(default)]
    pub resource_attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub trace_name_filter: Option<String>,
    #[serde(default)]
    pub metadata_filters: BTreeMap<String, String>,
    #[serde(default)]
    pub sampling_rate: Option<f64>,
}

/// Errors rejecting an exporter configuration.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("name is required")]
    MissingName,
    #[error("endpoint is required")]
    MissingEndpoint,
    #[error("sampling rate must be within [0, 1], got {0}")]
    InvalidSamplingRate(f64),
    #[error("maxBatchSize must be greater than zero")]
    ZeroBatchSize,
    #[error("exportTimeoutMs must be greater than zero")]
    ZeroExportTimeout,
    #[error("timeoutSeconds must be greater than zero")]
    ZeroTimeout,
}

const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

impl ExporterConfig {
    /// Builds a new active exporter from caller input, applying defaults and
    /// validating the result.
    pub fn from_input(
        project_id: Uuid,
        created_by: Uuid,
        input: ExporterInput,
    ) -> Result<Self, ConfigError> {
        if input.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if input.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }

        let now = Utc::now();
        let config = Self {
            id: Uuid::new_v4(),
            project_id,
            name: input.name,
            enabled: input.enabled.unwrap_or(true),
            exporter_type: input.exporter_type,
            status: ExporterStatus::Active,
            endpoint: input.endpoint,
            headers: input.headers,
            compression: input.compression.unwrap_or(Compression::Gzip),
            timeout_seconds: input.timeout_seconds.unwrap_or(DEFAULT_TIMEOUT_SECONDS),
            insecure: input.insecure.unwrap_or(false),
            tls_config: input.tls_config,
            batch_config: input.batch_config.unwrap_or_default(),
            retry_config: input.retry_config.unwrap_or_default(),
            resource_attributes: input.resource_attributes,
            trace_name_filter: input.trace_name_filter.filter(|f| !f.is_empty()),
            metadata_filters: input.metadata_filters,
            sampling_rate: input.sampling_rate.unwrap_or(1.0),
            last_export_at: None,
            exported_count: 0,
            error_count: 0,
            last_error: None,
            last_error_at: None,
            created_at: now,
            updated_at: now,
            created_by,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks the invariants the pipeline relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::MissingName);
        }
        if self.endpoint.trim().is_empty() {
            return Err(ConfigError::MissingEndpoint);
        }
        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ConfigError::InvalidSamplingRate(self.sampling_rate));
        }
        if self.batch_config.max_batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.batch_config.export_timeout_ms == 0 {
            return Err(ConfigError::ZeroExportTimeout);
        }
        if self.timeout_seconds == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// Hard deadline of one outbound call.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }

    /// Copy of this config carrying the live export counters.
    #[must_use]
    pub fn with_stats(&self, stats: &ExporterStatsSnapshot) -> Self {
        Self {
            last_export_at: stats.last_export_at,
            exported_count: stats.exported_count,
            error_count: stats.error_count,
            last_error: stats.last_error.clone(),
            last_error_at: stats.last_error_at,
            ..self.clone()
        }
    }
}

/// Preset input for a named backend. Unknown names get a generic OTLP
/// collector on `localhost:4317`.
pub fn default_exporter_config(backend: &str) -> ExporterInput {
    let (name, exporter_type, endpoint, header) = match backend {
        "jaeger" => ("Jaeger", ExporterType::Grpc, "localhost:4317", None),
        "zipkin" => (
            "Zipkin",
            ExporterType::Http,
            "http://localhost:9411/api/v2/spans",
            None,
        ),
        "datadog" => (
            "Datadog",
            ExporterType::Http,
            "https://trace.agent.datadoghq.com/api/v0.2/traces",
            Some(("DD-API-KEY", "${DD_API_KEY}")),
        ),
        "honeycomb" => (
            "Honeycomb",
            ExporterType::Grpc,
            "api.honeycomb.io:443",
            Some(("x-honeycomb-team", "${HONEYCOMB_API_KEY}")),
        ),
        "grafana-tempo" => ("Grafana Tempo", ExporterType::Grpc, "localhost:4317", None),
        "newrelic" => (
            "New Relic",
            ExporterType::Grpc,
            "otlp.nr-data.net:4317",
            Some(("api-key", "${NEW_RELIC_API_KEY}")),
        ),
        _ => ("OTLP Collector", ExporterType::Grpc, "localhost:4317", None),
    };

    ExporterInput {
        name: name.to_owned(),
        exporter_type,
        endpoint: endpoint.to_owned(),
        headers: header
            .into_iter()
            .map(|(k, v)| (k.to_owned(), v.to_owned()))
            .collect(),
        ..ExporterInput::default()
    }
}

/// Identity stamped on every exported resource and scope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDefaults {
    pub service_name: String,
    pub service_version: String,
    pub scope_name: String,
    pub scope_version: String,
}

impl Default for ResourceDefaults {
    fn default() -> Self {
        Self {
            service_name: "agenttrace".to_owned(),
            service_version: "1.0.0".to_owned(),
            scope_name: "agenttrace".to_owned(),
            scope_version: "1.0.0".to_owned(),
        }
    }
}

/// Configuration of one `ExporterService` instance.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Tick of the periodic flush scan
    pub flush_interval: Duration,
    /// Settings for every per-destination circuit breaker
    pub breaker: CircuitBreakerConfig,
    pub resource: ResourceDefaults,
    /// How long `stop` waits for in-flight sends
    pub shutdown_grace: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            breaker: CircuitBreakerConfig::default(),
            resource: ResourceDefaults::default(),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl ServiceConfig {
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_breaker(mut self, breaker: CircuitBreakerConfig) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_resource(mut self, resource: ResourceDefaults) -> Self {
        self.resource = resource;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}
