//! OTLP domain model.
//!
//! These types mirror the OpenTelemetry trace data model closely enough to be
//! mapped onto either wire encoding (see `transport::json` and
//! `transport::proto`) while staying independent of both. Their own serde
//! representation is the internal queue/payload format, not OTLP/JSON.

use crate::ids;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Attribute map, ordered so encodings are deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// A single span ready for export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OtelSpan {
    /// 32 hex characters
    pub trace_id: String,
    /// 16 hex characters
    pub span_id: String,
    /// 16 hex characters, `None` for a root span
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub start_time_unix_nano: u64,
    pub end_time_unix_nano: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
    pub status: SpanStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<SpanEvent>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<SpanLink>,
}

/// Attribute value types for span, event, link and resource attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    String(String),
    Bool(bool),
    Int(i64),
    Double(f64),
}

/// Span kind as defined by the OpenTelemetry data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// Span status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

/// Span execution status.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpanStatus {
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A timestamped annotation inside a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanEvent {
    pub name: String,
    pub time_unix_nano: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

/// A reference from one span to another, possibly in a different trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attributes: Attributes,
}

/// Attributes identifying the producing service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Resource {
    pub attributes: Attributes,
}

/// The instrumentation library that produced a group of spans.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstrumentationScope {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
}

/// Spans grouped by instrumentation scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeSpans {
    pub scope: InstrumentationScope,
    pub spans: Vec<OtelSpan>,
}

/// Spans grouped by resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpans {
    pub resource: Resource,
    pub scope_spans: Vec<ScopeSpans>,
}

/// One OTLP trace export request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub resource_spans: Vec<ResourceSpans>,
}

/// A batch of spans detached from an exporter's queue.
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// Exporter the spans were queued for
    pub exporter_id: Uuid,
    /// Spans in enqueue order
    pub spans: Vec<OtelSpan>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

/// Nanoseconds since the Unix epoch, saturating at zero for earlier times.
pub fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

impl OtelSpan {
    /// Creates a span starting and ending now. Identifiers are normalised to
    /// their fixed hex widths.
    pub fn new(trace_id: &str, span_id: &str, name: impl Into<String>, kind: SpanKind) -> Self {
        let now = unix_nanos(SystemTime::now());
        Self {
            trace_id: ids::trace_id_hex(trace_id),
            span_id: ids::span_id_hex(span_id),
            parent_span_id: None,
            name: name.into(),
            kind,
            start_time_unix_nano: now,
            end_time_unix_nano: now,
            attributes: Attributes::new(),
            status: SpanStatus::default(),
            events: Vec::new(),
            links: Vec::new(),
        }
    }

    /// Sets the parent span id.
    pub fn with_parent(mut self, parent_span_id: &str) -> Self {
        self.parent_span_id = Some(ids::span_id_hex(parent_span_id));
        self
    }

    /// Adds an attribute to the span.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Marks the span as completed now with the given status.
    pub fn finish(&mut self, status: SpanStatus) {
        self.end_time_unix_nano = unix_nanos(SystemTime::now());
        self.status = status;
    }

    /// Duration of the span in nanoseconds.
    pub fn duration_nanos(&self) -> u64 {
        self.end_time_unix_nano.saturating_sub(self.start_time_unix_nano)
    }
}

impl SpanKind {
    /// Numeric value on the wire (`SPAN_KIND_INTERNAL` = 1 ...).
    pub fn as_otlp(self) -> i32 {
        match self {
            SpanKind::Internal => 1,
            SpanKind::Server => 2,
            SpanKind::Client => 3,
            SpanKind::Producer => 4,
            SpanKind::Consumer => 5,
        }
    }
}

impl StatusCode {
    /// Numeric value on the wire (`STATUS_CODE_UNSET` = 0 ...).
    pub fn as_otlp(self) -> i32 {
        match self {
            StatusCode::Unset => 0,
            StatusCode::Ok => 1,
            StatusCode::Error => 2,
        }
    }
}

impl SpanStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            message: Some(message.into()),
        }
    }
}

impl AttributeValue {
    /// Maps a JSON value onto an attribute. Strings, booleans and numbers keep
    /// their type; anything else (null, arrays, objects) is stringified.
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::String(s) => AttributeValue::String(s.clone()),
            serde_json::Value::Bool(b) => AttributeValue::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    AttributeValue::Int(i)
                } else {
                    AttributeValue::Double(n.as_f64().unwrap_or_default())
                }
            }
            other => AttributeValue::String(other.to_string()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::String(s) => f.write_str(s),
            AttributeValue::Bool(b) => write!(f, "{b}"),
            AttributeValue::Int(i) => write!(f, "{i}"),
            AttributeValue::Double(d) => write!(f, "{d}"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        AttributeValue::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        i64::try_from(value).map_or(AttributeValue::Double(value as f64), AttributeValue::Int)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}

impl Resource {
    /// Builds a resource from string attributes.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self {
            attributes: pairs
                .into_iter()
                .map(|(k, v)| (k.to_owned(), AttributeValue::from(v)))
                .collect(),
        }
    }
}

impl ResourceSpans {
    /// Total number of spans across all scopes.
    pub fn span_count(&self) -> usize {
        self.scope_spans.iter().map(|s| s.spans.len()).sum()
    }

    /// Iterates over all spans across all scopes.
    pub fn spans(&self) -> impl Iterator<Item = &OtelSpan> {
        self.scope_spans.iter().flat_map(|s| s.spans.iter())
    }
}

impl ExportRequest {
    /// Wraps a list of spans under a single resource and scope.
    pub fn single(resource: Resource, scope: InstrumentationScope, spans: Vec<OtelSpan>) -> Self {
        Self {
            resource_spans: vec![ResourceSpans {
                resource,
                scope_spans: vec![ScopeSpans { scope, spans }],
            }],
        }
    }

    /// Total number of spans in the request.
    pub fn span_count(&self) -> usize {
        self.resource_spans.iter().map(ResourceSpans::span_count).sum()
    }
}

impl SpanBatch {
    /// Creates a batch with the given spans.
    pub fn with_spans(exporter_id: Uuid, spans: Vec<OtelSpan>) -> Self {
        Self {
            exporter_id,
            spans,
            timestamp: SystemTime::now(),
        }
    }

    /// Returns the number of spans in the batch.
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}
