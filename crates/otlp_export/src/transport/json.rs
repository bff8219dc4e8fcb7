//! OTLP/JSON encoding.
//!
//! Follows the protobuf JSON mapping used by OTLP/HTTP: camelCase field
//! names, enums as integers, 64-bit integers as decimal strings, ids as hex,
//! attributes as `{key, value: {stringValue | boolValue | intValue | doubleValue}}`.

use crate::exporter::ExportError;
use crate::ids;
use crate::span::{
    AttributeValue, Attributes, ExportRequest, InstrumentationScope, OtelSpan, ResourceSpans,
    SpanEvent, SpanLink,
};
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonExportRequest<'a> {
    resource_spans: Vec<JsonResourceSpans<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonResourceSpans<'a> {
    resource: JsonResource<'a>,
    scope_spans: Vec<JsonScopeSpans<'a>>,
}

#[derive(Serialize)]
struct JsonResource<'a> {
    attributes: Vec<JsonKeyValue<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonScopeSpans<'a> {
    scope: JsonScope<'a>,
    spans: Vec<JsonSpan<'a>>,
}

#[derive(Serialize)]
struct JsonScope<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "is_blank")]
    version: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonSpan<'a> {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_span_id: Option<String>,
    name: &'a str,
    kind: i32,
    start_time_unix_nano: String,
    end_time_unix_nano: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<JsonKeyValue<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    events: Vec<JsonEvent<'a>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    links: Vec<JsonLink<'a>>,
    status: JsonStatus<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonEvent<'a> {
    time_unix_nano: String,
    name: &'a str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<JsonKeyValue<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JsonLink<'a> {
    trace_id: String,
    span_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    attributes: Vec<JsonKeyValue<'a>>,
}

#[derive(Serialize)]
struct JsonStatus<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a str>,
    code: i32,
}

#[derive(Serialize)]
struct JsonKeyValue<'a> {
    key: &'a str,
    value: JsonAnyValue<'a>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
enum JsonAnyValue<'a> {
    StringValue(&'a str),
    BoolValue(bool),
    IntValue(String),
    DoubleValue(f64),
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_blank(s: &&str) -> bool {
    s.is_empty()
}

fn key_values(attributes: &Attributes) -> Vec<JsonKeyValue<'_>> {
    attributes
        .iter()
        .map(|(key, value)| JsonKeyValue {
            key,
            value: match value {
                AttributeValue::String(s) => JsonAnyValue::StringValue(s),
                AttributeValue::Bool(b) => JsonAnyValue::BoolValue(*b),
                AttributeValue::Int(i) => JsonAnyValue::IntValue(i.to_string()),
                AttributeValue::Double(d) => JsonAnyValue::DoubleValue(*d),
            },
        })
        .collect()
}

fn scope(scope: &InstrumentationScope) -> JsonScope<'_> {
    JsonScope {
        name: &scope.name,
        version: &scope.version,
    }
}

fn event(event: &SpanEvent) -> JsonEvent<'_> {
    JsonEvent {
        time_unix_nano: event.time_unix_nano.to_string(),
        name: &event.name,
        attributes: key_values(&event.attributes),
    }
}

fn link(link: &SpanLink) -> JsonLink<'_> {
    JsonLink {
        trace_id: ids::trace_id_hex(&link.trace_id),
        span_id: ids::span_id_hex(&link.span_id),
        attributes: key_values(&link.attributes),
    }
}

/// Ids are re-normalised here since spans can be deserialized or mutated
/// without passing through [`OtelSpan::new`].
fn span(span: &OtelSpan) -> JsonSpan<'_> {
    JsonSpan {
        trace_id: ids::trace_id_hex(&span.trace_id),
        span_id: ids::span_id_hex(&span.span_id),
        parent_span_id: span
            .parent_span_id
            .as_deref()
            .filter(|p| !p.is_empty())
            .map(ids::span_id_hex),
        name: &span.name,
        kind: span.kind.as_otlp(),
        start_time_unix_nano: span.start_time_unix_nano.to_string(),
        end_time_unix_nano: span.end_time_unix_nano.to_string(),
        attributes: key_values(&span.attributes),
        events: span.events.iter().map(event).collect(),
        links: span.links.iter().map(link).collect(),
        status: JsonStatus {
            message: span.status.message.as_deref().filter(|m| !m.is_empty()),
            code: span.status.code.as_otlp(),
        },
    }
}

fn resource_spans(rs: &ResourceSpans) -> JsonResourceSpans<'_> {
    JsonResourceSpans {
        resource: JsonResource {
            attributes: key_values(&rs.resource.attributes),
        },
        scope_spans: rs
            .scope_spans
            .iter()
            .map(|ss| JsonScopeSpans {
                scope: scope(&ss.scope),
                spans: ss.spans.iter().map(span).collect(),
            })
            .collect(),
    }
}

/// Encodes a request as an OTLP/JSON body.
pub fn encode_request(request: &ExportRequest) -> Result<Vec<u8>, ExportError> {
    let envelope = JsonExportRequest {
        resource_spans: request.resource_spans.iter().map(resource_spans).collect(),
    };
    serde_json::to_vec(&envelope).map_err(|e| ExportError::Serialization(e.to_string()))
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JsonExportResponse {
    #[serde(default)]
    partial_success: Option<JsonPartialSuccess>,
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct JsonPartialSuccess {
    #[serde(default)]
    rejected_spans: Option<JsonInt>,
    #[serde(default)]
    error_message: String,
}

/// int64 fields may arrive as a JSON number or a decimal string.
#[derive(Deserialize)]
#[serde(untagged)]
enum JsonInt {
    Number(i64),
    Text(String),
}

impl JsonInt {
    fn value(&self) -> i64 {
        match self {
            JsonInt::Number(n) => *n,
            JsonInt::Text(s) => s.trim().parse().unwrap_or(0),
        }
    }
}

/// Rejected span count and message of a partial-success response body.
/// Returns `None` for empty, non-JSON or fully successful responses.
pub fn parse_partial_success(body: &[u8]) -> Option<(i64, String)> {
    if body.is_empty() {
        return None;
    }
    let response: JsonExportResponse = serde_json::from_slice(body).ok()?;
    let partial = response.partial_success?;
    let rejected = partial.rejected_spans.as_ref().map_or(0, JsonInt::value);
    (rejected > 0).then_some((rejected, partial.error_message))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{Resource, SpanKind, SpanStatus};
    use serde_json::{json, Value};

    fn request() -> ExportRequest {
        let mut root = OtelSpan::new("abc", "1", "root", SpanKind::Server);
        root.start_time_unix_nano = 1_700_000_000_000_000_000;
        root.end_time_unix_nano = 1_700_000_001_000_000_000;
        root.set_attribute("gen_ai.usage.input_tokens", 42i64);
        root.set_attribute("agenttrace.cost", 0.25);
        root.set_attribute("cached", true);
        root.status = SpanStatus::error("boom");

        let mut child = OtelSpan::new("abc", "2", "child", SpanKind::Client).with_parent("1");
        child.events.push(SpanEvent {
            name: "gen_ai.first_token".into(),
            time_unix_nano: 5,
            attributes: Attributes::new(),
        });

        ExportRequest::single(
            Resource::from_pairs([("service.name", "agenttrace")]),
            InstrumentationScope {
                name: "agenttrace".into(),
                version: "1.0.0".into(),
            },
            vec![root, child],
        )
    }

    #[test]
    fn test_envelope_shape() {
        let body: Value = serde_json::from_slice(&encode_request(&request()).unwrap()).unwrap();

        let rs = &body["resourceSpans"][0];
        assert_eq!(
            rs["resource"]["attributes"][0],
            json!({"key": "service.name", "value": {"stringValue": "agenttrace"}})
        );
        assert_eq!(rs["scopeSpans"][0]["scope"], json!({"name": "agenttrace", "version": "1.0.0"}));

        let root = &rs["scopeSpans"][0]["spans"][0];
        assert_eq!(root["traceId"], "00000000000000000000000000000abc");
        assert_eq!(root["spanId"], "0000000000000001");
        assert!(root.get("parentSpanId").is_none());
        assert_eq!(root["kind"], 2);
        assert_eq!(root["startTimeUnixNano"], "1700000000000000000");
        assert_eq!(root["status"], json!({"message": "boom", "code": 2}));
    }

    #[test]
    fn test_attribute_values_are_typed() {
        let body: Value = serde_json::from_slice(&encode_request(&request()).unwrap()).unwrap();
        let attrs = body["resourceSpans"][0]["scopeSpans"][0]["spans"][0]["attributes"]
            .as_array()
            .unwrap()
            .clone();

        let find = |key: &str| {
            attrs
                .iter()
                .find(|kv| kv["key"] == key)
                .map(|kv| kv["value"].clone())
                .unwrap()
        };
        assert_eq!(find("gen_ai.usage.input_tokens"), json!({"intValue": "42"}));
        assert_eq!(find("agenttrace.cost"), json!({"doubleValue": 0.25}));
        assert_eq!(find("cached"), json!({"boolValue": true}));
    }

    #[test]
    fn test_child_span_carries_parent_and_events() {
        let body: Value = serde_json::from_slice(&encode_request(&request()).unwrap()).unwrap();
        let child = &body["resourceSpans"][0]["scopeSpans"][0]["spans"][1];

        assert_eq!(child["parentSpanId"], "0000000000000001");
        assert_eq!(child["kind"], 3);
        assert_eq!(child["events"][0], json!({"timeUnixNano": "5", "name": "gen_ai.first_token"}));
        assert!(child.get("attributes").is_none());
        assert_eq!(child["status"], json!({"code": 0}));
    }

    #[test]
    fn test_deserialized_span_ids_are_fixed_width() {
        let span: OtelSpan = serde_json::from_value(json!({
            "traceId": "abc",
            "spanId": "1",
            "parentSpanId": "2",
            "name": "raw",
            "kind": "Internal",
            "startTimeUnixNano": 1,
            "endTimeUnixNano": 2,
            "status": {"code": "Unset"},
            "links": [{"traceId": "def", "spanId": "3"}]
        }))
        .unwrap();
        assert_eq!(span.trace_id, "abc");

        let request = ExportRequest::single(
            Resource::default(),
            InstrumentationScope::default(),
            vec![span],
        );
        let body: Value = serde_json::from_slice(&encode_request(&request).unwrap()).unwrap();
        let encoded = &body["resourceSpans"][0]["scopeSpans"][0]["spans"][0];

        assert_eq!(encoded["traceId"], "00000000000000000000000000000abc");
        assert_eq!(encoded["spanId"], "0000000000000001");
        assert_eq!(encoded["parentSpanId"], "0000000000000002");
        assert_eq!(encoded["links"][0]["traceId"].as_str().unwrap().len(), 32);
        assert_eq!(encoded["links"][0]["spanId"], "0000000000000003");
    }

    #[test]
    fn test_partial_success_parsing() {
        assert_eq!(
            parse_partial_success(br#"{"partialSuccess":{"rejectedSpans":"3","errorMessage":"too old"}}"#),
            Some((3, "too old".to_owned()))
        );
        assert_eq!(
            parse_partial_success(br#"{"partialSuccess":{"rejectedSpans":2}}"#),
            Some((2, String::new()))
        );
        assert_eq!(parse_partial_success(br#"{"partialSuccess":{}}"#), None);
        assert_eq!(parse_partial_success(b"{}"), None);
        assert_eq!(parse_partial_success(b"ok"), None);
        assert_eq!(parse_partial_success(b""), None);
    }
}
