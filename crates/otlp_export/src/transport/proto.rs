//! Mapping of the domain model onto the OTLP protobuf messages.

use crate::ids::{self, IdError};
use crate::span::{AttributeValue, Attributes, ExportRequest, OtelSpan};
use opentelemetry_proto::tonic::collector::trace::v1::ExportTraceServiceRequest;
use opentelemetry_proto::tonic::common::v1::{any_value, AnyValue, InstrumentationScope, KeyValue};
use opentelemetry_proto::tonic::resource::v1::Resource;
use opentelemetry_proto::tonic::trace::v1::{span, ResourceSpans, ScopeSpans, Span, Status};

/// Builds the `Export` RPC message. Spans whose identifiers cannot be decoded
/// are skipped with a warning.
pub fn to_proto_request(request: &ExportRequest) -> ExportTraceServiceRequest {
    let resource_spans = request
        .resource_spans
        .iter()
        .map(|rs| ResourceSpans {
            resource: Some(Resource {
                attributes: key_values(&rs.resource.attributes),
                ..Default::default()
            }),
            scope_spans: rs
                .scope_spans
                .iter()
                .map(|ss| ScopeSpans {
                    scope: Some(InstrumentationScope {
                        name: ss.scope.name.clone(),
                        version: ss.scope.version.clone(),
                        ..Default::default()
                    }),
                    spans: ss
                        .spans
                        .iter()
                        .filter_map(|s| match to_proto_span(s) {
                            Ok(span) => Some(span),
                            Err(e) => {
                                tracing::warn!(span_id = %s.span_id, error = %e, "Failed to convert span to protobuf");
                                None
                            }
                        })
                        .collect(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        })
        .collect();

    ExportTraceServiceRequest { resource_spans }
}

/// Converts one span, decoding hex identifiers into raw bytes.
pub fn to_proto_span(s: &OtelSpan) -> Result<Span, IdError> {
    let parent_span_id = match s.parent_span_id.as_deref() {
        Some(parent) if !parent.is_empty() => ids::span_id_bytes(parent)?.to_vec(),
        _ => Vec::new(),
    };

    let events = s
        .events
        .iter()
        .map(|e| span::Event {
            time_unix_nano: e.time_unix_nano,
            name: e.name.clone(),
            attributes: key_values(&e.attributes),
            ..Default::default()
        })
        .collect();

    let links = s
        .links
        .iter()
        .filter_map(|l| {
            let trace_id = ids::trace_id_bytes(&l.trace_id).ok()?;
            let span_id = ids::span_id_bytes(&l.span_id).ok()?;
            Some(span::Link {
                trace_id: trace_id.to_vec(),
                span_id: span_id.to_vec(),
                attributes: key_values(&l.attributes),
                ..Default::default()
            })
        })
        .collect();

    Ok(Span {
        trace_id: ids::trace_id_bytes(&s.trace_id)?.to_vec(),
        span_id: ids::span_id_bytes(&s.span_id)?.to_vec(),
        parent_span_id,
        name: s.name.clone(),
        kind: s.kind.as_otlp(),
        start_time_unix_nano: s.start_time_unix_nano,
        end_time_unix_nano: s.end_time_unix_nano,
        attributes: key_values(&s.attributes),
        events,
        links,
        status: Some(Status {
            message: s.status.message.clone().unwrap_or_default(),
            code: s.status.code.as_otlp(),
        }),
        ..Default::default()
    })
}

fn key_values(attributes: &Attributes) -> Vec<KeyValue> {
    attributes
        .iter()
        .map(|(key, value)| KeyValue {
            key: key.clone(),
            value: Some(AnyValue {
                value: Some(match value {
                    AttributeValue::String(s) => any_value::Value::StringValue(s.clone()),
                    AttributeValue::Bool(b) => any_value::Value::BoolValue(*b),
                    AttributeValue::Int(i) => any_value::Value::IntValue(*i),
                    AttributeValue::Double(d) => any_value::Value::DoubleValue(*d),
                }),
            }),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::{InstrumentationScope as Scope, Resource as DomainResource, SpanKind, SpanLink, SpanStatus};

    #[test]
    fn test_span_ids_become_raw_bytes() {
        let mut s = OtelSpan::new("0102", "ff", "op", SpanKind::Client).with_parent("0a");
        s.status = SpanStatus::error("failed");
        s.set_attribute("tokens", 7i64);

        let proto = to_proto_span(&s).unwrap();
        assert_eq!(proto.trace_id.len(), 16);
        assert_eq!(&proto.trace_id[14..], &[0x01, 0x02]);
        assert_eq!(proto.span_id, vec![0, 0, 0, 0, 0, 0, 0, 0xff]);
        assert_eq!(proto.parent_span_id, vec![0, 0, 0, 0, 0, 0, 0, 0x0a]);
        assert_eq!(proto.kind, 3);

        let status = proto.status.unwrap();
        assert_eq!(status.code, 2);
        assert_eq!(status.message, "failed");

        assert_eq!(proto.attributes[0].key, "tokens");
        assert_eq!(
            proto.attributes[0].value.as_ref().unwrap().value,
            Some(any_value::Value::IntValue(7))
        );
    }

    #[test]
    fn test_root_span_has_empty_parent() {
        let s = OtelSpan::new("1", "1", "root", SpanKind::Server);
        assert!(to_proto_span(&s).unwrap().parent_span_id.is_empty());
    }

    #[test]
    fn test_request_preserves_grouping_and_order() {
        let mut first = OtelSpan::new("1", "1", "first", SpanKind::Internal);
        first.links.push(SpanLink {
            trace_id: "2".into(),
            span_id: "3".into(),
            attributes: Attributes::new(),
        });
        let second = OtelSpan::new("1", "2", "second", SpanKind::Internal);

        let request = ExportRequest::single(
            DomainResource::from_pairs([("service.name", "agenttrace")]),
            Scope {
                name: "agenttrace".into(),
                version: "1.0.0".into(),
            },
            vec![first, second],
        );
        let proto = to_proto_request(&request);

        let rs = &proto.resource_spans[0];
        assert_eq!(rs.resource.as_ref().unwrap().attributes[0].key, "service.name");
        let ss = &rs.scope_spans[0];
        assert_eq!(ss.scope.as_ref().unwrap().version, "1.0.0");
        assert_eq!(
            ss.spans.iter().map(|s| s.name.as_str()).collect::<Vec<_>>(),
            ["first", "second"]
        );
        assert_eq!(ss.spans[0].links.len(), 1);
        assert_eq!(ss.spans[0].links[0].span_id, vec![0, 0, 0, 0, 0, 0, 0, 3]);
    }
}
