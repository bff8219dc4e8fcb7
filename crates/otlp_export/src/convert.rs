//! Span Converter
//!
//! Maps a recorded trace and its observations onto one OTLP `ResourceSpans`:
//!
//! - one resource per trace (service name/version, project, trace id/name),
//!   merged with caller overrides which win on key collision
//! - one root span for the trace itself (`Server` kind)
//! - one span per observation (`Client` for generations, `Internal` otherwise),
//!   parented to its declared parent observation when that observation is part
//!   of the same conversion, otherwise to the root span
//!
//! Conversion never fails. Malformed stored model parameters only cause the
//! derived attributes to be omitted.

use crate::config::ResourceDefaults;
use crate::ids;
use crate::record::{Level, ObservationRecord, TraceRecord};
use crate::span::{
    AttributeValue, Attributes, InstrumentationScope, OtelSpan, Resource, ResourceSpans,
    ScopeSpans, SpanEvent, SpanKind, SpanStatus,
};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// Attribute keys (OpenTelemetry GenAI semantic conventions plus the
/// backend's own namespace).
pub mod attr {
    pub const SERVICE_NAME: &str = "service.name";
    pub const SERVICE_VERSION: &str = "service.version";
    pub const SESSION_ID: &str = "session.id";
    pub const END_USER_ID: &str = "enduser.id";

    pub const LLM_REQUEST_MODEL: &str = "gen_ai.request.model";
    pub const LLM_RESPONSE_MODEL: &str = "gen_ai.response.model";
    pub const LLM_REQUEST_MAX_TOKENS: &str = "gen_ai.request.max_tokens";
    pub const LLM_REQUEST_TEMPERATURE: &str = "gen_ai.request.temperature";
    pub const LLM_REQUEST_TOP_P: &str = "gen_ai.request.top_p";
    pub const LLM_USAGE_INPUT_TOKENS: &str = "gen_ai.usage.input_tokens";
    pub const LLM_USAGE_OUTPUT_TOKENS: &str = "gen_ai.usage.output_tokens";
    pub const LLM_USAGE_TOTAL_TOKENS: &str = "gen_ai.usage.total_tokens";
    pub const LLM_FIRST_TOKEN_EVENT: &str = "gen_ai.first_token";

    pub const TRACE_ID: &str = "agenttrace.trace.id";
    pub const SPAN_ID: &str = "agenttrace.span.id";
    pub const PROJECT_ID: &str = "agenttrace.project.id";
    pub const TRACE_NAME: &str = "agenttrace.trace.name";
    pub const SPAN_TYPE: &str = "agenttrace.span.type";
    pub const COST: &str = "agenttrace.cost";
    pub const LATENCY_MS: &str = "agenttrace.latency_ms";
}

const TRACE_ERROR_MESSAGE: &str = "Trace completed with error";
const OBSERVATION_ERROR_MESSAGE: &str = "Observation completed with error";

/// Converts recorded traces into OTLP resource spans.
#[derive(Debug, Clone, Default)]
pub struct SpanConverter {
    defaults: ResourceDefaults,
}

/// Converts with the default service identity.
pub fn convert_trace(
    trace: &TraceRecord,
    observations: &[ObservationRecord],
    resource_overrides: &BTreeMap<String, String>,
) -> ResourceSpans {
    SpanConverter::default().convert(trace, observations, resource_overrides)
}

impl SpanConverter {
    pub fn new(defaults: ResourceDefaults) -> Self {
        Self { defaults }
    }

    /// Converts a trace and its observations. The result always holds
    /// `observations.len() + 1` spans, root first, observations in input order.
    pub fn convert(
        &self,
        trace: &TraceRecord,
        observations: &[ObservationRecord],
        resource_overrides: &BTreeMap<String, String>,
    ) -> ResourceSpans {
        let mut resource = Resource::from_pairs([
            (attr::SERVICE_NAME, self.defaults.service_name.as_str()),
            (attr::SERVICE_VERSION, self.defaults.service_version.as_str()),
            (attr::TRACE_ID, trace.id.as_str()),
            (attr::TRACE_NAME, trace.name.as_str()),
        ]);
        resource
            .attributes
            .insert(attr::PROJECT_ID.to_owned(), trace.project_id.to_string().into());
        for (key, value) in resource_overrides {
            resource
                .attributes
                .insert(key.clone(), AttributeValue::from(value.as_str()));
        }

        let trace_id = ids::trace_id_hex(&trace.id);
        let root_span_id = ids::span_id_hex(&trace.id);
        let known: HashSet<&str> = observations.iter().map(|o| o.id.as_str()).collect();

        let mut spans = Vec::with_capacity(observations.len() + 1);
        spans.push(root_span(trace, &trace_id, &root_span_id));
        spans.extend(
            observations
                .iter()
                .map(|obs| observation_span(obs, &trace_id, &root_span_id, &known)),
        );

        ResourceSpans {
            resource,
            scope_spans: vec![ScopeSpans {
                scope: InstrumentationScope {
                    name: self.defaults.scope_name.clone(),
                    version: self.defaults.scope_version.clone(),
                },
                spans,
            }],
        }
    }
}

fn root_span(trace: &TraceRecord, trace_id: &str, span_id: &str) -> OtelSpan {
    let start = unix_nanos(trace.start_time);
    let end = trace.end_time.map_or(start, unix_nanos);

    let mut attributes = Attributes::new();
    attributes.insert(attr::TRACE_ID.to_owned(), trace.id.as_str().into());
    attributes.insert(attr::TRACE_NAME.to_owned(), trace.name.as_str().into());
    if trace.total_cost > 0.0 {
        attributes.insert(attr::COST.to_owned(), trace.total_cost.into());
    }
    if trace.duration_ms > 0.0 {
        attributes.insert(attr::LATENCY_MS.to_owned(), trace.duration_ms.into());
    }
    if let Some(session) = non_empty(trace.session_id.as_deref()) {
        attributes.insert(attr::SESSION_ID.to_owned(), session.into());
    }
    if let Some(user) = non_empty(trace.user_id.as_deref()) {
        attributes.insert(attr::END_USER_ID.to_owned(), user.into());
    }

    OtelSpan {
        trace_id: trace_id.to_owned(),
        span_id: span_id.to_owned(),
        parent_span_id: None,
        name: trace.name.clone(),
        kind: SpanKind::Server,
        start_time_unix_nano: start,
        end_time_unix_nano: end,
        attributes,
        status: status_for(trace.level, trace.status_message.as_deref(), TRACE_ERROR_MESSAGE),
        events: Vec::new(),
        links: Vec::new(),
    }
}

fn observation_span(
    obs: &ObservationRecord,
    trace_id: &str,
    root_span_id: &str,
    known: &HashSet<&str>,
) -> OtelSpan {
    let parent = match obs.parent_observation_id.as_deref() {
        Some(parent) if known.contains(parent) => ids::span_id_hex(parent),
        _ => root_span_id.to_owned(),
    };

    let start = unix_nanos(obs.start_time);
    let end = obs.end_time.map_or(start, unix_nanos);

    let mut attributes = Attributes::new();
    attributes.insert(attr::SPAN_ID.to_owned(), obs.id.as_str().into());
    attributes.insert(attr::SPAN_TYPE.to_owned(), obs.observation_type.as_str().into());

    let mut events = Vec::new();
    let kind = if obs.is_generation() {
        add_generation_attributes(obs, &mut attributes);
        if let Some(first_token) = obs.completion_start_time {
            events.push(SpanEvent {
                name: attr::LLM_FIRST_TOKEN_EVENT.to_owned(),
                time_unix_nano: unix_nanos(first_token),
                attributes: Attributes::new(),
            });
        }
        SpanKind::Client
    } else {
        SpanKind::Internal
    };

    if obs.cost_details.total_cost > 0.0 {
        attributes.insert(attr::COST.to_owned(), obs.cost_details.total_cost.into());
    }
    if obs.duration_ms > 0.0 {
        attributes.insert(attr::LATENCY_MS.to_owned(), obs.duration_ms.into());
    }

    OtelSpan {
        trace_id: trace_id.to_owned(),
        span_id: ids::span_id_hex(&obs.id),
        parent_span_id: Some(parent),
        name: obs.name.clone(),
        kind,
        start_time_unix_nano: start,
        end_time_unix_nano: end,
        attributes,
        status: status_for(obs.level, obs.status_message.as_deref(), OBSERVATION_ERROR_MESSAGE),
        events,
        links: Vec::new(),
    }
}

fn add_generation_attributes(obs: &ObservationRecord, attributes: &mut Attributes) {
    if let Some(model) = non_empty(obs.model.as_deref()) {
        attributes.insert(attr::LLM_REQUEST_MODEL.to_owned(), model.into());
        attributes.insert(attr::LLM_RESPONSE_MODEL.to_owned(), model.into());
    }

    if let Some(raw) = non_empty(obs.model_parameters.as_deref()) {
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(raw) {
            Ok(params) => {
                for (param, key) in [
                    ("temperature", attr::LLM_REQUEST_TEMPERATURE),
                    ("max_tokens", attr::LLM_REQUEST_MAX_TOKENS),
                    ("top_p", attr::LLM_REQUEST_TOP_P),
                ] {
                    if let Some(value) = params.get(param) {
                        attributes.insert(key.to_owned(), AttributeValue::from_json(value));
                    }
                }
            }
            Err(e) => {
                tracing::debug!(observation_id = %obs.id, error = %e, "Ignoring malformed model parameters");
            }
        }
    }

    let usage = obs.usage_details;
    if usage.input_tokens > 0 {
        attributes.insert(attr::LLM_USAGE_INPUT_TOKENS.to_owned(), usage.input_tokens.into());
    }
    if usage.output_tokens > 0 {
        attributes.insert(attr::LLM_USAGE_OUTPUT_TOKENS.to_owned(), usage.output_tokens.into());
    }
    if usage.total_tokens > 0 {
        attributes.insert(attr::LLM_USAGE_TOTAL_TOKENS.to_owned(), usage.total_tokens.into());
    }
}

fn status_for(level: Level, message: Option<&str>, fallback: &str) -> SpanStatus {
    if level == Level::Error {
        SpanStatus::error(non_empty(message).unwrap_or(fallback))
    } else {
        SpanStatus::ok()
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

fn unix_nanos(time: DateTime<Utc>) -> u64 {
    time.timestamp_nanos_opt()
        .and_then(|n| u64::try_from(n).ok())
        .unwrap_or(0)
}
