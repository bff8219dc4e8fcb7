//! Property-based tests for identifier mapping and trace conversion.
//!
//! Covers the guarantees callers rely on when correlating exported spans:
//! fixed id widths, deterministic ids, one span per observation plus a root,
//! and parents that always resolve inside the exported trace.

use otlp_export::ids::{fixed_width_hex, span_id_hex, trace_id_hex, SPAN_ID_HEX_LEN, TRACE_ID_HEX_LEN};
use otlp_export::{convert_trace, ObservationRecord, ObservationType, SpanKind, TraceRecord};
use proptest::prelude::*;
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

// =============================================================================
// Identifier mapping
// =============================================================================

proptest! {
    /// Any identifier maps to exactly the target width of lower-case hex.
    #[test]
    fn prop_ids_have_fixed_width(id in ".{0,80}") {
        let trace = trace_id_hex(&id);
        let span = span_id_hex(&id);

        prop_assert_eq!(trace.len(), TRACE_ID_HEX_LEN);
        prop_assert_eq!(span.len(), SPAN_ID_HEX_LEN);
        prop_assert!(trace.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        prop_assert!(span.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    /// Mapping an already mapped id changes nothing.
    #[test]
    fn prop_id_mapping_is_idempotent(id in ".{0,80}", width in 1usize..48) {
        let once = fixed_width_hex(&id, width);
        prop_assert_eq!(fixed_width_hex(&once, width), once);
    }

    /// Trace ids and root span ids of a UUID share its leading digits.
    #[test]
    fn prop_uuid_span_id_is_trace_id_prefix(bytes in any::<[u8; 16]>()) {
        // all-zero prefixes take the non-zero sentinel instead
        prop_assume!(bytes[..8].iter().any(|b| *b != 0));
        let id = Uuid::from_bytes(bytes).to_string();
        let trace = trace_id_hex(&id);
        prop_assert_eq!(&trace, &Uuid::from_bytes(bytes).simple().to_string());
        prop_assert_eq!(span_id_hex(&id), trace[..SPAN_ID_HEX_LEN].to_owned());
    }
}

// =============================================================================
// Conversion
// =============================================================================

/// A trace with `parents.len()` observations. Observation `i` points at
/// observation `parents[i]` when that index is in range, at an unknown id
/// when it is not, and at nothing for `None`.
fn build_trace(parents: &[Option<usize>]) -> (TraceRecord, Vec<ObservationRecord>) {
    let trace_id = Uuid::new_v4().to_string();
    let trace = TraceRecord::new(trace_id.clone(), Uuid::new_v4(), "prop-trace");
    let ids: Vec<String> = parents.iter().map(|_| Uuid::new_v4().to_string()).collect();

    let observations = parents
        .iter()
        .enumerate()
        .map(|(i, parent)| {
            let kind = if i % 3 == 0 {
                ObservationType::Generation
            } else {
                ObservationType::Span
            };
            let mut obs = ObservationRecord::new(ids[i].clone(), trace_id.clone(), kind, format!("obs-{i}"));
            obs.parent_observation_id = parent.map(|p| {
                ids.get(p)
                    .cloned()
                    .unwrap_or_else(|| Uuid::new_v4().to_string())
            });
            obs
        })
        .collect();

    (trace, observations)
}

proptest! {
    /// One root plus one span per observation, root first, input order kept.
    #[test]
    fn prop_span_count_and_order(parents in prop::collection::vec(prop::option::of(0usize..40), 0..30)) {
        let (trace, observations) = build_trace(&parents);
        let converted = convert_trace(&trace, &observations, &BTreeMap::new());
        let spans: Vec<_> = converted.spans().collect();

        prop_assert_eq!(spans.len(), observations.len() + 1);
        prop_assert_eq!(spans[0].kind, SpanKind::Server);
        prop_assert!(spans[0].parent_span_id.is_none());
        for (span, obs) in spans[1..].iter().zip(&observations) {
            prop_assert_eq!(&span.name, &obs.name);
            let expected = if obs.is_generation() { SpanKind::Client } else { SpanKind::Internal };
            prop_assert_eq!(span.kind, expected);
        }
    }

    /// Every span shares the trace id and every parent is a span of the
    /// same conversion.
    #[test]
    fn prop_parents_resolve_within_trace(parents in prop::collection::vec(prop::option::of(0usize..40), 0..30)) {
        let (trace, observations) = build_trace(&parents);
        let converted = convert_trace(&trace, &observations, &BTreeMap::new());
        let spans: Vec<_> = converted.spans().collect();

        let span_ids: HashSet<&str> = spans.iter().map(|s| s.span_id.as_str()).collect();
        let root_id = spans[0].span_id.clone();
        for (i, span) in spans.iter().enumerate().skip(1) {
            prop_assert_eq!(&span.trace_id, &spans[0].trace_id);
            let parent = span.parent_span_id.as_deref().unwrap_or_default();
            prop_assert!(span_ids.contains(parent), "dangling parent {}", parent);

            let declared = parents[i - 1];
            match declared {
                Some(p) if p < observations.len() => {
                    prop_assert_eq!(parent, span_id_hex(&observations[p].id));
                }
                _ => prop_assert_eq!(parent, root_id.as_str()),
            }
        }
    }

    /// Converting the same input twice yields the same ids.
    #[test]
    fn prop_conversion_is_deterministic(parents in prop::collection::vec(prop::option::of(0usize..10), 0..10)) {
        let (trace, observations) = build_trace(&parents);
        let first = convert_trace(&trace, &observations, &BTreeMap::new());
        let second = convert_trace(&trace, &observations, &BTreeMap::new());

        let ids = |r: &otlp_export::ResourceSpans| {
            r.spans()
                .map(|s| (s.span_id.clone(), s.parent_span_id.clone()))
                .collect::<Vec<_>>()
        };
        prop_assert_eq!(ids(&first), ids(&second));
    }
}
