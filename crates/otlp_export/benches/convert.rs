//! Conversion and encoding cost per trace size.
//!
//! Run with: cargo bench -p otlp_export --bench convert

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use otlp_export::record::UsageDetails;
use otlp_export::transport::{json, proto};
use otlp_export::{
    ExportRequest, ObservationRecord, ObservationType, SpanConverter, TraceRecord,
};
use prost::Message;
use std::collections::BTreeMap;
use uuid::Uuid;

const SIZES: [usize; 3] = [1, 16, 256];

/// A trace with `n` observations, every third one a generation.
fn trace_with(n: usize) -> (TraceRecord, Vec<ObservationRecord>) {
    let trace_id = Uuid::new_v4().to_string();
    let mut trace = TraceRecord::new(trace_id.clone(), Uuid::new_v4(), "bench-trace");
    trace.session_id = Some("session".to_owned());
    trace.total_cost = 0.01;

    let observations = (0..n)
        .map(|i| {
            let kind = if i % 3 == 0 {
                ObservationType::Generation
            } else {
                ObservationType::Span
            };
            let mut obs = ObservationRecord::new(Uuid::new_v4().to_string(), trace_id.clone(), kind, format!("obs-{i}"));
            if obs.is_generation() {
                obs.model = Some("gpt-4o".to_owned());
                obs.model_parameters = Some(r#"{"temperature":0.7,"max_tokens":256}"#.to_owned());
                obs.usage_details = UsageDetails {
                    input_tokens: 100,
                    output_tokens: 50,
                    total_tokens: 150,
                };
            }
            obs
        })
        .collect();

    (trace, observations)
}

fn bench_convert(c: &mut Criterion) {
    let mut group = c.benchmark_group("convert");
    let converter = SpanConverter::default();
    let overrides = BTreeMap::new();

    for n in SIZES {
        let (trace, observations) = trace_with(n);
        group.throughput(Throughput::Elements(n as u64 + 1));
        group.bench_with_input(BenchmarkId::from_parameter(n), &n, |b, _| {
            b.iter(|| converter.convert(black_box(&trace), black_box(&observations), &overrides));
        });
    }
    group.finish();
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode");
    let converter = SpanConverter::default();

    for n in SIZES {
        let (trace, observations) = trace_with(n);
        let request = ExportRequest {
            resource_spans: vec![converter.convert(&trace, &observations, &BTreeMap::new())],
        };
        group.throughput(Throughput::Elements(n as u64 + 1));

        group.bench_with_input(BenchmarkId::new("json", n), &request, |b, request| {
            b.iter(|| json::encode_request(black_box(request)));
        });
        group.bench_with_input(BenchmarkId::new("protobuf", n), &request, |b, request| {
            b.iter(|| proto::to_proto_request(black_box(request)).encode_to_vec());
        });
    }
    group.finish();
}

criterion_group!(benches, bench_convert, bench_encode);
criterion_main!(benches);
