//! # OTLP Export Demo
//!
//! Creates an exporter, converts a handful of synthetic agent traces and
//! ships them through the batching pipeline to a real collector.
//!
//! ## Running
//!
//! ```bash
//! # Generic OTLP collector on localhost:4317 (gRPC, plaintext)
//! cargo run -p otlp_export --bin demo
//!
//! # A named preset: jaeger, zipkin, datadog, honeycomb, grafana-tempo, newrelic
//! cargo run -p otlp_export --bin demo -- --preset zipkin
//!
//! # Explicit OTLP/HTTP endpoint, ten traces, connectivity test first
//! cargo run -p otlp_export --bin demo -- --endpoint http://localhost:4318/v1/traces --http --traces 10 --test
//! ```
//!
//! Set `RUST_LOG` to adjust verbosity (default `info,otlp_export=debug`).

use anyhow::{bail, Context};
use chrono::{Duration as ChronoDuration, Utc};
use otlp_export::observability::init_tracing;
use otlp_export::record::{CostDetails, UsageDetails};
use otlp_export::{
    BatchConfig, ExporterInput, ExporterService, ExporterType, ObservationRecord, ObservationType,
    ServiceConfig, TraceRecord,
};
use std::time::Duration;
use uuid::Uuid;

struct Options {
    preset: Option<String>,
    endpoint: Option<String>,
    http: bool,
    traces: usize,
    test_first: bool,
}

fn parse_args() -> anyhow::Result<Options> {
    let mut options = Options {
        preset: None,
        endpoint: None,
        http: false,
        traces: 3,
        test_first: false,
    };

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--preset" => options.preset = Some(args.next().context("--preset needs a name")?),
            "--endpoint" => options.endpoint = Some(args.next().context("--endpoint needs a URL")?),
            "--http" => options.http = true,
            "--traces" => {
                options.traces = args
                    .next()
                    .context("--traces needs a count")?
                    .parse()
                    .context("--traces must be a number")?;
            }
            "--test" => options.test_first = true,
            other => bail!("unknown argument {other}"),
        }
    }
    Ok(options)
}

fn exporter_input(options: &Options) -> ExporterInput {
    let mut input = ExporterService::default_exporter_config(options.preset.as_deref().unwrap_or("otlp"));
    if let Some(endpoint) = &options.endpoint {
        input.name = "Demo".to_owned();
        input.endpoint.clone_from(endpoint);
        input.headers.clear();
    }
    if options.http {
        input.exporter_type = ExporterType::Http;
    }
    if input.endpoint.starts_with("localhost") || input.endpoint.starts_with("127.0.0.1") {
        input.insecure = Some(true);
    }
    input.timeout_seconds = Some(5);
    input.batch_config = Some(BatchConfig {
        max_batch_size: 64,
        batch_timeout_ms: 500,
        ..BatchConfig::default()
    });
    input
}

/// One agent run: a planning span, an LLM generation and a tool event.
fn synthetic_trace(project_id: Uuid, n: usize) -> (TraceRecord, Vec<ObservationRecord>) {
    let trace_id = Uuid::new_v4().to_string();
    let started = Utc::now() - ChronoDuration::milliseconds(1500);

    let mut trace = TraceRecord::new(trace_id.clone(), project_id, format!("agent-run-{n}"));
    trace.session_id = Some(format!("session-{}", n % 2));
    trace.user_id = Some("demo-user".to_owned());
    trace.metadata = Some(format!(r#"{{"env":"demo","run":{n}}}"#));
    trace.start_time = started;
    trace.end_time = Some(started + ChronoDuration::milliseconds(1400));
    trace.duration_ms = 1400.0;
    trace.total_cost = 0.0042;

    let plan_id = Uuid::new_v4().to_string();
    let mut plan = ObservationRecord::new(plan_id.clone(), trace_id.clone(), ObservationType::Span, "plan");
    plan.start_time = started;
    plan.end_time = Some(started + ChronoDuration::milliseconds(200));
    plan.duration_ms = 200.0;

    let mut llm = ObservationRecord::new(
        Uuid::new_v4().to_string(),
        trace_id.clone(),
        ObservationType::Generation,
        "chat-completion",
    );
    llm.parent_observation_id = Some(plan_id);
    llm.start_time = started + ChronoDuration::milliseconds(210);
    llm.completion_start_time = Some(started + ChronoDuration::milliseconds(450));
    llm.end_time = Some(started + ChronoDuration::milliseconds(1300));
    llm.duration_ms = 1090.0;
    llm.model = Some("gpt-4o-mini".to_owned());
    llm.model_parameters = Some(r#"{"temperature":0.2,"max_tokens":512}"#.to_owned());
    llm.usage_details = UsageDetails {
        input_tokens: 420,
        output_tokens: 128,
        total_tokens: 548,
    };
    llm.cost_details = CostDetails {
        total_cost: 0.0042,
        ..CostDetails::default()
    };

    let mut tool = ObservationRecord::new(Uuid::new_v4().to_string(), trace_id, ObservationType::Event, "tool-call");
    tool.start_time = started + ChronoDuration::milliseconds(1310);
    tool.end_time = Some(started + ChronoDuration::milliseconds(1390));

    (trace, vec![plan, llm, tool])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing("otlp-export-demo")?;
    let options = parse_args()?;

    let service = ExporterService::start(
        ServiceConfig::default().with_flush_interval(Duration::from_millis(100)),
    );
    let project_id = Uuid::new_v4();
    let exporter = service.create_exporter(project_id, Uuid::new_v4(), exporter_input(&options))?;

    println!(
        "Exporter {} ({:?}) -> {}",
        exporter.name, exporter.exporter_type, exporter.endpoint
    );

    if options.test_first {
        match service.test_exporter(&exporter).await {
            Ok(()) => println!("Connectivity test passed"),
            Err(e) => println!("Connectivity test failed: {e}"),
        }
    }

    for n in 0..options.traces {
        let (trace, observations) = synthetic_trace(project_id, n);
        let outcome = service.export_trace(&exporter, &trace, &observations)?;
        println!("trace {} -> {outcome:?}", trace.id);
    }

    // Long enough for the age trigger plus one send.
    let wait = Duration::from_millis(exporter.batch_config.batch_timeout_ms) + exporter.timeout();
    tokio::time::sleep(wait).await;

    if let Some(stats) = service.stats(exporter.id) {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    }
    for breaker in service.circuit_breaker_stats() {
        println!(
            "breaker {}: {} ({} consecutive failures, opened {} times)",
            breaker.name, breaker.state, breaker.failures, breaker.times_opened
        );
    }

    service.stop().await;
    Ok(())
}
