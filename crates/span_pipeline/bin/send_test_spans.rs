//! # Send Test Spans
//!
//! Sends a fixed set of spans to a collector so a backend can be checked by
//! hand: nested spans, explicit statuses, an exception event, an HTTP server
//! span with a request body and query string, and a prepared SQL statement.
//!
//! ## Running
//!
//! ```bash
//! # Plain HTTP collector on localhost
//! cargo run -p span_pipeline --bin send_test_spans -- localhost:4569/test/trace/path
//!
//! # Settings from a JSON file (any PipelineConfig field, durations in ms)
//! cargo run -p span_pipeline --bin send_test_spans -- --config pipeline.json
//! ```

use anyhow::Context;
use span_pipeline::{
    init_logging, query_attributes, AttributeValue, ExportMode, LoggingConfig, Pipeline,
    PipelineConfig, SpanKind, SpanStatus,
};
use std::time::{Duration, SystemTime};

const DEFAULT_BACKEND: &str = "localhost:4569/test/trace/path";

fn load_config() -> anyhow::Result<PipelineConfig> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    if let Some(index) = args.iter().position(|a| a == "--config") {
        let path = args.get(index + 1).context("--config needs a file path")?;
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
        return serde_json::from_str(&text).with_context(|| format!("parsing {path}"));
    }

    Ok(PipelineConfig {
        app_name: "send-test-spans".into(),
        endpoint: args.first().cloned().unwrap_or_else(|| DEFAULT_BACKEND.into()),
        insecure: true,
        debug: true,
        export_mode: ExportMode::Simple,
        ..PipelineConfig::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config()?;
    let logging = if config.debug {
        LoggingConfig::verbose()
    } else {
        LoggingConfig::default()
    };
    init_logging(&logging)?;

    println!("Sending test spans to {}", config.endpoint);
    let shutdown_timeout = config.export_timeout;
    let pipeline = Pipeline::from_config(config)?;
    let tracer = pipeline.tracer();

    // Nested spans
    let mut outer = tracer.start_span(
        "nested_outer",
        SpanKind::Internal,
        [
            ("is_question", AttributeValue::from(true)),
            ("answer", AttributeValue::from(42)),
            ("exact", AttributeValue::from(42.225)),
            ("message", AttributeValue::from("These pretzels are making me thirsty")),
        ],
        None,
    );
    let mut inner = tracer.start_span(
        "inner",
        SpanKind::Internal,
        [("inner_span_attr", AttributeValue::from("is awesome"))],
        Some(&outer.context()),
    );
    let more_inner = tracer.start_span(
        "more_inner",
        SpanKind::Internal,
        [("more_inner_span_attr", AttributeValue::from("is more awesome"))],
        Some(&inner.context()),
    );
    more_inner.finish(SpanStatus::Unset).await;
    inner.set_attribute("children", 1);
    inner.finish(SpanStatus::Unset).await;
    outer.set_attribute("children", 1);
    outer.finish(SpanStatus::Unset).await;

    // Statuses
    tracer
        .start_span("test_status_ok", SpanKind::Internal, [("status", AttributeValue::from("ok"))], None)
        .finish(SpanStatus::Ok)
        .await;
    tracer
        .start_span("test_status_error", SpanKind::Internal, [("status", AttributeValue::from("error"))], None)
        .finish(SpanStatus::error("test_status_error"))
        .await;

    let mut failing = tracer.start_span(
        "with_exception",
        SpanKind::Internal,
        [("status", AttributeValue::from("error"))],
        None,
    );
    failing.add_event(
        "exception",
        [
            ("exception.type", AttributeValue::from("RuntimeError")),
            ("exception.message", AttributeValue::from("This is the error message")),
        ],
        Some(SystemTime::now()),
    );
    failing.finish(SpanStatus::error("This is the error message")).await;

    // Incoming HTTP request
    let mut request = tracer.start_span(
        "POST /foo/bar",
        SpanKind::Server,
        query_attributes(Some("q1=a&q2=b&q1=c")),
        None,
    );
    request.set_attribute("http.request.method", "POST");
    request.set_attribute("http.request.path", "/foo/bar");
    if !tracer.metadata_only() {
        request.set_attribute("http.request.body", "amir=asdasd");
    }
    request.set_attribute("http.response.status_code", 200);
    request.finish(SpanStatus::from_http_status(200)).await;

    // Prepared SQL statement
    let statements = pipeline.statements();
    tracer
        .start_span(
            "PREPARE shop",
            SpanKind::Client,
            statements.prepare("find_user", "SELECT * FROM users WHERE email = 'amir@example.com'"),
            None,
        )
        .finish(SpanStatus::Ok)
        .await;
    tracer
        .start_span("EXECUTE shop", SpanKind::Client, statements.execute("find_user"), None)
        .finish(SpanStatus::Ok)
        .await;

    pipeline
        .shutdown(shutdown_timeout + Duration::from_secs(1))
        .await?;

    let metrics = pipeline.metrics();
    println!(
        "Exported {} spans in {} batches ({} export errors, {} dropped)",
        metrics.spans_exported(),
        metrics.batches_exported(),
        metrics.export_errors(),
        metrics.spans_dropped()
    );
    Ok(())
}
