use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::{HeaderMap, Request, Response};
use parking_lot::Mutex;
use serde_json::{json, Value};
use span_pipeline::{
    query_attributes, AttributeValue, Attributes, Compression, DriverError, ExportError,
    ExportMode, HttpClient, Pipeline, PipelineConfig, SpanKind, SpanStatus, TransportError,
};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

/// Records every request and answers from a script; the last reply repeats.
#[derive(Debug)]
struct CollectorStub {
    replies: Mutex<VecDeque<(u16, Option<&'static str>)>>,
    fallback: (u16, Option<&'static str>),
    requests: Mutex<Vec<(String, HeaderMap, Bytes)>>,
}

impl CollectorStub {
    fn new(replies: Vec<(u16, Option<&'static str>)>) -> Arc<Self> {
        let fallback = replies.last().copied().unwrap_or((200, None));
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            fallback,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn accepting() -> Arc<Self> {
        Self::new(vec![(200, None)])
    }

    fn uris(&self) -> Vec<String> {
        self.requests.lock().iter().map(|(uri, _, _)| uri.clone()).collect()
    }

    fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    /// Every exported span, decoded from the request bodies in arrival order.
    fn spans(&self) -> Vec<Value> {
        self.requests
            .lock()
            .iter()
            .flat_map(|(_, headers, body)| {
                let document = decode(headers, body);
                document["resourceSpans"][0]["scopeSpans"][0]["spans"]
                    .as_array()
                    .cloned()
                    .unwrap_or_default()
            })
            .collect()
    }
}

#[async_trait]
impl HttpClient for CollectorStub {
    async fn send(
        &self,
        request: Request<Bytes>,
        _timeout: Duration,
    ) -> Result<Response<Bytes>, TransportError> {
        let (parts, body) = request.into_parts();
        self.requests
            .lock()
            .push((parts.uri.to_string(), parts.headers, body));

        let (status, location) = self.replies.lock().pop_front().unwrap_or(self.fallback);
        let mut response = Response::builder().status(status);
        if let Some(location) = location {
            response = response.header("location", location);
        }
        Ok(response.body(Bytes::new()).unwrap())
    }
}

fn decode(headers: &HeaderMap, body: &Bytes) -> Value {
    let gzipped = headers
        .get("content-encoding")
        .is_some_and(|value| value == "gzip");
    let mut raw = Vec::new();
    if gzipped {
        GzDecoder::new(body.as_ref()).read_to_end(&mut raw).unwrap();
    } else {
        raw.extend_from_slice(body);
    }
    serde_json::from_slice(&raw).unwrap()
}

/// Attribute map of an encoded span: key -> OTLP value object.
fn attributes_of(span: &Value) -> BTreeMap<String, Value> {
    span["attributes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|attribute| {
            (
                attribute["key"].as_str().unwrap().to_owned(),
                attribute["value"].clone(),
            )
        })
        .collect()
}

fn simple_config() -> PipelineConfig {
    PipelineConfig {
        app_name: "integration".into(),
        endpoint: "http://collector.test/v1/traces".into(),
        export_mode: ExportMode::Simple,
        backoff_base: Duration::ZERO,
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn test_request_span_reaches_collector() {
    let collector = CollectorStub::accepting();
    let config = PipelineConfig {
        headers: BTreeMap::from([("x-api-key".to_owned(), "token-1".to_owned())]),
        ..simple_config()
    };
    let pipeline = Pipeline::new(config, collector.clone()).unwrap();

    let mut span = pipeline.tracer().start_span(
        "POST /foo/bar",
        SpanKind::Server,
        [("http.request.method", AttributeValue::from("POST"))],
        None,
    );
    span.set_attribute("http.request.path", "/foo/bar");
    span.set_attribute("http.request.body", "amir=asdasd");
    span.finish(SpanStatus::Ok).await;

    pipeline.force_flush(Duration::from_secs(1)).await.unwrap();

    let requests = collector.requests.lock();
    assert_eq!(requests.len(), 1);
    let (uri, headers, body) = &requests[0];
    assert_eq!(uri, "http://collector.test/v1/traces");
    assert_eq!(headers["x-api-key"], "token-1");
    assert_eq!(headers["content-encoding"], "gzip");
    assert_eq!(headers["content-type"], "application/json");

    let document = decode(headers, body);
    assert_eq!(
        document["resourceSpans"][0]["resource"]["attributes"][0],
        json!({"key": "service.name", "value": {"stringValue": "integration"}})
    );
    let span = &document["resourceSpans"][0]["scopeSpans"][0]["spans"][0];
    assert_eq!(span["name"], "POST /foo/bar");
    assert_eq!(span["kind"], 2);
    assert_eq!(span["status"]["code"], 1);

    let attributes = attributes_of(span);
    assert_eq!(attributes["http.request.path"], json!({"stringValue": "/foo/bar"}));
    assert_eq!(attributes["http.request.body"], json!({"stringValue": "amir=asdasd"}));
    drop(requests);

    assert_eq!(pipeline.metrics().spans_exported(), 1);
}

#[tokio::test]
async fn test_nested_exclusions_and_truncation() {
    let collector = CollectorStub::accepting();
    let config = PipelineConfig {
        compression: Compression::None,
        max_attribute_size: 16,
        excluded_keys: BTreeSet::from([
            "http.request.headers.authorization".to_owned(),
            "http.request.query_params.token".to_owned(),
            "user.password".to_owned(),
        ]),
        ..simple_config()
    };
    let pipeline = Pipeline::new(config, collector.clone()).unwrap();

    let mut attributes = query_attributes(Some("token=secret&page=2"));
    attributes.insert("user.password".into(), "hunter2".into());
    let mut span = pipeline
        .tracer()
        .start_span("GET /search", SpanKind::Server, attributes, None);
    span.set_attribute(
        "http.request.headers",
        json!({"authorization": "Bearer abc", "accept": "*/*"}),
    );
    span.set_attribute("message", "0123456789abcdefghij");
    span.set_attribute("empty", "");
    span.finish(SpanStatus::Unset).await;

    let spans = collector.spans();
    let attributes = attributes_of(&spans[0]);
    assert!(!attributes.contains_key("user.password"));
    assert!(!attributes.contains_key("empty"));
    assert_eq!(attributes["message"], json!({"stringValue": "0123456789abcdef"}));
    assert_eq!(
        attributes["http.request.headers"],
        json!({"stringValue": r#"{"accept":"*/*"}"#})
    );
    assert_eq!(
        attributes["http.request.query_params"],
        json!({"stringValue": r#"{"page":["2"]}"#})
    );
}

#[tokio::test]
async fn test_retries_are_bounded() {
    let collector = CollectorStub::new(vec![(503, None)]);
    let config = PipelineConfig {
        retry_max_attempts: 2,
        ..simple_config()
    };
    let pipeline = Pipeline::new(config, collector.clone()).unwrap();

    pipeline
        .tracer()
        .start_span("op", SpanKind::Internal, Attributes::new(), None)
        .finish(SpanStatus::Ok)
        .await;

    assert_eq!(collector.request_count(), 3);
    let error = pipeline.force_flush(Duration::from_secs(1)).await.unwrap_err();
    assert_eq!(
        error,
        DriverError::Export(ExportError::RetriesExhausted {
            attempts: 3,
            last: Box::new(ExportError::RetryableServerError(503)),
        })
    );
    assert_eq!(pipeline.metrics().export_errors(), 1);
    assert_eq!(pipeline.metrics().spans_dropped(), 1);
}

#[tokio::test]
async fn test_permanent_client_error_is_not_retried() {
    let collector = CollectorStub::new(vec![(400, None)]);
    let pipeline = Pipeline::new(simple_config(), collector.clone()).unwrap();

    pipeline
        .tracer()
        .start_span("op", SpanKind::Internal, Attributes::new(), None)
        .finish(SpanStatus::Ok)
        .await;

    assert_eq!(collector.request_count(), 1);
    assert_eq!(
        pipeline.force_flush(Duration::from_secs(1)).await,
        Err(DriverError::Export(ExportError::PermanentClientError(400)))
    );
}

#[tokio::test]
async fn test_redirect_applies_to_one_export() {
    let collector = CollectorStub::new(vec![(307, Some("/v2/traces")), (200, None)]);
    let pipeline = Pipeline::new(simple_config(), collector.clone()).unwrap();

    for name in ["first", "second"] {
        pipeline
            .tracer()
            .start_span(name, SpanKind::Internal, Attributes::new(), None)
            .finish(SpanStatus::Ok)
            .await;
    }

    assert_eq!(
        collector.uris(),
        vec![
            "http://collector.test/v1/traces",
            "http://collector.test/v2/traces",
            "http://collector.test/v1/traces",
        ]
    );
    assert_eq!(pipeline.metrics().spans_exported(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_batch_mode_caps_batch_size_and_drains_on_shutdown() {
    let collector = CollectorStub::accepting();
    let config = PipelineConfig {
        export_mode: ExportMode::Batch,
        batch_max_size: 2,
        ..simple_config()
    };
    let pipeline = Pipeline::new(config, collector.clone()).unwrap();

    for i in 0..5 {
        pipeline
            .tracer()
            .start_span(format!("op-{i}"), SpanKind::Internal, Attributes::new(), None)
            .finish(SpanStatus::Ok)
            .await;
    }
    pipeline.shutdown(Duration::from_secs(5)).await.unwrap();

    assert_eq!(collector.request_count(), 3);
    let names: Vec<String> = collector
        .spans()
        .iter()
        .map(|span| span["name"].as_str().unwrap().to_owned())
        .collect();
    assert_eq!(names, vec!["op-0", "op-1", "op-2", "op-3", "op-4"]);
    assert_eq!(pipeline.metrics().batches_exported(), 3);

    assert_eq!(
        pipeline.shutdown(Duration::from_secs(1)).await,
        Err(DriverError::ShutDown)
    );
}

#[tokio::test(start_paused = true)]
async fn test_batch_mode_flushes_after_max_delay() {
    let collector = CollectorStub::accepting();
    let config = PipelineConfig {
        export_mode: ExportMode::Batch,
        batch_max_delay: Duration::from_millis(100),
        ..simple_config()
    };
    let pipeline = Pipeline::new(config, collector.clone()).unwrap();

    pipeline
        .tracer()
        .start_span("lonely", SpanKind::Internal, Attributes::new(), None)
        .finish(SpanStatus::Ok)
        .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(collector.request_count(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(collector.request_count(), 1);

    pipeline.shutdown(Duration::from_secs(1)).await.unwrap();
}

#[tokio::test]
async fn test_prepared_statement_text_follows_execution() {
    let collector = CollectorStub::accepting();
    let pipeline = Pipeline::new(simple_config(), collector.clone()).unwrap();
    let statements = pipeline.statements();

    statements.prepare("by_email", "SELECT id FROM users WHERE email = 'a@b.c'");
    pipeline
        .tracer()
        .start_span("EXECUTE", SpanKind::Client, statements.execute("by_email"), None)
        .finish(SpanStatus::Ok)
        .await;

    let attributes = attributes_of(&collector.spans()[0]);
    assert_eq!(
        attributes["db.statement"],
        json!({"stringValue": "SELECT id FROM users WHERE email = ?"})
    );
    assert_eq!(attributes["db.operation"], json!({"stringValue": "EXECUTE"}));
}
