//! Batched HTTP exporter with retry, backoff, redirect and deadline handling.
//!
//! One `send` call runs an attempt loop against a single deadline. Each
//! attempt gets its own transport timeout, `min(remaining, default_timeout)`,
//! so a slow call never changes what the next call starts with.
//!
//! Only one `send` runs at a time; concurrent callers queue on a single-flight
//! lock so the collector sees batches in the order they were handed over.

use crate::config::{Compression, ConfigError, PipelineConfig};
use crate::exporter::{ExportError, ExportOutcome, SpanExporter};
use crate::retry::{classify_status, deadline_after, ResponseClass, RetryPolicy};
use crate::serializer::{JsonSerializer, SpanSerializer};
use crate::span::SpanBatch;
use crate::transport::{HttpClient, TransportError};
use bytes::Bytes;
use flate2::write::GzEncoder;
use http::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, LOCATION, RETRY_AFTER};
use http::{Request, Response};
use std::fmt;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

pub struct HttpExporter {
    client: Arc<dyn HttpClient>,
    serializer: Arc<dyn SpanSerializer>,
    endpoint: Url,
    headers: HeaderMap,
    compression: Compression,
    default_timeout: Duration,
    retry: RetryPolicy,
    debug: bool,
    in_flight: tokio::sync::Mutex<()>,
}

impl fmt::Debug for HttpExporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpExporter")
            .field("endpoint", &self.endpoint.as_str())
            .field("compression", &self.compression)
            .field("default_timeout", &self.default_timeout)
            .field("retry", &self.retry)
            .field("debug", &self.debug)
            .finish_non_exhaustive()
    }
}

impl HttpExporter {
    /// Exporter with JSON encoding, no compression, a 10s default timeout and
    /// the default retry schedule.
    pub fn new(client: Arc<dyn HttpClient>, endpoint: Url) -> Self {
        Self {
            client,
            serializer: Arc::new(JsonSerializer::new("unknown_service")),
            endpoint,
            headers: HeaderMap::new(),
            compression: Compression::None,
            default_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            debug: false,
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    pub fn from_config(
        config: &PipelineConfig,
        client: Arc<dyn HttpClient>,
    ) -> Result<Self, ConfigError> {
        Ok(Self::new(client, config.resolved_endpoint()?)
            .with_serializer(Arc::new(JsonSerializer::new(config.app_name.clone())))
            .with_headers(config.header_map()?)
            .with_compression(config.compression)
            .with_timeout(config.export_timeout)
            .with_retry_policy(config.retry_policy())
            .with_debug(config.debug))
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn SpanSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Per-attempt transport timeout used when the call deadline allows it.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Serializes `batch` and delivers it within `timeout`, retries included.
    pub async fn send(&self, batch: &SpanBatch, timeout: Duration) -> ExportOutcome {
        let deadline = deadline_after(timeout);

        let Ok(_guard) = tokio::time::timeout_at(deadline, self.in_flight.lock()).await else {
            self.report_timeout("waiting for in-flight export");
            return ExportOutcome::Timeout;
        };

        let body = match self.encode(batch) {
            Ok(body) => body,
            Err(e) => return ExportOutcome::Failure(e),
        };

        // A redirect changes the target for the rest of this call only.
        let mut target = self.endpoint.clone();
        let mut retry = 0u32;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.report_timeout("deadline reached");
                return ExportOutcome::Timeout;
            }
            let attempt_timeout = remaining.min(self.default_timeout);

            let request = match self.build_request(&target, body.clone()) {
                Ok(request) => request,
                Err(e) => return ExportOutcome::Failure(e),
            };

            let (error, delay) = match self.client.send(request, attempt_timeout).await {
                Ok(response) => {
                    let code = response.status().as_u16();
                    match classify_status(response.status()) {
                        ResponseClass::Success => {
                            tracing::debug!(
                                target: "span_pipeline",
                                spans = batch.len(),
                                attempts = retry + 1,
                                "batch exported"
                            );
                            return ExportOutcome::Success;
                        }
                        ResponseClass::Throttled => {
                            self.report_response(&response);
                            let hint = response
                                .headers()
                                .get(RETRY_AFTER)
                                .and_then(|value| value.to_str().ok());
                            (
                                ExportError::RetryableServerError(code),
                                self.retry.throttle_delay(retry + 1, hint),
                            )
                        }
                        ResponseClass::Retryable => {
                            self.report_response(&response);
                            (
                                ExportError::RetryableServerError(code),
                                self.retry.delay_for_attempt(retry + 1),
                            )
                        }
                        ResponseClass::Redirect => match redirect_target(&target, &response) {
                            Ok(next) => {
                                tracing::debug!(
                                    target: "span_pipeline",
                                    from = %target,
                                    to = %next,
                                    "following redirect"
                                );
                                target = next;
                                (ExportError::RetryableServerError(code), Duration::ZERO)
                            }
                            Err(e) => return ExportOutcome::Failure(e),
                        },
                        ResponseClass::PermanentClient => {
                            self.report_response(&response);
                            return ExportOutcome::Failure(ExportError::PermanentClientError(code));
                        }
                        ResponseClass::PermanentServer => {
                            self.report_response(&response);
                            return ExportOutcome::Failure(ExportError::PermanentServerError(code));
                        }
                        ResponseClass::Unexpected => {
                            self.report_response(&response);
                            return ExportOutcome::Failure(ExportError::UnexpectedStatus(code));
                        }
                    }
                }
                Err(TransportError::Timeout) => {
                    self.report_timeout("request timed out");
                    (ExportError::Timeout, self.retry.delay_for_attempt(retry + 1))
                }
                Err(TransportError::Other(message)) => {
                    if self.debug {
                        tracing::warn!(target: "span_pipeline", error = %message, "export transport failure");
                    }
                    return ExportOutcome::Failure(ExportError::Transport(message));
                }
            };

            if retry >= self.retry.max_retries {
                if error.is_timeout() {
                    return ExportOutcome::Timeout;
                }
                return ExportOutcome::Failure(ExportError::RetriesExhausted {
                    attempts: retry + 1,
                    last: Box::new(error),
                });
            }
            retry += 1;

            if Instant::now().checked_add(delay).is_none_or(|at| at >= deadline) {
                self.report_timeout("backoff would pass the deadline");
                return ExportOutcome::Timeout;
            }
            if !delay.is_zero() {
                tracing::debug!(
                    target: "span_pipeline",
                    retry,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "retrying export"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    fn encode(&self, batch: &SpanBatch) -> Result<Bytes, ExportError> {
        let payload = self.serializer.serialize(batch)?;
        match self.compression {
            Compression::None => Ok(Bytes::from(payload)),
            Compression::Gzip => gzip(&payload).map(Bytes::from),
        }
    }

    fn build_request(&self, target: &Url, body: Bytes) -> Result<Request<Bytes>, ExportError> {
        let mut builder = Request::post(target.as_str())
            .header(CONTENT_TYPE, HeaderValue::from_static(self.serializer.content_type()));
        if self.compression == Compression::Gzip {
            builder = builder.header(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        }
        let mut request = builder
            .body(body)
            .map_err(|e| ExportError::Transport(e.to_string()))?;
        for (name, value) in &self.headers {
            request.headers_mut().insert(name.clone(), value.clone());
        }
        Ok(request)
    }

    fn report_response(&self, response: &Response<Bytes>) {
        if self.debug {
            tracing::warn!(
                target: "span_pipeline",
                status = response.status().as_u16(),
                headers = ?response.headers(),
                body = %String::from_utf8_lossy(response.body()),
                "export request failed"
            );
        }
    }

    fn report_timeout(&self, reason: &str) {
        if self.debug {
            tracing::warn!(target: "span_pipeline", reason, "timeout while sending spans");
        }
    }
}

impl SpanExporter for HttpExporter {
    async fn export(&self, batch: SpanBatch, timeout: Duration) -> ExportOutcome {
        self.send(&batch, timeout).await
    }

    fn name(&self) -> &str {
        "http"
    }
}

/// Resolves the `Location` header of a redirect against the current target.
fn redirect_target(current: &Url, response: &Response<Bytes>) -> Result<Url, ExportError> {
    let location = response
        .headers()
        .get(LOCATION)
        .ok_or_else(|| ExportError::InvalidRedirect("missing Location header".into()))?
        .to_str()
        .map_err(|e| ExportError::InvalidRedirect(e.to_string()))?;
    current
        .join(location)
        .map_err(|e| ExportError::InvalidRedirect(format!("{location:?}: {e}")))
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>, ExportError> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| ExportError::Serialization(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ExportError::Serialization(e.to_string()))
}
