use crate::serializer::{JsonSerializer, SpanSerializer};
use crate::span::{Span, SpanBatch};
use parking_lot::Mutex;
use std::future::Future;
use std::io::Write;
use std::time::Duration;
use thiserror::Error;

/// Error types for span export operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ExportError {
    /// 429/503/408/502/504 or a redirect step; only surfaces once retries run out
    #[error("retryable server response: {0}")]
    RetryableServerError(u16),
    /// 4xx other than 408/429
    #[error("collector rejected the batch: {0}")]
    PermanentClientError(u16),
    /// 5xx other than 502/503/504
    #[error("collector failed permanently: {0}")]
    PermanentServerError(u16),
    /// Status outside the handled classes
    #[error("unexpected response status: {0}")]
    UnexpectedStatus(u16),
    /// Redirect response without a usable Location header
    #[error("invalid redirect: {0}")]
    InvalidRedirect(String),
    /// Transport-layer error other than a timeout
    #[error("transport error: {0}")]
    Transport(String),
    /// Serialization or compression error
    #[error("serialization error: {0}")]
    Serialization(String),
    /// All retry attempts exhausted
    #[error("all retry attempts exhausted after {attempts} tries, last error: {last}")]
    RetriesExhausted { attempts: u32, last: Box<ExportError> },
    /// Export operation timed out
    #[error("export operation timed out")]
    Timeout,
}

impl ExportError {
    /// True for errors the exporter retries internally.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RetryableServerError(_) | Self::Timeout)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Terminal result of one `send` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportOutcome {
    Success,
    Failure(ExportError),
    Timeout,
}

impl ExportOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    pub fn into_result(self) -> Result<(), ExportError> {
        match self {
            Self::Success => Ok(()),
            Self::Failure(e) => Err(e),
            Self::Timeout => Err(ExportError::Timeout),
        }
    }
}

/// Trait for exporting span batches to various backends.
///
/// Uses native async fn in traits instead of `#[async_trait]`.
///
/// # Note on Object Safety
///
/// This trait uses `impl Future` return types which are not object-safe.
/// For dynamic dispatch, use `Arc<dyn SpanExporterBoxed>`.
pub trait SpanExporter: Send + Sync {
    /// Sends a batch, giving up once `timeout` has elapsed.
    fn export(
        &self,
        batch: SpanBatch,
        timeout: Duration,
    ) -> impl Future<Output = ExportOutcome> + Send;

    /// Returns the exporter name for debugging.
    fn name(&self) -> &str;
}

/// Object-safe version of SpanExporter for dynamic dispatch.
pub trait SpanExporterBoxed: Send + Sync {
    fn export_boxed(
        &self,
        batch: SpanBatch,
        timeout: Duration,
    ) -> std::pin::Pin<Box<dyn Future<Output = ExportOutcome> + Send + '_>>;

    fn name(&self) -> &str;
}

/// Blanket implementation: any SpanExporter can be used as SpanExporterBoxed
impl<T: SpanExporter> SpanExporterBoxed for T {
    fn export_boxed(
        &self,
        batch: SpanBatch,
        timeout: Duration,
    ) -> std::pin::Pin<Box<dyn Future<Output = ExportOutcome> + Send + '_>> {
        Box::pin(self.export(batch, timeout))
    }

    fn name(&self) -> &str {
        SpanExporter::name(self)
    }
}

/// Writes each batch as one JSON document per line on stdout. Used as the
/// debug console mirror.
#[derive(Debug)]
pub struct StdoutExporter {
    serializer: JsonSerializer,
}

impl StdoutExporter {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            serializer: JsonSerializer::new(service_name),
        }
    }
}

impl SpanExporter for StdoutExporter {
    async fn export(&self, batch: SpanBatch, _timeout: Duration) -> ExportOutcome {
        let line = match self.serializer.serialize(&batch) {
            Ok(bytes) => bytes,
            Err(e) => return ExportOutcome::Failure(e),
        };
        match write_line(&line) {
            Ok(()) => ExportOutcome::Success,
            Err(e) => ExportOutcome::Failure(ExportError::Transport(e.to_string())),
        }
    }

    fn name(&self) -> &str {
        "stdout"
    }
}

fn write_line(line: &[u8]) -> std::io::Result<()> {
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(line)?;
    stdout.write_all(b"\n")?;
    stdout.flush()
}

/// Records every exported span in memory.
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<Span>>,
    batches: Mutex<Vec<usize>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exported_count(&self) -> usize {
        self.spans.lock().len()
    }

    /// All exported spans, in export order.
    pub fn spans(&self) -> Vec<Span> {
        self.spans.lock().clone()
    }

    /// Size of each exported batch, in export order.
    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batches.lock().clone()
    }

    pub fn reset(&self) {
        self.spans.lock().clear();
        self.batches.lock().clear();
    }
}

impl SpanExporter for InMemoryExporter {
    async fn export(&self, batch: SpanBatch, _timeout: Duration) -> ExportOutcome {
        self.batches.lock().push(batch.len());
        self.spans.lock().extend(batch.spans);
        ExportOutcome::Success
    }

    fn name(&self) -> &str {
        "in_memory"
    }
}

/// Slow exporter for backpressure and deadline testing
#[cfg(test)]
pub struct SlowExporter {
    delay: Duration,
    inner: InMemoryExporter,
}

#[cfg(test)]
impl SlowExporter {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            inner: InMemoryExporter::new(),
        }
    }

    pub fn exported_count(&self) -> usize {
        self.inner.exported_count()
    }
}

#[cfg(test)]
impl SpanExporter for SlowExporter {
    async fn export(&self, batch: SpanBatch, timeout: Duration) -> ExportOutcome {
        tokio::time::sleep(self.delay).await;
        self.inner.export(batch, timeout).await
    }

    fn name(&self) -> &str {
        "slow"
    }
}

/// Exporter that fails every batch.
#[cfg(test)]
#[derive(Default)]
pub struct FailingExporter {
    pub calls: std::sync::atomic::AtomicUsize,
}

#[cfg(test)]
impl SpanExporter for FailingExporter {
    async fn export(&self, _batch: SpanBatch, _timeout: Duration) -> ExportOutcome {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        ExportOutcome::Failure(ExportError::PermanentServerError(500))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::span::SpanKind;
    use std::sync::Arc;

    fn batch(n: u64) -> SpanBatch {
        let mut batch = SpanBatch::new();
        for i in 0..n {
            batch.add(Span::new(u128::from(i), i, 0, "test".to_string(), SpanKind::Internal));
        }
        batch
    }

    #[tokio::test]
    async fn test_stdout_exporter() {
        let exporter = StdoutExporter::new("test");
        let outcome = exporter.export(batch(1), Duration::from_secs(1)).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_in_memory_exporter_through_boxed() {
        let exporter = Arc::new(InMemoryExporter::new());
        let boxed: Arc<dyn SpanExporterBoxed> = exporter.clone();

        boxed.export_boxed(batch(10), Duration::from_secs(1)).await;
        boxed.export_boxed(batch(3), Duration::from_secs(1)).await;

        assert_eq!(exporter.exported_count(), 13);
        assert_eq!(exporter.batch_sizes(), vec![10, 3]);
        assert_eq!(boxed.name(), "in_memory");

        exporter.reset();
        assert_eq!(exporter.exported_count(), 0);
    }

    #[test]
    fn test_outcome_into_result() {
        assert_eq!(ExportOutcome::Success.into_result(), Ok(()));
        assert_eq!(
            ExportOutcome::Timeout.into_result(),
            Err(ExportError::Timeout)
        );
        assert_eq!(
            ExportOutcome::Failure(ExportError::PermanentClientError(400)).into_result(),
            Err(ExportError::PermanentClientError(400))
        );
    }

    #[test]
    fn test_error_predicates() {
        assert!(ExportError::RetryableServerError(503).is_retryable());
        assert!(ExportError::Timeout.is_retryable());
        assert!(ExportError::Timeout.is_timeout());
        assert!(!ExportError::PermanentClientError(400).is_retryable());
        assert!(!ExportError::PermanentServerError(500).is_retryable());
    }
}
