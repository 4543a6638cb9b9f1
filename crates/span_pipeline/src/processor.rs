//! Export drivers: decide *when* finished spans reach the exporter.
//!
//! - [`ExportDriver::simple`] exports each span as a one-element batch on the
//!   finishing caller's task.
//! - [`ExportDriver::batch`] queues spans in a [`SpanBuffer`] and exports from
//!   a background worker when the buffer is full enough or old enough.
//!
//! A batch is exported exactly once. Failed batches are counted and dropped;
//! nothing is re-queued.

use crate::exporter::{ExportError, ExportOutcome, SpanExporterBoxed};
use crate::retry::deadline_after;
use crate::span::{Span, SpanBatch};
use crate::span_buffer::{BufferConfig, Push, SpanBuffer};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Error types for flush and shutdown
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DriverError {
    /// The bounded wait elapsed before the driver finished
    #[error("export driver timed out after {0:?}")]
    Timeout(Duration),
    /// `shutdown` already ran
    #[error("export driver is shut down")]
    ShutDown,
    /// The background worker exited without answering
    #[error("export worker stopped unexpectedly")]
    WorkerGone,
    /// Batch mode needs a Tokio runtime to spawn its worker
    #[error("batch export requires a running Tokio runtime")]
    NoRuntime,
    /// The last export of a simple-mode flush failed
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

/// Thread-safe export counters (atomics, shared with the worker)
#[derive(Debug, Default)]
pub struct ExportMetrics {
    /// Spans delivered to the collector
    pub spans_exported: AtomicU64,
    /// Batches delivered to the collector
    pub batches_exported: AtomicU64,
    /// Batches that ended in failure or timeout
    pub export_errors: AtomicU64,
    /// Spans lost to a full queue, a failed batch, or shutdown
    pub spans_dropped: AtomicU64,
}

impl ExportMetrics {
    pub fn spans_exported(&self) -> u64 {
        self.spans_exported.load(Ordering::Relaxed)
    }

    pub fn batches_exported(&self) -> u64 {
        self.batches_exported.load(Ordering::Relaxed)
    }

    pub fn export_errors(&self) -> u64 {
        self.export_errors.load(Ordering::Relaxed)
    }

    pub fn spans_dropped(&self) -> u64 {
        self.spans_dropped.load(Ordering::Relaxed)
    }

    fn record_outcome(&self, span_count: u64, outcome: &ExportOutcome) {
        if outcome.is_success() {
            self.spans_exported.fetch_add(span_count, Ordering::Relaxed);
            self.batches_exported.fetch_add(1, Ordering::Relaxed);
        } else {
            self.export_errors.fetch_add(1, Ordering::Relaxed);
            self.spans_dropped.fetch_add(span_count, Ordering::Relaxed);
        }
    }

    fn record_dropped(&self, count: u64) {
        self.spans_dropped.fetch_add(count, Ordering::Relaxed);
    }
}

/// Configuration for batch mode
#[derive(Debug, Clone)]
pub struct BatchDriverConfig {
    pub buffer: BufferConfig,
    /// Deadline handed to the exporter for each batch
    pub export_timeout: Duration,
}

impl Default for BatchDriverConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            export_timeout: Duration::from_secs(10),
        }
    }
}

/// Sends one batch and records the outcome.
async fn export_batch(
    exporter: &dyn SpanExporterBoxed,
    batch: SpanBatch,
    timeout: Duration,
    metrics: &ExportMetrics,
) -> ExportOutcome {
    let span_count = batch.len() as u64;
    let outcome = exporter.export_boxed(batch, timeout).await;
    metrics.record_outcome(span_count, &outcome);
    if !outcome.is_success() {
        tracing::debug!(
            target: "span_pipeline",
            exporter = exporter.name(),
            spans = span_count,
            outcome = ?outcome,
            "batch dropped"
        );
    }
    outcome
}

pub enum ExportDriver {
    Simple(SimpleDriver),
    Batch(BatchDriver),
}

impl ExportDriver {
    pub fn simple(exporter: Arc<dyn SpanExporterBoxed>, export_timeout: Duration) -> Self {
        Self::Simple(SimpleDriver {
            exporter,
            export_timeout,
            metrics: Arc::new(ExportMetrics::default()),
            shut_down: AtomicBool::new(false),
            last_error: Mutex::new(None),
        })
    }

    /// Starts a batch driver and its background worker on the current runtime.
    pub fn batch(
        exporter: Arc<dyn SpanExporterBoxed>,
        config: BatchDriverConfig,
    ) -> Result<Self, DriverError> {
        BatchDriver::start(exporter, config).map(Self::Batch)
    }

    /// Hands a finished span to the driver.
    pub async fn on_end(&self, span: Span) {
        match self {
            Self::Simple(driver) => driver.on_end(span).await,
            Self::Batch(driver) => driver.on_end(span),
        }
    }

    /// Exports everything buffered, waiting at most `timeout`.
    pub async fn force_flush(&self, timeout: Duration) -> Result<(), DriverError> {
        match self {
            Self::Simple(driver) => driver.force_flush(),
            Self::Batch(driver) => driver.force_flush(timeout).await,
        }
    }

    /// Drains the driver and stops accepting spans. Spans still buffered when
    /// `timeout` elapses are discarded.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), DriverError> {
        match self {
            Self::Simple(driver) => driver.shutdown(),
            Self::Batch(driver) => driver.shutdown(timeout).await,
        }
    }

    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        match self {
            Self::Simple(driver) => &driver.metrics,
            Self::Batch(driver) => &driver.metrics,
        }
    }
}

/// Exports every span synchronously as it finishes.
pub struct SimpleDriver {
    exporter: Arc<dyn SpanExporterBoxed>,
    export_timeout: Duration,
    metrics: Arc<ExportMetrics>,
    shut_down: AtomicBool,
    /// Error of the most recent failed export, reported by the next flush
    last_error: Mutex<Option<ExportError>>,
}

impl SimpleDriver {
    async fn on_end(&self, span: Span) {
        if self.shut_down.load(Ordering::Acquire) {
            self.metrics.record_dropped(1);
            return;
        }
        let outcome = export_batch(
            self.exporter.as_ref(),
            SpanBatch::with_spans(vec![span]),
            self.export_timeout,
            &self.metrics,
        )
        .await;
        if let Err(e) = outcome.into_result() {
            *self.last_error.lock() = Some(e);
        }
    }

    fn force_flush(&self) -> Result<(), DriverError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DriverError::ShutDown);
        }
        match self.last_error.lock().take() {
            Some(e) => Err(DriverError::Export(e)),
            None => Ok(()),
        }
    }

    fn shutdown(&self) -> Result<(), DriverError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(DriverError::ShutDown);
        }
        Ok(())
    }
}

enum Control {
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Buffers spans and exports them from a background task.
pub struct BatchDriver {
    buffer: Arc<Mutex<SpanBuffer>>,
    wake: Arc<Notify>,
    control: mpsc::UnboundedSender<Control>,
    worker: Mutex<Option<JoinHandle<()>>>,
    max_batch_size: usize,
    metrics: Arc<ExportMetrics>,
    /// Spans of the batch the worker is currently exporting
    in_flight: Arc<AtomicU64>,
    shut_down: AtomicBool,
    drop_logged: AtomicBool,
}

impl BatchDriver {
    fn start(
        exporter: Arc<dyn SpanExporterBoxed>,
        config: BatchDriverConfig,
    ) -> Result<Self, DriverError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| DriverError::NoRuntime)?;

        let max_batch_size = config.buffer.max_batch_size;
        let buffer = Arc::new(Mutex::new(SpanBuffer::new(config.buffer)));
        let wake = Arc::new(Notify::new());
        let metrics = Arc::new(ExportMetrics::default());
        let in_flight = Arc::new(AtomicU64::new(0));
        let (control, control_rx) = mpsc::unbounded_channel();

        let worker = Worker {
            buffer: Arc::clone(&buffer),
            wake: Arc::clone(&wake),
            exporter,
            export_timeout: config.export_timeout,
            metrics: Arc::clone(&metrics),
            in_flight: Arc::clone(&in_flight),
        };
        let handle = runtime.spawn(worker.run(control_rx));

        Ok(Self {
            buffer,
            wake,
            control,
            worker: Mutex::new(Some(handle)),
            max_batch_size,
            metrics,
            in_flight,
            shut_down: AtomicBool::new(false),
            drop_logged: AtomicBool::new(false),
        })
    }

    fn on_end(&self, span: Span) {
        if self.shut_down.load(Ordering::Acquire) {
            self.metrics.record_dropped(1);
            return;
        }
        let pushed = self.buffer.lock().push(span);
        match pushed {
            // first span starts the age timer, a full batch is sent right away
            Push::Queued(len) if len == 1 || len >= self.max_batch_size => self.wake.notify_one(),
            Push::Queued(_) => {}
            Push::Dropped => {
                self.metrics.record_dropped(1);
                if !self.drop_logged.swap(true, Ordering::Relaxed) {
                    tracing::warn!(target: "span_pipeline", "span queue is full, dropping spans");
                }
            }
        }
    }

    async fn force_flush(&self, timeout: Duration) -> Result<(), DriverError> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(DriverError::ShutDown);
        }
        let (reply, done) = oneshot::channel();
        self.control
            .send(Control::Flush(reply))
            .map_err(|_| DriverError::WorkerGone)?;
        match tokio::time::timeout(timeout, done).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(DriverError::WorkerGone),
            Err(_) => Err(DriverError::Timeout(timeout)),
        }
    }

    async fn shutdown(&self, timeout: Duration) -> Result<(), DriverError> {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return Err(DriverError::ShutDown);
        }
        let deadline = deadline_after(timeout);
        let handle = self.worker.lock().take();

        let (reply, done) = oneshot::channel();
        let result = if self.control.send(Control::Shutdown(reply)).is_err() {
            Err(DriverError::WorkerGone)
        } else {
            match tokio::time::timeout_at(deadline, done).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(DriverError::WorkerGone),
                Err(_) => Err(DriverError::Timeout(timeout)),
            }
        };

        if result.is_ok() {
            if let Some(handle) = handle {
                // worker exits right after replying
                let _ = tokio::time::timeout_at(deadline, handle).await;
            }
            return Ok(());
        }

        let mut discarded = 0;
        if let Some(handle) = handle {
            handle.abort();
            // cancellation lands at the worker's next await point
            let _ = handle.await;
            discarded += self.in_flight.swap(0, Ordering::AcqRel);
        }
        discarded += self.buffer.lock().clear() as u64;
        if discarded > 0 {
            self.metrics.record_dropped(discarded);
            tracing::warn!(
                target: "span_pipeline",
                spans = discarded,
                "discarding spans left after shutdown deadline"
            );
        }
        result
    }
}

impl Drop for BatchDriver {
    fn drop(&mut self) {
        if let Some(handle) = self.worker.lock().take() {
            handle.abort();
        }
    }
}

/// Background side of [`BatchDriver`].
struct Worker {
    buffer: Arc<Mutex<SpanBuffer>>,
    wake: Arc<Notify>,
    exporter: Arc<dyn SpanExporterBoxed>,
    export_timeout: Duration,
    metrics: Arc<ExportMetrics>,
    in_flight: Arc<AtomicU64>,
}

impl Worker {
    async fn run(self, mut control: mpsc::UnboundedReceiver<Control>) {
        loop {
            let deadline = self.buffer.lock().flush_deadline();
            tokio::select! {
                biased;

                message = control.recv() => match message {
                    Some(Control::Flush(reply)) => {
                        self.drain().await;
                        let _ = reply.send(());
                    }
                    Some(Control::Shutdown(reply)) => {
                        self.drain().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => break,
                },

                () = self.wake.notified() => self.export_ready().await,

                () = sleep_until(deadline) => self.export_ready().await,
            }
        }
        tracing::debug!(target: "span_pipeline", "batch export worker stopped");
    }

    /// Exports batches while the buffer says one is ready.
    async fn export_ready(&self) {
        loop {
            let batch = {
                let mut buffer = self.buffer.lock();
                if buffer.should_flush() {
                    buffer.take_batch()
                } else {
                    None
                }
            };
            let Some(batch) = batch else { break };
            self.export(batch).await;
        }
    }

    async fn export(&self, batch: SpanBatch) {
        self.in_flight.store(batch.len() as u64, Ordering::Release);
        export_batch(self.exporter.as_ref(), batch, self.export_timeout, &self.metrics).await;
        self.in_flight.store(0, Ordering::Release);
    }

    /// Exports everything buffered, ready or not.
    async fn drain(&self) {
        loop {
            let batch = self.buffer.lock().take_batch();
            let Some(batch) = batch else { break };
            self.export(batch).await;
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
