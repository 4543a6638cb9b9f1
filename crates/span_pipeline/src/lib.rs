//! Span Pipeline
//!
//! Takes finished spans from instrumented code to a tracing backend:
//!
//! - every attribute write is sanitized (excluded keys removed, values
//!   truncated to a byte budget, blank values dropped);
//! - finished spans are exported immediately (simple mode) or batched by
//!   size and age (batch mode);
//! - batches are POSTed to the collector endpoint with retries, bounded
//!   backoff, `Retry-After` handling and redirect following, all within a
//!   per-export deadline.
//!
//! A bounded LRU cache backs prepared-statement tracking for SQL
//! instrumentation.
//!
//! # Example
//!
//! ```rust,ignore
//! use span_pipeline::{Pipeline, PipelineConfig, SpanKind, SpanStatus};
//!
//! let pipeline = Pipeline::from_config(PipelineConfig::default())?;
//! let mut span = pipeline.tracer().start_span("GET /", SpanKind::Server, [("http.request.method", "GET".into())], None);
//! span.set_attribute("http.response.status_code", 200);
//! span.finish(SpanStatus::Ok).await;
//! pipeline.shutdown(std::time::Duration::from_secs(5)).await?;
//! ```

pub mod cache;
pub mod config;
pub mod exporter;
pub mod http_exporter;
pub mod logging;
pub mod pipeline;
pub mod policy;
pub mod processor;
pub mod query;
pub mod retry;
pub mod sanitizer;
pub mod serializer;
pub mod span;
pub mod span_buffer;
pub mod sql;
pub mod tracer;
pub mod transport;

// Re-export main types
pub use cache::{BoundedCache, CacheError, SharedCache};
pub use config::{Compression, ConfigError, ExportMode, PipelineConfig};
pub use exporter::{
    ExportError, ExportOutcome, InMemoryExporter, SpanExporter, SpanExporterBoxed, StdoutExporter,
};
pub use http_exporter::HttpExporter;
pub use logging::{init_logging, LoggingConfig};
pub use pipeline::{Pipeline, PipelineError};
pub use policy::{PolicyHandle, SanitizationPolicy};
pub use processor::{BatchDriverConfig, DriverError, ExportDriver, ExportMetrics};
pub use query::query_attributes;
pub use retry::{classify_status, parse_retry_after, ResponseClass, RetryPolicy};
pub use span::{
    AttributeValue, Attributes, Span, SpanBatch, SpanEvent, SpanKind, SpanStatus,
};
pub use span_buffer::BufferConfig;
pub use sql::{extract_operation, obfuscate_sql, PreparedStatements};
pub use tracer::{SpanContext, SpanHandle, Tracer};
pub use transport::{HttpClient, ReqwestClient, TransportError};
