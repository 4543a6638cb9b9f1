//! Wires configuration, policy, exporter and drivers into a [`Tracer`].

use crate::cache::CacheError;
use crate::config::{ConfigError, ExportMode, PipelineConfig};
use crate::exporter::{SpanExporterBoxed, StdoutExporter};
use crate::http_exporter::HttpExporter;
use crate::policy::PolicyHandle;
use crate::processor::{BatchDriverConfig, DriverError, ExportDriver, ExportMetrics};
use crate::span_buffer::BufferConfig;
use crate::sql::PreparedStatements;
use crate::tracer::Tracer;
use crate::transport::{HttpClient, ReqwestClient, TransportError};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Driver(#[from] DriverError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub struct Pipeline {
    config: PipelineConfig,
    policy: PolicyHandle,
    tracer: Tracer,
    export: Arc<ExportDriver>,
    console: Option<Arc<ExportDriver>>,
    statements: Arc<PreparedStatements>,
}

impl Pipeline {
    /// Builds the pipeline around the given HTTP client.
    ///
    /// Batch mode spawns its worker on the current Tokio runtime.
    pub fn new(config: PipelineConfig, client: Arc<dyn HttpClient>) -> Result<Self, PipelineError> {
        config.validate()?;
        let exporter: Arc<dyn SpanExporterBoxed> =
            Arc::new(HttpExporter::from_config(&config, client)?);
        Self::with_exporter(config, exporter)
    }

    /// Builds the pipeline with a `reqwest` client honoring `insecure`.
    pub fn from_config(config: PipelineConfig) -> Result<Self, PipelineError> {
        let client = ReqwestClient::new(config.insecure)?;
        Self::new(config, Arc::new(client))
    }

    /// Builds the pipeline around any exporter, bypassing HTTP.
    pub fn with_exporter(
        config: PipelineConfig,
        exporter: Arc<dyn SpanExporterBoxed>,
    ) -> Result<Self, PipelineError> {
        config.validate()?;
        let policy = PolicyHandle::new(config.policy()?);

        let export = Arc::new(match config.export_mode {
            ExportMode::Simple => ExportDriver::simple(exporter, config.export_timeout),
            ExportMode::Batch => ExportDriver::batch(
                exporter,
                BatchDriverConfig {
                    buffer: BufferConfig {
                        max_batch_size: config.batch_max_size,
                        max_delay: config.batch_max_delay,
                        max_queue_size: config.max_queue_size,
                    },
                    export_timeout: config.export_timeout,
                },
            )?,
        });

        let console = config.debug.then(|| {
            Arc::new(ExportDriver::simple(
                Arc::new(StdoutExporter::new(config.app_name.clone())),
                config.export_timeout,
            ))
        });

        let mut drivers = vec![Arc::clone(&export)];
        drivers.extend(console.iter().cloned());
        let tracer = Tracer::new(policy.clone(), drivers, config.metadata_only);
        let statements = Arc::new(PreparedStatements::new(config.statement_cache_size)?);

        tracing::debug!(
            target: "span_pipeline",
            mode = ?config.export_mode,
            debug = config.debug,
            "span pipeline started"
        );

        Ok(Self {
            config,
            policy,
            tracer,
            export,
            console,
            statements,
        })
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Shared sanitization policy; updates apply to subsequent writes.
    pub fn policy(&self) -> &PolicyHandle {
        &self.policy
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Prepared-statement cache for SQL instrumentation.
    pub fn statements(&self) -> &Arc<PreparedStatements> {
        &self.statements
    }

    pub fn metrics(&self) -> &Arc<ExportMetrics> {
        self.export.metrics()
    }

    pub async fn force_flush(&self, timeout: Duration) -> Result<(), DriverError> {
        self.export.force_flush(timeout).await
    }

    /// Drains and stops every driver within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), DriverError> {
        let result = self.export.shutdown(timeout).await;
        if let Some(console) = &self.console {
            // the console mirror holds no buffered spans
            let _ = console.shutdown(timeout).await;
        }
        result
    }
}
