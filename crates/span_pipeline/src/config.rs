//! Pipeline configuration.
//!
//! One explicit struct, constructed once and handed to [`Pipeline::new`](crate::Pipeline::new).
//! The only runtime-mutable part is the sanitization policy, which lives
//! behind a [`PolicyHandle`](crate::PolicyHandle).

use crate::policy::SanitizationPolicy;
use crate::retry::RetryPolicy;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Configuration validation errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A field holds a value outside its allowed range
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// The collector endpoint cannot be parsed as a URL
    #[error("invalid endpoint {endpoint:?}: {reason}")]
    InvalidEndpoint { endpoint: String, reason: String },
    /// A static header name or value is not valid HTTP
    #[error("invalid header {0:?}")]
    InvalidHeader(String),
}

/// When the exporter is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportMode {
    /// Export every span synchronously as it finishes.
    Simple,
    /// Buffer spans and export from a background worker.
    #[default]
    Batch,
}

/// Request body compression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

/// Full pipeline configuration. Durations are (de)serialized as milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Service name reported as the `service.name` resource attribute
    pub app_name: String,
    /// Maximum serialized size of a single attribute value, in bytes
    pub max_attribute_size: usize,
    /// Dot-separated key-paths removed from every attribute
    pub excluded_keys: BTreeSet<String>,
    /// Collector URL; a missing scheme is filled in from `insecure`
    pub endpoint: String,
    /// Static headers attached verbatim to every export request
    pub headers: BTreeMap<String, String>,
    /// Use plain HTTP for scheme-less endpoints and accept invalid certificates
    pub insecure: bool,
    /// Log export failures and mirror finished spans to stdout
    pub debug: bool,
    /// Hint for instrumentation to skip payload capture
    pub metadata_only: bool,
    pub export_mode: ExportMode,
    pub compression: Compression,
    /// Spans per batch; also the size that triggers an early flush
    pub batch_max_size: usize,
    #[serde(with = "duration_ms")]
    pub batch_max_delay: Duration,
    /// Spans buffered beyond this are dropped
    pub max_queue_size: usize,
    /// Deadline for one `send` call, retries included
    #[serde(with = "duration_ms")]
    pub export_timeout: Duration,
    pub retry_max_attempts: u32,
    #[serde(with = "duration_ms")]
    pub backoff_base: Duration,
    #[serde(with = "duration_ms")]
    pub max_backoff: Duration,
    /// Fraction of each backoff delay randomized, in `[0, 1]`
    pub backoff_jitter: f64,
    /// Upper bound applied to server-supplied Retry-After hints
    #[serde(with = "duration_ms")]
    pub max_retry_after: Duration,
    /// Capacity of the prepared-statement cache
    pub statement_cache_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("unknown_service"),
            max_attribute_size: SanitizationPolicy::DEFAULT_MAX_ATTRIBUTE_SIZE,
            excluded_keys: BTreeSet::new(),
            endpoint: String::from("localhost:4318/v1/traces"),
            headers: BTreeMap::new(),
            insecure: false,
            debug: false,
            metadata_only: false,
            export_mode: ExportMode::Batch,
            compression: Compression::Gzip,
            batch_max_size: 512,
            batch_max_delay: Duration::from_secs(5),
            max_queue_size: 2048,
            export_timeout: Duration::from_secs(10),
            retry_max_attempts: 5,
            backoff_base: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_jitter: 0.5,
            max_retry_after: Duration::from_secs(600),
            statement_cache_size: 100,
        }
    }
}

impl PipelineConfig {
    /// Checks every field; the first problem found is returned.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy()?;
        self.resolved_endpoint()?;
        self.header_map()?;

        for (name, value) in [
            ("batch_max_size", self.batch_max_size),
            ("max_queue_size", self.max_queue_size),
            ("statement_cache_size", self.statement_cache_size),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if self.max_queue_size < self.batch_max_size {
            return Err(ConfigError::Invalid(
                "max_queue_size must be at least batch_max_size".into(),
            ));
        }
        if self.export_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "export_timeout must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(ConfigError::Invalid(format!(
                "backoff_jitter must be within [0, 1], got {}",
                self.backoff_jitter
            )));
        }
        Ok(())
    }

    /// Sanitization policy described by this configuration.
    pub fn policy(&self) -> Result<SanitizationPolicy, ConfigError> {
        let policy = SanitizationPolicy::new(self.max_attribute_size)?
            .with_excluded_keys(self.excluded_keys.iter().cloned());
        policy.validate()?;
        Ok(policy)
    }

    /// Parses the endpoint, adding `http://` or `https://` when no scheme is given.
    pub fn resolved_endpoint(&self) -> Result<Url, ConfigError> {
        let raw = self.endpoint.trim();
        if raw.is_empty() {
            return Err(ConfigError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: "endpoint is empty".into(),
            });
        }

        let with_scheme = if raw.contains("://") {
            raw.to_owned()
        } else if self.insecure {
            format!("http://{raw}")
        } else {
            format!("https://{raw}")
        };

        let url = Url::parse(&with_scheme).map_err(|e| ConfigError::InvalidEndpoint {
            endpoint: self.endpoint.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(ConfigError::InvalidEndpoint {
                endpoint: self.endpoint.clone(),
                reason: format!("unsupported scheme {other:?}"),
            }),
        }
    }

    /// Static headers as an HTTP header map.
    pub fn header_map(&self) -> Result<HeaderMap, ConfigError> {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|_| ConfigError::InvalidHeader(name.clone()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ConfigError::InvalidHeader(name.to_string()))?;
            map.insert(name, value);
        }
        Ok(map)
    }

    /// Backoff schedule for the exporter.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.retry_max_attempts,
            base_delay: self.backoff_base,
            max_delay: self.max_backoff,
            multiplier: 2.0,
            jitter: self.backoff_jitter,
            max_retry_after: self.max_retry_after,
        }
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        PipelineConfig::default().validate().unwrap();
    }

    #[test]
    fn test_endpoint_scheme_follows_insecure() {
        let mut config = PipelineConfig {
            endpoint: "collector.local:4318/v1/traces".into(),
            ..Default::default()
        };
        assert_eq!(config.resolved_endpoint().unwrap().scheme(), "https");

        config.insecure = true;
        let url = config.resolved_endpoint().unwrap();
        assert_eq!(url.scheme(), "http");
        assert_eq!(url.path(), "/v1/traces");

        config.endpoint = "https://explicit.example/traces".into();
        assert_eq!(config.resolved_endpoint().unwrap().scheme(), "https");
    }

    #[test]
    fn test_rejects_bad_endpoint() {
        let config = PipelineConfig {
            endpoint: "   ".into(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidEndpoint { .. })
        ));

        let config = PipelineConfig {
            endpoint: "ftp://collector/traces".into(),
            ..Default::default()
        };
        assert!(config.resolved_endpoint().is_err());
    }

    #[test]
    fn test_rejects_zero_sizes_and_bad_jitter() {
        let zero_batch = PipelineConfig {
            batch_max_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let zero_attr = PipelineConfig {
            max_attribute_size: 0,
            ..Default::default()
        };
        assert!(zero_attr.validate().is_err());

        let jitter = PipelineConfig {
            backoff_jitter: 1.5,
            ..Default::default()
        };
        assert!(jitter.validate().is_err());
    }

    #[test]
    fn test_rejects_invalid_header() {
        let mut config = PipelineConfig::default();
        config.headers.insert("bad header".into(), "x".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidHeader(_))
        ));
    }

    #[test]
    fn test_deserialize_partial_json() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{
                "app_name": "checkout",
                "export_mode": "simple",
                "compression": "none",
                "batch_max_delay": 250,
                "excluded_keys": ["http.request.headers.authorization"],
                "headers": {"x-auth-token": "abc"}
            }"#,
        )
        .unwrap();

        assert_eq!(config.app_name, "checkout");
        assert_eq!(config.export_mode, ExportMode::Simple);
        assert_eq!(config.compression, Compression::None);
        assert_eq!(config.batch_max_delay, Duration::from_millis(250));
        assert_eq!(config.batch_max_size, 512);
        assert!(config
            .policy()
            .unwrap()
            .is_excluded("http.request.headers.authorization"));
        assert_eq!(config.header_map().unwrap()["x-auth-token"], "abc");
    }
}
