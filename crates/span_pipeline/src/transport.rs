//! HTTP transport seam.
//!
//! The exporter talks to the collector through [`HttpClient`] so tests can
//! script responses without a network. [`ReqwestClient`] is the production
//! implementation.

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use std::fmt::Debug;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Connect or read did not complete in time
    #[error("request timed out")]
    Timeout,
    /// Any other connection-level failure
    #[error("transport failure: {0}")]
    Other(String),
}

impl TransportError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

/// Minimal request/response HTTP client.
///
/// `timeout` bounds this one request only; implementations must not let it
/// outlive the call.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    async fn send(
        &self,
        request: Request<Bytes>,
        timeout: Duration,
    ) -> Result<Response<Bytes>, TransportError>;
}

/// `reqwest` backed client. Redirects are returned to the caller rather than
/// followed, so the exporter can count them against its retry budget.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    inner: reqwest::Client,
}

impl ReqwestClient {
    /// `insecure` disables TLS certificate verification.
    pub fn new(insecure: bool) -> Result<Self, TransportError> {
        let inner = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .danger_accept_invalid_certs(insecure)
            .build()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        Ok(Self { inner })
    }
}

fn map_reqwest_error(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Other(err.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn send(
        &self,
        request: Request<Bytes>,
        timeout: Duration,
    ) -> Result<Response<Bytes>, TransportError> {
        tracing::trace!(target: "span_pipeline", uri = %request.uri(), "sending export request");
        let mut request = reqwest::Request::try_from(request).map_err(map_reqwest_error)?;
        *request.timeout_mut() = Some(timeout);

        let mut response = self.inner.execute(request).await.map_err(map_reqwest_error)?;
        let status = response.status();
        let headers = std::mem::take(response.headers_mut());
        let body = response.bytes().await.map_err(map_reqwest_error)?;

        let mut http_response = Response::builder()
            .status(status)
            .body(body)
            .map_err(|e| TransportError::Other(e.to_string()))?;
        *http_response.headers_mut() = headers;
        Ok(http_response)
    }
}
