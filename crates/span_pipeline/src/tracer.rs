//! Span creation surface used by instrumentation.
//!
//! Every attribute write, on the span and on its events, passes through the
//! sanitizer under the policy current at the time of the write. Finishing a
//! span applies the current policy once more and hands the span to each
//! export driver. `finish` consumes the handle, so a finished span cannot be
//! written through it.

use crate::policy::PolicyHandle;
use crate::processor::ExportDriver;
use crate::span::{now_nanos, unix_nanos, AttributeValue, Span, SpanKind, SpanStatus};
use rand::Rng;
use std::sync::Arc;
use std::time::SystemTime;

/// Identity of a span, used to parent child spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanContext {
    pub trace_id: u128,
    pub span_id: u64,
}

#[derive(Clone)]
pub struct Tracer {
    inner: Arc<TracerInner>,
}

struct TracerInner {
    policy: PolicyHandle,
    drivers: Vec<Arc<ExportDriver>>,
    metadata_only: bool,
}

impl Tracer {
    pub fn new(policy: PolicyHandle, drivers: Vec<Arc<ExportDriver>>, metadata_only: bool) -> Self {
        Self {
            inner: Arc::new(TracerInner {
                policy,
                drivers,
                metadata_only,
            }),
        }
    }

    /// Starts a live span. With a parent it joins the parent's trace,
    /// otherwise it starts a new one.
    pub fn start_span<I, K>(
        &self,
        name: impl Into<String>,
        kind: SpanKind,
        attributes: I,
        parent: Option<&SpanContext>,
    ) -> SpanHandle
    where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let mut rng = rand::thread_rng();
        let (trace_id, parent_span_id) = match parent {
            Some(parent) => (parent.trace_id, parent.span_id),
            None => (rng.gen_range(1..=u128::MAX), 0),
        };
        let span_id = rng.gen_range(1..=u64::MAX);

        let mut span = Span::new(trace_id, span_id, parent_span_id, name.into(), kind);
        let policy = self.inner.policy.load();
        for (key, value) in attributes {
            span.set_attribute(key, value, &policy);
        }

        SpanHandle {
            span,
            tracer: self.clone(),
        }
    }

    pub fn policy(&self) -> &PolicyHandle {
        &self.inner.policy
    }

    /// True when instrumentation should record metadata only (no bodies or headers).
    pub fn metadata_only(&self) -> bool {
        self.inner.metadata_only
    }
}

/// A live span. Dropping it without calling [`finish`](Self::finish)
/// discards the span.
pub struct SpanHandle {
    span: Span,
    tracer: Tracer,
}

impl SpanHandle {
    pub fn context(&self) -> SpanContext {
        SpanContext {
            trace_id: self.span.trace_id,
            span_id: self.span.span_id,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        let policy = self.tracer.inner.policy.load();
        self.span.set_attribute(key, value, &policy);
    }

    /// Records an event. `timestamp` defaults to now.
    pub fn add_event<I, K>(
        &mut self,
        name: impl Into<String>,
        attributes: I,
        timestamp: Option<SystemTime>,
    ) where
        I: IntoIterator<Item = (K, AttributeValue)>,
        K: Into<String>,
    {
        let policy = self.tracer.inner.policy.load();
        let timestamp = timestamp.map_or_else(now_nanos, unix_nanos);
        let attributes = attributes
            .into_iter()
            .map(|(key, value)| (key.into(), value))
            .collect();
        self.span.push_event(name.into(), timestamp, attributes, &policy);
    }

    /// Ends the span and hands it to every export driver.
    pub async fn finish(self, status: SpanStatus) {
        let Self { mut span, tracer } = self;
        span.finish(status, &tracer.inner.policy.load());

        let drivers = &tracer.inner.drivers;
        if let Some((last, rest)) = drivers.split_last() {
            for driver in rest {
                driver.on_end(span.clone()).await;
            }
            last.on_end(span).await;
        }
    }
}
