use crate::policy::SanitizationPolicy;
use crate::sanitizer;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::SystemTime;

/// Attribute map stored on spans and events. Ordered so serialization is deterministic.
pub type Attributes = BTreeMap<String, AttributeValue>;

/// Represents a single distributed tracing span.
///
/// Identity, timing, name, kind and status are public for reading. Attributes
/// are private: the only way to write one is through the sanitizer, both while
/// the span is live (via [`SpanHandle`](crate::SpanHandle)) and after it has
/// finished (via [`Span::set_attribute`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    /// Unique trace identifier (128-bit)
    pub trace_id: u128,
    /// Unique span identifier (64-bit)
    pub span_id: u64,
    /// Parent span identifier (0 if root span)
    pub parent_span_id: u64,
    /// Span start time (Unix nanoseconds)
    pub start_time: u64,
    /// Span end time (Unix nanoseconds, 0 while the span is live)
    pub end_time: u64,
    /// Operation name
    pub name: String,
    /// Span status
    pub status: SpanStatus,
    /// Span kind
    pub kind: SpanKind,
    attributes: Attributes,
    events: Vec<SpanEvent>,
}

/// Attribute value types for span metadata.
///
/// `Null` and `Map` are accepted as inputs only. The sanitizer never stores
/// `Null`, and it renders `Map` values as JSON strings after redaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<AttributeValue>),
    Map(serde_json::Map<String, serde_json::Value>),
}

/// A timestamped annotation recorded on a span.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    /// Event time (Unix nanoseconds)
    pub timestamp: u64,
    pub attributes: Attributes,
}

/// Span execution status
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanStatus {
    /// Span status unknown
    #[default]
    Unset,
    /// Span completed successfully
    Ok,
    /// Span completed with error
    Error { description: Option<String> },
}

/// Span kind according to OpenTelemetry specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SpanKind {
    /// Internal operation span
    #[default]
    Internal,
    /// Server-side RPC span
    Server,
    /// Client-side RPC span
    Client,
    /// Producer span (messaging)
    Producer,
    /// Consumer span (messaging)
    Consumer,
}

/// Batch of finished spans for export, in finish order.
#[derive(Debug, Clone)]
pub struct SpanBatch {
    /// All spans in this batch
    pub spans: Vec<Span>,
    /// Batch creation timestamp
    pub timestamp: SystemTime,
}

/// Current wall-clock time in Unix nanoseconds.
pub fn now_nanos() -> u64 {
    unix_nanos(SystemTime::now())
}

/// Converts a `SystemTime` to Unix nanoseconds, clamping pre-epoch times to 0.
pub fn unix_nanos(time: SystemTime) -> u64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos() as u64)
}

impl AttributeValue {
    /// Null, empty string, empty sequence and empty mapping are blank.
    pub fn is_blank(&self) -> bool {
        match self {
            Self::Null => true,
            Self::String(s) => s.is_empty(),
            Self::Array(items) => items.is_empty(),
            Self::Map(map) => map.is_empty(),
            Self::Bool(_) | Self::Int(_) | Self::Float(_) => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Size of the value as counted against the attribute size budget.
    ///
    /// Strings count their UTF-8 bytes. Sequences count two bytes for the
    /// brackets plus two bytes of separator between elements.
    pub fn serialized_size(&self) -> usize {
        match self {
            Self::Null => 0,
            Self::Bool(b) => {
                if *b {
                    4
                } else {
                    5
                }
            }
            Self::Int(i) => i.to_string().len(),
            Self::Float(f) => f.to_string().len(),
            Self::String(s) => s.len(),
            Self::Array(items) => sanitizer::sequence_size(items),
            Self::Map(map) => serde_json::Value::Object(map.clone()).to_string().len(),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for AttributeValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        Self::Int(value.into())
    }
}

impl From<u16> for AttributeValue {
    fn from(value: u16) -> Self {
        Self::Int(value.into())
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl<T: Into<AttributeValue>> From<Vec<T>> for AttributeValue {
    fn from(values: Vec<T>) -> Self {
        Self::Array(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<AttributeValue>> From<Option<T>> for AttributeValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl From<serde_json::Value> for AttributeValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => Self::Null,
            Value::Bool(b) => Self::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Self::Int(i),
                None => Self::Float(n.as_f64().unwrap_or_default()),
            },
            Value::String(s) => Self::String(s),
            Value::Array(items) => Self::Array(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => Self::Map(map),
        }
    }
}

impl SpanStatus {
    /// Error status with a description.
    pub fn error(description: impl Into<String>) -> Self {
        Self::Error {
            description: Some(description.into()),
        }
    }

    /// Maps an HTTP status code to a span status: 1xx-3xx are `Ok`, anything
    /// else is an error.
    pub fn from_http_status(code: u16) -> Self {
        if (100..400).contains(&code) {
            Self::Ok
        } else {
            Self::Error { description: None }
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }
}

impl Span {
    /// Creates a new live span starting now.
    pub fn new(
        trace_id: u128,
        span_id: u64,
        parent_span_id: u64,
        name: String,
        kind: SpanKind,
    ) -> Self {
        Self {
            trace_id,
            span_id,
            parent_span_id,
            start_time: now_nanos(),
            end_time: 0,
            name,
            status: SpanStatus::Unset,
            kind,
            attributes: Attributes::new(),
            events: Vec::new(),
        }
    }

    /// Writes an attribute through the sanitizer.
    ///
    /// Blank or excluded values are dropped; a dropped write leaves any
    /// previous value for the key untouched.
    pub fn set_attribute(
        &mut self,
        key: impl Into<String>,
        value: impl Into<AttributeValue>,
        policy: &SanitizationPolicy,
    ) {
        let key = key.into();
        if let Some(value) = sanitizer::prepare(&key, value.into(), policy) {
            self.attributes.insert(key, value);
        }
    }

    /// Appends an event whose attributes pass through the sanitizer.
    pub(crate) fn push_event(
        &mut self,
        name: String,
        timestamp: u64,
        attributes: Attributes,
        policy: &SanitizationPolicy,
    ) {
        self.events.push(SpanEvent {
            name,
            timestamp,
            attributes: sanitizer::prepare_all(attributes, policy),
        });
    }

    /// Marks the span as completed, applying the policy once more so values
    /// written under an older policy are re-bounded.
    pub(crate) fn finish(&mut self, status: SpanStatus, policy: &SanitizationPolicy) {
        self.end_time = now_nanos().max(self.start_time);
        self.status = status;
        self.attributes = sanitizer::prepare_all(std::mem::take(&mut self.attributes), policy);
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn events(&self) -> &[SpanEvent] {
        &self.events
    }

    /// Returns true once the end timestamp is set.
    pub fn is_finished(&self) -> bool {
        self.end_time != 0
    }
}

impl SpanBatch {
    /// Creates a new empty span batch
    pub fn new() -> Self {
        Self {
            spans: Vec::new(),
            timestamp: SystemTime::now(),
        }
    }

    /// Creates a batch with the given spans
    pub fn with_spans(spans: Vec<Span>) -> Self {
        Self {
            spans,
            timestamp: SystemTime::now(),
        }
    }

    /// Adds a span to the batch
    pub fn add(&mut self, span: Span) {
        self.spans.push(span);
    }

    /// Returns the number of spans in the batch
    pub fn len(&self) -> usize {
        self.spans.len()
    }

    /// Returns true if the batch is empty
    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }
}

impl Default for SpanBatch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_values() {
        assert!(AttributeValue::Null.is_blank());
        assert!(AttributeValue::from("").is_blank());
        assert!(AttributeValue::Array(vec![]).is_blank());
        assert!(!AttributeValue::from(false).is_blank());
        assert!(!AttributeValue::from(0).is_blank());
    }

    #[test]
    fn test_set_attribute_goes_through_sanitizer() {
        let policy = SanitizationPolicy::new(4).unwrap().with_excluded_keys(["secret"]);
        let mut span = Span::new(1, 1, 0, "op".into(), SpanKind::Internal);

        span.set_attribute("name", "abcdefgh", &policy);
        span.set_attribute("secret", "hunter2", &policy);
        span.set_attribute("empty", "", &policy);

        assert_eq!(span.attribute("name"), Some(&AttributeValue::from("abcd")));
        assert!(span.attribute("secret").is_none());
        assert!(span.attribute("empty").is_none());
    }

    #[test]
    fn test_blank_write_keeps_previous_value() {
        let policy = SanitizationPolicy::default();
        let mut span = Span::new(1, 1, 0, "op".into(), SpanKind::Internal);
        span.set_attribute("k", "v", &policy);
        span.set_attribute("k", AttributeValue::Null, &policy);
        assert_eq!(span.attribute("k"), Some(&AttributeValue::from("v")));
    }

    #[test]
    fn test_finish_rebounds_attributes() {
        let mut span = Span::new(1, 1, 0, "op".into(), SpanKind::Server);
        span.set_attribute("body", "0123456789", &SanitizationPolicy::default());

        let tighter = SanitizationPolicy::new(3).unwrap();
        span.finish(SpanStatus::Ok, &tighter);

        assert!(span.is_finished());
        assert_eq!(span.status, SpanStatus::Ok);
        assert_eq!(span.attribute("body"), Some(&AttributeValue::from("012")));
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(SpanStatus::from_http_status(200), SpanStatus::Ok);
        assert_eq!(SpanStatus::from_http_status(302), SpanStatus::Ok);
        assert!(SpanStatus::from_http_status(404).is_error());
        assert!(SpanStatus::from_http_status(503).is_error());
    }

    #[test]
    fn test_from_json_value() {
        let value: AttributeValue = serde_json::json!({"a": 1}).into();
        assert!(matches!(value, AttributeValue::Map(_)));
        let value: AttributeValue = serde_json::json!([1, 2.5, "x"]).into();
        assert_eq!(
            value,
            AttributeValue::Array(vec![
                AttributeValue::Int(1),
                AttributeValue::Float(2.5),
                AttributeValue::from("x"),
            ])
        );
    }
}
