//! Wire encoding of span batches.
//!
//! The exporter treats the payload as opaque bytes plus a content type. The
//! bundled [`JsonSerializer`] emits the OTLP/JSON shape:
//!
//! ```text
//! {"resourceSpans":[{"resource":{"attributes":[...]},
//!   "scopeSpans":[{"scope":{...},"spans":[...]}]}]}
//! ```

use crate::exporter::ExportError;
use crate::span::{AttributeValue, Attributes, Span, SpanBatch, SpanKind, SpanStatus};
use serde_json::{json, Value};
use std::fmt::Debug;

pub trait SpanSerializer: Debug + Send + Sync {
    /// Value of the `Content-Type` request header.
    fn content_type(&self) -> &'static str;

    fn serialize(&self, batch: &SpanBatch) -> Result<Vec<u8>, ExportError>;
}

#[derive(Debug, Clone)]
pub struct JsonSerializer {
    service_name: String,
}

impl JsonSerializer {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
        }
    }

    /// Builds the document without encoding it.
    pub fn to_value(&self, batch: &SpanBatch) -> Value {
        let resource = Attributes::from([(
            "service.name".to_owned(),
            AttributeValue::from(self.service_name.as_str()),
        )]);

        json!({
            "resourceSpans": [{
                "resource": { "attributes": encode_attributes(&resource) },
                "scopeSpans": [{
                    "scope": {
                        "name": env!("CARGO_PKG_NAME"),
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                    "spans": batch.spans.iter().map(encode_span).collect::<Vec<_>>(),
                }],
            }],
        })
    }
}

impl SpanSerializer for JsonSerializer {
    fn content_type(&self) -> &'static str {
        "application/json"
    }

    fn serialize(&self, batch: &SpanBatch) -> Result<Vec<u8>, ExportError> {
        serde_json::to_vec(&self.to_value(batch))
            .map_err(|e| ExportError::Serialization(e.to_string()))
    }
}

/// Encodes one span as an OTLP/JSON span object.
pub fn encode_span(span: &Span) -> Value {
    let mut encoded = json!({
        "traceId": format!("{:032x}", span.trace_id),
        "spanId": format!("{:016x}", span.span_id),
        "name": span.name,
        "kind": kind_code(span.kind),
        "startTimeUnixNano": span.start_time.to_string(),
        "endTimeUnixNano": span.end_time.to_string(),
        "attributes": encode_attributes(span.attributes()),
        "events": span.events().iter().map(|event| json!({
            "name": event.name,
            "timeUnixNano": event.timestamp.to_string(),
            "attributes": encode_attributes(&event.attributes),
        })).collect::<Vec<_>>(),
        "status": encode_status(&span.status),
    });
    if span.parent_span_id != 0 {
        encoded["parentSpanId"] = Value::String(format!("{:016x}", span.parent_span_id));
    }
    encoded
}

fn encode_attributes(attributes: &Attributes) -> Vec<Value> {
    attributes
        .iter()
        .filter_map(|(key, value)| {
            encode_value(value).map(|value| json!({ "key": key, "value": value }))
        })
        .collect()
}

fn encode_value(value: &AttributeValue) -> Option<Value> {
    let encoded = match value {
        AttributeValue::Null => return None,
        AttributeValue::Bool(b) => json!({ "boolValue": b }),
        AttributeValue::Int(i) => json!({ "intValue": i.to_string() }),
        AttributeValue::Float(f) => json!({ "doubleValue": f }),
        AttributeValue::String(s) => json!({ "stringValue": s }),
        AttributeValue::Array(items) => json!({
            "arrayValue": { "values": items.iter().filter_map(encode_value).collect::<Vec<_>>() }
        }),
        AttributeValue::Map(map) => json!({ "stringValue": Value::Object(map.clone()).to_string() }),
    };
    Some(encoded)
}

fn kind_code(kind: SpanKind) -> u8 {
    match kind {
        SpanKind::Internal => 1,
        SpanKind::Server => 2,
        SpanKind::Client => 3,
        SpanKind::Producer => 4,
        SpanKind::Consumer => 5,
    }
}

fn encode_status(status: &SpanStatus) -> Value {
    match status {
        SpanStatus::Unset => json!({ "code": 0 }),
        SpanStatus::Ok => json!({ "code": 1 }),
        SpanStatus::Error { description } => match description {
            Some(message) => json!({ "code": 2, "message": message }),
            None => json!({ "code": 2 }),
        },
    }
}
