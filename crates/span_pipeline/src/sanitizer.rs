//! Attribute Sanitizer
//!
//! Pure, total transformation applied to every attribute before it is stored
//! on a span. The order of operations is fixed:
//!
//! 1. exclusion (the key itself, then excluded paths nested under it)
//! 2. mapping values are rendered to JSON strings
//! 3. blank values (null, `""`, `[]`, `{}`) are dropped
//! 4. strings and sequences are bounded to the policy's byte budget
//!
//! # Sequence budget
//!
//! A sequence is charged [`SEQUENCE_OVERHEAD`] bytes for its brackets and
//! [`SEPARATOR_OVERHEAD`] bytes between consecutive elements, on top of each
//! element's own size. Elements are kept greedily while the running total
//! stays within the budget. The first element that does not fit is truncated
//! to whatever budget is left after its separator and kept if anything of it
//! survives. Everything after it is dropped. Scalars that do not fit are
//! dropped, since they cannot be shortened.
//!
//! With this rule [`sequence_size`] of the output never exceeds the budget
//! (for budgets of at least two bytes; smaller budgets yield an empty, and
//! therefore dropped, sequence).

use crate::policy::SanitizationPolicy;
use crate::span::{AttributeValue, Attributes};
use serde_json::{Map, Value};

/// Bytes charged for the enclosing brackets of a sequence.
pub const SEQUENCE_OVERHEAD: usize = 2;
/// Bytes charged between two consecutive sequence elements.
pub const SEPARATOR_OVERHEAD: usize = 2;

/// Sanitizes a single attribute. Returns `None` when the write must be dropped.
pub fn prepare(
    key: &str,
    value: AttributeValue,
    policy: &SanitizationPolicy,
) -> Option<AttributeValue> {
    if policy.is_excluded(key) {
        return None;
    }

    let value = render_structured(value, key, policy);
    if value.is_blank() {
        return None;
    }

    let value = truncate(value, policy.max_attribute_size());
    (!value.is_blank()).then_some(value)
}

/// Sanitizes every entry of an attribute map, dropping rejected entries.
pub fn prepare_all<I, K>(attributes: I, policy: &SanitizationPolicy) -> Attributes
where
    I: IntoIterator<Item = (K, AttributeValue)>,
    K: Into<String>,
{
    attributes
        .into_iter()
        .filter_map(|(key, value)| {
            let key = key.into();
            prepare(&key, value, policy).map(|value| (key, value))
        })
        .collect()
}

/// Truncates a string to at most `max_bytes` bytes without splitting a
/// UTF-8 character. The result is always a prefix of `s`.
pub fn truncate_str(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Bounds strings and sequences to `max_bytes`; other values pass through.
pub fn truncate(value: AttributeValue, max_bytes: usize) -> AttributeValue {
    match value {
        AttributeValue::String(s) => {
            if s.len() <= max_bytes {
                AttributeValue::String(s)
            } else {
                AttributeValue::String(truncate_str(&s, max_bytes).to_owned())
            }
        }
        AttributeValue::Array(items) => AttributeValue::Array(truncate_sequence(items, max_bytes)),
        other => other,
    }
}

/// Budgeted size of a sequence: brackets, elements and separators.
pub fn sequence_size(items: &[AttributeValue]) -> usize {
    let elements: usize = items.iter().map(AttributeValue::serialized_size).sum();
    let separators = items.len().saturating_sub(1) * SEPARATOR_OVERHEAD;
    SEQUENCE_OVERHEAD + elements + separators
}

fn truncate_sequence(items: Vec<AttributeValue>, max_bytes: usize) -> Vec<AttributeValue> {
    let mut used = SEQUENCE_OVERHEAD;
    let mut kept = Vec::new();

    for item in items {
        let separator = if kept.is_empty() { 0 } else { SEPARATOR_OVERHEAD };
        let size = item.serialized_size();

        if used + separator + size <= max_bytes {
            used += separator + size;
            kept.push(item);
            continue;
        }

        let remaining = max_bytes.saturating_sub(used + separator);
        if remaining > 0 && matches!(item, AttributeValue::String(_) | AttributeValue::Array(_)) {
            let tail = truncate(item, remaining);
            if !tail.is_blank() && tail.serialized_size() <= remaining {
                kept.push(tail);
            }
        }
        break;
    }

    kept
}

/// Redacts and renders mapping values (including mappings nested in
/// sequences) to JSON strings, and removes nulls from sequences.
fn render_structured(value: AttributeValue, path: &str, policy: &SanitizationPolicy) -> AttributeValue {
    match value {
        AttributeValue::Map(map) => {
            let redacted = redact(map, path, policy);
            if redacted.is_empty() {
                AttributeValue::Null
            } else {
                AttributeValue::String(Value::Object(redacted).to_string())
            }
        }
        AttributeValue::Array(items) => AttributeValue::Array(
            items
                .into_iter()
                .map(|item| render_structured(item, path, policy))
                .filter(|item| !matches!(item, AttributeValue::Null))
                .collect(),
        ),
        other => other,
    }
}

/// Removes every entry of `map` whose dot-path (relative to `path`) is excluded.
fn redact(map: Map<String, Value>, path: &str, policy: &SanitizationPolicy) -> Map<String, Value> {
    if !policy.has_exclusions_under(path) {
        return map;
    }

    map.into_iter()
        .filter_map(|(key, value)| {
            let child = format!("{path}.{key}");
            if policy.is_excluded(&child) {
                return None;
            }
            Some((key, redact_value(value, &child, policy)))
        })
        .collect()
}

fn redact_value(value: Value, path: &str, policy: &SanitizationPolicy) -> Value {
    match value {
        Value::Object(map) => Value::Object(redact(map, path, policy)),
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| redact_value(item, path, policy))
                .collect(),
        ),
        other => other,
    }
}
