//! Request query-string attributes.

use crate::span::{AttributeValue, Attributes};
use serde_json::{Map, Value};
use url::form_urlencoded;

pub const QUERY_PARAMS_KEY: &str = "http.request.query_params";
pub const QUERY_KEY: &str = "http.request.query";

/// Attributes describing a request query string.
///
/// Key/value queries are decoded into `name -> [values]` under
/// [`QUERY_PARAMS_KEY`], so exclusions can target single parameters with
/// dot paths such as `http.request.query_params.token`. Anything else is
/// recorded verbatim under [`QUERY_KEY`].
pub fn query_attributes(query: Option<&str>) -> Attributes {
    let mut attributes = Attributes::new();
    let Some(query) = query.map(|q| q.trim_start_matches('?')).filter(|q| !q.is_empty()) else {
        return attributes;
    };

    if query.contains('=') {
        let mut params = Map::new();
        for (name, value) in form_urlencoded::parse(query.as_bytes()) {
            let values = params
                .entry(name.into_owned())
                .or_insert_with(|| Value::Array(Vec::new()));
            if let Value::Array(values) = values {
                values.push(Value::String(value.into_owned()));
            }
        }
        attributes.insert(QUERY_PARAMS_KEY.into(), AttributeValue::Map(params));
    } else {
        attributes.insert(QUERY_KEY.into(), query.into());
    }
    attributes
}
