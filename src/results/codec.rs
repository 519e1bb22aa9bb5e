//! Decoding of message bodies into [`ResultRecord`]s.
//!
//! Field names are matched case-insensitively: `{"ID": "1", "Count": 5}` and
//! `{"id": "1", "count": 5}` decode to the same record. Unknown fields are ignored.
use crate::results::ResultRecord;
use serde_json::{Map, Value};

#[derive(thiserror::Error, Debug)]
pub enum DecodeError {
    /// The body is not valid JSON.
    #[error("The message body is not valid JSON.")]
    Syntax(#[source] serde_json::Error),
    /// The body is valid JSON, but it does not describe a count result.
    #[error("The message body does not describe a count result.")]
    Shape(#[source] serde_json::Error),
}

/// Decode a message body into a [`ResultRecord`].
///
/// It performs no I/O.
pub fn decode(body: &[u8]) -> Result<ResultRecord, DecodeError> {
    let value: Value = serde_json::from_slice(body).map_err(DecodeError::Syntax)?;
    serde_json::from_value(lowercase_keys(value)).map_err(DecodeError::Shape)
}

/// Lower-case the keys of every object in `value`, at any depth.
///
/// If two keys are equal once lower-cased, the one that comes last in the document wins.
fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(object) => {
            let mut lowercased = Map::with_capacity(object.len());
            for (key, value) in object {
                lowercased.insert(key.to_lowercase(), lowercase_keys(value));
            }
            Value::Object(lowercased)
        }
        Value::Array(values) => Value::Array(values.into_iter().map(lowercase_keys).collect()),
        other => other,
    }
}
