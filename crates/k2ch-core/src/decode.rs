//! Message decoding and projection onto the schema.
//!
//! Decoding turns payload bytes into a JSON object. Projection looks up each
//! schema column in that object, in schema order, so every row has exactly
//! one value per column. Missing keys become `null` (the column default on
//! insert) and keys the schema does not know are ignored.

use crate::schema::Schema;
use crate::DecodeError;
use serde_json::{Map, Value};

/// A projected row, positional per schema.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedRow {
    /// Source partition
    pub partition: i32,

    /// Source offset
    pub offset: i64,

    /// One value per schema column
    pub values: Vec<Value>,
}

impl DecodedRow {
    pub fn new(partition: i32, offset: i64, values: Vec<Value>) -> Self {
        Self {
            partition,
            offset,
            values,
        }
    }
}

/// Decode a payload as a JSON object.
///
/// An empty payload (including a tombstone) is treated as `{}`. Whitespace
/// alone is not empty and fails as invalid JSON.
pub fn decode_object(payload: &[u8]) -> Result<Map<String, Value>, DecodeError> {
    if payload.is_empty() {
        return Ok(Map::new());
    }

    let text =
        std::str::from_utf8(payload).map_err(|e| DecodeError::InvalidUtf8(e.to_string()))?;

    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(DecodeError::NotAnObject(kind_of(&other))),
        Err(e) => Err(DecodeError::InvalidJson(e.to_string())),
    }
}

/// Project a decoded object onto the schema's column order.
pub fn project(mut object: Map<String, Value>, schema: &Schema) -> Vec<Value> {
    schema
        .names()
        .map(|name| object.remove(name).unwrap_or(Value::Null))
        .collect()
}

/// Decode and project in one step.
pub fn decode_row(
    partition: i32,
    offset: i64,
    payload: &[u8],
    schema: &Schema,
) -> Result<DecodedRow, DecodeError> {
    let object = decode_object(payload)?;
    Ok(DecodedRow::new(partition, offset, project(object, schema)))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
