//! In-process JSON to ClickHouse type mapping.
//!
//! Used when the server-side `DESC format(...)` inference is disabled. The
//! mapping mirrors what ClickHouse itself infers for a single JSON row with
//! nullable inference turned off.

use super::ColumnSpec;
use chrono::DateTime;
use serde_json::{Map, Value};

/// Infer one column per top-level key, in key order.
pub fn infer_columns(object: &Map<String, Value>) -> Vec<ColumnSpec> {
    object
        .iter()
        .map(|(name, value)| ColumnSpec::new(name.clone(), infer_store_type(value)))
        .collect()
}

/// ClickHouse type for a single JSON value.
pub fn infer_store_type(value: &Value) -> String {
    match value {
        Value::Null => "Nullable(String)".to_string(),
        Value::Bool(_) => "Bool".to_string(),
        Value::Number(n) => {
            if n.is_i64() {
                "Int64".to_string()
            } else if n.is_u64() {
                "UInt64".to_string()
            } else {
                "Float64".to_string()
            }
        }
        Value::String(s) => {
            if looks_like_timestamp(s) {
                "DateTime64(9)".to_string()
            } else {
                "String".to_string()
            }
        }
        Value::Array(items) => {
            let element = items
                .iter()
                .find(|v| !v.is_null())
                .map(infer_store_type)
                .unwrap_or_else(|| "Nullable(String)".to_string());
            format!("Array({})", element)
        }
        // Nested objects are stored as their JSON text.
        Value::Object(_) => "String".to_string(),
    }
}

fn looks_like_timestamp(s: &str) -> bool {
    DateTime::parse_from_rfc3339(s).is_ok()
}
