//! Destination table schema, inferred once from a sample message.
//!
//! A [`Schema`] is an ordered list of columns. The order is fixed at
//! construction and decides the positional layout of every inserted row.
//! Nothing mutates a schema after inference, so it is shared behind an
//! `Arc` without locking.

mod inferrer;
mod local;

pub use inferrer::SchemaInferrer;
pub use local::{infer_columns, infer_store_type};

use crate::{Result, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

/// One inferred column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name, identical to the JSON key
    pub name: String,

    /// ClickHouse type, e.g. `Int64` or `Nullable(String)`
    pub store_type: String,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, store_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store_type: store_type.into(),
        }
    }
}

impl fmt::Display for ColumnSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.store_type)
    }
}

/// Ordered, duplicate-free column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    columns: Vec<ColumnSpec>,
}

impl Schema {
    /// Build a schema, rejecting empty lists and repeated names.
    pub fn new(columns: Vec<ColumnSpec>) -> Result<Self> {
        if columns.is_empty() {
            return Err(SchemaError::Empty.into());
        }

        let mut seen = HashSet::with_capacity(columns.len());
        for column in &columns {
            if !seen.insert(column.name.as_str()) {
                return Err(SchemaError::DuplicateColumn(column.name.clone()).into());
            }
        }

        Ok(Self { columns })
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in schema order.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.columns.iter().map(|c| c.name.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.columns.iter().any(|c| c.name == name)
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, column) in self.columns.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", column)?;
        }
        Ok(())
    }
}
