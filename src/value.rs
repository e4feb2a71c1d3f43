use serde::{Deserialize, Serialize};

use crate::core::Hash32;

/// The data currency of the engine.
///
/// Every target produces a `Value`, every dependency is resolved to a
/// `Value`, and grouping variables for dynamic fan-out are `Value`s. The
/// engine itself never interprets the payload beyond what expansion needs:
/// lengths, rows and grouping keys.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Unit,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Table(Table),
}

/// A named-column, row-major table. Tabular grouping variables expand
/// row-wise over the first dimension, not element-wise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl Value {
    /// Content hash over the canonical CBOR encoding.
    pub fn fingerprint(&self) -> Hash32 {
        let mut buffer = Vec::new();
        // CBOR encoding of a self-describing enum cannot fail on a Vec writer.
        ciborium::ser::into_writer(self, &mut buffer)
            .expect("CBOR encoding of a Value is infallible");
        Hash32::hash(&buffer)
    }

    /// The grouping length of this value: element count for lists, row
    /// count for tables, 1 for scalars.
    pub fn len(&self) -> usize {
        match self {
            Value::List(items) => items.len(),
            Value::Table(table) => table.rows.len(),
            _ => 1,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The `index`-th grouping element. Lists yield their element, tables
    /// yield the row as a list of cells, scalars yield themselves. Callers
    /// are expected to stay within `len()` after recycling.
    pub fn element(&self, index: usize) -> Value {
        match self {
            Value::List(items) => items[index].clone(),
            Value::Table(table) => Value::List(table.rows[index].clone()),
            other => other.clone(),
        }
    }

    /// A short human-readable rendering of a grouping element, used when a
    /// key is textual enough to name a sub-target after it.
    pub(crate) fn label(&self) -> Option<String> {
        match self {
            Value::Text(text) if is_slug(text) => Some(text.clone()),
            Value::Int(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

fn is_slug(text: &str) -> bool {
    !text.is_empty()
        && text.len() <= 32
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
}

impl Table {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push_row(&mut self, row: Vec<Value>) {
        debug_assert_eq!(row.len(), self.columns.len());
        self.rows.push(row);
    }

    /// Contiguous row slice `[from, to)` as a new table.
    pub(crate) fn slice_rows(&self, from: usize, to: usize) -> Table {
        Table {
            columns: self.columns.clone(),
            rows: self.rows[from..to].to_vec(),
        }
    }

    /// Contiguous column slice `[from, to)` as a new table.
    pub(crate) fn slice_columns(&self, from: usize, to: usize) -> Table {
        Table {
            columns: self.columns[from..to].to_vec(),
            rows: self
                .rows
                .iter()
                .map(|row| row[from..to].to_vec())
                .collect(),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(value: Vec<T>) -> Self {
        Value::List(value.into_iter().map(Into::into).collect())
    }
}

impl From<Table> for Value {
    fn from(value: Table) -> Self {
        Value::Table(value)
    }
}
