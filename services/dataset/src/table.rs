//! Schema-less in-memory tables.
//!
//! Column sets are only known after reading an uploaded file, so a [`Table`]
//! is a list of named columns, each holding one [`Value`] per row and an
//! inferred [`DataType`].

use crate::error::{DatasetError, DatasetResult};
use serde::{Serialize, Serializer};
use std::collections::HashSet;
use std::fmt;

/// A single cell
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
}

/// Inferred column type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Int,
    Float,
    Bool,
    Text,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Bool => "bool",
            DataType::Text => "text",
        };
        f.write_str(name)
    }
}

impl Value {
    /// Parse a raw text cell, trying integer, float and boolean before text.
    /// Empty cells are null.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Value::Null;
        }
        if let Ok(i) = trimmed.parse::<i64>() {
            return Value::Int(i);
        }
        if let Ok(f) = trimmed.parse::<f64>() {
            return Value::Float(f);
        }
        if trimmed.eq_ignore_ascii_case("true") {
            return Value::Bool(true);
        }
        if trimmed.eq_ignore_ascii_case("false") {
            return Value::Bool(false);
        }
        Value::Text(raw.to_string())
    }

    fn data_type(&self) -> Option<DataType> {
        match self {
            Value::Null => None,
            Value::Int(_) => Some(DataType::Int),
            Value::Float(_) => Some(DataType::Float),
            Value::Bool(_) => Some(DataType::Bool),
            Value::Text(_) => Some(DataType::Text),
        }
    }

    /// Convert into the representation used by a column of type `dtype`
    fn coerce(self, dtype: DataType) -> Value {
        match (self, dtype) {
            (Value::Null, _) => Value::Null,
            (Value::Int(i), DataType::Float) => Value::Float(i as f64),
            (Value::Text(s), DataType::Text) => Value::Text(s),
            (v, DataType::Text) => Value::Text(v.to_string()),
            (v, _) => v,
        }
    }

    /// JSON form used in API responses. Non-finite floats become null.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => Ok(()),
            Value::Int(i) => write!(f, "{i}"),
            // Keep a fractional part so integral floats read back as floats
            Value::Float(v) if v.is_finite() && v.fract() == 0.0 => write!(f, "{v:.1}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Text(s) => f.write_str(s),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Widest type covering every non-null cell; `None` when all cells are null
fn infer_type(values: &[Value]) -> Option<DataType> {
    values
        .iter()
        .filter_map(Value::data_type)
        .try_fold(None, |acc: Option<DataType>, t| {
            let merged = match (acc, t) {
                (None, t) => t,
                (Some(a), b) if a == b => a,
                (Some(DataType::Int), DataType::Float) | (Some(DataType::Float), DataType::Int) => {
                    DataType::Float
                }
                _ => DataType::Text,
            };
            // Text absorbs everything, stop early
            if merged == DataType::Text {
                Err(DataType::Text)
            } else {
                Ok(Some(merged))
            }
        })
        .unwrap_or_else(Some)
}

/// A named, typed column
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    name: String,
    dtype: DataType,
    has_values: bool,
    values: Vec<Value>,
}

impl Column {
    /// Build a column, inferring its type and coercing cells to it.
    /// A column without any non-null cell is typed as text.
    pub fn new(name: impl Into<String>, values: Vec<Value>) -> Self {
        let inferred = infer_type(&values);
        let dtype = inferred.unwrap_or(DataType::Text);
        let values = values.into_iter().map(|v| v.coerce(dtype)).collect();

        Self {
            name: name.into(),
            dtype,
            has_values: inferred.is_some(),
            values,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dtype(&self) -> DataType {
        self.dtype
    }

    /// False when every cell is null
    pub fn has_values(&self) -> bool {
        self.has_values
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// An ordered set of equally long columns
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    columns: Vec<Column>,
    num_rows: usize,
}

impl Table {
    /// Build a table from columns. Columns must share a length and have
    /// distinct names.
    pub fn new(columns: Vec<Column>) -> DatasetResult<Self> {
        let num_rows = columns.first().map(Column::len).unwrap_or(0);

        if let Some(col) = columns.iter().find(|c| c.len() != num_rows) {
            return Err(DatasetError::MalformedFile(format!(
                "column '{}' has {} rows, expected {}",
                col.name(),
                col.len(),
                num_rows
            )));
        }

        let mut seen = HashSet::new();
        if let Some(col) = columns.iter().find(|c| !seen.insert(c.name())) {
            return Err(DatasetError::MalformedFile(format!(
                "duplicate column '{}'",
                col.name()
            )));
        }

        Ok(Self { columns, num_rows })
    }

    /// Build a table from a header and row-major cells
    pub fn from_rows(header: Vec<String>, rows: Vec<Vec<Value>>) -> DatasetResult<Self> {
        let width = header.len();
        let mut cells: Vec<Vec<Value>> = (0..width).map(|_| Vec::with_capacity(rows.len())).collect();

        for (index, row) in rows.into_iter().enumerate() {
            if row.len() != width {
                return Err(DatasetError::MalformedFile(format!(
                    "row {} has {} fields, expected {}",
                    index + 1,
                    row.len(),
                    width
                )));
            }
            for (column, value) in cells.iter_mut().zip(row) {
                column.push(value);
            }
        }

        let columns = header
            .into_iter()
            .zip(cells)
            .map(|(name, values)| Column::new(name, values))
            .collect();

        Self::new(columns)
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name() == name)
    }

    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name().to_string()).collect()
    }

    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    /// Cells of row `index` in column order
    pub fn row(&self, index: usize) -> Vec<&Value> {
        self.columns.iter().map(|c| &c.values()[index]).collect()
    }

    /// Up to `len` rows starting at `offset`, as JSON arrays in column order
    pub fn slice_json(&self, offset: usize, len: usize) -> Vec<Vec<serde_json::Value>> {
        let end = offset.saturating_add(len).min(self.num_rows);
        (offset.min(end)..end)
            .map(|i| self.columns.iter().map(|c| c.values()[i].to_json()).collect())
            .collect()
    }

    /// Normalise column names: trim, lowercase, and collapse inner
    /// whitespace runs to `_`. Fails if two names collide afterwards.
    pub fn normalize_column_names(self) -> DatasetResult<Self> {
        let columns = self
            .columns
            .into_iter()
            .map(|mut c| {
                c.name = normalize_column_name(&c.name);
                c
            })
            .collect();

        Self::new(columns)
    }
}

/// Normalised form of a column name as used for join lookups
pub fn normalize_column_name(name: &str) -> String {
    name.split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}
