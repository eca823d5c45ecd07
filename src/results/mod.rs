//! Thread-safe-friendly results aggregation for parameter sweeps.
//!
//! [`ResultsTable`] is a column-oriented, insertion-ordered store that
//! tolerates sparse, out-of-order writes: concurrent sweep variants finish in
//! arbitrary order but each writes its row at its own dense sweep index, so
//! iterating the table always yields sweep order.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;


/// A single parameter or measurement value.
///
/// Untagged serde representation so TOML/JSON scalars map directly
/// (`3` -> `Int`, `3.5` -> `Float`, `"x"` -> `Str`, `true` -> `Bool`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl Value {
    /// Numeric view of the value, if it has one.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(v) => write!(f, "{}", v),
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{}", v),
            Value::Str(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// One named column; cells are `None` where no row was written yet.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Column {
    name: String,
    cells: Vec<Option<Value>>,
}

/// Ordered, sparsely-writable column store.
///
/// Columns keep insertion order; rows are addressed by a dense index and may
/// be written in any order. Writing row `i` beyond the current length pads
/// the intervening rows of every column with the missing sentinel (`None`).
/// Re-writing an index with a subset of keys overwrites only those keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsTable {
    columns: Vec<Column>,
    created_at: DateTime<Utc>,
}

impl ResultsTable {
    pub fn new() -> Self {
        Self {
            columns: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// Number of rows, defined as the longest column's length.
    pub fn num_rows(&self) -> usize {
        self.columns.iter().map(|c| c.cells.len()).max().unwrap_or(0)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Homogeneous view of one column; `None` cells are missing rows.
    pub fn column(&self, name: &str) -> Option<&[Option<Value>]> {
        self.columns
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.cells.as_slice())
    }

    /// When the table was created (sweep submission time).
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Write a keyed row at an arbitrary index.
    ///
    /// Missing columns are created on demand; intervening rows are padded
    /// with the missing sentinel; keys absent from `values` are left
    /// untouched at `row`.
    pub fn add_row(&mut self, values: &[(String, Value)], row: usize) {
        for (name, value) in values {
            let column = self.ensure_column(name);
            if column.cells.len() <= row {
                column.cells.resize(row + 1, None);
            }
            column.cells[row] = Some(value.clone());
        }
    }

    /// Append a full positional row; the value count must match the current
    /// column count.
    pub fn push_row(&mut self, values: &[Value]) -> Result<()> {
        if values.len() != self.columns.len() {
            return Err(anyhow!(
                "positional row has {} values but table has {} columns",
                values.len(),
                self.columns.len()
            ));
        }
        let row = self.num_rows();
        for (column, value) in self.columns.iter_mut().zip(values) {
            if column.cells.len() <= row {
                column.cells.resize(row + 1, None);
            }
            column.cells[row] = Some(value.clone());
        }
        Ok(())
    }

    /// One row as `(column, cell)` pairs in column insertion order.
    pub fn row(&self, index: usize) -> Vec<(String, Option<Value>)> {
        self.columns
            .iter()
            .map(|c| (c.name.clone(), c.cells.get(index).cloned().flatten()))
            .collect()
    }

    /// Iterate rows in index order regardless of write order.
    pub fn rows(&self) -> impl Iterator<Item = Vec<(String, Option<Value>)>> + '_ {
        (0..self.num_rows()).map(|i| self.row(i))
    }

    /// Look up a single cell by column name and row index.
    pub fn get(&self, name: &str, row: usize) -> Option<Value> {
        self.column(name)?.get(row).cloned().flatten()
    }

    /// Render the table as CSV; missing cells become empty fields.
    pub fn to_csv(&self) -> String {
        let mut out = String::new();
        let header: Vec<String> = self
            .columns
            .iter()
            .map(|c| csv_escape(&c.name))
            .collect();
        out.push_str(&header.join(","));
        out.push('\n');
        for row in self.rows() {
            let fields: Vec<String> = row
                .iter()
                .map(|(_, cell)| match cell {
                    Some(value) => csv_escape(&value.to_string()),
                    None => String::new(),
                })
                .collect();
            out.push_str(&fields.join(","));
            out.push('\n');
        }
        out
    }

    /// Write the CSV rendering to `path`.
    pub async fn write_csv(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_csv()).await?;
        Ok(())
    }

    /// Render the table as a JSON array of row objects. Missing cells are
    /// `null`.
    pub fn to_json(&self) -> Result<String> {
        let rows: Vec<serde_json::Map<String, serde_json::Value>> = self
            .rows()
            .map(|row| {
                row.into_iter()
                    .map(|(name, cell)| {
                        let value = match cell {
                            Some(value) => serde_json::to_value(value)?,
                            None => serde_json::Value::Null,
                        };
                        Ok((name, value))
                    })
                    .collect::<Result<_>>()
            })
            .collect::<Result<_>>()?;
        Ok(serde_json::to_string_pretty(&rows)?)
    }

    fn ensure_column(&mut self, name: &str) -> &mut Column {
        if let Some(idx) = self.columns.iter().position(|c| c.name == name) {
            &mut self.columns[idx]
        } else {
            self.columns.push(Column {
                name: name.to_string(),
                cells: Vec::new(),
            });
            self.columns.last_mut().unwrap()
        }
    }
}

impl Default for ResultsTable {
    fn default() -> Self {
        Self::new()
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains([',', '"', '\n']) {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
