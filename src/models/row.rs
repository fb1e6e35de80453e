//! Result rows.

use crate::error::{DbError, DbResult};
use crate::models::value::{FromValue, Value};
use std::sync::Arc;

/// Addresses a column either by name or by 0-based position.
pub trait ColumnIndex: std::fmt::Debug {
    fn position(&self, columns: &[String]) -> DbResult<usize>;
}

impl ColumnIndex for usize {
    fn position(&self, columns: &[String]) -> DbResult<usize> {
        if *self < columns.len() {
            Ok(*self)
        } else {
            Err(DbError::column_not_found(format!(
                "index {} (row has {} columns)",
                self,
                columns.len()
            )))
        }
    }
}

impl ColumnIndex for &str {
    fn position(&self, columns: &[String]) -> DbResult<usize> {
        columns
            .iter()
            .position(|c| c == self)
            .or_else(|| columns.iter().position(|c| c.eq_ignore_ascii_case(self)))
            .ok_or_else(|| DbError::column_not_found(*self))
    }
}

impl ColumnIndex for String {
    fn position(&self, columns: &[String]) -> DbResult<usize> {
        self.as_str().position(columns)
    }
}

/// One row of a query result.
///
/// Column names are shared between all rows of the same result.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
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

    /// Raw value of a column.
    ///
    /// A column named in the header but missing from a short row is
    /// reported as not found.
    pub fn get_value<I: ColumnIndex>(&self, column: I) -> DbResult<&Value> {
        let idx = column.position(&self.columns)?;
        self.value_at(idx)
    }

    /// Typed value of a column.
    pub fn get<T: FromValue, I: ColumnIndex>(&self, column: I) -> DbResult<T> {
        let idx = column.position(&self.columns)?;
        T::from_value(self.value_at(idx)?)
            .map_err(|message| DbError::decode(self.columns[idx].clone(), message))
    }

    fn value_at(&self, idx: usize) -> DbResult<&Value> {
        self.values.get(idx).ok_or_else(|| {
            DbError::column_not_found(format!(
                "{} (row has {} values)",
                self.columns[idx],
                self.values.len()
            ))
        })
    }

    /// Convert to a JSON object keyed by column name.
    pub fn to_json_map(&self) -> serde_json::Map<String, serde_json::Value> {
        self.columns
            .iter()
            .zip(&self.values)
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}
