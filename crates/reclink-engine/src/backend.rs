//! Contract between the engine and whatever executes its SQL.
//!
//! A backend materialises each statement as a table
//! (`CREATE TABLE IF NOT EXISTS <physical> AS <sql>`), answers existence
//! checks, and hands back rows as JSON maps. Infinite floats, which JSON
//! numbers cannot carry, are returned as the strings `"Infinity"` and
//! `"-Infinity"`. Backend failures are plain `anyhow` errors; the engine
//! propagates them unchanged.

use reclink_sql::SqlDialect;
use serde_json::Value;

use crate::error::{LinkerError, Result};

/// One row, keyed by column name.
pub type Record = serde_json::Map<String, Value>;

/// Logical (templated) and physical name of a table.
///
/// The templated name is what generated SQL refers to; the physical name is
/// where the backend actually stored the rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub templated: String,
    pub physical: String,
}

impl TableName {
    pub fn new(templated: impl Into<String>, physical: impl Into<String>) -> Self {
        Self {
            templated: templated.into(),
            physical: physical.into(),
        }
    }

    /// A table stored under its own logical name.
    pub fn logical(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            templated: name.clone(),
            physical: name,
        }
    }
}

pub trait TableHandle {
    fn name(&self) -> &TableName;

    fn templated_name(&self) -> &str {
        &self.name().templated
    }

    fn physical_name(&self) -> &str {
        &self.name().physical
    }

    fn columns(&self) -> anyhow::Result<Vec<String>>;

    fn as_records(&self, limit: Option<usize>) -> anyhow::Result<Vec<Record>>;
}

pub trait Backend {
    type Table: TableHandle;

    /// Dialect the backend executes.
    fn dialect(&self) -> SqlDialect;

    /// Materialise `sql` as `physical_name`, leaving an existing table alone.
    fn execute_sql(
        &self,
        sql: &str,
        templated_name: &str,
        physical_name: &str,
        transpile: bool,
    ) -> anyhow::Result<Self::Table>;

    fn table_exists(&self, name: &str) -> anyhow::Result<bool>;

    /// Handle for a table that already exists.
    fn table(&self, templated_name: &str, physical_name: &str) -> anyhow::Result<Self::Table>;

    /// Clause appended to `select * from <table>` to keep roughly
    /// `proportion` of the rows; empty when everything is kept.
    fn random_sample_sql(&self, proportion: f64) -> String;
}

// ============================================================================
// Record access
// ============================================================================

fn unexpected(table: &str, message: String) -> LinkerError {
    LinkerError::UnexpectedResult {
        table: table.to_string(),
        message,
    }
}

fn field<'a>(record: &'a Record, key: &str, table: &str) -> Result<&'a Value> {
    record
        .get(key)
        .ok_or_else(|| unexpected(table, format!("missing column `{key}`")))
}

/// Numeric cell; SQL NULL reads as `None`.
pub(crate) fn get_f64(record: &Record, key: &str, table: &str) -> Result<Option<f64>> {
    match field(record, key, table)? {
        Value::Null => Ok(None),
        Value::String(s) if s == "Infinity" => Ok(Some(f64::INFINITY)),
        Value::String(s) if s == "-Infinity" => Ok(Some(f64::NEG_INFINITY)),
        Value::Number(n) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| unexpected(table, format!("column `{key}` is not a finite number"))),
        other => Err(unexpected(table, format!("column `{key}` holds {other}, expected a number"))),
    }
}

pub(crate) fn get_i64(record: &Record, key: &str, table: &str) -> Result<i64> {
    match field(record, key, table)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .ok_or_else(|| unexpected(table, format!("column `{key}` is not an integer"))),
        other => Err(unexpected(table, format!("column `{key}` holds {other}, expected an integer"))),
    }
}

pub(crate) fn get_str<'a>(record: &'a Record, key: &str, table: &str) -> Result<&'a str> {
    match field(record, key, table)? {
        Value::String(s) => Ok(s),
        other => Err(unexpected(table, format!("column `{key}` holds {other}, expected text"))),
    }
}
