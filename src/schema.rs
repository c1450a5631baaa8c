//! Target table shapes and the SQL issued against them.
//!
//! Batches travel column-wise: every column of a batch becomes one typed
//! array bound as a single parameter, and the insert expands them with
//! `UNNEST`, so one statement carries the whole batch in one round trip.

use chrono::NaiveDateTime;
use tokio_postgres::types::ToSql;

use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Column {
    pub name: &'static str,
    pub sql_type: &'static str,
    /// Array type used to cast the bound parameter in `UNNEST`.
    pub array_type: &'static str,
}

impl Column {
    pub const fn new(name: &'static str, sql_type: &'static str, array_type: &'static str) -> Self {
        Self {
            name,
            sql_type,
            array_type,
        }
    }
}

/// One column of a batch, ready to bind.
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    Int8(Vec<i64>),
    Int4(Vec<i32>),
    Float8(Vec<f64>),
    Text(Vec<String>),
    Timestamp(Vec<NaiveDateTime>),
}

#[allow(clippy::len_without_is_empty)]
impl ColumnData {
    pub fn len(&self) -> usize {
        match self {
            Self::Int8(v) => v.len(),
            Self::Int4(v) => v.len(),
            Self::Float8(v) => v.len(),
            Self::Text(v) => v.len(),
            Self::Timestamp(v) => v.len(),
        }
    }

    pub fn as_param(&self) -> &(dyn ToSql + Sync) {
        match self {
            Self::Int8(v) => v,
            Self::Int4(v) => v,
            Self::Float8(v) => v,
            Self::Text(v) => v,
            Self::Timestamp(v) => v,
        }
    }

    /// Renders the value at `idx` as text, the way `::TEXT` would.
    #[cfg(test)]
    pub fn render(&self, idx: usize) -> Option<String> {
        match self {
            Self::Int8(v) => v.get(idx).map(|x| x.to_string()),
            Self::Int4(v) => v.get(idx).map(|x| x.to_string()),
            Self::Float8(v) => v.get(idx).map(|x| x.to_string()),
            Self::Text(v) => v.get(idx).cloned(),
            Self::Timestamp(v) => v.get(idx).map(|x| x.to_string()),
        }
    }
}

/// A row type that can be written by the batch writer.
pub trait Record: Send + Sync + Sized + 'static {
    const COLUMNS: &'static [Column];
    const PRIMARY_KEY: &'static str;

    /// Primary key rendered as text.
    fn key(&self) -> String;

    /// Transposes a batch into one `ColumnData` per entry of `COLUMNS`.
    fn to_columns(rows: &[Self]) -> Vec<ColumnData>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSchema {
    name: String,
    columns: &'static [Column],
    primary_key: &'static str,
}

impl TableSchema {
    pub fn new(
        name: impl Into<String>,
        columns: &'static [Column],
        primary_key: &'static str,
    ) -> Result<Self> {
        let name = name.into();
        if !is_valid_table_name(&name) {
            return Err(IngestError::config(format!("invalid table name: {name:?}")));
        }
        if !columns.iter().any(|c| c.name == primary_key) {
            return Err(IngestError::config(format!(
                "primary key {primary_key} is not a column of {name}"
            )));
        }
        Ok(Self {
            name,
            columns,
            primary_key,
        })
    }

    pub fn for_record<R: Record>(name: impl Into<String>) -> Result<Self> {
        Self::new(name, R::COLUMNS, R::PRIMARY_KEY)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    #[cfg(test)]
    pub fn key_index(&self) -> usize {
        self.columns
            .iter()
            .position(|c| c.name == self.primary_key)
            .unwrap_or(0)
    }

    pub fn create_sql(&self) -> String {
        let cols: Vec<String> = self
            .columns
            .iter()
            .map(|c| format!("{} {}", c.name, c.sql_type))
            .collect();
        format!(
            "CREATE TABLE IF NOT EXISTS {} ({}, PRIMARY KEY ({}))",
            self.name,
            cols.join(", "),
            self.primary_key
        )
    }

    /// The conflict clause names no target, so the insert also works on a
    /// pre-existing table created without the key constraint.
    pub fn insert_sql(&self) -> String {
        let names: Vec<&str> = self.columns.iter().map(|c| c.name).collect();
        let arrays: Vec<String> = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| format!("${}::{}", i + 1, c.array_type))
            .collect();
        format!(
            "INSERT INTO {} ({}) SELECT * FROM UNNEST({}) ON CONFLICT DO NOTHING",
            self.name,
            names.join(", "),
            arrays.join(", ")
        )
    }

    pub fn select_keys_sql(&self, limit: usize) -> String {
        format!(
            "SELECT {}::TEXT FROM {} LIMIT {}",
            self.primary_key, self.name, limit
        )
    }
}

// Table names are interpolated into SQL, so only plain (optionally
// schema-qualified) identifiers are accepted.
fn is_valid_table_name(name: &str) -> bool {
    let parts: Vec<&str> = name.split('.').collect();
    !name.is_empty()
        && parts.len() <= 2
        && parts.iter().all(|p| {
            !p.is_empty()
                && !p.starts_with(|c: char| c.is_ascii_digit())
                && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        })
}
