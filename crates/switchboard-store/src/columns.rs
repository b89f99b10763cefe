use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::FromSql;
use rusqlite::Row;

use crate::error::StoreError;

/// Fixed-width RFC 3339 with nanoseconds, so stored timestamps sort as text
/// and read back unchanged.
pub fn stamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Reads columns by name, turning any mismatch into [`StoreError::CorruptRow`]
/// tagged with the table and column it came from.
pub(crate) struct Columns<'a, 'stmt> {
    row: &'a Row<'stmt>,
    table: &'static str,
}

impl<'a, 'stmt> Columns<'a, 'stmt> {
    pub(crate) fn new(row: &'a Row<'stmt>, table: &'static str) -> Self {
        Self { row, table }
    }

    pub(crate) fn corrupt(&self, column: &'static str, detail: impl Display) -> StoreError {
        StoreError::CorruptRow {
            table: self.table,
            column,
            detail: detail.to_string(),
        }
    }

    /// Works for `Option<T>` too, for nullable columns.
    pub(crate) fn value<T: FromSql>(&self, column: &'static str) -> Result<T, StoreError> {
        self.row.get(column).map_err(|e| self.corrupt(column, e))
    }

    pub(crate) fn parsed<T>(&self, column: &'static str) -> Result<T, StoreError>
    where
        T: FromStr,
    {
        let raw: String = self.value(column)?;
        raw.parse()
            .map_err(|_| self.corrupt(column, format_args!("unrecognised value {raw:?}")))
    }

    pub(crate) fn timestamp(&self, column: &'static str) -> Result<DateTime<Utc>, StoreError> {
        let raw: String = self.value(column)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| self.corrupt(column, format_args!("bad timestamp {raw:?}: {e}")))
    }
}
