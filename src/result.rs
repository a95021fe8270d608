//! Parsed results of individual statements.

use std::sync::Arc;

use crate::conversion::FromText;
use crate::error::{Error, ErrorFields, Result};
use crate::protocol::backend::query::rows_affected;
use crate::protocol::types::Oid;

/// Outcome of a single statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultStatus {
    /// The statement completed without returning rows.
    CommandOk,
    /// The statement returned a (possibly empty) row set.
    TuplesOk,
    /// The query string contained no statement.
    EmptyQuery,
    /// The server rejected the statement.
    Error,
}

/// Column metadata from a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Data type OID
    pub type_oid: Oid,
    /// Table OID (0 if not a table column)
    pub table_oid: Oid,
}

/// A single row of text-format values.
#[derive(Debug, Clone)]
pub struct Row {
    columns: Arc<[Column]>,
    values: Vec<Option<Box<[u8]>>>,
}

impl Row {
    pub(crate) fn new(columns: &Arc<[Column]>, values: Vec<Option<Box<[u8]>>>) -> Self {
        Self {
            columns: Arc::clone(columns),
            values,
        }
    }

    /// Number of values in the row.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Check if the row has no values.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw text bytes of column `idx`, `None` for SQL NULL.
    pub fn get_raw(&self, idx: usize) -> Result<Option<&[u8]>> {
        self.values
            .get(idx)
            .map(|v| v.as_deref())
            .ok_or_else(|| Error::InvalidUsage(format!("column index {} out of range", idx)))
    }

    /// Decode column `idx`.
    pub fn get<'a, T: FromText<'a>>(&'a self, idx: usize) -> Result<T> {
        let oid = self.columns.get(idx).map_or(0, |c| c.type_oid);
        match self.get_raw(idx)? {
            None => T::from_null(),
            Some(bytes) => T::from_text(oid, bytes),
        }
    }

    /// Column metadata shared with the owning result.
    pub fn columns(&self) -> &[Column] {
        &self.columns
    }
}

#[derive(Debug)]
struct Inner {
    status: ResultStatus,
    columns: Arc<[Column]>,
    rows: Vec<Row>,
    command_tag: Option<String>,
    error: Option<ErrorFields>,
}

/// Result of one statement.
///
/// Cloning is cheap; the rows are shared. The failure isolator hands the
/// same failed result to every query of a rejected batch.
#[derive(Debug, Clone)]
pub struct QueryResult {
    inner: Arc<Inner>,
}

impl QueryResult {
    fn from_inner(inner: Inner) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A result for a statement that returned rows.
    ///
    /// Each row must hold one value per column.
    pub fn tuples(
        columns: Vec<Column>,
        rows: Vec<Vec<Option<Vec<u8>>>>,
        command_tag: impl Into<String>,
    ) -> Self {
        let columns: Arc<[Column]> = columns.into();
        let rows = rows
            .into_iter()
            .map(|values| {
                Row::new(
                    &columns,
                    values
                        .into_iter()
                        .map(|v| v.map(Vec::into_boxed_slice))
                        .collect(),
                )
            })
            .collect();
        Self::from_inner(Inner {
            status: ResultStatus::TuplesOk,
            columns,
            rows,
            command_tag: Some(command_tag.into()),
            error: None,
        })
    }

    /// A result for a statement that completed without rows.
    pub fn command(command_tag: impl Into<String>) -> Self {
        Self::from_inner(Inner {
            status: ResultStatus::CommandOk,
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
            command_tag: Some(command_tag.into()),
            error: None,
        })
    }

    /// The result of an empty query string.
    pub fn empty_query() -> Self {
        Self::from_inner(Inner {
            status: ResultStatus::EmptyQuery,
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
            command_tag: None,
            error: None,
        })
    }

    /// A failed result carrying the server's error fields.
    pub fn failed(fields: ErrorFields) -> Self {
        Self::from_inner(Inner {
            status: ResultStatus::Error,
            columns: Arc::from(Vec::new()),
            rows: Vec::new(),
            command_tag: None,
            error: Some(fields),
        })
    }

    pub(crate) fn with_rows(columns: Arc<[Column]>, rows: Vec<Row>, command_tag: String) -> Self {
        Self::from_inner(Inner {
            status: ResultStatus::TuplesOk,
            columns,
            rows,
            command_tag: Some(command_tag),
            error: None,
        })
    }

    pub fn status(&self) -> ResultStatus {
        self.inner.status
    }

    /// True unless the server rejected the statement.
    pub fn is_ok(&self) -> bool {
        self.inner.status != ResultStatus::Error
    }

    /// Turn a failed result into [`Error::Server`].
    pub fn check_status(&self) -> Result<()> {
        match &self.inner.error {
            Some(fields) => Err(Error::Server(fields.clone())),
            None => Ok(()),
        }
    }

    /// Error fields of a failed result.
    pub fn error(&self) -> Option<&ErrorFields> {
        self.inner.error.as_ref()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.inner.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.rows.is_empty()
    }

    pub fn rows(&self) -> &[Row] {
        &self.inner.rows
    }

    pub fn row(&self, idx: usize) -> Option<&Row> {
        self.inner.rows.get(idx)
    }

    pub fn columns(&self) -> &[Column] {
        &self.inner.columns
    }

    /// Command tag such as `INSERT 0 1`.
    pub fn command_tag(&self) -> Option<&str> {
        self.inner.command_tag.as_deref()
    }

    /// Rows affected according to the command tag.
    pub fn rows_affected(&self) -> Option<u64> {
        self.command_tag().and_then(rows_affected)
    }

    /// Decode the single field of a single-row, single-column result.
    pub fn one_field<'a, T: FromText<'a>>(&'a self) -> Result<T> {
        self.check_status()?;
        match self.rows() {
            [row] if row.len() == 1 => row.get(0),
            rows => Err(Error::Decode(format!(
                "expected one row with one field, got {} rows and {} columns",
                rows.len(),
                self.columns().len()
            ))),
        }
    }
}
