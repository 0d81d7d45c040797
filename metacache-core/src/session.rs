//! Query sessions, queries and result rows.
//!
//! A [`QuerySession`] is the only way the caches talk to a database. It is
//! owned by the caller: the caches never open, pool or close connections.

use crate::error::{CacheError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A stream of result rows, in the order the database returned them.
pub type RowStream<'a> = BoxStream<'a, Result<Row>>;

/// A parameterized query produced by a query builder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// SQL text with positional `?` placeholders
    pub sql: String,
    /// Positional parameters
    pub params: Vec<Value>,
}

impl Query {
    /// Creates a query without parameters.
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Builder method to append a positional parameter.
    pub fn bind(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }
}

impl std::fmt::Display for Query {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Parameters may carry object names only; never connection details
        write!(f, "{}", self.sql.split_whitespace().collect::<Vec<_>>().join(" "))
    }
}

/// One result row: column names plus JSON-compatible values.
///
/// Column lookup is case-insensitive, matching how catalog views report
/// column labels across engines.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Arc<[String]>,
    values: Vec<Value>,
}

impl Row {
    /// Creates a row from shared column names and values.
    pub fn new(columns: Arc<[String]>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    /// Creates a row from `(column, value)` pairs.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let (columns, values): (Vec<String>, Vec<Value>) = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .unzip();
        Self {
            columns: columns.into(),
            values,
        }
    }

    /// Column names in result order.
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Raw value of a column, `None` if the column is absent.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(column))
            .and_then(|i| self.values.get(i))
    }

    /// String value of a column; `None` for absent, NULL or non-string values.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.get(column).and_then(Value::as_str)
    }

    /// String value of a column, rendering numbers and booleans as text.
    pub fn get_string(&self, column: &str) -> Option<String> {
        match self.get(column)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Integer value of a column, parsing numeric strings.
    pub fn get_i64(&self, column: &str) -> Option<i64> {
        match self.get(column)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    /// Boolean value of a column. Accepts `1`/`0`, `YES`/`NO`, `Y`/`N`
    /// and `true`/`false` as reported by different catalogs.
    pub fn get_bool(&self, column: &str) -> Option<bool> {
        match self.get(column)? {
            Value::Bool(b) => Some(*b),
            Value::Number(n) => n.as_i64().map(|v| v != 0),
            Value::String(s) => match s.trim().to_ascii_uppercase().as_str() {
                "YES" | "Y" | "TRUE" | "T" | "1" => Some(true),
                "NO" | "N" | "FALSE" | "F" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// String value of a column that must be present.
    ///
    /// # Errors
    /// Returns a non-fatal [`CacheError::RowResolution`] if the column is
    /// missing or NULL, so the row is skipped rather than failing the load.
    pub fn require_str(&self, column: &str) -> Result<&str> {
        self.get_str(column).ok_or_else(|| {
            CacheError::unresolved_row(format!("column '{}' is missing or NULL", column))
        })
    }
}

/// Executes queries against a relational source.
///
/// Implementations are assumed single-threaded per invocation; the caches
/// never run two queries on one session concurrently from the same load.
#[async_trait]
pub trait QuerySession: Send + Sync {
    /// Executes a query and returns its rows as a stream.
    ///
    /// # Errors
    /// Returns [`CacheError::QueryExecution`] if the query cannot be run.
    async fn execute<'a>(&'a self, query: &'a Query) -> Result<RowStream<'a>>;

    /// Polled once per row while a cache maps results; returning `true`
    /// aborts the load.
    fn is_cancelled(&self) -> bool {
        false
    }
}

/// A cloneable cancellation signal that sessions can expose through
/// [`QuerySession::is_cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation of whatever load is polling this flag.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Clears a previous cancellation request.
    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
