//! SQLite query session backed by an sqlx pool.
//!
//! # Connection Modes
//! - File-based: `sqlite:///path/to/database.db` or `sqlite://./relative.db`
//! - In-memory: `sqlite::memory:` or `:memory:`
//!
//! In-memory databases live as long as their connection, so the pool is
//! capped at a single connection.

use crate::error::{CacheError, Result};
use crate::session::{CancellationFlag, Query, QuerySession, Row, RowStream};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::Value as JsonValue;
use sqlx::sqlite::{SqliteArguments, SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Column as _, Row as _, Sqlite, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;
use url::Url;

/// A [`QuerySession`] over a SQLite database.
pub struct SqliteSession {
    pool: SqlitePool,
    cancellation: CancellationFlag,
}

impl std::fmt::Debug for SqliteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSession")
            .field("cancelled", &self.cancellation.is_cancelled())
            // Note: connection options are intentionally omitted
            .finish_non_exhaustive()
    }
}

impl SqliteSession {
    /// Opens a database from a connection string.
    ///
    /// # Errors
    /// Returns error if:
    /// - Connection string format is invalid
    /// - Database cannot be opened
    pub async fn connect(connection_string: &str) -> Result<Self> {
        validate_sqlite_connection_string(connection_string)?;
        let normalized = normalize_connection_string(connection_string);

        let options = SqliteConnectOptions::from_str(&normalized).map_err(|e| {
            CacheError::configuration(format!("Invalid SQLite connection string: {}", e))
        })?;

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| CacheError::query_failed("Failed to open SQLite database", e))?;

        tracing::debug!("Opened SQLite session");
        Ok(Self::from_pool(pool))
    }

    /// Wraps an existing pool.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            cancellation: CancellationFlag::new(),
        }
    }

    /// The underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Handle to cancel loads running on this session.
    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    /// Closes the pool gracefully.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl QuerySession for SqliteSession {
    async fn execute<'a>(&'a self, query: &'a Query) -> Result<RowStream<'a>> {
        let mut statement = sqlx::query::<Sqlite>(&query.sql);
        for param in &query.params {
            statement = bind_value(statement, param);
        }

        let context = query.to_string();
        let mut columns: Option<Arc<[String]>> = None;
        let rows = statement.fetch(&self.pool).map(move |result| -> Result<Row> {
            let row = result.map_err(|e| CacheError::query_failed(context.clone(), e))?;
            let names = columns
                .get_or_insert_with(|| {
                    row.columns()
                        .iter()
                        .map(|column| column.name().to_string())
                        .collect()
                })
                .clone();
            Ok(convert_row(&row, names))
        });
        Ok(rows.boxed())
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

type Statement<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_value<'q>(statement: Statement<'q>, value: &JsonValue) -> Statement<'q> {
    match value {
        JsonValue::Null => statement.bind(None::<String>),
        JsonValue::Bool(b) => statement.bind(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => statement.bind(i),
            None => statement.bind(n.as_f64()),
        },
        JsonValue::String(s) => statement.bind(s.clone()),
        other => statement.bind(other.to_string()),
    }
}

fn convert_row(row: &SqliteRow, columns: Arc<[String]>) -> Row {
    let values = (0..columns.len())
        .map(|i| extract_column_value(row, i))
        .collect();
    Row::new(columns, values)
}

/// Extracts a column value as JSON.
fn extract_column_value(row: &SqliteRow, index: usize) -> JsonValue {
    // SQLite is dynamically typed, so we need to try multiple types
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(JsonValue::String).unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v
            .map(|n| JsonValue::Number(n.into()))
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(serde_json::Number::from_f64)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null);
    }
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(index) {
        // For BLOB data, convert to base64 string
        return v
            .map(|bytes| {
                use base64::Engine;
                let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
                JsonValue::String(format!("base64:{}", encoded))
            })
            .unwrap_or(JsonValue::Null);
    }

    JsonValue::Null
}

/// Validates SQLite connection string format.
///
/// # Errors
/// Returns error if connection string is invalid
pub fn validate_sqlite_connection_string(connection_string: &str) -> Result<()> {
    if connection_string == ":memory:" {
        return Ok(());
    }

    if connection_string.ends_with(".db")
        || connection_string.ends_with(".sqlite")
        || connection_string.ends_with(".sqlite3")
    {
        return Ok(());
    }

    if connection_string.starts_with("sqlite:") {
        if connection_string.contains(":memory:") || connection_string.contains("mode=memory") {
            return Ok(());
        }

        if let Ok(url) = Url::parse(connection_string) {
            if url.scheme() != "sqlite" {
                return Err(CacheError::configuration(
                    "Connection string must use sqlite:// scheme",
                ));
            }
            return Ok(());
        }

        if connection_string.starts_with("sqlite://") {
            return Ok(());
        }
    }

    Err(CacheError::configuration(
        "Invalid SQLite connection string format: expected sqlite:// URL, file path, or :memory:",
    ))
}

/// Normalizes connection string to SQLite URL format.
fn normalize_connection_string(connection_string: &str) -> String {
    if connection_string == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    if connection_string.starts_with("sqlite:") {
        return connection_string.to_string();
    }

    format!("sqlite://{}", connection_string)
}
