//! Error types for cache loads.
//!
//! Errors are cheap to clone: a failed bulk load hands the same error to the
//! caller that ran the query and to every caller that was waiting on it.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Shared, cloneable error source.
pub type SharedSource = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for metadata cache operations.
///
/// Only query-level failures abort a load. Row and member resolution
/// failures are reported through `tracing` and the offending row is skipped.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backing query failed (connectivity, syntax, permission)
    #[error("Query execution failed: {context}")]
    QueryExecution {
        context: String,
        #[source]
        source: SharedSource,
    },

    /// The backing query did not finish in time
    #[error("Query timed out after {}ms", timeout.as_millis())]
    QueryTimeout { timeout: Duration },

    /// A single row could not be mapped to an object
    #[error("Row resolution failed: {context}")]
    RowResolution { context: String },

    /// A member row could not be attached to its composite object
    #[error("Child aggregation failed: {context}")]
    ChildAggregation { context: String },

    /// The load was cancelled before it completed
    #[error("Cache load cancelled")]
    Cancelled,

    /// Invalid cache configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },
}

/// Convenience type alias for Results with CacheError
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// Creates a query execution error from a driver error.
    pub fn query_failed<E>(context: impl Into<String>, error: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::QueryExecution {
            context: context.into(),
            source: Arc::new(error),
        }
    }

    /// Creates a non-fatal row resolution error.
    pub fn unresolved_row(context: impl Into<String>) -> Self {
        Self::RowResolution {
            context: context.into(),
        }
    }

    /// Creates a non-fatal member aggregation error.
    pub fn unresolved_member(context: impl Into<String>) -> Self {
        Self::ChildAggregation {
            context: context.into(),
        }
    }

    /// Creates a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Whether this error aborts the load it occurred in.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::RowResolution { .. } | Self::ChildAggregation { .. }
        )
    }

    /// Whether this error came from cancellation rather than a failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
