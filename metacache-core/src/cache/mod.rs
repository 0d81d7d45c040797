//! The three cache tiers and what they share.
//!
//! - [`ObjectCache`]: one bulk query per owner, cached wholesale.
//! - [`StructLookupCache`]: adds point lookups by name and a per-object
//!   child cache with a bulk (all parents at once) path.
//! - [`CompositeCache`]: rebuilds objects spread over several rows (one per
//!   member) and finalizes each object once all of its rows are known.
//!
//! All tiers implement [`MetadataCache`], so an owner can invalidate every
//! cache it holds through a [`CacheGroup`].

pub mod composite;
pub mod object;
pub mod structured;

pub use composite::CompositeCache;
pub use object::ObjectCache;
pub use structured::StructLookupCache;

use crate::config::CacheConfig;
use crate::coordinator::{CacheCoordinator, CacheStats, LoadState};
use crate::error::{CacheError, Result};
use crate::session::{Query, QuerySession, Row, RowStream};
use futures::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Operations every cache tier supports regardless of its object types.
pub trait MetadataCache: Send + Sync {
    /// Short name used in logs and statistics.
    fn label(&self) -> &str;

    /// Current load state.
    fn load_state(&self) -> LoadState;

    /// Whether every object of the owner is cached.
    fn is_fully_cached(&self) -> bool;

    /// Number of cached objects.
    fn cached_len(&self) -> usize;

    /// Drops every cached object and returns to `Empty`.
    fn clear_cache(&self);

    /// Work counters.
    fn stats(&self) -> CacheStats;
}

/// Summary of one cache, as reported by [`CacheGroup::summary`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CacheSummary {
    /// Cache label
    pub label: String,
    /// Load state
    pub state: LoadState,
    /// Number of cached objects
    pub cached: usize,
    /// Work counters
    pub stats: CacheStats,
}

/// The caches held by one owner, invalidated together on refresh.
#[derive(Default, Clone)]
pub struct CacheGroup {
    caches: Vec<Arc<dyn MetadataCache>>,
}

impl std::fmt::Debug for CacheGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.caches.iter().map(|c| c.label().to_string()))
            .finish()
    }
}

impl CacheGroup {
    /// Creates an empty group.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a cache to the group.
    pub fn register(&mut self, cache: Arc<dyn MetadataCache>) {
        self.caches.push(cache);
    }

    /// Builder form of [`register`](Self::register).
    pub fn with(mut self, cache: Arc<dyn MetadataCache>) -> Self {
        self.register(cache);
        self
    }

    /// Number of registered caches.
    pub fn len(&self) -> usize {
        self.caches.len()
    }

    /// Whether no cache is registered.
    pub fn is_empty(&self) -> bool {
        self.caches.is_empty()
    }

    /// Clears every cache in the group.
    pub fn clear_all(&self) {
        for cache in &self.caches {
            cache.clear_cache();
        }
        tracing::debug!("Cleared {} caches", self.caches.len());
    }

    /// State and counters of every cache, in registration order.
    pub fn summary(&self) -> Vec<CacheSummary> {
        self.caches
            .iter()
            .map(|cache| CacheSummary {
                label: cache.label().to_string(),
                state: cache.load_state(),
                cached: cache.cached_len(),
                stats: cache.stats(),
            })
            .collect()
    }
}

/// Short label for a mapper type: its name without the module path.
pub(crate) fn label_of<M>() -> String {
    let full = std::any::type_name::<M>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base).to_string()
}

/// Rows of one running query. The query deadline, when configured, covers
/// execution and every row read.
pub(crate) struct LoadRows<'a> {
    stream: RowStream<'a>,
    deadline: Option<(Instant, Duration)>,
}

/// Runs a query, counting it and starting the configured timeout.
pub(crate) async fn open_rows<'a>(
    coordinator: &CacheCoordinator,
    config: &CacheConfig,
    session: &'a dyn QuerySession,
    query: &'a Query,
) -> Result<LoadRows<'a>> {
    coordinator.record_query();
    tracing::trace!("{} executing: {}", coordinator.label(), query);
    let deadline = config
        .query_timeout
        .and_then(|timeout| Instant::now().checked_add(timeout).map(|at| (at, timeout)));
    let execution = session.execute(query);
    let stream = match deadline {
        Some((at, timeout)) => tokio::time::timeout_at(at, execution)
            .await
            .map_err(|_| CacheError::QueryTimeout { timeout })??,
        None => execution.await?,
    };
    Ok(LoadRows { stream, deadline })
}

/// Next row of a load, honouring cancellation and the query deadline.
pub(crate) async fn next_row(
    rows: &mut LoadRows<'_>,
    session: &dyn QuerySession,
) -> Result<Option<Row>> {
    if session.is_cancelled() {
        return Err(CacheError::Cancelled);
    }
    let next = rows.stream.next();
    let row = match rows.deadline {
        Some((at, timeout)) => tokio::time::timeout_at(at, next)
            .await
            .map_err(|_| CacheError::QueryTimeout { timeout })?,
        None => next.await,
    };
    row.transpose()
}

/// Applies the skip policy to a mapper result: unresolved rows and
/// non-fatal errors are logged and skipped, fatal errors abort the load.
pub(crate) fn resolve<T>(
    coordinator: &CacheCoordinator,
    outcome: Result<Option<T>>,
    what: impl FnOnce() -> String,
) -> Result<Option<T>> {
    match outcome {
        Ok(Some(value)) => Ok(Some(value)),
        Ok(None) => {
            coordinator.record_skipped();
            tracing::warn!("{}: skipping unresolved {}", coordinator.label(), what());
            Ok(None)
        }
        Err(error) if !error.is_fatal() => {
            coordinator.record_skipped();
            tracing::warn!("{}: skipping {}: {}", coordinator.label(), what(), error);
            Ok(None)
        }
        Err(error) => Err(error),
    }
}
