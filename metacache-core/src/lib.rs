//! Lazy, query-backed caches for database schema metadata.
//!
//! The caches sit between a relational catalog and in-memory schema
//! objects. Each cache belongs to one owner (a schema or database), loads
//! its objects on first use with as few queries as possible, and serves
//! every later request from memory until it is cleared.
//!
//! # Tiers
//! - [`ObjectCache`]: every object of an owner from one query
//! - [`StructLookupCache`]: point lookups by name that promote to a full
//!   load on the first list call, plus per-object children
//! - [`CompositeCache`]: objects spread over several rows, such as indexes
//!   with one row per indexed column
//!
//! Dialects plug in through the mapper traits in [`mapper`]: they build the
//! SQL and turn rows into objects. Everything else (single-flight loading,
//! state tracking, skip-and-warn handling of bad rows, cancellation) is
//! shared.
//!
//! # Concurrency
//! Caches are `Send + Sync` and meant to be shared through `Arc`. Concurrent
//! callers of a cache that is loading wait for that one load and share its
//! result or its error. A `Full` cache answers without taking any
//! coordinator lock.
//!
//! # Example
//! ```rust,no_run
//! use metacache_core::dialects::sqlite::{SqliteCatalog, SqliteSchema, SqliteSession};
//!
//! # async fn demo() -> metacache_core::Result<()> {
//! let session = SqliteSession::connect("sqlite://./app.db").await?;
//! let catalog = SqliteCatalog::new(SqliteSchema::main());
//!
//! if let Some(columns) = catalog.columns(&session, "users").await? {
//!     for column in columns {
//!         println!("{} {}", column.name, column.data_type);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod coordinator;
pub mod dialects;
pub mod entries;
pub mod error;
pub mod logging;
pub mod mapper;
pub mod models;
pub mod session;

// Re-export commonly used types
pub use cache::{CacheGroup, CacheSummary, CompositeCache, MetadataCache, ObjectCache, StructLookupCache};
pub use config::CacheConfig;
pub use coordinator::{CacheCoordinator, CacheStats, LoadEntry, LoadState, LoadTicket, LookupGuard};
pub use entries::{KeyRules, ObjectEntries, ObjectOrder, by_name};
pub use error::{CacheError, Result};
pub use mapper::{
    CacheObject, CompositeMapper, ObjectMapper, ParentChildOf, ParentEntry, ParentOf, RowMapper,
    StructMapper,
};
pub use session::{CancellationFlag, Query, QuerySession, Row, RowStream};
