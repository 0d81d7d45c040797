//! SQLite dialect: catalog mappers and an sqlx-backed session.
//!
//! # Module Structure
//! - `catalog`: mappers for tables, columns, indexes and triggers, and the
//!   [`SqliteCatalog`] bundling their caches
//! - `connection`: [`SqliteSession`] over an sqlx pool (feature `sqlite`)
//!
//! # SQLite-Specific Features
//! - Uses `sqlite_master` for object enumeration
//! - Uses table-valued PRAGMA functions so columns and indexes of every
//!   table come back from a single query
//! - All statements are read-only (SELECT only)

pub mod catalog;
#[cfg(feature = "sqlite")]
pub mod connection;

pub use catalog::{
    IndexMapper, SqliteCatalog, SqliteSchema, TableMapper, TriggerMapper,
    parse_trigger_definition, quote_ident,
};
#[cfg(feature = "sqlite")]
pub use connection::SqliteSession;
