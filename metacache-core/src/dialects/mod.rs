//! Bundled dialects.
//!
//! A dialect is a set of mappers (query builders plus row mappers) wired to
//! the generic cache tiers, optionally with a session implementation.

pub mod sqlite;
