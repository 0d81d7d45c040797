//! Schema object models cached by the bundled dialects.
//!
//! These are plain serializable records. The caches hand them out as
//! `Arc`s; a composite object (an index) is only mutated while it is being
//! assembled, before it is published.

use crate::mapper::CacheObject;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Database table information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub schema: Option<String>,
    /// `table` or `view`
    pub kind: String,
    pub definition: Option<String>,
}

impl CacheObject for Table {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Table {
    /// Whether this entry is a view rather than a base table.
    pub fn is_view(&self) -> bool {
        self.kind.eq_ignore_ascii_case("view")
    }
}

/// Database column information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub table_name: String,
    pub data_type: String,
    pub is_nullable: bool,
    pub is_primary_key: bool,
    pub default_value: Option<String>,
    pub ordinal_position: u32,
}

impl CacheObject for Column {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Database index information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Index {
    pub name: String,
    pub table_name: String,
    pub schema: Option<String>,
    pub columns: Vec<IndexColumn>,
    pub is_unique: bool,
    pub is_primary: bool,
    /// How the index came to be (`c` created, `u` unique constraint,
    /// `pk` primary key)
    pub origin: Option<String>,
}

impl CacheObject for Index {
    fn name(&self) -> &str {
        &self.name
    }
}

impl Index {
    /// Names of the indexed columns in key order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// One member of an index, in key order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexColumn {
    pub name: String,
    pub ordinal_position: u32,
    pub sort_order: Option<SortOrder>,
    /// The table column this member refers to, when it could be resolved
    #[serde(skip)]
    pub column: Option<Arc<Column>>,
}

/// Sort order for index columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Database trigger information
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trigger {
    pub name: String,
    pub table_name: String,
    pub schema: Option<String>,
    pub event: TriggerEvent,
    pub timing: TriggerTiming,
    pub definition: Option<String>,
}

impl CacheObject for Trigger {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Trigger events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerEvent {
    Insert,
    Update,
    Delete,
}

/// Trigger timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TriggerTiming {
    Before,
    After,
    InsteadOf,
}

/// Everything a catalog knows about one schema, for reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaSnapshot {
    pub format_version: String,
    pub schema: String,
    pub tables: Vec<TableSnapshot>,
    pub indexes: Vec<Index>,
    pub triggers: Vec<Trigger>,
    pub warnings: Vec<String>,
}

/// A table with its columns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSnapshot {
    #[serde(flatten)]
    pub table: Table,
    pub columns: Vec<Column>,
}

impl SchemaSnapshot {
    /// Creates an empty snapshot
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            format_version: "1.0".to_string(),
            schema: schema.into(),
            tables: Vec::new(),
            indexes: Vec::new(),
            triggers: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Adds a warning
    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    /// Gets the total number of schema objects
    pub fn object_count(&self) -> usize {
        self.tables
            .len()
            .saturating_add(self.indexes.len())
            .saturating_add(self.triggers.len())
    }
}
