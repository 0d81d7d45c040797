//! SQLite catalog mappers and the catalog that wires them to the caches.
//!
//! Everything is read from `sqlite_master` and the table-valued pragma
//! functions (`pragma_table_info`, `pragma_index_list`,
//! `pragma_index_xinfo`), so every cache needs one query per owner:
//! - tables and views: `sqlite_master`
//! - columns: `sqlite_master` joined with `pragma_table_info`
//! - indexes: `sqlite_master` joined with `pragma_index_list` and
//!   `pragma_index_xinfo`, one row per key column
//! - triggers: `sqlite_master`

use crate::cache::{CacheGroup, CacheSummary, CompositeCache, ObjectCache, StructLookupCache};
use crate::config::CacheConfig;
use crate::entries::by_name;
use crate::error::{CacheError, Result};
use crate::mapper::{CompositeMapper, ObjectMapper, ParentEntry, RowMapper, StructMapper};
use crate::models::{
    Column, Index, IndexColumn, SchemaSnapshot, SortOrder, Table, TableSnapshot, Trigger,
    TriggerEvent, TriggerTiming,
};
use crate::session::{Query, QuerySession, Row};
use std::sync::Arc;

/// Owner of the SQLite caches: an attached database (`main`, `temp`, or an
/// `ATTACH`ed name).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SqliteSchema {
    name: String,
}

impl SqliteSchema {
    /// Creates an owner for an attached database.
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// The `main` database.
    pub fn main() -> Self {
        Self::new("main")
    }

    /// Database name as used in SQL.
    pub fn name(&self) -> &str {
        &self.name
    }

    fn master(&self) -> String {
        format!("{}.sqlite_master", quote_ident(&self.name))
    }
}

impl Default for SqliteSchema {
    fn default() -> Self {
        Self::main()
    }
}

impl std::fmt::Display for SqliteSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.name)
    }
}

/// Quotes an identifier for use in SQL text.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Parses trigger timing and event from a `CREATE TRIGGER` statement.
///
/// Only the trigger header (up to `ON <table>`) is inspected so that the
/// trigger body cannot influence the result.
pub fn parse_trigger_definition(sql: Option<&str>) -> (TriggerTiming, TriggerEvent) {
    let default_timing = TriggerTiming::Before;
    let default_event = TriggerEvent::Insert;

    let Some(sql) = sql else {
        return (default_timing, default_event);
    };
    let upper = sql.to_uppercase();
    let header = upper.split(" ON ").next().unwrap_or(&upper);

    // SQLite defaults to BEFORE when no timing is given
    let timing = if header.contains("INSTEAD OF") {
        TriggerTiming::InsteadOf
    } else if header.contains("AFTER") {
        TriggerTiming::After
    } else {
        default_timing
    };

    let event = if header.contains("DELETE") {
        TriggerEvent::Delete
    } else if header.contains("UPDATE") {
        TriggerEvent::Update
    } else if header.contains("INSERT") {
        TriggerEvent::Insert
    } else {
        default_event
    };

    (timing, event)
}

fn ordinal(row: &Row, column: &str) -> u32 {
    row.get_i64(column)
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or_default()
}

// =============================================================================
// Tables and columns
// =============================================================================

/// Tables and views, with their columns as children.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableMapper;

impl RowMapper for TableMapper {
    type Owner = SqliteSchema;
    type Object = Table;

    fn fetch_object(&self, owner: &SqliteSchema, row: &Row) -> Result<Option<Table>> {
        let name = row.require_str("name")?;
        Ok(Some(Table {
            name: name.to_string(),
            schema: Some(owner.name().to_string()),
            kind: row.get_string("type").unwrap_or_else(|| "table".to_string()),
            definition: row.get_string("sql"),
        }))
    }
}

impl StructMapper for TableMapper {
    type Child = Column;

    fn prepare_lookup_query(
        &self,
        owner: &SqliteSchema,
        object: Option<&Table>,
        name: Option<&str>,
    ) -> Result<Query> {
        let mut sql = format!(
            "SELECT name, type, sql FROM {} \
             WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%'",
            owner.master()
        );
        let name = object.map(|table| table.name.as_str()).or(name);
        if name.is_some() {
            sql.push_str(" AND name = ? COLLATE NOCASE");
        }
        sql.push_str(" ORDER BY name");

        let mut query = Query::new(sql);
        if let Some(name) = name {
            query = query.bind(name);
        }
        Ok(query)
    }

    fn prepare_children_query(&self, owner: &SqliteSchema, object: Option<&Table>) -> Result<Query> {
        let mut sql = format!(
            "SELECT m.name AS table_name, p.cid, p.name, p.type, \
                    p.\"notnull\" AS not_null, p.dflt_value, p.pk \
             FROM {} m JOIN pragma_table_info(m.name, ?) p \
             WHERE m.type IN ('table', 'view') AND m.name NOT LIKE 'sqlite_%'",
            owner.master()
        );
        if object.is_some() {
            sql.push_str(" AND m.name = ? COLLATE NOCASE");
        }
        sql.push_str(" ORDER BY m.name, p.cid");

        let mut query = Query::new(sql).bind(owner.name());
        if let Some(table) = object {
            query = query.bind(table.name.as_str());
        }
        Ok(query)
    }

    fn fetch_child(&self, _owner: &SqliteSchema, parent: &Table, row: &Row) -> Result<Option<Column>> {
        let name = row.require_str("name")?;
        let pk = row.get_i64("pk").unwrap_or_default();
        let not_null = row.get_bool("not_null").unwrap_or(false);

        Ok(Some(Column {
            name: name.to_string(),
            table_name: parent.name.clone(),
            data_type: row.get_string("type").unwrap_or_default(),
            // PRIMARY KEY columns are implicitly NOT NULL
            is_nullable: !not_null && pk == 0,
            is_primary_key: pk > 0,
            default_value: row.get_string("dflt_value"),
            ordinal_position: ordinal(row, "cid"),
        }))
    }

    fn child_parent_column(&self) -> &str {
        "table_name"
    }
}

// =============================================================================
// Indexes
// =============================================================================

/// Indexes, assembled from one row per key column.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexMapper;

impl CompositeMapper for IndexMapper {
    type Owner = SqliteSchema;
    type Parents = TableMapper;
    type Object = Index;
    type Member = IndexColumn;

    fn parent_column(&self) -> &str {
        "table_name"
    }

    fn object_column(&self) -> &str {
        "index_name"
    }

    fn prepare_objects_query(&self, owner: &SqliteSchema, parent: Option<&Table>) -> Result<Query> {
        let mut sql = format!(
            "SELECT m.name AS table_name, il.name AS index_name, \
                    il.\"unique\" AS is_unique, il.origin, \
                    ix.seqno, ix.name AS column_name, ix.\"desc\" AS is_desc \
             FROM {} m \
             JOIN pragma_index_list(m.name, ?) il \
             JOIN pragma_index_xinfo(il.name, ?) ix \
             WHERE m.type = 'table' AND m.name NOT LIKE 'sqlite_%' AND ix.key = 1",
            owner.master()
        );
        if parent.is_some() {
            sql.push_str(" AND m.name = ? COLLATE NOCASE");
        }
        sql.push_str(" ORDER BY m.name, il.name, ix.seqno");

        let mut query = Query::new(sql).bind(owner.name()).bind(owner.name());
        if let Some(table) = parent {
            query = query.bind(table.name.as_str());
        }
        Ok(query)
    }

    fn fetch_object(
        &self,
        owner: &SqliteSchema,
        parent: &ParentEntry<Table, Column>,
        name: &str,
        row: &Row,
    ) -> Result<Option<Index>> {
        let origin = row.get_string("origin");
        Ok(Some(Index {
            name: name.to_string(),
            table_name: parent.name().to_string(),
            schema: Some(owner.name().to_string()),
            columns: Vec::new(),
            is_unique: row.get_bool("is_unique").unwrap_or(false),
            is_primary: origin.as_deref() == Some("pk"),
            origin,
        }))
    }

    fn fetch_object_row(
        &self,
        _owner: &SqliteSchema,
        parent: &ParentEntry<Table, Column>,
        object: &Index,
        row: &Row,
    ) -> Result<Option<IndexColumn>> {
        let Some(name) = row.get_string("column_name") else {
            return Err(CacheError::unresolved_member(format!(
                "expression column in index '{}'",
                object.name
            )));
        };
        let Some(column) = parent.child(&name) else {
            return Err(CacheError::unresolved_member(format!(
                "column '{}' of index '{}' not found in table '{}'",
                name,
                object.name,
                parent.name()
            )));
        };

        let descending = row.get_bool("is_desc").unwrap_or(false);
        Ok(Some(IndexColumn {
            name: column.name.clone(),
            ordinal_position: ordinal(row, "seqno"),
            sort_order: Some(if descending {
                SortOrder::Descending
            } else {
                SortOrder::Ascending
            }),
            column: Some(Arc::clone(column)),
        }))
    }

    fn cache_children(&self, object: &mut Index, members: Vec<IndexColumn>) {
        object.columns = members;
    }
}

// =============================================================================
// Triggers
// =============================================================================

/// Triggers of every table.
#[derive(Debug, Clone, Copy, Default)]
pub struct TriggerMapper;

impl RowMapper for TriggerMapper {
    type Owner = SqliteSchema;
    type Object = Trigger;

    fn fetch_object(&self, owner: &SqliteSchema, row: &Row) -> Result<Option<Trigger>> {
        let name = row.require_str("name")?;
        let definition = row.get_string("sql");
        let (timing, event) = parse_trigger_definition(definition.as_deref());

        Ok(Some(Trigger {
            name: name.to_string(),
            table_name: row.get_string("tbl_name").unwrap_or_default(),
            schema: Some(owner.name().to_string()),
            event,
            timing,
            definition,
        }))
    }
}

impl ObjectMapper for TriggerMapper {
    fn prepare_objects_query(&self, owner: &SqliteSchema) -> Result<Query> {
        Ok(Query::new(format!(
            "SELECT name, tbl_name, sql FROM {} \
             WHERE type = 'trigger' AND name NOT LIKE 'sqlite_%' ORDER BY name",
            owner.master()
        )))
    }
}

// =============================================================================
// Catalog
// =============================================================================

/// The caches of one SQLite database, invalidated together.
///
/// Identifiers are matched case-insensitively, as SQLite does.
pub struct SqliteCatalog {
    schema: SqliteSchema,
    tables: Arc<StructLookupCache<TableMapper>>,
    indexes: Arc<CompositeCache<IndexMapper>>,
    triggers: Arc<ObjectCache<TriggerMapper>>,
    group: CacheGroup,
}

impl std::fmt::Debug for SqliteCatalog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCatalog")
            .field("schema", &self.schema)
            .field("caches", &self.group)
            .finish_non_exhaustive()
    }
}

impl SqliteCatalog {
    /// Creates a catalog with case-insensitive keys.
    pub fn new(schema: SqliteSchema) -> Self {
        Self::build(schema, CacheConfig::default().with_case_sensitive(false))
    }

    /// Creates a catalog with an explicit cache configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid
    pub fn with_config(schema: SqliteSchema, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(schema, config))
    }

    fn build(schema: SqliteSchema, config: CacheConfig) -> Self {
        let tables =
            Arc::new(StructLookupCache::build(TableMapper, config.clone()).with_order(by_name()));
        let indexes = Arc::new(CompositeCache::build(
            IndexMapper,
            Arc::clone(&tables),
            config.clone(),
        ));
        let triggers = Arc::new(ObjectCache::build(TriggerMapper, config));
        let group = CacheGroup::new()
            .with(tables.clone())
            .with(indexes.clone())
            .with(triggers.clone());

        Self {
            schema,
            tables,
            indexes,
            triggers,
            group,
        }
    }

    /// The database this catalog describes.
    pub fn schema(&self) -> &SqliteSchema {
        &self.schema
    }

    /// Tables and views, with columns.
    pub fn tables(&self) -> &Arc<StructLookupCache<TableMapper>> {
        &self.tables
    }

    /// Indexes of every table.
    pub fn indexes(&self) -> &Arc<CompositeCache<IndexMapper>> {
        &self.indexes
    }

    /// Triggers of every table.
    pub fn triggers(&self) -> &Arc<ObjectCache<TriggerMapper>> {
        &self.triggers
    }

    /// Looks up one table or view.
    ///
    /// # Errors
    /// Returns the query error of the lookup
    pub async fn table(&self, session: &dyn QuerySession, name: &str) -> Result<Option<Arc<Table>>> {
        self.tables.get_object(session, &self.schema, name).await
    }

    /// Columns of one table, or `None` if the table does not exist.
    ///
    /// # Errors
    /// Returns the query error of the lookup
    pub async fn columns(
        &self,
        session: &dyn QuerySession,
        table: &str,
    ) -> Result<Option<Vec<Arc<Column>>>> {
        let Some(table) = self.table(session, table).await? else {
            return Ok(None);
        };
        let columns = self.tables.get_children(session, &self.schema, &table).await?;
        Ok(Some(columns))
    }

    /// Indexes of one table, or `None` if the table does not exist.
    ///
    /// # Errors
    /// Returns the query error of the lookup
    pub async fn table_indexes(
        &self,
        session: &dyn QuerySession,
        table: &str,
    ) -> Result<Option<Vec<Arc<Index>>>> {
        let Some(table) = self.table(session, table).await? else {
            return Ok(None);
        };
        let indexes = self
            .indexes
            .get_objects_for(session, &self.schema, &table)
            .await?;
        Ok(Some(indexes))
    }

    /// Drops everything cached; the next access re-reads the catalog.
    pub fn refresh(&self) {
        tracing::debug!("Refreshing catalog of '{}'", self.schema);
        self.group.clear_all();
    }

    /// State and counters of every cache.
    pub fn summary(&self) -> Vec<CacheSummary> {
        self.group.summary()
    }

    /// Loads (or reads from cache) the complete catalog.
    ///
    /// # Errors
    /// Returns the first query error
    pub async fn snapshot(&self, session: &dyn QuerySession) -> Result<SchemaSnapshot> {
        let mut snapshot = SchemaSnapshot::new(self.schema.name());

        let tables = self.tables.get_objects(session, &self.schema).await?;
        self.tables.load_children(session, &self.schema).await?;
        for table in &tables {
            let columns = self
                .tables
                .get_children(session, &self.schema, table)
                .await?;
            snapshot.tables.push(TableSnapshot {
                table: Table::clone(table),
                columns: columns.iter().map(|c| Column::clone(c)).collect(),
            });
        }

        let indexes = self.indexes.get_objects(session, &self.schema).await?;
        snapshot.indexes = indexes.iter().map(|i| Index::clone(i)).collect();

        let triggers = self.triggers.get_objects(session, &self.schema).await?;
        snapshot.triggers = triggers.iter().map(|t| Trigger::clone(t)).collect();

        for cache in self.group.summary() {
            if cache.stats.rows_skipped > 0 {
                snapshot.add_warning(format!(
                    "{}: skipped {} unresolved rows",
                    cache.label, cache.stats.rows_skipped
                ));
            }
        }

        tracing::info!(
            "Catalog of '{}': {} tables, {} indexes, {} triggers",
            self.schema,
            snapshot.tables.len(),
            snapshot.indexes.len(),
            snapshot.triggers.len()
        );
        Ok(snapshot)
    }
}
