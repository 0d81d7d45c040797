//! Shared fixtures for the cache integration tests: a scripted in-memory
//! session and small mappers for each tier.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use metacache_core::{
    CacheError, CacheObject, CancellationFlag, CompositeMapper, ObjectMapper, ParentEntry, Query,
    QuerySession, Result, Row, RowMapper, RowStream, StructMapper,
};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Builds a row from `(column, value)` pairs.
pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::from_pairs(pairs.iter().cloned())
}

// =============================================================================
// Scripted session
// =============================================================================

#[derive(Clone)]
enum Response {
    Rows {
        rows: Vec<Row>,
        key_column: Option<String>,
    },
    Fail(String),
}

struct Script {
    pattern: String,
    response: Response,
}

/// A session answering queries from scripts matched by SQL substring.
///
/// The longest matching pattern wins, so `"FROM items WHERE"` can be
/// scripted separately from `"FROM items"`.
#[derive(Default)]
pub struct MockSession {
    scripts: Mutex<Vec<Script>>,
    log: Mutex<Vec<Query>>,
    delay: Option<Duration>,
    row_delay: Option<Duration>,
    cancel_after: Option<usize>,
    served: AtomicUsize,
    cancellation: CancellationFlag,
}

impl MockSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answers queries containing `pattern` with `rows`.
    pub fn on(self, pattern: &str, rows: Vec<Row>) -> Self {
        self.set(pattern, Response::Rows { rows, key_column: None });
        self
    }

    /// Answers parameterized queries containing `pattern` with the rows
    /// whose `key_column` equals the first parameter.
    pub fn on_lookup(self, pattern: &str, key_column: &str, rows: Vec<Row>) -> Self {
        self.set(
            pattern,
            Response::Rows {
                rows,
                key_column: Some(key_column.to_string()),
            },
        );
        self
    }

    /// Fails queries containing `pattern`.
    pub fn fail_on(self, pattern: &str, message: &str) -> Self {
        self.set(pattern, Response::Fail(message.to_string()));
        self
    }

    /// Delays every query before it returns rows.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Delays every row after the query has returned its stream.
    pub fn with_row_delay(mut self, delay: Duration) -> Self {
        self.row_delay = Some(delay);
        self
    }

    /// Requests cancellation once `rows` rows have been served.
    pub fn cancel_after_rows(mut self, rows: usize) -> Self {
        self.cancel_after = Some(rows);
        self
    }

    /// Replaces the rows of an existing (or new) script.
    pub fn set_rows(&self, pattern: &str, rows: Vec<Row>) {
        self.set(pattern, Response::Rows { rows, key_column: None });
    }

    /// Makes queries containing `pattern` fail from now on.
    pub fn set_failure(&self, pattern: &str, message: &str) {
        self.set(pattern, Response::Fail(message.to_string()));
    }

    fn set(&self, pattern: &str, response: Response) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts.retain(|s| s.pattern != pattern);
        scripts.push(Script {
            pattern: pattern.to_string(),
            response,
        });
    }

    pub fn cancellation(&self) -> CancellationFlag {
        self.cancellation.clone()
    }

    /// Every query executed so far.
    pub fn executed(&self) -> Vec<Query> {
        self.log.lock().unwrap().clone()
    }

    /// Number of executed queries whose SQL contains `pattern`.
    pub fn count(&self, pattern: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|q| q.sql.contains(pattern))
            .count()
    }

    fn response_for(&self, query: &Query) -> Option<Response> {
        self.scripts
            .lock()
            .unwrap()
            .iter()
            .filter(|s| query.sql.contains(&s.pattern))
            .max_by_key(|s| s.pattern.len())
            .map(|s| s.response.clone())
    }
}

#[async_trait]
impl QuerySession for MockSession {
    async fn execute<'a>(&'a self, query: &'a Query) -> Result<RowStream<'a>> {
        self.log.lock().unwrap().push(query.clone());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let rows = match self.response_for(query) {
            Some(Response::Rows { rows, key_column }) => match (key_column, query.params.first()) {
                (Some(column), Some(key)) => rows
                    .into_iter()
                    .filter(|r| r.get(&column) == Some(key))
                    .collect(),
                _ => rows,
            },
            Some(Response::Fail(message)) => {
                return Err(CacheError::query_failed(
                    query.to_string(),
                    std::io::Error::other(message),
                ));
            }
            None => {
                return Err(CacheError::query_failed(
                    query.to_string(),
                    std::io::Error::other("no script for query"),
                ));
            }
        };

        let row_delay = self.row_delay;
        let stream = futures::stream::iter(rows)
            .then(move |row| async move {
                if let Some(delay) = row_delay {
                    tokio::time::sleep(delay).await;
                }
                Ok::<Row, CacheError>(row)
            })
            .inspect(move |_| {
                let served = self.served.fetch_add(1, Ordering::SeqCst).saturating_add(1);
                if self.cancel_after.is_some_and(|limit| served >= limit) {
                    self.cancellation.cancel();
                }
            });
        Ok(stream.boxed())
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

// =============================================================================
// Flat tier fixtures
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Item {
    pub name: String,
    pub value: i64,
}

impl CacheObject for Item {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Items; rows flagged `hidden` map to nothing, rows flagged `broken`
/// fail to resolve.
#[derive(Debug, Default)]
pub struct ItemMapper;

impl RowMapper for ItemMapper {
    type Owner = String;
    type Object = Item;

    fn fetch_object(&self, _owner: &String, row: &Row) -> Result<Option<Item>> {
        if row.get_bool("hidden") == Some(true) {
            return Ok(None);
        }
        if row.get_bool("broken") == Some(true) {
            return Err(CacheError::unresolved_row("broken item"));
        }
        Ok(Some(Item {
            name: row.require_str("name")?.to_string(),
            value: row.get_i64("value").unwrap_or_default(),
        }))
    }
}

impl ObjectMapper for ItemMapper {
    fn prepare_objects_query(&self, owner: &String) -> Result<Query> {
        Ok(Query::new("SELECT name, value FROM items WHERE owner = ?").bind(owner.as_str()))
    }
}

pub fn item_row(name: &str, value: i64) -> Row {
    row(&[("name", json!(name)), ("value", json!(value))])
}

// =============================================================================
// Lookup tier fixtures
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub name: String,
    pub revision: i64,
}

impl CacheObject for Entity {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub name: String,
    pub entity: String,
}

impl CacheObject for Attr {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Entities with attributes as children.
///
/// SQL shapes:
/// - bulk: `FROM entities`; point: `FROM entities WHERE name = ?`
/// - all attributes: `FROM attrs`; one entity: `FROM attrs WHERE entity = ?`
#[derive(Debug, Default)]
pub struct EntityMapper;

impl RowMapper for EntityMapper {
    type Owner = String;
    type Object = Entity;

    fn fetch_object(&self, _owner: &String, row: &Row) -> Result<Option<Entity>> {
        Ok(Some(Entity {
            name: row.require_str("name")?.to_string(),
            revision: row.get_i64("revision").unwrap_or_default(),
        }))
    }
}

impl StructMapper for EntityMapper {
    type Child = Attr;

    fn prepare_lookup_query(
        &self,
        _owner: &String,
        object: Option<&Entity>,
        name: Option<&str>,
    ) -> Result<Query> {
        match object.map(|e| e.name.as_str()).or(name) {
            Some(name) => Ok(Query::new("SELECT name, revision FROM entities WHERE name = ?").bind(name)),
            None => Ok(Query::new("SELECT name, revision FROM entities")),
        }
    }

    fn prepare_children_query(&self, _owner: &String, object: Option<&Entity>) -> Result<Query> {
        match object {
            Some(entity) => Ok(
                Query::new("SELECT entity, name FROM attrs WHERE entity = ?").bind(entity.name.as_str())
            ),
            None => Ok(Query::new("SELECT entity, name FROM attrs")),
        }
    }

    fn fetch_child(&self, _owner: &String, parent: &Entity, row: &Row) -> Result<Option<Attr>> {
        Ok(Some(Attr {
            name: row.require_str("name")?.to_string(),
            entity: parent.name.clone(),
        }))
    }

    fn child_parent_column(&self) -> &str {
        "entity"
    }
}

pub fn entity_row(name: &str, revision: i64) -> Row {
    row(&[("name", json!(name)), ("revision", json!(revision))])
}

pub fn attr_row(entity: &str, name: &str) -> Row {
    row(&[("entity", json!(entity)), ("name", json!(name))])
}

// =============================================================================
// Composite tier fixtures
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub name: String,
    pub entity: String,
    pub parts: Vec<String>,
    pub finalized: usize,
}

impl CacheObject for Key {
    fn name(&self) -> &str {
        &self.name
    }
}

/// Keys over entity attributes, one row per key part.
///
/// Rows flagged `unresolvable` yield no key stub; parts naming an unknown
/// attribute are skipped.
#[derive(Debug, Default)]
pub struct KeyMapper {
    pub finalized: Arc<AtomicUsize>,
}

impl CompositeMapper for KeyMapper {
    type Owner = String;
    type Parents = EntityMapper;
    type Object = Key;
    type Member = String;

    fn parent_column(&self) -> &str {
        "entity"
    }

    fn object_column(&self) -> &str {
        "key_name"
    }

    fn prepare_objects_query(&self, _owner: &String, parent: Option<&Entity>) -> Result<Query> {
        match parent {
            Some(entity) => Ok(Query::new(
                "SELECT entity, key_name, attr FROM keys WHERE entity = ? ORDER BY key_name, seq",
            )
            .bind(entity.name.as_str())),
            None => Ok(Query::new(
                "SELECT entity, key_name, attr FROM keys ORDER BY key_name, seq",
            )),
        }
    }

    fn fetch_object(
        &self,
        _owner: &String,
        parent: &ParentEntry<Entity, Attr>,
        name: &str,
        row: &Row,
    ) -> Result<Option<Key>> {
        if row.get_bool("unresolvable") == Some(true) {
            return Ok(None);
        }
        Ok(Some(Key {
            name: name.to_string(),
            entity: parent.name().to_string(),
            parts: Vec::new(),
            finalized: 0,
        }))
    }

    fn fetch_object_row(
        &self,
        _owner: &String,
        parent: &ParentEntry<Entity, Attr>,
        object: &Key,
        row: &Row,
    ) -> Result<Option<String>> {
        let attr = row.require_str("attr")?;
        match parent.child(attr) {
            Some(attr) => Ok(Some(attr.name.clone())),
            None => Err(CacheError::unresolved_member(format!(
                "attribute '{}' of key '{}'",
                attr, object.name
            ))),
        }
    }

    fn cache_children(&self, object: &mut Key, members: Vec<String>) {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        object.finalized = object.finalized.saturating_add(1);
        object.parts = members;
    }
}

pub fn key_row(entity: &str, key: &str, attr: &str) -> Row {
    row(&[
        ("entity", json!(entity)),
        ("key_name", json!(key)),
        ("attr", json!(attr)),
    ])
}
