//! Pluggable per-dialect contracts.
//!
//! Every dialect-specific cache differs from the others only in the SQL it
//! issues and in how it turns rows into objects. Those two concerns live in
//! the traits below; the caching, locking and ordering logic lives once per
//! tier in [`crate::cache`].
//!
//! Mapping is synchronous and must not call back into other caches: any
//! cross-cache reference a mapper needs is resolved by the cache before the
//! load starts and handed to the mapper (see [`ParentEntry`]).

use crate::entries::ObjectEntries;
use crate::error::Result;
use crate::session::{Query, Row};
use std::sync::Arc;

/// An object that can be cached, identified by its name.
pub trait CacheObject: Send + Sync + 'static {
    /// Identity of the object within its owner.
    fn name(&self) -> &str;
}

/// Maps result rows to cached objects.
///
/// Returning `Ok(None)` or a non-fatal error (see
/// [`CacheError::is_fatal`](crate::CacheError::is_fatal)) skips the row with
/// a warning; a fatal error aborts the load.
pub trait RowMapper: Send + Sync + 'static {
    /// Scoping parent of the cached objects (e.g. a schema)
    type Owner: Send + Sync + 'static;
    /// Cached object type
    type Object: CacheObject;

    /// Builds one object from one row.
    fn fetch_object(&self, owner: &Self::Owner, row: &Row) -> Result<Option<Self::Object>>;
}

/// Query builder for the flat [`ObjectCache`](crate::ObjectCache) tier.
pub trait ObjectMapper: RowMapper {
    /// Query returning every object of the owner.
    fn prepare_objects_query(&self, owner: &Self::Owner) -> Result<Query>;
}

/// Query builders and mappers for the
/// [`StructLookupCache`](crate::StructLookupCache) tier.
pub trait StructMapper: RowMapper {
    /// Child object type (e.g. a table column)
    type Child: CacheObject;

    /// Query for one object (when `object` or `name` is given) or for every
    /// object of the owner (when both are `None`).
    fn prepare_lookup_query(
        &self,
        owner: &Self::Owner,
        object: Option<&Self::Object>,
        name: Option<&str>,
    ) -> Result<Query>;

    /// Query for the children of one object, or of every object of the
    /// owner when `object` is `None`.
    fn prepare_children_query(
        &self,
        owner: &Self::Owner,
        object: Option<&Self::Object>,
    ) -> Result<Query>;

    /// Builds one child of `parent` from one row.
    fn fetch_child(
        &self,
        owner: &Self::Owner,
        parent: &Self::Object,
        row: &Row,
    ) -> Result<Option<Self::Child>>;

    /// Column of a children row naming its parent object.
    fn child_parent_column(&self) -> &str;

    /// Parent name of a children row; used to distribute bulk results.
    fn child_parent_name(&self, row: &Row) -> Option<String> {
        row.get_string(self.child_parent_column())
    }
}

/// Parent object type of a composite mapper.
pub type ParentOf<M> = <<M as CompositeMapper>::Parents as RowMapper>::Object;

/// Child type of a composite mapper's parents.
pub type ParentChildOf<M> = <<M as CompositeMapper>::Parents as StructMapper>::Child;

/// Query builder and mappers for the
/// [`CompositeCache`](crate::CompositeCache) tier.
///
/// A composite object (an index, a multi-column key) is spread over several
/// rows sharing `(parent, name)`, one row per member.
pub trait CompositeMapper: Send + Sync + 'static {
    /// Scoping parent of the cached objects
    type Owner: Send + Sync + 'static;
    /// Mapper of the cache parents are resolved from
    type Parents: StructMapper<Owner = Self::Owner>;
    /// Composite object type
    type Object: CacheObject;
    /// Member row type
    type Member: Send + Sync + 'static;

    /// Column naming the parent of a row.
    fn parent_column(&self) -> &str;

    /// Column naming the composite object of a row.
    fn object_column(&self) -> &str;

    /// Whether member mapping needs the parents' children (e.g. an index
    /// column resolving its table column). When `true` the cache bulk-loads
    /// parent children before its own load.
    fn needs_parent_children(&self) -> bool {
        true
    }

    /// Query for every object of the owner (or of one parent), ordered by
    /// object name then member sequence.
    fn prepare_objects_query(
        &self,
        owner: &Self::Owner,
        parent: Option<&ParentOf<Self>>,
    ) -> Result<Query>;

    /// Builds the object stub on the first row of a `(parent, name)` pair.
    fn fetch_object(
        &self,
        owner: &Self::Owner,
        parent: &ParentEntry<ParentOf<Self>, ParentChildOf<Self>>,
        name: &str,
        row: &Row,
    ) -> Result<Option<Self::Object>>;

    /// Builds zero or one member from a row of `object`.
    fn fetch_object_row(
        &self,
        owner: &Self::Owner,
        parent: &ParentEntry<ParentOf<Self>, ParentChildOf<Self>>,
        object: &Self::Object,
        row: &Row,
    ) -> Result<Option<Self::Member>>;

    /// Finalizes an object with all of its members, in arrival order.
    /// Called exactly once per object, before the object is published.
    fn cache_children(&self, object: &mut Self::Object, members: Vec<Self::Member>);
}

/// A resolved parent handed to composite mappers: the parent object plus
/// its already loaded children.
pub struct ParentEntry<P, C> {
    object: Arc<P>,
    children: ObjectEntries<C>,
}

impl<P: CacheObject, C: CacheObject> ParentEntry<P, C> {
    /// Creates a parent entry.
    pub fn new(object: Arc<P>, children: ObjectEntries<C>) -> Self {
        Self { object, children }
    }

    /// The parent object.
    pub fn object(&self) -> &Arc<P> {
        &self.object
    }

    /// Name of the parent object.
    pub fn name(&self) -> &str {
        self.object.name()
    }

    /// Children of the parent, in iteration order.
    pub fn children(&self) -> &[Arc<C>] {
        self.children.values()
    }

    /// Looks up a child of the parent by name.
    pub fn child(&self, name: &str) -> Option<&Arc<C>> {
        self.children.get(name)
    }
}

impl<P, C> std::fmt::Debug for ParentEntry<P, C>
where
    P: CacheObject,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParentEntry")
            .field("name", &self.object.name())
            .field("children", &self.children)
            .finish()
    }
}
