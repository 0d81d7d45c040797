//! Lookup cache: point lookups by name plus a child cache per object.
//!
//! The object side moves `Empty -> Partial -> Full`. Objects resolved by a
//! point lookup keep their `Arc` when a later bulk load promotes the cache,
//! so references handed out earlier stay valid and keep their children.
//!
//! Children are tracked separately. They are loaded either for one object
//! (one query per object) or for every object of the owner at once, in
//! which case rows are distributed to their parents by
//! [`StructMapper::child_parent_name`].

use super::object::ObjectStore;
use super::{MetadataCache, label_of, next_row, open_rows, resolve};
use crate::config::CacheConfig;
use crate::coordinator::{CacheCoordinator, CacheStats, LoadEntry, LoadState, LoadTicket};
use crate::entries::{KeyRules, ObjectEntries, ObjectOrder};
use crate::error::Result;
use crate::mapper::{CacheObject, ParentEntry, StructMapper};
use crate::session::QuerySession;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Children of every object, bucketed by parent key.
struct ChildStore<C> {
    coordinator: CacheCoordinator,
    rules: KeyRules,
    buckets: RwLock<HashMap<String, ObjectEntries<C>>>,
}

impl<C: CacheObject> ChildStore<C> {
    fn new(label: String, rules: KeyRules) -> Self {
        Self {
            coordinator: CacheCoordinator::new(label),
            rules,
            buckets: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, ObjectEntries<C>>> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, ObjectEntries<C>>> {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn bucket(&self, parent: &str) -> Option<ObjectEntries<C>> {
        self.read().get(&self.rules.key(parent)).cloned()
    }

    fn cached(&self, parent: &str) -> Option<Vec<Arc<C>>> {
        self.read()
            .get(&self.rules.key(parent))
            .map(ObjectEntries::to_vec)
    }

    fn put(&self, parent: &str, bucket: ObjectEntries<C>) {
        self.write().insert(self.rules.key(parent), bucket);
    }

    fn remove(&self, parent: &str) {
        let mut buckets = self.write();
        buckets.remove(&self.rules.key(parent));
        self.coordinator.supersede();
    }

    /// Installs a bulk load unless a clear or edit superseded it.
    fn publish(&self, ticket: &LoadTicket<'_>, loaded: HashMap<String, ObjectEntries<C>>) {
        let mut buckets = self.write();
        if ticket.is_current() {
            *buckets = loaded;
        }
    }

    fn retain_parents(&self, keep: impl Fn(&str) -> bool) {
        let mut buckets = self.write();
        buckets.retain(|key, _| keep(key));
        self.coordinator.supersede();
    }

    fn clear(&self) {
        let mut buckets = self.write();
        buckets.clear();
        self.coordinator.invalidate();
    }
}

/// Cache of structured objects (tables, views) with point lookups and a
/// per-object child cache (columns).
pub struct StructLookupCache<M: StructMapper> {
    mapper: M,
    store: ObjectStore<M::Object>,
    children: ChildStore<M::Child>,
}

impl<M: StructMapper> std::fmt::Debug for StructLookupCache<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructLookupCache")
            .field("label", &self.store.coordinator.label())
            .field("state", &self.store.coordinator.state())
            .field("cached", &self.store.len())
            .field("children", &self.children.coordinator.state())
            .finish_non_exhaustive()
    }
}

impl<M: StructMapper> StructLookupCache<M> {
    /// Creates a cache with the default configuration.
    pub fn new(mapper: M) -> Self {
        Self::build(mapper, CacheConfig::default())
    }

    /// Creates a cache with an explicit configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid
    pub fn with_config(mapper: M, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(mapper, config))
    }

    pub(crate) fn build(mapper: M, config: CacheConfig) -> Self {
        let label = label_of::<M>();
        let rules = config.key_rules();
        Self {
            mapper,
            children: ChildStore::new(format!("{label} children"), rules),
            store: ObjectStore::new(label, config),
        }
    }

    /// Builder method to iterate objects in comparator order.
    pub fn with_order(mut self, order: ObjectOrder<M::Object>) -> Self {
        self.store.set_order(order);
        self
    }

    /// The mapper this cache loads with.
    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Resolves one object by name.
    ///
    /// A `Full` cache answers from memory. Otherwise an uncached name is
    /// looked up with a single-object query; a hit is cached and the cache
    /// becomes `Partial`. A miss is not remembered.
    ///
    /// # Errors
    /// Returns the query error of the lookup
    pub async fn get_object(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        name: &str,
    ) -> Result<Option<Arc<M::Object>>> {
        if self.store.coordinator.is_full() {
            return Ok(self.store.cached_object(name));
        }
        if let Some(object) = self.store.cached_object(name) {
            return Ok(Some(object));
        }

        let guard = self.store.coordinator.lock().await;
        // Another caller may have resolved it while we waited
        if guard.coordinator().is_full() {
            return Ok(self.store.cached_object(name));
        }
        if let Some(object) = self.store.cached_object(name) {
            return Ok(Some(object));
        }

        let found = self.lookup(session, owner, None, name).await?;
        match found {
            Some(object) => {
                self.store.cache_object(Arc::clone(&object));
                guard.mark_partial();
                tracing::trace!("{} resolved '{}'", self.label(), name);
                Ok(Some(object))
            }
            None => {
                tracing::debug!("{}: '{}' not found", self.label(), name);
                Ok(None)
            }
        }
    }

    /// All objects of the owner, with a single bulk query. Objects already
    /// resolved by point lookups keep their identity (when configured).
    ///
    /// # Errors
    /// Returns the query error of the load; the state reverts.
    pub async fn get_objects(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
    ) -> Result<Vec<Arc<M::Object>>> {
        if self.store.coordinator.is_full() {
            return Ok(self.store.cached_objects());
        }
        let mapper = &self.mapper;
        let children = &self.children;
        let rules = self.store.config.key_rules();
        self.store
            .load_all(
                session,
                || mapper.prepare_lookup_query(owner, None, None),
                |row| mapper.fetch_object(owner, row),
                |published| {
                    // Children of objects that disappeared are stale
                    let live: std::collections::HashSet<String> =
                        published.iter().map(|o| rules.key(o.name())).collect();
                    children.retain_parents(|key| live.contains(key));
                },
            )
            .await
    }

    /// Re-reads one object from the database, replacing the cached one and
    /// dropping its children. Returns `None` (and uncaches the name) when
    /// the object no longer exists.
    ///
    /// # Errors
    /// Returns the query error of the lookup
    pub async fn refresh_object(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        name: &str,
    ) -> Result<Option<Arc<M::Object>>> {
        let guard = self.store.coordinator.lock().await;
        let current = self.store.cached_object(name);
        let found = self
            .lookup(session, owner, current.as_deref(), name)
            .await?;
        self.children.remove(name);
        match found {
            Some(object) => {
                self.store.cache_object(Arc::clone(&object));
                guard.mark_partial();
                Ok(Some(object))
            }
            None => {
                self.store.remove_object(name);
                Ok(None)
            }
        }
    }

    async fn lookup(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        object: Option<&M::Object>,
        name: &str,
    ) -> Result<Option<Arc<M::Object>>> {
        let query = self
            .mapper
            .prepare_lookup_query(owner, object, Some(name))?;
        let rules = self.store.config.key_rules();
        let found = self
            .store
            .fetch_objects(session, &query, |row| self.mapper.fetch_object(owner, row))
            .await?;
        Ok(found.into_iter().find(|o| rules.same(o.name(), name)))
    }

    /// Children of one object.
    ///
    /// For an object held by this cache, children are loaded for that object
    /// alone. Otherwise children of every object are bulk-loaded and the
    /// object's share is returned.
    ///
    /// # Errors
    /// Returns the query error of the children load
    pub async fn get_children(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        object: &Arc<M::Object>,
    ) -> Result<Vec<Arc<M::Child>>> {
        if let Some(children) = self.children.cached(object.name()) {
            return Ok(children);
        }
        if self.store.contains(object.name()) {
            return self.load_children_of(session, owner, object).await;
        }
        self.load_children(session, owner).await?;
        Ok(self.children.cached(object.name()).unwrap_or_default())
    }

    /// One child of an object by name.
    ///
    /// # Errors
    /// Returns the query error of the children load
    pub async fn get_child(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        object: &Arc<M::Object>,
        name: &str,
    ) -> Result<Option<Arc<M::Child>>> {
        let rules = self.store.config.key_rules();
        Ok(self
            .get_children(session, owner, object)
            .await?
            .into_iter()
            .find(|child| rules.same(child.name(), name)))
    }

    async fn load_children_of(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        object: &Arc<M::Object>,
    ) -> Result<Vec<Arc<M::Child>>> {
        let _guard = self.children.coordinator.lock().await;
        if let Some(children) = self.children.cached(object.name()) {
            return Ok(children);
        }

        let coordinator = &self.children.coordinator;
        let query = self.mapper.prepare_children_query(owner, Some(&**object))?;
        let mut rows = open_rows(coordinator, &self.store.config, session, &query).await?;
        let mut bucket = ObjectEntries::new(self.children.rules);
        while let Some(row) = next_row(&mut rows, session).await? {
            let child = resolve(
                coordinator,
                self.mapper.fetch_child(owner, object, &row),
                || format!("child row of '{}'", object.name()),
            )?;
            if let Some(child) = child {
                bucket.insert(Arc::new(child));
            }
        }

        let children = bucket.to_vec();
        self.children.put(object.name(), bucket);
        Ok(children)
    }

    /// Loads the children of every object of the owner with one query and
    /// distributes them by parent name. Rows naming an unknown parent are
    /// skipped. Every parent ends up with a (possibly empty) bucket.
    ///
    /// # Errors
    /// Returns the query error of the parent or children load
    pub async fn load_children(&self, session: &dyn QuerySession, owner: &M::Owner) -> Result<()> {
        if self.children.coordinator.is_full() {
            return Ok(());
        }
        // Parents first, outside of the children guard
        let parents = self.get_objects(session, owner).await?;

        let ticket = match self.children.coordinator.begin_load().await? {
            LoadEntry::Ready => return Ok(()),
            LoadEntry::Leader(ticket) => ticket,
        };
        match self.fetch_all_children(session, owner, &parents).await {
            Ok(buckets) => {
                self.children.publish(&ticket, buckets);
                ticket.complete(LoadState::Full);
                Ok(())
            }
            Err(error) => Err(ticket.fail(error)),
        }
    }

    async fn fetch_all_children(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        parents: &[Arc<M::Object>],
    ) -> Result<HashMap<String, ObjectEntries<M::Child>>> {
        let rules = self.children.rules;
        let coordinator = &self.children.coordinator;
        let by_name = ObjectEntries::from_objects(rules, parents.iter().cloned());
        let mut buckets: HashMap<String, ObjectEntries<M::Child>> = parents
            .iter()
            .map(|parent| (rules.key(parent.name()), ObjectEntries::new(rules)))
            .collect();

        let query = self.mapper.prepare_children_query(owner, None)?;
        let mut rows = open_rows(coordinator, &self.store.config, session, &query).await?;
        while let Some(row) = next_row(&mut rows, session).await? {
            let Some(parent_name) = self.mapper.child_parent_name(&row) else {
                coordinator.record_skipped();
                tracing::warn!(
                    "{}: skipping child row without '{}'",
                    coordinator.label(),
                    self.mapper.child_parent_column()
                );
                continue;
            };
            let Some(parent) = by_name.get(&parent_name) else {
                coordinator.record_skipped();
                tracing::warn!(
                    "{}: skipping child row of unknown parent '{}'",
                    coordinator.label(),
                    parent_name
                );
                continue;
            };
            let child = resolve(
                coordinator,
                self.mapper.fetch_child(owner, parent, &row),
                || format!("child row of '{parent_name}'"),
            )?;
            if let Some(child) = child {
                buckets
                    .entry(rules.key(parent.name()))
                    .or_insert_with(|| ObjectEntries::new(rules))
                    .insert(Arc::new(child));
            }
        }
        Ok(buckets)
    }

    /// Cached children of an object without querying.
    pub fn cached_children(&self, object: &M::Object) -> Option<Vec<Arc<M::Child>>> {
        self.children.cached(object.name())
    }

    /// Whether the children of an object are cached.
    pub fn is_children_cached(&self, object: &M::Object) -> bool {
        self.children
            .read()
            .contains_key(&self.children.rules.key(object.name()))
    }

    /// Whether children of every object were bulk-loaded.
    pub fn is_children_fully_cached(&self) -> bool {
        self.children.coordinator.is_full()
    }

    /// Drops every cached child, keeping the objects.
    pub fn clear_children(&self) {
        self.children.clear();
    }

    /// The object together with its cached children, as handed to composite
    /// mappers. The children are empty if they were never loaded.
    pub fn parent_entry(&self, object: &Arc<M::Object>) -> ParentEntry<M::Object, M::Child> {
        let children = self
            .children
            .bucket(object.name())
            .unwrap_or_else(|| ObjectEntries::new(self.children.rules));
        ParentEntry::new(Arc::clone(object), children)
    }

    /// Cached objects without querying.
    pub fn cached_objects(&self) -> Vec<Arc<M::Object>> {
        self.store.cached_objects()
    }

    /// A cached object without querying.
    pub fn cached_object(&self, name: &str) -> Option<Arc<M::Object>> {
        self.store.cached_object(name)
    }

    /// Adds or replaces one object. Its cached children are dropped.
    pub fn cache_object(&self, object: impl Into<Arc<M::Object>>) -> Option<Arc<M::Object>> {
        let object = object.into();
        self.children.remove(object.name());
        self.store.cache_object(object)
    }

    /// Removes one object and its children.
    pub fn remove_object(&self, name: &str) -> Option<Arc<M::Object>> {
        self.children.remove(name);
        self.store.remove_object(name)
    }

    /// Installs the complete contents and marks the cache `Full`. Cached
    /// children are dropped.
    pub fn set_cache(&self, objects: Vec<Arc<M::Object>>) {
        self.children.clear();
        self.store.set_cache(objects);
    }
}

impl<M: StructMapper> MetadataCache for StructLookupCache<M> {
    fn label(&self) -> &str {
        self.store.coordinator.label()
    }

    fn load_state(&self) -> LoadState {
        self.store.coordinator.state()
    }

    fn is_fully_cached(&self) -> bool {
        self.store.coordinator.is_full()
    }

    fn cached_len(&self) -> usize {
        self.store.len()
    }

    fn clear_cache(&self) {
        self.children.clear();
        self.store.clear();
    }

    fn stats(&self) -> CacheStats {
        let objects = self.store.coordinator.stats();
        let children = self.children.coordinator.stats();
        CacheStats {
            queries_issued: objects.queries_issued.saturating_add(children.queries_issued),
            rows_skipped: objects.rows_skipped.saturating_add(children.rows_skipped),
            loads_completed: objects.loads_completed.saturating_add(children.loads_completed),
            loads_failed: objects.loads_failed.saturating_add(children.loads_failed),
            loads_aborted: objects.loads_aborted.saturating_add(children.loads_aborted),
        }
    }
}
