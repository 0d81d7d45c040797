//! Flat object cache: one query returns every object of an owner.

use super::{MetadataCache, label_of, next_row, open_rows, resolve};
use crate::config::CacheConfig;
use crate::coordinator::{CacheCoordinator, CacheStats, LoadEntry, LoadState};
use crate::entries::{ObjectEntries, ObjectOrder};
use crate::error::Result;
use crate::mapper::{CacheObject, ObjectMapper};
use crate::session::{Query, QuerySession, Row};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Entries of one cache plus the coordinator guarding their loads.
///
/// Shared by the flat and the lookup tier. Reads only take the entries lock
/// for as long as it takes to copy out `Arc`s.
pub(crate) struct ObjectStore<V> {
    pub(crate) coordinator: CacheCoordinator,
    pub(crate) config: CacheConfig,
    entries: RwLock<ObjectEntries<V>>,
    order: Option<ObjectOrder<V>>,
}

impl<V: CacheObject> ObjectStore<V> {
    pub(crate) fn new(label: String, config: CacheConfig) -> Self {
        let rules = config.key_rules();
        Self {
            coordinator: CacheCoordinator::new(label),
            config,
            entries: RwLock::new(ObjectEntries::new(rules)),
            order: None,
        }
    }

    pub(crate) fn set_order(&mut self, order: ObjectOrder<V>) {
        self.order = Some(order);
    }

    fn read(&self) -> RwLockReadGuard<'_, ObjectEntries<V>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ObjectEntries<V>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn len(&self) -> usize {
        self.read().len()
    }

    pub(crate) fn cached_objects(&self) -> Vec<Arc<V>> {
        self.read().to_vec()
    }

    pub(crate) fn cached_object(&self, name: &str) -> Option<Arc<V>> {
        self.read().get(name).cloned()
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.read().contains(name)
    }

    // Edits supersede a bulk load in flight while still holding the entries
    // lock, which is the lock a load publishes under
    pub(crate) fn cache_object(&self, object: Arc<V>) -> Option<Arc<V>> {
        let mut entries = self.write();
        let replaced = entries.insert(object);
        if let Some(order) = &self.order {
            entries.sort_by(order);
        }
        self.coordinator.supersede();
        replaced
    }

    pub(crate) fn remove_object(&self, name: &str) -> Option<Arc<V>> {
        let mut entries = self.write();
        let removed = entries.remove(name);
        self.coordinator.supersede();
        removed
    }

    /// Installs objects as the complete contents and marks the cache `Full`.
    pub(crate) fn set_cache(&self, objects: Vec<Arc<V>>) {
        let mut entries = self.write();
        self.install(&mut entries, objects, false);
        self.coordinator.set_state(LoadState::Full);
    }

    pub(crate) fn clear(&self) {
        let mut entries = self.write();
        entries.clear();
        self.coordinator.invalidate();
    }

    fn install(
        &self,
        entries: &mut ObjectEntries<V>,
        objects: Vec<Arc<V>>,
        preserve_identity: bool,
    ) {
        entries.replace_all(objects, preserve_identity);
        if let Some(order) = &self.order {
            entries.sort_by(order);
        }
    }

    /// Runs `query` and maps every row, applying the skip policy.
    pub(crate) async fn fetch_objects<F>(
        &self,
        session: &dyn QuerySession,
        query: &Query,
        mut map: F,
    ) -> Result<Vec<Arc<V>>>
    where
        F: FnMut(&Row) -> Result<Option<V>> + Send,
    {
        let mut rows = open_rows(&self.coordinator, &self.config, session, query).await?;
        let mut objects = Vec::new();
        while let Some(row) = next_row(&mut rows, session).await? {
            if let Some(object) = resolve(&self.coordinator, map(&row), || {
                format!("row {}", objects.len())
            })? {
                objects.push(Arc::new(object));
            }
        }
        Ok(objects)
    }

    /// Bulk load through the coordinator. `on_publish` runs under the load
    /// ticket right after the new contents are installed.
    ///
    /// A load superseded by a clear or edit returns the rows it fetched
    /// without installing them.
    pub(crate) async fn load_all<Q, F, P>(
        &self,
        session: &dyn QuerySession,
        build_query: Q,
        map: F,
        on_publish: P,
    ) -> Result<Vec<Arc<V>>>
    where
        Q: FnOnce() -> Result<Query> + Send,
        F: FnMut(&Row) -> Result<Option<V>> + Send,
        P: FnOnce(&[Arc<V>]) + Send,
    {
        let ticket = match self.coordinator.begin_load().await? {
            LoadEntry::Ready => return Ok(self.cached_objects()),
            LoadEntry::Leader(ticket) => ticket,
        };

        let fetched = match build_query() {
            Ok(query) => self.fetch_objects(session, &query, map).await,
            Err(error) => Err(error),
        };
        match fetched {
            Ok(objects) => {
                tracing::debug!("{} loaded {} objects", self.coordinator.label(), objects.len());
                let mut entries = self.write();
                if !ticket.is_current() {
                    drop(entries);
                    ticket.complete(LoadState::Full);
                    return Ok(objects);
                }
                self.install(&mut entries, objects, self.config.preserve_identity_on_reload);
                let published = entries.to_vec();
                drop(entries);
                on_publish(&published);
                ticket.complete(LoadState::Full);
                Ok(published)
            }
            Err(error) => Err(ticket.fail(error)),
        }
    }
}

/// Cache of every object of an owner, loaded by one query.
///
/// # Example
/// ```rust,no_run
/// # use metacache_core::{ObjectCache, ObjectMapper, QuerySession};
/// # async fn demo<M: ObjectMapper>(mapper: M, session: &dyn QuerySession, owner: &M::Owner) -> metacache_core::Result<()> {
/// let cache = ObjectCache::new(mapper);
/// let all = cache.get_objects(session, owner).await?;
/// // Served from memory from now on
/// let again = cache.get_objects(session, owner).await?;
/// assert_eq!(all.len(), again.len());
/// # Ok(())
/// # }
/// ```
pub struct ObjectCache<M: ObjectMapper> {
    mapper: M,
    store: ObjectStore<M::Object>,
}

impl<M: ObjectMapper> std::fmt::Debug for ObjectCache<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectCache")
            .field("label", &self.store.coordinator.label())
            .field("state", &self.store.coordinator.state())
            .field("cached", &self.store.len())
            .finish_non_exhaustive()
    }
}

impl<M: ObjectMapper> ObjectCache<M> {
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
        Self {
            mapper,
            store: ObjectStore::new(label_of::<M>(), config),
        }
    }

    /// Builder method to iterate objects in comparator order rather than
    /// query order.
    pub fn with_order(mut self, order: ObjectOrder<M::Object>) -> Self {
        self.store.set_order(order);
        self
    }

    /// The mapper this cache loads with.
    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// All objects of the owner. Issues the bulk query on first use, or
    /// joins a load another caller already started.
    ///
    /// # Errors
    /// Returns the query error of the load; the cache stays unloaded.
    pub async fn get_objects(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
    ) -> Result<Vec<Arc<M::Object>>> {
        if self.store.coordinator.is_full() {
            return Ok(self.store.cached_objects());
        }
        let mapper = &self.mapper;
        self.store
            .load_all(
                session,
                || mapper.prepare_objects_query(owner),
                |row| mapper.fetch_object(owner, row),
                |_| {},
            )
            .await
    }

    /// One object by name, loading the whole cache if needed.
    ///
    /// # Errors
    /// Returns the query error of the bulk load
    pub async fn get_object(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        name: &str,
    ) -> Result<Option<Arc<M::Object>>> {
        if !self.store.coordinator.is_full() {
            self.get_objects(session, owner).await?;
        }
        Ok(self.store.cached_object(name))
    }

    /// Objects matching a predicate, in iteration order.
    ///
    /// # Errors
    /// Returns the query error of the bulk load
    pub async fn objects_matching<F>(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        predicate: F,
    ) -> Result<Vec<Arc<M::Object>>>
    where
        F: Fn(&M::Object) -> bool,
    {
        let objects = self.get_objects(session, owner).await?;
        Ok(objects
            .into_iter()
            .filter(|object| predicate(object))
            .collect())
    }

    /// Cached objects without querying.
    pub fn cached_objects(&self) -> Vec<Arc<M::Object>> {
        self.store.cached_objects()
    }

    /// A cached object without querying.
    pub fn cached_object(&self, name: &str) -> Option<Arc<M::Object>> {
        self.store.cached_object(name)
    }

    /// Adds or replaces one object, e.g. after it was created.
    pub fn cache_object(&self, object: impl Into<Arc<M::Object>>) -> Option<Arc<M::Object>> {
        self.store.cache_object(object.into())
    }

    /// Removes one object, e.g. after it was dropped.
    pub fn remove_object(&self, name: &str) -> Option<Arc<M::Object>> {
        self.store.remove_object(name)
    }

    /// Installs the complete contents and marks the cache `Full`.
    pub fn set_cache(&self, objects: Vec<Arc<M::Object>>) {
        self.store.set_cache(objects);
    }
}

impl<M: ObjectMapper> MetadataCache for ObjectCache<M> {
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
        self.store.clear();
    }

    fn stats(&self) -> CacheStats {
        self.store.coordinator.stats()
    }
}
