//! Composite cache: objects assembled from several rows.
//!
//! An index or a multi-column key arrives as one row per member, all sharing
//! the same `(parent, name)` pair. The load groups rows by that pair in
//! arrival order, builds the object stub on the first row of each pair,
//! collects members from every row, and finalizes each object exactly once
//! with [`CompositeMapper::cache_children`] after the result is consumed.
//! Objects are published only after every object is finalized.

use super::structured::StructLookupCache;
use super::{MetadataCache, label_of, next_row, open_rows, resolve};
use crate::config::CacheConfig;
use crate::coordinator::{CacheCoordinator, CacheStats, LoadEntry, LoadState, LoadTicket};
use crate::entries::{KeyRules, ObjectEntries, ObjectOrder};
use crate::error::Result;
use crate::mapper::{CacheObject, CompositeMapper, ParentChildOf, ParentEntry, ParentOf};
use crate::session::QuerySession;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

type Parent<M> = ParentEntry<ParentOf<M>, ParentChildOf<M>>;

/// An object being assembled during a load.
struct Group<O, R> {
    parent_key: String,
    object: O,
    members: Vec<R>,
}

/// Published objects, overall and per parent.
struct CompositeEntries<V> {
    rules: KeyRules,
    /// Every cached object with its parent key, in iteration order
    all: Vec<(String, Arc<V>)>,
    /// Parents whose objects are cached, possibly with no objects
    by_parent: HashMap<String, ObjectEntries<V>>,
}

impl<V: CacheObject> CompositeEntries<V> {
    fn new(rules: KeyRules) -> Self {
        Self {
            rules,
            all: Vec::new(),
            by_parent: HashMap::new(),
        }
    }

    fn objects(&self) -> Vec<Arc<V>> {
        self.all.iter().map(|(_, object)| Arc::clone(object)).collect()
    }

    fn install_parent(&mut self, parent_key: String, objects: Vec<Arc<V>>) {
        self.all.retain(|(key, _)| *key != parent_key);
        self.all.extend(
            objects
                .iter()
                .map(|object| (parent_key.clone(), Arc::clone(object))),
        );
        self.by_parent.insert(
            parent_key,
            ObjectEntries::from_objects(self.rules, objects),
        );
    }

    fn remove_parent(&mut self, parent_key: &str) {
        self.all.retain(|(key, _)| key != parent_key);
        self.by_parent.remove(parent_key);
    }

    fn sort(&mut self, order: &ObjectOrder<V>) {
        self.all.sort_by(|(_, a), (_, b)| order(a, b));
        for bucket in self.by_parent.values_mut() {
            bucket.sort_by(order);
        }
    }
}

/// Cache of composite objects (indexes, keys) of the parents held by a
/// [`StructLookupCache`].
///
/// Parents, and their children when the mapper needs them, are resolved
/// from the parent cache before this cache starts its own load.
pub struct CompositeCache<M: CompositeMapper> {
    mapper: M,
    parents: Arc<StructLookupCache<M::Parents>>,
    coordinator: CacheCoordinator,
    config: CacheConfig,
    order: Option<ObjectOrder<M::Object>>,
    entries: RwLock<CompositeEntries<M::Object>>,
}

impl<M: CompositeMapper> std::fmt::Debug for CompositeCache<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeCache")
            .field("label", &self.coordinator.label())
            .field("state", &self.coordinator.state())
            .field("cached", &self.read().all.len())
            .finish_non_exhaustive()
    }
}

impl<M: CompositeMapper> CompositeCache<M> {
    /// Creates a cache over a parent cache with the default configuration.
    pub fn new(mapper: M, parents: Arc<StructLookupCache<M::Parents>>) -> Self {
        Self::build(mapper, parents, CacheConfig::default())
    }

    /// Creates a cache with an explicit configuration.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid
    pub fn with_config(
        mapper: M,
        parents: Arc<StructLookupCache<M::Parents>>,
        config: CacheConfig,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self::build(mapper, parents, config))
    }

    pub(crate) fn build(mapper: M, parents: Arc<StructLookupCache<M::Parents>>, config: CacheConfig) -> Self {
        let rules = config.key_rules();
        Self {
            mapper,
            parents,
            coordinator: CacheCoordinator::new(label_of::<M>()),
            config,
            order: None,
            entries: RwLock::new(CompositeEntries::new(rules)),
        }
    }

    /// Builder method to iterate objects in comparator order.
    pub fn with_order(mut self, order: ObjectOrder<M::Object>) -> Self {
        self.order = Some(order);
        self
    }

    /// The mapper this cache loads with.
    pub fn mapper(&self) -> &M {
        &self.mapper
    }

    /// The cache parents are resolved from.
    pub fn parents(&self) -> &Arc<StructLookupCache<M::Parents>> {
        &self.parents
    }

    fn read(&self) -> RwLockReadGuard<'_, CompositeEntries<M::Object>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, CompositeEntries<M::Object>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn rules(&self) -> KeyRules {
        self.config.key_rules()
    }

    /// Every composite object of the owner, loaded with one query.
    ///
    /// # Errors
    /// Returns the query error of the parent or composite load; this cache
    /// stays unloaded.
    pub async fn get_objects(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
    ) -> Result<Vec<Arc<M::Object>>> {
        if self.coordinator.is_full() {
            return Ok(self.cached_objects());
        }

        // Cross-cache loads happen before this cache's guard is taken
        let parents = self.resolve_parents(session, owner).await?;

        let ticket = match self.coordinator.begin_load().await? {
            LoadEntry::Ready => return Ok(self.cached_objects()),
            LoadEntry::Leader(ticket) => ticket,
        };
        match self.load_groups(session, owner, None, &parents).await {
            Ok(groups) => {
                let objects = self.finalize(groups);
                tracing::debug!("{} loaded {} objects", self.coordinator.label(), objects.len());
                let fresh = self.assemble(&parents, objects);
                let loaded = fresh.objects();
                self.publish(&ticket, fresh);
                ticket.complete(LoadState::Full);
                Ok(loaded)
            }
            Err(error) => Err(ticket.fail(error)),
        }
    }

    /// Composite objects of one parent. Loads only that parent's objects
    /// unless the whole cache is already loaded.
    ///
    /// Per-parent results are tracked on their own and never change the
    /// load state: only a full load makes this cache `Full`.
    ///
    /// # Errors
    /// Returns the query error of the load
    pub async fn get_objects_for(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        parent: &Arc<ParentOf<M>>,
    ) -> Result<Vec<Arc<M::Object>>> {
        if let Some(objects) = self.cached_objects_for(parent.name()) {
            return Ok(objects);
        }
        if self.mapper.needs_parent_children() {
            self.parents.get_children(session, owner, parent).await?;
        }
        let entry = self.parents.parent_entry(parent);

        let _guard = self.coordinator.lock().await;
        if let Some(objects) = self.cached_objects_for(parent.name()) {
            return Ok(objects);
        }
        let groups = self
            .load_groups(session, owner, Some(parent), std::slice::from_ref(&entry))
            .await?;
        let objects = self.finalize(groups);
        let parent_key = self.rules().key(parent.name());
        {
            let mut entries = self.write();
            entries.install_parent(parent_key, objects.into_iter().map(|(_, o)| o).collect());
            if let Some(order) = &self.order {
                entries.sort(order);
            }
        }
        Ok(self.cached_objects_for(parent.name()).unwrap_or_default())
    }

    /// One composite object of a parent by name.
    ///
    /// # Errors
    /// Returns the query error of the load
    pub async fn get_object(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        parent: &Arc<ParentOf<M>>,
        name: &str,
    ) -> Result<Option<Arc<M::Object>>> {
        let rules = self.rules();
        Ok(self
            .get_objects_for(session, owner, parent)
            .await?
            .into_iter()
            .find(|object| rules.same(object.name(), name)))
    }

    async fn resolve_parents(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
    ) -> Result<Vec<Parent<M>>> {
        let parents = self.parents.get_objects(session, owner).await?;
        if self.mapper.needs_parent_children() {
            self.parents.load_children(session, owner).await?;
        }
        Ok(parents
            .iter()
            .map(|parent| self.parents.parent_entry(parent))
            .collect())
    }

    /// Runs the objects query and groups rows by `(parent, name)`.
    async fn load_groups(
        &self,
        session: &dyn QuerySession,
        owner: &M::Owner,
        scope: Option<&Arc<ParentOf<M>>>,
        parents: &[Parent<M>],
    ) -> Result<Vec<Group<M::Object, M::Member>>> {
        let rules = self.rules();
        let coordinator = &self.coordinator;
        let parent_index: HashMap<String, &Parent<M>> = parents
            .iter()
            .map(|parent| (rules.key(parent.name()), parent))
            .collect();

        let query = self
            .mapper
            .prepare_objects_query(owner, scope.map(|parent| &**parent))?;
        let mut rows = open_rows(coordinator, &self.config, session, &query).await?;

        let mut groups: Vec<Group<M::Object, M::Member>> = Vec::new();
        // `None` marks a pair whose stub could not be built
        let mut slots: HashMap<(String, String), Option<usize>> = HashMap::new();

        while let Some(row) = next_row(&mut rows, session).await? {
            let Some(parent_name) = row.get_string(self.mapper.parent_column()) else {
                coordinator.record_skipped();
                tracing::warn!("{}: skipping row without parent", coordinator.label());
                continue;
            };
            let parent_key = rules.key(&parent_name);
            let Some(&parent) = parent_index.get(&parent_key) else {
                coordinator.record_skipped();
                tracing::warn!(
                    "{}: skipping row of unknown parent '{}'",
                    coordinator.label(),
                    parent_name
                );
                continue;
            };
            let Some(object_name) = row.get_string(self.mapper.object_column()) else {
                coordinator.record_skipped();
                tracing::warn!(
                    "{}: skipping row of '{}' without object name",
                    coordinator.label(),
                    parent_name
                );
                continue;
            };

            let slot = match slots.entry((parent_key.clone(), rules.key(&object_name))) {
                Entry::Occupied(occupied) => match *occupied.get() {
                    Some(slot) => slot,
                    None => {
                        coordinator.record_skipped();
                        continue;
                    }
                },
                Entry::Vacant(vacant) => {
                    let stub = resolve(
                        coordinator,
                        self.mapper.fetch_object(owner, parent, &object_name, &row),
                        || format!("'{parent_name}.{object_name}'"),
                    )?;
                    match stub {
                        Some(object) => {
                            let slot = groups.len();
                            groups.push(Group {
                                parent_key,
                                object,
                                members: Vec::new(),
                            });
                            vacant.insert(Some(slot));
                            slot
                        }
                        None => {
                            vacant.insert(None);
                            continue;
                        }
                    }
                }
            };

            let Some(group) = groups.get_mut(slot) else {
                continue;
            };
            let member = resolve(
                coordinator,
                self.mapper
                    .fetch_object_row(owner, parent, &group.object, &row),
                || format!("member row of '{parent_name}.{object_name}'"),
            )?;
            if let Some(member) = member {
                group.members.push(member);
            }
        }
        Ok(groups)
    }

    /// Hands every object its members, once per object.
    fn finalize(&self, groups: Vec<Group<M::Object, M::Member>>) -> Vec<(String, Arc<M::Object>)> {
        groups
            .into_iter()
            .map(|group| {
                let mut object = group.object;
                self.mapper.cache_children(&mut object, group.members);
                (group.parent_key, Arc::new(object))
            })
            .collect()
    }

    fn assemble(
        &self,
        parents: &[Parent<M>],
        objects: Vec<(String, Arc<M::Object>)>,
    ) -> CompositeEntries<M::Object> {
        let rules = self.rules();
        let mut fresh = CompositeEntries::new(rules);
        for parent in parents {
            fresh
                .by_parent
                .insert(rules.key(parent.name()), ObjectEntries::new(rules));
        }
        for (parent_key, object) in objects {
            fresh
                .by_parent
                .entry(parent_key.clone())
                .or_insert_with(|| ObjectEntries::new(rules))
                .insert(Arc::clone(&object));
            fresh.all.push((parent_key, object));
        }
        if let Some(order) = &self.order {
            fresh.sort(order);
        }
        fresh
    }

    /// Installs a full load unless a clear superseded it.
    fn publish(&self, ticket: &LoadTicket<'_>, fresh: CompositeEntries<M::Object>) {
        let mut entries = self.write();
        if ticket.is_current() {
            *entries = fresh;
        }
    }

    /// Cached objects without querying.
    pub fn cached_objects(&self) -> Vec<Arc<M::Object>> {
        self.read().objects()
    }

    /// Cached objects of one parent without querying. `None` when that
    /// parent's objects were never loaded.
    pub fn cached_objects_for(&self, parent: &str) -> Option<Vec<Arc<M::Object>>> {
        let key = self.rules().key(parent);
        let entries = self.read();
        match entries.by_parent.get(&key) {
            Some(bucket) => Some(bucket.to_vec()),
            None if self.coordinator.is_full() => Some(Vec::new()),
            None => None,
        }
    }

    /// Drops the cached objects of one parent. A `Full` cache goes back to
    /// `Empty`, so the next full read queries again; the other parents'
    /// objects stay answerable through per-parent reads. A full load in
    /// flight is superseded.
    pub fn clear_object_cache(&self, parent: &str) {
        let key = self.rules().key(parent);
        let mut entries = self.write();
        entries.remove_parent(&key);
        if self.coordinator.is_full() {
            self.coordinator.invalidate();
        } else {
            self.coordinator.supersede();
        }
    }
}

impl<M: CompositeMapper> MetadataCache for CompositeCache<M> {
    fn label(&self) -> &str {
        self.coordinator.label()
    }

    fn load_state(&self) -> LoadState {
        self.coordinator.state()
    }

    fn is_fully_cached(&self) -> bool {
        self.coordinator.is_full()
    }

    fn cached_len(&self) -> usize {
        self.read().all.len()
    }

    fn clear_cache(&self) {
        let mut entries = self.write();
        *entries = CompositeEntries::new(self.rules());
        self.coordinator.invalidate();
    }

    fn stats(&self) -> CacheStats {
        self.coordinator.stats()
    }
}
