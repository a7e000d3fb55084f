//! The first-level cache of a session.
//!
//! Entities are found by [`EntityKey`] through [`EntityHolder`]s and by instance identity through their
//! [`EntityEntry`]. A holder keeps the managed instance and, separately, a live proxy for the same key; at most one of
//! each. When both exist the proxy is bound to the instance in place, so there is only ever one state per key.

pub mod collection_entry;
pub mod entry;

use std::collections::HashMap;
use tracing::debug;
use tracing::trace;

use crate::error::OrmError;
use crate::error::Result;
use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::key::CollectionKey;
use crate::key::EntityKey;
use crate::mapping::EntityPersister;
use crate::storage::StoredRow;
use crate::types::LockMode;

pub use collection_entry::CollectionEntry;
pub use entry::EntityEntry;

#[derive(Clone, Debug, Default)]
pub struct EntityHolder {
    entity:          Option<EntityRef>,
    proxy:           Option<EntityRef>,
    // Read-only flag requested for a proxy before it got initialized.
    proxy_read_only: Option<bool>,
}

impl EntityHolder {
    #[inline]
    pub fn entity(&self) -> Option<&EntityRef> {
        self.entity.as_ref()
    }

    #[inline]
    pub fn proxy(&self) -> Option<&EntityRef> {
        self.proxy.as_ref()
    }

    fn is_empty(&self) -> bool {
        self.entity.is_none() && self.proxy.is_none()
    }
}

#[derive(Debug, Default)]
pub struct PersistenceContext {
    holders:              HashMap<EntityKey, EntityHolder>,
    entries:              HashMap<EntityRef, EntityEntry>,
    collections:          HashMap<CollectionRef, CollectionEntry>,
    collections_by_key:   HashMap<CollectionKey, CollectionRef>,
    database_snapshots:   HashMap<EntityKey, Option<StoredRow>>,
    non_lazy_collections: Vec<CollectionRef>,
    default_read_only:    bool,
    load_depth:           usize,
    clear_pending:        bool,
    next_sequence:        u64,
}

impl PersistenceContext {
    pub fn new(default_read_only: bool) -> Self {
        Self {
            default_read_only,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_default_read_only(&self) -> bool {
        self.default_read_only
    }

    pub(crate) fn set_default_read_only(&mut self, read_only: bool) {
        self.default_read_only = read_only;
    }

    pub(crate) fn next_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }

    /// Last sequence number handed out.
    #[inline]
    pub fn last_sequence(&self) -> u64 {
        self.next_sequence
    }

    pub(crate) fn restore_sequence(&mut self, last: u64) {
        self.next_sequence = self.next_sequence.max(last);
    }

    pub fn get_entity(&self, key: &EntityKey) -> Option<EntityRef> {
        self.holders.get(key).and_then(|h| h.entity.clone())
    }

    pub fn get_holder(&self, key: &EntityKey) -> Option<&EntityHolder> {
        self.holders.get(key)
    }

    /// Associates `entity` with `key`.
    ///
    /// Fails with [`OrmError::DuplicateIdentity`] when a different instance is already managed under the key. A live
    /// uninitialized proxy for the key is bound to the new instance.
    pub fn add_entity(&mut self, key: EntityKey, entity: EntityRef, mut entry: EntityEntry) -> Result<()> {
        let holder = self.holders.entry(key.clone()).or_default();
        if let Some(ref existing) = holder.entity {
            if !existing.same_target(&entity) && !existing.is_uninitialized_proxy() {
                return Err(OrmError::DuplicateIdentity(key));
            }
        }
        if let Some(ref proxy) = holder.proxy {
            if proxy.is_uninitialized_proxy() && !proxy.ptr_eq(&entity) {
                trace!("binding proxy of {key} to {:?}", entity);
                proxy.delegate_to(&entity);
            }
        }
        if let Some(read_only) = holder.proxy_read_only.take() {
            entry.set_read_only(read_only);
        }
        holder.entity = Some(entity.clone());
        self.entries.insert(entity.resolve(), entry);
        Ok(())
    }

    /// Registers an entry for an instance whose identifier isn't known yet.
    pub(crate) fn add_entry(&mut self, entity: &EntityRef, entry: EntityEntry) {
        self.entries.insert(entity.resolve(), entry);
    }

    /// Publishes an instance under the key it received from the storage.
    pub(crate) fn bind_key(&mut self, entity: &EntityRef, key: EntityKey) -> Result<()> {
        let Some(mut entry) = self.entries.remove(&entity.resolve())
        else {
            return Err(OrmError::EntityNotAssociated(format!("{entity:?}")));
        };
        entry.set_key(key.clone());
        self.add_entity(key, entity.clone(), entry)
    }

    /// Reverse lookup by instance identity.
    pub fn get_entry(&self, entity: &EntityRef) -> Option<&EntityEntry> {
        self.entries.get(&entity.resolve())
    }

    pub(crate) fn get_entry_mut(&mut self, entity: &EntityRef) -> Option<&mut EntityEntry> {
        self.entries.get_mut(&entity.resolve())
    }

    /// Detaches the instance managed under `key` and drops its entry. A proxy for the key stays registered.
    pub fn remove_entity(&mut self, key: &EntityKey) -> Option<EntityRef> {
        self.database_snapshots.remove(key);
        let holder = self.holders.get_mut(key)?;
        let entity = holder.entity.take();
        if holder.is_empty() {
            self.holders.remove(key);
        }
        if let Some(ref entity) = entity {
            self.entries.remove(&entity.resolve());
        }
        entity
    }

    /// Drops the entry of an instance which never got a key.
    pub(crate) fn remove_entry(&mut self, entity: &EntityRef) -> Option<EntityEntry> {
        self.entries.remove(&entity.resolve())
    }

    pub fn get_proxy(&self, key: &EntityKey) -> Option<EntityRef> {
        self.holders.get(key).and_then(|h| h.proxy.clone())
    }

    pub fn add_proxy(&mut self, key: EntityKey, proxy: EntityRef) {
        self.holders.entry(key).or_default().proxy = Some(proxy);
    }

    pub fn remove_proxy(&mut self, key: &EntityKey) -> Option<EntityRef> {
        let holder = self.holders.get_mut(key)?;
        let proxy = holder.proxy.take();
        holder.proxy_read_only = None;
        if holder.is_empty() {
            self.holders.remove(key);
        }
        proxy
    }

    /// Whether `proxy` is the proxy this context registered for its key.
    pub fn owns_proxy(&self, key: &EntityKey, proxy: &EntityRef) -> bool {
        self.holders
            .get(key)
            .and_then(|h| h.proxy.as_ref())
            .is_some_and(|p| p.ptr_eq(proxy))
    }

    /// Makes `proxy` the canonical instance for `key`.
    ///
    /// The proxy is narrowed to the persister's entity name in place. A `provided` instance, if any, hands its state
    /// over to the proxy and from then on delegates to it. Calling this again with the same arguments returns the
    /// same reference.
    pub fn narrow_proxy(
        &mut self,
        proxy: &EntityRef,
        persister: &EntityPersister,
        key: &EntityKey,
        provided: Option<&EntityRef>,
    ) -> EntityRef {
        if *proxy.entity_name() != **persister.entity_name() {
            debug!("narrowing proxy {:?} to {}", proxy, persister.entity_name());
            proxy.narrow(persister.entity_name().clone());
        }

        let Some(provided) = provided
        else {
            return proxy.resolve();
        };
        if provided.same_target(proxy) {
            return proxy.resolve();
        }

        if let Ok(state) = provided.state() {
            proxy.replace_state(state);
        }
        provided.delegate_to(proxy);

        let holder = self.holders.entry(key.clone()).or_default();
        let was_managed = holder.entity.as_ref().is_some_and(|e| e.ptr_eq(provided));
        if was_managed || holder.entity.is_none() {
            holder.entity = Some(proxy.clone());
        }
        if let Some(mut entry) = self.entries.remove(provided) {
            entry.set_entity_name(persister.entity_name().clone());
            self.entries.insert(proxy.clone(), entry);
        }
        proxy.clone()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.get_entry(entity).is_some_and(|e| !e.status().is_deleted_or_gone())
    }

    /// Read-only flag of a managed instance or of a registered proxy.
    pub fn is_read_only(&self, entity: &EntityRef) -> Result<bool> {
        if let Some(entry) = self.get_entry(entity) {
            return Ok(entry.is_read_only());
        }
        self.proxy_holder(entity)
            .map(|h| h.proxy_read_only.unwrap_or(self.default_read_only))
            .ok_or_else(|| OrmError::EntityNotAssociated(format!("{entity:?}")))
    }

    /// Switching an instance back to modifiable makes its current state the new dirty-checking baseline.
    pub fn set_read_only(&mut self, entity: &EntityRef, read_only: bool) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(&entity.resolve()) {
            if entry.is_read_only() && !read_only {
                entry.set_loaded_state(entity.state()?);
            }
            entry.set_read_only(read_only);
            return Ok(());
        }
        let key = self
            .proxy_key(entity)
            .ok_or_else(|| OrmError::EntityNotAssociated(format!("{entity:?}")))?;
        if let Some(holder) = self.holders.get_mut(&key) {
            holder.proxy_read_only = Some(read_only);
        }
        Ok(())
    }

    pub(crate) fn proxy_key(&self, entity: &EntityRef) -> Option<EntityKey> {
        self.holders
            .iter()
            .find(|(_, h)| h.proxy.as_ref().is_some_and(|p| p.ptr_eq(entity)))
            .map(|(k, _)| k.clone())
    }

    fn proxy_holder(&self, entity: &EntityRef) -> Option<&EntityHolder> {
        self.holders
            .values()
            .find(|h| h.proxy.as_ref().is_some_and(|p| p.ptr_eq(entity)))
    }

    pub fn get_current_lock_mode(&self, entity: &EntityRef) -> Result<LockMode> {
        self.get_entry(entity)
            .map(EntityEntry::lock_mode)
            .ok_or_else(|| OrmError::EntityNotAssociated(format!("{entity:?}")))
    }

    /// Marks the start of a load. Must be paired with [`after_load`](Self::after_load), on error paths too.
    pub fn before_load(&mut self) {
        self.load_depth += 1;
    }

    /// Returns `true` when the outermost load finished. A `clear` requested during the load happens now.
    pub fn after_load(&mut self) -> bool {
        self.load_depth = self.load_depth.saturating_sub(1);
        if self.load_depth > 0 {
            return false;
        }
        if self.clear_pending {
            self.clear_pending = false;
            self.clear_now();
        }
        true
    }

    #[inline]
    pub fn is_loading(&self) -> bool {
        self.load_depth > 0
    }

    /// Empties the context. Outstanding proxies and collection wrappers become unusable for lazy loading. Deferred
    /// until the outermost load completes if called during a load.
    pub fn clear(&mut self) {
        if self.load_depth > 0 {
            self.clear_pending = true;
            return;
        }
        self.clear_now();
    }

    fn clear_now(&mut self) {
        debug!(
            "clearing persistence context: {} entities, {} collections",
            self.entries.len(),
            self.collections.len()
        );
        self.holders.clear();
        self.entries.clear();
        self.collections.clear();
        self.collections_by_key.clear();
        self.database_snapshots.clear();
        self.non_lazy_collections.clear();
    }

    /// Managed instances in the order they were associated with the session.
    pub fn entities_in_order(&self) -> Vec<EntityRef> {
        let mut entities: Vec<(&EntityRef, u64)> = self.entries.iter().map(|(e, en)| (e, en.sequence())).collect();
        entities.sort_by_key(|(_, seq)| *seq);
        entities.into_iter().map(|(e, _)| e.clone()).collect()
    }

    pub fn entity_count(&self) -> usize {
        self.entries.len()
    }

    pub fn holders(&self) -> impl Iterator<Item = (&EntityKey, &EntityHolder)> {
        self.holders.iter()
    }

    pub(crate) fn add_collection(&mut self, collection: &CollectionRef, entry: CollectionEntry) {
        if let Some(key) = entry.loaded_key() {
            self.collections_by_key.insert(key.clone(), collection.clone());
        }
        self.collections.insert(collection.clone(), entry);
    }

    pub fn get_collection_entry(&self, collection: &CollectionRef) -> Option<&CollectionEntry> {
        self.collections.get(collection)
    }

    pub(crate) fn get_collection_entry_mut(&mut self, collection: &CollectionRef) -> Option<&mut CollectionEntry> {
        self.collections.get_mut(collection)
    }

    pub fn get_collection(&self, key: &CollectionKey) -> Option<CollectionRef> {
        self.collections_by_key.get(key).cloned()
    }

    pub(crate) fn reindex_collection(&mut self, collection: &CollectionRef) {
        let key = self.collections.get(collection).and_then(|e| e.loaded_key().cloned());
        if let Some(key) = key {
            self.collections_by_key.insert(key, collection.clone());
        }
    }

    pub(crate) fn remove_collection(&mut self, collection: &CollectionRef) -> Option<CollectionEntry> {
        let entry = self.collections.remove(collection)?;
        if let Some(key) = entry.loaded_key() {
            if self.collections_by_key.get(key).is_some_and(|c| c == collection) {
                self.collections_by_key.remove(key);
            }
        }
        Some(entry)
    }

    /// Collections whose entry names `owner` as their owner.
    pub fn collections_of(&self, owner: &EntityRef) -> Vec<CollectionRef> {
        self.collections
            .iter()
            .filter(|(_, e)| e.owner().same_target(owner))
            .map(|(c, _)| c.clone())
            .collect()
    }

    pub fn collections(&self) -> Vec<CollectionRef> {
        self.collections.keys().cloned().collect()
    }

    pub fn collection_count(&self) -> usize {
        self.collections.len()
    }

    pub(crate) fn add_non_lazy_collection(&mut self, collection: CollectionRef) {
        self.non_lazy_collections.push(collection);
    }

    pub(crate) fn take_non_lazy_collections(&mut self) -> Vec<CollectionRef> {
        std::mem::take(&mut self.non_lazy_collections)
    }

    pub(crate) fn cached_database_snapshot(&self, key: &EntityKey) -> Option<&Option<StoredRow>> {
        self.database_snapshots.get(key)
    }

    pub(crate) fn cache_database_snapshot(&mut self, key: EntityKey, row: Option<StoredRow>) {
        self.database_snapshots.insert(key, row);
    }

    pub(crate) fn forget_database_snapshot(&mut self, key: &EntityKey) {
        self.database_snapshots.remove(key);
    }

    pub(crate) fn clear_database_snapshots(&mut self) {
        self.database_snapshots.clear();
    }

    /// Locks are released with the transaction.
    pub(crate) fn reset_lock_modes(&mut self) {
        for entry in self.entries.values_mut() {
            entry.reset_lock_mode();
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&EntityRef, &EntityEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use crate::key::TenantId;
    use crate::mapping::EntityMapping;
    use crate::mapping::Metamodel;
    use crate::types::Identifier;
    use crate::types::Status;
    use crate::types::Value;

    fn key(id: i64) -> EntityKey {
        EntityKey::new("Parent", Identifier::Int(id), TenantId::Default)
    }

    fn instance(id: i64) -> EntityRef {
        EntityRef::new_initialized(Arc::from("Parent"), Some(Identifier::Int(id)), vec![Value::from("p")])
    }

    fn entry(ctx: &mut PersistenceContext, id: i64) -> EntityEntry {
        let seq = ctx.next_sequence();
        EntityEntry::new(
            Status::Managed,
            Arc::from("Parent"),
            Some(key(id)),
            vec![Value::from("p")],
            None,
            LockMode::None,
            true,
            false,
            seq,
        )
    }

    #[test]
    fn add_then_get_returns_same_instance() {
        let mut ctx = PersistenceContext::default();
        let e = instance(1);
        let en = entry(&mut ctx, 1);
        ctx.add_entity(key(1), e.clone(), en).unwrap();
        assert!(ctx.get_entity(&key(1)).unwrap().ptr_eq(&e));
        assert!(ctx.get_entry(&e).is_some());
        assert!(ctx.get_entry(&instance(1)).is_none());
    }

    #[test]
    fn different_instance_under_same_key_is_rejected() {
        let mut ctx = PersistenceContext::default();
        let en = entry(&mut ctx, 1);
        ctx.add_entity(key(1), instance(1), en).unwrap();
        let en = entry(&mut ctx, 1);
        let err = ctx.add_entity(key(1), instance(1), en).unwrap_err();
        assert!(matches!(err, OrmError::DuplicateIdentity(ref k) if *k == key(1)));
    }

    #[test]
    fn live_proxy_is_bound_to_added_instance() {
        let mut ctx = PersistenceContext::default();
        let proxy = EntityRef::new_proxy(Arc::from("Parent"), Identifier::Int(1));
        ctx.add_proxy(key(1), proxy.clone());
        let e = instance(1);
        let en = entry(&mut ctx, 1);
        ctx.add_entity(key(1), e.clone(), en).unwrap();
        assert!(proxy.is_delegate());
        assert!(proxy.same_target(&e));
        assert!(ctx.get_entry(&proxy).is_some());
    }

    #[test]
    fn narrow_proxy_is_idempotent() {
        let model = Metamodel::builder()
            .entity(EntityMapping::new("Parent").property("name"))
            .entity(EntityMapping::new("Special").extends("Parent"))
            .build()
            .unwrap();
        let special = model.entity_persister("Special").unwrap();
        let mut ctx = PersistenceContext::default();
        let proxy = EntityRef::new_proxy(Arc::from("Parent"), Identifier::Int(1));
        ctx.add_proxy(key(1), proxy.clone());
        let loaded = EntityRef::new_initialized(Arc::from("Special"), Some(Identifier::Int(1)), vec![Value::from("s")]);

        let first = ctx.narrow_proxy(&proxy, special, &key(1), Some(&loaded));
        let second = ctx.narrow_proxy(&proxy, special, &key(1), Some(&loaded));
        assert!(first.ptr_eq(&second));
        assert!(first.ptr_eq(&proxy));
        assert_eq!(&*proxy.entity_name(), "Special");
        assert_eq!(proxy.state().unwrap(), vec![Value::from("s")]);
        assert!(loaded.same_target(&proxy));
    }

    #[test]
    fn clear_is_deferred_during_load() {
        let mut ctx = PersistenceContext::default();
        let en = entry(&mut ctx, 1);
        ctx.add_entity(key(1), instance(1), en).unwrap();
        ctx.before_load();
        ctx.before_load();
        ctx.clear();
        assert_eq!(ctx.entity_count(), 1);
        assert!(!ctx.after_load());
        assert_eq!(ctx.entity_count(), 1);
        assert!(ctx.after_load());
        assert_eq!(ctx.entity_count(), 0);
    }

    #[test]
    fn lock_mode_of_unknown_instance_is_a_usage_error() {
        let ctx = PersistenceContext::default();
        let err = ctx.get_current_lock_mode(&instance(1)).unwrap_err();
        assert_eq!(err.category(), crate::error::ErrorCategory::Usage);
    }

    #[test]
    fn read_only_round_trip_resets_baseline() {
        let mut ctx = PersistenceContext::new(false);
        let e = instance(1);
        let en = entry(&mut ctx, 1);
        ctx.add_entity(key(1), e.clone(), en).unwrap();
        ctx.set_read_only(&e, true).unwrap();
        assert!(ctx.is_read_only(&e).unwrap());
        e.set_value(0, Value::from("changed")).unwrap();
        ctx.set_read_only(&e, false).unwrap();
        assert_eq!(ctx.get_entry(&e).unwrap().loaded_state(), &[Value::from("changed")]);
    }
}
