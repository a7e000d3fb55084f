use std::sync::Arc;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use super::BoxFuture;
use super::Session;
use crate::action::cache_entry;
use crate::context::CollectionEntry;
use crate::context::EntityEntry;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::mapping::EntityPersister;
use crate::mapping::PropertyKind;
use crate::storage::StoredRow;
use crate::types::CacheMode;
use crate::types::Identifier;
use crate::types::Interception;
use crate::types::LockMode;
use crate::types::Status;
use crate::types::Value;

fn lazy_error(entity: &EntityRef) -> OrmError {
    OrmError::LazyInitialization(format!(
        "[{}#{}]",
        entity.entity_name(),
        entity.id().map_or_else(|| "<null>".to_string(), |id| id.to_string())
    ))
}

fn collection_lazy_error(collection: &CollectionRef) -> OrmError {
    OrmError::LazyInitialization(format!("collection of role {}", collection.role()))
}

impl Session {
    /// The instance of `entity_name` for `id`, or `None` if there is no such row.
    pub async fn get(&mut self, entity_name: &str, id: impl Into<Identifier>) -> Result<Option<EntityRef>> {
        let result = self.get_top(entity_name, id.into(), LockMode::None).await;
        self.funnel(result)
    }

    pub async fn get_with_lock(
        &mut self,
        entity_name: &str,
        id: impl Into<Identifier>,
        lock_mode: LockMode,
    ) -> Result<Option<EntityRef>> {
        let result = self.get_top(entity_name, id.into(), lock_mode).await;
        self.funnel(result)
    }

    /// Like [`get`](Self::get), but a missing row is an error.
    pub async fn load(&mut self, entity_name: &str, id: impl Into<Identifier>) -> Result<EntityRef> {
        let id = id.into();
        let result = match self.get_top(entity_name, id.clone(), LockMode::None).await {
            Ok(Some(entity)) => Ok(entity),
            Ok(None) => Err(OrmError::EntityNotFound {
                entity: entity_name.to_string(),
                id,
            }),
            Err(err) => Err(err),
        };
        self.funnel(result)
    }

    /// A reference to the row which doesn't touch the storage. Returns the managed instance if there is one,
    /// otherwise a proxy initialized on first use.
    pub fn get_reference(&mut self, entity_name: &str, id: impl Into<Identifier>) -> Result<EntityRef> {
        self.check_open()?;
        let persister = self.persister(entity_name)?;
        let result = self.get_reference_internal(&persister, id.into());
        self.funnel(result)
    }

    /// Loads the state of a proxy. Fails with [`OrmError::LazyInitialization`] if the proxy doesn't belong to this
    /// session or the session is closed.
    pub async fn initialize(&mut self, proxy: &EntityRef) -> Result<EntityRef> {
        if self.closed {
            return Err(lazy_error(proxy));
        }
        let result = self.initialize_internal(proxy).await;
        self.funnel(result)
    }

    pub async fn initialize_collection(&mut self, collection: &CollectionRef) -> Result<()> {
        if self.closed {
            return Err(collection_lazy_error(collection));
        }
        let result = self.initialize_collection_internal(collection).await;
        self.funnel(result)
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn get_top(&mut self, entity_name: &str, id: Identifier, lock_mode: LockMode) -> Result<Option<EntityRef>> {
        self.check_open()?;
        if lock_mode.is_pessimistic() || lock_mode == LockMode::Write {
            self.require_transaction("pessimistic locking")?;
        }
        let persister = self.persister(entity_name)?;
        self.get_internal(persister, id, lock_mode).await
    }

    pub(super) async fn get_internal(
        &mut self,
        persister: Arc<EntityPersister>,
        id: Identifier,
        lock_mode: LockMode,
    ) -> Result<Option<EntityRef>> {
        if !persister.check_identifier_kind(&id) {
            return Err(OrmError::IllegalArgument(format!(
                "identifier {id} has the wrong type for entity '{}'",
                persister.entity_name()
            )));
        }
        let key = persister.entity_key(id, &self.tenant);

        if let Some(entity) = self.context.get_entity(&key) {
            let Some(entry) = self.context.get_entry(&entity)
            else {
                return Ok(Some(entity));
            };
            if entry.status().is_deleted_or_gone() || !persister.is_subclass_entity_name(entry.entity_name()) {
                return Ok(None);
            }
            if lock_mode > entry.lock_mode() {
                self.apply_lock(&entity, lock_mode).await?;
                if let Some(entry) = self.context.get_entry_mut(&entity) {
                    entry.upgrade_lock_mode(lock_mode);
                }
            }
            return Ok(Some(entity));
        }

        let target = self
            .context
            .get_proxy(&key)
            .filter(EntityRef::is_uninitialized_proxy);
        let loaded = self.load_row(&persister, &key, lock_mode, target).await?;
        if let Some(ref entity) = loaded {
            if matches!(
                lock_mode,
                LockMode::Optimistic | LockMode::OptimisticForceIncrement | LockMode::PessimisticForceIncrement
            ) {
                self.apply_lock(entity, lock_mode).await?;
                if let Some(entry) = self.context.get_entry_mut(entity) {
                    entry.upgrade_lock_mode(lock_mode);
                }
            }
        }
        Ok(loaded)
    }

    pub(super) fn get_reference_internal(&mut self, persister: &EntityPersister, id: Identifier) -> Result<EntityRef> {
        if !persister.check_identifier_kind(&id) {
            return Err(OrmError::IllegalArgument(format!(
                "identifier {id} has the wrong type for entity '{}'",
                persister.entity_name()
            )));
        }
        let key = persister.entity_key(id.clone(), &self.tenant);
        if let Some(entity) = self.context.get_entity(&key) {
            return Ok(entity);
        }
        if let Some(proxy) = self.context.get_proxy(&key) {
            return Ok(proxy);
        }
        trace!("[session {}] new proxy for {key}", self.id);
        let proxy = EntityRef::new_proxy(persister.entity_name().clone(), id);
        self.context.add_proxy(key, proxy.clone());
        Ok(proxy)
    }

    /// One load bracket. Everything loaded while it is open shares it; non-lazy collections are initialized when the
    /// outermost bracket closes.
    pub(super) fn load_row<'a>(
        &'a mut self,
        persister: &'a EntityPersister,
        key: &'a EntityKey,
        lock_mode: LockMode,
        target: Option<EntityRef>,
    ) -> BoxFuture<'a, Option<EntityRef>> {
        Box::pin(async move {
            self.context.before_load();
            let result = self.load_from_sources(persister, key, lock_mode, target).await;
            self.finish_load(result).await
        })
    }

    pub(super) async fn finish_load<T>(&mut self, result: Result<T>) -> Result<T> {
        let outermost = self.context.after_load();
        let value = result?;
        if outermost {
            self.initialize_non_lazy_collections().await?;
        }
        Ok(value)
    }

    async fn initialize_non_lazy_collections(&mut self) -> Result<()> {
        loop {
            let pending = self.context.take_non_lazy_collections();
            if pending.is_empty() {
                return Ok(());
            }
            for collection in pending {
                if !collection.is_initialized() && self.context.get_collection_entry(&collection).is_some() {
                    self.initialize_collection_internal(&collection).await?;
                }
            }
        }
    }

    async fn load_from_sources(
        &mut self,
        persister: &EntityPersister,
        key: &EntityKey,
        lock_mode: LockMode,
        target: Option<EntityRef>,
    ) -> Result<Option<EntityRef>> {
        if self.cache_mode.is_get_enabled() && !lock_mode.is_pessimistic() {
            if let Some(region) = self.factory.regions().region_for(persister) {
                let cache_key = region.generate_cache_key(key.id(), persister, &self.tenant);
                if let Some(cached) = region.get(&cache_key).await {
                    if !persister.is_subclass_entity_name(&cached.subclass) {
                        return Ok(None);
                    }
                    trace!("[session {}] second-level cache hit for {key}", self.id);
                    let row = StoredRow::new(cached.subclass, cached.values);
                    return self.assemble(key, row, LockMode::None, target, false).await;
                }
            }
        }

        let Some(row) = self.conn.load(persister, key.id(), lock_mode).await?
        else {
            return Ok(None);
        };
        self.assemble(key, row, lock_mode.max(LockMode::Read), target, true)
            .await
    }

    /// Turns a row into a managed instance. `target` is a proxy which becomes that instance.
    pub(super) async fn assemble(
        &mut self,
        key: &EntityKey,
        row: StoredRow,
        lock_mode: LockMode,
        target: Option<EntityRef>,
        put_into_cache: bool,
    ) -> Result<Option<EntityRef>> {
        let persister = self.persister(&row.entity_name)?;
        let instance = match target {
            Some(ref proxy) => self.context.narrow_proxy(proxy, &persister, key, None),
            None => EntityRef::new_proxy(persister.entity_name().clone(), key.id().clone()),
        };

        let sequence = self.context.next_sequence();
        let entry = EntityEntry::new(
            Status::Loading,
            persister.entity_name().clone(),
            Some(key.clone()),
            Vec::new(),
            None,
            lock_mode,
            true,
            self.context.is_default_read_only(),
            sequence,
        );
        self.context.add_entity(key.clone(), instance.clone(), entry)?;

        let state = match self.hydrate(&persister, &instance, key, &row, None).await {
            Ok(state) => state,
            Err(err) => {
                self.discard_loading(key, &instance);
                return Err(err);
            }
        };
        let state = match self
            .interceptor
            .on_load(&instance, key.id(), &state, persister.property_names())
            .await
        {
            Interception::Proceed => state,
            Interception::Veto => {
                debug!("[session {}] load of {key} vetoed", self.id);
                self.discard_loading(key, &instance);
                return Ok(None);
            }
            Interception::Rewrite(state) => match Self::checked_rewrite(&persister, state) {
                Ok(state) => state,
                Err(err) => {
                    self.discard_loading(key, &instance);
                    return Err(err);
                }
            },
        };

        instance.replace_state(state.clone());
        let version = persister.version_of(&state);
        if let Some(entry) = self.context.get_entry_mut(&instance) {
            entry.post_synchronize(state, version);
        }
        trace!("[session {}] loaded {instance:?}", self.id);

        if put_into_cache && self.cache_mode.is_put_enabled() {
            if let Some(region) = self.factory.regions().region_for(&persister) {
                let cache_key = region.generate_cache_key(key.id(), &persister, &self.tenant);
                let minimal = self.factory.options().minimal_puts() && self.cache_mode != CacheMode::Refresh;
                region
                    .put_from_load(&cache_key, cache_entry(&persister, &row), minimal)
                    .await;
            }
        }
        Ok(Some(instance))
    }

    fn discard_loading(&mut self, key: &EntityKey, instance: &EntityRef) {
        self.context.remove_entity(key);
        for collection in self.context.collections_of(instance) {
            self.context.remove_collection(&collection);
        }
    }

    /// Builds the property values of `owner` from a row. Collections of `existing` state are reused and reset to
    /// uninitialized.
    pub(super) async fn hydrate(
        &mut self,
        persister: &EntityPersister,
        owner: &EntityRef,
        key: &EntityKey,
        row: &StoredRow,
        existing: Option<&[Value]>,
    ) -> Result<Vec<Value>> {
        let mut state = Vec::with_capacity(row.values.len());
        for (index, (prop, datum)) in persister.properties().iter().zip(row.values.iter()).enumerate() {
            let value = match prop.kind() {
                PropertyKind::Basic | PropertyKind::Version => Value::from_datum(datum.clone()),
                PropertyKind::ManyToOne { target, lazy, .. } => match Identifier::from_datum(datum) {
                    Some(id) => self.resolve_reference(target, id, *lazy).await?,
                    None => Value::Null,
                },
                PropertyKind::Collection { lazy, .. } => {
                    let role = persister.collection_role(prop.name());
                    let reused = existing
                        .and_then(|s| s.get(index))
                        .and_then(Value::as_collection)
                        .cloned();
                    let collection = match reused {
                        Some(collection) => {
                            self.context.remove_collection(&collection);
                            collection.reset_uninitialized();
                            collection
                        }
                        None => CollectionRef::uninitialized(Arc::from(role.as_str())),
                    };
                    let collection_persister = self.factory.metamodel().collection_persister(&role)?.clone();
                    let collection_key = collection_persister.collection_key(key.id().clone(), &self.tenant);
                    self.context.add_collection(
                        &collection,
                        CollectionEntry::loaded(
                            collection_persister.role().clone(),
                            owner.clone(),
                            collection_key,
                            None,
                        ),
                    );
                    if !*lazy {
                        self.context.add_non_lazy_collection(collection.clone());
                    }
                    Value::Collection(collection)
                }
            };
            state.push(value);
        }
        Ok(state)
    }

    async fn resolve_reference(&mut self, target: &str, id: Identifier, lazy: bool) -> Result<Value> {
        let persister = self.persister(target)?;
        let key = persister.entity_key(id.clone(), &self.tenant);
        if let Some(entity) = self.context.get_entity(&key) {
            return Ok(Value::Entity(entity));
        }
        if let Some(proxy) = self.context.get_proxy(&key) {
            return Ok(Value::Entity(proxy));
        }
        if lazy {
            let proxy = EntityRef::new_proxy(persister.entity_name().clone(), id);
            self.context.add_proxy(key, proxy.clone());
            return Ok(Value::Entity(proxy));
        }
        Ok(self
            .load_row(&persister, &key, LockMode::None, None)
            .await?
            .map_or(Value::Null, Value::Entity))
    }

    pub(super) async fn initialize_internal(&mut self, proxy: &EntityRef) -> Result<EntityRef> {
        if proxy.is_initialized() {
            return Ok(proxy.resolve());
        }
        if self.closed {
            return Err(lazy_error(proxy));
        }
        let Some(key) = self.context.proxy_key(proxy)
        else {
            return Err(lazy_error(proxy));
        };

        if let Some(existing) = self.context.get_entity(&key) {
            let persister = self.persister_of(&existing)?;
            return Ok(self.context.narrow_proxy(proxy, &persister, &key, Some(&existing)));
        }

        debug!("[session {}] initializing proxy for {key}", self.id);
        let persister = self.persister(&proxy.entity_name())?;
        match self.load_row(&persister, &key, LockMode::None, Some(proxy.clone())).await? {
            Some(entity) => Ok(entity),
            None => Err(OrmError::EntityNotFound {
                entity: key.entity_name().to_string(),
                id:     key.id().clone(),
            }),
        }
    }

    pub(super) async fn initialize_collection_internal(&mut self, collection: &CollectionRef) -> Result<()> {
        if collection.is_initialized() {
            return Ok(());
        }
        if self.closed {
            return Err(collection_lazy_error(collection));
        }
        let Some(entry) = self.context.get_collection_entry(collection)
        else {
            return Err(collection_lazy_error(collection));
        };
        let Some(collection_key) = entry.loaded_key().cloned()
        else {
            collection.initialize_with(Vec::new());
            return Ok(());
        };

        let collection_persister = self.factory.metamodel().collection_persister(entry.role())?.clone();
        let element_persister = self.persister(collection_persister.element_entity_name())?;
        debug!("[session {}] initializing collection {}", self.id, collection_persister.role());
        let ids = self
            .conn
            .load_collection(&collection_persister, collection_key.owner_id())
            .await?;
        let mut elements = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(element) = self.get_internal(element_persister.clone(), id, LockMode::None).await? {
                elements.push(element);
            }
        }

        collection.initialize_with(elements.clone());
        if let Some(entry) = self.context.get_collection_entry_mut(collection) {
            entry.set_snapshot(Some(elements));
        }
        Ok(())
    }
}
