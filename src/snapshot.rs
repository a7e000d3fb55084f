//! Versioned session snapshots.
//!
//! A snapshot captures what a session holds between transactions: managed instances and their entries, live proxies,
//! persistent collections and the inserts, deletes and upserts still queued. The object graph is flattened into
//! index tables so shared and cyclic references survive the round trip, then encoded with `postcard`.
//!
//! The factory is not part of a snapshot. It is identified by its UUID and resolved through a [`FactoryRegistry`]
//! on restore, so a snapshot can only be restored where an equivalent factory is registered.

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument;
use uuid::Uuid;

use crate::action::ActionQueue;
use crate::action::EntityDeleteAction;
use crate::action::EntityInsertAction;
use crate::action::EntityUpsertAction;
use crate::context::CollectionEntry;
use crate::context::EntityEntry;
use crate::context::PersistenceContext;
use crate::error::OrmError;
use crate::error::Result;
use crate::factory::FactoryRegistry;
use crate::factory::SessionFactory;
use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::instance::QueuedOperation;
use crate::interceptor::Interceptor;
use crate::key::TenantId;
use crate::session::Session;
use crate::types::CacheMode;
use crate::types::FlushMode;
use crate::types::Identifier;
use crate::types::LockMode;
use crate::types::Status;
use crate::types::Value;

/// Bumped whenever the encoding changes incompatibly.
pub const SNAPSHOT_FORMAT_VERSION: u16 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
enum SnapshotValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Entity(usize),
    Collection(usize),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum SnapshotInstance {
    Initialized {
        entity_name: String,
        id:          Option<Identifier>,
        state:       Vec<SnapshotValue>,
    },
    Proxy {
        entity_name: String,
        id:          Identifier,
    },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
enum SnapshotQueued {
    Add(usize),
    Remove(usize),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotCollection {
    role:     String,
    elements: Option<Vec<usize>>,
    queued:   Vec<SnapshotQueued>,
    dirty:    bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    instance:              usize,
    status:                Status,
    entity_name:           String,
    id:                    Option<Identifier>,
    loaded_state:          Vec<SnapshotValue>,
    deleted_state:         Option<Vec<SnapshotValue>>,
    version:               Option<i64>,
    lock_mode:             LockMode,
    exists_in_database:    bool,
    read_only:             bool,
    orphan_before_updates: bool,
    sequence:              u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotCollectionEntry {
    collection:      usize,
    role:            String,
    owner:           usize,
    loaded_owner_id: Option<Identifier>,
    snapshot:        Option<Vec<usize>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotInsert {
    instance: usize,
    id:       Identifier,
    state:    Vec<SnapshotValue>,
    version:  Option<i64>,
    sequence: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotDelete {
    instance:              usize,
    version:               Option<i64>,
    state:                 Vec<SnapshotValue>,
    orphan_before_updates: bool,
    sequence:              u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct SnapshotUpsert {
    instance: usize,
    state:    Vec<SnapshotValue>,
    version:  Option<i64>,
}

/// Serializable image of a session.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SessionSnapshot {
    format_version:     u16,
    factory:            Uuid,
    tenant:             TenantId,
    flush_mode:         FlushMode,
    cache_mode:         CacheMode,
    default_read_only:  bool,
    last_sequence:      u64,
    instances:          Vec<SnapshotInstance>,
    collections:        Vec<SnapshotCollection>,
    entries:            Vec<SnapshotEntry>,
    collection_entries: Vec<SnapshotCollectionEntry>,
    proxies:            Vec<usize>,
    inserts:            Vec<SnapshotInsert>,
    deletes:            Vec<SnapshotDelete>,
    upserts:            Vec<SnapshotUpsert>,
}

fn snapshot_error(message: impl Into<String>) -> OrmError {
    OrmError::Snapshot(message.into())
}

/// Assigns table indices to instances and collections as they are reached.
#[derive(Default)]
struct Flattener {
    instances:           Vec<Option<SnapshotInstance>>,
    instance_index:      HashMap<EntityRef, usize>,
    pending_instances:   Vec<(usize, EntityRef)>,
    collections:         Vec<Option<SnapshotCollection>>,
    collection_index:    HashMap<CollectionRef, usize>,
    pending_collections: Vec<(usize, CollectionRef)>,
}

impl Flattener {
    fn instance(&mut self, entity: &EntityRef) -> usize {
        let entity = entity.resolve();
        if let Some(index) = self.instance_index.get(&entity) {
            return *index;
        }
        let index = self.instances.len();
        self.instances.push(None);
        self.instance_index.insert(entity.clone(), index);
        self.pending_instances.push((index, entity));
        index
    }

    fn collection(&mut self, collection: &CollectionRef) -> usize {
        if let Some(index) = self.collection_index.get(collection) {
            return *index;
        }
        let index = self.collections.len();
        self.collections.push(None);
        self.collection_index.insert(collection.clone(), index);
        self.pending_collections.push((index, collection.clone()));
        index
    }

    fn value(&mut self, value: &Value) -> SnapshotValue {
        match value {
            Value::Null => SnapshotValue::Null,
            Value::Bool(b) => SnapshotValue::Bool(*b),
            Value::Int(i) => SnapshotValue::Int(*i),
            Value::Float(f) => SnapshotValue::Float(*f),
            Value::Text(s) => SnapshotValue::Text(s.clone()),
            Value::Bytes(b) => SnapshotValue::Bytes(b.clone()),
            Value::Entity(e) => SnapshotValue::Entity(self.instance(e)),
            Value::Collection(c) => SnapshotValue::Collection(self.collection(c)),
        }
    }

    fn state(&mut self, state: &[Value]) -> Vec<SnapshotValue> {
        state.iter().map(|v| self.value(v)).collect()
    }

    fn elements(&mut self, elements: &[EntityRef]) -> Vec<usize> {
        elements.iter().map(|e| self.instance(e)).collect()
    }

    /// Flattens everything reached so far, following references until nothing new turns up.
    fn drain(&mut self) -> Result<()> {
        loop {
            if let Some((index, entity)) = self.pending_instances.pop() {
                let flattened = if entity.is_uninitialized_proxy() {
                    SnapshotInstance::Proxy {
                        entity_name: entity.entity_name().to_string(),
                        id:          entity
                            .id()
                            .ok_or_else(|| snapshot_error(format!("proxy {entity:?} has no identifier")))?,
                    }
                }
                else {
                    SnapshotInstance::Initialized {
                        entity_name: entity.entity_name().to_string(),
                        id:          entity.id(),
                        state:       self.state(&entity.state()?),
                    }
                };
                self.instances[index] = Some(flattened);
            }
            else if let Some((index, collection)) = self.pending_collections.pop() {
                let elements = collection.elements().ok().map(|e| self.elements(&e));
                let queued = collection
                    .queued_operations()
                    .iter()
                    .map(|op| match op {
                        QueuedOperation::Add(e) => SnapshotQueued::Add(self.instance(e)),
                        QueuedOperation::Remove(e) => SnapshotQueued::Remove(self.instance(e)),
                    })
                    .collect();
                self.collections[index] = Some(SnapshotCollection {
                    role: collection.role().to_string(),
                    elements,
                    queued,
                    dirty: collection.is_dirty(),
                });
            }
            else {
                return Ok(());
            }
        }
    }

    fn finish(self) -> Result<(Vec<SnapshotInstance>, Vec<SnapshotCollection>)> {
        let instances = self
            .instances
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| snapshot_error("instance table has gaps"))?;
        let collections = self
            .collections
            .into_iter()
            .collect::<Option<Vec<_>>>()
            .ok_or_else(|| snapshot_error("collection table has gaps"))?;
        Ok((instances, collections))
    }
}

/// Decoded instance and collection tables.
struct Graph {
    instances:   Vec<EntityRef>,
    collections: Vec<CollectionRef>,
}

impl Graph {
    fn build(instances: &[SnapshotInstance], collections: &[SnapshotCollection]) -> Result<Self> {
        let instances: Vec<EntityRef> = instances
            .iter()
            .map(|i| match i {
                SnapshotInstance::Initialized { entity_name, id, .. } => {
                    EntityRef::new_initialized(Arc::from(entity_name.as_str()), id.clone(), Vec::new())
                }
                SnapshotInstance::Proxy { entity_name, id } => {
                    EntityRef::new_proxy(Arc::from(entity_name.as_str()), id.clone())
                }
            })
            .collect();

        let mut graph = Self {
            instances,
            collections: Vec::with_capacity(collections.len()),
        };
        for c in collections {
            let elements = c.elements.as_ref().map(|e| graph.elements(e)).transpose()?;
            let queued = c
                .queued
                .iter()
                .map(|op| {
                    Ok(match op {
                        SnapshotQueued::Add(i) => QueuedOperation::Add(graph.instance(*i)?),
                        SnapshotQueued::Remove(i) => QueuedOperation::Remove(graph.instance(*i)?),
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            graph.collections.push(CollectionRef::restore(
                Arc::from(c.role.as_str()),
                elements,
                queued,
                c.dirty,
            ));
        }
        Ok(graph)
    }

    fn instance(&self, index: usize) -> Result<EntityRef> {
        self.instances
            .get(index)
            .cloned()
            .ok_or_else(|| snapshot_error(format!("instance #{index} is out of range")))
    }

    fn collection(&self, index: usize) -> Result<CollectionRef> {
        self.collections
            .get(index)
            .cloned()
            .ok_or_else(|| snapshot_error(format!("collection #{index} is out of range")))
    }

    fn elements(&self, indices: &[usize]) -> Result<Vec<EntityRef>> {
        indices.iter().map(|i| self.instance(*i)).collect()
    }

    fn value(&self, value: &SnapshotValue) -> Result<Value> {
        Ok(match value {
            SnapshotValue::Null => Value::Null,
            SnapshotValue::Bool(b) => Value::Bool(*b),
            SnapshotValue::Int(i) => Value::Int(*i),
            SnapshotValue::Float(f) => Value::Float(*f),
            SnapshotValue::Text(s) => Value::Text(s.clone()),
            SnapshotValue::Bytes(b) => Value::Bytes(b.clone()),
            SnapshotValue::Entity(i) => Value::Entity(self.instance(*i)?),
            SnapshotValue::Collection(i) => Value::Collection(self.collection(*i)?),
        })
    }

    fn state(&self, state: &[SnapshotValue]) -> Result<Vec<Value>> {
        state.iter().map(|v| self.value(v)).collect()
    }
}

impl SessionSnapshot {
    /// Captures `session`. Sessions inside a transaction or with inserts waiting for transient instances can't be
    /// captured.
    #[instrument(level = "debug", skip(session), fields(session = %session.id()))]
    pub fn capture(session: &Session) -> Result<Self> {
        if !session.is_open() {
            return Err(OrmError::SessionClosed);
        }
        if session.is_transaction_active() {
            return Err(snapshot_error("cannot capture a session with an active transaction"));
        }
        let actions = session.action_queue();
        if actions.has_unresolved_inserts() {
            return Err(snapshot_error(
                "cannot capture a session with inserts waiting for transient instances",
            ));
        }

        let context = session.persistence_context();
        let mut flattener = Flattener::default();

        let mut entries = Vec::new();
        for (entity, entry) in context.entries() {
            entries.push(SnapshotEntry {
                instance:              flattener.instance(entity),
                status:                entry.status(),
                entity_name:           entry.entity_name().to_string(),
                id:                    entry.id().cloned(),
                loaded_state:          flattener.state(entry.loaded_state()),
                deleted_state:         entry.deleted_state().map(|s| flattener.state(s)),
                version:               entry.version(),
                lock_mode:             entry.lock_mode(),
                exists_in_database:    entry.exists_in_database(),
                read_only:             entry.is_read_only(),
                orphan_before_updates: entry.is_removing_orphan_before_updates(),
                sequence:              entry.sequence(),
            });
        }
        entries.sort_by_key(|e| e.sequence);

        let proxies = context
            .holders()
            .filter_map(|(_, holder)| holder.proxy())
            .filter(|proxy| proxy.is_uninitialized_proxy())
            .map(|proxy| flattener.instance(proxy))
            .collect();

        let mut collection_entries = Vec::new();
        for collection in context.collections() {
            let Some(entry) = context.get_collection_entry(&collection)
            else {
                continue;
            };
            collection_entries.push(SnapshotCollectionEntry {
                collection:      flattener.collection(&collection),
                role:            entry.role().to_string(),
                owner:           flattener.instance(entry.owner()),
                loaded_owner_id: entry.loaded_key().map(|k| k.owner_id().clone()),
                snapshot:        entry.snapshot().map(|s| flattener.elements(s)),
            });
        }

        let mut inserts = Vec::new();
        for action in actions.insertions() {
            let Some(ref id) = action.id
            else {
                return Err(snapshot_error(format!(
                    "insert of {:?} still waits for a generated identifier",
                    action.entity
                )));
            };
            inserts.push(SnapshotInsert {
                instance: flattener.instance(&action.entity),
                id:       id.clone(),
                state:    flattener.state(&action.state),
                version:  action.version,
                sequence: action.sequence,
            });
        }
        let deletes = actions
            .deletions()
            .map(|action| SnapshotDelete {
                instance:              flattener.instance(&action.entity),
                version:               action.version,
                state:                 flattener.state(&action.state),
                orphan_before_updates: action.orphan_before_updates,
                sequence:              action.sequence,
            })
            .collect();
        let upserts = actions
            .upserts()
            .iter()
            .map(|action| SnapshotUpsert {
                instance: flattener.instance(&action.entity),
                state:    flattener.state(&action.state),
                version:  action.version,
            })
            .collect();

        flattener.drain()?;
        let (instances, collections) = flattener.finish()?;
        debug!(
            "captured {} instances, {} collections, {} entries",
            instances.len(),
            collections.len(),
            entries.len()
        );

        Ok(Self {
            format_version: SNAPSHOT_FORMAT_VERSION,
            factory: session.factory().uuid(),
            tenant: session.tenant().clone(),
            flush_mode: session.flush_mode(),
            cache_mode: session.cache_mode(),
            default_read_only: context.is_default_read_only(),
            last_sequence: context.last_sequence(),
            instances,
            collections,
            entries,
            collection_entries,
            proxies,
            inserts,
            deletes,
            upserts,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_stdvec(self).map_err(|e| snapshot_error(format!("encoding failed: {e}")))
    }

    /// Decodes a snapshot. Snapshots written by another format version are rejected.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self =
            postcard::from_bytes(bytes).map_err(|e| snapshot_error(format!("decoding failed: {e}")))?;
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(snapshot_error(format!(
                "unsupported snapshot format version {}, expected {SNAPSHOT_FORMAT_VERSION}",
                snapshot.format_version
            )));
        }
        Ok(snapshot)
    }

    #[inline]
    pub fn factory_uuid(&self) -> Uuid {
        self.factory
    }

    #[inline]
    pub fn entity_count(&self) -> usize {
        self.entries.len()
    }

    /// Opens a new session of the registered factory and installs the captured state into it.
    pub async fn restore(&self, registry: &FactoryRegistry) -> Result<Session> {
        self.restore_with(registry, None).await
    }

    #[instrument(level = "debug", skip(self, registry, interceptor), fields(factory = %self.factory))]
    pub async fn restore_with(
        &self,
        registry: &FactoryRegistry,
        interceptor: Option<Arc<dyn Interceptor>>,
    ) -> Result<Session> {
        let Some(factory) = registry.get(&self.factory)
        else {
            return Err(snapshot_error(format!("session factory {} is not registered", self.factory)));
        };
        let (context, actions) = self.rebuild(&factory)?;

        let mut builder = factory
            .session_builder()
            .flush_mode(self.flush_mode)
            .cache_mode(self.cache_mode)
            .default_read_only(self.default_read_only);
        if let TenantId::Named(ref tenant) = self.tenant {
            builder = builder.tenant(tenant.clone());
        }
        if let Some(interceptor) = interceptor {
            builder = builder.interceptor(interceptor);
        }
        let mut session = builder.open().await?;
        session.install(context, actions);
        debug!("[session {}] restored with {} entities", session.id(), self.entries.len());
        Ok(session)
    }

    fn rebuild(&self, factory: &SessionFactory) -> Result<(PersistenceContext, ActionQueue)> {
        let metamodel = factory.metamodel();
        let graph = Graph::build(&self.instances, &self.collections)?;
        for (index, instance) in self.instances.iter().enumerate() {
            if let SnapshotInstance::Initialized { state, .. } = instance {
                graph.instance(index)?.replace_state(graph.state(state)?);
            }
        }

        let mut context = PersistenceContext::new(self.default_read_only);
        context.restore_sequence(self.last_sequence);
        let mut entry_keys = HashMap::new();
        for e in &self.entries {
            let entity = graph.instance(e.instance)?;
            let persister = metamodel.entity_persister(&e.entity_name)?;
            let key = e.id.clone().map(|id| persister.entity_key(id, &self.tenant));
            let mut entry = EntityEntry::new(
                e.status,
                persister.entity_name().clone(),
                key.clone(),
                graph.state(&e.loaded_state)?,
                e.version,
                e.lock_mode,
                e.exists_in_database,
                e.read_only,
                e.sequence,
            );
            if let Some(ref deleted) = e.deleted_state {
                entry.mark_deleted(graph.state(deleted)?, e.orphan_before_updates);
                entry.set_status(e.status);
            }
            match key {
                Some(key) => {
                    entry_keys.insert(e.instance, key.clone());
                    context.add_entity(key, entity, entry)?;
                }
                None => context.add_entry(&entity, entry),
            }
        }

        for index in &self.proxies {
            let proxy = graph.instance(*index)?;
            let id = proxy
                .id()
                .ok_or_else(|| snapshot_error(format!("proxy #{index} has no identifier")))?;
            let persister = metamodel.entity_persister(&proxy.entity_name())?;
            context.add_proxy(persister.entity_key(id, &self.tenant), proxy);
        }

        for c in &self.collection_entries {
            let collection = graph.collection(c.collection)?;
            let owner = graph.instance(c.owner)?;
            let collection_persister = metamodel.collection_persister(&c.role)?;
            let snapshot = c.snapshot.as_ref().map(|s| graph.elements(s)).transpose()?;
            let entry = match c.loaded_owner_id {
                Some(ref owner_id) => CollectionEntry::loaded(
                    collection_persister.role().clone(),
                    owner,
                    collection_persister.collection_key(owner_id.clone(), &self.tenant),
                    snapshot,
                ),
                None => {
                    let mut entry = CollectionEntry::new_collection(collection_persister.role().clone(), owner);
                    entry.set_snapshot(snapshot);
                    entry
                }
            };
            context.add_collection(&collection, entry);
        }

        let keyed = |instance: usize| {
            entry_keys
                .get(&instance)
                .cloned()
                .ok_or_else(|| snapshot_error(format!("queued action on instance #{instance} without a managed key")))
        };
        let mut actions = ActionQueue::default();
        for i in &self.inserts {
            let entity = graph.instance(i.instance)?;
            let persister = metamodel.persister_of(&entity)?.clone();
            actions.add_insert(EntityInsertAction::new(
                entity,
                persister,
                Some(i.id.clone()),
                graph.state(&i.state)?,
                i.version,
                i.sequence,
            ));
        }
        for d in &self.deletes {
            let entity = graph.instance(d.instance)?;
            let persister = metamodel.persister_of(&entity)?.clone();
            actions.add_delete(EntityDeleteAction {
                entity,
                persister,
                key: keyed(d.instance)?,
                version: d.version,
                state: graph.state(&d.state)?,
                orphan_before_updates: d.orphan_before_updates,
                sequence: d.sequence,
            });
        }
        for u in &self.upserts {
            let entity = graph.instance(u.instance)?;
            let persister = metamodel.persister_of(&entity)?.clone();
            actions.add_upsert(EntityUpsertAction {
                entity,
                persister,
                key: keyed(u.instance)?,
                state: graph.state(&u.state)?,
                version: u.version,
            });
        }
        Ok((context, actions))
    }
}

impl Session {
    /// Shorthand for [`SessionSnapshot::capture`].
    pub fn snapshot(&self) -> Result<SessionSnapshot> {
        SessionSnapshot::capture(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_and_cyclic_references_flatten_once() {
        let a = EntityRef::new_initialized(Arc::from("Node"), Some(Identifier::Int(1)), Vec::new());
        let b = EntityRef::new_initialized(Arc::from("Node"), Some(Identifier::Int(2)), Vec::new());
        a.replace_state(vec![Value::Entity(b.clone())]);
        b.replace_state(vec![Value::Entity(a.clone())]);

        let mut flattener = Flattener::default();
        assert_eq!(flattener.instance(&a), 0);
        assert_eq!(flattener.instance(&a.clone()), 0);
        flattener.drain().unwrap();
        let (instances, _) = flattener.finish().unwrap();
        assert_eq!(instances.len(), 2);

        let graph = Graph::build(&instances, &[]).unwrap();
        for (index, instance) in instances.iter().enumerate() {
            if let SnapshotInstance::Initialized { state, .. } = instance {
                graph.instance(index).unwrap().replace_state(graph.state(state).unwrap());
            }
        }
        let a2 = graph.instance(0).unwrap();
        let b2 = a2.value(0).unwrap().as_entity().cloned().unwrap();
        assert!(b2.value(0).unwrap().as_entity().unwrap().ptr_eq(&a2));
    }

    #[test]
    fn uninitialized_collections_keep_queued_operations() {
        let element = EntityRef::new_proxy(Arc::from("Child"), Identifier::Int(7));
        let collection = CollectionRef::uninitialized(Arc::from("Parent.children"));
        collection.add(element);

        let mut flattener = Flattener::default();
        flattener.collection(&collection);
        flattener.drain().unwrap();
        let (instances, collections) = flattener.finish().unwrap();
        assert!(collections[0].elements.is_none());
        assert!(matches!(instances[0], SnapshotInstance::Proxy { .. }));

        let graph = Graph::build(&instances, &collections).unwrap();
        let restored = graph.collection(0).unwrap();
        assert!(!restored.is_initialized());
        assert_eq!(restored.queued_operations().len(), 1);
    }

    #[test]
    fn foreign_format_version_is_rejected() {
        let snapshot = SessionSnapshot {
            format_version:     SNAPSHOT_FORMAT_VERSION + 1,
            factory:            Uuid::new_v4(),
            tenant:             TenantId::Default,
            flush_mode:         FlushMode::Auto,
            cache_mode:         CacheMode::Normal,
            default_read_only:  false,
            last_sequence:      0,
            instances:          Vec::new(),
            collections:        Vec::new(),
            entries:            Vec::new(),
            collection_entries: Vec::new(),
            proxies:            Vec::new(),
            inserts:            Vec::new(),
            deletes:            Vec::new(),
            upserts:            Vec::new(),
        };
        let bytes = snapshot.to_bytes().unwrap();
        assert!(matches!(SessionSnapshot::from_bytes(&bytes), Err(OrmError::Snapshot(_))));
    }
}
