use std::collections::BTreeSet;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use super::Cascading;
use super::Session;
use crate::action::CollectionRecreateAction;
use crate::action::CollectionRemoveAction;
use crate::action::CollectionUpdateAction;
use crate::action::EntityUpdateAction;
use crate::cascade::orphan_collections;
use crate::cascade::orphans;
use crate::cascade::CascadePoint;
use crate::cascade::CascadeVisit;
use crate::context::CollectionEntry;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::instance::QueuedOperation;
use crate::mapping::EntityPersister;
use crate::mapping::PropertyKind;
use crate::types::FlushMode;
use crate::types::Interception;
use crate::types::Status;
use crate::types::Value;

/// Entities a flush has to look at: managed ones and those whose insert is queued.
fn is_flushable(status: Status) -> bool {
    matches!(status, Status::Managed | Status::Saving)
}

impl Session {
    /// Synchronizes the session state with the storage: computes the pending updates and executes every queued
    /// action in dependency order.
    pub async fn flush(&mut self) -> Result<()> {
        let result = self.flush_top().await;
        self.funnel(result)
    }

    async fn flush_top(&mut self) -> Result<()> {
        self.check_open()?;
        self.require_transaction("flush")?;
        self.flush_internal().await
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub(super) async fn flush_internal(&mut self) -> Result<()> {
        if self.rollback_only {
            return Err(OrmError::RollbackOnly);
        }
        self.plan_flush().await?;
        self.execute_flush().await
    }

    /// Flushes before a query over `spaces` when queued work touches them. Returns whether it did.
    pub(super) async fn auto_flush_if_required(&mut self, spaces: &BTreeSet<String>, flush_mode: FlushMode) -> Result<bool> {
        if !self.transaction_active || self.rollback_only {
            return Ok(false);
        }
        match flush_mode {
            FlushMode::Manual | FlushMode::Commit => Ok(false),
            FlushMode::Always => {
                self.flush_internal().await?;
                Ok(true)
            }
            FlushMode::Auto => {
                self.plan_flush().await?;
                if self.actions.are_tables_to_be_updated(spaces) {
                    debug!("[session {}] auto-flush: pending changes touch {spaces:?}", self.id);
                    self.execute_flush().await?;
                    Ok(true)
                }
                else {
                    trace!("[session {}] auto-flush not needed for {spaces:?}", self.id);
                    self.actions.clear_from_flush_needed_check();
                    self.reset_reached_collections();
                    Ok(false)
                }
            }
        }
    }

    /// Everything a flush does before statements run: flush-time cascades, orphan removal, dirty checking and
    /// collection bookkeeping.
    #[instrument(level = "trace", skip(self), fields(session = %self.id))]
    async fn plan_flush(&mut self) -> Result<()> {
        let entities = self.context.entities_in_order();
        self.interceptor.pre_flush(&entities).await;

        self.cascade_on_flush(&entities).await?;
        self.remove_orphans().await?;
        self.check_unresolved_inserts()?;
        self.schedule_updates().await?;
        self.schedule_collection_actions()?;

        trace!(
            "[session {}] flush planned: {} inserts, {} updates, {} deletes, {} collection actions",
            self.id,
            self.actions.insertion_count(),
            self.actions.update_count(),
            self.actions.deletion_count(),
            self.actions.collection_action_count()
        );
        Ok(())
    }

    async fn cascade_on_flush(&mut self, entities: &[EntityRef]) -> Result<()> {
        let mut visit = CascadeVisit::default();
        for entity in entities {
            let Some(entry) = self.context.get_entry(entity)
            else {
                continue;
            };
            if !is_flushable(entry.status()) {
                continue;
            }
            let persister = self.persister(entry.entity_name())?;
            visit.first_visit(entity);
            self.cascade(&persister, entity, Cascading::PersistOnFlush, CascadePoint::All, &mut visit)
                .await?;
        }
        Ok(())
    }

    async fn remove_orphans(&mut self) -> Result<()> {
        let mut found: Vec<EntityRef> = Vec::new();

        for entity in self.context.entities_in_order() {
            let Some(entry) = self.context.get_entry(&entity)
            else {
                continue;
            };
            if !is_flushable(entry.status()) {
                continue;
            }
            let persister = self.persister(entry.entity_name())?;
            for collection in orphan_collections(&persister, &entity.state()?) {
                let Some(snapshot) = self
                    .context
                    .get_collection_entry(&collection)
                    .and_then(|e| e.snapshot().map(<[EntityRef]>::to_vec))
                else {
                    continue;
                };
                match collection.elements() {
                    Ok(current) => found.extend(orphans(&snapshot, &current)),
                    Err(_) => found.extend(collection.queued_operations().into_iter().filter_map(|op| match op {
                        QueuedOperation::Remove(e) => Some(e),
                        QueuedOperation::Add(_) => None,
                    })),
                }
            }
        }

        // A replaced collection orphans everything it held.
        for collection in self.context.collections() {
            let Some(entry) = self.context.get_collection_entry(&collection)
            else {
                continue;
            };
            let collection_persister = self.factory.metamodel().collection_persister(entry.role())?;
            if !collection_persister.has_orphan_delete() {
                continue;
            }
            let owner = entry.owner().clone();
            let owner_flushable = self
                .context
                .get_entry(&owner)
                .is_some_and(|e| is_flushable(e.status()));
            if !owner_flushable {
                continue;
            }
            let still_referenced = owner
                .value(collection_persister.property_index())
                .is_ok_and(|v| v.as_collection() == Some(&collection));
            if !still_referenced {
                found.extend(entry.snapshot().map(<[EntityRef]>::to_vec).unwrap_or_default());
            }
        }

        let mut visit = CascadeVisit::default();
        for orphan in found {
            let orphan = orphan.resolve();
            let managed = self
                .context
                .get_entry(&orphan)
                .is_some_and(|e| !e.status().is_deleted_or_gone());
            if managed {
                debug!("[session {}] deleting orphan {orphan:?}", self.id);
                self.delete_entity(&orphan, true, &mut visit).await?;
            }
        }
        Ok(())
    }

    async fn schedule_updates(&mut self) -> Result<()> {
        for entity in self.context.entities_in_order() {
            let Some(entry) = self.context.get_entry(&entity)
            else {
                continue;
            };
            if !is_flushable(entry.status()) || entry.is_read_only() {
                continue;
            }
            let Some(key) = entry.key().cloned()
            else {
                continue;
            };
            let persister = self.persister(entry.entity_name())?;
            let previous = entry.loaded_state().to_vec();
            let previous_version = entry.version();

            let mut state = entity.state()?;
            if dirty_properties(&persister, &state, &previous).is_empty() {
                continue;
            }

            match self
                .interceptor
                .on_flush_dirty(&entity, key.id(), &state, &previous, persister.property_names())
                .await
            {
                Interception::Proceed => (),
                Interception::Veto => {
                    debug!("[session {}] update of {key} vetoed", self.id);
                    continue;
                }
                Interception::Rewrite(rewritten) => {
                    state = Self::checked_rewrite(&persister, rewritten)?;
                    entity.replace_state(state.clone());
                }
            }
            let dirty = dirty_properties(&persister, &state, &previous);
            if dirty.is_empty() {
                continue;
            }

            let next_version = persister.version_index().map(|index| {
                let next = previous_version.unwrap_or(0) + 1;
                state[index] = Value::Int(next);
                next
            });
            trace!("[session {}] {key} is dirty: properties {dirty:?}", self.id);
            self.actions.add_update(EntityUpdateAction {
                entity: entity.clone(),
                persister,
                key,
                state,
                previous_version,
                next_version,
                dirty,
            });
        }
        Ok(())
    }

    fn schedule_collection_actions(&mut self) -> Result<()> {
        for entity in self.context.entities_in_order() {
            let Some(entry) = self.context.get_entry(&entity)
            else {
                continue;
            };
            if !is_flushable(entry.status()) {
                continue;
            }
            let Some(owner_id) = entry.id().cloned()
            else {
                continue;
            };
            let persister = self.persister(entry.entity_name())?;
            for (prop, value) in persister.properties().iter().zip(entity.state()?.iter()) {
                let Value::Collection(collection) = value
                else {
                    continue;
                };
                let role = persister.collection_role(prop.name());
                let collection_persister = self.factory.metamodel().collection_persister(&role)?.clone();
                if self.context.get_collection_entry(collection).is_none() {
                    self.context.add_collection(
                        collection,
                        CollectionEntry::new_collection(collection_persister.role().clone(), entity.clone()),
                    );
                }
                let current_key = collection_persister.collection_key(owner_id.clone(), &self.tenant);
                if let Some(collection_entry) = self.context.get_collection_entry_mut(collection) {
                    collection_entry.reach(current_key);
                }
            }
        }

        for collection in self.context.collections() {
            let Some(entry) = self.context.get_collection_entry(&collection)
            else {
                continue;
            };
            let owner_deleted = self
                .context
                .get_entry(entry.owner())
                .is_none_or(|e| e.status().is_deleted_or_gone());
            let collection_persister = self.factory.metamodel().collection_persister(entry.role())?.clone();

            let Some(entry) = self.context.get_collection_entry_mut(&collection)
            else {
                continue;
            };
            entry.prepare_for_flush(&collection, owner_deleted);

            if entry.does_remove() {
                if let Some(key) = entry.loaded_key().cloned() {
                    self.actions.add_collection_removal(CollectionRemoveAction {
                        persister: collection_persister.clone(),
                        key,
                    });
                }
            }
            if entry.does_update() {
                if let Some(key) = entry.current_key().cloned() {
                    self.actions.add_collection_update(CollectionUpdateAction {
                        persister: collection_persister.clone(),
                        collection: collection.clone(),
                        key,
                        snapshot: entry.snapshot().map(<[EntityRef]>::to_vec).unwrap_or_default(),
                    });
                }
            }
            if entry.does_recreate() {
                if let Some(key) = entry.current_key().cloned() {
                    self.actions.add_collection_creation(CollectionRecreateAction {
                        persister: collection_persister,
                        collection: collection.clone(),
                        key,
                    });
                }
            }
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self), fields(session = %self.id))]
    async fn execute_flush(&mut self) -> Result<()> {
        let (actions, mut ctx) = self.split();
        let result = actions.execute_actions(&mut ctx).await;
        if let Err(err) = result {
            debug!("[session {}] flush failed: {err}", self.id);
            self.reset_reached_collections();
            return Err(err);
        }

        for collection in self.context.collections() {
            let Some(entry) = self.context.get_collection_entry(&collection)
            else {
                continue;
            };
            let owner_gone = self
                .context
                .get_entry(entry.owner())
                .is_none_or(|e| e.status().is_deleted_or_gone());
            if owner_gone || !entry.is_reached() {
                self.context.remove_collection(&collection);
                continue;
            }
            if let Some(entry) = self.context.get_collection_entry_mut(&collection) {
                entry.post_flush(&collection);
            }
            self.context.reindex_collection(&collection);
        }
        self.context.clear_database_snapshots();

        let entities = self.context.entities_in_order();
        self.interceptor.post_flush(&entities).await;
        Ok(())
    }

    fn reset_reached_collections(&mut self) {
        for collection in self.context.collections() {
            if let Some(entry) = self.context.get_collection_entry_mut(&collection) {
                entry.reset_reached();
            }
        }
    }
}

/// Indices of the properties whose value differs from the stored one. Collections are tracked by their own entries
/// and the version is maintained by the session.
fn dirty_properties(persister: &EntityPersister, state: &[Value], previous: &[Value]) -> Vec<usize> {
    persister
        .properties()
        .iter()
        .enumerate()
        .filter(|(_, prop)| matches!(prop.kind(), PropertyKind::Basic | PropertyKind::ManyToOne { .. }))
        .filter(|(index, _)| state.get(*index) != previous.get(*index))
        .map(|(index, _)| index)
        .collect()
}
