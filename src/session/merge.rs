use tracing::debug;
use tracing::instrument;

use super::BoxFuture;
use super::Cascading;
use super::Session;
use crate::cascade::CascadeAction;
use crate::cascade::CascadeVisit;
use crate::cascade::MergeContext;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::mapping::EntityPersister;
use crate::mapping::PropertyKind;
use crate::types::LockMode;
use crate::types::Value;

impl Session {
    /// Copies the state of `entity` onto the managed instance with the same identifier and returns that instance.
    ///
    /// - a managed instance is returned as is, after merging the associations which cascade merge;
    /// - a detached instance is copied onto the managed one, which gets loaded if necessary;
    /// - a transient instance, or a detached one whose row is gone, is copied onto a new instance which is then
    ///   persisted.
    ///
    /// The argument itself never becomes managed unless it already was.
    pub async fn merge(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        let result = self.merge_top(entity).await;
        self.funnel(result)
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn merge_top(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        self.check_open()?;
        self.assert_no_pending_generation()?;
        let mut copies = MergeContext::default();
        let merged = self.merge_entity(entity, &mut copies).await?;
        self.check_unresolved_inserts()?;
        Ok(merged)
    }

    pub(super) fn merge_entity<'a>(
        &'a mut self,
        entity: &'a EntityRef,
        copies: &'a mut MergeContext,
    ) -> BoxFuture<'a, EntityRef> {
        Box::pin(async move {
            if let Some(copy) = copies.copy_of(entity) {
                return Ok(copy);
            }

            if entity.is_uninitialized_proxy() {
                return self.merge_reference(entity);
            }

            let entity = entity.resolve();
            if let Some(entry) = self.context.get_entry(&entity) {
                if entry.status().is_deleted_or_gone() {
                    return Err(OrmError::DeletedEntity {
                        operation: "merge",
                        entity:    format!("{entity:?}"),
                    });
                }
                let persister = self.persister(entry.entity_name())?;
                copies.record(&entity, &entity);
                self.copy_state(&persister, &entity, &entity, copies, false).await?;
                return Ok(entity);
            }

            let persister = self.persister(&entity.entity_name())?;
            let managed = match entity.id() {
                Some(id) => self.get_internal(persister.clone(), id, LockMode::None).await?,
                None => None,
            };
            match managed {
                Some(managed) => self.merge_detached(&persister, &entity, &managed, copies).await,
                None => self.merge_transient(&persister, &entity, copies).await,
            }
        })
    }

    async fn merge_detached(
        &mut self,
        persister: &EntityPersister,
        source: &EntityRef,
        managed: &EntityRef,
        copies: &mut MergeContext,
    ) -> Result<EntityRef> {
        let managed_persister = self.persister_of(managed)?;
        if **managed_persister.entity_name() != *source.entity_name() {
            return Err(OrmError::IllegalArgument(format!(
                "cannot merge {source:?} onto an instance of '{}'",
                managed_persister.entity_name()
            )));
        }

        if persister.is_versioned() {
            let source_version = persister.version_of(&source.state()?);
            let managed_version = self.context.get_entry(managed).and_then(|e| e.version());
            if source_version.is_some() && source_version != managed_version {
                let key = self.context.get_entry(managed).and_then(|e| e.key().cloned());
                if let Some(key) = key {
                    debug!(
                        "[session {}] merge of {key} rejected: version {source_version:?}, managed {managed_version:?}",
                        self.id
                    );
                    return Err(OrmError::stale_object(&key));
                }
            }
        }

        debug!("[session {}] merging detached {source:?} onto {managed:?}", self.id);
        copies.record(source, managed);
        self.copy_state(&managed_persister, source, managed, copies, false)
            .await?;
        Ok(managed.clone())
    }

    async fn merge_transient(
        &mut self,
        persister: &EntityPersister,
        source: &EntityRef,
        copies: &mut MergeContext,
    ) -> Result<EntityRef> {
        let copy = persister.instantiate();
        if persister.id_generator().is_assigned() {
            copy.set_id(source.id());
        }
        debug!("[session {}] merging transient {source:?} as a new instance", self.id);
        copies.record(source, &copy);
        self.copy_state(persister, source, &copy, copies, true).await?;

        let mut visit = CascadeVisit::default();
        self.persist_entity(&copy, Cascading::Persist, &mut visit).await?;
        Ok(copy)
    }

    /// An association value as seen from the session: the managed instance or a proxy for the same row.
    fn merge_reference(&mut self, entity: &EntityRef) -> Result<EntityRef> {
        if self.context.get_entry(entity).is_some() || self.context.proxy_key(entity).is_some() {
            return Ok(entity.resolve());
        }
        match entity.id() {
            Some(id) => {
                let persister = self.persister(&entity.entity_name())?;
                self.get_reference_internal(&persister, id)
            }
            None => Ok(entity.clone()),
        }
    }

    async fn copy_state(
        &mut self,
        persister: &EntityPersister,
        source: &EntityRef,
        target: &EntityRef,
        copies: &mut MergeContext,
        include_version: bool,
    ) -> Result<()> {
        let source_state = source.state()?;
        let mut state = target.state()?;
        for (index, prop) in persister.properties().iter().enumerate() {
            let (Some(value), Some(current)) = (source_state.get(index), state.get(index).cloned())
            else {
                continue;
            };
            let cascade_merge = prop.cascade().applies(CascadeAction::Merge);
            let merged = match prop.kind() {
                PropertyKind::Basic => value.clone(),
                PropertyKind::Version if include_version => value.clone(),
                PropertyKind::Version => current,
                PropertyKind::ManyToOne { .. } => match value {
                    Value::Entity(entity) if cascade_merge => Value::Entity(self.merge_entity(entity, copies).await?),
                    Value::Entity(entity) => Value::Entity(self.merge_reference(entity)?),
                    other => other.clone(),
                },
                PropertyKind::Collection { .. } => match value {
                    Value::Collection(collection) => {
                        let target_collection = current.as_collection().cloned();
                        self.merge_collection(collection, target_collection, cascade_merge, copies)
                            .await?
                    }
                    _ => current,
                },
            };
            state[index] = merged;
        }
        target.replace_state(state);
        Ok(())
    }

    async fn merge_collection(
        &mut self,
        source: &CollectionRef,
        target: Option<CollectionRef>,
        cascade_merge: bool,
        copies: &mut MergeContext,
    ) -> Result<Value> {
        let target = target.unwrap_or_else(|| CollectionRef::new(source.role()));
        if !source.is_initialized() {
            return Ok(Value::Collection(target));
        }

        if target == *source {
            if cascade_merge {
                for element in source.elements()? {
                    let merged = self.merge_entity(&element, copies).await?;
                    if !merged.same_target(&element) {
                        target.remove(&element);
                        target.add(merged);
                    }
                }
            }
            return Ok(Value::Collection(target));
        }

        let mut merged = Vec::new();
        for element in source.elements()? {
            merged.push(if cascade_merge {
                self.merge_entity(&element, copies).await?
            }
            else {
                self.merge_reference(&element)?
            });
        }
        self.initialize_collection_internal(&target).await?;
        for existing in target.elements()? {
            if !merged.iter().any(|m| m.same_target(&existing)) {
                target.remove(&existing);
            }
        }
        for element in merged {
            target.add(element);
        }
        Ok(Value::Collection(target))
    }
}
