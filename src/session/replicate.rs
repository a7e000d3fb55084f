use tracing::debug;
use tracing::instrument;

use super::BoxFuture;
use super::Cascading;
use super::Session;
use crate::action::EntityInsertAction;
use crate::action::EntityUpsertAction;
use crate::cascade::CascadePoint;
use crate::cascade::CascadeVisit;
use crate::context::CollectionEntry;
use crate::context::EntityEntry;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::mapping::EntityPersister;
use crate::types::Datum;
use crate::types::LockMode;
use crate::types::ReplicationMode;
use crate::types::Status;
use crate::types::Value;

impl Session {
    /// Makes a detached instance managed under its own identifier, writing its state whatever the storage currently
    /// holds for that identifier. `mode` decides what happens when a row already exists.
    pub async fn replicate(&mut self, entity: &EntityRef, mode: ReplicationMode) -> Result<()> {
        let result = self.replicate_top(entity, mode).await;
        self.funnel(result)
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn replicate_top(&mut self, entity: &EntityRef, mode: ReplicationMode) -> Result<()> {
        self.check_open()?;
        self.assert_no_pending_generation()?;
        let mut visit = CascadeVisit::default();
        self.replicate_entity(entity, mode, &mut visit).await?;
        self.check_unresolved_inserts()
    }

    pub(super) fn replicate_entity<'a>(
        &'a mut self,
        entity: &'a EntityRef,
        mode: ReplicationMode,
        visit: &'a mut CascadeVisit,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if entity.is_uninitialized_proxy() {
                return Ok(());
            }
            let entity = entity.resolve();
            if !visit.first_visit(&entity) {
                return Ok(());
            }

            if let Some(entry) = self.context.get_entry(&entity) {
                let persister = self.persister(entry.entity_name())?;
                return self
                    .cascade(&persister, &entity, Cascading::Replicate(mode), CascadePoint::All, visit)
                    .await;
            }

            let persister = self.persister(&entity.entity_name())?;
            let Some(id) = entity.id()
            else {
                return Err(OrmError::IdentifierMissing {
                    entity: persister.entity_name().to_string(),
                });
            };
            let key = persister.entity_key(id, &self.tenant);
            if self.context.get_entity(&key).is_some() {
                return Err(OrmError::DuplicateIdentity(key));
            }

            let existing = self.database_snapshot(&persister, &key).await?;
            let state = entity.state()?;
            let version = persister.version_of(&state);
            if let Some(ref row) = existing {
                match mode {
                    ReplicationMode::Exception => {
                        return Err(OrmError::ConstraintViolation {
                            constraint: Some(format!("pk_{}", persister.table())),
                            message:    format!("a row already exists for {key}"),
                        });
                    }
                    ReplicationMode::Ignore => {
                        debug!("[session {}] {key} exists, replication ignored", self.id);
                        return Ok(());
                    }
                    ReplicationMode::LatestVersion => {
                        let stored = persister
                            .version_index()
                            .and_then(|i| row.values.get(i))
                            .and_then(Datum::as_int);
                        if !is_newer(version, stored) {
                            debug!(
                                "[session {}] {key} holds version {stored:?}, not replacing it with {version:?}",
                                self.id
                            );
                            return Ok(());
                        }
                    }
                    ReplicationMode::Overwrite => (),
                }
            }
            let overwrite = existing.is_some();
            debug!(
                "[session {}] replicating {key} ({})",
                self.id,
                if overwrite { "overwrite" } else { "insert" }
            );

            let sequence = self.context.next_sequence();
            let entry = EntityEntry::new(
                Status::Saving,
                persister.entity_name().clone(),
                Some(key.clone()),
                state.clone(),
                version,
                LockMode::Write,
                overwrite,
                false,
                sequence,
            );
            self.context.add_entity(key.clone(), entity.clone(), entry)?;

            self.cascade(
                &persister,
                &entity,
                Cascading::Replicate(mode),
                CascadePoint::BeforeInsertAfterDelete,
                visit,
            )
            .await?;

            let state = entity.state()?;
            if overwrite {
                self.adopt_stored_collections(&persister, &entity, &key, &state).await?;
                self.actions.add_upsert(EntityUpsertAction {
                    entity:    entity.clone(),
                    persister: persister.clone(),
                    key,
                    state,
                    version,
                });
            }
            else {
                let dependencies = self.unsaved_dependencies(&persister, &entity, &state).await?;
                let action = EntityInsertAction::new(
                    entity.clone(),
                    persister.clone(),
                    Some(key.id().clone()),
                    state,
                    version,
                    sequence,
                );
                if dependencies.is_empty() {
                    self.queue_insert(action).await?;
                }
                else {
                    self.actions.add_unresolved_insert(action, dependencies);
                }
            }

            self.cascade(
                &persister,
                &entity,
                Cascading::Replicate(mode),
                CascadePoint::AfterInsertBeforeDelete,
                visit,
            )
            .await
        })
    }

    /// Collections of an overwritten row are diffed against the rows currently stored for them.
    async fn adopt_stored_collections(
        &mut self,
        persister: &EntityPersister,
        owner: &EntityRef,
        key: &EntityKey,
        state: &[Value],
    ) -> Result<()> {
        for (prop, value) in persister.properties().iter().zip(state.iter()) {
            let Some(collection) = value.as_collection()
            else {
                continue;
            };
            if !prop.is_collection() || self.context.get_collection_entry(collection).is_some() {
                continue;
            }
            let collection_persister = self
                .factory
                .metamodel()
                .collection_persister(&persister.collection_role(prop.name()))?
                .clone();
            let element_name = collection_persister.element_entity_name().clone();
            let stored: Vec<EntityRef> = self
                .conn
                .load_collection(&collection_persister, key.id())
                .await?
                .into_iter()
                .map(|id| EntityRef::new_proxy(element_name.clone(), id))
                .collect();
            let collection_key = collection_persister.collection_key(key.id().clone(), &self.tenant);
            self.context.add_collection(
                collection,
                CollectionEntry::loaded(
                    collection_persister.role().clone(),
                    owner.clone(),
                    collection_key,
                    Some(stored),
                ),
            );
            collection.mark_dirty();
        }
        Ok(())
    }
}

/// Unversioned state always counts as newer.
fn is_newer(replicated: Option<i64>, stored: Option<i64>) -> bool {
    match (replicated, stored) {
        (Some(replicated), Some(stored)) => replicated > stored,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::is_newer;

    #[test]
    fn version_comparison() {
        assert!(is_newer(Some(3), Some(2)));
        assert!(!is_newer(Some(2), Some(2)));
        assert!(is_newer(None, Some(2)));
        assert!(is_newer(Some(1), None));
    }
}
