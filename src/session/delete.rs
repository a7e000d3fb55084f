use tracing::debug;
use tracing::instrument;

use super::BoxFuture;
use super::Cascading;
use super::Session;
use crate::action::EntityDeleteAction;
use crate::cascade::CascadePoint;
use crate::cascade::CascadeVisit;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::types::Interception;

impl Session {
    /// Schedules removal of a managed instance. An uninitialized proxy owned by this session is loaded first. A
    /// transient instance is ignored; a detached one is an error.
    pub async fn delete(&mut self, entity: &EntityRef) -> Result<()> {
        let result = self.delete_top(entity).await;
        self.funnel(result)
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn delete_top(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        let mut visit = CascadeVisit::default();
        self.delete_entity(entity, false, &mut visit).await
    }

    pub(super) fn delete_entity<'a>(
        &'a mut self,
        entity: &'a EntityRef,
        orphan: bool,
        visit: &'a mut CascadeVisit,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let entity = if entity.is_uninitialized_proxy() {
                if self.context.proxy_key(entity).is_none() {
                    return Err(OrmError::IllegalArgument(format!(
                        "uninitialized proxy {entity:?} is not associated with this session"
                    )));
                }
                self.initialize_internal(entity).await?
            }
            else {
                entity.resolve()
            };
            if !visit.first_visit(&entity) {
                return Ok(());
            }

            let Some(entry) = self.context.get_entry(&entity)
            else {
                return self.delete_unassociated(&entity).await;
            };
            if entry.status().is_deleted_or_gone() {
                return Ok(());
            }
            let persister = self.persister(entry.entity_name())?;
            let exists_in_database = entry.exists_in_database();
            let key = entry.key().cloned();
            let version = entry.version();

            let state = entity.state()?;
            if let Some(ref key) = key {
                if let Interception::Veto = self
                    .interceptor
                    .on_delete(&entity, key.id(), &state, persister.property_names())
                    .await
                {
                    debug!("[session {}] delete of {entity:?} vetoed", self.id);
                    return Ok(());
                }
            }

            self.cascade(&persister, &entity, Cascading::Delete, CascadePoint::AfterInsertBeforeDelete, visit)
                .await?;

            match key {
                Some(key) if exists_in_database || !self.actions.is_insert_queued(&entity) => {
                    let sequence = self.context.get_entry(&entity).map_or(0, |e| e.sequence());
                    if let Some(entry) = self.context.get_entry_mut(&entity) {
                        entry.mark_deleted(state.clone(), orphan);
                    }
                    debug!("[session {}] scheduling delete of {key}", self.id);
                    self.actions.add_delete(EntityDeleteAction {
                        entity: entity.clone(),
                        persister: persister.clone(),
                        key,
                        version,
                        state,
                        orphan_before_updates: orphan,
                        sequence,
                    });
                }
                _ => {
                    debug!("[session {}] {entity:?} was never inserted, forgetting it", self.id);
                    self.forget_unsaved(&entity);
                }
            }

            self.cascade(&persister, &entity, Cascading::Delete, CascadePoint::BeforeInsertAfterDelete, visit)
                .await
        })
    }

    /// A transient instance needs no delete. One whose row exists belongs to another session or to none.
    async fn delete_unassociated(&mut self, entity: &EntityRef) -> Result<()> {
        let Some(id) = entity.id()
        else {
            debug!("[session {}] ignoring delete of transient {entity:?}", self.id);
            return Ok(());
        };
        let persister = self.persister(&entity.entity_name())?;
        let key = persister.entity_key(id, &self.tenant);
        if self.context.get_entity(&key).is_some() || self.database_snapshot(&persister, &key).await?.is_some() {
            return Err(OrmError::IllegalArgument(format!(
                "detached instance passed to delete: {entity:?}"
            )));
        }
        Ok(())
    }
}
