use tracing::debug;
use tracing::instrument;
use uuid::Uuid;

use super::BoxFuture;
use super::Cascading;
use super::Session;
use crate::action::to_one_targets;
use crate::action::EntityInsertAction;
use crate::cascade::CascadePoint;
use crate::cascade::CascadeVisit;
use crate::context::EntityEntry;
use crate::error::Defect;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::mapping::EntityPersister;
use crate::mapping::IdGenerator;
use crate::types::Identifier;
use crate::types::IdentifierType;
use crate::types::Interception;
use crate::types::LockMode;
use crate::types::Status;
use crate::types::Value;

impl Session {
    /// Makes a transient instance managed and schedules its insert. Associations configured to cascade persist
    /// follow. A managed instance only cascades.
    pub async fn persist(&mut self, entity: &EntityRef) -> Result<()> {
        let result = self.persist_top(entity).await;
        self.funnel(result)
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn persist_top(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        self.assert_no_pending_generation()?;
        let mut visit = CascadeVisit::default();
        self.persist_entity(entity, Cascading::Persist, &mut visit).await?;
        self.check_unresolved_inserts()
    }

    pub(super) fn assert_no_pending_generation(&self) -> Result<()> {
        if self.cascade_level == 0 && self.actions.has_pending_generation() {
            let pending = self
                .actions
                .unresolved_inserts()
                .iter()
                .map(|u| format!("{:?}", u.action.entity))
                .collect::<Vec<_>>()
                .join(", ");
            return Err(Defect::UnresolvedAction(pending).into());
        }
        Ok(())
    }

    pub(super) fn persist_entity<'a>(
        &'a mut self,
        entity: &'a EntityRef,
        op: Cascading,
        visit: &'a mut CascadeVisit,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let entity = entity.resolve();
            if !visit.first_visit(&entity) {
                return Ok(());
            }

            if let Some(entry) = self.context.get_entry(&entity) {
                if entry.status().is_deleted_or_gone() {
                    return Err(OrmError::DeletedEntity {
                        operation: "persist",
                        entity:    format!("{entity:?}"),
                    });
                }
                let persister = self.persister(entry.entity_name())?;
                return self.cascade(&persister, &entity, op, CascadePoint::All, visit).await;
            }

            if entity.is_uninitialized_proxy() {
                return match self.context.proxy_key(&entity) {
                    Some(_) => Ok(()),
                    None => Err(OrmError::DetachedEntity(format!("{entity:?}"))),
                };
            }

            self.save_transient(&entity, op, visit).await
        })
    }

    async fn generate_id(&mut self, persister: &EntityPersister, entity: &EntityRef) -> Result<Option<Identifier>> {
        let generation_error = |reason: String| OrmError::IdentifierGeneration {
            entity: persister.entity_name().to_string(),
            reason,
        };
        match (persister.id_generator(), entity.id()) {
            (_, Some(id)) if !persister.check_identifier_kind(&id) => Err(generation_error(format!(
                "identifier {id} is not of type {:?}",
                persister.id_type()
            ))),
            (IdGenerator::Assigned, Some(id)) => Ok(Some(id)),
            (IdGenerator::Assigned, None) => Err(generation_error(
                "identifiers of this entity must be assigned before calling persist".into(),
            )),
            (_, Some(_)) => Err(OrmError::DetachedEntity(format!("{entity:?}"))),
            (IdGenerator::Sequence, None) => Ok(Some(self.conn.next_id(persister).await?)),
            (IdGenerator::Uuid, None) => match persister.id_type() {
                IdentifierType::Text => Ok(Some(Identifier::Text(Uuid::new_v4().to_string()))),
                IdentifierType::Int => Err(generation_error("UUID identifiers require a text identifier".into())),
            },
            (IdGenerator::Identity, None) => Ok(None),
        }
    }

    async fn save_transient(&mut self, entity: &EntityRef, op: Cascading, visit: &mut CascadeVisit) -> Result<()> {
        let persister = self.persister(&entity.entity_name())?;
        let id = self.generate_id(&persister, entity).await?;
        let generated = !persister.id_generator().is_assigned() && id.is_some();
        if generated {
            entity.set_id(id.clone());
        }
        let key = id.clone().map(|id| persister.entity_key(id, &self.tenant));
        debug!("[session {}] saving transient {entity:?}", self.id);

        let sequence = self.context.next_sequence();
        let entry = EntityEntry::new(
            Status::Saving,
            persister.entity_name().clone(),
            key.clone(),
            entity.state()?,
            None,
            LockMode::Write,
            false,
            false,
            sequence,
        );
        match key {
            Some(ref key) => {
                if let Err(err) = self.context.add_entity(key.clone(), entity.clone(), entry) {
                    if generated {
                        entity.set_id(None);
                    }
                    return Err(err);
                }
            }
            None => self.context.add_entry(entity, entry),
        }

        self.cascade(&persister, entity, op, CascadePoint::BeforeInsertAfterDelete, visit)
            .await?;

        let state = entity.state()?;
        match self
            .interceptor
            .on_save(entity, id.as_ref(), &state, persister.property_names())
            .await
        {
            Interception::Veto => {
                debug!("[session {}] save of {entity:?} vetoed", self.id);
                self.forget_unsaved(entity);
                if generated {
                    entity.set_id(None);
                }
                return Ok(());
            }
            Interception::Rewrite(state) => entity.replace_state(Self::checked_rewrite(&persister, state)?),
            Interception::Proceed => (),
        }

        let mut state = entity.state()?;
        let version = match persister.version_index() {
            Some(index) => {
                let seed = state.get(index).and_then(Value::as_int).unwrap_or(0);
                state[index] = Value::Int(seed);
                entity.set_value(index, Value::Int(seed))?;
                Some(seed)
            }
            None => None,
        };
        if let Some(entry) = self.context.get_entry_mut(entity) {
            entry.set_loaded_state(state.clone());
            entry.set_version(version);
        }

        let early_insert = id.is_none();
        if !early_insert {
            self.cascade(&persister, entity, op, CascadePoint::AfterInsertBeforeDelete, visit)
                .await?;
            state = entity.state()?;
        }

        let dependencies = self.unsaved_dependencies(&persister, entity, &state).await?;
        let action = EntityInsertAction::new(entity.clone(), persister.clone(), id, state, version, sequence);
        if dependencies.is_empty() {
            self.queue_insert(action).await?;
        }
        else {
            self.actions.add_unresolved_insert(action, dependencies);
        }

        if early_insert {
            self.cascade(&persister, entity, op, CascadePoint::AfterInsertBeforeDelete, visit)
                .await?;
        }
        Ok(())
    }

    pub(super) async fn unsaved_dependencies(
        &mut self,
        persister: &EntityPersister,
        entity: &EntityRef,
        state: &[Value],
    ) -> Result<Vec<EntityRef>> {
        let mut unsaved = Vec::new();
        for target in to_one_targets(persister, state) {
            if !target.same_target(entity) && self.is_unsaved(&target).await? {
                unsaved.push(target);
            }
        }
        Ok(unsaved)
    }

    /// Queues an insert. Inserts waiting for the entity are queued next. An insert without an identifier executes
    /// right away, after everything queued before it.
    pub(super) fn queue_insert(&mut self, action: EntityInsertAction) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let entity = action.entity.clone();
            let early = action.id.is_none();
            self.actions.add_insert(action);
            if early {
                let (actions, mut ctx) = self.split();
                actions.execute_inserts(&mut ctx).await?;
            }
            for resolved in self.actions.resolve_dependency(&entity) {
                self.queue_insert(resolved).await?;
            }
            Ok(())
        })
    }

    /// Inserts still waiting for transient instances when a top-level operation ends can never run.
    pub(super) fn check_unresolved_inserts(&mut self) -> Result<()> {
        let Some(unresolved) = self.actions.unresolved_inserts().first()
        else {
            return Ok(());
        };
        let action = &unresolved.action;
        let property = action
            .persister
            .properties()
            .iter()
            .zip(action.state.iter())
            .find(|(_, value)| {
                value
                    .as_entity()
                    .is_some_and(|e| unresolved.dependencies.iter().any(|d| d.same_target(e)))
            })
            .map(|(prop, _)| prop.name().to_string())
            .unwrap_or_default();
        let err = OrmError::TransientReference {
            entity: action.persister.entity_name().to_string(),
            property,
        };

        let pending: Vec<EntityRef> = self
            .actions
            .unresolved_inserts()
            .iter()
            .map(|u| u.action.entity.clone())
            .collect();
        self.actions.clear_unresolved();
        for entity in pending {
            self.forget_unsaved(&entity);
        }
        Err(err)
    }
}
