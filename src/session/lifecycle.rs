use tracing::debug;
use tracing::instrument;

use super::BoxFuture;
use super::Cascading;
use super::Session;
use crate::action::completion::force_increment;
use crate::action::BeforeCompletion;
use crate::cascade::CascadePoint;
use crate::cascade::CascadeVisit;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::storage::StoredRow;
use crate::types::Interception;
use crate::types::LockMode;
use crate::types::Value;

fn not_associated(entity: &EntityRef) -> OrmError {
    OrmError::EntityNotAssociated(format!("{entity:?}"))
}

impl Session {
    /// Re-reads the state of a managed instance, discarding unflushed changes.
    pub async fn refresh(&mut self, entity: &EntityRef) -> Result<()> {
        self.refresh_with_lock(entity, LockMode::None).await
    }

    pub async fn refresh_with_lock(&mut self, entity: &EntityRef, lock_mode: LockMode) -> Result<()> {
        let result = self.refresh_top(entity, lock_mode).await;
        self.funnel(result)
    }

    /// Obtains `lock_mode` on a managed instance. Associations configured to cascade lock get the same mode.
    pub async fn lock(&mut self, entity: &EntityRef, lock_mode: LockMode) -> Result<()> {
        let result = self.lock_top(entity, lock_mode).await;
        self.funnel(result)
    }

    /// Detaches an instance. Changes not flushed yet are lost, queued actions on it are dropped.
    pub async fn evict(&mut self, entity: &EntityRef) -> Result<()> {
        let result = self.evict_top(entity).await;
        self.funnel(result)
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn refresh_top(&mut self, entity: &EntityRef, lock_mode: LockMode) -> Result<()> {
        self.check_open()?;
        if lock_mode.is_pessimistic() {
            self.require_transaction("pessimistic locking")?;
        }
        let mut visit = CascadeVisit::default();
        self.refresh_entity(entity, lock_mode, &mut visit).await
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn lock_top(&mut self, entity: &EntityRef, lock_mode: LockMode) -> Result<()> {
        self.check_open()?;
        let mut visit = CascadeVisit::default();
        self.lock_entity(entity, lock_mode, &mut visit).await
    }

    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    async fn evict_top(&mut self, entity: &EntityRef) -> Result<()> {
        self.check_open()?;
        let mut visit = CascadeVisit::default();
        self.evict_entity(entity, &mut visit).await
    }

    /// A managed instance behind `entity`; an owned proxy gets initialized.
    async fn managed_target(&mut self, entity: &EntityRef, operation: &str) -> Result<(EntityRef, EntityKey)> {
        let entity = if entity.is_uninitialized_proxy() {
            if self.context.proxy_key(entity).is_none() {
                return Err(not_associated(entity));
            }
            self.initialize_internal(entity).await?
        }
        else {
            entity.resolve()
        };
        let Some(entry) = self.context.get_entry(&entity)
        else {
            return Err(not_associated(&entity));
        };
        if entry.status().is_deleted_or_gone() {
            return Err(OrmError::IllegalArgument(format!(
                "{operation} of a deleted instance: {entity:?}"
            )));
        }
        let Some(key) = entry.key().cloned()
        else {
            return Err(OrmError::IdentifierMissing {
                entity: entry.entity_name().to_string(),
            });
        };
        Ok((entity, key))
    }

    pub(super) fn refresh_entity<'a>(
        &'a mut self,
        entity: &'a EntityRef,
        lock_mode: LockMode,
        visit: &'a mut CascadeVisit,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !visit.first_visit(entity) {
                return Ok(());
            }
            let (entity, key) = self.managed_target(entity, "refresh").await?;
            let persister = self.persister_of(&entity)?;

            self.cascade(&persister, &entity, Cascading::Refresh, CascadePoint::All, visit)
                .await?;

            debug!("[session {}] refreshing {key}", self.id);
            if let Some(region) = self.factory.regions().region_for(&persister) {
                region
                    .evict(&region.generate_cache_key(key.id(), &persister, &self.tenant))
                    .await;
            }
            self.context.forget_database_snapshot(&key);

            let Some(row) = self.conn.load(&persister, key.id(), lock_mode).await?
            else {
                self.forget_unsaved(&entity);
                return Err(OrmError::EntityNotFound {
                    entity: key.entity_name().to_string(),
                    id:     key.id().clone(),
                });
            };

            let existing = entity.state()?;
            for collection in self.context.collections_of(&entity) {
                self.context.remove_collection(&collection);
            }
            self.context.before_load();
            let result = self.rehydrate(&entity, &key, row, &existing).await;
            self.finish_load(result).await?;

            if let Some(entry) = self.context.get_entry_mut(&entity) {
                entry.upgrade_lock_mode(lock_mode);
            }
            Ok(())
        })
    }

    async fn rehydrate(&mut self, entity: &EntityRef, key: &EntityKey, row: StoredRow, existing: &[Value]) -> Result<()> {
        let persister = self.persister(&row.entity_name)?;
        let state = self.hydrate(&persister, entity, key, &row, Some(existing)).await?;
        let state = match self
            .interceptor
            .on_load(entity, key.id(), &state, persister.property_names())
            .await
        {
            Interception::Proceed => state,
            Interception::Veto => {
                debug!("[session {}] refresh of {key} vetoed", self.id);
                return Ok(());
            }
            Interception::Rewrite(state) => Self::checked_rewrite(&persister, state)?,
        };
        entity.replace_state(state.clone());
        let version = persister.version_of(&state);
        if let Some(entry) = self.context.get_entry_mut(entity) {
            entry.post_synchronize(state, version);
        }
        Ok(())
    }

    pub(super) fn lock_entity<'a>(
        &'a mut self,
        entity: &'a EntityRef,
        lock_mode: LockMode,
        visit: &'a mut CascadeVisit,
    ) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if !visit.first_visit(entity) {
                return Ok(());
            }
            let (entity, _) = self.managed_target(entity, "lock").await?;
            if lock_mode > self.context.get_current_lock_mode(&entity)? {
                self.apply_lock(&entity, lock_mode).await?;
                if let Some(entry) = self.context.get_entry_mut(&entity) {
                    entry.upgrade_lock_mode(lock_mode);
                }
            }
            let persister = self.persister_of(&entity)?;
            self.cascade(&persister, &entity, Cascading::Lock(lock_mode), CascadePoint::All, visit)
                .await
        })
    }

    /// Performs what obtaining `lock_mode` takes. The entry's lock mode is left to the caller.
    pub(super) async fn apply_lock(&mut self, entity: &EntityRef, lock_mode: LockMode) -> Result<()> {
        let Some(entry) = self.context.get_entry(entity)
        else {
            return Err(not_associated(entity));
        };
        let persister = self.persister(entry.entity_name())?;
        let Some(key) = entry.key().cloned()
        else {
            return Err(OrmError::IdentifierMissing {
                entity: entry.entity_name().to_string(),
            });
        };
        let version = entry.version().filter(|_| persister.is_versioned());
        debug!("[session {}] obtaining {lock_mode:?} on {key}", self.id);

        match lock_mode {
            LockMode::None => Ok(()),
            LockMode::Read => {
                if persister.is_versioned() && self.conn.current_version(&persister, key.id()).await? != version {
                    return Err(OrmError::stale_object(&key));
                }
                Ok(())
            }
            LockMode::Optimistic | LockMode::OptimisticForceIncrement => {
                self.require_transaction("optimistic locking")?;
                let Some(version) = version
                else {
                    return Err(OrmError::IllegalArgument(format!(
                        "{lock_mode:?} requires a versioned entity, '{}' is not",
                        persister.entity_name()
                    )));
                };
                let process = if lock_mode == LockMode::Optimistic {
                    BeforeCompletion::VerifyVersion { persister, key, version }
                }
                else {
                    BeforeCompletion::ForceIncrement {
                        entity: entity.clone(),
                        persister,
                        key,
                        version,
                    }
                };
                self.actions.completion.register_before(process);
                Ok(())
            }
            LockMode::PessimisticRead
            | LockMode::PessimisticWrite
            | LockMode::PessimisticForceIncrement
            | LockMode::Write => {
                self.require_transaction("pessimistic locking")?;
                if self.conn.lock(&persister, key.id(), version, lock_mode).await? == 0 {
                    return Err(OrmError::stale_object(&key));
                }
                if lock_mode == LockMode::PessimisticForceIncrement {
                    let Some(version) = version
                    else {
                        return Err(OrmError::IllegalArgument(format!(
                            "{lock_mode:?} requires a versioned entity, '{}' is not",
                            persister.entity_name()
                        )));
                    };
                    let (_, mut ctx) = self.split();
                    force_increment(&mut ctx, entity, &persister, &key, version).await?;
                }
                Ok(())
            }
        }
    }

    pub(super) fn evict_entity<'a>(&'a mut self, entity: &'a EntityRef, visit: &'a mut CascadeVisit) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            if entity.is_uninitialized_proxy() {
                if let Some(key) = self.context.proxy_key(entity) {
                    debug!("[session {}] evicting proxy of {key}", self.id);
                    self.context.remove_proxy(&key);
                }
                return Ok(());
            }
            let entity = entity.resolve();
            if !visit.first_visit(&entity) {
                return Ok(());
            }
            let Some(entry) = self.context.get_entry(&entity)
            else {
                return Ok(());
            };
            let key = entry.key().cloned();
            let persister = self.persister(entry.entity_name())?;

            self.cascade(&persister, &entity, Cascading::Evict, CascadePoint::All, visit)
                .await?;

            match key {
                Some(key) => {
                    debug!("[session {}] evicting {key}", self.id);
                    self.context.remove_entity(&key);
                    self.context.remove_proxy(&key);
                }
                None => {
                    self.context.remove_entry(&entity);
                }
            }
            for collection in self.context.collections_of(&entity) {
                self.context.remove_collection(&collection);
            }
            self.actions.remove_actions_for(&entity);
            Ok(())
        })
    }
}
