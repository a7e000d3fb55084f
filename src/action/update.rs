use std::sync::Arc;
use tracing::trace;

use super::cache_entry;
use super::disassemble;
use super::ActionContext;
use super::AfterCompletion;
use super::TransactionCompletion;
use crate::cache::CacheEntry;
use crate::cache::CacheKey;
use crate::cache::CacheRegion;
use crate::cache::SoftLock;
use crate::error::Defect;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::mapping::EntityPersister;
use crate::types::Value;

/// Update of a dirty managed entity. `state` already carries the incremented version.
pub(crate) struct EntityUpdateAction {
    pub(crate) entity:           EntityRef,
    pub(crate) persister:        Arc<EntityPersister>,
    pub(crate) key:              EntityKey,
    pub(crate) state:            Vec<Value>,
    pub(crate) previous_version: Option<i64>,
    pub(crate) next_version:     Option<i64>,
    pub(crate) dirty:            Vec<usize>,
}

/// Soft lock taken on the L2 entry of a row about to be written.
pub(crate) struct CacheGuard {
    region: Arc<dyn CacheRegion>,
    key:    CacheKey,
    lock:   SoftLock,
}

impl CacheGuard {
    pub(crate) async fn acquire(
        ctx: &ActionContext<'_>,
        persister: &EntityPersister,
        key: &EntityKey,
        previous_version: Option<i64>,
    ) -> Option<Self> {
        let region = ctx.factory.regions().region_for(persister)?;
        let cache_key = region.generate_cache_key(key.id(), persister, ctx.tenant);
        let lock = region.lock_item(&cache_key, previous_version).await?;
        Some(Self {
            region,
            key: cache_key,
            lock,
        })
    }

    /// Hands the lock over to transaction completion. The staged entry is installed only if the transaction commits.
    pub(crate) fn release_after_completion(self, completion: &mut TransactionCompletion, staged: Option<CacheEntry>) {
        completion.register_after(AfterCompletion::CacheUnlock {
            region: self.region,
            key:    self.key,
            lock:   self.lock,
            staged,
        });
    }
}

impl EntityUpdateAction {
    pub(crate) async fn execute(
        &mut self,
        ctx: &mut ActionContext<'_>,
        completion: &mut TransactionCompletion,
    ) -> Result<()> {
        let entity_name = self.entity.entity_name();
        let row = disassemble(&self.persister, &entity_name, &self.state, ctx.context)?;
        trace!("updating {} properties of {}", self.dirty.len(), self.key);

        let guard = CacheGuard::acquire(ctx, &self.persister, &self.key, self.previous_version).await;
        let result = ctx
            .conn
            .update(&self.persister, self.key.id(), &row, self.previous_version)
            .await;

        let affected = match result {
            Ok(affected) => affected,
            Err(err) => {
                if let Some(guard) = guard {
                    guard.release_after_completion(completion, None);
                }
                return Err(err.into());
            }
        };
        if affected != 1 {
            if let Some(guard) = guard {
                guard.release_after_completion(completion, None);
            }
            return Err(if self.persister.is_versioned() {
                OrmError::stale_object(&self.key)
            }
            else {
                OrmError::StaleState {
                    operation: "update",
                    entity:    self.key.entity_name().to_string(),
                    id:        self.key.id().clone(),
                    actual:    affected,
                }
            });
        }

        if let Some(guard) = guard {
            let staged = ctx
                .cache_mode
                .is_put_enabled()
                .then(|| cache_entry(&self.persister, &row));
            if let Some(ref entry) = staged {
                guard.region.update(&guard.key, entry, self.previous_version).await;
            }
            guard.release_after_completion(completion, staged);
        }

        let Some(entry) = ctx.context.get_entry_mut(&self.entity)
        else {
            return Err(Defect::MissingEntry(format!("{:?}", self.entity)).into());
        };
        entry.post_synchronize(self.state.clone(), self.next_version);
        if let (Some(index), Some(version)) = (self.persister.version_index(), self.next_version) {
            self.entity.set_value(index, Value::Int(version))?;
        }
        Ok(())
    }
}
