use std::sync::Arc;
use tracing::debug;

use super::update::CacheGuard;
use super::ActionContext;
use super::TransactionCompletion;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::mapping::EntityPersister;
use crate::types::Value;

/// Delete of a removed entity. Orphan removals scheduled before updates run ahead of every insert.
pub(crate) struct EntityDeleteAction {
    pub(crate) entity:                EntityRef,
    pub(crate) persister:             Arc<EntityPersister>,
    pub(crate) key:                   EntityKey,
    pub(crate) version:               Option<i64>,
    // State at the time of the delete; used for ordering against other deletes.
    pub(crate) state:                 Vec<Value>,
    pub(crate) orphan_before_updates: bool,
    pub(crate) sequence:              u64,
}

impl EntityDeleteAction {
    pub(crate) async fn execute(
        &mut self,
        ctx: &mut ActionContext<'_>,
        completion: &mut TransactionCompletion,
    ) -> Result<()> {
        let guard = CacheGuard::acquire(ctx, &self.persister, &self.key, self.version).await;
        let result = ctx.conn.delete(&self.persister, self.key.id(), self.version).await;
        if let Some(guard) = guard {
            guard.release_after_completion(completion, None);
        }
        let affected = result?;
        if affected != 1 {
            return Err(if self.persister.is_versioned() {
                OrmError::stale_object(&self.key)
            }
            else {
                OrmError::StaleState {
                    operation: "delete",
                    entity:    self.key.entity_name().to_string(),
                    id:        self.key.id().clone(),
                    actual:    affected,
                }
            });
        }

        debug!("deleted {}", self.key);
        if let Some(entry) = ctx.context.get_entry_mut(&self.entity) {
            entry.mark_gone();
        }
        ctx.context.remove_entity(&self.key);
        ctx.context.remove_proxy(&self.key);
        Ok(())
    }
}
