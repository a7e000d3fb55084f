use std::sync::Arc;

use super::disassemble;
use super::update::CacheGuard;
use super::ActionContext;
use super::TransactionCompletion;
use crate::error::Defect;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::mapping::EntityPersister;
use crate::types::Value;

/// Unconditional write of a replicated row.
pub(crate) struct EntityUpsertAction {
    pub(crate) entity:    EntityRef,
    pub(crate) persister: Arc<EntityPersister>,
    pub(crate) key:       EntityKey,
    pub(crate) state:     Vec<Value>,
    pub(crate) version:   Option<i64>,
}

impl EntityUpsertAction {
    pub(crate) async fn execute(
        &mut self,
        ctx: &mut ActionContext<'_>,
        completion: &mut TransactionCompletion,
    ) -> Result<()> {
        let entity_name = self.entity.entity_name();
        let row = disassemble(&self.persister, &entity_name, &self.state, ctx.context)?;
        let guard = CacheGuard::acquire(ctx, &self.persister, &self.key, None).await;
        let result = ctx.conn.upsert(&self.persister, self.key.id(), &row).await;
        if let Some(guard) = guard {
            guard.release_after_completion(completion, None);
        }
        result?;

        let Some(entry) = ctx.context.get_entry_mut(&self.entity)
        else {
            return Err(Defect::MissingEntry(format!("{:?}", self.entity)).into());
        };
        entry.post_synchronize(self.state.clone(), self.version);
        Ok(())
    }
}
