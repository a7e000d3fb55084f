use std::sync::Arc;
use tracing::debug;

use super::cache_entry;
use super::disassemble;
use super::ActionContext;
use super::AfterCompletion;
use super::TransactionCompletion;
use crate::error::Defect;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::mapping::EntityPersister;
use crate::types::Identifier;
use crate::types::Value;

/// Insert of a newly persisted entity.
pub(crate) struct EntityInsertAction {
    pub(crate) entity:    EntityRef,
    pub(crate) persister: Arc<EntityPersister>,
    // Absent until the storage generates it.
    pub(crate) id:        Option<Identifier>,
    pub(crate) state:     Vec<Value>,
    pub(crate) version:   Option<i64>,
    pub(crate) sequence:  u64,
}

impl EntityInsertAction {
    pub(crate) fn new(
        entity: EntityRef,
        persister: Arc<EntityPersister>,
        id: Option<Identifier>,
        state: Vec<Value>,
        version: Option<i64>,
        sequence: u64,
    ) -> Self {
        Self {
            entity,
            persister,
            id,
            state,
            version,
            sequence,
        }
    }

    pub(crate) async fn execute(
        &mut self,
        ctx: &mut ActionContext<'_>,
        completion: &mut TransactionCompletion,
    ) -> Result<()> {
        let entity_name = self.entity.entity_name();
        let row = disassemble(&self.persister, &entity_name, &self.state, ctx.context)?;
        let id = ctx.conn.insert(&self.persister, self.id.as_ref(), &row).await?;

        if self.id.is_none() {
            debug!("storage generated identifier {id} for {:?}", self.entity);
            self.entity.set_id(Some(id.clone()));
            ctx.context
                .bind_key(&self.entity, self.persister.entity_key(id.clone(), ctx.tenant))?;
            self.id = Some(id.clone());
        }

        let Some(entry) = ctx.context.get_entry_mut(&self.entity)
        else {
            return Err(Defect::MissingEntry(format!("{:?}", self.entity)).into());
        };
        entry.post_synchronize(self.state.clone(), self.version);

        if ctx.cache_mode.is_put_enabled() {
            if let Some(region) = ctx.factory.regions().region_for(&self.persister) {
                let key = region.generate_cache_key(&id, &self.persister, ctx.tenant);
                let entry = cache_entry(&self.persister, &row);
                region.insert(&key, &entry).await;
                completion.register_after(AfterCompletion::CacheAfterInsert { region, key, entry });
            }
        }
        Ok(())
    }
}
