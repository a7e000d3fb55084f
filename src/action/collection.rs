use std::sync::Arc;
use tracing::trace;

use super::reference_id;
use super::ActionContext;
use crate::cascade::orphans;
use crate::context::PersistenceContext;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::instance::QueuedOperation;
use crate::key::CollectionKey;
use crate::mapping::CollectionPersister;
use crate::types::Identifier;

fn element_ids(
    persister: &CollectionPersister,
    elements: &[EntityRef],
    context: &PersistenceContext,
) -> Result<Vec<Identifier>> {
    elements
        .iter()
        .map(|e| {
            reference_id(e, context).ok_or_else(|| OrmError::TransientReference {
                entity:   persister.owner_entity_name().to_string(),
                property: persister.role().to_string(),
            })
        })
        .collect()
}

/// Writes every element row of a collection the storage doesn't hold yet.
pub(crate) struct CollectionRecreateAction {
    pub(crate) persister:  Arc<CollectionPersister>,
    pub(crate) collection: CollectionRef,
    pub(crate) key:        CollectionKey,
}

impl CollectionRecreateAction {
    pub(crate) async fn execute(self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let elements = match self.collection.elements() {
            Ok(elements) => elements,
            Err(_) => self
                .collection
                .take_queued()
                .into_iter()
                .filter_map(|op| match op {
                    QueuedOperation::Add(e) => Some(e),
                    QueuedOperation::Remove(_) => None,
                })
                .collect(),
        };
        let ids = element_ids(&self.persister, &elements, ctx.context)?;
        trace!("recreating {} with {} rows", self.key, ids.len());
        if !ids.is_empty() {
            ctx.conn
                .insert_collection_rows(&self.persister, self.key.owner_id(), &ids)
                .await?;
        }
        Ok(())
    }
}

/// Removes every element row stored under a collection key.
pub(crate) struct CollectionRemoveAction {
    pub(crate) persister: Arc<CollectionPersister>,
    pub(crate) key:       CollectionKey,
}

impl CollectionRemoveAction {
    pub(crate) async fn execute(self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let removed = ctx
            .conn
            .remove_collection(&self.persister, self.key.owner_id())
            .await?;
        trace!("removed {removed} rows of {}", self.key);
        Ok(())
    }
}

/// Writes the difference between a collection's snapshot and its current elements.
pub(crate) struct CollectionUpdateAction {
    pub(crate) persister:  Arc<CollectionPersister>,
    pub(crate) collection: CollectionRef,
    pub(crate) key:        CollectionKey,
    pub(crate) snapshot:   Vec<EntityRef>,
}

impl CollectionUpdateAction {
    pub(crate) async fn execute(self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let (added, removed) = match self.collection.elements() {
            Ok(current) => (orphans(&current, &self.snapshot), orphans(&self.snapshot, &current)),
            Err(_) => {
                let mut added = Vec::new();
                let mut removed = Vec::new();
                for op in self.collection.take_queued() {
                    match op {
                        QueuedOperation::Add(e) => {
                            removed.retain(|r: &EntityRef| !r.same_target(&e));
                            added.push(e);
                        }
                        QueuedOperation::Remove(e) => {
                            added.retain(|a: &EntityRef| !a.same_target(&e));
                            removed.push(e);
                        }
                    }
                }
                (added, removed)
            }
        };
        trace!(
            "updating {}: {} rows added, {} removed",
            self.key,
            added.len(),
            removed.len()
        );

        if !removed.is_empty() {
            let ids = element_ids(&self.persister, &removed, ctx.context)?;
            ctx.conn
                .delete_collection_rows(&self.persister, self.key.owner_id(), &ids)
                .await?;
        }
        if !added.is_empty() {
            let ids = element_ids(&self.persister, &added, ctx.context)?;
            ctx.conn
                .insert_collection_rows(&self.persister, self.key.owner_id(), &ids)
                .await?;
        }
        Ok(())
    }
}
