use tracing::trace;

use super::Session;
use crate::cascade::cascade_targets;
use crate::cascade::reachable_elements;
use crate::cascade::CascadeAction;
use crate::cascade::CascadePoint;
use crate::cascade::CascadeTarget;
use crate::cascade::CascadeVisit;
use crate::error::Result;
use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::mapping::EntityPersister;
use crate::types::LockMode;
use crate::types::ReplicationMode;

/// A cascading session operation together with its arguments.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Cascading {
    Persist,
    PersistOnFlush,
    Delete,
    Refresh,
    Lock(LockMode),
    Replicate(ReplicationMode),
    Evict,
}

impl Cascading {
    pub(crate) fn action(&self) -> CascadeAction {
        match self {
            Cascading::Persist => CascadeAction::Persist,
            Cascading::PersistOnFlush => CascadeAction::PersistOnFlush,
            Cascading::Delete => CascadeAction::Delete,
            Cascading::Refresh => CascadeAction::Refresh,
            Cascading::Lock(_) => CascadeAction::Lock,
            Cascading::Replicate(_) => CascadeAction::Replicate,
            Cascading::Evict => CascadeAction::Evict,
        }
    }
}

impl Session {
    /// Applies `op` to the associations of `entity` which cascade it at `point`.
    pub(super) async fn cascade(
        &mut self,
        persister: &EntityPersister,
        entity: &EntityRef,
        op: Cascading,
        point: CascadePoint,
        visit: &mut CascadeVisit,
    ) -> Result<()> {
        let Ok(state) = entity.state()
        else {
            return Ok(());
        };
        let targets = cascade_targets(persister, &state, op.action(), point);
        if targets.is_empty() {
            return Ok(());
        }

        trace!(
            "[session {}] cascading {op:?} from {entity:?} to {} associations at {point:?}",
            self.id,
            targets.len()
        );
        self.cascade_level += 1;
        let result = self.cascade_to_targets(targets, op, visit).await;
        self.cascade_level -= 1;
        result
    }

    async fn cascade_to_targets(
        &mut self,
        targets: Vec<CascadeTarget>,
        op: Cascading,
        visit: &mut CascadeVisit,
    ) -> Result<()> {
        let action = op.action();
        for target in targets {
            match target {
                CascadeTarget::Entity { entity, .. } => {
                    if entity.is_uninitialized_proxy() && !action.requires_initialization() {
                        continue;
                    }
                    self.cascade_to(&entity, op, visit).await?;
                }
                CascadeTarget::Collection { collection, .. } => {
                    if action.requires_initialization() {
                        self.initialize_for_cascade(&collection).await?;
                    }
                    for element in reachable_elements(&collection, action) {
                        if element.is_uninitialized_proxy() && !action.requires_initialization() {
                            continue;
                        }
                        self.cascade_to(&element, op, visit).await?;
                    }
                }
            }
        }
        Ok(())
    }

    // Only a collection this session manages can be loaded.
    async fn initialize_for_cascade(&mut self, collection: &CollectionRef) -> Result<()> {
        if collection.is_initialized() || self.context.get_collection_entry(collection).is_none() {
            return Ok(());
        }
        self.initialize_collection_internal(collection).await
    }

    async fn cascade_to(&mut self, entity: &EntityRef, op: Cascading, visit: &mut CascadeVisit) -> Result<()> {
        match op {
            Cascading::Persist | Cascading::PersistOnFlush => self.persist_entity(entity, op, visit).await,
            Cascading::Delete => self.delete_entity(entity, false, visit).await,
            Cascading::Refresh => self.refresh_entity(entity, LockMode::None, visit).await,
            Cascading::Lock(lock_mode) => self.lock_entity(entity, lock_mode, visit).await,
            Cascading::Replicate(mode) => self.replicate_entity(entity, mode, visit).await,
            Cascading::Evict => self.evict_entity(entity, visit).await,
        }
    }
}
