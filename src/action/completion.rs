use std::fmt::Debug;
use std::sync::Arc;
use tracing::debug;
use tracing::trace;

use super::ActionContext;
use crate::cache::CacheEntry;
use crate::cache::CacheKey;
use crate::cache::CacheRegion;
use crate::cache::SoftLock;
use crate::error::OrmError;
use crate::error::Result;
use crate::instance::EntityRef;
use crate::key::EntityKey;
use crate::mapping::EntityPersister;
use crate::types::Value;

/// Work done right before the storage transaction commits.
pub(crate) enum BeforeCompletion {
    /// Fails the commit if the row version moved since it was read.
    VerifyVersion {
        persister: Arc<EntityPersister>,
        key:       EntityKey,
        version:   i64,
    },
    /// Bumps the row version even though the entity itself didn't change.
    ForceIncrement {
        entity:    EntityRef,
        persister: Arc<EntityPersister>,
        key:       EntityKey,
        version:   i64,
    },
}

/// Work done once the transaction outcome is known. Runs on commit and on rollback alike.
pub(crate) enum AfterCompletion {
    /// Releases a soft lock, installing the staged entry first if the transaction committed.
    CacheUnlock {
        region: Arc<dyn CacheRegion>,
        key:    CacheKey,
        lock:   SoftLock,
        staged: Option<CacheEntry>,
    },
    CacheAfterInsert {
        region: Arc<dyn CacheRegion>,
        key:    CacheKey,
        entry:  CacheEntry,
    },
}

impl Debug for AfterCompletion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AfterCompletion::CacheUnlock { region, key, lock, staged } => f
                .debug_struct("CacheUnlock")
                .field("region", &region.name())
                .field("key", key)
                .field("lock", &lock.id())
                .field("staged", &staged.is_some())
                .finish(),
            AfterCompletion::CacheAfterInsert { region, key, .. } => f
                .debug_struct("CacheAfterInsert")
                .field("region", &region.name())
                .field("key", key)
                .finish(),
        }
    }
}

#[derive(Default)]
pub(crate) struct TransactionCompletion {
    before: Vec<BeforeCompletion>,
    after:  Vec<AfterCompletion>,
}

impl TransactionCompletion {
    pub(crate) fn register_before(&mut self, process: BeforeCompletion) {
        self.before.push(process);
    }

    pub(crate) fn register_after(&mut self, process: AfterCompletion) {
        self.after.push(process);
    }

    pub(crate) fn has_before_processes(&self) -> bool {
        !self.before.is_empty()
    }

    pub(crate) fn after_process_count(&self) -> usize {
        self.after.len()
    }

    /// Runs and drops every before-completion process. The first failure stops the rest.
    pub(crate) async fn before_completion(&mut self, ctx: &mut ActionContext<'_>) -> Result<()> {
        for process in std::mem::take(&mut self.before) {
            match process {
                BeforeCompletion::VerifyVersion {
                    persister,
                    key,
                    version,
                } => {
                    let current = ctx.conn.current_version(&persister, key.id()).await?;
                    if current != Some(version) {
                        debug!("version check failed for {key}: expected {version}, found {current:?}");
                        return Err(OrmError::stale_object(&key));
                    }
                }
                BeforeCompletion::ForceIncrement {
                    entity,
                    persister,
                    key,
                    version,
                } => {
                    force_increment(ctx, &entity, &persister, &key, version).await?;
                }
            }
        }
        Ok(())
    }

    /// Runs every after-completion process exactly once.
    pub(crate) async fn after_completion(&mut self, success: bool) {
        for process in std::mem::take(&mut self.after) {
            match process {
                AfterCompletion::CacheUnlock {
                    region,
                    key,
                    lock,
                    staged,
                } => {
                    if success {
                        if let Some(entry) = staged {
                            let written = region.after_update(&key, entry, &lock).await;
                            trace!("[{}] after update of {key}: written={written}", region.name());
                        }
                    }
                    region.unlock_item(&key, lock).await;
                }
                AfterCompletion::CacheAfterInsert { region, key, entry } => {
                    if success {
                        region.after_insert(&key, entry).await;
                    }
                }
            }
        }
    }

    /// Drops before-completion work; after-completion work must still run.
    pub(crate) fn discard_before(&mut self) {
        self.before.clear();
    }
}

/// Increments the stored version of `key` from `version` and mirrors the new value into the entity.
pub(crate) async fn force_increment(
    ctx: &mut ActionContext<'_>,
    entity: &EntityRef,
    persister: &EntityPersister,
    key: &EntityKey,
    version: i64,
) -> Result<i64> {
    let next = version + 1;
    let affected = ctx.conn.set_version(persister, key.id(), Some(version), next).await?;
    if affected != 1 {
        return Err(OrmError::stale_object(key));
    }
    if let Some(index) = persister.version_index() {
        entity.set_value(index, Value::Int(next))?;
        if let Some(entry) = ctx.context.get_entry_mut(entity) {
            let mut loaded = entry.loaded_state().to_vec();
            if let Some(slot) = loaded.get_mut(index) {
                *slot = Value::Int(next);
            }
            entry.set_loaded_state(loaded);
            entry.set_version(Some(next));
        }
    }
    if let Some(region) = ctx.factory.regions().region_for(persister) {
        region
            .evict(&region.generate_cache_key(key.id(), persister, key.tenant()))
            .await;
    }
    Ok(next)
}
