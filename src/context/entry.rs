use std::sync::Arc;

use crate::key::EntityKey;
use crate::types::Identifier;
use crate::types::LockMode;
use crate::types::Status;
use crate::types::Value;

/// Bookkeeping of one managed entity instance.
///
/// The key is absent only while the insert of an entity with a storage-generated identifier is still pending.
#[derive(Clone, Debug)]
pub struct EntityEntry {
    status:                         Status,
    entity_name:                    Arc<str>,
    key:                            Option<EntityKey>,
    loaded_state:                   Vec<Value>,
    deleted_state:                  Option<Vec<Value>>,
    version:                        Option<i64>,
    lock_mode:                      LockMode,
    exists_in_database:             bool,
    read_only:                      bool,
    removing_orphan_before_updates: bool,
    sequence:                       u64,
}

impl EntityEntry {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        status: Status,
        entity_name: Arc<str>,
        key: Option<EntityKey>,
        loaded_state: Vec<Value>,
        version: Option<i64>,
        lock_mode: LockMode,
        exists_in_database: bool,
        read_only: bool,
        sequence: u64,
    ) -> Self {
        Self {
            status,
            entity_name,
            key,
            loaded_state,
            deleted_state: None,
            version,
            lock_mode,
            exists_in_database,
            read_only,
            removing_orphan_before_updates: false,
            sequence,
        }
    }

    #[inline]
    pub fn status(&self) -> Status {
        self.status
    }

    /// Concrete entity name of the instance.
    #[inline]
    pub fn entity_name(&self) -> &Arc<str> {
        &self.entity_name
    }

    #[inline]
    pub fn key(&self) -> Option<&EntityKey> {
        self.key.as_ref()
    }

    pub fn id(&self) -> Option<&Identifier> {
        self.key.as_ref().map(EntityKey::id)
    }

    /// State as last synchronized with the storage. Dirty checking compares against it.
    #[inline]
    pub fn loaded_state(&self) -> &[Value] {
        &self.loaded_state
    }

    #[inline]
    pub fn deleted_state(&self) -> Option<&[Value]> {
        self.deleted_state.as_deref()
    }

    #[inline]
    pub fn version(&self) -> Option<i64> {
        self.version
    }

    #[inline]
    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    #[inline]
    pub fn exists_in_database(&self) -> bool {
        self.exists_in_database
    }

    #[inline]
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    #[inline]
    pub fn is_removing_orphan_before_updates(&self) -> bool {
        self.removing_orphan_before_updates
    }

    #[inline]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn is_managed(&self) -> bool {
        matches!(self.status, Status::Managed)
    }

    pub(crate) fn set_status(&mut self, status: Status) {
        self.status = status;
    }

    pub(crate) fn set_key(&mut self, key: EntityKey) {
        self.key = Some(key);
    }

    pub(crate) fn set_entity_name(&mut self, entity_name: Arc<str>) {
        self.entity_name = entity_name;
    }

    /// Records a state freshly read from or written to the storage.
    pub(crate) fn post_synchronize(&mut self, state: Vec<Value>, version: Option<i64>) {
        self.loaded_state = state;
        self.version = version;
        self.exists_in_database = true;
        if self.status == Status::Loading || self.status == Status::Saving {
            self.status = Status::Managed;
        }
    }

    pub(crate) fn set_loaded_state(&mut self, state: Vec<Value>) {
        self.loaded_state = state;
    }

    pub(crate) fn set_version(&mut self, version: Option<i64>) {
        self.version = version;
    }

    pub(crate) fn mark_deleted(&mut self, deleted_state: Vec<Value>, orphan_before_updates: bool) {
        self.status = Status::Deleted;
        self.deleted_state = Some(deleted_state);
        self.removing_orphan_before_updates = orphan_before_updates;
    }

    pub(crate) fn mark_gone(&mut self) {
        self.status = Status::Gone;
        self.exists_in_database = false;
    }

    /// Locks only ever get stronger within a transaction.
    pub(crate) fn upgrade_lock_mode(&mut self, lock_mode: LockMode) {
        if lock_mode > self.lock_mode {
            self.lock_mode = lock_mode;
        }
    }

    pub(crate) fn reset_lock_mode(&mut self) {
        self.lock_mode = LockMode::None;
    }

    pub(crate) fn set_read_only(&mut self, read_only: bool) {
        self.read_only = read_only;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TenantId;

    fn entry(status: Status) -> EntityEntry {
        EntityEntry::new(
            status,
            Arc::from("Parent"),
            Some(EntityKey::new("Parent", Identifier::Int(1), TenantId::Default)),
            vec![],
            Some(1),
            LockMode::None,
            false,
            false,
            1,
        )
    }

    #[test]
    fn synchronization_promotes_transitional_status() {
        let mut e = entry(Status::Loading);
        e.post_synchronize(vec![Value::Int(1)], Some(1));
        assert!(e.is_managed());
        assert!(e.exists_in_database());

        let mut e = entry(Status::Deleted);
        e.post_synchronize(vec![], Some(2));
        assert_eq!(e.status(), Status::Deleted);
    }

    #[test]
    fn lock_mode_only_upgrades() {
        let mut e = entry(Status::Managed);
        e.upgrade_lock_mode(LockMode::PessimisticWrite);
        e.upgrade_lock_mode(LockMode::Read);
        assert_eq!(e.lock_mode(), LockMode::PessimisticWrite);
        e.reset_lock_mode();
        assert_eq!(e.lock_mode(), LockMode::None);
    }
}
