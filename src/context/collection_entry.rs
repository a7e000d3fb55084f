use std::sync::Arc;

use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::key::CollectionKey;

/// Bookkeeping of one persistent collection.
#[derive(Clone, Debug)]
pub struct CollectionEntry {
    role:        Arc<str>,
    owner:       EntityRef,
    // Key the collection rows are stored under; absent for a collection never flushed.
    loaded_key:  Option<CollectionKey>,
    // Key computed by the current flush from the owner's identifier.
    current_key: Option<CollectionKey>,
    // Elements as stored; `None` while the collection is uninitialized.
    snapshot:    Option<Vec<EntityRef>>,
    reached:     bool,
    do_update:   bool,
    do_remove:   bool,
    do_recreate: bool,
}

impl CollectionEntry {
    /// Entry of a collection loaded from, or known to be stored under, `key`.
    pub(crate) fn loaded(role: Arc<str>, owner: EntityRef, key: CollectionKey, snapshot: Option<Vec<EntityRef>>) -> Self {
        Self {
            role,
            owner,
            loaded_key: Some(key),
            current_key: None,
            snapshot,
            reached: false,
            do_update: false,
            do_remove: false,
            do_recreate: false,
        }
    }

    /// Entry of a collection wrapper created by the application.
    pub(crate) fn new_collection(role: Arc<str>, owner: EntityRef) -> Self {
        Self {
            role,
            owner,
            loaded_key: None,
            current_key: None,
            snapshot: Some(Vec::new()),
            reached: false,
            do_update: false,
            do_remove: false,
            do_recreate: false,
        }
    }

    #[inline]
    pub fn role(&self) -> &Arc<str> {
        &self.role
    }

    #[inline]
    pub fn owner(&self) -> &EntityRef {
        &self.owner
    }

    #[inline]
    pub fn loaded_key(&self) -> Option<&CollectionKey> {
        self.loaded_key.as_ref()
    }

    #[inline]
    pub fn current_key(&self) -> Option<&CollectionKey> {
        self.current_key.as_ref()
    }

    #[inline]
    pub fn snapshot(&self) -> Option<&[EntityRef]> {
        self.snapshot.as_deref()
    }

    #[inline]
    pub fn is_reached(&self) -> bool {
        self.reached
    }

    #[inline]
    pub fn does_update(&self) -> bool {
        self.do_update
    }

    #[inline]
    pub fn does_remove(&self) -> bool {
        self.do_remove
    }

    #[inline]
    pub fn does_recreate(&self) -> bool {
        self.do_recreate
    }

    pub(crate) fn reach(&mut self, current_key: CollectionKey) {
        self.reached = true;
        self.current_key = Some(current_key);
    }

    pub(crate) fn set_snapshot(&mut self, snapshot: Option<Vec<EntityRef>>) {
        self.snapshot = snapshot;
    }

    /// Decides what the flush has to do with the collection.
    pub(crate) fn prepare_for_flush(&mut self, collection: &CollectionRef, owner_deleted: bool) {
        self.do_update = false;
        self.do_remove = false;
        self.do_recreate = false;

        if owner_deleted || !self.reached {
            self.do_remove = self.loaded_key.is_some();
            return;
        }
        match self.loaded_key {
            None => self.do_recreate = true,
            Some(ref loaded) if Some(loaded) != self.current_key.as_ref() => {
                self.do_remove = true;
                self.do_recreate = true;
            }
            Some(_) => self.do_update = collection.is_dirty(),
        }
    }

    /// The storage now holds the collection under its current key.
    pub(crate) fn post_flush(&mut self, collection: &CollectionRef) {
        if self.current_key.is_some() {
            self.loaded_key = self.current_key.clone();
        }
        if collection.is_initialized() {
            self.snapshot = collection.elements().ok();
        }
        collection.clear_dirty();
        self.reached = false;
        self.do_update = false;
        self.do_remove = false;
        self.do_recreate = false;
    }

    pub(crate) fn reset_reached(&mut self) {
        self.reached = false;
    }
}
