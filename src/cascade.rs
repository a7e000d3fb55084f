//! Cascade styles and graph walking support.
//!
//! The session drives the actual recursion because every step needs storage access. This module decides which
//! associations a step follows, in which phase, and remembers which instances a top-level operation already visited.

use std::collections::HashMap;
use std::collections::HashSet;
use std::fmt::Display;
use std::sync::Arc;

use crate::instance::CollectionRef;
use crate::instance::EntityRef;
use crate::instance::QueuedOperation;
use crate::mapping::EntityPersister;
use crate::mapping::PropertyKind;
use crate::types::Value;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CascadeAction {
    Persist,
    /// Persist reached by the flush-time walk over managed entities.
    PersistOnFlush,
    Merge,
    Delete,
    Refresh,
    Lock,
    Replicate,
    Evict,
}

impl CascadeAction {
    const fn bit(self) -> u16 {
        match self {
            // Flush-time persist follows the same associations as persist.
            CascadeAction::Persist | CascadeAction::PersistOnFlush => 1,
            CascadeAction::Merge => 1 << 1,
            CascadeAction::Delete => 1 << 2,
            CascadeAction::Refresh => 1 << 3,
            CascadeAction::Lock => 1 << 4,
            CascadeAction::Replicate => 1 << 5,
            CascadeAction::Evict => 1 << 6,
        }
    }

    /// Lazy associations must be loaded before this action can follow them.
    #[inline]
    pub fn requires_initialization(&self) -> bool {
        matches!(self, CascadeAction::Delete)
    }

    /// Whether elements queued on an uninitialized collection are followed.
    #[inline]
    pub fn follows_queued_additions(&self) -> bool {
        matches!(self, CascadeAction::Persist | CascadeAction::PersistOnFlush)
    }
}

impl Display for CascadeAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CascadeAction::Persist => "persist",
            CascadeAction::PersistOnFlush => "persist-on-flush",
            CascadeAction::Merge => "merge",
            CascadeAction::Delete => "delete",
            CascadeAction::Refresh => "refresh",
            CascadeAction::Lock => "lock",
            CascadeAction::Replicate => "replicate",
            CascadeAction::Evict => "evict",
        };
        f.write_str(name)
    }
}

/// Set of operations an association propagates.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CascadeStyle {
    actions:       u16,
    delete_orphan: bool,
}

impl CascadeStyle {
    const ALL: u16 = 0x7f;

    pub const fn none() -> Self {
        Self {
            actions:       0,
            delete_orphan: false,
        }
    }

    pub const fn all() -> Self {
        Self {
            actions:       Self::ALL,
            delete_orphan: false,
        }
    }

    /// Everything plus removal of elements dropped from a collection.
    pub const fn all_delete_orphan() -> Self {
        Self {
            actions:       Self::ALL,
            delete_orphan: true,
        }
    }

    pub const fn persist() -> Self {
        Self::none().with(CascadeAction::Persist)
    }

    pub fn of(actions: &[CascadeAction]) -> Self {
        actions.iter().fold(Self::none(), |style, a| style.with(*a))
    }

    pub const fn with(self, action: CascadeAction) -> Self {
        Self {
            actions:       self.actions | action.bit(),
            delete_orphan: self.delete_orphan,
        }
    }

    pub const fn with_orphan_delete(self) -> Self {
        Self {
            actions:       self.actions,
            delete_orphan: true,
        }
    }

    #[inline]
    pub fn applies(&self, action: CascadeAction) -> bool {
        self.actions & action.bit() != 0
    }

    #[inline]
    pub fn has_orphan_delete(&self) -> bool {
        self.delete_orphan
    }

    #[inline]
    pub fn is_none(&self) -> bool {
        self.actions == 0 && !self.delete_orphan
    }
}

/// Phase of an owner's own operation at which associations are walked.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CascadePoint {
    /// To-one associations: before the owner is saved, after it is deleted.
    BeforeInsertAfterDelete,
    /// Collections: after the owner is saved, before it is deleted.
    AfterInsertBeforeDelete,
    /// Both kinds, for operations without statement ordering concerns.
    All,
}

impl CascadePoint {
    fn includes(&self, kind: &PropertyKind) -> bool {
        match (self, kind) {
            (CascadePoint::All, _) => true,
            (CascadePoint::BeforeInsertAfterDelete, PropertyKind::ManyToOne { .. }) => true,
            (CascadePoint::AfterInsertBeforeDelete, PropertyKind::Collection { .. }) => true,
            _ => false,
        }
    }
}

/// One association slot a cascade step has to follow.
#[derive(Clone, Debug)]
pub(crate) enum CascadeTarget {
    Entity {
        property: Arc<str>,
        entity:   EntityRef,
    },
    Collection {
        property:      Arc<str>,
        collection:    CollectionRef,
        delete_orphan: bool,
    },
}

/// Associations of `state` that `action` follows at `point`. Null slots are skipped.
pub(crate) fn cascade_targets(
    persister: &EntityPersister,
    state: &[Value],
    action: CascadeAction,
    point: CascadePoint,
) -> Vec<CascadeTarget> {
    persister
        .properties()
        .iter()
        .zip(state.iter())
        .filter(|(prop, _)| prop.is_association() && prop.cascade().applies(action) && point.includes(prop.kind()))
        .filter_map(|(prop, value)| match value {
            Value::Entity(entity) => Some(CascadeTarget::Entity {
                property: prop.name().clone(),
                entity:   entity.clone(),
            }),
            Value::Collection(collection) => Some(CascadeTarget::Collection {
                property:      prop.name().clone(),
                collection:    collection.clone(),
                delete_orphan: prop.cascade().has_orphan_delete(),
            }),
            _ => None,
        })
        .collect()
}

/// Collections of `state` whose role removes orphans, whatever the cascade action.
pub(crate) fn orphan_collections(persister: &EntityPersister, state: &[Value]) -> Vec<CollectionRef> {
    persister
        .properties()
        .iter()
        .zip(state.iter())
        .filter(|(prop, _)| prop.is_collection() && prop.cascade().has_orphan_delete())
        .filter_map(|(_, value)| value.as_collection().cloned())
        .collect()
}

/// Elements of a collection reachable without initializing it.
pub(crate) fn reachable_elements(collection: &CollectionRef, action: CascadeAction) -> Vec<EntityRef> {
    match collection.elements() {
        Ok(elements) => elements,
        Err(_) if action.follows_queued_additions() => collection
            .queued_operations()
            .into_iter()
            .filter_map(|op| match op {
                QueuedOperation::Add(e) => Some(e),
                QueuedOperation::Remove(_) => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Elements present in `snapshot` but absent from `current`.
pub(crate) fn orphans(snapshot: &[EntityRef], current: &[EntityRef]) -> Vec<EntityRef> {
    snapshot
        .iter()
        .filter(|old| !current.iter().any(|e| e.same_target(old)))
        .cloned()
        .collect()
}

/// Instances already handled by one top-level operation, by identity.
#[derive(Debug, Default)]
pub(crate) struct CascadeVisit {
    visited: HashSet<EntityRef>,
}

impl CascadeVisit {
    /// `true` the first time an instance is seen.
    pub(crate) fn first_visit(&mut self, entity: &EntityRef) -> bool {
        self.visited.insert(entity.resolve())
    }

    pub(crate) fn is_visited(&self, entity: &EntityRef) -> bool {
        self.visited.contains(&entity.resolve())
    }

    pub(crate) fn len(&self) -> usize {
        self.visited.len()
    }
}

/// Source to managed copy map of a merge. Doubles as its visited set.
#[derive(Debug, Default)]
pub(crate) struct MergeContext {
    copies: HashMap<EntityRef, EntityRef>,
}

impl MergeContext {
    pub(crate) fn copy_of(&self, source: &EntityRef) -> Option<EntityRef> {
        self.copies.get(&source.resolve()).cloned()
    }

    pub(crate) fn record(&mut self, source: &EntityRef, target: &EntityRef) {
        self.copies.insert(source.resolve(), target.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Identifier;

    fn entity(id: i64) -> EntityRef {
        EntityRef::new_initialized(Arc::from("Child"), Some(Identifier::Int(id)), vec![])
    }

    #[test]
    fn style_flags() {
        let style = CascadeStyle::persist();
        assert!(style.applies(CascadeAction::Persist));
        assert!(style.applies(CascadeAction::PersistOnFlush));
        assert!(!style.applies(CascadeAction::Delete));
        assert!(!style.has_orphan_delete());

        let all = CascadeStyle::all_delete_orphan();
        assert!(all.applies(CascadeAction::Evict));
        assert!(all.has_orphan_delete());
        assert!(CascadeStyle::none().is_none());
        assert_eq!(
            CascadeStyle::of(&[CascadeAction::Delete, CascadeAction::Merge]),
            CascadeStyle::none().with(CascadeAction::Merge).with(CascadeAction::Delete)
        );
    }

    #[test]
    fn visit_is_by_identity() {
        let mut visit = CascadeVisit::default();
        let a = entity(1);
        let twin = entity(1);
        assert!(visit.first_visit(&a));
        assert!(!visit.first_visit(&a.clone()));
        assert!(visit.first_visit(&twin));
        assert_eq!(visit.len(), 2);
    }

    #[test]
    fn orphans_are_dropped_elements() {
        let a = entity(1);
        let b = entity(2);
        let found = orphans(&[a.clone(), b.clone()], &[b]);
        assert_eq!(found, vec![a]);
    }

    #[test]
    fn queued_additions_reachable_for_persist_only() {
        let coll = CollectionRef::uninitialized(Arc::from("Parent.children"));
        let a = entity(1);
        coll.add(a.clone());
        assert_eq!(reachable_elements(&coll, CascadeAction::Persist), vec![a]);
        assert!(reachable_elements(&coll, CascadeAction::Refresh).is_empty());
    }
}
