//! Pending storage mutations of a session.
//!
//! Actions are queued by session operations and by flush planning, then executed in one pass:
//!
//! 1. orphan removals scheduled before updates
//! 2. insertions, parents before children
//! 3. updates and upserts
//! 4. collection removals, updates and recreations
//! 5. deletions, children before parents
//!
//! Each list is drained before it executes, so a failure never leaves an action to be executed twice.

pub(crate) mod collection;
pub(crate) mod completion;
pub(crate) mod delete;
pub(crate) mod insert;
pub(crate) mod sort;
pub(crate) mod update;
pub(crate) mod upsert;

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument;

use crate::cache::CacheEntry;
use crate::context::PersistenceContext;
use crate::error::Defect;
use crate::error::OrmError;
use crate::error::Result;
use crate::factory::SessionFactory;
use crate::instance::EntityRef;
use crate::key::TenantId;
use crate::mapping::EntityPersister;
use crate::mapping::PropertyKind;
use crate::storage::Connection;
use crate::storage::StoredRow;
use crate::types::CacheMode;
use crate::types::Datum;
use crate::types::Identifier;
use crate::types::Value;

pub(crate) use collection::CollectionRecreateAction;
pub(crate) use collection::CollectionRemoveAction;
pub(crate) use collection::CollectionUpdateAction;
pub(crate) use completion::AfterCompletion;
pub(crate) use completion::BeforeCompletion;
pub(crate) use completion::TransactionCompletion;
pub(crate) use delete::EntityDeleteAction;
pub(crate) use insert::EntityInsertAction;
pub(crate) use update::EntityUpdateAction;
pub(crate) use upsert::EntityUpsertAction;

/// What an executing action may touch.
pub(crate) struct ActionContext<'a> {
    pub(crate) conn:       &'a mut dyn Connection,
    pub(crate) context:    &'a mut PersistenceContext,
    pub(crate) factory:    &'a SessionFactory,
    pub(crate) tenant:     &'a TenantId,
    pub(crate) cache_mode: CacheMode,
}

/// Identifier an entity reference is stored as.
pub(crate) fn reference_id(entity: &EntityRef, context: &PersistenceContext) -> Option<Identifier> {
    context
        .get_entry(entity)
        .and_then(|e| e.id().cloned())
        .or_else(|| entity.id())
}

/// Flattens entity state into a storage row. Collections are stored separately and come out as nulls.
pub(crate) fn disassemble(
    persister: &EntityPersister,
    entity_name: &Arc<str>,
    state: &[Value],
    context: &PersistenceContext,
) -> Result<StoredRow> {
    let mut values = Vec::with_capacity(state.len());
    for (prop, value) in persister.properties().iter().zip(state.iter()) {
        let datum = match (prop.kind(), value) {
            (_, Value::Null) => Datum::Null,
            (PropertyKind::ManyToOne { .. }, Value::Entity(target)) => reference_id(target, context)
                .map(|id| id.to_datum())
                .ok_or_else(|| OrmError::TransientReference {
                    entity:   persister.entity_name().to_string(),
                    property: prop.name().to_string(),
                })?,
            (PropertyKind::Collection { .. }, _) => Datum::Null,
            (PropertyKind::Basic | PropertyKind::Version, v) => v.to_datum().ok_or_else(|| {
                OrmError::IllegalArgument(format!(
                    "property '{}' of '{}' holds a reference where a scalar is expected",
                    prop.name(),
                    persister.entity_name()
                ))
            })?,
            (PropertyKind::ManyToOne { .. }, _) => {
                return Err(OrmError::IllegalArgument(format!(
                    "property '{}' of '{}' must hold an entity reference",
                    prop.name(),
                    persister.entity_name()
                )))
            }
        };
        values.push(datum);
    }
    Ok(StoredRow::new(entity_name.clone(), values))
}

pub(crate) fn cache_entry(persister: &EntityPersister, row: &StoredRow) -> CacheEntry {
    CacheEntry {
        subclass: row.entity_name.clone(),
        version:  persister.version_index().and_then(|i| row.values.get(i)).and_then(Datum::as_int),
        values:   row.values.clone(),
    }
}

/// Entities referenced through to-one properties of `state`.
pub(crate) fn to_one_targets(persister: &EntityPersister, state: &[Value]) -> Vec<EntityRef> {
    persister
        .properties()
        .iter()
        .zip(state.iter())
        .filter(|(prop, _)| matches!(prop.kind(), PropertyKind::ManyToOne { .. }))
        .filter_map(|(_, value)| value.as_entity().map(EntityRef::resolve))
        .collect()
}

/// An insert waiting for transient entities it references to become managed.
pub(crate) struct UnresolvedInsert {
    pub(crate) action:       EntityInsertAction,
    pub(crate) dependencies: Vec<EntityRef>,
}

#[derive(Default)]
pub struct ActionQueue {
    orphan_removals:       Vec<EntityDeleteAction>,
    insertions:            Vec<EntityInsertAction>,
    unresolved:            Vec<UnresolvedInsert>,
    updates:               Vec<EntityUpdateAction>,
    upserts:               Vec<EntityUpsertAction>,
    collection_removals:   Vec<CollectionRemoveAction>,
    collection_updates:    Vec<CollectionUpdateAction>,
    collection_creations:  Vec<CollectionRecreateAction>,
    deletions:             Vec<EntityDeleteAction>,
    pub(crate) completion: TransactionCompletion,
}

impl ActionQueue {
    pub(crate) fn add_insert(&mut self, action: EntityInsertAction) {
        self.insertions.push(action);
    }

    pub(crate) fn add_unresolved_insert(&mut self, action: EntityInsertAction, dependencies: Vec<EntityRef>) {
        debug!(
            "insert of {:?} waits for {} transient dependencies",
            action.entity,
            dependencies.len()
        );
        self.unresolved.push(UnresolvedInsert { action, dependencies });
    }

    /// `entity` became managed; returns the inserts that no longer wait for anything.
    pub(crate) fn resolve_dependency(&mut self, entity: &EntityRef) -> Vec<EntityInsertAction> {
        let mut resolved = Vec::new();
        let mut still_waiting = Vec::new();
        for mut unresolved in std::mem::take(&mut self.unresolved) {
            unresolved.dependencies.retain(|d| !d.same_target(entity));
            if unresolved.dependencies.is_empty() {
                resolved.push(unresolved.action);
            }
            else {
                still_waiting.push(unresolved);
            }
        }
        self.unresolved = still_waiting;
        resolved
    }

    pub fn has_unresolved_inserts(&self) -> bool {
        !self.unresolved.is_empty()
    }

    pub(crate) fn unresolved_inserts(&self) -> &[UnresolvedInsert] {
        &self.unresolved
    }

    /// Unresolved inserts whose identifier is still to be produced by the storage.
    pub(crate) fn has_pending_generation(&self) -> bool {
        self.unresolved.iter().any(|u| u.action.id.is_none())
    }

    pub(crate) fn clear_unresolved(&mut self) {
        self.unresolved.clear();
    }

    pub(crate) fn add_update(&mut self, action: EntityUpdateAction) {
        self.updates.push(action);
    }

    pub(crate) fn add_upsert(&mut self, action: EntityUpsertAction) {
        self.upserts.push(action);
    }

    pub(crate) fn add_delete(&mut self, action: EntityDeleteAction) {
        if action.orphan_before_updates {
            self.orphan_removals.push(action);
        }
        else {
            self.deletions.push(action);
        }
    }

    pub(crate) fn add_collection_removal(&mut self, action: CollectionRemoveAction) {
        self.collection_removals.push(action);
    }

    pub(crate) fn add_collection_update(&mut self, action: CollectionUpdateAction) {
        self.collection_updates.push(action);
    }

    pub(crate) fn add_collection_creation(&mut self, action: CollectionRecreateAction) {
        self.collection_creations.push(action);
    }

    pub fn insertion_count(&self) -> usize {
        self.insertions.len()
    }

    pub fn update_count(&self) -> usize {
        self.updates.len()
    }

    pub fn deletion_count(&self) -> usize {
        self.deletions.len() + self.orphan_removals.len()
    }

    pub fn collection_action_count(&self) -> usize {
        self.collection_removals.len() + self.collection_updates.len() + self.collection_creations.len()
    }

    pub fn has_any_queued_actions(&self) -> bool {
        !self.orphan_removals.is_empty()
            || !self.insertions.is_empty()
            || !self.unresolved.is_empty()
            || !self.updates.is_empty()
            || !self.upserts.is_empty()
            || self.collection_action_count() > 0
            || !self.deletions.is_empty()
    }

    pub(crate) fn is_insert_queued(&self, entity: &EntityRef) -> bool {
        self.insertions.iter().any(|a| a.entity.same_target(entity))
            || self.unresolved.iter().any(|u| u.action.entity.same_target(entity))
    }

    pub(crate) fn insertions(&self) -> &[EntityInsertAction] {
        &self.insertions
    }

    pub(crate) fn deletions(&self) -> impl Iterator<Item = &EntityDeleteAction> {
        self.orphan_removals.iter().chain(self.deletions.iter())
    }

    pub(crate) fn upserts(&self) -> &[EntityUpsertAction] {
        &self.upserts
    }

    /// Whether any queued action writes one of `spaces`.
    pub fn are_tables_to_be_updated(&self, spaces: &BTreeSet<String>) -> bool {
        let touches = |tables: Vec<&str>| tables.iter().any(|t| spaces.contains(*t));
        self.orphan_removals.iter().any(|a| touches(a.persister.write_tables()))
            || self.insertions.iter().any(|a| touches(a.persister.write_tables()))
            || self.updates.iter().any(|a| touches(a.persister.write_tables()))
            || self.upserts.iter().any(|a| touches(a.persister.write_tables()))
            || self.deletions.iter().any(|a| touches(a.persister.write_tables()))
            || self.collection_removals.iter().any(|a| spaces.contains(a.persister.table()))
            || self.collection_updates.iter().any(|a| spaces.contains(a.persister.table()))
            || self.collection_creations.iter().any(|a| spaces.contains(a.persister.table()))
    }

    /// Drops what flush planning computed: updates and collection actions. Insertions and deletions requested by
    /// session operations stay queued.
    pub(crate) fn clear_from_flush_needed_check(&mut self) {
        self.updates.clear();
        self.collection_removals.clear();
        self.collection_updates.clear();
        self.collection_creations.clear();
    }

    /// Forgets every action operating on `entity`.
    pub(crate) fn remove_actions_for(&mut self, entity: &EntityRef) {
        self.insertions.retain(|a| !a.entity.same_target(entity));
        self.unresolved.retain(|u| !u.action.entity.same_target(entity));
        self.updates.retain(|a| !a.entity.same_target(entity));
        self.upserts.retain(|a| !a.entity.same_target(entity));
        self.orphan_removals.retain(|a| !a.entity.same_target(entity));
        self.deletions.retain(|a| !a.entity.same_target(entity));
    }

    /// Drops every pending action. Transaction completion processes are kept.
    pub fn clear(&mut self) {
        self.orphan_removals.clear();
        self.insertions.clear();
        self.unresolved.clear();
        self.updates.clear();
        self.upserts.clear();
        self.collection_removals.clear();
        self.collection_updates.clear();
        self.collection_creations.clear();
        self.deletions.clear();
    }

    fn sorted_insertions(actions: Vec<EntityInsertAction>) -> Result<Vec<EntityInsertAction>> {
        let index: HashMap<EntityRef, usize> = actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.entity.resolve(), i))
            .collect();
        let keys: Vec<(usize, u64)> = actions.iter().map(|a| (a.persister.fk_rank(), a.sequence)).collect();
        let deps: Vec<Vec<usize>> = actions
            .iter()
            .map(|a| {
                to_one_targets(&a.persister, &a.state)
                    .iter()
                    .filter_map(|t| index.get(t).copied())
                    .collect()
            })
            .collect();
        let order = sort::dependency_order(&keys, &deps).map_err(|cycle| {
            let members: Vec<String> = cycle.iter().map(|i| format!("{:?}", actions[*i].entity)).collect();
            OrmError::Configuration(format!(
                "foreign key cycle among pending inserts: {}",
                members.join(", ")
            ))
        })?;
        Ok(reorder(actions, order))
    }

    fn sorted_deletions(actions: Vec<EntityDeleteAction>) -> Result<Vec<EntityDeleteAction>> {
        let index: HashMap<EntityRef, usize> = actions
            .iter()
            .enumerate()
            .map(|(i, a)| (a.entity.resolve(), i))
            .collect();
        let keys: Vec<(usize, u64)> = actions
            .iter()
            .map(|a| (usize::MAX - a.persister.fk_rank(), u64::MAX - a.sequence))
            .collect();
        // A row must go before the rows it references.
        let mut deps: Vec<Vec<usize>> = vec![Vec::new(); actions.len()];
        for (i, a) in actions.iter().enumerate() {
            for target in to_one_targets(&a.persister, &a.state) {
                if let Some(&j) = index.get(&target) {
                    deps[j].push(i);
                }
            }
        }
        let order = sort::dependency_order(&keys, &deps).map_err(|cycle| {
            let members: Vec<String> = cycle.iter().map(|i| format!("{:?}", actions[*i].entity)).collect();
            OrmError::Configuration(format!(
                "foreign key cycle among pending deletes: {}",
                members.join(", ")
            ))
        })?;
        Ok(reorder(actions, order))
    }

    /// Executes queued insertions only.
    #[instrument(level = "trace", skip_all)]
    pub(crate) async fn execute_inserts(&mut self, ctx: &mut ActionContext<'_>) -> Result<()> {
        let insertions = Self::sorted_insertions(std::mem::take(&mut self.insertions))?;
        for mut action in insertions {
            action.execute(ctx, &mut self.completion).await?;
        }
        Ok(())
    }

    /// Executes everything queued, in flush order.
    #[instrument(level = "trace", skip_all)]
    pub(crate) async fn execute_actions(&mut self, ctx: &mut ActionContext<'_>) -> Result<()> {
        if let Some(unresolved) = self.unresolved.first() {
            let err = Defect::UnresolvedAction(format!("{:?}", unresolved.action.entity));
            self.clear();
            return Err(err.into());
        }

        let orphan_removals = std::mem::take(&mut self.orphan_removals);
        let insertions = std::mem::take(&mut self.insertions);
        let updates = std::mem::take(&mut self.updates);
        let upserts = std::mem::take(&mut self.upserts);
        let collection_removals = std::mem::take(&mut self.collection_removals);
        let collection_updates = std::mem::take(&mut self.collection_updates);
        let collection_creations = std::mem::take(&mut self.collection_creations);
        let deletions = std::mem::take(&mut self.deletions);

        debug!(
            "executing {} orphan removals, {} inserts, {} updates, {} upserts, {} collection actions, {} deletes",
            orphan_removals.len(),
            insertions.len(),
            updates.len(),
            upserts.len(),
            collection_removals.len() + collection_updates.len() + collection_creations.len(),
            deletions.len()
        );

        for mut action in Self::sorted_deletions(orphan_removals)? {
            action.execute(ctx, &mut self.completion).await?;
        }
        for mut action in Self::sorted_insertions(insertions)? {
            action.execute(ctx, &mut self.completion).await?;
        }
        for mut action in updates {
            action.execute(ctx, &mut self.completion).await?;
        }
        for mut action in upserts {
            action.execute(ctx, &mut self.completion).await?;
        }
        for action in collection_removals {
            action.execute(ctx).await?;
        }
        for action in collection_updates {
            action.execute(ctx).await?;
        }
        for action in collection_creations {
            action.execute(ctx).await?;
        }
        for mut action in Self::sorted_deletions(deletions)? {
            action.execute(ctx, &mut self.completion).await?;
        }
        Ok(())
    }
}

fn reorder<T>(items: Vec<T>, order: Vec<usize>) -> Vec<T> {
    let mut slots: Vec<Option<T>> = items.into_iter().map(Some).collect();
    order.into_iter().filter_map(|i| slots[i].take()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::CascadeStyle;
    use crate::context::EntityEntry;
    use crate::key::EntityKey;
    use crate::mapping::EntityMapping;
    use crate::mapping::Metamodel;
    use crate::types::LockMode;
    use crate::types::Status;

    fn model() -> Metamodel {
        Metamodel::builder()
            .entity(EntityMapping::new("Parent").property("name"))
            .entity(
                EntityMapping::new("Child")
                    .property("name")
                    .many_to_one("parent", "Parent", CascadeStyle::none()),
            )
            .entity(
                EntityMapping::new("Node")
                    .property("name")
                    .many_to_one("next", "Node", CascadeStyle::none()),
            )
            .build()
            .unwrap()
    }

    fn insert(model: &Metamodel, name: &str, id: i64, state: Vec<Value>, sequence: u64) -> (EntityRef, EntityInsertAction) {
        let persister = model.entity_persister(name).unwrap().clone();
        let entity = EntityRef::new_initialized(Arc::from(name), Some(Identifier::Int(id)), state.clone());
        let action = EntityInsertAction::new(entity.clone(), persister, Some(Identifier::Int(id)), state, None, sequence);
        (entity, action)
    }

    #[test]
    fn parents_are_inserted_before_children() {
        let model = model();
        let (parent, parent_insert) = insert(&model, "Parent", 1, vec![Value::from("p")], 2);
        let (_, child_insert) = insert(&model, "Child", 1, vec![Value::from("c"), Value::from(&parent)], 1);
        let sorted = ActionQueue::sorted_insertions(vec![child_insert, parent_insert]).unwrap();
        let names: Vec<_> = sorted.iter().map(|a| a.entity.entity_name().to_string()).collect();
        assert_eq!(names, vec!["Parent", "Child"]);
    }

    #[test]
    fn self_references_are_ordered_per_instance() {
        let model = model();
        let (tail, tail_insert) = insert(&model, "Node", 2, vec![Value::from("tail"), Value::Null], 2);
        let (head, head_insert) = insert(&model, "Node", 1, vec![Value::from("head"), Value::from(&tail)], 1);
        let sorted = ActionQueue::sorted_insertions(vec![head_insert, tail_insert]).unwrap();
        assert!(sorted[0].entity.ptr_eq(&tail));
        assert!(sorted[1].entity.ptr_eq(&head));
    }

    #[test]
    fn instance_cycles_are_configuration_errors() {
        let model = model();
        let a = EntityRef::new_initialized(Arc::from("Node"), Some(Identifier::Int(1)), vec![]);
        let b = EntityRef::new_initialized(Arc::from("Node"), Some(Identifier::Int(2)), vec![]);
        let persister = model.entity_persister("Node").unwrap().clone();
        let a_state = vec![Value::from("a"), Value::from(&b)];
        let b_state = vec![Value::from("b"), Value::from(&a)];
        let actions = vec![
            EntityInsertAction::new(a, persister.clone(), Some(Identifier::Int(1)), a_state, None, 1),
            EntityInsertAction::new(b, persister, Some(Identifier::Int(2)), b_state, None, 2),
        ];
        let Err(err) = ActionQueue::sorted_insertions(actions)
        else {
            panic!("a cycle among inserts was sorted");
        };
        assert!(matches!(err, OrmError::Configuration(ref m) if m.contains("cycle")));
    }

    #[test]
    fn transient_reference_is_reported_on_disassembly() {
        let model = model();
        let persister = model.entity_persister("Child").unwrap();
        let transient = EntityRef::new_initialized(Arc::from("Parent"), None, vec![Value::Null]);
        let ctx = PersistenceContext::default();
        let err = disassemble(
            persister,
            persister.entity_name(),
            &[Value::from("c"), Value::from(&transient)],
            &ctx,
        )
        .unwrap_err();
        assert!(matches!(err, OrmError::TransientReference { ref property, .. } if property == "parent"));
    }

    #[test]
    fn managed_reference_is_flattened_to_its_id() {
        let model = model();
        let persister = model.entity_persister("Child").unwrap();
        let parent = EntityRef::new_initialized(Arc::from("Parent"), Some(Identifier::Int(9)), vec![Value::Null]);
        let mut ctx = PersistenceContext::default();
        let key = EntityKey::new("Parent", Identifier::Int(9), TenantId::Default);
        ctx.add_entity(
            key.clone(),
            parent.clone(),
            EntityEntry::new(Status::Managed, Arc::from("Parent"), Some(key), vec![], None, LockMode::None, true, false, 1),
        )
        .unwrap();
        let row = disassemble(persister, persister.entity_name(), &[Value::from("c"), Value::from(&parent)], &ctx).unwrap();
        assert_eq!(row.values, vec![Datum::from("c"), Datum::Int(9)]);
    }

    #[test]
    fn unresolved_inserts_wait_for_all_dependencies() {
        let model = model();
        let (a, _) = insert(&model, "Parent", 1, vec![Value::Null], 1);
        let (b, _) = insert(&model, "Parent", 2, vec![Value::Null], 2);
        let (_, child) = insert(&model, "Child", 1, vec![Value::Null, Value::Null], 3);
        let mut queue = ActionQueue::default();
        queue.add_unresolved_insert(child, vec![a.clone(), b.clone()]);
        assert!(queue.resolve_dependency(&a).is_empty());
        assert!(queue.has_unresolved_inserts());
        assert_eq!(queue.resolve_dependency(&b).len(), 1);
        assert!(!queue.has_unresolved_inserts());
    }
}
