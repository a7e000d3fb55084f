mod common;

use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use wb_session::error::StorageError;
use wb_session::interceptor::Interceptor;
use wb_session::query::Query;
use wb_session::query::QueryPlan;
use wb_session::query::QueryRow;
use wb_session::storage::memory::StatementKind;
use wb_session::types::Datum;
use wb_session::types::FlushMode;
use wb_session::types::Identifier;
use wb_session::types::Interception;
use wb_session::types::Value;
use wb_session::EntityRef;
use wb_session::OrmError;

use common::fixture;

#[tokio::test]
async fn only_changed_entities_are_updated() {
    let fx = fixture();
    fx.seed_parent(1, 1, "before");
    fx.seed_parent(2, 1, "untouched");

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let changed = session.get("Parent", 1).await.unwrap().unwrap();
    session.get("Parent", 2).await.unwrap().unwrap();

    session.flush().await.unwrap();
    assert!(fx.executed(StatementKind::Update).is_empty());

    fx.model.set_property(&changed, "name", "after").unwrap();
    session.flush().await.unwrap();
    let updates = fx.storage.statements_of(StatementKind::Update);
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].id, Some(Identifier::Int(1)));
    assert!(updates[0].values.contains(&Datum::Text("after".into())));

    // Version was bumped in the instance and in the stored row.
    assert_eq!(fx.model.property(&changed, "version").unwrap(), Value::Int(2));
    session.commit().await.unwrap();
    assert_eq!(fx.stored_name("Parent", 1), Some(Datum::Text("after".into())));

    // Flushing the synchronized state again is a no-op.
    session.begin().await.unwrap();
    fx.storage.clear_statements();
    session.flush().await.unwrap();
    assert!(fx.executed(StatementKind::Update).is_empty());
    session.commit().await.unwrap();
}

#[tokio::test]
async fn concurrent_modification_is_detected() {
    let fx = fixture();
    fx.seed_parent(1, 1, "mine");

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let parent = session.get("Parent", 1).await.unwrap().unwrap();

    // Someone else got there first.
    assert!(fx.storage.set_column("Parent", &Identifier::Int(1), "version", Datum::Int(2)));
    assert!(fx.storage.set_column("Parent", &Identifier::Int(1), "name", Datum::Text("theirs".into())));

    fx.model.set_property(&parent, "name", "mine, changed").unwrap();
    let err = session.flush().await.unwrap_err();
    assert!(matches!(err, OrmError::StaleObjectState { ref id, .. } if *id == Identifier::Int(1)));
    assert!(session.is_rollback_only());
    assert_eq!(fx.stored_name("Parent", 1), Some(Datum::Text("theirs".into())));

    let err = session.commit().await.unwrap_err();
    assert!(matches!(err, OrmError::RollbackOnly));
    assert!(!session.is_transaction_active());
}

#[tokio::test]
async fn parents_are_inserted_before_children() {
    let fx = fixture();
    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();

    let parent = fx.new_parent(1, "p");
    let child = fx.new_child(10, "c", &parent);
    session.persist(&parent).await.unwrap();
    session.persist(&child).await.unwrap();
    session.flush().await.unwrap();

    let parent_insert = fx.position_of(StatementKind::Insert, "parent").unwrap();
    let child_insert = fx.position_of(StatementKind::Insert, "child").unwrap();
    assert!(parent_insert < child_insert);
    session.commit().await.unwrap();
    assert_eq!(fx.storage.row_count("Child"), 1);
    assert_eq!(fx.storage.collection("Parent.children", &Identifier::Int(1)), vec![Identifier::Int(10)]);
}

#[tokio::test]
async fn cascaded_children_still_follow_their_parent() {
    let fx = fixture();
    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();

    // Only the parent is persisted explicitly; the children follow through the collection cascade.
    let parent = fx.new_parent(1, "p");
    fx.new_child(10, "first", &parent);
    fx.new_child(11, "second", &parent);
    session.persist(&parent).await.unwrap();
    assert_eq!(session.action_queue().insertion_count(), 3);
    session.commit().await.unwrap();

    let inserts = fx.executed(StatementKind::Insert);
    assert_eq!(inserts[0], ("parent".to_string(), Some(Identifier::Int(1))));
    assert_eq!(inserts.len(), 3);
}

#[tokio::test]
async fn children_are_deleted_before_parents() {
    let fx = fixture();
    {
        let mut session = fx.factory.open_session().await.unwrap();
        session.begin().await.unwrap();
        let parent = fx.new_parent(1, "p");
        fx.new_child(10, "c", &parent);
        session.persist(&parent).await.unwrap();
        session.commit().await.unwrap();
    }
    fx.storage.clear_statements();

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let parent = session.get("Parent", 1).await.unwrap().unwrap();
    session.delete(&parent).await.unwrap();
    session.commit().await.unwrap();

    let child_delete = fx.position_of(StatementKind::Delete, "child").unwrap();
    let parent_delete = fx.position_of(StatementKind::Delete, "parent").unwrap();
    assert!(child_delete < parent_delete);
    assert_eq!(fx.storage.row_count("Parent"), 0);
    assert_eq!(fx.storage.row_count("Child"), 0);
}

#[tokio::test]
async fn removed_children_are_orphans() {
    let fx = fixture();
    {
        let mut session = fx.factory.open_session().await.unwrap();
        session.begin().await.unwrap();
        let parent = fx.new_parent(1, "p");
        fx.new_child(10, "stays", &parent);
        fx.new_child(11, "goes", &parent);
        session.persist(&parent).await.unwrap();
        session.commit().await.unwrap();
    }

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let parent = session.get("Parent", 1).await.unwrap().unwrap();
    let Value::Collection(children) = fx.model.property(&parent, "children").unwrap()
    else {
        panic!("children is not a collection");
    };
    session.initialize_collection(&children).await.unwrap();
    let goes = children
        .elements()
        .unwrap()
        .into_iter()
        .find(|c| c.id() == Some(Identifier::Int(11)))
        .unwrap();
    assert!(children.remove(&goes));
    session.commit().await.unwrap();

    assert!(fx.storage.row("Child", &Identifier::Int(11)).is_none());
    assert!(fx.storage.row("Child", &Identifier::Int(10)).is_some());
    assert_eq!(fx.storage.collection("Parent.children", &Identifier::Int(1)), vec![Identifier::Int(10)]);
    assert!(!session.contains(&goes));
}

#[derive(Default)]
struct Auditor {
    saves:      AtomicUsize,
    veto_dirty: bool,
}

#[async_trait]
impl Interceptor for Auditor {
    async fn on_save(
        &self,
        _entity: &EntityRef,
        _id: Option<&Identifier>,
        state: &[Value],
        property_names: &[Arc<str>],
    ) -> Interception {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let mut state = state.to_vec();
        for (value, name) in state.iter_mut().zip(property_names) {
            if &**name != "name" {
                continue;
            }
            if let Some(upper) = value.as_text().map(str::to_uppercase) {
                *value = Value::Text(upper);
            }
        }
        Interception::Rewrite(state)
    }

    async fn on_flush_dirty(
        &self,
        _entity: &EntityRef,
        _id: &Identifier,
        _current_state: &[Value],
        _previous_state: &[Value],
        _property_names: &[Arc<str>],
    ) -> Interception {
        if self.veto_dirty {
            Interception::Veto
        }
        else {
            Interception::Proceed
        }
    }
}

#[tokio::test]
async fn interceptor_rewrites_saved_state() {
    let fx = fixture();
    let auditor = Arc::new(Auditor::default());
    let mut session = fx
        .factory
        .session_builder()
        .interceptor(auditor.clone())
        .open()
        .await
        .unwrap();
    session.begin().await.unwrap();
    let parent = fx.new_parent(1, "quiet");
    session.persist(&parent).await.unwrap();
    session.commit().await.unwrap();

    assert_eq!(auditor.saves.load(Ordering::SeqCst), 1);
    assert_eq!(fx.text(&parent, "name"), "QUIET");
    assert_eq!(fx.stored_name("Parent", 1), Some(Datum::Text("QUIET".into())));
}

#[tokio::test]
async fn interceptor_vetoes_updates() {
    let fx = fixture();
    fx.seed_parent(1, 1, "frozen");
    let auditor = Arc::new(Auditor {
        veto_dirty: true,
        ..Default::default()
    });
    let mut session = fx.factory.session_builder().interceptor(auditor).open().await.unwrap();
    session.begin().await.unwrap();
    let parent = session.get("Parent", 1).await.unwrap().unwrap();
    fx.model.set_property(&parent, "name", "thawed").unwrap();
    session.commit().await.unwrap();

    assert!(fx.executed(StatementKind::Update).is_empty());
    assert_eq!(fx.stored_name("Parent", 1), Some(Datum::Text("frozen".into())));
}

#[tokio::test]
async fn auto_flush_only_for_touched_spaces() {
    let fx = fixture();
    fx.storage.register_query("child names", |tables, _| {
        Ok(tables
            .rows("Child")
            .into_iter()
            .map(|(_, row)| QueryRow::Scalars(vec![row.values[0].clone()]))
            .collect())
    });
    fx.storage.register_query("parents", |tables, _| {
        Ok(tables
            .rows("Parent")
            .into_iter()
            .map(|(id, row)| QueryRow::Entity { id, row })
            .collect())
    });

    let mut session = fx.factory.open_session().await.unwrap();
    assert_eq!(session.flush_mode(), FlushMode::Auto);
    session.begin().await.unwrap();
    let parent = fx.new_parent(1, "pending");
    session.persist(&parent).await.unwrap();

    let scalar = Query::new(QueryPlan::scalar("child names").with_space("child"));
    assert!(session.list(&scalar).await.unwrap().is_empty());
    assert!(fx.executed(StatementKind::Insert).is_empty());
    assert_eq!(session.action_queue().insertion_count(), 1);

    let listed = session
        .list(&Query::new(QueryPlan::entity("parents", "Parent")))
        .await
        .unwrap();
    let insert = fx.position_of(StatementKind::Insert, "parent").unwrap();
    let query = fx.position_of(StatementKind::Query, "parents").unwrap();
    assert!(insert < query);
    assert_eq!(listed.len(), 1);
    assert!(listed[0].as_entity().unwrap().ptr_eq(&parent));

    // Commit mode defers the insert past the query.
    let mut deferred = fx.factory.open_session().await.unwrap();
    deferred.begin().await.unwrap();
    let late = fx.new_parent(2, "late");
    deferred.persist(&late).await.unwrap();
    let listed = deferred
        .list(&Query::new(QueryPlan::entity("parents", "Parent")).flush_mode(FlushMode::Commit))
        .await
        .unwrap();
    assert!(listed.iter().all(|r| r.as_entity().unwrap().id() != Some(Identifier::Int(2))));
    deferred.rollback().await.unwrap();
    session.commit().await.unwrap();
}

#[tokio::test]
async fn failed_commit_rolls_back() {
    let fx = fixture();
    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    session.persist(&fx.new_parent(1, "one")).await.unwrap();
    session.persist(&fx.new_parent(2, "two")).await.unwrap();
    fx.storage.fail_next(
        StatementKind::Commit,
        StorageError::new(StorageError::GENERIC, "disk full"),
    );

    let err = session.commit().await.unwrap_err();
    assert!(matches!(err, OrmError::Storage { .. }));
    assert!(!session.is_transaction_active());
    assert_eq!(fx.storage.row_count("Parent"), 0);
    assert!(!fx.executed(StatementKind::Rollback).is_empty());
}

#[tokio::test]
async fn flush_requires_a_transaction() {
    let fx = fixture();
    let mut session = fx.factory.open_session().await.unwrap();
    let err = session.flush().await.unwrap_err();
    assert!(matches!(err, OrmError::IllegalState(_)));

    session.close().await.unwrap();
    assert!(matches!(session.get("Parent", 1).await, Err(OrmError::SessionClosed)));
    assert!(matches!(session.close().await, Err(OrmError::IllegalState(_))));
}
