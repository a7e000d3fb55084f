mod common;

use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use wb_session::interceptor::Interceptor;
use wb_session::storage::memory::StatementKind;
use wb_session::types::Datum;
use wb_session::types::Identifier;
use wb_session::types::Interception;
use wb_session::types::Status;
use wb_session::types::Value;
use wb_session::EntityRef;
use wb_session::OrmError;

use common::fixture;
use common::Fixture;

#[derive(Default)]
struct SaveCounter {
    saves: AtomicUsize,
}

#[async_trait]
impl Interceptor for SaveCounter {
    async fn on_save(
        &self,
        _entity: &EntityRef,
        _id: Option<&Identifier>,
        _state: &[Value],
        _property_names: &[Arc<str>],
    ) -> Interception {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Interception::Proceed
    }
}

fn node(fx: &Fixture, id: i64, label: &str) -> EntityRef {
    let node = fx.model.instantiate_with_id("Node", id).unwrap();
    fx.model.set_property(&node, "label", label).unwrap();
    node
}

#[tokio::test]
async fn cyclic_graph_is_saved_once_per_instance() {
    let fx = fixture();
    let counter = Arc::new(SaveCounter::default());
    let mut session = fx
        .factory
        .session_builder()
        .interceptor(counter.clone())
        .open()
        .await
        .unwrap();

    let a = node(&fx, 1, "a");
    let b = node(&fx, 2, "b");
    fx.model.set_property(&a, "next", &b).unwrap();
    fx.model.set_property(&b, "next", &a).unwrap();

    session.persist(&a).await.unwrap();
    assert_eq!(counter.saves.load(Ordering::SeqCst), 2);
    assert_eq!(session.action_queue().insertion_count(), 2);
    assert!(session.contains(&a));
    assert!(session.contains(&b));

    // Persisting again only walks the graph.
    session.persist(&b).await.unwrap();
    assert_eq!(counter.saves.load(Ordering::SeqCst), 2);
    assert_eq!(session.action_queue().insertion_count(), 2);
}

#[tokio::test]
async fn chain_is_inserted_from_its_end() {
    let fx = fixture();
    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();

    let head = node(&fx, 1, "head");
    let middle = node(&fx, 2, "middle");
    let tail = node(&fx, 3, "tail");
    fx.model.set_property(&head, "next", &middle).unwrap();
    fx.model.set_property(&middle, "next", &tail).unwrap();

    session.persist(&head).await.unwrap();
    session.commit().await.unwrap();

    let ids: Vec<_> = fx
        .executed(StatementKind::Insert)
        .into_iter()
        .filter_map(|(_, id)| id)
        .collect();
    assert_eq!(ids, vec![Identifier::Int(3), Identifier::Int(2), Identifier::Int(1)]);
    assert_eq!(fx.storage.row_count("Node"), 3);
}

#[tokio::test]
async fn reference_to_a_transient_instance_is_rejected() {
    let fx = fixture();
    let mut session = fx.factory.open_session().await.unwrap();

    // Child's parent association doesn't cascade persist.
    let parent = fx.new_parent(1, "never saved");
    let child = fx.model.instantiate_with_id("Child", 10).unwrap();
    fx.model.set_property(&child, "name", "orphan").unwrap();
    fx.model.set_property(&child, "parent", &parent).unwrap();

    let err = session.persist(&child).await.unwrap_err();
    assert!(matches!(
        err,
        OrmError::TransientReference { ref entity, ref property } if entity == "Child" && property == "parent"
    ));
    assert!(!session.contains(&child));
    assert_eq!(session.action_queue().insertion_count(), 0);
}

#[tokio::test]
async fn reference_to_a_stored_detached_instance_is_accepted() {
    let fx = fixture();
    fx.seed_parent(1, 1, "stored");
    let mut session = fx.factory.open_session().await.unwrap();

    let parent = fx.new_parent(1, "stored");
    let child = fx.model.instantiate_with_id("Child", 10).unwrap();
    fx.model.set_property(&child, "name", "adopted").unwrap();
    fx.model.set_property(&child, "parent", &parent).unwrap();

    session.persist(&child).await.unwrap();
    assert!(session.contains(&child));
    assert!(!session.contains(&parent));
    assert_eq!(session.action_queue().insertion_count(), 1);

    session.begin().await.unwrap();
    session.commit().await.unwrap();
    assert_eq!(fx.storage.row_count("Child"), 1);
}

#[tokio::test]
async fn mutually_referencing_inserts_fail_at_flush() {
    let fx = fixture();
    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();

    let a = node(&fx, 1, "a");
    let b = node(&fx, 2, "b");
    fx.model.set_property(&a, "next", &b).unwrap();
    fx.model.set_property(&b, "next", &a).unwrap();
    session.persist(&a).await.unwrap();
    assert_eq!(session.action_queue().insertion_count(), 2);

    let err = session.flush().await.unwrap_err();
    assert!(matches!(err, OrmError::Configuration(ref m) if m.contains("cycle")));
    assert!(session.is_rollback_only());
    assert_eq!(fx.storage.row_count("Node"), 0);
    session.rollback().await.unwrap();
}

#[tokio::test]
async fn deleting_a_parent_deletes_its_lazy_children() {
    let fx = fixture();
    fx.seed_parent(1, 1, "p");
    fx.seed_child(10, "a", 1);
    fx.seed_child(11, "b", 1);
    fx.storage.put_row(
        "Child",
        Identifier::Int(12),
        vec![Datum::Text("unrelated".into()), Datum::Null],
    );
    {
        // Collection rows are not part of seeded rows; write them through a session.
        let mut session = fx.factory.open_session().await.unwrap();
        session.begin().await.unwrap();
        let parent = session.get("Parent", 1).await.unwrap().unwrap();
        let Value::Collection(children) = fx.model.property(&parent, "children").unwrap()
        else {
            panic!("children is not a collection");
        };
        session.initialize_collection(&children).await.unwrap();
        for id in [10, 11] {
            let child = session.load("Child", id).await.unwrap();
            children.add(child);
        }
        session.commit().await.unwrap();
    }
    assert_eq!(fx.storage.collection("Parent.children", &Identifier::Int(1)).len(), 2);

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let parent = session.get("Parent", 1).await.unwrap().unwrap();
    let Value::Collection(children) = fx.model.property(&parent, "children").unwrap()
    else {
        panic!("children is not a collection");
    };
    assert!(!children.is_initialized());

    session.delete(&parent).await.unwrap();
    assert!(children.is_initialized());
    assert_eq!(session.action_queue().deletion_count(), 3);
    for child in children.elements().unwrap() {
        let status = session.persistence_context().get_entry(&child).unwrap().status();
        assert_eq!(status, Status::Deleted);
    }
    session.commit().await.unwrap();

    assert_eq!(fx.storage.row_count("Parent"), 0);
    assert_eq!(fx.storage.row_count("Child"), 1);
}

#[tokio::test]
async fn detached_graph_merges_into_a_new_session() {
    let fx = fixture();
    {
        let mut session = fx.factory.open_session().await.unwrap();
        session.begin().await.unwrap();
        let parent = fx.new_parent(1, "p");
        fx.new_child(10, "first", &parent);
        session.persist(&parent).await.unwrap();
        session.commit().await.unwrap();
    }

    // Load a graph in one session and modify it after the session is gone.
    let detached = {
        let mut session = fx.factory.open_session().await.unwrap();
        let parent = session.get("Parent", 1).await.unwrap().unwrap();
        let Value::Collection(children) = fx.model.property(&parent, "children").unwrap()
        else {
            panic!("children is not a collection");
        };
        session.initialize_collection(&children).await.unwrap();
        session.close().await.unwrap();
        parent
    };
    fx.model.set_property(&detached, "name", "renamed offline").unwrap();
    let added = fx.new_child(11, "second", &detached);

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let merged = session.merge(&detached).await.unwrap();
    assert!(!merged.ptr_eq(&detached));
    assert!(!session.contains(&detached));
    assert!(!session.contains(&added));
    assert_eq!(fx.text(&merged, "name"), "renamed offline");

    let Value::Collection(children) = fx.model.property(&merged, "children").unwrap()
    else {
        panic!("children is not a collection");
    };
    let elements = children.elements().unwrap();
    assert_eq!(elements.len(), 2);
    assert!(elements.iter().all(|c| session.contains(c)));
    session.commit().await.unwrap();

    assert_eq!(fx.stored_name("Parent", 1), Some(Datum::Text("renamed offline".into())));
    assert!(fx.storage.row("Child", &Identifier::Int(11)).is_some());
    let mut stored = fx.storage.collection("Parent.children", &Identifier::Int(1));
    stored.sort();
    assert_eq!(stored, vec![Identifier::Int(10), Identifier::Int(11)]);
}

#[tokio::test]
async fn stale_detached_instance_is_not_merged() {
    let fx = fixture();
    fx.seed_parent(1, 1, "p");

    let stale = fx.new_parent(1, "stale");
    fx.model.set_property(&stale, "version", 1).unwrap();
    assert!(fx.storage.set_column("Parent", &Identifier::Int(1), "version", Datum::Int(2)));

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let err = session.merge(&stale).await.unwrap_err();
    assert!(matches!(err, OrmError::StaleObjectState { .. }));
    assert!(session.is_rollback_only());
}
