mod common;

use wb_session::storage::memory::StatementKind;
use wb_session::types::Datum;
use wb_session::types::Identifier;
use wb_session::types::Status;
use wb_session::types::Value;
use wb_session::EntityRef;
use wb_session::FactoryRegistry;
use wb_session::OrmError;
use wb_session::SessionSnapshot;

use common::fixture;
use common::Fixture;

fn parent_of(fx: &Fixture, child: &EntityRef) -> EntityRef {
    match fx.model.property(child, "parent").unwrap() {
        Value::Entity(parent) => parent,
        other => panic!("child has no parent reference: {other:?}"),
    }
}

#[tokio::test]
async fn restored_session_commits_captured_work() {
    let fx = fixture();
    fx.seed_parent(1, 1, "referenced");
    fx.seed_parent(2, 1, "doomed");
    fx.seed_child(10, "c", 1);

    let snapshot = {
        let mut session = fx.factory.open_session().await.unwrap();
        let child = session.get("Child", 10).await.unwrap().unwrap();
        assert!(parent_of(&fx, &child).is_uninitialized_proxy());
        fx.model.set_property(&child, "name", "renamed").unwrap();

        let doomed = session.get("Parent", 2).await.unwrap().unwrap();
        session.delete(&doomed).await.unwrap();
        session.persist(&fx.new_parent(3, "queued")).await.unwrap();
        assert_eq!(session.action_queue().insertion_count(), 1);
        assert_eq!(session.action_queue().deletion_count(), 1);

        let bytes = session.snapshot().unwrap().to_bytes().unwrap();
        session.close().await.unwrap();
        SessionSnapshot::from_bytes(&bytes).unwrap()
    };
    assert_eq!(snapshot.factory_uuid(), fx.factory.uuid());
    assert_eq!(snapshot.entity_count(), 3);

    let registry = FactoryRegistry::new();
    registry.register(&fx.factory);
    let mut restored = snapshot.restore(&registry).await.unwrap();
    assert_eq!(restored.action_queue().insertion_count(), 1);
    assert_eq!(restored.action_queue().deletion_count(), 1);

    fx.storage.clear_statements();
    let child = restored.get("Child", 10).await.unwrap().unwrap();
    assert!(fx.executed(StatementKind::Select).is_empty());
    assert_eq!(fx.text(&child, "name"), "renamed");

    let proxy = parent_of(&fx, &child);
    assert!(proxy.is_uninitialized_proxy());
    assert!(restored.get_reference("Parent", 1).unwrap().ptr_eq(&proxy));
    let doomed = restored
        .persistence_context()
        .entities_in_order()
        .into_iter()
        .find(|e| e.id() == Some(Identifier::Int(2)))
        .unwrap();
    assert_eq!(
        restored.persistence_context().get_entry(&doomed).unwrap().status(),
        Status::Deleted
    );

    restored.begin().await.unwrap();
    restored.commit().await.unwrap();
    assert_eq!(
        fx.executed(StatementKind::Insert),
        vec![("parent".to_string(), Some(Identifier::Int(3)))]
    );
    assert_eq!(
        fx.executed(StatementKind::Delete),
        vec![("parent".to_string(), Some(Identifier::Int(2)))]
    );
    assert_eq!(
        fx.executed(StatementKind::Update),
        vec![("child".to_string(), Some(Identifier::Int(10)))]
    );
    assert_eq!(fx.stored_name("Child", 10), Some(Datum::Text("renamed".into())));
    assert!(fx.storage.row("Parent", &Identifier::Int(2)).is_none());

    // The proxy still works in its new session.
    let parent = restored.initialize(&proxy).await.unwrap();
    assert_eq!(fx.text(&parent, "name"), "referenced");
}

#[tokio::test]
async fn shared_references_stay_shared() {
    let fx = fixture();
    fx.seed_parent(1, 1, "p");
    fx.seed_child(10, "a", 1);
    fx.seed_child(11, "b", 1);

    let mut session = fx.factory.open_session().await.unwrap();
    let a = session.get("Child", 10).await.unwrap().unwrap();
    let b = session.get("Child", 11).await.unwrap().unwrap();
    assert!(parent_of(&fx, &a).ptr_eq(&parent_of(&fx, &b)));
    let bytes = session.snapshot().unwrap().to_bytes().unwrap();

    let registry = FactoryRegistry::new();
    registry.register(&fx.factory);
    let mut restored = SessionSnapshot::from_bytes(&bytes)
        .unwrap()
        .restore(&registry)
        .await
        .unwrap();
    assert_ne!(restored.id(), session.id());

    let a = restored.get("Child", 10).await.unwrap().unwrap();
    let b = restored.get("Child", 11).await.unwrap().unwrap();
    assert!(parent_of(&fx, &a).ptr_eq(&parent_of(&fx, &b)));
    assert!(!parent_of(&fx, &a).ptr_eq(&parent_of(&fx, &session.get("Child", 10).await.unwrap().unwrap())));
}

#[tokio::test]
async fn capture_restrictions() {
    let fx = fixture();
    fx.seed_parent(1, 1, "p");

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    session.get("Parent", 1).await.unwrap().unwrap();
    assert!(matches!(session.snapshot(), Err(OrmError::Snapshot(_))));
    session.commit().await.unwrap();

    let snapshot = session.snapshot().unwrap();
    assert_eq!(snapshot.entity_count(), 1);

    // Restoring needs the factory to be known.
    let registry = FactoryRegistry::new();
    assert!(matches!(snapshot.restore(&registry).await, Err(OrmError::Snapshot(_))));
    registry.register(&fx.factory);
    assert!(snapshot.restore(&registry).await.is_ok());
    assert!(registry.unregister(&fx.factory.uuid()));
    assert!(registry.is_empty());

    session.close().await.unwrap();
    assert!(matches!(session.snapshot(), Err(OrmError::SessionClosed)));
    assert!(matches!(SessionSnapshot::from_bytes(&[0xff, 0x01]), Err(OrmError::Snapshot(_))));
}
