mod common;

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::hash::Hash;
use std::hash::Hasher;
use std::sync::Arc;
use wb_session::interceptor::Interceptor;
use wb_session::key::TenantId;
use wb_session::query::Query;
use wb_session::query::QueryPlan;
use wb_session::query::QueryRow;
use wb_session::storage::memory::StatementKind;
use wb_session::types::Datum;
use wb_session::types::Identifier;
use wb_session::types::Interception;
use wb_session::types::Value;
use wb_session::EntityKey;
use wb_session::EntityRef;
use wb_session::OrmError;

use common::fixture;

/// Hands back a state with no values at all.
struct TruncatingLoader;

#[async_trait]
impl Interceptor for TruncatingLoader {
    async fn on_load(
        &self,
        _entity: &EntityRef,
        _id: &Identifier,
        _state: &[Value],
        _property_names: &[Arc<str>],
    ) -> Interception {
        Interception::Rewrite(vec![])
    }
}

fn hash_of(key: &EntityKey) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish()
}

#[tokio::test]
async fn one_instance_per_row() {
    let fx = fixture();
    fx.seed_parent(1, 1, "first");
    fx.storage.register_query("all parents", |tables, _| {
        Ok(tables
            .rows("Parent")
            .into_iter()
            .map(|(id, row)| QueryRow::Entity { id, row })
            .collect())
    });

    let mut session = fx.factory.open_session().await.unwrap();
    let got = session.get("Parent", 1).await.unwrap().unwrap();
    let loaded = session.load("Parent", 1).await.unwrap();
    let reference = session.get_reference("Parent", 1).unwrap();
    assert!(got.ptr_eq(&loaded));
    assert!(got.ptr_eq(&reference));

    let listed = session
        .list(&Query::new(QueryPlan::entity("all parents", "Parent")))
        .await
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert!(listed[0].as_entity().unwrap().ptr_eq(&got));

    let detached = fx.new_parent(1, "renamed");
    fx.model.set_property(&detached, "version", 1).unwrap();
    let merged = session.merge(&detached).await.unwrap();
    assert!(merged.ptr_eq(&got));
    assert!(!merged.ptr_eq(&detached));
    assert_eq!(fx.text(&got, "name"), "renamed");

    // Only the first access reached the storage.
    assert_eq!(fx.executed(StatementKind::Select).len(), 1);
}

#[tokio::test]
async fn second_instance_for_a_managed_row_is_rejected() {
    let fx = fixture();
    fx.seed_parent(1, 1, "first");

    let mut session = fx.factory.open_session().await.unwrap();
    let managed = session.get("Parent", 1).await.unwrap().unwrap();
    let impostor = fx.new_parent(1, "impostor");
    let err = session.persist(&impostor).await.unwrap_err();
    assert!(matches!(err, OrmError::DuplicateIdentity(ref key) if key.id() == &Identifier::Int(1)));
    assert!(session.contains(&managed));
    assert!(!session.contains(&impostor));
}

#[tokio::test]
async fn keys_round_trip_through_the_context() {
    let fx = fixture();
    fx.seed_parent(7, 1, "seven");

    let first = EntityKey::new("Parent", Identifier::Int(7), TenantId::Default);
    let second = EntityKey::new("Parent", Identifier::Int(7), TenantId::Default);
    assert_eq!(first, second);
    assert_eq!(hash_of(&first), hash_of(&second));
    assert_ne!(first, EntityKey::new("Parent", Identifier::Int(7), TenantId::Named("acme".into())));

    let mut session = fx.factory.open_session().await.unwrap();
    let parent = session.get("Parent", 7).await.unwrap().unwrap();
    let found = session.persistence_context().get_entity(&second).unwrap();
    assert!(found.ptr_eq(&parent));
}

#[tokio::test]
async fn tenants_do_not_share_instances() {
    let fx = fixture();
    fx.seed_parent(1, 1, "shared");

    let mut acme = fx.factory.session_builder().tenant("acme").open().await.unwrap();
    let parent = acme.get("Parent", 1).await.unwrap().unwrap();
    let acme_key = EntityKey::new("Parent", Identifier::Int(1), TenantId::Named("acme".into()));
    assert!(acme.persistence_context().get_entity(&acme_key).unwrap().ptr_eq(&parent));
    let default_key = EntityKey::new("Parent", Identifier::Int(1), TenantId::Default);
    assert!(acme.persistence_context().get_entity(&default_key).is_none());
}

#[tokio::test]
async fn absent_rows() {
    let fx = fixture();
    let mut session = fx.factory.open_session().await.unwrap();
    assert!(session.get("Parent", 404).await.unwrap().is_none());
    let err = session.load("Parent", 404).await.unwrap_err();
    assert!(matches!(err, OrmError::EntityNotFound { .. }));

    let proxy = session.get_reference("Parent", 404).unwrap();
    assert!(proxy.is_uninitialized_proxy());
    let err = session.initialize(&proxy).await.unwrap_err();
    assert!(matches!(err, OrmError::EntityNotFound { .. }));

    let err = session.get("Parent", "text id").await.unwrap_err();
    assert!(matches!(err, OrmError::IllegalArgument(_)));
}

#[tokio::test]
async fn proxy_becomes_the_loaded_instance() {
    let fx = fixture();
    fx.seed_parent(1, 1, "lazy");
    fx.seed_child(10, "kid", 1);

    let mut session = fx.factory.open_session().await.unwrap();
    let child = session.get("Child", 10).await.unwrap().unwrap();
    let Value::Entity(parent) = fx.model.property(&child, "parent").unwrap()
    else {
        panic!("child has no parent reference");
    };
    assert!(parent.is_uninitialized_proxy());
    assert_eq!(fx.executed(StatementKind::Select).len(), 1);

    let initialized = session.initialize(&parent).await.unwrap();
    assert!(parent.is_initialized());
    assert!(parent.same_target(&initialized));
    assert_eq!(fx.text(&parent, "name"), "lazy");

    let again = session.get("Parent", 1).await.unwrap().unwrap();
    assert!(again.same_target(&parent));
    assert_eq!(fx.stored_name("Parent", 1), Some(Datum::Text("lazy".into())));
}

#[tokio::test]
async fn rejected_load_rewrite_leaves_nothing_behind() {
    let fx = fixture();
    fx.seed_parent(1, 1, "p");
    let mut session = fx
        .factory
        .session_builder()
        .interceptor(Arc::new(TruncatingLoader))
        .open()
        .await
        .unwrap();

    let err = session.get("Parent", 1).await.unwrap_err();
    assert!(matches!(err, OrmError::IllegalArgument(_)));
    assert_eq!(session.persistence_context().entity_count(), 0);
    assert_eq!(session.persistence_context().collection_count(), 0);

    // Nothing half-loaded is served from the context.
    assert!(matches!(session.get("Parent", 1).await, Err(OrmError::IllegalArgument(_))));
    assert_eq!(session.persistence_context().entity_count(), 0);
}
