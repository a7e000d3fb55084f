mod common;

use std::collections::BTreeMap;
use std::time::Duration;
use std::time::Instant;
use wb_session::procedure::ParameterKey;
use wb_session::procedure::ParameterMode;
use wb_session::procedure::ProcedureCall;
use wb_session::procedure::ProcedureOutputs;
use wb_session::query::Query;
use wb_session::query::QueryPlan;
use wb_session::query::QueryRow;
use wb_session::storage::memory::StatementKind;
use wb_session::types::Datum;
use wb_session::types::FlushMode;
use wb_session::types::Identifier;
use wb_session::OrmError;
use wb_session::SessionFactoryOptions;

use common::fixture;
use common::fixture_with;
use common::Fixture;

fn register_parent_queries(fx: &Fixture) {
    fx.storage.register_query("parents", |tables, _| {
        Ok(tables
            .rows("Parent")
            .into_iter()
            .map(|(id, row)| QueryRow::Entity { id, row })
            .collect())
    });
    fx.storage.register_query("parent by name", |tables, params| {
        let wanted = params.get("name").cloned();
        Ok(tables
            .rows("Parent")
            .into_iter()
            .filter(|(_, row)| Some(&row.values[1]) == wanted.as_ref())
            .map(|(id, row)| QueryRow::Entity { id, row })
            .collect())
    });
    fx.storage
        .register_slow_query("slow parents", Duration::from_secs(3), |tables, _| {
            Ok(tables
                .rows("Parent")
                .into_iter()
                .map(|(id, row)| QueryRow::Entity { id, row })
                .collect())
        });
}

#[tokio::test]
async fn results_are_paged_and_bound() {
    let fx = fixture();
    register_parent_queries(&fx);
    for id in 1..=5 {
        fx.seed_parent(id, 1, &format!("p{id}"));
    }

    let mut session = fx.factory.open_session().await.unwrap();
    let page = session
        .list(&Query::new(QueryPlan::entity("parents", "Parent")).first_result(1).max_results(2))
        .await
        .unwrap();
    let ids: Vec<_> = page.iter().map(|r| r.as_entity().unwrap().id().unwrap()).collect();
    assert_eq!(ids, vec![Identifier::Int(2), Identifier::Int(3)]);

    let found = session
        .single_result(&Query::new(QueryPlan::entity("parent by name", "Parent")).bind("name", "p4"))
        .await
        .unwrap();
    assert_eq!(fx.text(found.as_entity().unwrap(), "name"), "p4");
    assert!(found.as_entity().unwrap().ptr_eq(&session.get("Parent", 4).await.unwrap().unwrap()));
}

#[tokio::test]
async fn unique_result_outcomes() {
    let fx = fixture();
    register_parent_queries(&fx);
    fx.seed_parent(1, 1, "twin");
    fx.seed_parent(2, 1, "twin");
    fx.seed_parent(3, 1, "single");

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();

    let by_name = |name: &str| Query::new(QueryPlan::entity("parent by name", "Parent")).bind("name", name);
    let err = session.unique_result(&by_name("twin")).await.unwrap_err();
    assert!(matches!(err, OrmError::NonUniqueResult(2)));
    assert!(!session.is_rollback_only());

    assert!(session.unique_result(&by_name("nobody")).await.unwrap().is_none());
    let err = session.single_result(&by_name("nobody")).await.unwrap_err();
    assert!(matches!(err, OrmError::NoResult));
    assert!(!session.is_rollback_only());

    let single = session.unique_result(&by_name("single")).await.unwrap().unwrap();
    assert_eq!(fx.text(single.as_entity().unwrap(), "name"), "single");
    session.commit().await.unwrap();
}

#[tokio::test]
async fn slow_query_times_out() {
    let fx = fixture();
    register_parent_queries(&fx);
    fx.seed_parent(1, 1, "p");

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let started = Instant::now();
    let err = session
        .list(&Query::new(QueryPlan::entity("slow parents", "Parent")).timeout(1))
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::QueryTimeout(1)));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(!session.is_rollback_only());

    // The session stays usable.
    assert_eq!(session.list(&Query::new(QueryPlan::entity("parents", "Parent"))).await.unwrap().len(), 1);
    session.commit().await.unwrap();
}

#[tokio::test]
async fn factory_timeout_applies_to_queries_without_one() {
    let fx = fixture_with(SessionFactoryOptions::builder().query_timeout(1).build().unwrap());
    register_parent_queries(&fx);

    let mut session = fx.factory.open_session().await.unwrap();
    let err = session
        .list(&Query::new(QueryPlan::entity("slow parents", "Parent")))
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::QueryTimeout(1)));
}

#[tokio::test]
async fn zero_query_timeout_lifts_the_limit() {
    let fx = fixture_with(SessionFactoryOptions::builder().query_timeout(1).build().unwrap());
    fx.seed_parent(1, 1, "p");
    register_parent_queries(&fx);
    // Slower than the factory default.
    fx.storage
        .register_slow_query("lingering parents", Duration::from_millis(1500), |tables, _| {
            Ok(tables
                .rows("Parent")
                .into_iter()
                .map(|(id, row)| QueryRow::Entity { id, row })
                .collect())
        });

    let mut session = fx.factory.open_session().await.unwrap();
    let rows = session
        .list(&Query::new(QueryPlan::entity("lingering parents", "Parent")).timeout(0))
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert!(!session.is_rollback_only());
}

#[tokio::test]
async fn running_query_can_be_cancelled() {
    let fx = fixture();
    register_parent_queries(&fx);

    let mut session = fx.factory.open_session().await.unwrap();
    session.begin().await.unwrap();
    let canceller = session.statement_canceller();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = session
        .list(&Query::new(QueryPlan::entity("slow parents", "Parent")))
        .await
        .unwrap_err();
    assert!(matches!(err, OrmError::QueryCancelled));
    assert!(started.elapsed() < Duration::from_secs(3));

    // A cancelled statement is not an expected query outcome.
    assert!(session.is_rollback_only());
    assert!(matches!(session.commit().await, Err(OrmError::RollbackOnly)));
}

#[test]
fn procedure_parameters_keep_one_style() {
    let mut call = ProcedureCall::new("archive");
    call.register_parameter("since", ParameterMode::In).unwrap();
    let err = call.register_positional_parameter(2, ParameterMode::Out).unwrap_err();
    assert!(matches!(err, OrmError::IllegalArgument(_)));

    let mut call = ProcedureCall::new("archive");
    call.register_positional_parameter(1, ParameterMode::In).unwrap();
    let err = call.register_parameter("since", ParameterMode::In).unwrap_err();
    assert!(matches!(err, OrmError::IllegalArgument(_)));
    assert!(call.bind(3usize, 1).is_err());
}

#[tokio::test]
async fn procedure_sees_pending_changes() {
    let fx = fixture();
    fx.storage.register_procedure("echo label", |call| {
        let mut outputs = BTreeMap::new();
        let label = call
            .parameters()
            .iter()
            .find_map(|p| p.value().cloned())
            .unwrap_or(Datum::Null);
        outputs.insert(ParameterKey::from("total"), label);
        Ok(ProcedureOutputs {
            outputs,
            rows: Vec::new(),
            update_count: Some(0),
        })
    });

    let mut call = ProcedureCall::new("echo label");
    call.register_parameter("label", ParameterMode::In).unwrap();
    call.register_parameter("total", ParameterMode::Out).unwrap();

    let mut session = fx.factory.open_session().await.unwrap();
    let err = session.execute_procedure(&call).await.unwrap_err();
    assert!(matches!(err, OrmError::IllegalState(_)));
    assert!(fx.executed(StatementKind::Procedure).is_empty());

    session.begin().await.unwrap();
    session.persist(&fx.new_parent(1, "pending")).await.unwrap();
    call.bind("label", "parents").unwrap();
    let outputs = session.execute_procedure(&call).await.unwrap();
    assert_eq!(outputs.output("total").unwrap(), &Datum::Text("parents".into()));

    let insert = fx.position_of(StatementKind::Insert, "parent").unwrap();
    let procedure = fx.position_of(StatementKind::Procedure, "echo label").unwrap();
    assert!(insert < procedure);
    session.commit().await.unwrap();
}

#[tokio::test]
async fn commit_mode_defers_procedure_flush() {
    let fx = fixture();
    fx.storage
        .register_procedure("noop", |_| Ok(ProcedureOutputs::default()));

    let mut session = fx.factory.session_builder().flush_mode(FlushMode::Commit).open().await.unwrap();
    session.begin().await.unwrap();
    session.persist(&fx.new_parent(1, "later")).await.unwrap();
    session.execute_procedure(&ProcedureCall::new("noop")).await.unwrap();
    assert!(fx.executed(StatementKind::Insert).is_empty());
    session.commit().await.unwrap();
    assert_eq!(fx.executed(StatementKind::Insert).len(), 1);
}
