use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use super::Session;
use crate::error::OrmError;
use crate::error::Result;
use crate::procedure::ProcedureCall;
use crate::procedure::ProcedureOutputs;
use crate::query::Query;
use crate::query::QueryPlan;
use crate::query::QueryResult;
use crate::query::QueryReturn;
use crate::query::QueryRow;
use crate::query::StatementCanceller;
use crate::storage::StorageResult;
use crate::types::FlushMode;
use crate::types::LockMode;

/// Runs a statement under the timeout, racing it against cancellation.
async fn guarded<T>(
    statement: impl Future<Output = StorageResult<T>>,
    canceller: &StatementCanceller,
    timeout_secs: Option<u64>,
) -> Result<T> {
    let run = async {
        match timeout_secs {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), statement).await {
                Ok(result) => Ok(result?),
                Err(_) => Err(OrmError::QueryTimeout(secs)),
            },
            None => Ok(statement.await?),
        }
    };
    tokio::select! {
        result = run => result,
        _ = canceller.cancelled() => Err(OrmError::QueryCancelled),
    }
}

impl Session {
    /// Executes a query. Pending changes touching the tables it reads are flushed first, according to the flush
    /// mode. Entity rows already managed by the session come back as the managed instances.
    pub async fn list(&mut self, query: &Query) -> Result<Vec<QueryResult>> {
        let result = self.list_top(query).await;
        self.funnel(result)
    }

    /// At most one result. More than one distinct result is an error.
    pub async fn unique_result(&mut self, query: &Query) -> Result<Option<QueryResult>> {
        let result = self.list_top(query).await.and_then(unique);
        self.funnel(result)
    }

    /// Exactly one result.
    pub async fn single_result(&mut self, query: &Query) -> Result<QueryResult> {
        let result = self
            .list_top(query)
            .await
            .and_then(unique)
            .and_then(|r| r.ok_or(OrmError::NoResult));
        self.funnel(result)
    }

    /// Calls a stored procedure. Procedures may touch any table, so anything queued is flushed first unless the
    /// flush mode defers it to commit.
    pub async fn execute_procedure(&mut self, call: &ProcedureCall) -> Result<ProcedureOutputs> {
        let result = self.execute_procedure_top(call).await;
        self.funnel(result)
    }

    #[instrument(level = "debug", skip(self, query), fields(session = %self.id, statement = query.plan().statement()))]
    async fn list_top(&mut self, query: &Query) -> Result<Vec<QueryResult>> {
        self.check_open()?;
        let spaces = self.query_spaces(query.plan())?;
        let flush_mode = query.flush_mode_override().unwrap_or(self.flush_mode);
        self.auto_flush_if_required(&spaces, flush_mode).await?;

        let timeout = query
            .selection()
            .timeout_secs()
            .or(self.factory.options().query_timeout())
            .filter(|secs| *secs > 0);
        let canceller = self.canceller.clone();
        let rows = guarded(
            self.conn
                .execute_query(query.plan(), query.parameters(), query.selection()),
            &canceller,
            timeout,
        )
        .await?;
        trace!("[session {}] query returned {} rows", self.id, rows.len());

        self.context.before_load();
        let results = self.assemble_rows(rows).await;
        self.finish_load(results).await
    }

    fn query_spaces(&self, plan: &QueryPlan) -> Result<BTreeSet<String>> {
        let mut spaces = plan.spaces().clone();
        if let QueryReturn::Entity(entity_name) = plan.returns() {
            spaces.extend(self.persister(entity_name)?.query_spaces());
        }
        Ok(spaces)
    }

    async fn assemble_rows(&mut self, rows: Vec<QueryRow>) -> Result<Vec<QueryResult>> {
        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            match row {
                QueryRow::Scalars(values) => results.push(QueryResult::Scalars(values)),
                QueryRow::Entity { id, row } => {
                    let persister = self.persister(&row.entity_name)?;
                    let key = persister.entity_key(id, &self.tenant);
                    if let Some(entity) = self.context.get_entity(&key) {
                        let deleted = self
                            .context
                            .get_entry(&entity)
                            .is_some_and(|e| e.status().is_deleted_or_gone());
                        if !deleted {
                            results.push(QueryResult::Entity(entity));
                        }
                        continue;
                    }
                    let target = self.context.get_proxy(&key);
                    if let Some(entity) = self.assemble(&key, row, LockMode::Read, target, true).await? {
                        results.push(QueryResult::Entity(entity));
                    }
                }
            }
        }
        Ok(results)
    }

    #[instrument(level = "debug", skip(self, call), fields(session = %self.id, procedure = call.name()))]
    async fn execute_procedure_top(&mut self, call: &ProcedureCall) -> Result<ProcedureOutputs> {
        self.check_open()?;
        call.validate()?;
        if matches!(self.flush_mode, FlushMode::Auto | FlushMode::Always) {
            self.auto_flush_if_required(&BTreeSet::new(), FlushMode::Always)
                .await?;
        }
        debug!("[session {}] calling procedure '{}'", self.id, call.name());
        let timeout = self.factory.options().query_timeout().filter(|secs| *secs > 0);
        let canceller = self.canceller.clone();
        guarded(self.conn.execute_procedure(call), &canceller, timeout).await
    }
}

fn unique(results: Vec<QueryResult>) -> Result<Option<QueryResult>> {
    let mut distinct: Vec<QueryResult> = Vec::new();
    for result in results {
        let seen = match &result {
            QueryResult::Entity(entity) => distinct
                .iter()
                .filter_map(QueryResult::as_entity)
                .any(|e| e.same_target(entity)),
            QueryResult::Scalars(_) => false,
        };
        if !seen {
            distinct.push(result);
        }
    }
    match distinct.len() {
        0 | 1 => Ok(distinct.pop()),
        count => Err(OrmError::NonUniqueResult(count)),
    }
}
