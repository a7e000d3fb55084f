//! Query-plan boundary.
//!
//! Plans are compiled elsewhere; the session only needs to know which tables a plan reads (its query spaces), what
//! it returns and how to bind and limit it.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::instance::EntityRef;
use crate::storage::StoredRow;
use crate::types::Datum;
use crate::types::FlushMode;
use crate::types::Identifier;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryReturn {
    /// Rows are instances of the named entity or its subclasses.
    Entity(Arc<str>),
    Scalars,
}

/// An opaque, already compiled query.
#[derive(Clone, Debug)]
pub struct QueryPlan {
    statement: String,
    spaces:    BTreeSet<String>,
    returns:   QueryReturn,
}

impl QueryPlan {
    /// A plan returning entities. The entity's own tables are always part of its query spaces.
    pub fn entity(statement: impl Into<String>, entity_name: impl Into<Arc<str>>) -> Self {
        Self {
            statement: statement.into(),
            spaces:    BTreeSet::new(),
            returns:   QueryReturn::Entity(entity_name.into()),
        }
    }

    pub fn scalar(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            spaces:    BTreeSet::new(),
            returns:   QueryReturn::Scalars,
        }
    }

    /// Adds a table the plan reads.
    pub fn with_space(mut self, table: impl Into<String>) -> Self {
        self.spaces.insert(table.into());
        self
    }

    #[inline]
    pub fn statement(&self) -> &str {
        &self.statement
    }

    #[inline]
    pub fn spaces(&self) -> &BTreeSet<String> {
        &self.spaces
    }

    #[inline]
    pub fn returns(&self) -> &QueryReturn {
        &self.returns
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryParameters {
    named: BTreeMap<String, Datum>,
}

impl QueryParameters {
    pub fn bind(&mut self, name: impl Into<String>, value: impl Into<Datum>) {
        self.named.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Datum> {
        self.named.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Datum)> {
        self.named.iter()
    }
}

/// Row limits and execution hints of one query execution.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RowSelection {
    first_result: usize,
    // Zero or negative means unlimited.
    max_results:  i64,
    fetch_size:   Option<u32>,
    timeout_secs: Option<u64>,
}

impl RowSelection {
    pub fn with_first_result(mut self, first_result: usize) -> Self {
        self.first_result = first_result;
        self
    }

    pub fn with_max_results(mut self, max_results: i64) -> Self {
        self.max_results = max_results;
        self
    }

    pub fn with_fetch_size(mut self, fetch_size: u32) -> Self {
        self.fetch_size = Some(fetch_size);
        self
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_secs = Some(seconds);
        self
    }

    #[inline]
    pub fn first_result(&self) -> usize {
        self.first_result
    }

    /// Row cap, `None` when unlimited.
    pub fn max_results(&self) -> Option<usize> {
        (self.max_results > 0).then_some(self.max_results as usize)
    }

    #[inline]
    pub fn fetch_size(&self) -> Option<u32> {
        self.fetch_size
    }

    /// Statement time limit, `None` when unset or zero.
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.filter(|secs| *secs > 0).map(Duration::from_secs)
    }

    /// Seconds as set on the query. `Some(0)` still overrides the factory default.
    #[inline]
    pub fn timeout_secs(&self) -> Option<u64> {
        self.timeout_secs
    }

    /// Applies offset and cap to fully materialized rows.
    pub fn apply<T>(&self, rows: Vec<T>) -> Vec<T> {
        let rows = rows.into_iter().skip(self.first_result);
        match self.max_results() {
            Some(max) => rows.take(max).collect(),
            None => rows.collect(),
        }
    }
}

/// Row produced by a storage for a query.
#[derive(Clone, Debug, PartialEq)]
pub enum QueryRow {
    Entity { id: Identifier, row: StoredRow },
    Scalars(Vec<Datum>),
}

/// Row handed back to the application.
#[derive(Clone, Debug)]
pub enum QueryResult {
    Entity(EntityRef),
    Scalars(Vec<Datum>),
}

impl QueryResult {
    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            QueryResult::Entity(e) => Some(e),
            QueryResult::Scalars(_) => None,
        }
    }

    pub fn into_entity(self) -> Option<EntityRef> {
        match self {
            QueryResult::Entity(e) => Some(e),
            QueryResult::Scalars(_) => None,
        }
    }

    pub fn as_scalars(&self) -> Option<&[Datum]> {
        match self {
            QueryResult::Scalars(row) => Some(row),
            QueryResult::Entity(_) => None,
        }
    }
}

/// A plan with its bindings and execution options.
#[derive(Clone, Debug)]
pub struct Query {
    plan:       QueryPlan,
    parameters: QueryParameters,
    selection:  RowSelection,
    flush_mode: Option<FlushMode>,
}

impl Query {
    pub fn new(plan: QueryPlan) -> Self {
        Self {
            plan,
            parameters: QueryParameters::default(),
            selection: RowSelection::default(),
            flush_mode: None,
        }
    }

    pub fn bind(mut self, name: impl Into<String>, value: impl Into<Datum>) -> Self {
        self.parameters.bind(name, value);
        self
    }

    pub fn first_result(mut self, first_result: usize) -> Self {
        self.selection = self.selection.with_first_result(first_result);
        self
    }

    pub fn max_results(mut self, max_results: i64) -> Self {
        self.selection = self.selection.with_max_results(max_results);
        self
    }

    pub fn fetch_size(mut self, fetch_size: u32) -> Self {
        self.selection = self.selection.with_fetch_size(fetch_size);
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.selection = self.selection.with_timeout(seconds);
        self
    }

    /// Overrides the session flush mode for this execution.
    pub fn flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = Some(flush_mode);
        self
    }

    #[inline]
    pub fn plan(&self) -> &QueryPlan {
        &self.plan
    }

    #[inline]
    pub fn parameters(&self) -> &QueryParameters {
        &self.parameters
    }

    #[inline]
    pub fn selection(&self) -> &RowSelection {
        &self.selection
    }

    #[inline]
    pub fn flush_mode_override(&self) -> Option<FlushMode> {
        self.flush_mode
    }
}

/// Cancels the statement a session is currently executing. Obtained from
/// [`Session::statement_canceller`](crate::session::Session::statement_canceller) and usable from any task.
#[derive(Clone, Debug, Default)]
pub struct StatementCanceller {
    notify: Arc<Notify>,
}

impl StatementCanceller {
    /// Has no effect when no statement is running.
    pub fn cancel(&self) {
        self.notify.notify_waiters();
    }

    pub(crate) async fn cancelled(&self) {
        self.notify.notified().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_limits() {
        let rows: Vec<i32> = (0..10).collect();
        assert_eq!(RowSelection::default().apply(rows.clone()).len(), 10);
        assert_eq!(
            RowSelection::default().with_first_result(2).with_max_results(3).apply(rows.clone()),
            vec![2, 3, 4]
        );
        assert_eq!(RowSelection::default().with_max_results(-1).apply(rows.clone()).len(), 10);
        assert_eq!(RowSelection::default().with_max_results(0).max_results(), None);
        assert!(RowSelection::default().with_first_result(20).apply(rows).is_empty());
    }

    #[test]
    fn query_builder_collects_options() {
        let query = Query::new(QueryPlan::entity("children of", "Child").with_space("child"))
            .bind("parent", 1i64)
            .timeout(3)
            .flush_mode(FlushMode::Commit);
        assert_eq!(query.parameters().get("parent"), Some(&Datum::Int(1)));
        assert_eq!(query.selection().timeout(), Some(Duration::from_secs(3)));
        assert_eq!(query.flush_mode_override(), Some(FlushMode::Commit));
        assert!(query.plan().spaces().contains("child"));
    }

    #[test]
    fn zero_timeout_means_no_limit() {
        let selection = RowSelection::default().with_timeout(0);
        assert_eq!(selection.timeout(), None);
        assert_eq!(selection.timeout_secs(), Some(0));
        assert_eq!(RowSelection::default().timeout(), None);
    }
}
