//! In-memory reference storage.
//!
//! Tables live behind one lock shared by all connections. Foreign keys of many-to-one properties are enforced,
//! collection rows are removed together with either end, and every statement is appended to a log that tests use to
//! check ordering. Transactions keep an undo log; writes inside a transaction hold row locks until it completes.

use async_trait::async_trait;
use parking_lot::Mutex;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use tracing::instrument;
use tracing::trace;

use super::Connection;
use super::Storage;
use super::StorageResult;
use super::StoredRow;
use crate::error::StorageError;
use crate::mapping::CollectionPersister;
use crate::mapping::EntityPersister;
use crate::mapping::Metamodel;
use crate::mapping::PropertyKind;
use crate::procedure::ProcedureCall;
use crate::procedure::ProcedureOutputs;
use crate::query::QueryParameters;
use crate::query::QueryPlan;
use crate::query::QueryRow;
use crate::query::RowSelection;
use crate::types::Datum;
use crate::types::Identifier;
use crate::types::IdentifierType;
use crate::types::LockMode;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Select,
    Insert,
    Update,
    Delete,
    Upsert,
    VersionCheck,
    VersionUpdate,
    Lock,
    Sequence,
    CollectionSelect,
    CollectionInsert,
    CollectionDelete,
    CollectionRemove,
    Query,
    Procedure,
    Commit,
    Rollback,
}

/// One executed statement.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub kind:       StatementKind,
    pub table:      String,
    pub id:         Option<Identifier>,
    pub values:     Vec<Datum>,
    pub connection: u64,
}

impl Display for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?} {}", self.kind, self.table)?;
        if let Some(ref id) = self.id {
            write!(f, " #{id}")?;
        }
        Ok(())
    }
}

type RowKey = (Arc<str>, Identifier);
type CollectionRowKey = (Arc<str>, Identifier);

#[derive(Default)]
struct Tables {
    rows:        HashMap<RowKey, StoredRow>,
    collections: HashMap<CollectionRowKey, Vec<Identifier>>,
    sequences:   HashMap<Arc<str>, i64>,
    row_locks:   HashMap<RowKey, u64>,
}

enum Undo {
    Row(RowKey, Option<StoredRow>),
    Collection(CollectionRowKey, Option<Vec<Identifier>>),
}

/// Read access to the tables for registered query handlers.
pub struct TableView<'a> {
    tables: &'a Tables,
}

impl TableView<'_> {
    /// Rows of a hierarchy by root entity name, ordered by identifier.
    pub fn rows(&self, root_entity_name: &str) -> Vec<(Identifier, StoredRow)> {
        let mut rows: Vec<_> = self
            .tables
            .rows
            .iter()
            .filter(|((root, _), _)| &**root == root_entity_name)
            .map(|((_, id), row)| (id.clone(), row.clone()))
            .collect();
        rows.sort_by(|a, b| a.0.cmp(&b.0));
        rows
    }

    pub fn collection(&self, role: &str, owner_id: &Identifier) -> Vec<Identifier> {
        self.tables
            .collections
            .get(&(Arc::from(role), owner_id.clone()))
            .cloned()
            .unwrap_or_default()
    }
}

pub type QueryHandler = Arc<dyn Fn(&TableView<'_>, &QueryParameters) -> StorageResult<Vec<QueryRow>> + Send + Sync>;
pub type ProcedureHandler = Arc<dyn Fn(&ProcedureCall) -> StorageResult<ProcedureOutputs> + Send + Sync>;

#[derive(Clone)]
struct RegisteredQuery {
    handler: QueryHandler,
    latency: Option<Duration>,
}

struct MemoryShared {
    metamodel:       Arc<Metamodel>,
    tables:          Mutex<Tables>,
    log:             Mutex<Vec<Statement>>,
    queries:         RwLock<HashMap<String, RegisteredQuery>>,
    procedures:      RwLock<HashMap<String, ProcedureHandler>>,
    failures:        Mutex<Vec<(StatementKind, StorageError)>>,
    next_connection: AtomicU64,
}

#[derive(Clone)]
pub struct MemoryStorage {
    shared: Arc<MemoryShared>,
}

impl MemoryStorage {
    pub fn new(metamodel: Arc<Metamodel>) -> Self {
        Self {
            shared: Arc::new(MemoryShared {
                metamodel,
                tables: Mutex::new(Tables::default()),
                log: Mutex::new(Vec::new()),
                queries: RwLock::new(HashMap::new()),
                procedures: RwLock::new(HashMap::new()),
                failures: Mutex::new(Vec::new()),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    fn root_of(&self, entity_name: &str) -> Option<Arc<str>> {
        self.shared
            .metamodel
            .entity_persister(entity_name)
            .ok()
            .map(|p| p.root_entity_name().clone())
    }

    pub fn statements(&self) -> Vec<Statement> {
        self.shared.log.lock().clone()
    }

    pub fn statements_of(&self, kind: StatementKind) -> Vec<Statement> {
        self.shared.log.lock().iter().filter(|s| s.kind == kind).cloned().collect()
    }

    pub fn clear_statements(&self) {
        self.shared.log.lock().clear();
    }

    pub fn row(&self, entity_name: &str, id: &Identifier) -> Option<StoredRow> {
        let root = self.root_of(entity_name)?;
        self.shared.tables.lock().rows.get(&(root, id.clone())).cloned()
    }

    pub fn row_count(&self, entity_name: &str) -> usize {
        let Some(root) = self.root_of(entity_name)
        else {
            return 0;
        };
        self.shared.tables.lock().rows.keys().filter(|(r, _)| *r == root).count()
    }

    /// Writes a row directly, bypassing constraints, transactions and the statement log. Meant for seeding and for
    /// simulating changes made by other applications.
    pub fn put_row(&self, entity_name: &str, id: Identifier, values: Vec<Datum>) {
        if let Some(root) = self.root_of(entity_name) {
            self.shared
                .tables
                .lock()
                .rows
                .insert((root, id), StoredRow::new(Arc::from(entity_name), values));
        }
    }

    /// Changes one column of an existing row directly. Returns `false` if the row or property doesn't exist.
    pub fn set_column(&self, entity_name: &str, id: &Identifier, property: &str, value: Datum) -> bool {
        let Ok(persister) = self.shared.metamodel.entity_persister(entity_name)
        else {
            return false;
        };
        let Some(accessor) = persister.accessors().accessor(property)
        else {
            return false;
        };
        let key = (persister.root_entity_name().clone(), id.clone());
        let mut tables = self.shared.tables.lock();
        match tables.rows.get_mut(&key) {
            Some(row) => {
                row.values[accessor.index()] = value;
                true
            }
            None => false,
        }
    }

    pub fn collection(&self, role: &str, owner_id: &Identifier) -> Vec<Identifier> {
        TableView {
            tables: &self.shared.tables.lock(),
        }
        .collection(role, owner_id)
    }

    pub fn register_query<F>(&self, statement: impl Into<String>, handler: F)
    where
        F: Fn(&TableView<'_>, &QueryParameters) -> StorageResult<Vec<QueryRow>> + Send + Sync + 'static,
    {
        self.shared.queries.write().insert(
            statement.into(),
            RegisteredQuery {
                handler: Arc::new(handler),
                latency: None,
            },
        );
    }

    /// Registers a query that takes at least `latency` to produce its rows.
    pub fn register_slow_query<F>(&self, statement: impl Into<String>, latency: Duration, handler: F)
    where
        F: Fn(&TableView<'_>, &QueryParameters) -> StorageResult<Vec<QueryRow>> + Send + Sync + 'static,
    {
        self.shared.queries.write().insert(
            statement.into(),
            RegisteredQuery {
                handler: Arc::new(handler),
                latency: Some(latency),
            },
        );
    }

    pub fn register_procedure<F>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(&ProcedureCall) -> StorageResult<ProcedureOutputs> + Send + Sync + 'static,
    {
        self.shared.procedures.write().insert(name.into(), Arc::new(handler));
    }

    /// Makes the next statement of the given kind fail with `error`.
    pub fn fail_next(&self, kind: StatementKind, error: StorageError) {
        self.shared.failures.lock().push((kind, error));
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn connect(&self) -> StorageResult<Box<dyn Connection>> {
        let id = self.shared.next_connection.fetch_add(1, Ordering::Relaxed);
        debug!("Memory storage connection {id} opened");
        Ok(Box::new(MemoryConnection {
            id,
            shared: self.shared.clone(),
            undo: None,
        }))
    }
}

pub struct MemoryConnection {
    id:     u64,
    shared: Arc<MemoryShared>,
    // Present while a transaction is active.
    undo:   Option<Vec<Undo>>,
}

impl MemoryConnection {
    fn log(&self, kind: StatementKind, table: &str, id: Option<&Identifier>, values: &[Datum]) {
        let statement = Statement {
            kind,
            table: table.to_string(),
            id: id.cloned(),
            values: values.to_vec(),
            connection: self.id,
        };
        trace!("[conn {}] {statement}", self.id);
        self.shared.log.lock().push(statement);
    }

    fn injected_failure(&self, kind: StatementKind) -> StorageResult<()> {
        let mut failures = self.shared.failures.lock();
        match failures.iter().position(|(k, _)| *k == kind) {
            Some(pos) => Err(failures.remove(pos).1),
            None => Ok(()),
        }
    }

    fn row_key(persister: &EntityPersister, id: &Identifier) -> RowKey {
        (persister.root_entity_name().clone(), id.clone())
    }

    fn collection_key(persister: &CollectionPersister, owner_id: &Identifier) -> CollectionRowKey {
        (persister.role().clone(), owner_id.clone())
    }

    // Row locks are only held inside a transaction.
    fn acquire_row_lock(&self, tables: &mut Tables, key: &RowKey) -> StorageResult<()> {
        match tables.row_locks.get(key) {
            Some(&holder) if holder != self.id => Err(StorageError::new(
                StorageError::LOCK_NOT_AVAILABLE,
                format!("row {}#{} is locked by another transaction", key.0, key.1),
            )),
            _ => {
                if self.undo.is_some() {
                    tables.row_locks.insert(key.clone(), self.id);
                }
                Ok(())
            }
        }
    }

    fn release_row_locks(&self) {
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        tables.row_locks.retain(|_, holder| *holder != self.id);
    }

    fn record_row(&mut self, tables: &Tables, key: &RowKey) {
        if let Some(undo) = self.undo.as_mut() {
            undo.push(Undo::Row(key.clone(), tables.rows.get(key).cloned()));
        }
    }

    fn record_collection(&mut self, tables: &Tables, key: &CollectionRowKey) {
        if let Some(undo) = self.undo.as_mut() {
            undo.push(Undo::Collection(key.clone(), tables.collections.get(key).cloned()));
        }
    }

    fn check_foreign_keys(&self, tables: &Tables, persister: &EntityPersister, row: &StoredRow) -> StorageResult<()> {
        for (prop, value) in persister.properties().iter().zip(row.values.iter()) {
            let PropertyKind::ManyToOne { ref target, .. } = prop.kind()
            else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            let target_root = self
                .shared
                .metamodel
                .entity_persister(target)
                .map(|p| p.root_entity_name().clone())
                .map_err(|e| StorageError::new(StorageError::GENERIC, e.to_string()))?;
            let target_id = Identifier::from_datum(value).ok_or_else(|| {
                StorageError::new(StorageError::GENERIC, format!("bad foreign key value {value}"))
            })?;
            if !tables.rows.contains_key(&(target_root, target_id)) {
                return Err(StorageError::new(
                    StorageError::FOREIGN_KEY_VIOLATION,
                    format!("{} references missing {target}#{value}", persister.table()),
                )
                .with_constraint(format!("fk_{}_{}", persister.table(), prop.name())));
            }
        }
        Ok(())
    }

    fn check_not_referenced(&self, tables: &Tables, key: &RowKey) -> StorageResult<()> {
        let referenced = key.1.to_datum();
        for ((root, id), row) in tables.rows.iter() {
            if root == &key.0 && id == &key.1 {
                continue;
            }
            let Ok(persister) = self.shared.metamodel.entity_persister(&row.entity_name)
            else {
                continue;
            };
            for (prop, value) in persister.properties().iter().zip(row.values.iter()) {
                if let PropertyKind::ManyToOne { ref target, .. } = prop.kind() {
                    let target_root = self
                        .shared
                        .metamodel
                        .entity_persister(target)
                        .map(|p| p.root_entity_name().clone())
                        .ok();
                    if target_root.as_ref() == Some(&key.0) && value == &referenced {
                        return Err(StorageError::new(
                            StorageError::FOREIGN_KEY_VIOLATION,
                            format!("{}#{} is still referenced by {}#{id}", key.0, key.1, row.entity_name),
                        )
                        .with_constraint(format!("fk_{}_{}", persister.table(), prop.name())));
                    }
                }
            }
        }
        Ok(())
    }

    fn version_matches(persister: &EntityPersister, row: &StoredRow, expected: Option<i64>) -> bool {
        match (expected, persister.version_index()) {
            (Some(expected), Some(index)) => row.values.get(index).and_then(Datum::as_int) == Some(expected),
            _ => true,
        }
    }

    fn apply_undo(&mut self) {
        let Some(undo) = self.undo.take()
        else {
            return;
        };
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        for entry in undo.into_iter().rev() {
            match entry {
                Undo::Row(key, Some(row)) => {
                    tables.rows.insert(key, row);
                }
                Undo::Row(key, None) => {
                    tables.rows.remove(&key);
                }
                Undo::Collection(key, Some(elements)) => {
                    tables.collections.insert(key, elements);
                }
                Undo::Collection(key, None) => {
                    tables.collections.remove(&key);
                }
            }
        }
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn begin(&mut self) -> StorageResult<()> {
        if self.undo.is_some() {
            return Err(StorageError::new(StorageError::GENERIC, "transaction already active"));
        }
        self.undo = Some(Vec::new());
        Ok(())
    }

    async fn commit(&mut self) -> StorageResult<()> {
        self.injected_failure(StatementKind::Commit)?;
        self.log(StatementKind::Commit, "", None, &[]);
        self.undo = None;
        self.release_row_locks();
        Ok(())
    }

    async fn rollback(&mut self) -> StorageResult<()> {
        self.log(StatementKind::Rollback, "", None, &[]);
        self.apply_undo();
        self.release_row_locks();
        Ok(())
    }

    async fn next_id(&mut self, persister: &EntityPersister) -> StorageResult<Identifier> {
        self.injected_failure(StatementKind::Sequence)?;
        let value = {
            let shared = self.shared.clone();
            let mut tables = shared.tables.lock();
            let seq = tables.sequences.entry(persister.root_entity_name().clone()).or_insert(0);
            *seq += 1;
            *seq
        };
        self.log(StatementKind::Sequence, persister.table(), None, &[Datum::Int(value)]);
        Ok(match persister.id_type() {
            IdentifierType::Int => Identifier::Int(value),
            IdentifierType::Text => Identifier::Text(value.to_string()),
        })
    }

    #[instrument(level = "trace", skip(self, persister), fields(entity = %persister.entity_name()))]
    async fn load(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        lock_mode: LockMode,
    ) -> StorageResult<Option<StoredRow>> {
        self.injected_failure(StatementKind::Select)?;
        self.log(StatementKind::Select, persister.table(), Some(id), &[]);
        let key = Self::row_key(persister, id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        let row = tables
            .rows
            .get(&key)
            .filter(|row| persister.is_subclass_entity_name(&row.entity_name))
            .cloned();
        if row.is_some() && lock_mode.is_pessimistic() {
            self.acquire_row_lock(&mut tables, &key)?;
        }
        Ok(row)
    }

    #[instrument(level = "trace", skip(self, persister, row), fields(entity = %persister.entity_name()))]
    async fn insert(
        &mut self,
        persister: &EntityPersister,
        id: Option<&Identifier>,
        row: &StoredRow,
    ) -> StorageResult<Identifier> {
        self.injected_failure(StatementKind::Insert)?;
        let id = match id {
            Some(id) => id.clone(),
            None => {
                let shared = self.shared.clone();
                let mut tables = shared.tables.lock();
                let seq = tables.sequences.entry(persister.root_entity_name().clone()).or_insert(0);
                *seq += 1;
                Identifier::Int(*seq)
            }
        };
        let key = Self::row_key(persister, &id);
        {
            let shared = self.shared.clone();
            let tables = shared.tables.lock();
            if tables.rows.contains_key(&key) {
                return Err(StorageError::new(
                    StorageError::UNIQUE_VIOLATION,
                    format!("duplicate key {}#{id}", key.0),
                )
                .with_constraint(format!("pk_{}", persister.table())));
            }
            self.check_foreign_keys(&tables, persister, row)?;
        }
        for table in persister.write_tables() {
            self.log(StatementKind::Insert, table, Some(&id), &row.values);
        }
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        self.record_row(&tables, &key);
        self.acquire_row_lock(&mut tables, &key)?;
        tables.rows.insert(key, row.clone());
        Ok(id)
    }

    #[instrument(level = "trace", skip(self, persister, row), fields(entity = %persister.entity_name()))]
    async fn update(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        row: &StoredRow,
        expected_version: Option<i64>,
    ) -> StorageResult<u64> {
        self.injected_failure(StatementKind::Update)?;
        self.log(StatementKind::Update, persister.table(), Some(id), &row.values);
        let key = Self::row_key(persister, id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        let matches = tables
            .rows
            .get(&key)
            .is_some_and(|current| Self::version_matches(persister, current, expected_version));
        if !matches {
            return Ok(0);
        }
        self.acquire_row_lock(&mut tables, &key)?;
        self.check_foreign_keys(&tables, persister, row)?;
        self.record_row(&tables, &key);
        tables.rows.insert(key, row.clone());
        Ok(1)
    }

    #[instrument(level = "trace", skip(self, persister), fields(entity = %persister.entity_name()))]
    async fn delete(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        expected_version: Option<i64>,
    ) -> StorageResult<u64> {
        self.injected_failure(StatementKind::Delete)?;
        for table in persister.write_tables().into_iter().rev() {
            self.log(StatementKind::Delete, table, Some(id), &[]);
        }
        let key = Self::row_key(persister, id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        let matches = tables
            .rows
            .get(&key)
            .is_some_and(|current| Self::version_matches(persister, current, expected_version));
        if !matches {
            return Ok(0);
        }
        self.acquire_row_lock(&mut tables, &key)?;
        self.check_not_referenced(&tables, &key)?;

        // Collection rows go with either end of the association.
        let root = persister.root_entity_name();
        let metamodel = self.shared.metamodel.clone();
        let ends = |role: &str| -> (bool, bool) {
            let Ok(cp) = metamodel.collection_persister(role)
            else {
                return (false, false);
            };
            let element_root = metamodel
                .entity_persister(cp.element_entity_name())
                .map(|p| p.root_entity_name() == root)
                .unwrap_or(false);
            (cp.owner_entity_name() == root, element_root)
        };
        let dependent: Vec<(CollectionRowKey, bool)> = tables
            .collections
            .iter()
            .filter_map(|((role, owner), elements)| {
                let (owner_side, element_side) = ends(role);
                let owned = owner_side && owner == id;
                (owned || (element_side && elements.contains(id))).then(|| ((role.clone(), owner.clone()), owned))
            })
            .collect();
        for (ckey, owned) in dependent {
            self.record_collection(&tables, &ckey);
            if owned {
                tables.collections.remove(&ckey);
            }
            else if let Some(elements) = tables.collections.get_mut(&ckey) {
                elements.retain(|e| e != id);
            }
        }

        self.record_row(&tables, &key);
        tables.rows.remove(&key);
        Ok(1)
    }

    async fn upsert(&mut self, persister: &EntityPersister, id: &Identifier, row: &StoredRow) -> StorageResult<()> {
        self.injected_failure(StatementKind::Upsert)?;
        self.log(StatementKind::Upsert, persister.table(), Some(id), &row.values);
        let key = Self::row_key(persister, id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        self.acquire_row_lock(&mut tables, &key)?;
        self.check_foreign_keys(&tables, persister, row)?;
        self.record_row(&tables, &key);
        tables.rows.insert(key, row.clone());
        Ok(())
    }

    async fn current_version(&mut self, persister: &EntityPersister, id: &Identifier) -> StorageResult<Option<i64>> {
        self.injected_failure(StatementKind::VersionCheck)?;
        self.log(StatementKind::VersionCheck, persister.table(), Some(id), &[]);
        let key = Self::row_key(persister, id);
        let shared = self.shared.clone();
        let tables = shared.tables.lock();
        Ok(tables.rows.get(&key).and_then(|row| {
            persister
                .version_index()
                .and_then(|i| row.values.get(i))
                .and_then(Datum::as_int)
        }))
    }

    async fn set_version(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        expected_version: Option<i64>,
        next_version: i64,
    ) -> StorageResult<u64> {
        self.injected_failure(StatementKind::VersionUpdate)?;
        self.log(
            StatementKind::VersionUpdate,
            persister.table(),
            Some(id),
            &[Datum::Int(next_version)],
        );
        let Some(index) = persister.version_index()
        else {
            return Ok(0);
        };
        let key = Self::row_key(persister, id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        let matches = tables
            .rows
            .get(&key)
            .is_some_and(|current| Self::version_matches(persister, current, expected_version));
        if !matches {
            return Ok(0);
        }
        self.acquire_row_lock(&mut tables, &key)?;
        self.record_row(&tables, &key);
        if let Some(row) = tables.rows.get_mut(&key) {
            row.values[index] = Datum::Int(next_version);
        }
        Ok(1)
    }

    async fn lock(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        expected_version: Option<i64>,
        lock_mode: LockMode,
    ) -> StorageResult<u64> {
        self.injected_failure(StatementKind::Lock)?;
        self.log(StatementKind::Lock, persister.table(), Some(id), &[]);
        let key = Self::row_key(persister, id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        let matches = tables
            .rows
            .get(&key)
            .is_some_and(|current| Self::version_matches(persister, current, expected_version));
        if !matches {
            return Ok(0);
        }
        if lock_mode.is_pessimistic() {
            self.acquire_row_lock(&mut tables, &key)?;
        }
        Ok(1)
    }

    async fn load_collection(
        &mut self,
        persister: &CollectionPersister,
        owner_id: &Identifier,
    ) -> StorageResult<Vec<Identifier>> {
        self.injected_failure(StatementKind::CollectionSelect)?;
        self.log(StatementKind::CollectionSelect, persister.table(), Some(owner_id), &[]);
        let shared = self.shared.clone();
        let tables = shared.tables.lock();
        Ok(tables
            .collections
            .get(&Self::collection_key(persister, owner_id))
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_collection_rows(
        &mut self,
        persister: &CollectionPersister,
        owner_id: &Identifier,
        elements: &[Identifier],
    ) -> StorageResult<()> {
        self.injected_failure(StatementKind::CollectionInsert)?;
        let element_root = self
            .shared
            .metamodel
            .entity_persister(persister.element_entity_name())
            .map(|p| p.root_entity_name().clone())
            .map_err(|e| StorageError::new(StorageError::GENERIC, e.to_string()))?;
        let key = Self::collection_key(persister, owner_id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        for element in elements {
            if !tables.rows.contains_key(&(element_root.clone(), element.clone())) {
                return Err(StorageError::new(
                    StorageError::FOREIGN_KEY_VIOLATION,
                    format!("{} row references missing {element_root}#{element}", persister.table()),
                )
                .with_constraint(format!("fk_{}_element", persister.table())));
            }
        }
        self.record_collection(&tables, &key);
        let rows = tables.collections.entry(key).or_default();
        for element in elements {
            if !rows.contains(element) {
                rows.push(element.clone());
            }
        }
        drop(tables);
        for element in elements {
            self.log(
                StatementKind::CollectionInsert,
                persister.table(),
                Some(owner_id),
                &[element.to_datum()],
            );
        }
        Ok(())
    }

    async fn delete_collection_rows(
        &mut self,
        persister: &CollectionPersister,
        owner_id: &Identifier,
        elements: &[Identifier],
    ) -> StorageResult<()> {
        self.injected_failure(StatementKind::CollectionDelete)?;
        for element in elements {
            self.log(
                StatementKind::CollectionDelete,
                persister.table(),
                Some(owner_id),
                &[element.to_datum()],
            );
        }
        let key = Self::collection_key(persister, owner_id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        self.record_collection(&tables, &key);
        if let Some(rows) = tables.collections.get_mut(&key) {
            rows.retain(|e| !elements.contains(e));
        }
        Ok(())
    }

    async fn remove_collection(&mut self, persister: &CollectionPersister, owner_id: &Identifier) -> StorageResult<u64> {
        self.injected_failure(StatementKind::CollectionRemove)?;
        self.log(StatementKind::CollectionRemove, persister.table(), Some(owner_id), &[]);
        let key = Self::collection_key(persister, owner_id);
        let shared = self.shared.clone();
        let mut tables = shared.tables.lock();
        self.record_collection(&tables, &key);
        Ok(tables.collections.remove(&key).map_or(0, |rows| rows.len() as u64))
    }

    #[instrument(level = "trace", skip(self, plan, parameters), fields(statement = plan.statement()))]
    async fn execute_query(
        &mut self,
        plan: &QueryPlan,
        parameters: &QueryParameters,
        selection: &RowSelection,
    ) -> StorageResult<Vec<QueryRow>> {
        self.injected_failure(StatementKind::Query)?;
        self.log(StatementKind::Query, plan.statement(), None, &[]);
        let registered = self.shared.queries.read().get(plan.statement()).cloned().ok_or_else(|| {
            StorageError::new(
                StorageError::GENERIC,
                format!("unknown statement '{}'", plan.statement()),
            )
        })?;
        if let Some(latency) = registered.latency {
            tokio::time::sleep(latency).await;
        }
        let rows = {
            let shared = self.shared.clone();
            let tables = shared.tables.lock();
            (registered.handler)(&TableView { tables: &tables }, parameters)?
        };
        Ok(selection.apply(rows))
    }

    async fn execute_procedure(&mut self, call: &ProcedureCall) -> StorageResult<ProcedureOutputs> {
        self.injected_failure(StatementKind::Procedure)?;
        self.log(StatementKind::Procedure, call.name(), None, &[]);
        let handler = self.shared.procedures.read().get(call.name()).cloned().ok_or_else(|| {
            StorageError::new(StorageError::GENERIC, format!("unknown procedure '{}'", call.name()))
        })?;
        handler(call)
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if self.undo.is_some() {
            debug!("Memory storage connection {} dropped inside a transaction, rolling back", self.id);
            self.apply_undo();
        }
        self.release_row_locks();
    }
}
