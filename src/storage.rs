//! Storage boundary.
//!
//! A [`Storage`] is shared by a factory and hands every session its own [`Connection`]. Statements never see entity
//! instances: the session disassembles state into [`StoredRow`]s with associations flattened to identifiers.

pub mod memory;

use async_trait::async_trait;
use std::fmt::Display;
use std::sync::Arc;

use crate::error::StorageError;
use crate::mapping::CollectionPersister;
use crate::mapping::EntityPersister;
use crate::procedure::ProcedureCall;
use crate::procedure::ProcedureOutputs;
use crate::query::QueryParameters;
use crate::query::QueryPlan;
use crate::query::QueryRow;
use crate::query::RowSelection;
use crate::types::Datum;
use crate::types::Identifier;
use crate::types::LockMode;

pub use memory::MemoryStorage;

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Disassembled state of one entity row, in persister property order.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredRow {
    /// Concrete entity name of the row.
    pub entity_name: Arc<str>,
    pub values:      Vec<Datum>,
}

impl StoredRow {
    pub fn new(entity_name: Arc<str>, values: Vec<Datum>) -> Self {
        Self { entity_name, values }
    }
}

impl Display for StoredRow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}(", self.entity_name)?;
        for (i, v) in self.values.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    async fn connect(&self) -> StorageResult<Box<dyn Connection>>;
}

/// Statement execution for one session.
///
/// Write methods returning `u64` report the affected row count; the session turns a zero count into a stale state
/// error. Version-checked statements only match a row whose version equals `expected_version`.
#[async_trait]
pub trait Connection: Send + Sync {
    async fn begin(&mut self) -> StorageResult<()>;

    async fn commit(&mut self) -> StorageResult<()>;

    async fn rollback(&mut self) -> StorageResult<()>;

    /// Next identifier of a sequence-generated entity.
    async fn next_id(&mut self, persister: &EntityPersister) -> StorageResult<Identifier>;

    async fn load(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        lock_mode: LockMode,
    ) -> StorageResult<Option<StoredRow>>;

    /// Inserts a row. With `id` absent the storage generates the identifier and returns it.
    async fn insert(
        &mut self,
        persister: &EntityPersister,
        id: Option<&Identifier>,
        row: &StoredRow,
    ) -> StorageResult<Identifier>;

    async fn update(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        row: &StoredRow,
        expected_version: Option<i64>,
    ) -> StorageResult<u64>;

    async fn delete(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        expected_version: Option<i64>,
    ) -> StorageResult<u64>;

    /// Inserts or overwrites a row regardless of its current version.
    async fn upsert(&mut self, persister: &EntityPersister, id: &Identifier, row: &StoredRow) -> StorageResult<()>;

    /// `None` when the row doesn't exist.
    async fn current_version(&mut self, persister: &EntityPersister, id: &Identifier) -> StorageResult<Option<i64>>;

    async fn set_version(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        expected_version: Option<i64>,
        next_version: i64,
    ) -> StorageResult<u64>;

    /// Takes a pessimistic lock on a row. Returns the number of rows locked.
    async fn lock(
        &mut self,
        persister: &EntityPersister,
        id: &Identifier,
        expected_version: Option<i64>,
        lock_mode: LockMode,
    ) -> StorageResult<u64>;

    async fn load_collection(
        &mut self,
        persister: &CollectionPersister,
        owner_id: &Identifier,
    ) -> StorageResult<Vec<Identifier>>;

    async fn insert_collection_rows(
        &mut self,
        persister: &CollectionPersister,
        owner_id: &Identifier,
        elements: &[Identifier],
    ) -> StorageResult<()>;

    async fn delete_collection_rows(
        &mut self,
        persister: &CollectionPersister,
        owner_id: &Identifier,
        elements: &[Identifier],
    ) -> StorageResult<()>;

    /// Removes every row of the collection. Returns the number of rows removed.
    async fn remove_collection(&mut self, persister: &CollectionPersister, owner_id: &Identifier) -> StorageResult<u64>;

    async fn execute_query(
        &mut self,
        plan: &QueryPlan,
        parameters: &QueryParameters,
        selection: &RowSelection,
    ) -> StorageResult<Vec<QueryRow>>;

    async fn execute_procedure(&mut self, call: &ProcedureCall) -> StorageResult<ProcedureOutputs>;
}
