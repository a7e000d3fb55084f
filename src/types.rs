use serde::Deserialize;
use serde::Serialize;
use std::fmt::Display;

use crate::instance::CollectionRef;
use crate::instance::EntityRef;

/// A scalar as the storage layer sees it. Entity references are flattened into the referenced identifier before
/// they reach this type.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl Datum {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Datum::Null)
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Datum::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl Display for Datum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Datum::Null => write!(f, "null"),
            Datum::Bool(b) => write!(f, "{b}"),
            Datum::Int(i) => write!(f, "{i}"),
            Datum::Float(v) => write!(f, "{v}"),
            Datum::Text(s) => write!(f, "'{s}'"),
            Datum::Bytes(b) => write!(f, "<{} bytes>", b.len()),
        }
    }
}

impl From<i64> for Datum {
    fn from(value: i64) -> Self {
        Datum::Int(value)
    }
}

impl From<&str> for Datum {
    fn from(value: &str) -> Self {
        Datum::Text(value.to_string())
    }
}

impl From<String> for Datum {
    fn from(value: String) -> Self {
        Datum::Text(value)
    }
}

impl From<bool> for Datum {
    fn from(value: bool) -> Self {
        Datum::Bool(value)
    }
}

/// Kind of identifier a persister expects.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdentifierType {
    Int,
    Text,
}

/// Primary key value of an entity row.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Identifier {
    Int(i64),
    Text(String),
}

impl Identifier {
    pub fn kind(&self) -> IdentifierType {
        match self {
            Identifier::Int(_) => IdentifierType::Int,
            Identifier::Text(_) => IdentifierType::Text,
        }
    }

    pub fn to_datum(&self) -> Datum {
        match self {
            Identifier::Int(i) => Datum::Int(*i),
            Identifier::Text(s) => Datum::Text(s.clone()),
        }
    }

    pub fn from_datum(datum: &Datum) -> Option<Self> {
        match datum {
            Datum::Int(i) => Some(Identifier::Int(*i)),
            Datum::Text(s) => Some(Identifier::Text(s.clone())),
            _ => None,
        }
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identifier::Int(i) => write!(f, "{i}"),
            Identifier::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for Identifier {
    fn from(value: i64) -> Self {
        Identifier::Int(value)
    }
}

impl From<&str> for Identifier {
    fn from(value: &str) -> Self {
        Identifier::Text(value.to_string())
    }
}

impl From<String> for Identifier {
    fn from(value: String) -> Self {
        Identifier::Text(value)
    }
}

/// A property value of an entity instance.
///
/// Equality is what dirty checking uses: scalars compare by value, entity and collection references compare by
/// instance identity.
#[derive(Clone, Debug)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
    Entity(EntityRef),
    Collection(CollectionRef),
}

impl Value {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_entity(&self) -> Option<&EntityRef> {
        match self {
            Value::Entity(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionRef> {
        match self {
            Value::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Scalar conversion. `None` for entity and collection references.
    pub fn to_datum(&self) -> Option<Datum> {
        Some(match self {
            Value::Null => Datum::Null,
            Value::Bool(b) => Datum::Bool(*b),
            Value::Int(i) => Datum::Int(*i),
            Value::Float(v) => Datum::Float(*v),
            Value::Text(s) => Datum::Text(s.clone()),
            Value::Bytes(b) => Datum::Bytes(b.clone()),
            Value::Entity(_) | Value::Collection(_) => return None,
        })
    }

    pub fn from_datum(datum: Datum) -> Self {
        match datum {
            Datum::Null => Value::Null,
            Datum::Bool(b) => Value::Bool(b),
            Datum::Int(i) => Value::Int(i),
            Datum::Float(v) => Value::Float(v),
            Datum::Text(s) => Value::Text(s),
            Datum::Bytes(b) => Value::Bytes(b),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Entity(a), Value::Entity(b)) => a.same_target(b),
            (Value::Collection(a), Value::Collection(b)) => a == b,
            _ => false,
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::Text(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::Text(value)
    }
}

impl From<EntityRef> for Value {
    fn from(value: EntityRef) -> Self {
        Value::Entity(value)
    }
}

impl From<&EntityRef> for Value {
    fn from(value: &EntityRef) -> Self {
        Value::Entity(value.clone())
    }
}

impl From<CollectionRef> for Value {
    fn from(value: CollectionRef) -> Self {
        Value::Collection(value)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Lifecycle status stored in a managed entity entry. `Transient` and `Detached` are never stored: they are the
/// absence of an entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    Loading,
    Saving,
    Managed,
    Deleted,
    Gone,
}

impl Status {
    #[inline]
    pub fn is_deleted_or_gone(&self) -> bool {
        matches!(self, Status::Deleted | Status::Gone)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum LockMode {
    #[default]
    None,
    Read,
    Optimistic,
    OptimisticForceIncrement,
    PessimisticRead,
    PessimisticWrite,
    PessimisticForceIncrement,
    Write,
}

impl LockMode {
    pub fn is_pessimistic(&self) -> bool {
        matches!(
            self,
            LockMode::PessimisticRead | LockMode::PessimisticWrite | LockMode::PessimisticForceIncrement
        )
    }
}

/// When a session synchronizes its state with the storage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlushMode {
    /// Before queries touching pending changes and at commit.
    #[default]
    Auto,
    /// Only at commit.
    Commit,
    /// Only when `flush()` is called explicitly.
    Manual,
    /// Before every query and at commit.
    Always,
}

/// How a session interacts with the second-level cache.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum CacheMode {
    #[default]
    Normal,
    /// Read from the cache, never write to it.
    Get,
    /// Write to the cache, never read from it.
    Put,
    /// Write to the cache bypassing the minimal-puts version check; never read.
    Refresh,
    Ignore,
}

impl CacheMode {
    #[inline]
    pub fn is_get_enabled(&self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Get)
    }

    #[inline]
    pub fn is_put_enabled(&self) -> bool {
        matches!(self, CacheMode::Normal | CacheMode::Put | CacheMode::Refresh)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationMode {
    /// Fail if the row already exists.
    Exception,
    /// Keep the existing row untouched.
    Ignore,
    /// Overwrite the existing row.
    Overwrite,
    /// Overwrite only when the replicated version is newer.
    LatestVersion,
}

/// Outcome of an interceptor callback.
#[derive(Clone, Debug, Default)]
pub enum Interception {
    #[default]
    Proceed,
    /// Skip the default action.
    Veto,
    /// Proceed with this state instead of the proposed one.
    Rewrite(Vec<Value>),
}
