use thiserror::Error;

use crate::key::EntityKey;
use crate::types::Identifier;

pub type Result<T, E = OrmError> = std::result::Result<T, E>;

/// Caller-facing classification of [`OrmError`] variants.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Duplicate or missing identity, identifier generation problems.
    Identity,
    /// Version mismatch or unexpected affected row count.
    OptimisticConcurrency,
    /// Lock could not be obtained in time. Callers may retry with backoff.
    LockTimeout,
    /// Any other pessimistic lock failure.
    Lock,
    Constraint,
    Storage,
    /// Operation not valid for the current session, transaction or entity state.
    State,
    /// Invalid arguments passed to the session.
    Usage,
    /// Expected query outcomes: no result, too many results, timeout, cancellation.
    QueryOutcome,
    Configuration,
}

#[derive(Debug, Error)]
pub enum OrmError {
    #[error("a different object with the same identifier value was already associated with the session: {0}")]
    DuplicateIdentity(EntityKey),

    #[error("identifier of entity '{entity}' is missing")]
    IdentifierMissing { entity: String },

    #[error("identifier generation failed for entity '{entity}': {reason}")]
    IdentifierGeneration { entity: String, reason: String },

    #[error("row was updated or deleted by another transaction (or unsaved-value mapping was incorrect): [{entity}#{id}]")]
    StaleObjectState { entity: String, id: Identifier },

    #[error("unexpected row count for {operation} of [{entity}#{id}]: expected 1, actual {actual}")]
    StaleState {
        operation: &'static str,
        entity:    String,
        id:        Identifier,
        actual:    u64,
    },

    #[error("lock wait timeout: {0}")]
    LockTimeout(String),

    #[error("could not obtain pessimistic lock: {0}")]
    PessimisticLock(String),

    #[error("constraint violation{}: {message}", constraint_suffix(.constraint))]
    ConstraintViolation {
        constraint: Option<String>,
        message:    String,
    },

    #[error("storage error [{code}]: {message}")]
    Storage { code: String, message: String },

    #[error("query timed out after {0} second(s)")]
    QueryTimeout(u64),

    #[error("query was cancelled")]
    QueryCancelled,

    #[error("no result found for query")]
    NoResult,

    #[error("query did not return a unique result: {0}")]
    NonUniqueResult(usize),

    #[error("no row with the given identifier exists: [{entity}#{id}]")]
    EntityNotFound { entity: String, id: Identifier },

    #[error("could not initialize proxy or collection {0} - not associated with an open session")]
    LazyInitialization(String),

    #[error("entity is not associated with the session: {0}")]
    EntityNotAssociated(String),

    #[error("object references an unsaved transient instance through property '{property}' of '{entity}'")]
    TransientReference { entity: String, property: String },

    #[error("detached entity passed to persist: {0}")]
    DetachedEntity(String),

    #[error("deleted instance passed to {operation}: {entity}")]
    DeletedEntity { operation: &'static str, entity: String },

    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("transaction is marked for rollback only")]
    RollbackOnly,

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("snapshot error: {0}")]
    Snapshot(String),
}

fn constraint_suffix(constraint: &Option<String>) -> String {
    constraint.as_ref().map(|c| format!(" [{c}]")).unwrap_or_default()
}

impl OrmError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DuplicateIdentity(_) | Self::IdentifierMissing { .. } | Self::IdentifierGeneration { .. } => {
                ErrorCategory::Identity
            }
            Self::StaleObjectState { .. } | Self::StaleState { .. } => ErrorCategory::OptimisticConcurrency,
            Self::LockTimeout(_) => ErrorCategory::LockTimeout,
            Self::PessimisticLock(_) => ErrorCategory::Lock,
            Self::ConstraintViolation { .. } => ErrorCategory::Constraint,
            Self::Storage { .. } => ErrorCategory::Storage,
            Self::QueryTimeout(_) | Self::QueryCancelled | Self::NoResult | Self::NonUniqueResult(_) => {
                ErrorCategory::QueryOutcome
            }
            Self::EntityNotFound { .. }
            | Self::LazyInitialization(_)
            | Self::DetachedEntity(_)
            | Self::DeletedEntity { .. }
            | Self::IllegalState(_)
            | Self::SessionClosed
            | Self::RollbackOnly
            | Self::Snapshot(_) => ErrorCategory::State,
            Self::EntityNotAssociated(_) | Self::IllegalArgument(_) | Self::TransientReference { .. } => {
                ErrorCategory::Usage
            }
            Self::Configuration(_) => ErrorCategory::Configuration,
        }
    }

    /// Whether the error forces the current transaction into rollback-only mode. Expected, recoverable query and
    /// lock outcomes don't.
    pub fn requires_rollback(&self) -> bool {
        !matches!(
            self,
            Self::LockTimeout(_) | Self::QueryTimeout(_) | Self::NoResult | Self::NonUniqueResult(_)
        )
    }

    pub(crate) fn stale_object(key: &EntityKey) -> Self {
        Self::StaleObjectState {
            entity: key.entity_name().to_string(),
            id:     key.id().clone(),
        }
    }
}

/// Defects in the flush or cascade ordering logic. These never reach callers as themselves; they surface as
/// [`OrmError::IllegalState`].
#[derive(Debug, Error)]
pub(crate) enum Defect {
    #[error("unresolved insert actions remain at cascade level 0: {0}")]
    UnresolvedAction(String),

    #[error("no entry for an instance the action queue operates on: {0}")]
    MissingEntry(String),

    #[error("collection entry vanished during flush: {0}")]
    MissingCollectionEntry(String),
}

impl From<Defect> for OrmError {
    fn from(defect: Defect) -> Self {
        OrmError::IllegalState(format!("internal defect: {defect}"))
    }
}

/// Error reported by a storage [`Connection`](crate::storage::Connection).
///
/// `code` follows SQLState conventions so that the session can classify it without knowing the backend.
#[derive(Clone, Debug, Error)]
#[error("[{code}] {message}")]
pub struct StorageError {
    pub code:       String,
    pub message:    String,
    pub constraint: Option<String>,
}

impl StorageError {
    pub const CONSTRAINT_VIOLATION: &'static str = "23000";
    pub const FOREIGN_KEY_VIOLATION: &'static str = "23503";
    pub const UNIQUE_VIOLATION: &'static str = "23505";
    pub const SERIALIZATION_FAILURE: &'static str = "40001";
    pub const DEADLOCK: &'static str = "40P01";
    pub const LOCK_NOT_AVAILABLE: &'static str = "55P03";
    pub const QUERY_CANCELED: &'static str = "57014";
    pub const GENERIC: &'static str = "HY000";

    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code:       code.into(),
            message:    message.into(),
            constraint: None,
        }
    }

    pub fn with_constraint(mut self, constraint: impl Into<String>) -> Self {
        self.constraint = Some(constraint.into());
        self
    }
}

impl From<StorageError> for OrmError {
    fn from(err: StorageError) -> Self {
        let StorageError {
            code,
            message,
            constraint,
        } = err;
        match code.as_str() {
            c if c.starts_with("23") => OrmError::ConstraintViolation { constraint, message },
            StorageError::LOCK_NOT_AVAILABLE => OrmError::LockTimeout(message),
            StorageError::DEADLOCK => OrmError::PessimisticLock(message),
            StorageError::QUERY_CANCELED => OrmError::QueryCancelled,
            _ => OrmError::Storage { code, message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_codes_are_translated() {
        let e: OrmError = StorageError::new(StorageError::FOREIGN_KEY_VIOLATION, "fk").with_constraint("fk_child").into();
        assert!(matches!(e, OrmError::ConstraintViolation { constraint: Some(ref c), .. } if c == "fk_child"));
        assert_eq!(e.category(), ErrorCategory::Constraint);

        let e: OrmError = StorageError::new(StorageError::LOCK_NOT_AVAILABLE, "busy").into();
        assert_eq!(e.category(), ErrorCategory::LockTimeout);
        assert!(!e.requires_rollback());

        let e: OrmError = StorageError::new(StorageError::DEADLOCK, "deadlock").into();
        assert_eq!(e.category(), ErrorCategory::Lock);
        assert!(e.requires_rollback());
    }

    #[test]
    fn defects_surface_as_illegal_state() {
        let e: OrmError = Defect::UnresolvedAction("Child".into()).into();
        assert_eq!(e.category(), ErrorCategory::State);
        assert!(e.to_string().contains("internal defect"));
    }

    #[test]
    fn non_rollback_whitelist() {
        assert!(!OrmError::NoResult.requires_rollback());
        assert!(!OrmError::NonUniqueResult(2).requires_rollback());
        assert!(!OrmError::QueryTimeout(1).requires_rollback());
        assert!(OrmError::QueryCancelled.requires_rollback());
        assert!(OrmError::IllegalState("x".into()).requires_rollback());
    }
}
