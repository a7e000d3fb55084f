//! The unit of work.
//!
//! A [`Session`] owns a storage connection, a [`PersistenceContext`] and an [`ActionQueue`]. Session operations
//! change the context and queue storage mutations; a flush computes the remaining updates and executes the queue in
//! dependency order.
//!
//! A session is used by one task at a time: every operation takes `&mut self`. It is `Send` and may move between
//! tasks. The only thing that can be handed to another task is its [`StatementCanceller`].

mod cascading;
mod delete;
mod flush;
mod lifecycle;
mod load;
mod merge;
mod persist;
mod query;
mod replicate;
mod transaction;

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::debug;
use tracing::instrument;
use uuid::Uuid;

use crate::action::ActionContext;
use crate::action::ActionQueue;
use crate::context::PersistenceContext;
use crate::error::OrmError;
use crate::error::Result;
use crate::factory::SessionFactory;
use crate::instance::EntityRef;
use crate::interceptor::Interceptor;
use crate::key::EntityKey;
use crate::key::TenantId;
use crate::mapping::EntityPersister;
use crate::query::StatementCanceller;
use crate::storage::Connection;
use crate::storage::StoredRow;
use crate::types::CacheMode;
use crate::types::FlushMode;
use crate::types::LockMode;
use crate::types::Value;

pub(crate) use cascading::Cascading;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

pub struct Session {
    id:                 Uuid,
    factory:            Arc<SessionFactory>,
    conn:               Box<dyn Connection>,
    context:            PersistenceContext,
    actions:            ActionQueue,
    interceptor:        Arc<dyn Interceptor>,
    tenant:             TenantId,
    flush_mode:         FlushMode,
    cache_mode:         CacheMode,
    transaction_active: bool,
    rollback_only:      bool,
    closed:             bool,
    // Depth of cascades in progress; checks on unresolved inserts run at level 0 only.
    cascade_level:      usize,
    canceller:          StatementCanceller,
}

impl Session {
    pub(crate) fn new(
        factory: Arc<SessionFactory>,
        conn: Box<dyn Connection>,
        interceptor: Arc<dyn Interceptor>,
        tenant: TenantId,
        flush_mode: FlushMode,
        cache_mode: CacheMode,
        default_read_only: bool,
    ) -> Self {
        let id = Uuid::new_v4();
        debug!("[session {id}] opened, tenant {tenant:?}, flush mode {flush_mode:?}");
        Self {
            id,
            factory,
            conn,
            context: PersistenceContext::new(default_read_only),
            actions: ActionQueue::default(),
            interceptor,
            tenant,
            flush_mode,
            cache_mode,
            transaction_active: false,
            rollback_only: false,
            closed: false,
            cascade_level: 0,
            canceller: StatementCanceller::default(),
        }
    }

    #[inline]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[inline]
    pub fn factory(&self) -> &Arc<SessionFactory> {
        &self.factory
    }

    #[inline]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    #[inline]
    pub fn flush_mode(&self) -> FlushMode {
        self.flush_mode
    }

    pub fn set_flush_mode(&mut self, flush_mode: FlushMode) {
        self.flush_mode = flush_mode;
    }

    #[inline]
    pub fn cache_mode(&self) -> CacheMode {
        self.cache_mode
    }

    pub fn set_cache_mode(&mut self, cache_mode: CacheMode) {
        self.cache_mode = cache_mode;
    }

    #[inline]
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    #[inline]
    pub fn is_transaction_active(&self) -> bool {
        self.transaction_active
    }

    /// Set once an error left the transaction in a state where only a rollback is allowed.
    #[inline]
    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    /// A handle which cancels the statement this session is running. Can be used from another task.
    pub fn statement_canceller(&self) -> StatementCanceller {
        self.canceller.clone()
    }

    #[inline]
    pub fn persistence_context(&self) -> &PersistenceContext {
        &self.context
    }

    #[inline]
    pub fn action_queue(&self) -> &ActionQueue {
        &self.actions
    }

    /// Whether `entity` is managed by this session and not scheduled for removal.
    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.context.contains(entity)
    }

    pub fn is_read_only(&self, entity: &EntityRef) -> Result<bool> {
        self.context.is_read_only(entity)
    }

    /// Read-only entities are never dirty checked.
    pub fn set_read_only(&mut self, entity: &EntityRef, read_only: bool) -> Result<()> {
        self.check_open()?;
        self.context.set_read_only(entity, read_only)
    }

    /// Read-only flag given to entities loaded from now on.
    pub fn set_default_read_only(&mut self, read_only: bool) {
        self.context.set_default_read_only(read_only);
    }

    pub fn get_current_lock_mode(&self, entity: &EntityRef) -> Result<LockMode> {
        self.context.get_current_lock_mode(entity)
    }

    /// Replaces the context and the queue of a freshly opened session with restored ones.
    pub(crate) fn install(&mut self, context: PersistenceContext, actions: ActionQueue) {
        self.context = context;
        self.actions = actions;
    }

    /// Detaches every managed instance and drops every queued action.
    pub fn clear(&mut self) -> Result<()> {
        self.check_open()?;
        debug!("[session {}] clear", self.id);
        self.context.clear();
        self.actions.clear();
        Ok(())
    }

    /// Rolls back an active transaction and releases the context.
    #[instrument(level = "debug", skip(self), fields(session = %self.id))]
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(OrmError::IllegalState("session is already closed".into()));
        }
        let result = if self.transaction_active {
            self.rollback_internal().await
        }
        else {
            Ok(())
        };
        self.context.clear();
        self.actions.clear();
        self.closed = true;
        result
    }

    /// Every public operation returns through here. An error which requires it leaves the transaction
    /// rollback-only.
    fn funnel<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(ref err) = result {
            if self.transaction_active && err.requires_rollback() && !self.rollback_only {
                debug!("[session {}] marked rollback-only by: {err}", self.id);
                self.rollback_only = true;
            }
        }
        result
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(OrmError::SessionClosed)
        }
        else {
            Ok(())
        }
    }

    fn require_transaction(&self, operation: &str) -> Result<()> {
        if self.transaction_active {
            Ok(())
        }
        else {
            Err(OrmError::IllegalState(format!("{operation} requires an active transaction")))
        }
    }

    /// The action queue together with what its actions execute against.
    fn split(&mut self) -> (&mut ActionQueue, ActionContext<'_>) {
        (
            &mut self.actions,
            ActionContext {
                conn:       self.conn.as_mut(),
                context:    &mut self.context,
                factory:    &self.factory,
                tenant:     &self.tenant,
                cache_mode: self.cache_mode,
            },
        )
    }

    fn persister(&self, entity_name: &str) -> Result<Arc<EntityPersister>> {
        Ok(self.factory.metamodel().entity_persister(entity_name)?.clone())
    }

    fn persister_of(&self, entity: &EntityRef) -> Result<Arc<EntityPersister>> {
        match self.context.get_entry(entity) {
            Some(entry) => self.persister(entry.entity_name()),
            None => self.persister(&entity.entity_name()),
        }
    }

    /// A state handed back by an interceptor must match the property layout.
    fn checked_rewrite(persister: &EntityPersister, state: Vec<Value>) -> Result<Vec<Value>> {
        if state.len() != persister.properties().len() {
            return Err(OrmError::IllegalArgument(format!(
                "interceptor returned {} values for '{}' which has {} properties",
                state.len(),
                persister.entity_name(),
                persister.properties().len()
            )));
        }
        Ok(state)
    }

    /// Row currently stored for `key`, read at most once per flush cycle.
    async fn database_snapshot(&mut self, persister: &EntityPersister, key: &EntityKey) -> Result<Option<StoredRow>> {
        if let Some(cached) = self.context.cached_database_snapshot(key) {
            return Ok(cached.clone());
        }
        let row = self.conn.load(persister, key.id(), LockMode::None).await?;
        self.context.cache_database_snapshot(key.clone(), row.clone());
        Ok(row)
    }

    /// Drops every trace of an instance whose insert never reached the storage.
    fn forget_unsaved(&mut self, entity: &EntityRef) {
        let key = self.context.get_entry(entity).and_then(|e| e.key().cloned());
        match key {
            Some(key) => {
                self.context.remove_entity(&key);
            }
            None => {
                self.context.remove_entry(entity);
            }
        }
        for collection in self.context.collections_of(entity) {
            self.context.remove_collection(&collection);
        }
        self.actions.remove_actions_for(entity);
    }

    /// A reference the storage can't resolve yet: a transient instance or one whose insert still waits. An instance
    /// the session doesn't know about is transient unless a row exists for its identifier.
    async fn is_unsaved(&mut self, target: &EntityRef) -> Result<bool> {
        if let Some(entry) = self.context.get_entry(target) {
            return Ok(entry.key().is_none()
                || self
                    .actions
                    .unresolved_inserts()
                    .iter()
                    .any(|u| u.action.entity.same_target(target)));
        }
        if target.is_uninitialized_proxy() {
            return Ok(false);
        }
        let Some(id) = target.id()
        else {
            return Ok(true);
        };
        let persister = self.persister(&target.entity_name())?;
        let key = persister.entity_key(id, &self.tenant);
        Ok(self.database_snapshot(&persister, &key).await?.is_none())
    }
}

impl Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("tenant", &self.tenant)
            .field("flush_mode", &self.flush_mode)
            .field("cache_mode", &self.cache_mode)
            .field("entities", &self.context.entity_count())
            .field("collections", &self.context.collection_count())
            .field("transaction_active", &self.transaction_active)
            .field("rollback_only", &self.rollback_only)
            .field("closed", &self.closed)
            .finish()
    }
}
