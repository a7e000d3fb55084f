//! Application hooks into the entity lifecycle.
//!
//! State-bearing callbacks receive the proposed state and return an [`Interception`]: proceed, veto the default
//! action, or proceed with a rewritten state.

use async_trait::async_trait;
use std::sync::Arc;

use crate::instance::EntityRef;
use crate::types::Identifier;
use crate::types::Interception;
use crate::types::Value;

#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Called after a row was read and before its state is installed into `entity`. A veto makes the row look absent.
    async fn on_load(
        &self,
        _entity: &EntityRef,
        _id: &Identifier,
        _state: &[Value],
        _property_names: &[Arc<str>],
    ) -> Interception {
        Interception::Proceed
    }

    /// Called when a transient entity is about to become managed. `id` is absent for storage-generated identifiers.
    async fn on_save(
        &self,
        _entity: &EntityRef,
        _id: Option<&Identifier>,
        _state: &[Value],
        _property_names: &[Arc<str>],
    ) -> Interception {
        Interception::Proceed
    }

    /// Called before a managed entity is scheduled for deletion. A rewrite is treated as proceed.
    async fn on_delete(
        &self,
        _entity: &EntityRef,
        _id: &Identifier,
        _state: &[Value],
        _property_names: &[Arc<str>],
    ) -> Interception {
        Interception::Proceed
    }

    /// Called during flush for an entity found dirty.
    async fn on_flush_dirty(
        &self,
        _entity: &EntityRef,
        _id: &Identifier,
        _current_state: &[Value],
        _previous_state: &[Value],
        _property_names: &[Arc<str>],
    ) -> Interception {
        Interception::Proceed
    }

    async fn pre_flush(&self, _entities: &[EntityRef]) {}

    async fn post_flush(&self, _entities: &[EntityRef]) {}

    async fn after_transaction_completion(&self, _committed: bool) {}
}

/// Interceptor which lets everything through.
#[derive(Clone, Copy, Debug, Default)]
pub struct EmptyInterceptor;

impl Interceptor for EmptyInterceptor {}
