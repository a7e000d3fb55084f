//! # wb-session
//!
//! Session-scoped persistence context for record-based storages: an identity map, a dependency-ordered write-behind
//! action queue, cascades over object graphs and a second-level cache protocol.
//!
//! # The Basics
//!
//! A [`Session`] is a unit of work. Within it:
//!
//! - Every stored row is represented by at most one instance. Loading the same [`EntityKey`] twice yields the same
//!   [`EntityRef`].
//! - Changes are not written immediately. `persist`, `delete` and dirty instances turn into queued actions which a
//!   flush executes in an order that respects foreign keys: orphan removals, inserts, updates, collection changes,
//!   deletes.
//! - Operations propagate along associations according to their [`CascadeStyle`].
//! - A second-level cache, shared by all sessions of a [`SessionFactory`], is kept consistent through soft locks
//!   taken before a write and released after the transaction completes.
//!
//! The storage is an external collaborator behind the [`Storage`] and [`Connection`] traits. An in-memory
//! implementation, [`MemoryStorage`], comes with the crate; it supports latency injection and records every statement
//! it executes which makes it handy for tests.
//!
//! # Example
//!
//! ```ignore
//! let metamodel = Arc::new(
//!     Metamodel::builder()
//!         .entity(EntityMapping::new("Customer").property("name"))
//!         .build()?,
//! );
//! let storage = MemoryStorage::new(metamodel.clone());
//! let factory = SessionFactory::new(metamodel, Arc::new(storage), SessionFactoryOptions::default())?;
//!
//! let mut session = factory.open_session().await?;
//! session.begin().await?;
//! let customer = factory.metamodel().instantiate_with_id("Customer", 1)?;
//! factory.metamodel().set_property(&customer, "name", "Jane")?;
//! session.persist(&customer).await?;
//! session.commit().await?;
//! ```
//!
//! # Snapshots
//!
//! Between transactions a session can be captured into a [`SessionSnapshot`], encoded to bytes, and restored into a
//! fresh session of a factory registered in a [`FactoryRegistry`].
//!
//! # Logging
//!
//! The crate emits [`tracing`](https://crates.io/crates/tracing) events and spans. With the `tracing` feature
//! enabled, [`logging::init`] installs a subscriber driven by `RUST_LOG`.

pub(crate) mod action;
pub mod cache;
pub mod cascade;
pub mod context;
pub mod error;
pub mod factory;
pub mod instance;
pub mod interceptor;
pub mod key;
#[cfg(feature = "tracing")]
pub mod logging;
pub mod mapping;
pub mod procedure;
pub mod query;
pub mod session;
pub mod snapshot;
pub mod storage;
pub mod types;

pub use action::ActionQueue;
#[doc(inline)]
pub use error::OrmError;
#[doc(inline)]
pub use error::Result;
#[doc(inline)]
pub use factory::FactoryRegistry;
#[doc(inline)]
pub use factory::SessionFactory;
#[doc(inline)]
pub use factory::SessionFactoryOptions;
#[doc(inline)]
pub use instance::CollectionRef;
#[doc(inline)]
pub use instance::EntityRef;
#[doc(inline)]
pub use key::EntityKey;
#[doc(inline)]
pub use session::Session;
#[doc(inline)]
pub use snapshot::SessionSnapshot;
#[doc(inline)]
pub use storage::Connection;
#[doc(inline)]
pub use storage::MemoryStorage;
#[doc(inline)]
pub use storage::Storage;

pub mod prelude {
    pub use crate::cache::CacheRegion;
    pub use crate::cache::RegionFactory;
    pub use crate::cascade::CascadeStyle;
    pub use crate::error::OrmError;
    pub use crate::error::Result;
    pub use crate::factory::FactoryRegistry;
    pub use crate::factory::SessionFactory;
    pub use crate::factory::SessionFactoryOptions;
    pub use crate::instance::CollectionRef;
    pub use crate::instance::EntityRef;
    pub use crate::interceptor::Interceptor;
    pub use crate::key::EntityKey;
    pub use crate::key::TenantId;
    pub use crate::mapping::EntityMapping;
    pub use crate::mapping::IdGenerator;
    pub use crate::mapping::Metamodel;
    pub use crate::procedure::ParameterMode;
    pub use crate::procedure::ProcedureCall;
    pub use crate::query::Query;
    pub use crate::query::QueryPlan;
    pub use crate::query::QueryResult;
    pub use crate::session::Session;
    pub use crate::snapshot::SessionSnapshot;
    pub use crate::storage::MemoryStorage;
    pub use crate::types::*;
}
