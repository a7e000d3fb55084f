//! Session factories and the registry resolving them by identity.

use fieldx::fxstruct;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Weak;
use tracing::debug;
use tracing::instrument;
use uuid::Uuid;

use crate::cache::CacheRegions;
use crate::cache::MokaRegionFactory;
use crate::cache::RegionFactory;
use crate::error::OrmError;
use crate::error::Result;
use crate::interceptor::EmptyInterceptor;
use crate::interceptor::Interceptor;
use crate::key::TenantId;
use crate::mapping::Metamodel;
use crate::session::Session;
use crate::storage::Storage;
use crate::types::CacheMode;
use crate::types::FlushMode;

/// Factory-wide defaults. Sessions may override the modes.
///
/// ```ignore
/// let options = SessionFactoryOptions::builder()
///     .flush_mode(FlushMode::Commit)
///     .query_timeout(5)
///     .build()?;
/// ```
#[derive(Clone, Debug)]
#[fxstruct(no_new, default, builder, get(copy))]
pub struct SessionFactoryOptions {
    #[fieldx(default(FlushMode::Auto))]
    flush_mode:         FlushMode,
    #[fieldx(default(CacheMode::Normal))]
    cache_mode:         CacheMode,
    #[fieldx(default(true))]
    second_level_cache: bool,
    /// Maximum number of entries of each cache region.
    #[fieldx(default(10_000))]
    region_capacity:    u64,
    #[fieldx(default(false))]
    default_read_only:  bool,
    /// Seconds. Applies to queries which don't set their own timeout.
    #[fieldx(optional)]
    query_timeout:      u64,
    /// Don't overwrite cache entries with data just loaded from the storage.
    #[fieldx(default(true))]
    minimal_puts:       bool,
}

/// Immutable, thread-safe source of sessions. Owns the metamodel, the storage and the second-level cache regions.
pub struct SessionFactory {
    uuid:      Uuid,
    metamodel: Arc<Metamodel>,
    storage:   Arc<dyn Storage>,
    regions:   CacheRegions,
    options:   SessionFactoryOptions,
    closed:    AtomicBool,
}

impl SessionFactory {
    /// Builds a factory with a [`MokaRegion`](crate::cache::MokaRegion) per cacheable entity hierarchy.
    pub fn new(
        metamodel: Arc<Metamodel>,
        storage: Arc<dyn Storage>,
        options: SessionFactoryOptions,
    ) -> Result<Arc<Self>> {
        Self::with_region_factory(metamodel, storage, options, &MokaRegionFactory::default())
    }

    pub fn with_region_factory(
        metamodel: Arc<Metamodel>,
        storage: Arc<dyn Storage>,
        options: SessionFactoryOptions,
        region_factory: &dyn RegionFactory,
    ) -> Result<Arc<Self>> {
        let mut regions = CacheRegions::default();
        if options.second_level_cache() {
            for persister in metamodel.persisters() {
                let root = persister.root_entity_name();
                if persister.is_cacheable() && regions.get(root).is_none() {
                    regions.insert(
                        root.clone(),
                        region_factory.build_region(root, options.region_capacity())?,
                    );
                }
            }
        }

        let factory = Arc::new(Self {
            uuid: Uuid::new_v4(),
            metamodel,
            storage,
            regions,
            options,
            closed: AtomicBool::new(false),
        });
        debug!(
            "session factory {} built with {} cache regions",
            factory.uuid,
            factory.regions.len()
        );
        Ok(factory)
    }

    #[inline]
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    #[inline]
    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.metamodel
    }

    #[inline]
    pub fn regions(&self) -> &CacheRegions {
        &self.regions
    }

    #[inline]
    pub fn options(&self) -> &SessionFactoryOptions {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Opens a session with the factory defaults.
    pub async fn open_session(self: &Arc<Self>) -> Result<Session> {
        self.session_builder().open().await
    }

    pub fn session_builder(self: &Arc<Self>) -> SessionBuilder {
        SessionBuilder {
            factory:           self.clone(),
            tenant:            TenantId::Default,
            flush_mode:        self.options.flush_mode(),
            cache_mode:        self.options.cache_mode(),
            default_read_only: self.options.default_read_only(),
            interceptor:       Arc::new(EmptyInterceptor),
        }
    }

    /// Drops every cached entry. Sessions already open keep working; new ones can't be opened.
    #[instrument(level = "debug", skip(self), fields(factory = %self.uuid))]
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(OrmError::IllegalState("session factory is already closed".into()));
        }
        for (_, region) in self.regions.iter() {
            region.evict_all().await;
        }
        Ok(())
    }
}

impl Debug for SessionFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionFactory")
            .field("uuid", &self.uuid)
            .field("regions", &self.regions)
            .field("options", &self.options)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Per-session overrides of the factory defaults.
pub struct SessionBuilder {
    factory:           Arc<SessionFactory>,
    tenant:            TenantId,
    flush_mode:        FlushMode,
    cache_mode:        CacheMode,
    default_read_only: bool,
    interceptor:       Arc<dyn Interceptor>,
}

impl SessionBuilder {
    pub fn tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = TenantId::Named(tenant.into());
        self
    }

    pub fn flush_mode(mut self, flush_mode: FlushMode) -> Self {
        self.flush_mode = flush_mode;
        self
    }

    pub fn cache_mode(mut self, cache_mode: CacheMode) -> Self {
        self.cache_mode = cache_mode;
        self
    }

    pub fn default_read_only(mut self, read_only: bool) -> Self {
        self.default_read_only = read_only;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn Interceptor>) -> Self {
        self.interceptor = interceptor;
        self
    }

    pub async fn open(self) -> Result<Session> {
        if self.factory.is_closed() {
            return Err(OrmError::IllegalState("session factory is closed".into()));
        }
        let conn = self.factory.storage.connect().await?;
        Ok(Session::new(
            self.factory,
            conn,
            self.interceptor,
            self.tenant,
            self.flush_mode,
            self.cache_mode,
            self.default_read_only,
        ))
    }
}

/// Resolves factories by their UUID, e.g. when a session snapshot is restored.
///
/// The registry holds weak references: dropping the last handle of a factory unregisters it implicitly. A closed
/// factory is never returned.
#[derive(Clone, Default)]
pub struct FactoryRegistry {
    factories: Arc<RwLock<HashMap<Uuid, Weak<SessionFactory>>>>,
}

impl FactoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, factory: &Arc<SessionFactory>) {
        debug!("registering session factory {}", factory.uuid);
        self.factories.write().insert(factory.uuid, Arc::downgrade(factory));
    }

    pub fn unregister(&self, uuid: &Uuid) -> bool {
        self.factories.write().remove(uuid).is_some()
    }

    pub fn get(&self, uuid: &Uuid) -> Option<Arc<SessionFactory>> {
        self.factories
            .read()
            .get(uuid)
            .and_then(Weak::upgrade)
            .filter(|f| !f.is_closed())
    }

    /// Number of registered factories still alive.
    pub fn len(&self) -> usize {
        self.factories.read().values().filter(|f| f.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Debug for FactoryRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.factories.read().keys()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cascade::CascadeStyle;
    use crate::mapping::EntityMapping;
    use crate::storage::MemoryStorage;

    fn factory(options: SessionFactoryOptions) -> Arc<SessionFactory> {
        let metamodel = Arc::new(
            Metamodel::builder()
                .entity(EntityMapping::new("Parent").cacheable(true).property("name"))
                .entity(
                    EntityMapping::new("Child")
                        .property("name")
                        .many_to_one("parent", "Parent", CascadeStyle::none()),
                )
                .build()
                .unwrap(),
        );
        let storage = Arc::new(MemoryStorage::new(metamodel.clone()));
        SessionFactory::new(metamodel, storage, options).unwrap()
    }

    #[test]
    fn option_defaults() {
        let options = SessionFactoryOptions::builder().build().unwrap();
        assert_eq!(options.flush_mode(), FlushMode::Auto);
        assert_eq!(options.cache_mode(), CacheMode::Normal);
        assert!(options.second_level_cache());
        assert_eq!(options.region_capacity(), 10_000);
        assert_eq!(options.query_timeout(), None);

        let options = SessionFactoryOptions::builder().query_timeout(5).build().unwrap();
        assert_eq!(options.query_timeout(), Some(5));
    }

    #[test]
    fn regions_are_built_for_cacheable_hierarchies() {
        let f = factory(SessionFactoryOptions::default());
        assert_eq!(f.regions().len(), 1);
        assert!(f.regions().get("Parent").is_some());

        let f = factory(
            SessionFactoryOptions::builder()
                .second_level_cache(false)
                .build()
                .unwrap(),
        );
        assert!(f.regions().is_empty());
    }

    #[tokio::test]
    async fn registry_forgets_closed_and_dropped_factories() {
        let registry = FactoryRegistry::new();
        let first = factory(SessionFactoryOptions::default());
        let second = factory(SessionFactoryOptions::default());
        registry.register(&first);
        registry.register(&second);
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&first.uuid()).is_some());

        first.close().await.unwrap();
        assert!(registry.get(&first.uuid()).is_none());
        assert!(first.close().await.is_err());

        let uuid = second.uuid();
        drop(second);
        assert!(registry.get(&uuid).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.unregister(&uuid));
    }

    #[tokio::test]
    async fn closed_factory_opens_no_sessions() {
        let f = factory(SessionFactoryOptions::default());
        assert!(f.open_session().await.is_ok());
        f.close().await.unwrap();
        assert!(matches!(f.open_session().await, Err(OrmError::IllegalState(_))));
    }
}
