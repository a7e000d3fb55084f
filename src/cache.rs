//! Second-level cache protocol.
//!
//! A [`CacheRegion`] is shared by every session of a factory and, unlike anything else in this crate, may be hit
//! concurrently. Sessions talk to it in three ways:
//!
//! - loads read through [`CacheRegion::get`] and populate with [`CacheRegion::put_from_load`];
//! - updates and deletes take a soft lock with [`CacheRegion::lock_item`] before touching storage and release it with
//!   [`CacheRegion::unlock_item`] once the transaction completes, exactly once per lock whatever the outcome;
//! - inserts publish with [`CacheRegion::after_insert`] after commit.
//!
//! A reader hitting a soft-locked key sees a miss. Puts are version-stamped: a region never replaces an entry with an
//! older version.

pub mod moka_region;

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::fmt::Display;
use std::sync::Arc;

use crate::error::Result;
use crate::key::TenantId;
use crate::mapping::EntityPersister;
use crate::types::Datum;
use crate::types::Identifier;

pub use moka_region::MokaRegion;
pub use moka_region::MokaRegionFactory;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    entity_name: Arc<str>,
    id:          Identifier,
    tenant:      TenantId,
}

impl CacheKey {
    pub fn new(entity_name: Arc<str>, id: Identifier, tenant: TenantId) -> Self {
        Self {
            entity_name,
            id,
            tenant,
        }
    }

    #[inline]
    pub fn entity_name(&self) -> &str {
        &self.entity_name
    }

    #[inline]
    pub fn id(&self) -> &Identifier {
        &self.id
    }

    #[inline]
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }
}

impl Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.entity_name, self.id)
    }
}

/// Disassembled entity state as kept by a region.
#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    /// Concrete entity name of the cached row.
    pub subclass: Arc<str>,
    pub version:  Option<i64>,
    pub values:   Vec<Datum>,
}

impl CacheEntry {
    /// Whether this entry may replace `other`. Unversioned entries always may.
    pub fn supersedes(&self, other: &CacheEntry) -> bool {
        match (self.version, other.version) {
            (Some(new), Some(old)) => new >= old,
            _ => true,
        }
    }
}

/// Proof of a soft lock obtained with [`CacheRegion::lock_item`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SoftLock {
    id:               u64,
    previous_version: Option<i64>,
}

impl SoftLock {
    pub fn new(id: u64, previous_version: Option<i64>) -> Self {
        Self { id, previous_version }
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn previous_version(&self) -> Option<i64> {
        self.previous_version
    }
}

#[async_trait]
pub trait CacheRegion: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn generate_cache_key(&self, id: &Identifier, persister: &EntityPersister, tenant: &TenantId) -> CacheKey {
        CacheKey::new(persister.root_entity_name().clone(), id.clone(), tenant.clone())
    }

    /// `None` when the key is absent or soft-locked.
    async fn get(&self, key: &CacheKey) -> Option<CacheEntry>;

    /// Populates the region after a storage read. With `minimal_put` an existing entry is left untouched. Returns
    /// `true` if the entry was written.
    async fn put_from_load(&self, key: &CacheKey, entry: CacheEntry, minimal_put: bool) -> bool;

    async fn lock_item(&self, key: &CacheKey, previous_version: Option<i64>) -> Option<SoftLock>;

    async fn unlock_item(&self, key: &CacheKey, lock: SoftLock);

    /// Called right after the storage update, before commit. Read-write regions don't write here.
    async fn update(&self, _key: &CacheKey, _entry: &CacheEntry, _previous_version: Option<i64>) -> bool {
        false
    }

    /// Called after a successful commit, before the lock is released.
    async fn after_update(&self, key: &CacheKey, entry: CacheEntry, lock: &SoftLock) -> bool;

    async fn insert(&self, _key: &CacheKey, _entry: &CacheEntry) -> bool {
        false
    }

    async fn after_insert(&self, key: &CacheKey, entry: CacheEntry) -> bool;

    async fn evict(&self, key: &CacheKey);

    async fn evict_all(&self);
}

pub trait RegionFactory: Send + Sync + 'static {
    fn build_region(&self, name: &str, max_capacity: u64) -> Result<Arc<dyn CacheRegion>>;
}

/// Regions of a factory by root entity name.
#[derive(Clone, Default)]
pub struct CacheRegions {
    regions: HashMap<Arc<str>, Arc<dyn CacheRegion>>,
}

impl CacheRegions {
    pub fn insert(&mut self, root_entity_name: Arc<str>, region: Arc<dyn CacheRegion>) {
        self.regions.insert(root_entity_name, region);
    }

    pub fn region_for(&self, persister: &EntityPersister) -> Option<Arc<dyn CacheRegion>> {
        if !persister.is_cacheable() {
            return None;
        }
        self.regions.get(persister.root_entity_name()).cloned()
    }

    pub fn get(&self, root_entity_name: &str) -> Option<Arc<dyn CacheRegion>> {
        self.regions.get(root_entity_name).cloned()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Arc<str>, &Arc<dyn CacheRegion>)> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Debug for CacheRegions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.regions.values().map(|r| r.name())).finish()
    }
}
