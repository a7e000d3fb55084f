use async_trait::async_trait;
use fieldx::fxstruct;
use moka::future::Cache;
use moka::ops::compute::CompResult;
use moka::ops::compute::Op;
use moka::policy::EvictionPolicy;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;
use tracing::debug;
use tracing::trace;
use tracing::warn;

use super::CacheEntry;
use super::CacheKey;
use super::CacheRegion;
use super::RegionFactory;
use super::SoftLock;
use crate::error::OrmError;
use crate::error::Result;

#[derive(Clone, Debug)]
struct LockRecord {
    holders:   Vec<u64>,
    // Value published by `after_update`, installed when the last holder unlocks.
    staged:    Option<CacheEntry>,
    // More than one writer held the lock at some point; nothing staged can be trusted.
    contended: bool,
    expires:   Instant,
}

#[derive(Clone, Debug)]
enum RegionItem {
    Value(CacheEntry),
    Locked(LockRecord),
}

/// Read-write cache region over a [`moka`] future cache.
///
/// ```ignore
/// let region = MokaRegion::builder()
///     .region_name("Parent")
///     .max_capacity(1_000)
///     .build()?;
/// ```
#[fxstruct(sync, no_new, builder, get(copy))]
pub struct MokaRegion {
    #[fieldx(get(clone), builder(into))]
    region_name: String,

    #[fieldx(default(10_000))]
    max_capacity: u64,

    /// A soft lock not released within this period is considered abandoned and may be overwritten by loads.
    #[fieldx(default(Duration::from_secs(60)))]
    lock_timeout: Duration,

    #[fieldx(lazy, private, get(clone), builder(off))]
    cache: Arc<Cache<CacheKey, RegionItem>>,

    #[fieldx(get(off), builder(off), default(AtomicU64::new(1)))]
    next_lock: AtomicU64,
}

impl MokaRegion {
    fn build_cache(&self) -> Arc<Cache<CacheKey, RegionItem>> {
        Arc::new(
            Cache::builder()
                .max_capacity(self.max_capacity())
                .name(&self.region_name)
                .eviction_policy(EvictionPolicy::tiny_lfu())
                .build(),
        )
    }

    /// Number of entries, locked ones included. Pending moka maintenance is run first.
    pub async fn entry_count(&self) -> u64 {
        let cache = self.cache();
        cache.run_pending_tasks().await;
        cache.entry_count()
    }

    /// Whether the key currently carries a soft lock.
    pub async fn is_locked(&self, key: &CacheKey) -> bool {
        matches!(self.cache().get(key).await, Some(RegionItem::Locked(_)))
    }

    fn written(result: &CompResult<CacheKey, RegionItem>) -> bool {
        matches!(result, CompResult::Inserted(_) | CompResult::ReplacedWith(_))
    }
}

#[async_trait]
impl CacheRegion for MokaRegion {
    fn name(&self) -> &str {
        &self.region_name
    }

    async fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
        match self.cache().get(key).await {
            Some(RegionItem::Value(entry)) => Some(entry),
            Some(RegionItem::Locked(_)) => {
                trace!("[{}] miss on soft-locked {key}", self.region_name);
                None
            }
            None => None,
        }
    }

    async fn put_from_load(&self, key: &CacheKey, entry: CacheEntry, minimal_put: bool) -> bool {
        let now = Instant::now();
        let result = self
            .cache()
            .entry(key.clone())
            .and_compute_with(|current| async move {
                match current.map(|c| c.into_value()) {
                    None => Op::Put(RegionItem::Value(entry)),
                    Some(RegionItem::Value(ref old)) if !minimal_put && entry.supersedes(old) => {
                        Op::Put(RegionItem::Value(entry))
                    }
                    Some(RegionItem::Value(_)) => Op::Nop,
                    Some(RegionItem::Locked(ref lock)) if lock.expires <= now => Op::Put(RegionItem::Value(entry)),
                    Some(RegionItem::Locked(_)) => Op::Nop,
                }
            })
            .await;
        Self::written(&result)
    }

    async fn lock_item(&self, key: &CacheKey, previous_version: Option<i64>) -> Option<SoftLock> {
        let id = self.next_lock.fetch_add(1, Ordering::Relaxed);
        let expires = Instant::now() + self.lock_timeout();
        self.cache()
            .entry(key.clone())
            .and_compute_with(|current| async move {
                let record = match current.map(|c| c.into_value()) {
                    Some(RegionItem::Locked(mut lock)) if lock.expires > Instant::now() => {
                        lock.holders.push(id);
                        lock.contended = true;
                        lock.staged = None;
                        lock.expires = expires;
                        lock
                    }
                    _ => LockRecord {
                        holders: vec![id],
                        staged: None,
                        contended: false,
                        expires,
                    },
                };
                Op::Put(RegionItem::Locked(record))
            })
            .await;
        trace!("[{}] soft lock {id} on {key}", self.region_name);
        Some(SoftLock::new(id, previous_version))
    }

    async fn unlock_item(&self, key: &CacheKey, lock: SoftLock) {
        let region = self.region_name.clone();
        let lock_id = lock.id();
        self.cache()
            .entry(key.clone())
            .and_compute_with(|current| async move {
                match current.map(|c| c.into_value()) {
                    Some(RegionItem::Locked(mut record)) if record.holders.contains(&lock_id) => {
                        record.holders.retain(|h| *h != lock_id);
                        if !record.holders.is_empty() {
                            return Op::Put(RegionItem::Locked(record));
                        }
                        match record.staged {
                            Some(entry) if !record.contended => Op::Put(RegionItem::Value(entry)),
                            _ => Op::Remove,
                        }
                    }
                    _ => {
                        warn!("[{region}] soft lock {lock_id} is not held on {key}");
                        Op::Nop
                    }
                }
            })
            .await;
    }

    async fn after_update(&self, key: &CacheKey, entry: CacheEntry, lock: &SoftLock) -> bool {
        let lock_id = lock.id();
        let result = self
            .cache()
            .entry(key.clone())
            .and_compute_with(|current| async move {
                match current.map(|c| c.into_value()) {
                    Some(RegionItem::Locked(mut record)) if record.holders == [lock_id] && !record.contended => {
                        record.staged = Some(entry);
                        Op::Put(RegionItem::Locked(record))
                    }
                    _ => Op::Nop,
                }
            })
            .await;
        Self::written(&result)
    }

    async fn after_insert(&self, key: &CacheKey, entry: CacheEntry) -> bool {
        let result = self
            .cache()
            .entry(key.clone())
            .and_compute_with(|current| async move {
                if current.is_some() {
                    Op::Nop
                }
                else {
                    Op::Put(RegionItem::Value(entry))
                }
            })
            .await;
        Self::written(&result)
    }

    async fn evict(&self, key: &CacheKey) {
        self.cache().invalidate(key).await;
    }

    async fn evict_all(&self) {
        debug!("[{}] evicting all entries", self.region_name);
        self.cache().invalidate_all();
    }
}

/// Builds a [`MokaRegion`] per cacheable entity hierarchy.
#[derive(Clone, Copy, Debug, Default)]
pub struct MokaRegionFactory {
    lock_timeout: Option<Duration>,
}

impl MokaRegionFactory {
    pub fn with_lock_timeout(lock_timeout: Duration) -> Self {
        Self {
            lock_timeout: Some(lock_timeout),
        }
    }
}

impl RegionFactory for MokaRegionFactory {
    fn build_region(&self, name: &str, max_capacity: u64) -> Result<Arc<dyn CacheRegion>> {
        let mut builder = MokaRegion::builder().region_name(name).max_capacity(max_capacity);
        if let Some(timeout) = self.lock_timeout {
            builder = builder.lock_timeout(timeout);
        }
        let region = builder
            .build()
            .map_err(|e| OrmError::Configuration(format!("cache region '{name}': {e}")))?;
        Ok(Arc::new(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::TenantId;
    use crate::types::Datum;
    use crate::types::Identifier;

    fn region() -> MokaRegion {
        MokaRegion::builder().region_name("Parent").build().unwrap()
    }

    fn key(id: i64) -> CacheKey {
        CacheKey::new(Arc::from("Parent"), Identifier::Int(id), TenantId::Default)
    }

    fn entry(version: i64, name: &str) -> CacheEntry {
        CacheEntry {
            subclass: Arc::from("Parent"),
            version:  Some(version),
            values:   vec![Datum::Int(version), Datum::Text(name.into())],
        }
    }

    #[tokio::test]
    async fn older_versions_are_rejected() {
        let region = region();
        assert!(region.put_from_load(&key(1), entry(2, "b"), false).await);
        assert!(!region.put_from_load(&key(1), entry(1, "a"), false).await);
        assert_eq!(region.get(&key(1)).await, Some(entry(2, "b")));
        assert!(!region.put_from_load(&key(1), entry(3, "c"), true).await);
        assert!(region.put_from_load(&key(1), entry(3, "c"), false).await);
    }

    #[tokio::test]
    async fn locked_key_misses_until_unlocked() {
        let region = region();
        region.put_from_load(&key(1), entry(1, "a"), false).await;
        let lock = region.lock_item(&key(1), Some(1)).await.unwrap();
        assert!(region.get(&key(1)).await.is_none());
        assert!(!region.put_from_load(&key(1), entry(1, "a"), false).await);

        assert!(region.after_update(&key(1), entry(2, "b"), &lock).await);
        assert!(region.get(&key(1)).await.is_none());
        region.unlock_item(&key(1), lock).await;
        assert_eq!(region.get(&key(1)).await, Some(entry(2, "b")));
    }

    #[tokio::test]
    async fn unlock_without_staged_value_evicts() {
        let region = region();
        region.put_from_load(&key(1), entry(1, "a"), false).await;
        let lock = region.lock_item(&key(1), Some(1)).await.unwrap();
        region.unlock_item(&key(1), lock).await;
        assert!(region.get(&key(1)).await.is_none());
        assert!(!region.is_locked(&key(1)).await);
    }

    #[tokio::test]
    async fn contended_lock_discards_staged_value() {
        let region = region();
        let first = region.lock_item(&key(1), None).await.unwrap();
        let second = region.lock_item(&key(1), None).await.unwrap();
        assert!(!region.after_update(&key(1), entry(2, "b"), &first).await);
        region.unlock_item(&key(1), first).await;
        assert!(region.is_locked(&key(1)).await);
        region.unlock_item(&key(1), second).await;
        assert!(region.get(&key(1)).await.is_none());
    }

    #[tokio::test]
    async fn after_insert_does_not_overwrite() {
        let region = region();
        assert!(region.after_insert(&key(1), entry(1, "a")).await);
        assert!(!region.after_insert(&key(1), entry(1, "b")).await);
        assert_eq!(region.get(&key(1)).await, Some(entry(1, "a")));
    }
}
