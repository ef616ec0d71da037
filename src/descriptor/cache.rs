//! Process-wide memoization of computation descriptors.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::descriptor::key::CacheKey;
use crate::error::{AccelError, AccelResult};

/// A built, reusable computation plan.
pub trait Descriptor: Send + Sync + 'static {
    /// Short name used in logs and errors.
    fn op_name(&self) -> &'static str;

    /// Check that a freshly built descriptor can be executed.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Hit/miss counters of a [`DescriptorCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    /// Builds that lost an insertion race and were dropped.
    pub discarded: u64,
}

/// Key-to-descriptor map shared by every caller in the process.
///
/// Entries live for the lifetime of the cache. Builders run without any
/// lock held, so two threads missing on the same key may both build; the
/// first insertion wins and the other build is discarded.
pub struct DescriptorCache<V, K = CacheKey> {
    entries: RwLock<HashMap<K, Arc<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    discarded: AtomicU64,
}

impl<V, K> Default for DescriptorCache<V, K> {
    fn default() -> Self {
        DescriptorCache {
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }
}

impl<V, K> DescriptorCache<V, K>
where
    V: Descriptor,
    K: Hash + Eq + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached descriptor for `key`, building it with `builder` on a miss.
    ///
    /// A failed build propagates its error and caches nothing. A built
    /// descriptor that fails [`Descriptor::validate`] is reported as
    /// `UnusableDescriptor` and not cached either.
    pub fn fetch_or_create<F>(&self, key: &K, builder: F) -> AccelResult<Arc<V>>
    where
        F: FnOnce() -> AccelResult<V>,
    {
        if let Some(found) = self.get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(found);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        let built = builder()?;
        if let Err(reason) = built.validate() {
            log::warn!("{}: built descriptor is unusable: {}", built.op_name(), reason);
            return Err(AccelError::UnusableDescriptor {
                op: built.op_name(),
                reason,
            });
        }
        let built = Arc::new(built);

        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some(winner) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                log::debug!("{}: discarding duplicate descriptor build", built.op_name());
                Ok(Arc::clone(winner))
            }
            None => {
                log::debug!(
                    "{}: cached new descriptor ({} entries)",
                    built.op_name(),
                    entries.len() + 1
                );
                entries.insert(key.clone(), Arc::clone(&built));
                Ok(built)
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.get(key).cloned()
    }

    pub fn contains(&self, key: &K) -> bool {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

impl<V, K> std::fmt::Debug for DescriptorCache<V, K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entries = self.entries.read().map(|e| e.len()).unwrap_or(0);
        f.debug_struct("DescriptorCache")
            .field("value", &std::any::type_name::<V>())
            .field("entries", &entries)
            .field("hits", &self.hits.load(Ordering::Relaxed))
            .field("misses", &self.misses.load(Ordering::Relaxed))
            .finish()
    }
}
