//! Entity cache and string interning
//!
//! The entity cache is an LRU keyed by id with a TTL; values are parsed
//! entities behind `Arc` so readers share one allocation. Writes
//! invalidate explicitly, the memory guardian shrinks the capacity under
//! pressure.
//!
//! The intern table bounds duplicate tag-body strings coming in from
//! queries and tag parsing; it is dropped wholesale under memory
//! pressure.

use entitydb_core::{Entity, EntityId};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct CacheSlot {
    entity: Arc<Entity>,
    inserted: Instant,
}

/// LRU entity cache with TTL and explicit invalidation
pub struct EntityCache {
    inner: Mutex<LruCache<EntityId, CacheSlot>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl EntityCache {
    /// Create a cache holding at most `capacity` entities
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        EntityCache {
            inner: Mutex::new(LruCache::new(nonzero(capacity))),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Fetch an entity, honoring the TTL
    pub fn get(&self, id: &EntityId) -> Option<Arc<Entity>> {
        let mut inner = self.inner.lock();
        match inner.get(id) {
            Some(slot) if slot.inserted.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&slot.entity))
            }
            Some(_) => {
                inner.pop(id);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Insert or refresh an entity
    pub fn insert(&self, entity: Arc<Entity>) {
        let mut inner = self.inner.lock();
        inner.put(
            entity.id.clone(),
            CacheSlot {
                entity,
                inserted: Instant::now(),
            },
        );
    }

    /// Drop one entry
    pub fn invalidate(&self, id: &EntityId) {
        self.inner.lock().pop(id);
    }

    /// Drop everything
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Halve the capacity, evicting as needed; the pressure reaction
    pub fn shrink_half(&self) {
        let mut inner = self.inner.lock();
        let cap = inner.cap().get();
        inner.resize(nonzero(cap / 2));
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cache hits since startup
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Cache misses since startup
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

/// Bounded LRU intern table for tag-body strings
pub struct InternTable {
    inner: Mutex<LruCache<String, Arc<str>>>,
}

impl InternTable {
    /// Create a table bounded to `capacity` strings
    pub fn new(capacity: usize) -> Self {
        InternTable {
            inner: Mutex::new(LruCache::new(nonzero(capacity))),
        }
    }

    /// Return a shared allocation for `s`
    pub fn intern(&self, s: &str) -> Arc<str> {
        let mut inner = self.inner.lock();
        if let Some(interned) = inner.get(s) {
            return Arc::clone(interned);
        }
        let interned: Arc<str> = Arc::from(s);
        inner.put(s.to_owned(), Arc::clone(&interned));
        interned
    }

    /// Drop every interned string; the pressure reaction
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// True if nothing is interned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn nonzero(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use entitydb_core::{TagBody, TemporalTag};

    fn entity(id: &str) -> Arc<Entity> {
        Arc::new(Entity::new(
            EntityId::new(id).unwrap(),
            vec![TemporalTag::at(1, TagBody::new("type:doc").unwrap()).unwrap()],
            Vec::new(),
        ))
    }

    #[test]
    fn test_insert_get_invalidate() {
        let cache = EntityCache::new(16, Duration::from_secs(60));
        let e = entity("e1");
        cache.insert(Arc::clone(&e));

        let got = cache.get(&e.id).unwrap();
        assert_eq!(got.id, e.id);
        assert_eq!(cache.hits(), 1);

        cache.invalidate(&e.id);
        assert!(cache.get(&e.id).is_none());
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = EntityCache::new(16, Duration::from_millis(0));
        let e = entity("e1");
        cache.insert(Arc::clone(&e));
        // Zero TTL: everything is expired on arrival.
        assert!(cache.get(&e.id).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_lru_eviction_at_capacity() {
        let cache = EntityCache::new(2, Duration::from_secs(60));
        cache.insert(entity("e1"));
        cache.insert(entity("e2"));
        cache.insert(entity("e3"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&EntityId::new("e1").unwrap()).is_none());
    }

    #[test]
    fn test_shrink_half() {
        let cache = EntityCache::new(8, Duration::from_secs(60));
        for i in 0..8 {
            cache.insert(entity(&format!("e{}", i)));
        }
        cache.shrink_half();
        assert!(cache.len() <= 4);
    }

    #[test]
    fn test_intern_shares_allocation() {
        let table = InternTable::new(8);
        let a = table.intern("type:doc");
        let b = table.intern("type:doc");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);

        table.clear();
        assert!(table.is_empty());
        let c = table.intern("type:doc");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_intern_bounded() {
        let table = InternTable::new(2);
        table.intern("a:1");
        table.intern("b:2");
        table.intern("c:3");
        assert_eq!(table.len(), 2);
    }
}
