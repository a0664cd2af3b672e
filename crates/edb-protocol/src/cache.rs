//! Pool-scoped codec caches.
//!
//! Every connection of a pool shares one [`CodecsRegistry`] and one
//! [`QueryCodecsCache`]. The session layer treats both as opaque handles:
//! it creates them, hands them to the protocol on each query, and replaces
//! them wholesale when the connection arguments change. Only protocol
//! implementations read or populate them.

use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::num::NonZeroUsize;
use std::sync::Arc;

use bytes::Bytes;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};

/// Default number of query descriptors kept per pool.
pub const DEFAULT_QUERY_CACHE_SIZE: usize = 1000;

/// Registry of type-descriptor codecs keyed by descriptor id.
#[derive(Default)]
pub struct CodecsRegistry {
    codecs: RwLock<HashMap<Bytes, Bytes>>,
}

impl CodecsRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a codec by descriptor id.
    pub fn get(&self, descriptor_id: &[u8]) -> Option<Bytes> {
        self.codecs.read().get(descriptor_id).cloned()
    }

    /// Register a codec for a descriptor id.
    pub fn insert(&self, descriptor_id: Bytes, codec: Bytes) {
        self.codecs.write().insert(descriptor_id, codec);
    }

    /// Number of registered codecs.
    pub fn len(&self) -> usize {
        self.codecs.read().len()
    }

    /// Whether the registry is empty.
    pub fn is_empty(&self) -> bool {
        self.codecs.read().is_empty()
    }
}

impl std::fmt::Debug for CodecsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodecsRegistry")
            .field("len", &self.len())
            .finish()
    }
}

/// Input/output descriptor ids resolved for a query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryCodecs {
    /// Descriptor id of the query arguments.
    pub input: Bytes,
    /// Descriptor id of the query result.
    pub output: Bytes,
}

/// LRU of query text to resolved descriptor ids.
pub struct QueryCodecsCache {
    cache: Mutex<LruCache<u64, QueryCodecs>>,
    max_size: usize,
}

impl QueryCodecsCache {
    /// Create a cache holding at most `max_size` queries (minimum one).
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        let capacity = NonZeroUsize::new(max_size).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
            max_size: capacity.get(),
        }
    }

    /// Look up the descriptors of a query, updating LRU order.
    pub fn get(&self, query: &str) -> Option<QueryCodecs> {
        self.cache.lock().get(&hash_query(query)).cloned()
    }

    /// Remember the descriptors of a query.
    pub fn insert(&self, query: &str, codecs: QueryCodecs) {
        self.cache.lock().put(hash_query(query), codecs);
    }

    /// Number of cached queries.
    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.cache.lock().is_empty()
    }

    /// Maximum number of cached queries.
    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

impl Default for QueryCodecsCache {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_CACHE_SIZE)
    }
}

impl std::fmt::Debug for QueryCodecsCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCodecsCache")
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .finish()
    }
}

/// Shared handle to both caches of a pool.
///
/// Cloning is cheap; clones point at the same caches.
#[derive(Debug, Clone, Default)]
pub struct QueryCache {
    codecs_registry: Arc<CodecsRegistry>,
    query_cache: Arc<QueryCodecsCache>,
}

impl QueryCache {
    /// Create a fresh pair of empty caches.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The codec registry.
    #[must_use]
    pub fn codecs_registry(&self) -> &CodecsRegistry {
        &self.codecs_registry
    }

    /// The query descriptor cache.
    #[must_use]
    pub fn query_cache(&self) -> &QueryCodecsCache {
        &self.query_cache
    }

    /// Whether both handles point at the same caches as `other`.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.codecs_registry, &other.codecs_registry)
            && Arc::ptr_eq(&self.query_cache, &other.query_cache)
    }
}

fn hash_query(query: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    query.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codecs(tag: &'static [u8]) -> QueryCodecs {
        QueryCodecs {
            input: Bytes::from_static(b"\x00"),
            output: Bytes::from_static(tag),
        }
    }

    #[test]
    fn test_query_cache_evicts_lru() {
        let cache = QueryCodecsCache::new(2);
        cache.insert("SELECT 1", codecs(b"a"));
        cache.insert("SELECT 2", codecs(b"b"));
        // Touch the first entry so the second becomes least recently used.
        assert!(cache.get("SELECT 1").is_some());
        cache.insert("SELECT 3", codecs(b"c"));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("SELECT 2").is_none());
        assert_eq!(cache.get("SELECT 3"), Some(codecs(b"c")));
    }

    #[test]
    fn test_zero_sized_cache_holds_one() {
        let cache = QueryCodecsCache::new(0);
        assert_eq!(cache.max_size(), 1);
    }

    #[test]
    fn test_shared_handles() {
        let a = QueryCache::new();
        let b = a.clone();
        let c = QueryCache::new();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));

        b.codecs_registry()
            .insert(Bytes::from_static(b"id"), Bytes::from_static(b"codec"));
        assert_eq!(a.codecs_registry().len(), 1);
        assert!(c.codecs_registry().is_empty());
    }
}
