//! Thread-safe content cache partitioned by protected domain.
//!
//! ## Architecture
//!
//! ```text
//! ContentCache
//!   ├── "example.com" → DomainCache { LruCache<path, Arc<CachedRoute>> }
//!   ├── "example.org" → DomainCache { ... }
//!   └── PersistQueue (optional) → writer thread → <disk_path>/<sha256>
//! ```
//!
//! Partitions are fixed at construction, so looking up a domain never takes a
//! lock. Each partition is an LRU list behind its own mutex, bounded by
//! `max_entries`; inserts are insert-if-absent and the first writer wins.
//! Evicting the least recently used entry is O(1).

use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http::HeaderMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::disk::DiskStore;
use crate::error::{Result, StorageError};
use crate::persist::{PersistQueue, PersistStats, Persistence, DEFAULT_QUEUE_DEPTH};
use crate::route::CachedRoute;

/// Default per-domain entry limit.
pub const DEFAULT_MAX_ENTRIES: usize = 1024;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries per domain.
    pub max_entries: usize,
    /// Directory for content-addressed copies (None = memory only).
    pub disk_path: Option<PathBuf>,
    /// Pending disk writes before new writes are dropped.
    pub write_queue_depth: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            disk_path: None,
            write_queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl CacheConfig {
    /// Sets the per-domain entry limit.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Enables disk persistence under `path`.
    pub fn with_disk_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.disk_path = Some(path.into());
        self
    }

    /// Sets the persistence queue depth.
    pub fn with_write_queue_depth(mut self, depth: usize) -> Self {
        self.write_queue_depth = depth;
        self
    }
}

/// Result of a [`ContentCache::put`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The route was inserted.
    Inserted(Persistence),
    /// Another writer inserted this key first; the existing entry is untouched.
    AlreadyPresent,
}

impl PutOutcome {
    /// Returns true if this call inserted the route.
    pub fn is_inserted(&self) -> bool {
        matches!(self, PutOutcome::Inserted(_))
    }
}

struct DomainCache {
    routes: Mutex<LruCache<String, Arc<CachedRoute>>>,
}

impl DomainCache {
    fn new(max_entries: NonZeroUsize) -> Self {
        Self {
            routes: Mutex::new(LruCache::new(max_entries)),
        }
    }

    fn get(&self, path: &str) -> Option<Arc<CachedRoute>> {
        self.routes.lock().get(path).cloned()
    }

    /// Inserts `route` unless `path` is cached, evicting the least recently
    /// used entry when the partition is full.
    fn insert(&self, path: String, route: Arc<CachedRoute>) -> bool {
        let mut routes = self.routes.lock();
        if routes.contains(&path) {
            return false;
        }

        if let Some((evicted, _)) = routes.push(path, route) {
            debug!(path = %evicted, "Evicted cached route");
        }
        true
    }

    fn len(&self) -> usize {
        self.routes.lock().len()
    }

    fn hashes(&self) -> BTreeMap<String, String> {
        self.routes
            .lock()
            .iter()
            .map(|(path, route)| (path.clone(), route.content_hash().to_string()))
            .collect()
    }
}

/// Cache of origin responses for every protected domain.
pub struct ContentCache {
    domains: HashMap<String, DomainCache>,
    persist: Option<PersistQueue>,
    max_entries: usize,
}

impl std::fmt::Debug for ContentCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentCache")
            .field("domains", &self.domains.keys().collect::<Vec<_>>())
            .field("max_entries", &self.max_entries)
            .field("persist", &self.persist)
            .finish()
    }
}

impl ContentCache {
    /// Creates a cache with one partition per domain.
    ///
    /// Domains are matched case-insensitively, ignoring surrounding whitespace.
    pub fn new<I, S>(domains: I, config: CacheConfig) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let capacity = NonZeroUsize::new(config.max_entries)
            .ok_or_else(|| StorageError::Config("max_entries must be at least 1".into()))?;

        let domains: HashMap<String, DomainCache> = domains
            .into_iter()
            .map(|d| (normalize_domain(d.as_ref()), DomainCache::new(capacity)))
            .collect();

        let persist = match config.disk_path {
            Some(ref path) if !path.as_os_str().is_empty() => {
                let store = DiskStore::open(path)?;
                Some(PersistQueue::spawn(store, config.write_queue_depth)?)
            }
            _ => None,
        };

        info!(
            domains = domains.len(),
            max_entries = config.max_entries,
            write_to_disk = persist.is_some(),
            "Content cache ready"
        );

        Ok(Self {
            domains,
            persist,
            max_entries: config.max_entries,
        })
    }

    /// Creates a memory-only cache with default limits.
    pub fn in_memory<I, S>(domains: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self::new(domains, CacheConfig::default())
    }

    fn partition(&self, domain: &str) -> Option<&DomainCache> {
        match self.domains.get(domain) {
            Some(partition) => Some(partition),
            None => self.domains.get(&normalize_domain(domain)),
        }
    }

    /// Looks up the cached route for `(domain, path)`.
    pub fn get(&self, domain: &str, path: &str) -> Option<Arc<CachedRoute>> {
        self.partition(domain)?.get(path)
    }

    /// Inserts a route if the key is absent.
    ///
    /// Losing an insert race is not an error: the existing entry is kept and
    /// [`PutOutcome::AlreadyPresent`] is returned. With a disk path the new
    /// route is queued for persistence; persistence problems never affect the
    /// in-memory entry.
    pub fn put(
        &self,
        domain: &str,
        path: &str,
        content: Bytes,
        headers: &HeaderMap,
    ) -> Result<PutOutcome> {
        let partition = self
            .partition(domain)
            .ok_or_else(|| StorageError::UnknownDomain(domain.to_string()))?;

        let route = Arc::new(CachedRoute::new(domain, path, content, headers));
        if !partition.insert(path.to_string(), route.clone()) {
            debug!(domain, path, "Route already cached, keeping existing entry");
            return Ok(PutOutcome::AlreadyPresent);
        }

        info!(domain, path, hash = route.content_hash(), "Added new cached route");

        let persistence = match &self.persist {
            Some(queue) => queue.enqueue(route),
            None => Persistence::Disabled,
        };

        Ok(PutOutcome::Inserted(persistence))
    }

    /// Snapshot of `path → content hash` for a domain.
    ///
    /// Empty for unknown domains.
    pub fn asset_hash_map(&self, domain: &str) -> BTreeMap<String, String> {
        self.partition(domain)
            .map(DomainCache::hashes)
            .unwrap_or_default()
    }

    /// Returns true if `domain` has a partition.
    pub fn has_domain(&self, domain: &str) -> bool {
        self.partition(domain).is_some()
    }

    /// Number of entries cached for a domain.
    pub fn len(&self, domain: &str) -> usize {
        self.partition(domain).map(DomainCache::len).unwrap_or(0)
    }

    /// Number of entries across all domains.
    pub fn total_len(&self) -> usize {
        self.domains.values().map(DomainCache::len).sum()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.total_len() == 0
    }

    /// Per-domain entry limit.
    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    /// Whether new routes are persisted to disk.
    pub fn write_to_disk(&self) -> bool {
        self.persist.is_some()
    }

    /// Persistence counters, when writing to disk.
    pub fn persist_stats(&self) -> Option<&PersistStats> {
        self.persist.as_ref().map(PersistQueue::stats)
    }

    /// Blocks until queued disk writes have been processed.
    pub fn flush(&self) {
        if let Some(queue) = &self.persist {
            queue.flush();
        }
    }
}

/// Canonical form of a domain name used as a partition key.
pub fn normalize_domain(domain: &str) -> String {
    domain.trim().to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::route::hash_content;
    use http::header::{HeaderValue, CONTENT_TYPE};
    use std::sync::Barrier;
    use tempfile::TempDir;

    fn html_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        headers
    }

    fn cache() -> ContentCache {
        ContentCache::in_memory(["example.com", "example.org"]).unwrap()
    }

    #[test]
    fn get_on_empty_cache_misses() {
        assert!(cache().get("example.com", "/").is_none());
    }

    #[test]
    fn repeated_gets_are_identical() {
        let cache = cache();
        cache
            .put("example.com", "/", Bytes::from_static(b"hello"), &html_headers())
            .unwrap();

        let first = cache.get("example.com", "/").unwrap();
        let second = cache.get("example.com", "/").unwrap();
        assert_eq!(first.content(), second.content());
        assert_eq!(first.content_hash(), second.content_hash());
        assert_eq!(first.content_hash(), hash_content(b"hello"));
    }

    #[test]
    fn first_writer_wins() {
        let cache = cache();
        let first = cache
            .put("example.com", "/", Bytes::from_static(b"first"), &html_headers())
            .unwrap();
        let second = cache
            .put("example.com", "/", Bytes::from_static(b"second"), &html_headers())
            .unwrap();

        assert_eq!(first, PutOutcome::Inserted(Persistence::Disabled));
        assert_eq!(second, PutOutcome::AlreadyPresent);
        assert_eq!(
            cache.get("example.com", "/").unwrap().content(),
            Bytes::from_static(b"first")
        );
    }

    #[test]
    fn concurrent_puts_insert_exactly_once() {
        let cache = Arc::new(cache());
        let threads = 16;
        let barrier = Arc::new(Barrier::new(threads));

        let handles: Vec<_> = (0..threads)
            .map(|i| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    let body = Bytes::from(format!("content-{}", i));
                    let outcome = cache.put("example.com", "/race", body.clone(), &HeaderMap::new()).unwrap();
                    (outcome, body)
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let winners: Vec<_> = results.iter().filter(|(o, _)| o.is_inserted()).collect();
        assert_eq!(winners.len(), 1);
        assert_eq!(
            results.iter().filter(|(o, _)| *o == PutOutcome::AlreadyPresent).count(),
            threads - 1
        );
        assert_eq!(cache.get("example.com", "/race").unwrap().content(), winners[0].1);
    }

    #[test]
    fn domains_are_partitioned() {
        let cache = cache();
        cache
            .put("example.com", "/", Bytes::from_static(b"com"), &HeaderMap::new())
            .unwrap();
        cache
            .put("example.org", "/", Bytes::from_static(b"org"), &HeaderMap::new())
            .unwrap();

        assert_eq!(cache.get("example.com", "/").unwrap().content(), Bytes::from_static(b"com"));
        assert_eq!(cache.get("example.org", "/").unwrap().content(), Bytes::from_static(b"org"));
        assert_eq!(cache.total_len(), 2);
    }

    #[test]
    fn domain_lookup_ignores_case() {
        let cache = cache();
        cache
            .put("Example.COM", "/", Bytes::from_static(b"x"), &HeaderMap::new())
            .unwrap();
        assert!(cache.get("example.com", "/").is_some());
    }

    #[test]
    fn configured_domain_whitespace_is_ignored() {
        let cache = ContentCache::in_memory([" Example.com "]).unwrap();
        assert!(cache.has_domain("example.com"));

        let outcome = cache
            .put("example.com", "/", Bytes::from_static(b"x"), &HeaderMap::new())
            .unwrap();
        assert!(outcome.is_inserted());
        assert!(cache.get("EXAMPLE.com", "/").is_some());
    }

    #[test]
    fn unknown_domain_is_rejected() {
        let cache = cache();
        let err = cache
            .put("unknown.example", "/", Bytes::from_static(b"x"), &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, StorageError::UnknownDomain(_)));
        assert!(cache.get("unknown.example", "/").is_none());
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = ContentCache::new(["example.com"], CacheConfig::default().with_max_entries(2)).unwrap();
        cache.put("example.com", "/a", Bytes::from_static(b"a"), &HeaderMap::new()).unwrap();
        cache.put("example.com", "/b", Bytes::from_static(b"b"), &HeaderMap::new()).unwrap();

        // Touch /a so /b becomes the eviction candidate.
        assert!(cache.get("example.com", "/a").is_some());
        cache.put("example.com", "/c", Bytes::from_static(b"c"), &HeaderMap::new()).unwrap();

        assert_eq!(cache.len("example.com"), 2);
        assert!(cache.get("example.com", "/a").is_some());
        assert!(cache.get("example.com", "/b").is_none());
        assert!(cache.get("example.com", "/c").is_some());
    }

    #[test]
    fn evicted_route_stays_valid_for_holders() {
        let cache = ContentCache::new(["example.com"], CacheConfig::default().with_max_entries(1)).unwrap();
        cache.put("example.com", "/a", Bytes::from_static(b"held"), &HeaderMap::new()).unwrap();
        let held = cache.get("example.com", "/a").unwrap();

        cache.put("example.com", "/b", Bytes::from_static(b"new"), &HeaderMap::new()).unwrap();
        assert!(cache.get("example.com", "/a").is_none());
        assert_eq!(held.content(), Bytes::from_static(b"held"));
        assert_eq!(held.content_hash(), hash_content(b"held"));
    }

    #[test]
    fn zero_max_entries_is_rejected() {
        let result = ContentCache::new(["example.com"], CacheConfig::default().with_max_entries(0));
        assert!(matches!(result, Err(StorageError::Config(_))));
    }

    #[test]
    fn asset_hash_map_is_a_snapshot() {
        let cache = cache();
        cache.put("example.com", "/a", Bytes::from_static(b"a"), &HeaderMap::new()).unwrap();
        let snapshot = cache.asset_hash_map("example.com");

        cache.put("example.com", "/b", Bytes::from_static(b"b"), &HeaderMap::new()).unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("/a").map(String::as_str), Some(hash_content(b"a").as_str()));
        assert_eq!(cache.asset_hash_map("example.com").len(), 2);
        assert!(cache.asset_hash_map("example.org").is_empty());
    }

    #[test]
    fn disk_copy_is_written_under_content_hash() {
        let temp = TempDir::new().unwrap();
        let cache = ContentCache::new(
            ["example.com"],
            CacheConfig::default().with_disk_path(temp.path()),
        )
        .unwrap();
        assert!(cache.write_to_disk());

        let body = Bytes::from_static(b"<html><head></head><body>Test Body</body></html>");
        let outcome = cache.put("example.com", "/index.html", body.clone(), &html_headers()).unwrap();
        assert_eq!(outcome, PutOutcome::Inserted(Persistence::Queued));
        cache.flush();

        let path = temp.path().join(hash_content(&body));
        assert_eq!(std::fs::read(path).unwrap(), body.as_ref());
        assert_eq!(cache.persist_stats().unwrap().written(), 1);
    }

    #[test]
    fn full_write_queue_keeps_memory_entry() {
        let temp = TempDir::new().unwrap();
        let cache = ContentCache::new(
            ["example.com"],
            CacheConfig::default()
                .with_disk_path(temp.path())
                .with_write_queue_depth(1),
        )
        .unwrap();
        let release = cache.persist.as_ref().unwrap().stall();

        let first = cache.put("example.com", "/a", Bytes::from_static(b"alpha"), &HeaderMap::new()).unwrap();
        assert_eq!(first, PutOutcome::Inserted(Persistence::Queued));
        let second = cache.put("example.com", "/b", Bytes::from_static(b"beta"), &HeaderMap::new()).unwrap();
        assert_eq!(second, PutOutcome::Inserted(Persistence::Dropped));
        assert_eq!(cache.persist_stats().unwrap().dropped(), 1);

        drop(release);
        cache.flush();
        assert_eq!(cache.get("example.com", "/b").unwrap().content(), Bytes::from_static(b"beta"));
        assert!(!temp.path().join(hash_content(b"beta")).exists());
    }

    #[test]
    fn failed_disk_write_keeps_memory_entry() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        let cache = ContentCache::new(["example.com"], CacheConfig::default().with_disk_path(&root)).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        let outcome = cache.put("example.com", "/", Bytes::from_static(b"kept"), &HeaderMap::new()).unwrap();
        assert!(outcome.is_inserted());
        cache.flush();

        assert_eq!(cache.persist_stats().unwrap().failed(), 1);
        assert_eq!(cache.get("example.com", "/").unwrap().content(), Bytes::from_static(b"kept"));
    }
}
