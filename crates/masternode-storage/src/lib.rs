//! Masternode Storage - content cache and disk persistence.
//!
//! This crate holds the responses the masternode serves on behalf of its
//! origins:
//!
//! - [`CachedRoute`]: an immutable response body plus replayed headers, hashed
//!   with SHA-256 at construction
//! - [`ContentCache`]: one bounded, least-recently-used map per protected
//!   domain with insert-if-absent semantics
//! - [`DiskStore`]: content-addressed files named by the body hash
//! - [`PersistQueue`]: bounded background writer so disk IO never runs on the
//!   request path
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::HeaderMap;
//! use masternode_storage::{CacheConfig, ContentCache};
//!
//! let cache = ContentCache::new(
//!     ["example.com"],
//!     CacheConfig::default().with_disk_path("/var/cache/masternode"),
//! )
//! .unwrap();
//!
//! cache
//!     .put("example.com", "/index.html", Bytes::from_static(b"<html></html>"), &HeaderMap::new())
//!     .unwrap();
//! let route = cache.get("example.com", "/index.html").unwrap();
//! println!("{} -> {}", route.path(), route.content_hash());
//! ```

mod cache;
mod disk;
pub mod error;
mod persist;
mod route;

pub use cache::{normalize_domain, CacheConfig, ContentCache, PutOutcome, DEFAULT_MAX_ENTRIES};
pub use disk::DiskStore;
pub use error::{Result, StorageError};
pub use persist::{PersistQueue, PersistStats, Persistence, DEFAULT_QUEUE_DEPTH};
pub use route::{hash_content, CachedRoute, REPLAYED_HEADERS};
