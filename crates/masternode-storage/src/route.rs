//! Immutable cached responses.

use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, CACHE_CONTROL, CONTENT_TYPE, ETAG, EXPIRES, LAST_MODIFIED};
use sha2::{Digest, Sha256};

/// Response headers replayed to clients when serving from cache.
pub const REPLAYED_HEADERS: [HeaderName; 5] =
    [CONTENT_TYPE, CACHE_CONTROL, ETAG, EXPIRES, LAST_MODIFIED];

/// Hash content using SHA-256, returned as lowercase hex.
pub fn hash_content(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// A cached origin response for one `(domain, path)` key.
///
/// Never mutated after construction. [`CachedRoute::content`] hands out
/// reference-counted views of the same buffer, so readers share the bytes
/// without copying and can never observe a change.
#[derive(Debug)]
pub struct CachedRoute {
    domain: String,
    path: String,
    content: Bytes,
    content_hash: String,
    headers: HeaderMap,
}

impl CachedRoute {
    /// Creates a route, keeping only the [`REPLAYED_HEADERS`] from `headers`.
    pub fn new(
        domain: impl Into<String>,
        path: impl Into<String>,
        content: Bytes,
        headers: &HeaderMap,
    ) -> Self {
        let mut selected = HeaderMap::new();
        for name in REPLAYED_HEADERS.iter() {
            for value in headers.get_all(name) {
                selected.append(name.clone(), value.clone());
            }
        }

        let content_hash = hash_content(&content);

        Self {
            domain: domain.into(),
            path: path.into(),
            content,
            content_hash,
            headers: selected,
        }
    }

    /// The protected domain this entry belongs to.
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Request path and query.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// A shared view of the cached body.
    pub fn content(&self) -> Bytes {
        self.content.clone()
    }

    /// Lowercase hex SHA-256 of the body.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// The replayed header subset.
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The cached `Content-Type`, if the origin sent a valid one.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
    }

    /// Body length in bytes.
    pub fn len(&self) -> usize {
        self.content.len()
    }

    /// Returns true if the body is empty.
    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }
}
