//! Service worker payload and HTML script injection.

use std::path::Path;

use bytes::{Bytes, BytesMut};

use crate::error::Result;

/// Content type the payload is served with.
pub const PAYLOAD_CONTENT_TYPE: &str = "application/javascript";

/// Rewrites cached content before it is served.
///
/// An empty return value means "no change": callers serve the original bytes.
pub trait ContentTransform: Send + Sync {
    /// Returns transformed content, or empty bytes to keep `content` as is.
    fn inject(&self, content: &[u8], content_type: &str) -> Bytes;
}

/// Service worker served by the masternode and registered by cached pages.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    payload: Bytes,
    route: String,
    script: Bytes,
}

impl ServiceWorker {
    /// Creates a service worker from an in-memory payload served at `route`.
    pub fn new(payload: impl Into<Bytes>, route: impl Into<String>) -> Self {
        let route = route.into();
        let script = Bytes::from(registration_script(&route));

        Self {
            payload: payload.into(),
            route,
            script,
        }
    }

    /// Loads the payload from disk.
    pub fn from_file(path: impl AsRef<Path>, route: impl Into<String>) -> Result<Self> {
        let payload = std::fs::read(path.as_ref())?;
        tracing::info!(
            "Loaded service worker from {:?} ({} bytes)",
            path.as_ref(),
            payload.len()
        );
        Ok(Self::new(payload, route))
    }

    /// The JavaScript payload.
    pub fn payload(&self) -> Bytes {
        self.payload.clone()
    }

    /// Request path the payload is served at.
    pub fn route(&self) -> &str {
        &self.route
    }
}

impl ContentTransform for ServiceWorker {
    fn inject(&self, content: &[u8], content_type: &str) -> Bytes {
        if !is_html(content_type) {
            return Bytes::new();
        }

        let Some(at) = head_insert_position(content) else {
            return Bytes::new();
        };

        let mut out = BytesMut::with_capacity(content.len() + self.script.len());
        out.extend_from_slice(&content[..at]);
        out.extend_from_slice(&self.script);
        out.extend_from_slice(&content[at..]);
        out.freeze()
    }
}

/// Returns true if a `Content-Type` value denotes HTML.
pub fn is_html(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(|mime| mime.trim().eq_ignore_ascii_case("text/html"))
        .unwrap_or(false)
}

fn registration_script(route: &str) -> String {
    format!(
        "<script>if ('serviceWorker' in navigator) {{ \
         navigator.serviceWorker.register('{}'); }}</script>",
        route.replace('\'', "\\'")
    )
}

/// Byte offset just past the opening `<head>` tag, if the document has one.
fn head_insert_position(content: &[u8]) -> Option<usize> {
    const TAG: &[u8] = b"<head";

    let mut from = 0;
    while let Some(offset) = find_ignore_case(&content[from..], TAG) {
        let start = from + offset;
        let after = start + TAG.len();
        match content.get(after) {
            // `<head>` or `<head attr=...>`, not `<header>`.
            Some(b'>') => return Some(after + 1),
            Some(c) if c.is_ascii_whitespace() => {
                let close = content[after..].iter().position(|&b| b == b'>')?;
                return Some(after + close + 1);
            }
            Some(_) => from = after,
            None => return None,
        }
    }
    None
}

fn find_ignore_case(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window.eq_ignore_ascii_case(needle))
}
