//! Protected domain lookup.
//!
//! Maps the host a client asked for to the origin serving it. Lookups are
//! case-insensitive and ignore any port suffix.

use std::collections::HashMap;
use std::fmt;

use hyper::header::HOST;
use hyper::{HeaderMap, Uri};

use masternode_storage::normalize_domain;

use crate::config::ProtectedDomain;

/// Address of an origin server.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OriginAddr {
    /// IP or hostname.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl OriginAddr {
    /// Creates an origin address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// `host:port` form suitable for `TcpStream::connect` and `Host` headers.
    pub fn authority(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for OriginAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.authority())
    }
}

/// Table of protected domains and their origins.
#[derive(Debug, Clone, Default)]
pub struct DomainTable {
    origins: HashMap<String, OriginAddr>,
}

impl DomainTable {
    /// Builds the table from configuration entries.
    pub fn new(domains: &[ProtectedDomain]) -> Self {
        let origins = domains
            .iter()
            .map(|entry| {
                (
                    normalize_domain(&entry.domain),
                    OriginAddr::new(entry.origin_host.trim(), entry.origin_port),
                )
            })
            .collect();

        Self { origins }
    }

    /// Returns true if `domain` is protected.
    pub fn contains(&self, domain: &str) -> bool {
        self.origins.contains_key(&normalize_domain(domain))
    }

    /// Origin serving `domain`.
    pub fn origin(&self, domain: &str) -> Option<&OriginAddr> {
        self.origins.get(&normalize_domain(domain))
    }

    /// Protected domain names, lowercased.
    pub fn domains(&self) -> impl Iterator<Item = &str> {
        self.origins.keys().map(String::as_str)
    }

    /// Number of protected domains.
    pub fn len(&self) -> usize {
        self.origins.len()
    }

    /// Returns true if no domain is protected.
    pub fn is_empty(&self) -> bool {
        self.origins.is_empty()
    }
}

/// Strips a port suffix from a host, handling bracketed IPv6 literals.
pub fn strip_port(host: &str) -> &str {
    let host = host.trim();
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => rest,
        };
    }

    match host.rsplit_once(':') {
        // A bare IPv6 literal has several colons and no port.
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Determines the requested domain, lowercased and without a port.
///
/// The absolute request URL wins over the `Host` header. Returns `None` when
/// neither carries a non-empty host.
pub fn resolve_domain(uri: &Uri, headers: &HeaderMap) -> Option<String> {
    let host = match uri.host() {
        Some(host) => host,
        None => headers.get(HOST).and_then(|value| value.to_str().ok())?,
    };

    let domain = strip_port(host).trim_end_matches('.').to_ascii_lowercase();
    if domain.is_empty() {
        None
    } else {
        Some(domain)
    }
}
