//! Masternode configuration.
//!
//! Configuration is a JSON document. Every field has a default, so a file only
//! needs the protected domains:
//!
//! ```json
//! {
//!   "server": { "port": 8080 },
//!   "cache": { "disk_path": "/var/cache/masternode" },
//!   "protected_domains": [
//!     { "domain": "example.com", "origin_host": "10.0.0.2", "origin_port": 80 }
//!   ]
//! }
//! ```

use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use masternode_storage::{normalize_domain, CacheConfig};

use crate::error::{ProxyError, Result};

/// Default route of the service worker payload.
pub const DEFAULT_SERVICE_WORKER_ROUTE: &str = "/masternode-service-worker.js";

/// A domain served by the masternode and the origin behind it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedDomain {
    /// Host name clients use, e.g. `example.com`.
    pub domain: String,
    /// IP or hostname of the origin server.
    pub origin_host: String,
    /// Port of the origin server.
    #[serde(default = "default_origin_port")]
    pub origin_port: u16,
}

impl ProtectedDomain {
    /// Creates a protected domain entry.
    pub fn new(domain: impl Into<String>, origin_host: impl Into<String>, origin_port: u16) -> Self {
        Self {
            domain: domain.into(),
            origin_host: origin_host.into(),
            origin_port,
        }
    }
}

/// Listener and request handling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP address to bind.
    pub ip: IpAddr,
    /// Port to bind.
    pub port: u16,
    /// Worker threads (0 = one per CPU).
    pub threads: usize,
    /// Idle timeout for client connections, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Origin connect timeout, in milliseconds.
    pub connect_timeout_ms: u64,
    /// Redirect plain HTTP requests to HTTPS.
    pub upgrade_insecure: bool,
    /// Port HTTPS clients are redirected to.
    pub secure_port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 80,
            threads: 0,
            idle_timeout_ms: 20_000,
            connect_timeout_ms: 5_000,
            upgrade_insecure: false,
            secure_port: 443,
        }
    }
}

impl ServerConfig {
    /// Socket address to bind.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// Idle timeout as a duration.
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Origin connect timeout as a duration.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Content cache settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    /// Maximum cached routes per domain.
    pub max_entries: usize,
    /// Directory for content-addressed copies (empty = memory only).
    pub disk_path: String,
    /// Pending disk writes before writes are dropped.
    pub write_queue_depth: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            max_entries: masternode_storage::DEFAULT_MAX_ENTRIES,
            disk_path: String::new(),
            write_queue_depth: masternode_storage::DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl CacheSettings {
    /// Converts to the storage crate's configuration.
    pub fn to_cache_config(&self) -> CacheConfig {
        let config = CacheConfig::default()
            .with_max_entries(self.max_entries)
            .with_write_queue_depth(self.write_queue_depth);

        if self.disk_path.is_empty() {
            config
        } else {
            config.with_disk_path(&self.disk_path)
        }
    }
}

/// Service worker injection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceWorkerConfig {
    /// Enable payload serving and script injection.
    pub enabled: bool,
    /// Path of the JavaScript payload on disk.
    pub path: PathBuf,
    /// Request path the payload is served at.
    pub route: String,
}

impl Default for ServiceWorkerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: PathBuf::new(),
            route: DEFAULT_SERVICE_WORKER_ROUTE.to_string(),
        }
    }
}

/// Peer network gateway settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerNetworkConfig {
    /// Poll the gateway for edge nodes.
    pub enabled: bool,
    /// Gateway host.
    pub gateway_host: String,
    /// Gateway port.
    pub gateway_port: u16,
    /// Seconds between polls.
    pub poll_interval_secs: u64,
}

impl Default for PeerNetworkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            gateway_host: "127.0.0.1".to_string(),
            gateway_port: 3001,
            poll_interval_secs: 5,
        }
    }
}

impl PeerNetworkConfig {
    /// Poll interval as a duration (at least one second).
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// Complete masternode configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MasternodeConfig {
    /// Listener settings.
    pub server: ServerConfig,
    /// Cache settings.
    pub cache: CacheSettings,
    /// Domains served and their origins.
    pub protected_domains: Vec<ProtectedDomain>,
    /// Service worker feature.
    pub service_worker: ServiceWorkerConfig,
    /// Peer network feature.
    pub peer_network: PeerNetworkConfig,
}

impl MasternodeConfig {
    /// Creates a configuration protecting a single domain.
    pub fn new(domain: ProtectedDomain) -> Self {
        Self {
            protected_domains: vec![domain],
            ..Self::default()
        }
    }

    /// Reads and validates a JSON configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&raw)
    }

    /// Parses and validates a JSON configuration document.
    pub fn from_json(raw: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the configuration for values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.protected_domains.is_empty() {
            return Err(ProxyError::Config("at least one protected domain is required".into()));
        }

        let mut seen = HashSet::new();
        for entry in &self.protected_domains {
            let domain = normalize_domain(&entry.domain);
            if domain.is_empty() {
                return Err(ProxyError::Config("protected domain name is empty".into()));
            }
            if entry.origin_host.trim().is_empty() {
                return Err(ProxyError::Config(format!("origin host for {} is empty", domain)));
            }
            if !seen.insert(domain.clone()) {
                return Err(ProxyError::Config(format!("duplicate protected domain {}", domain)));
            }
        }

        if self.cache.max_entries == 0 {
            return Err(ProxyError::Config("cache.max_entries must be at least 1".into()));
        }

        if self.service_worker.enabled {
            if self.service_worker.path.as_os_str().is_empty() {
                return Err(ProxyError::Config(
                    "service_worker.path is required when the service worker is enabled".into(),
                ));
            }
            if !self.service_worker.route.starts_with('/') {
                return Err(ProxyError::Config("service_worker.route must start with '/'".into()));
            }
        }

        Ok(())
    }

    /// Sets the listen port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.server.port = port;
        self
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.server.ip = addr.ip();
        self.server.port = addr.port();
        self
    }

    /// Adds a protected domain.
    pub fn with_domain(mut self, domain: ProtectedDomain) -> Self {
        self.protected_domains.push(domain);
        self
    }

    /// Enables HTTPS redirects to `secure_port`.
    pub fn with_secure_upgrade(mut self, secure_port: u16) -> Self {
        self.server.upgrade_insecure = true;
        self.server.secure_port = secure_port;
        self
    }

    /// Enables disk persistence under `path`.
    pub fn with_cache_dir(mut self, path: impl AsRef<Path>) -> Self {
        self.cache.disk_path = path.as_ref().to_string_lossy().into_owned();
        self
    }

    /// Enables the service worker with the payload at `path`.
    pub fn with_service_worker(mut self, path: impl Into<PathBuf>) -> Self {
        self.service_worker.enabled = true;
        self.service_worker.path = path.into();
        self
    }

    /// Sets the origin connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.server.connect_timeout_ms = timeout.as_millis() as u64;
        self
    }
}

fn default_origin_port() -> u16 {
    80
}
