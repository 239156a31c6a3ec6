//! Per-request dispatch.
//!
//! The router validates the requested domain and picks one [`Handler`]:
//!
//! 1. secure upgrade enabled and the connection is plain → redirect (307)
//! 2. direct header present → cache/network metadata
//! 3. service worker route → the service worker payload
//! 4. anything else → proxy session
//!
//! Unknown or missing domains are rejected with 400 before any of these.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use hyper::body::Body;
use hyper::header::HOST;
use hyper::{Request, Response, StatusCode};

use masternode_storage::ContentCache;

use crate::body::SessionBody;
use crate::config::MasternodeConfig;
use crate::domains::{resolve_domain, strip_port, DomainTable};
use crate::error::Result;
use crate::handler::{DirectInfo, Handler};
use crate::network::NetworkState;
use crate::service_worker::{ContentTransform, ServiceWorker, PAYLOAD_CONTENT_TYPE};
use crate::session::ProxySession;
use crate::DIRECT_HEADER;

/// Facts about the client connection a request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Client address.
    pub remote_addr: SocketAddr,
    /// Whether the connection is TLS.
    pub secure: bool,
}

impl ConnectionInfo {
    /// A plain-text connection from `remote_addr`.
    pub fn plain(remote_addr: SocketAddr) -> Self {
        Self {
            remote_addr,
            secure: false,
        }
    }
}

/// Chooses and runs the handler for each request.
#[derive(Clone)]
pub struct Router {
    domains: DomainTable,
    cache: Arc<ContentCache>,
    service_worker: Option<Arc<ServiceWorker>>,
    network: Option<NetworkState>,
    upgrade_insecure: bool,
    secure_port: u16,
    connect_timeout: Duration,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("domains", &self.domains.len())
            .field("service_worker", &self.service_worker.as_ref().map(|sw| sw.route()))
            .field("network", &self.network.is_some())
            .field("upgrade_insecure", &self.upgrade_insecure)
            .field("secure_port", &self.secure_port)
            .finish()
    }
}

impl Router {
    /// Creates a router for `config`, serving cached content from `cache`.
    ///
    /// The service worker and network state are attached separately.
    pub fn new(config: &MasternodeConfig, cache: Arc<ContentCache>) -> Self {
        Self {
            domains: DomainTable::new(&config.protected_domains),
            cache,
            service_worker: None,
            network: None,
            upgrade_insecure: config.server.upgrade_insecure,
            secure_port: config.server.secure_port,
            connect_timeout: config.server.connect_timeout(),
        }
    }

    /// Creates a router and loads the service worker named by `config`.
    ///
    /// A payload that cannot be read disables the feature.
    pub fn from_config(config: &MasternodeConfig, cache: Arc<ContentCache>) -> Self {
        let router = Self::new(config, cache);
        let sw = &config.service_worker;
        if !sw.enabled {
            return router;
        }

        match ServiceWorker::from_file(&sw.path, sw.route.clone()) {
            Ok(worker) => router.with_service_worker(worker),
            Err(e) => {
                tracing::error!(
                    "Could not read service worker {:?}, injection disabled: {}",
                    sw.path,
                    e
                );
                router
            }
        }
    }

    /// Enables the service worker route and HTML injection.
    pub fn with_service_worker(mut self, worker: ServiceWorker) -> Self {
        self.service_worker = Some(Arc::new(worker));
        self
    }

    /// Includes edge nodes from `state` in direct responses.
    pub fn with_network_state(mut self, state: NetworkState) -> Self {
        self.network = Some(state);
        self
    }

    /// The shared content cache.
    pub fn cache(&self) -> &Arc<ContentCache> {
        &self.cache
    }

    /// The protected domains.
    pub fn domains(&self) -> &DomainTable {
        &self.domains
    }

    /// Picks the handler for `req`. Never fails: problems become [`Handler::Reject`].
    pub fn dispatch<B>(&self, req: &Request<B>, conn: &ConnectionInfo) -> Handler {
        tracing::info!(
            "{} [{}] {} {}",
            conn.remote_addr,
            chrono::Utc::now().to_rfc3339(),
            req.method(),
            req.uri()
        );

        let domain = match resolve_domain(req.uri(), req.headers()) {
            Some(domain) if self.domains.contains(&domain) => domain,
            Some(domain) => {
                tracing::debug!("Rejecting request for unprotected domain {}", domain);
                return Handler::reject(StatusCode::BAD_REQUEST, "Bad Request: unknown domain");
            }
            None => {
                return Handler::reject(StatusCode::BAD_REQUEST, "Bad Request: missing host");
            }
        };

        let path = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");

        if self.upgrade_insecure && !conn.secure {
            let host = req
                .headers()
                .get(HOST)
                .and_then(|value| value.to_str().ok())
                .map(strip_port)
                .filter(|host| !host.is_empty())
                .unwrap_or(domain.as_str());
            let host = if host.contains(':') {
                format!("[{}]", host)
            } else {
                host.to_string()
            };
            return Handler::Redirect {
                location: format!("https://{}:{}{}", host, self.secure_port, path),
            };
        }

        if req.headers().contains_key(DIRECT_HEADER) {
            return Handler::Direct(DirectInfo {
                asset_hashes: self.cache.asset_hash_map(&domain),
                edge_nodes: self.network.as_ref().map(NetworkState::edge_nodes),
            });
        }

        if let Some(worker) = &self.service_worker {
            if req.uri().path() == worker.route() {
                return Handler::StaticPayload {
                    payload: worker.payload(),
                    content_type: PAYLOAD_CONTENT_TYPE,
                };
            }
        }

        let transform = self
            .service_worker
            .clone()
            .map(|worker| worker as Arc<dyn ContentTransform>);
        let origin = self.domains.origin(&domain).cloned();
        Handler::Proxy(Box::new(ProxySession::new(
            domain,
            origin,
            self.cache.clone(),
            transform,
        )))
    }

    /// Dispatches and answers `req`.
    pub async fn handle<B>(&self, req: Request<B>, conn: ConnectionInfo) -> Result<Response<SessionBody>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        let handler = self.dispatch(&req, &conn);
        tracing::debug!("Dispatched {} to {} handler", req.uri(), handler.kind());
        handler.respond(req, self.connect_timeout).await
    }
}
