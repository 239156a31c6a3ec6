//! Masternode Proxy - caching reverse proxy for protected domains.
//!
//! The masternode sits in front of one or more origin servers. Every request
//! is matched against the configured protected domains and then either
//! answered locally or relayed to the domain's origin:
//!
//! ```text
//! Client Request → Router → Known domain? ── No ──→ 400
//!                              │ Yes
//!                              ▼
//!          ┌──────────┬────────┴─────────┬──────────────┐
//!          ▼          ▼                  ▼              ▼
//!      Redirect    Direct           Service worker   Proxy session
//!      (307)       (JSON)           payload              │
//!                                                        ▼
//!                                          Cache hit → replay (+ inject)
//!                                          Cache miss → origin → cache
//! ```
//!
//! Proxy sessions are a sans-IO state machine ([`ProxySession`]) driven by a
//! per-request task ([`SessionDriver`]). Successful GET responses land in the
//! shared [`ContentCache`](masternode_storage::ContentCache) and are replayed
//! to later clients with the service worker registration script injected.
//!
//! # Example
//!
//! ```no_run
//! use masternode_proxy::{MasternodeConfig, ProtectedDomain, ProxyServer};
//!
//! # async fn run() -> masternode_proxy::Result<()> {
//! let config = MasternodeConfig::new(ProtectedDomain::new("example.com", "10.0.0.5", 8080))
//!     .with_port(8080);
//! let handle = ProxyServer::new(&config)?.start()?;
//! println!("listening on {}", handle.addr());
//! handle.stop().await;
//! # Ok(())
//! # }
//! ```

mod body;
pub mod config;
mod domains;
mod driver;
mod error;
mod handler;
pub mod network;
mod proxy;
mod router;
mod service_worker;
pub mod session;

/// Request header asking for cache and network metadata instead of content.
pub const DIRECT_HEADER: &str = "x-masternode-direct";

pub use body::{BodySender, Delivery, SessionBody};
pub use config::{
    CacheSettings, MasternodeConfig, PeerNetworkConfig, ProtectedDomain, ServerConfig,
    ServiceWorkerConfig, DEFAULT_SERVICE_WORKER_ROUTE,
};
pub use domains::{resolve_domain, strip_port, DomainTable, OriginAddr};
pub use driver::{connect_origin, OriginConnection, SessionDriver};
pub use error::{ProxyError, Result};
pub use handler::{DirectInfo, Handler};
pub use network::{GatewayPoller, NetworkState, GATEWAY_STATE_PATH};
pub use proxy::{ProxyHandle, ProxyServer};
pub use router::{ConnectionInfo, Router};
pub use service_worker::{is_html, ContentTransform, ServiceWorker, PAYLOAD_CONTENT_TYPE};
pub use session::{Action, ProxySession, RequestHead, ResponseHead, SessionState};
