//! Edge node network state.
//!
//! The peer gateway publishes the nodes currently serving content. The
//! masternode polls it and exposes the list through the direct-introspection
//! response so clients can fetch assets from edge nodes.
//!
//! ```text
//! GatewayPoller ──GET /api/p2p/state──▶ gateway
//!       │
//!       ▼ apply_gateway_state()
//! NetworkState ──edge_nodes()──▶ DirectHandler
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;

use crate::config::PeerNetworkConfig;
use crate::error::{ProxyError, Result};

/// Gateway endpoint returning the peer network state.
pub const GATEWAY_STATE_PATH: &str = "/api/p2p/state";

/// Shared list of edge node addresses (`ip:port`).
#[derive(Clone, Default)]
pub struct NetworkState {
    edge_nodes: Arc<RwLock<Vec<String>>>,
}

impl std::fmt::Debug for NetworkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkState")
            .field("edge_nodes", &self.edge_nodes.read().len())
            .finish()
    }
}

impl NetworkState {
    /// Creates an empty network state.
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of the current edge node list.
    pub fn edge_nodes(&self) -> Vec<String> {
        self.edge_nodes.read().clone()
    }

    /// Replaces the edge node list.
    pub fn replace(&self, nodes: Vec<String>) {
        *self.edge_nodes.write() = nodes;
    }

    /// Replaces the edge node list from a gateway state document.
    ///
    /// Nodes without a string `ip_address` or `content_port` are skipped.
    /// Returns the number of nodes accepted.
    pub fn apply_gateway_state(&self, body: &str) -> Result<usize> {
        let parsed: Value = serde_json::from_str(body)?;
        let node_map = parsed
            .pointer("/response/node_data_map")
            .and_then(Value::as_object)
            .ok_or_else(|| ProxyError::Gateway("state has no response.node_data_map".into()))?;

        let mut nodes = Vec::with_capacity(node_map.len());
        for (id, node) in node_map {
            let ip = node.pointer("/ip_address/data").and_then(Value::as_str);
            let port = node.pointer("/content_port/data").and_then(Value::as_str);
            match (ip, port) {
                (Some(ip), Some(port)) => nodes.push(format!("{}:{}", ip, port)),
                _ => tracing::error!("Skipping malformed node {} in network state", id),
            }
        }

        let count = nodes.len();
        self.replace(nodes);
        Ok(count)
    }
}

/// Periodically refreshes a [`NetworkState`] from the peer gateway.
#[derive(Debug, Clone)]
pub struct GatewayPoller {
    state: NetworkState,
    client: reqwest::Client,
    url: String,
    poll_interval: Duration,
}

impl GatewayPoller {
    /// Creates a poller for the gateway described by `config`.
    pub fn new(state: NetworkState, config: &PeerNetworkConfig) -> Result<Self> {
        let poll_interval = config.poll_interval();
        let client = reqwest::Client::builder().timeout(poll_interval).build()?;

        Ok(Self {
            state,
            client,
            url: format!(
                "http://{}:{}{}",
                config.gateway_host, config.gateway_port, GATEWAY_STATE_PATH
            ),
            poll_interval,
        })
    }

    /// URL polled for state.
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Fetches the gateway state once and applies it.
    pub async fn poll_once(&self) -> Result<usize> {
        tracing::debug!("Fetching network state from {}", self.url);
        let response = self.client.get(&self.url).send().await?;
        if !response.status().is_success() {
            return Err(ProxyError::Gateway(format!(
                "gateway returned {}",
                response.status()
            )));
        }

        let body = response.text().await?;
        let count = self.state.apply_gateway_state(&body)?;
        tracing::info!("Received network state from gateway: {} edge nodes", count);
        Ok(count)
    }

    /// Creates a background polling task.
    ///
    /// Returns a future that should be spawned as a background task.
    pub fn start_polling(self) -> impl std::future::Future<Output = ()> + Send {
        async move {
            tracing::info!(
                "Polling peer gateway {} every {:?}",
                self.url,
                self.poll_interval
            );
            let mut ticker = tokio::time::interval(self.poll_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = self.poll_once().await {
                    tracing::warn!("Failed to poll network state: {}", e);
                }
            }
        }
    }
}
