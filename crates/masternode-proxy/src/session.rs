//! Per-request proxy state machine.
//!
//! [`ProxySession`] decides what happens to one proxied request. It performs
//! no IO: the driver feeds it client and origin events and carries out the
//! [`Action`]s it returns.
//!
//! ```text
//! New ─▶ CacheCheck ─┬─▶ CacheHitRespond ─────────────────────────────┐
//!                    └─▶ Connecting ─▶ Connected ─▶ Streaming ─┬─▶ OriginComplete
//!                                                              ├─▶ OriginError
//!                                                              └─▶ ClientAborted
//!                                                                      │
//!                                              Terminal ◀──────────────┘
//! ```
//!
//! The session is released once the client side has terminated and no origin
//! transaction is attached. Every event that changes either condition checks
//! the pair, so [`Action::Release`] is emitted exactly once.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use hyper::header::{
    HeaderName, HeaderValue, ACCEPT_ENCODING, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, ETAG, HOST,
    LAST_MODIFIED, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use hyper::{HeaderMap, Method, StatusCode, Uri, Version};

use masternode_storage::{ContentCache, PutOutcome};

use crate::domains::OriginAddr;
use crate::error::ProxyError;
use crate::service_worker::{is_html, ContentTransform};
use crate::DIRECT_HEADER;

/// Request line and headers of a proxied request.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request target as received.
    pub uri: Uri,
    /// HTTP version.
    pub version: Version,
    /// Request headers.
    pub headers: HeaderMap,
}

impl RequestHead {
    /// Path and query, the cache key within a domain.
    pub fn path(&self) -> &str {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/")
    }
}

/// Status and headers of a response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Response status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
}

impl ResponseHead {
    /// Creates a head with no headers.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
        }
    }
}

/// Session states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    CacheCheck,
    CacheHitRespond,
    Connecting,
    Connected,
    Streaming,
    OriginComplete,
    OriginError,
    ClientAborted,
    Terminal,
}

/// Work the driver performs on behalf of the session.
#[derive(Debug)]
pub enum Action {
    /// Send a complete response to the client.
    Respond(ResponseHead, Bytes),
    /// Start a streamed response to the client.
    SendHeaders(ResponseHead),
    /// Send a chunk of a streamed response.
    SendBody(Bytes),
    /// Finish a streamed response.
    SendEom,
    /// Open a connection to the origin.
    Connect(OriginAddr),
    /// Send the request head on the origin connection.
    SendOriginRequest(RequestHead),
    /// Forward a client body chunk to the origin.
    ForwardBody(Bytes),
    /// Finish the request body sent to the origin.
    ForwardEom,
    /// Stop reading the client request body.
    PauseIngress,
    /// Resume reading the client request body.
    ResumeIngress,
    /// Abort the origin transaction.
    AbortOrigin,
    /// Abort the client response without writing anything further.
    AbortClient,
    /// Free the session. Emitted exactly once.
    Release,
}

#[derive(Debug, Default)]
struct Lifecycle {
    client_terminated: bool,
    origin_attached: bool,
    released: bool,
}

impl Lifecycle {
    fn try_release(&mut self) -> bool {
        if !self.released && self.client_terminated && !self.origin_attached {
            self.released = true;
            return true;
        }
        false
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientResponse {
    None,
    Streaming,
    Sent,
}

/// Duplex proxy state machine for one request.
pub struct ProxySession {
    domain: String,
    origin: Option<OriginAddr>,
    cache: Arc<ContentCache>,
    transform: Option<Arc<dyn ContentTransform>>,
    state: SessionState,
    lifecycle: Lifecycle,
    method: Method,
    path: String,
    request: Option<RequestHead>,
    response_head: Option<ResponseHead>,
    response_body: Option<BytesMut>,
    pending_body: Vec<Bytes>,
    pending_eom: bool,
    origin_done: bool,
    response: ClientResponse,
}

impl std::fmt::Debug for ProxySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxySession")
            .field("domain", &self.domain)
            .field("method", &self.method)
            .field("path", &self.path)
            .field("state", &self.state)
            .field("lifecycle", &self.lifecycle)
            .finish()
    }
}

impl ProxySession {
    /// Creates a session for `domain`, served by `origin` when known.
    pub fn new(
        domain: impl Into<String>,
        origin: Option<OriginAddr>,
        cache: Arc<ContentCache>,
        transform: Option<Arc<dyn ContentTransform>>,
    ) -> Self {
        Self {
            domain: domain.into(),
            origin,
            cache,
            transform,
            state: SessionState::New,
            lifecycle: Lifecycle::default(),
            method: Method::GET,
            path: String::from("/"),
            request: None,
            response_head: None,
            response_body: None,
            pending_body: Vec::new(),
            pending_eom: false,
            origin_done: false,
            response: ClientResponse::None,
        }
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Returns true once [`Action::Release`] has been emitted.
    pub fn is_released(&self) -> bool {
        self.lifecycle.released
    }

    /// Returns true while an origin transaction is attached.
    pub fn origin_attached(&self) -> bool {
        self.lifecycle.origin_attached
    }

    /// Returns true once the client side has terminated.
    pub fn client_terminated(&self) -> bool {
        self.lifecycle.client_terminated
    }

    /// The request headers arrived.
    pub fn on_request(&mut self, mut head: RequestHead) -> Vec<Action> {
        if self.lifecycle.released || self.state != SessionState::New {
            return Vec::new();
        }

        self.method = head.method.clone();
        self.path = head.path().to_string();

        if self.method == Method::GET {
            self.state = SessionState::CacheCheck;
            if let Some(actions) = self.serve_from_cache() {
                return actions;
            }
        }

        strip_request_headers(&mut head.headers);
        if !head.headers.contains_key(HOST) {
            if let Ok(host) = HeaderValue::from_str(&self.domain) {
                head.headers.insert(HOST, host);
            }
        }
        self.request = Some(head);

        let Some(origin) = self.origin.clone() else {
            tracing::warn!("No origin configured for {}", self.domain);
            return self.fail_before_response(StatusCode::BAD_GATEWAY);
        };

        self.state = SessionState::Connecting;
        vec![Action::PauseIngress, Action::Connect(origin)]
    }

    fn serve_from_cache(&mut self) -> Option<Vec<Action>> {
        let route = self.cache.get(&self.domain, &self.path)?;

        self.state = SessionState::CacheHitRespond;
        let mut body = route.content();
        let mut headers = route.headers().clone();
        if let (Some(transform), Some(content_type)) = (&self.transform, route.content_type()) {
            if is_html(content_type) {
                let injected = transform.inject(&body, content_type);
                if !injected.is_empty() {
                    body = injected;
                    // The origin's validators describe the unmodified body.
                    headers.remove(ETAG);
                    headers.remove(LAST_MODIFIED);
                }
            }
        }

        tracing::debug!("Serving {}{} from cache", self.domain, self.path);
        let head = ResponseHead {
            status: StatusCode::OK,
            headers,
        };
        self.response = ClientResponse::Sent;
        Some(vec![Action::Respond(head, body)])
    }

    /// The origin connection is established.
    pub fn on_connect_success(&mut self) -> Vec<Action> {
        if self.lifecycle.released || self.state != SessionState::Connecting {
            return Vec::new();
        }

        let Some(request) = self.request.take() else {
            return Vec::new();
        };

        self.lifecycle.origin_attached = true;
        self.state = SessionState::Connected;

        let mut actions = vec![Action::SendOriginRequest(request)];
        actions.extend(self.pending_body.drain(..).map(Action::ForwardBody));
        if self.pending_eom {
            actions.push(Action::ForwardEom);
        }
        actions.push(Action::ResumeIngress);
        actions
    }

    /// The origin connection could not be established.
    pub fn on_connect_error(&mut self, err: &ProxyError) -> Vec<Action> {
        if self.lifecycle.released || self.state != SessionState::Connecting {
            return Vec::new();
        }

        tracing::warn!("Origin connect for {}{} failed: {}", self.domain, self.path, err);
        self.state = SessionState::OriginError;
        self.pending_body.clear();

        if self.lifecycle.client_terminated {
            return self.abort_client();
        }
        self.fail_before_response(err.gateway_status())
    }

    /// A chunk of the client request body arrived.
    pub fn on_client_body(&mut self, chunk: Bytes) -> Vec<Action> {
        if self.lifecycle.released || self.lifecycle.client_terminated {
            return Vec::new();
        }

        match self.state {
            SessionState::Connecting => {
                self.pending_body.push(chunk);
                Vec::new()
            }
            _ if self.origin_open() => vec![Action::ForwardBody(chunk)],
            _ => Vec::new(),
        }
    }

    /// The client request body is complete.
    pub fn on_client_eom(&mut self) -> Vec<Action> {
        if self.lifecycle.released || self.lifecycle.client_terminated {
            return Vec::new();
        }

        match self.state {
            SessionState::Connecting => {
                self.pending_eom = true;
                Vec::new()
            }
            _ if self.origin_open() => vec![Action::ForwardEom],
            _ => Vec::new(),
        }
    }

    /// The response was fully handed to the client connection.
    pub fn on_client_complete(&mut self) -> Vec<Action> {
        if self.lifecycle.released || self.lifecycle.client_terminated {
            return Vec::new();
        }

        self.lifecycle.client_terminated = true;
        if !self.lifecycle.origin_attached {
            self.state = SessionState::Terminal;
        }
        self.release_if_done(Vec::new())
    }

    /// The client disconnected or its stream failed.
    pub fn on_client_error(&mut self) -> Vec<Action> {
        if self.lifecycle.released || self.lifecycle.client_terminated {
            return Vec::new();
        }

        tracing::debug!("Client aborted request for {}{}", self.domain, self.path);
        self.lifecycle.client_terminated = true;
        self.state = SessionState::ClientAborted;
        self.response_body = None;
        self.pending_body.clear();

        let mut actions = Vec::new();
        if self.lifecycle.origin_attached {
            actions.push(Action::AbortOrigin);
        }
        self.release_if_done(actions)
    }

    /// The origin response headers arrived.
    pub fn on_origin_headers(&mut self, mut head: ResponseHead) -> Vec<Action> {
        if self.lifecycle.released || !self.origin_open() {
            return Vec::new();
        }

        self.state = SessionState::Streaming;
        strip_response_headers(&mut head.headers);

        if self.method == Method::GET {
            self.response_head = Some(head);
            self.response_body = Some(BytesMut::new());
            return Vec::new();
        }

        if self.lifecycle.client_terminated {
            return Vec::new();
        }
        self.response = ClientResponse::Streaming;
        vec![Action::SendHeaders(head)]
    }

    /// A chunk of the origin response body arrived.
    pub fn on_origin_body(&mut self, chunk: Bytes) -> Vec<Action> {
        if self.lifecycle.released || self.state != SessionState::Streaming {
            return Vec::new();
        }

        if let Some(body) = self.response_body.as_mut() {
            body.extend_from_slice(&chunk);
            return Vec::new();
        }

        if self.response == ClientResponse::Streaming && !self.lifecycle.client_terminated {
            return vec![Action::SendBody(chunk)];
        }
        Vec::new()
    }

    /// The origin response is complete.
    pub fn on_origin_eom(&mut self) -> Vec<Action> {
        if self.lifecycle.released || self.state != SessionState::Streaming {
            return Vec::new();
        }

        self.state = SessionState::OriginComplete;
        self.origin_done = true;

        if self.lifecycle.client_terminated {
            return Vec::new();
        }

        if self.response == ClientResponse::Streaming {
            self.response = ClientResponse::Sent;
            return vec![Action::SendEom];
        }

        let (Some(head), Some(body)) = (self.response_head.take(), self.response_body.take()) else {
            return self.fail_before_response(StatusCode::BAD_GATEWAY);
        };
        let body = body.freeze();

        if self.method == Method::GET && head.status == StatusCode::OK {
            self.store(&body, &head.headers);
        }

        let mut head = head;
        head.headers.remove(CONTENT_LENGTH);
        self.response = ClientResponse::Sent;
        vec![Action::Respond(head, body)]
    }

    /// The origin transaction failed.
    pub fn on_origin_error(&mut self, err: &ProxyError) -> Vec<Action> {
        if self.lifecycle.released || self.origin_done || !self.lifecycle.origin_attached {
            return Vec::new();
        }

        tracing::warn!("Origin error for {}{}: {}", self.domain, self.path, err);
        self.state = SessionState::OriginError;
        self.origin_done = true;
        self.response_head = None;
        self.response_body = None;

        if self.lifecycle.client_terminated {
            return Vec::new();
        }

        match self.response {
            ClientResponse::None => self.fail_before_response(err.gateway_status()),
            _ => self.abort_client(),
        }
    }

    /// The origin transaction is gone.
    pub fn on_origin_detached(&mut self) -> Vec<Action> {
        if self.lifecycle.released || !self.lifecycle.origin_attached {
            return Vec::new();
        }

        self.lifecycle.origin_attached = false;

        let mut actions = Vec::new();
        if !self.origin_done && !self.lifecycle.client_terminated {
            // Detached without EOM or error: the response can never finish.
            self.origin_done = true;
            self.state = SessionState::OriginError;
            self.response_head = None;
            self.response_body = None;
            actions = match self.response {
                ClientResponse::None => self.fail_before_response(StatusCode::BAD_GATEWAY),
                _ => self.abort_client(),
            };
        }

        if self.lifecycle.client_terminated {
            self.state = SessionState::Terminal;
        }
        self.release_if_done(actions)
    }

    /// The origin cannot accept more request body.
    pub fn on_origin_egress_paused(&mut self) -> Vec<Action> {
        if self.lifecycle.released || self.lifecycle.client_terminated || !self.origin_open() {
            return Vec::new();
        }
        vec![Action::PauseIngress]
    }

    /// The origin can accept request body again.
    pub fn on_origin_egress_resumed(&mut self) -> Vec<Action> {
        if self.lifecycle.released || self.lifecycle.client_terminated || !self.origin_open() {
            return Vec::new();
        }
        vec![Action::ResumeIngress]
    }

    fn origin_open(&self) -> bool {
        self.lifecycle.origin_attached && !self.origin_done
    }

    fn store(&self, body: &Bytes, headers: &HeaderMap) {
        match self.cache.put(&self.domain, &self.path, body.clone(), headers) {
            Ok(PutOutcome::AlreadyPresent) => {
                tracing::debug!("Lost cache race for {}{}", self.domain, self.path);
            }
            Ok(PutOutcome::Inserted(_)) => {}
            Err(e) => {
                tracing::warn!("Failed to cache {}{}: {}", self.domain, self.path, e);
            }
        }
    }

    fn fail_before_response(&mut self, status: StatusCode) -> Vec<Action> {
        self.state = SessionState::OriginError;
        self.response = ClientResponse::Sent;

        let mut head = ResponseHead::new(status);
        head.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        let reason = status.canonical_reason().unwrap_or("Error");
        vec![Action::Respond(head, Bytes::from(reason.to_string()))]
    }

    fn abort_client(&mut self) -> Vec<Action> {
        self.lifecycle.client_terminated = true;
        let mut actions = vec![Action::AbortClient];
        if self.lifecycle.origin_attached && !self.origin_done {
            actions.push(Action::AbortOrigin);
        }
        self.release_if_done(actions)
    }

    fn release_if_done(&mut self, mut actions: Vec<Action>) -> Vec<Action> {
        if self.lifecycle.try_release() {
            self.state = SessionState::Terminal;
            actions.push(Action::Release);
        }
        actions
    }
}

fn hop_by_hop() -> [HeaderName; 9] {
    [
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        PROXY_AUTHENTICATE,
        PROXY_AUTHORIZATION,
        TE,
        TRAILER,
        TRANSFER_ENCODING,
        UPGRADE,
    ]
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(hop_by_hop().iter()) {
        headers.remove(name);
    }
}

/// Removes headers the origin must not see.
///
/// `Accept-Encoding` is dropped so the origin answers uncompressed and the
/// body can be cached and rewritten.
pub fn strip_request_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
    headers.remove(ACCEPT_ENCODING);
    headers.remove(DIRECT_HEADER);
}

/// Removes hop-by-hop headers from an origin response.
pub fn strip_response_headers(headers: &mut HeaderMap) {
    strip_hop_by_hop(headers);
}
