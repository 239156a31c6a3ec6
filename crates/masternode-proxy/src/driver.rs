//! Async driver for [`ProxySession`].
//!
//! One task per proxied request owns the session, the client request body and
//! the origin connection. It turns IO readiness into session events and session
//! actions into IO, until the session emits [`Action::Release`].
//!
//! Backpressure:
//!
//! - client → origin: chunks the origin body channel cannot take are queued in
//!   an [`Outlet`]; a non-empty queue pauses client ingress through the session.
//! - origin → client: while the streamed client body is full the driver stops
//!   receiving origin events, which stops the origin reader and hyper stops
//!   reading the origin socket.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::BodyExt;
use hyper::body::Body;
use hyper::client::conn::http1::SendRequest;
use hyper::header::CONTENT_LENGTH;
use hyper::{Method, Request, Response, StatusCode, Uri, Version};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::body::{BodySender, Delivery, SessionBody};
use crate::domains::OriginAddr;
use crate::error::{ProxyError, Result};
use crate::session::{Action, ProxySession, RequestHead, ResponseHead};

/// Chunks buffered toward the origin before client ingress pauses.
const UPSTREAM_CHUNKS: usize = 8;
/// Chunks buffered toward the client before origin reads pause.
const DOWNSTREAM_CHUNKS: usize = 8;
/// Origin events buffered between the origin reader and the driver.
const ORIGIN_EVENTS: usize = 8;

type ConnectFuture = Pin<Box<dyn Future<Output = Result<OriginConnection>> + Send>>;

/// An HTTP/1.1 connection to an origin.
pub struct OriginConnection {
    sender: SendRequest<SessionBody>,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for OriginConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginConnection")
            .field("ready", &self.sender.is_ready())
            .finish()
    }
}

/// Connects to `origin` and performs the HTTP/1.1 handshake within `timeout`.
pub async fn connect_origin(origin: OriginAddr, timeout: Duration) -> Result<OriginConnection> {
    let authority = origin.authority();

    let handshake = async {
        let stream = TcpStream::connect(authority.as_str())
            .await
            .map_err(|e| ProxyError::OriginConnect {
                origin: authority.clone(),
                reason: e.to_string(),
            })?;
        let _ = stream.set_nodelay(true);

        let (sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| ProxyError::OriginConnect {
                origin: authority.clone(),
                reason: e.to_string(),
            })?;

        let task = tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Origin connection closed: {}", e);
            }
        });

        Ok(OriginConnection { sender, task })
    };

    match tokio::time::timeout(timeout, handshake).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::OriginTimeout(authority)),
    }
}

/// Events produced by the origin reader task.
#[derive(Debug)]
enum OriginEvent {
    Headers(ResponseHead),
    Body(Bytes),
    Eom,
    Error(ProxyError),
}

/// Sends `request` and reports the response as [`OriginEvent`]s.
async fn read_origin(
    mut sender: SendRequest<SessionBody>,
    request: Request<SessionBody>,
    events: mpsc::Sender<OriginEvent>,
) {
    let response = match sender.ready().await {
        Ok(()) => sender.send_request(request).await,
        Err(e) => Err(e),
    };

    let response = match response {
        Ok(response) => response,
        Err(e) => {
            let _ = events
                .send(OriginEvent::Error(ProxyError::Origin(e.to_string())))
                .await;
            return;
        }
    };

    let (parts, mut body) = response.into_parts();
    let head = ResponseHead {
        status: parts.status,
        headers: parts.headers,
    };
    if events.send(OriginEvent::Headers(head)).await.is_err() {
        return;
    }

    loop {
        let event = match body.frame().await {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) if !data.is_empty() => OriginEvent::Body(data),
                _ => continue,
            },
            Some(Err(e)) => OriginEvent::Error(ProxyError::Origin(e.to_string())),
            None => OriginEvent::Eom,
        };

        let last = !matches!(event, OriginEvent::Body(_));
        if events.send(event).await.is_err() || last {
            return;
        }
    }
}

/// A body sender with an overflow queue.
///
/// Pushing never waits: chunks the channel cannot take are queued, and the
/// driver drains the queue when the channel has room again.
struct Outlet {
    tx: BodySender,
    queue: VecDeque<Bytes>,
    closing: bool,
}

impl Outlet {
    fn new(tx: BodySender) -> Self {
        Self {
            tx,
            queue: VecDeque::new(),
            closing: false,
        }
    }

    /// Returns false if the receiving body is gone.
    fn push(&mut self, chunk: Bytes) -> bool {
        if !self.queue.is_empty() {
            self.queue.push_back(chunk);
            return true;
        }

        match self.tx.try_send(chunk) {
            Ok(()) => true,
            Err(TrySendError::Full(chunk)) => {
                self.queue.push_back(chunk);
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Moves queued chunks into the channel. Returns false if the body is gone.
    fn drain(&mut self) -> bool {
        while let Some(chunk) = self.queue.pop_front() {
            match self.tx.try_send(chunk) {
                Ok(()) => {}
                Err(TrySendError::Full(chunk)) => {
                    self.queue.push_front(chunk);
                    return true;
                }
                Err(TrySendError::Closed(_)) => return false,
            }
        }
        true
    }

    fn is_blocked(&self) -> bool {
        !self.queue.is_empty()
    }

    fn is_finished(&self) -> bool {
        self.closing && self.queue.is_empty()
    }
}

/// Drives one [`ProxySession`] to release.
pub struct SessionDriver<B> {
    session: ProxySession,
    connect_timeout: Duration,
    method: Method,
    client_body: Option<B>,
    ingress_paused: bool,
    reply: Option<oneshot::Sender<Response<SessionBody>>>,
    delivery: Option<oneshot::Receiver<Delivery>>,
    downstream: Option<Outlet>,
    connecting: Option<ConnectFuture>,
    connection: Option<OriginConnection>,
    conn_task: Option<JoinHandle<()>>,
    origin_task: Option<JoinHandle<()>>,
    origin_events: Option<mpsc::Receiver<OriginEvent>>,
    upstream: Option<Outlet>,
    released: bool,
}

impl<B> std::fmt::Debug for SessionDriver<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionDriver")
            .field("session", &self.session)
            .field("ingress_paused", &self.ingress_paused)
            .field("released", &self.released)
            .finish()
    }
}

impl<B> SessionDriver<B>
where
    B: Body<Data = Bytes> + Send + Unpin + 'static,
    B::Error: std::fmt::Display + Send,
{
    /// Creates a driver answering through `reply`.
    pub fn new(
        session: ProxySession,
        client_body: B,
        reply: oneshot::Sender<Response<SessionBody>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            session,
            connect_timeout,
            method: Method::GET,
            client_body: Some(client_body),
            ingress_paused: false,
            reply: Some(reply),
            delivery: None,
            downstream: None,
            connecting: None,
            connection: None,
            conn_task: None,
            origin_task: None,
            origin_events: None,
            upstream: None,
            released: false,
        }
    }

    /// Runs the session for `head` until it is released.
    pub async fn run(mut self, head: RequestHead) {
        let body_done = self
            .client_body
            .as_ref()
            .map(|body| body.is_end_stream())
            .unwrap_or(true);
        if body_done {
            self.client_body = None;
        }

        self.method = head.method.clone();
        let actions = self.session.on_request(head);
        self.apply(actions);
        if body_done {
            let actions = self.session.on_client_eom();
            self.apply(actions);
        }

        while !self.released {
            let read_client = self.reads_client();
            let read_origin = self.reads_origin();
            let upstream_blocked = self.upstream.as_ref().is_some_and(Outlet::is_blocked);
            let downstream_blocked = self.downstream.as_ref().is_some_and(Outlet::is_blocked);

            tokio::select! {
                frame = next_frame(&mut self.client_body), if read_client => {
                    self.on_client_frame(frame);
                }
                result = finish_connect(&mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_connected(result);
                }
                event = next_event(&mut self.origin_events), if read_origin => {
                    self.on_origin_event(event);
                }
                ready = outlet_ready(&self.upstream), if upstream_blocked => {
                    self.on_upstream_ready(ready);
                }
                ready = outlet_ready(&self.downstream), if downstream_blocked => {
                    self.on_downstream_ready(ready);
                }
                delivery = wait_delivery(&mut self.delivery), if self.delivery.is_some() => {
                    self.delivery = None;
                    let actions = match delivery {
                        Some(Delivery::Complete) => self.session.on_client_complete(),
                        _ => self.session.on_client_error(),
                    };
                    self.apply(actions);
                }
                _ = reply_closed(&mut self.reply), if self.reply.is_some() => {
                    // The connection dropped the pending response future.
                    self.reply = None;
                    let actions = self.session.on_client_error();
                    self.apply(actions);
                }
                else => {
                    tracing::warn!("Session stalled before release: {:?}", self.session);
                    break;
                }
            }
        }
    }

    /// The client body is read unless ingress is paused.
    fn reads_client(&self) -> bool {
        !self.ingress_paused && self.client_body.is_some()
    }

    /// Origin events are read unless the streamed client body is backed up.
    fn reads_origin(&self) -> bool {
        self.origin_events.is_some() && !self.downstream.as_ref().is_some_and(Outlet::is_blocked)
    }

    fn on_client_frame(&mut self, frame: Option<std::result::Result<hyper::body::Frame<Bytes>, B::Error>>) {
        let actions = match frame {
            Some(Ok(frame)) => match frame.into_data() {
                Ok(data) if !data.is_empty() => self.session.on_client_body(data),
                _ => Vec::new(),
            },
            Some(Err(e)) => {
                tracing::debug!("Client body error: {}", e);
                self.client_body = None;
                self.session.on_client_error()
            }
            None => {
                self.client_body = None;
                self.session.on_client_eom()
            }
        };
        self.apply(actions);
    }

    fn on_connected(&mut self, result: Result<OriginConnection>) {
        let actions = match result {
            Ok(connection) => {
                self.connection = Some(connection);
                self.session.on_connect_success()
            }
            Err(e) => self.session.on_connect_error(&e),
        };
        self.apply(actions);
    }

    fn on_origin_event(&mut self, event: Option<OriginEvent>) {
        let actions = match event {
            Some(OriginEvent::Headers(head)) => self.session.on_origin_headers(head),
            Some(OriginEvent::Body(chunk)) => self.session.on_origin_body(chunk),
            Some(OriginEvent::Eom) => self.session.on_origin_eom(),
            Some(OriginEvent::Error(e)) => self.session.on_origin_error(&e),
            None => {
                self.origin_events = None;
                self.origin_task = None;
                self.upstream = None;
                self.session.on_origin_detached()
            }
        };
        self.apply(actions);
    }

    fn on_upstream_ready(&mut self, ready: Result<()>) {
        let Some(upstream) = self.upstream.as_mut() else {
            return;
        };

        let alive = ready.is_ok() && upstream.drain();
        if !alive || upstream.is_finished() {
            self.upstream = None;
        }

        if !self.upstream.as_ref().is_some_and(Outlet::is_blocked) {
            let actions = self.session.on_origin_egress_resumed();
            self.apply(actions);
        }
    }

    fn on_downstream_ready(&mut self, ready: Result<()>) {
        let Some(downstream) = self.downstream.as_mut() else {
            return;
        };

        let alive = ready.is_ok() && downstream.drain();
        if !alive || downstream.is_finished() {
            // Dropping the sender ends the client body.
            self.downstream = None;
        }
    }

    fn apply(&mut self, actions: Vec<Action>) {
        let mut queue: VecDeque<Action> = actions.into();

        while let Some(action) = queue.pop_front() {
            match action {
                Action::Respond(head, body) => {
                    self.send_response(head, SessionBody::full(body));
                }
                Action::SendHeaders(head) => {
                    let length = declared_length(&self.method, &head);
                    let (tx, mut body) = SessionBody::channel(DOWNSTREAM_CHUNKS);
                    if let Some(length) = length {
                        body = body.with_length(length);
                    }
                    self.downstream = Some(Outlet::new(tx));
                    self.send_response(head, body);
                }
                Action::SendBody(chunk) => {
                    if let Some(downstream) = self.downstream.as_mut() {
                        if !downstream.push(chunk) {
                            self.downstream = None;
                        }
                    }
                }
                Action::SendEom => {
                    if let Some(downstream) = self.downstream.as_mut() {
                        downstream.closing = true;
                        if downstream.is_finished() {
                            self.downstream = None;
                        }
                    }
                }
                Action::Connect(origin) => {
                    tracing::debug!("Connecting to origin {}", origin);
                    self.connecting = Some(Box::pin(connect_origin(origin, self.connect_timeout)));
                }
                Action::SendOriginRequest(head) => {
                    queue.extend(self.start_origin(head));
                }
                Action::ForwardBody(chunk) => {
                    if let Some(upstream) = self.upstream.as_mut() {
                        let was_blocked = upstream.is_blocked();
                        if !upstream.push(chunk) {
                            self.upstream = None;
                        } else if !was_blocked && upstream.is_blocked() {
                            queue.extend(self.session.on_origin_egress_paused());
                        }
                    }
                }
                Action::ForwardEom => {
                    if let Some(upstream) = self.upstream.as_mut() {
                        upstream.closing = true;
                        if upstream.is_finished() {
                            self.upstream = None;
                        }
                    }
                }
                Action::PauseIngress => self.ingress_paused = true,
                Action::ResumeIngress => self.ingress_paused = false,
                Action::AbortOrigin => {
                    self.abort_origin();
                    queue.extend(self.session.on_origin_detached());
                }
                Action::AbortClient => {
                    // Dropping an unanswered reply makes hyper close the
                    // connection; a streamed body ends with an error.
                    self.reply = None;
                    self.delivery = None;
                    if let Some(downstream) = self.downstream.take() {
                        downstream.tx.abort();
                    }
                }
                Action::Release => {
                    self.released = true;
                }
            }
        }
    }

    fn send_response(&mut self, head: ResponseHead, body: SessionBody) {
        let Some(reply) = self.reply.take() else {
            return;
        };

        let (notify, delivery) = oneshot::channel();
        let mut response = Response::new(body.with_notify(notify));
        *response.status_mut() = head.status;
        *response.headers_mut() = head.headers;

        // A failed send drops the body, which reports an aborted delivery.
        let _ = reply.send(response);
        self.delivery = Some(delivery);
    }

    fn start_origin(&mut self, head: RequestHead) -> Vec<Action> {
        let Some(OriginConnection { sender, task }) = self.connection.take() else {
            return Vec::new();
        };
        self.conn_task = Some(task);

        let body = if self.client_body.is_some() {
            let (tx, body) = SessionBody::channel(UPSTREAM_CHUNKS);
            self.upstream = Some(Outlet::new(tx));
            body
        } else {
            SessionBody::empty()
        };

        let request = match build_origin_request(head, body) {
            Ok(request) => request,
            Err(e) => {
                self.upstream = None;
                let mut actions = self.session.on_origin_error(&e);
                actions.extend(self.session.on_origin_detached());
                return actions;
            }
        };

        let (events_tx, events_rx) = mpsc::channel(ORIGIN_EVENTS);
        self.origin_events = Some(events_rx);
        self.origin_task = Some(tokio::spawn(read_origin(sender, request, events_tx)));
        Vec::new()
    }

    fn abort_origin(&mut self) {
        self.connecting = None;
        self.connection = None;
        self.origin_events = None;
        self.upstream = None;
        if let Some(task) = self.origin_task.take() {
            task.abort();
        }
        if let Some(task) = self.conn_task.take() {
            task.abort();
        }
    }
}

impl<B> Drop for SessionDriver<B> {
    fn drop(&mut self) {
        if let Some(task) = self.origin_task.take() {
            task.abort();
        }
        if let Some(task) = self.conn_task.take() {
            task.abort();
        }
        if let Some(connection) = self.connection.take() {
            connection.task.abort();
        }
    }
}

/// Body length the client connection will write for a streamed response.
///
/// HEAD requests and bodyless statuses are never polled by the connection.
fn declared_length(method: &Method, head: &ResponseHead) -> Option<u64> {
    let status = head.status;
    if *method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return Some(0);
    }

    head.headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok())
}

/// Rewrites the request target to origin form for the origin connection.
fn build_origin_request(head: RequestHead, body: SessionBody) -> Result<Request<SessionBody>> {
    let target = head.path().to_string();
    let uri: Uri = target
        .parse()
        .map_err(|e| ProxyError::Http(format!("invalid request target {}: {}", target, e)))?;

    let mut request = Request::new(body);
    *request.method_mut() = head.method;
    *request.uri_mut() = uri;
    *request.version_mut() = Version::HTTP_11;
    *request.headers_mut() = head.headers;
    Ok(request)
}

async fn next_frame<B>(body: &mut Option<B>) -> Option<std::result::Result<hyper::body::Frame<Bytes>, B::Error>>
where
    B: Body<Data = Bytes> + Unpin,
{
    match body.as_mut() {
        Some(body) => body.frame().await,
        None => std::future::pending().await,
    }
}

async fn finish_connect(connecting: &mut Option<ConnectFuture>) -> Result<OriginConnection> {
    match connecting.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

async fn next_event(events: &mut Option<mpsc::Receiver<OriginEvent>>) -> Option<OriginEvent> {
    match events.as_mut() {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn outlet_ready(outlet: &Option<Outlet>) -> Result<()> {
    match outlet.as_ref() {
        Some(outlet) => outlet.tx.ready().await,
        None => std::future::pending().await,
    }
}

async fn wait_delivery(delivery: &mut Option<oneshot::Receiver<Delivery>>) -> Option<Delivery> {
    match delivery.as_mut() {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}

async fn reply_closed(reply: &mut Option<oneshot::Sender<Response<SessionBody>>>) {
    match reply.as_mut() {
        Some(tx) => tx.closed().await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use http_body_util::{Empty, Full};
    use hyper::body::Frame;
    use hyper::header::{HeaderValue, CONTENT_TYPE, HOST};
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{HeaderMap, Method, StatusCode};
    use masternode_storage::ContentCache;
    use tokio::net::TcpListener;

    const PAGE: &str = "<html><head></head><body>Test Body</body></html>";

    /// Serves `PAGE` for every request and counts connections.
    async fn fake_origin() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<hyper::body::Incoming>| async {
                        let mut response = Response::new(Full::new(Bytes::from_static(PAGE.as_bytes())));
                        response
                            .headers_mut()
                            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
                        Ok::<_, std::convert::Infallible>(response)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, hits)
    }

    fn get(path: &str) -> RequestHead {
        let mut headers = HeaderMap::new();
        headers.insert(HOST, HeaderValue::from_static("example.com"));
        RequestHead {
            method: Method::GET,
            uri: path.parse().unwrap(),
            version: Version::HTTP_11,
            headers,
        }
    }

    /// A driver for a streamed `method` request that has reached `Connected`
    /// without opening a real origin connection.
    fn connected_driver(method: Method) -> (SessionDriver<Empty<Bytes>>, oneshot::Receiver<Response<SessionBody>>) {
        let cache = Arc::new(ContentCache::in_memory(["example.com"]).unwrap());
        let session = ProxySession::new("example.com", Some(OriginAddr::new("127.0.0.1", 9)), cache, None);
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut driver = SessionDriver::new(session, Empty::<Bytes>::new(), reply_tx, Duration::from_secs(1));

        let mut head = get("/upload");
        head.method = method.clone();
        driver.method = method;
        let actions = driver.session.on_request(head);
        driver.apply(actions);
        assert!(!driver.reads_client());

        let actions = driver.session.on_connect_success();
        driver.apply(actions);
        (driver, reply_rx)
    }

    fn chunk() -> Bytes {
        Bytes::from_static(b"0123456789abcdef")
    }

    #[tokio::test]
    async fn stalled_origin_pauses_client_ingress() {
        let (mut driver, _reply_rx) = connected_driver(Method::POST);
        assert!(driver.reads_client());

        // The origin side of the request body, never read until later.
        let (tx, mut origin_body) = SessionBody::channel(UPSTREAM_CHUNKS);
        driver.upstream = Some(Outlet::new(tx));

        for _ in 0..UPSTREAM_CHUNKS {
            driver.on_client_frame(Some(Ok(Frame::data(chunk()))));
            assert!(driver.reads_client());
        }
        driver.on_client_frame(Some(Ok(Frame::data(chunk()))));
        assert!(!driver.reads_client());
        assert_eq!(driver.upstream.as_ref().map(|o| o.queue.len()), Some(1));

        // Further frames already in flight are queued, not dropped.
        driver.on_client_frame(Some(Ok(Frame::data(chunk()))));
        assert_eq!(driver.upstream.as_ref().map(|o| o.queue.len()), Some(2));

        // The origin drains two chunks; the queue empties and ingress resumes.
        assert!(origin_body.frame().await.is_some());
        assert!(origin_body.frame().await.is_some());
        let ready = outlet_ready(&driver.upstream).await;
        driver.on_upstream_ready(ready);
        assert!(driver.reads_client());
        assert!(!driver.upstream.as_ref().is_some_and(Outlet::is_blocked));
    }

    #[tokio::test]
    async fn slow_client_stops_origin_reads() {
        let (mut driver, reply_rx) = connected_driver(Method::POST);
        let (events_tx, events_rx) = mpsc::channel(ORIGIN_EVENTS);
        driver.origin_events = Some(events_rx);
        assert!(driver.reads_origin());

        driver.on_origin_event(Some(OriginEvent::Headers(ResponseHead::new(StatusCode::OK))));
        let mut body = reply_rx.await.unwrap().into_body();

        for sent in 0..=DOWNSTREAM_CHUNKS {
            assert!(driver.reads_origin(), "origin reads stopped after {} chunks", sent);
            driver.on_origin_event(Some(OriginEvent::Body(chunk())));
        }

        // The client body is full and one chunk is queued: no more events are read.
        assert!(!driver.reads_origin());
        assert_eq!(driver.downstream.as_ref().map(|o| o.queue.len()), Some(1));

        // Unread origin events are capped by the event channel.
        for _ in 0..ORIGIN_EVENTS {
            assert!(events_tx.try_send(OriginEvent::Body(chunk())).is_ok());
        }
        assert!(events_tx.try_send(OriginEvent::Body(chunk())).is_err());

        // The client reads one chunk; the queued chunk moves into the body.
        assert!(body.frame().await.is_some());
        let ready = outlet_ready(&driver.downstream).await;
        driver.on_downstream_ready(ready);
        assert!(driver.reads_origin());
        assert_eq!(driver.downstream.as_ref().map(|o| o.queue.len()), Some(0));
    }

    #[test]
    fn bodyless_responses_declare_zero_length() {
        let mut ok = ResponseHead::new(StatusCode::OK);
        ok.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("512"));

        assert_eq!(declared_length(&Method::GET, &ok), Some(512));
        assert_eq!(declared_length(&Method::HEAD, &ok), Some(0));
        assert_eq!(declared_length(&Method::POST, &ResponseHead::new(StatusCode::NO_CONTENT)), Some(0));
        assert_eq!(declared_length(&Method::GET, &ResponseHead::new(StatusCode::NOT_MODIFIED)), Some(0));
        assert_eq!(declared_length(&Method::POST, &ResponseHead::new(StatusCode::OK)), None);
    }

    #[tokio::test]
    async fn head_response_body_is_already_finished() {
        let (mut driver, reply_rx) = connected_driver(Method::HEAD);
        let mut head = ResponseHead::new(StatusCode::OK);
        head.headers.insert(CONTENT_LENGTH, HeaderValue::from_static("512"));
        driver.on_origin_event(Some(OriginEvent::Headers(head)));

        let response = reply_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.body().is_end_stream());
    }

    #[tokio::test]
    async fn connect_refused_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = connect_origin(OriginAddr::new("127.0.0.1", addr.port()), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.gateway_status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn miss_fetches_from_origin_and_caches() {
        let (addr, hits) = fake_origin().await;
        let cache = Arc::new(ContentCache::in_memory(["example.com"]).unwrap());
        let session = ProxySession::new(
            "example.com",
            Some(OriginAddr::new("127.0.0.1", addr.port())),
            cache.clone(),
            None,
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let driver = SessionDriver::new(session, Empty::<Bytes>::new(), reply_tx, Duration::from_secs(2));
        let task = tokio::spawn(driver.run(get("/index.html")));

        let response = reply_rx.await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), PAGE.as_bytes());

        // Collecting the body drops it, which completes the client side.
        task.await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(cache.get("example.com", "/index.html").is_some());
    }

    #[tokio::test]
    async fn dropped_reply_releases_without_caching() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // Accept but never answer.
        tokio::spawn(async move {
            let _held = listener.accept().await;
            tokio::time::sleep(Duration::from_secs(30)).await;
        });

        let cache = Arc::new(ContentCache::in_memory(["example.com"]).unwrap());
        let session = ProxySession::new(
            "example.com",
            Some(OriginAddr::new("127.0.0.1", addr.port())),
            cache.clone(),
            None,
        );

        let (reply_tx, reply_rx) = oneshot::channel();
        let driver = SessionDriver::new(session, Empty::<Bytes>::new(), reply_tx, Duration::from_secs(2));
        let task = tokio::spawn(driver.run(get("/slow")));

        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(reply_rx);

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("driver did not release")
            .unwrap();
        assert!(cache.get("example.com", "/slow").is_none());
    }
}
