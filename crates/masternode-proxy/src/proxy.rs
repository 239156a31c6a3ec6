//! Masternode proxy server.
//!
//! Accepts client connections and serves each one with hyper's HTTP/1.1
//! connection driver, routing every request through the [`Router`].

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioIo, TokioTimer};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use masternode_storage::ContentCache;

use crate::config::MasternodeConfig;
use crate::error::Result;
use crate::network::NetworkState;
use crate::router::{ConnectionInfo, Router};

/// Pending connections the listener queues.
const LISTEN_BACKLOG: i32 = 1024;

/// Caching reverse proxy server.
pub struct ProxyServer {
    addr: SocketAddr,
    idle_timeout: Duration,
    router: Router,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("addr", &self.addr)
            .field("idle_timeout", &self.idle_timeout)
            .field("router", &self.router)
            .finish()
    }
}

impl ProxyServer {
    /// Creates a server for a validated configuration.
    ///
    /// Builds the content cache (opening the disk store when configured) and
    /// loads the service worker payload.
    pub fn new(config: &MasternodeConfig) -> Result<Self> {
        config.validate()?;

        let cache = ContentCache::new(
            config.protected_domains.iter().map(|d| d.domain.as_str()),
            config.cache.to_cache_config(),
        )?;
        let router = Router::from_config(config, Arc::new(cache));

        Ok(Self::with_router(config, router))
    }

    /// Creates a server around an existing router.
    pub fn with_router(config: &MasternodeConfig, router: Router) -> Self {
        Self {
            addr: config.server.addr(),
            idle_timeout: config.server.idle_timeout(),
            router,
        }
    }

    /// Includes edge nodes from `state` in direct responses.
    pub fn with_network_state(mut self, state: NetworkState) -> Self {
        self.router = self.router.with_network_state(state);
        self
    }

    /// Returns the address the server is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// The request router.
    pub fn router(&self) -> &Router {
        &self.router
    }

    /// The shared content cache.
    pub fn cache(&self) -> &Arc<ContentCache> {
        self.router.cache()
    }

    /// Binds the listener with `SO_REUSEADDR`.
    ///
    /// Must be called from within a Tokio runtime.
    fn bind(&self) -> Result<TcpListener> {
        let domain = if self.addr.is_ipv4() {
            Domain::IPV4
        } else {
            Domain::IPV6
        };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;

        // Allow address reuse (helps with TIME_WAIT sockets after a restart)
        socket.set_reuse_address(true)?;
        socket.bind(&self.addr.into())?;
        socket.listen(LISTEN_BACKLOG)?;
        socket.set_nonblocking(true)?;

        let std_listener: std::net::TcpListener = socket.into();
        Ok(TcpListener::from_std(std_listener)?)
    }

    /// Runs the server until the task is cancelled.
    pub async fn run(self) -> Result<()> {
        let listener = self.bind()?;
        let (_shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        tracing::info!("Starting masternode on {}", listener.local_addr()?);
        serve(listener, Arc::new(self.router), self.idle_timeout, shutdown_rx).await;
        tracing::info!("Masternode stopped");
        Ok(())
    }

    /// Starts the server in the background.
    ///
    /// Returns a handle that can be used to stop the server. Must be called
    /// from within a Tokio runtime.
    pub fn start(self) -> Result<ProxyHandle> {
        let listener = self.bind()?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        tracing::info!("Starting masternode on {}", addr);
        let handle = tokio::spawn(serve(
            listener,
            Arc::new(self.router),
            self.idle_timeout,
            shutdown_rx,
        ));

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }
}

async fn serve(
    listener: TcpListener,
    router: Arc<Router>,
    idle_timeout: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let (stream, remote_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::warn!("Failed to accept connection: {}", e);
                    continue;
                }
            },
            _ = shutdown_rx.recv() => {
                tracing::info!("Proxy shutdown signal received");
                return;
            }
        };

        let router = router.clone();
        tokio::spawn(async move {
            let conn = ConnectionInfo::plain(remote_addr);
            let service = service_fn(move |req: Request<Incoming>| {
                let router = router.clone();
                async move { router.handle(req, conn).await }
            });

            let mut builder = http1::Builder::new();
            builder
                .timer(TokioTimer::new())
                .header_read_timeout(idle_timeout);

            if let Err(e) = builder.serve_connection(TokioIo::new(stream), service).await {
                tracing::debug!("Connection from {} closed: {}", remote_addr, e);
            }
        });
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl std::fmt::Debug for ProxyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandle").field("addr", &self.addr).finish()
    }
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the proxy to stop accepting connections.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the proxy and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use http_body_util::{BodyExt, Full};
    use hyper::header::{HeaderValue, CONTENT_TYPE, HOST, LOCATION};
    use hyper::{Method, Response, StatusCode};
    use tempfile::{NamedTempFile, TempDir};
    use tokio::net::TcpStream;

    use crate::config::ProtectedDomain;
    use crate::DIRECT_HEADER;

    const PAGE: &[u8] = b"<html><head></head><body>Test Body</body></html>";

    async fn origin_service(
        req: Request<Incoming>,
        hits: Arc<AtomicUsize>,
    ) -> std::result::Result<Response<Full<Bytes>>, std::convert::Infallible> {
        hits.fetch_add(1, Ordering::SeqCst);

        if req.method() == Method::POST {
            let body = req.into_body().collect().await.unwrap().to_bytes();
            let mut response = Response::new(Full::new(body));
            *response.status_mut() = StatusCode::CREATED;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
            return Ok(response);
        }

        let mut response = Response::new(Full::new(Bytes::from_static(PAGE)));
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/html"));
        Ok(response)
    }

    /// Starts an origin that serves `PAGE` for GET and echoes POST bodies.
    async fn fake_origin() -> (SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req| origin_service(req, counter.clone()));
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (addr, hits)
    }

    fn config(origin: SocketAddr) -> MasternodeConfig {
        MasternodeConfig::new(ProtectedDomain::new("example.com", "127.0.0.1", origin.port()))
            .with_addr("127.0.0.1:0".parse().unwrap())
    }

    fn request(method: Method, host: &'static str, path: &str, body: &'static [u8]) -> Request<Full<Bytes>> {
        let mut req = Request::new(Full::new(Bytes::from_static(body)));
        *req.method_mut() = method;
        *req.uri_mut() = path.parse().unwrap();
        req.headers_mut().insert(HOST, HeaderValue::from_static(host));
        req
    }

    async fn send(addr: SocketAddr, req: Request<Full<Bytes>>) -> Response<Bytes> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
            .await
            .unwrap();
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let response = sender.send_request(req).await.unwrap();
        let (parts, body) = response.into_parts();
        let body = body.collect().await.unwrap().to_bytes();
        Response::from_parts(parts, body)
    }

    #[tokio::test]
    async fn caches_then_injects_service_worker() {
        let (origin, hits) = fake_origin().await;
        let cache_dir = TempDir::new().unwrap();
        let mut payload = NamedTempFile::new().unwrap();
        payload.write_all(b"self.addEventListener('fetch', () => {});").unwrap();

        let config = config(origin)
            .with_cache_dir(cache_dir.path())
            .with_service_worker(payload.path());
        let server = ProxyServer::new(&config).unwrap();
        let cache = server.cache().clone();
        let handle = server.start().unwrap();

        let first = send(handle.addr(), request(Method::GET, "example.com", "/index.html", b"")).await;
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.body().as_ref(), PAGE);

        let second = send(handle.addr(), request(Method::GET, "example.com", "/index.html", b"")).await;
        assert_eq!(second.status(), StatusCode::OK);
        let body = std::str::from_utf8(second.body()).unwrap();
        assert!(body.contains("<script>"));
        assert!(body.contains("navigator.serviceWorker.register"));
        assert!(body.ends_with("</head><body>Test Body</body></html>"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        cache.flush();
        let files: Vec<String> = std::fs::read_dir(cache_dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(files, vec![masternode_storage::hash_content(PAGE)]);

        handle.stop().await;
    }

    #[tokio::test]
    async fn service_worker_route_serves_payload() {
        let (origin, hits) = fake_origin().await;
        let mut payload = NamedTempFile::new().unwrap();
        payload.write_all(b"console.log('sw');").unwrap();

        let config = config(origin).with_service_worker(payload.path());
        let handle = ProxyServer::new(&config).unwrap().start().unwrap();

        let response = send(
            handle.addr(),
            request(Method::GET, "example.com", "/masternode-service-worker.js", b""),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[CONTENT_TYPE], "application/javascript");
        assert_eq!(response.body().as_ref(), b"console.log('sw');");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        handle.stop().await;
    }

    #[tokio::test]
    async fn insecure_request_is_redirected() {
        let (origin, hits) = fake_origin().await;
        let config = config(origin).with_secure_upgrade(8443);
        let handle = ProxyServer::new(&config).unwrap().start().unwrap();

        let response = send(handle.addr(), request(Method::GET, "example.com", "/path", b"")).await;
        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[LOCATION], "https://example.com:8443/path");
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        handle.stop().await;
    }

    #[tokio::test]
    async fn unknown_domain_is_rejected_without_origin_contact() {
        let (origin, hits) = fake_origin().await;
        let handle = ProxyServer::new(&config(origin)).unwrap().start().unwrap();

        let response = send(handle.addr(), request(Method::GET, "unknown.example", "/", b"")).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        handle.stop().await;
    }

    #[tokio::test]
    async fn post_is_streamed_and_not_cached() {
        let (origin, hits) = fake_origin().await;
        let server = ProxyServer::new(&config(origin)).unwrap();
        let cache = server.cache().clone();
        let handle = server.start().unwrap();

        for _ in 0..2 {
            let response = send(
                handle.addr(),
                request(Method::POST, "example.com", "/submit", b"name=masternode"),
            )
            .await;
            assert_eq!(response.status(), StatusCode::CREATED);
            assert_eq!(response.body().as_ref(), b"name=masternode");
        }

        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(cache.get("example.com", "/submit").is_none());

        handle.stop().await;
    }

    #[tokio::test]
    async fn direct_header_reports_cached_assets() {
        let (origin, _hits) = fake_origin().await;
        let state = NetworkState::new();
        state.replace(vec!["10.0.0.1:8080".into()]);
        let handle = ProxyServer::new(&config(origin))
            .unwrap()
            .with_network_state(state)
            .start()
            .unwrap();

        send(handle.addr(), request(Method::GET, "example.com", "/index.html", b"")).await;

        let mut req = request(Method::GET, "example.com", "/", b"");
        req.headers_mut()
            .insert(DIRECT_HEADER, HeaderValue::from_static("1"));
        let response = send(handle.addr(), req).await;
        assert_eq!(response.status(), StatusCode::OK);

        let json: serde_json::Value = serde_json::from_slice(response.body()).unwrap();
        assert_eq!(
            json["assetHashes"]["/index.html"],
            masternode_storage::hash_content(PAGE)
        );
        assert_eq!(json["edgeNodes"][0], "10.0.0.1:8080");

        handle.stop().await;
    }

    #[tokio::test]
    async fn unreachable_origin_is_bad_gateway() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = closed.local_addr().unwrap();
        drop(closed);

        let handle = ProxyServer::new(&config(origin)).unwrap().start().unwrap();
        let response = send(handle.addr(), request(Method::GET, "example.com", "/", b"")).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        handle.stop().await;
    }

    #[tokio::test]
    async fn stalled_origin_connect_times_out() {
        // A listener that never accepts: once its backlog is full, further
        // connection attempts hang.
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).unwrap();
        socket.bind(&"127.0.0.1:0".parse::<SocketAddr>().unwrap().into()).unwrap();
        socket.listen(0).unwrap();
        let origin = socket.local_addr().unwrap().as_socket().unwrap();
        let _backlog: Vec<std::net::TcpStream> = (0..4)
            .filter_map(|_| std::net::TcpStream::connect_timeout(&origin, Duration::from_millis(100)).ok())
            .collect();

        let config = config(origin).with_connect_timeout(Duration::from_millis(200));
        let handle = ProxyServer::new(&config).unwrap().start().unwrap();
        let response = tokio::time::timeout(
            Duration::from_secs(5),
            send(handle.addr(), request(Method::GET, "example.com", "/", b"")),
        )
        .await
        .expect("connect timeout did not fire");
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        handle.stop().await;
    }

    #[tokio::test]
    async fn configured_domain_whitespace_is_ignored() {
        let (origin, hits) = fake_origin().await;
        let config = MasternodeConfig::new(ProtectedDomain::new(" Example.com ", "127.0.0.1", origin.port()))
            .with_addr("127.0.0.1:0".parse().unwrap());
        let server = ProxyServer::new(&config).unwrap();
        let cache = server.cache().clone();
        let handle = server.start().unwrap();

        for _ in 0..2 {
            let response = send(handle.addr(), request(Method::GET, "example.com", "/index.html", b"")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(cache.get("example.com", "/index.html").is_some());

        handle.stop().await;
    }

    #[tokio::test]
    async fn origin_status_is_passed_through() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let origin = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let service = service_fn(|_req: Request<Incoming>| async {
                        let mut response = Response::new(Full::new(Bytes::from_static(b"gone")));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        Ok::<_, std::convert::Infallible>(response)
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        let server = ProxyServer::new(&config(origin)).unwrap();
        let cache = server.cache().clone();
        let handle = server.start().unwrap();

        let response = send(handle.addr(), request(Method::GET, "example.com", "/missing", b"")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.body().as_ref(), b"gone");
        assert!(cache.get("example.com", "/missing").is_none());

        handle.stop().await;
    }

    #[tokio::test]
    async fn proxy_handle_shutdown() {
        let config = MasternodeConfig::new(ProtectedDomain::new("example.com", "127.0.0.1", 80))
            .with_addr("127.0.0.1:0".parse().unwrap());
        let handle = ProxyServer::new(&config).unwrap().start().unwrap();
        assert_ne!(handle.addr().port(), 0);

        tokio::time::timeout(Duration::from_secs(5), handle.stop())
            .await
            .expect("server did not stop");
    }
}
