//! Request handlers chosen by the router.
//!
//! Every request gets exactly one [`Handler`] for its lifetime. All variants
//! except [`Handler::Proxy`] answer immediately without contacting an origin.

use std::collections::BTreeMap;
use std::time::Duration;

use bytes::Bytes;
use hyper::body::Body;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::{Request, Response, StatusCode};
use serde::Serialize;
use tokio::sync::oneshot;

use crate::body::SessionBody;
use crate::driver::SessionDriver;
use crate::error::{ProxyError, Result};
use crate::session::{ProxySession, RequestHead};

/// JSON body of the direct-introspection response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectInfo {
    /// Cached path → content hash for the requested domain.
    pub asset_hashes: BTreeMap<String, String>,
    /// Known edge nodes, present when peer discovery is configured.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub edge_nodes: Option<Vec<String>>,
}

/// What the router decided to do with a request.
pub enum Handler {
    /// Redirect to the secure port.
    Redirect {
        /// Target URL.
        location: String,
    },
    /// Report cache and network metadata.
    Direct(DirectInfo),
    /// Serve the service worker payload.
    StaticPayload {
        /// Payload bytes.
        payload: Bytes,
        /// Content type sent with the payload.
        content_type: &'static str,
    },
    /// Refuse the request.
    Reject {
        /// Response status.
        status: StatusCode,
        /// Plain text message.
        message: String,
    },
    /// Serve from cache or the origin.
    Proxy(Box<ProxySession>),
}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Handler::Redirect { location } => f.debug_struct("Redirect").field("location", location).finish(),
            Handler::Direct(info) => f.debug_tuple("Direct").field(&info.asset_hashes.len()).finish(),
            Handler::StaticPayload { payload, .. } => {
                f.debug_tuple("StaticPayload").field(&payload.len()).finish()
            }
            Handler::Reject { status, .. } => f.debug_tuple("Reject").field(status).finish(),
            Handler::Proxy(session) => f.debug_tuple("Proxy").field(session).finish(),
        }
    }
}

impl Handler {
    /// Creates a rejection handler.
    pub fn reject(status: StatusCode, message: impl Into<String>) -> Self {
        Handler::Reject {
            status,
            message: message.into(),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Redirect { .. } => "redirect",
            Handler::Direct(_) => "direct",
            Handler::StaticPayload { .. } => "static",
            Handler::Reject { .. } => "reject",
            Handler::Proxy(_) => "proxy",
        }
    }

    /// Produces the response for `req`.
    ///
    /// Proxy sessions run on their own task; this waits for the response head.
    /// An error means the session aborted the client connection.
    pub async fn respond<B>(self, req: Request<B>, connect_timeout: Duration) -> Result<Response<SessionBody>>
    where
        B: Body<Data = Bytes> + Send + Unpin + 'static,
        B::Error: std::fmt::Display + Send,
    {
        match self {
            Handler::Redirect { location } => {
                let mut response = Response::new(SessionBody::empty());
                *response.status_mut() = StatusCode::TEMPORARY_REDIRECT;
                let location = HeaderValue::from_str(&location)
                    .map_err(|e| ProxyError::Http(format!("invalid redirect location: {}", e)))?;
                response.headers_mut().insert(LOCATION, location);
                Ok(response)
            }
            Handler::Direct(info) => {
                let body = serde_json::to_vec(&info)?;
                Ok(with_type(StatusCode::OK, "application/json", body))
            }
            Handler::StaticPayload {
                payload,
                content_type,
            } => Ok(with_type(StatusCode::OK, content_type, payload)),
            Handler::Reject { status, message } => {
                Ok(with_type(status, "text/plain; charset=utf-8", message))
            }
            Handler::Proxy(session) => {
                let (parts, body) = req.into_parts();
                let head = RequestHead {
                    method: parts.method,
                    uri: parts.uri,
                    version: parts.version,
                    headers: parts.headers,
                };

                let (reply_tx, reply_rx) = oneshot::channel();
                let driver = SessionDriver::new(*session, body, reply_tx, connect_timeout);
                tokio::spawn(driver.run(head));

                reply_rx.await.map_err(|_| ProxyError::ClientAborted)
            }
        }
    }
}

fn with_type(status: StatusCode, content_type: &'static str, body: impl Into<Bytes>) -> Response<SessionBody> {
    let mut response = Response::new(SessionBody::full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}
