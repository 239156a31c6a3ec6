//! Response body handed to the client connection.
//!
//! A [`SessionBody`] is either a complete buffer or a bounded stream fed by a
//! session driver. Either way it reports back how delivery ended: the body is
//! dropped by the connection once it is written out or the client goes away,
//! and the attached notifier fires with [`Delivery::Complete`] or
//! [`Delivery::Aborted`] accordingly.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use hyper::body::{Body, Frame, SizeHint};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};

use crate::error::ProxyError;

/// How a response body left the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Every frame was handed to the connection.
    Complete,
    /// The connection dropped the body early or the stream was aborted.
    Aborted,
}

/// Sending half of a streaming body.
#[derive(Debug)]
pub struct BodySender {
    tx: mpsc::Sender<Bytes>,
    aborted: Arc<AtomicBool>,
}

impl BodySender {
    /// Queues a chunk without waiting.
    pub fn try_send(&self, chunk: Bytes) -> Result<(), TrySendError<Bytes>> {
        self.tx.try_send(chunk)
    }

    /// Sends a chunk, waiting for room.
    pub async fn send(&self, chunk: Bytes) -> Result<(), ProxyError> {
        self.tx.send(chunk).await.map_err(|_| ProxyError::ClientAborted)
    }

    /// Waits until a chunk can be queued. Fails once the body was dropped.
    pub async fn ready(&self) -> Result<(), ProxyError> {
        self.tx
            .reserve()
            .await
            .map(drop)
            .map_err(|_| ProxyError::ClientAborted)
    }

    /// Ends the body with an error instead of a clean end of stream.
    pub fn abort(self) {
        self.aborted.store(true, Ordering::Release);
    }
}

enum Kind {
    Full(Option<Bytes>),
    Stream {
        rx: mpsc::Receiver<Bytes>,
        aborted: Arc<AtomicBool>,
    },
}

/// Body of every response produced by the router.
pub struct SessionBody {
    kind: Kind,
    finished: bool,
    remaining: Option<u64>,
    notify: Option<oneshot::Sender<Delivery>>,
}

impl std::fmt::Debug for SessionBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.kind {
            Kind::Full(Some(bytes)) => format!("Full({} bytes)", bytes.len()),
            Kind::Full(None) => "Full(taken)".to_string(),
            Kind::Stream { .. } => "Stream".to_string(),
        };
        f.debug_struct("SessionBody")
            .field("kind", &kind)
            .field("finished", &self.finished)
            .finish()
    }
}

impl SessionBody {
    /// A body with no content.
    pub fn empty() -> Self {
        Self::full(Bytes::new())
    }

    /// A complete, buffered body.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        let finished = bytes.is_empty();
        Self {
            kind: Kind::Full(if finished { None } else { Some(bytes) }),
            finished,
            remaining: None,
            notify: None,
        }
    }

    /// A streaming body with room for `capacity` pending chunks.
    ///
    /// Dropping the sender ends the body; [`BodySender::abort`] fails it.
    pub fn channel(capacity: usize) -> (BodySender, Self) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let aborted = Arc::new(AtomicBool::new(false));
        let body = Self {
            kind: Kind::Stream {
                rx,
                aborted: aborted.clone(),
            },
            finished: false,
            remaining: None,
            notify: None,
        };
        (BodySender { tx, aborted }, body)
    }

    /// Declares the length of a streaming body.
    ///
    /// The body counts as delivered once `len` bytes were yielded, since the
    /// connection stops polling at that point.
    pub fn with_length(mut self, len: u64) -> Self {
        if let Kind::Stream { .. } = self.kind {
            self.remaining = Some(len);
            self.finished = len == 0;
        }
        self
    }

    /// Attaches a notifier fired when the body is dropped.
    pub fn with_notify(mut self, notify: oneshot::Sender<Delivery>) -> Self {
        self.notify = Some(notify);
        self
    }
}

impl Body for SessionBody {
    type Data = Bytes;
    type Error = ProxyError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, ProxyError>>> {
        let this = &mut *self;
        match &mut this.kind {
            Kind::Full(slot) => {
                let data = slot.take();
                this.finished = true;
                Poll::Ready(data.map(|bytes| Ok(Frame::data(bytes))))
            }
            Kind::Stream { rx, aborted } => match rx.poll_recv(cx) {
                Poll::Ready(Some(bytes)) => {
                    if let Some(remaining) = this.remaining.as_mut() {
                        *remaining = remaining.saturating_sub(bytes.len() as u64);
                        this.finished = *remaining == 0;
                    }
                    Poll::Ready(Some(Ok(Frame::data(bytes))))
                }
                // The sender is dropped right after an abort, so this is
                // reached once the queued chunks are drained.
                Poll::Ready(None) if aborted.load(Ordering::Acquire) => {
                    rx.close();
                    Poll::Ready(Some(Err(ProxyError::Origin("response stream aborted".into()))))
                }
                Poll::Ready(None) => {
                    this.finished = true;
                    Poll::Ready(None)
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }

    fn is_end_stream(&self) -> bool {
        match &self.kind {
            Kind::Full(slot) => slot.is_none(),
            Kind::Stream { .. } => self.finished,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match &self.kind {
            Kind::Full(Some(bytes)) => SizeHint::with_exact(bytes.len() as u64),
            Kind::Full(None) => SizeHint::with_exact(0),
            Kind::Stream { .. } => SizeHint::default(),
        }
    }
}

impl Drop for SessionBody {
    fn drop(&mut self) {
        if let Some(notify) = self.notify.take() {
            // A closed, drained and unaborted stream was delivered in full even
            // if the connection never polled its end.
            let drained = match &self.kind {
                Kind::Stream { rx, aborted } => {
                    rx.is_closed() && rx.is_empty() && !aborted.load(Ordering::Acquire)
                }
                Kind::Full(_) => false,
            };
            let delivery = if self.finished || drained {
                Delivery::Complete
            } else {
                Delivery::Aborted
            };
            let _ = notify.send(delivery);
        }
    }
}
