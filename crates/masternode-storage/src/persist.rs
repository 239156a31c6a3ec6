//! Background persistence of cached routes.
//!
//! Disk writes are taken off the request path: the cache hands each new route
//! to a bounded queue drained by a dedicated writer thread. When the queue is
//! full the job is dropped and the route stays memory-only.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use crate::disk::DiskStore;
use crate::error::Result;
use crate::route::CachedRoute;

/// Default number of pending disk writes.
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// What happened to the disk copy of a newly inserted route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    /// The cache has no disk path configured.
    Disabled,
    /// A write job was queued.
    Queued,
    /// The queue was full; the route is memory-only.
    Dropped,
}

/// Counters describing the writer's progress.
#[derive(Debug, Default)]
pub struct PersistStats {
    written: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
}

impl PersistStats {
    /// Routes successfully written.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Writes that failed with an IO error.
    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// Jobs dropped because the queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

enum Job {
    Write(Arc<CachedRoute>),
    Flush(mpsc::Sender<()>),
    /// Parks the writer: acknowledges on the first channel, then waits on the second.
    #[cfg(test)]
    Gate(mpsc::Sender<()>, Receiver<()>),
}

/// Bounded queue feeding a single disk writer thread.
pub struct PersistQueue {
    tx: Option<SyncSender<Job>>,
    worker: Option<JoinHandle<()>>,
    stats: Arc<PersistStats>,
    store: DiskStore,
}

impl std::fmt::Debug for PersistQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistQueue")
            .field("root", &self.store.root())
            .field("written", &self.stats.written())
            .field("failed", &self.stats.failed())
            .field("dropped", &self.stats.dropped())
            .finish()
    }
}

impl PersistQueue {
    /// Starts the writer thread for `store` with room for `depth` pending jobs.
    pub fn spawn(store: DiskStore, depth: usize) -> Result<Self> {
        let (tx, rx) = mpsc::sync_channel(depth.max(1));
        let stats = Arc::new(PersistStats::default());

        let worker = std::thread::Builder::new()
            .name("masternode-persist".into())
            .spawn({
                let store = store.clone();
                let stats = stats.clone();
                move || drain(store, rx, stats)
            })?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            stats,
            store,
        })
    }

    /// Queues a route for writing without blocking.
    pub fn enqueue(&self, route: Arc<CachedRoute>) -> Persistence {
        let Some(tx) = &self.tx else {
            return Persistence::Dropped;
        };

        match tx.try_send(Job::Write(route)) {
            Ok(()) => Persistence::Queued,
            Err(TrySendError::Full(Job::Write(route))) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!(
                    domain = route.domain(),
                    path = route.path(),
                    "Persistence queue full, keeping route in memory only"
                );
                Persistence::Dropped
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("Persistence writer is gone, keeping route in memory only");
                Persistence::Dropped
            }
        }
    }

    /// Blocks until every job queued before this call has been processed.
    pub fn flush(&self) {
        let Some(tx) = &self.tx else {
            return;
        };

        let (ack_tx, ack_rx) = mpsc::channel();
        if tx.send(Job::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Parks the writer thread until the returned sender is used or dropped.
    #[cfg(test)]
    pub(crate) fn stall(&self) -> mpsc::Sender<()> {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        if let Some(tx) = &self.tx {
            if tx.send(Job::Gate(entered_tx, release_rx)).is_ok() {
                let _ = entered_rx.recv();
            }
        }
        release_tx
    }

    /// Writer counters.
    pub fn stats(&self) -> &PersistStats {
        &self.stats
    }

    /// The underlying content store.
    pub fn store(&self) -> &DiskStore {
        &self.store
    }
}

impl Drop for PersistQueue {
    fn drop(&mut self) {
        // Closing the channel lets the writer finish queued jobs and exit.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn drain(store: DiskStore, rx: Receiver<Job>, stats: Arc<PersistStats>) {
    for job in rx {
        match job {
            Job::Write(route) => match store.write(route.content_hash(), &route.content()) {
                Ok(()) => {
                    stats.written.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        domain = route.domain(),
                        path = route.path(),
                        hash = route.content_hash(),
                        "Persisted cached route"
                    );
                }
                Err(e) => {
                    stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        domain = route.domain(),
                        path = route.path(),
                        "Failed to persist cached route: {}",
                        e
                    );
                }
            },
            Job::Flush(ack) => {
                let _ = ack.send(());
            }
            #[cfg(test)]
            Job::Gate(entered, release) => {
                let _ = entered.send(());
                let _ = release.recv();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::HeaderMap;
    use tempfile::TempDir;

    fn route(path: &str, body: &'static [u8]) -> Arc<CachedRoute> {
        Arc::new(CachedRoute::new(
            "example.com",
            path,
            Bytes::from_static(body),
            &HeaderMap::new(),
        ))
    }

    #[test]
    fn queued_routes_are_written_after_flush() {
        let temp = TempDir::new().unwrap();
        let queue = PersistQueue::spawn(DiskStore::open(temp.path()).unwrap(), 8).unwrap();

        let first = route("/a", b"alpha");
        let second = route("/b", b"beta");
        assert_eq!(queue.enqueue(first.clone()), Persistence::Queued);
        assert_eq!(queue.enqueue(second.clone()), Persistence::Queued);
        queue.flush();

        assert_eq!(queue.stats().written(), 2);
        assert_eq!(queue.store().read(first.content_hash()).unwrap(), first.content());
        assert_eq!(queue.store().read(second.content_hash()).unwrap(), second.content());
    }

    #[test]
    fn write_failures_are_counted_not_fatal() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("cache");
        let queue = PersistQueue::spawn(DiskStore::open(&root).unwrap(), 8).unwrap();
        std::fs::remove_dir_all(&root).unwrap();

        assert_eq!(queue.enqueue(route("/a", b"alpha")), Persistence::Queued);
        queue.flush();

        assert_eq!(queue.stats().failed(), 1);
        assert_eq!(queue.stats().written(), 0);

        // The writer keeps running after a failure.
        std::fs::create_dir_all(&root).unwrap();
        queue.enqueue(route("/b", b"beta"));
        queue.flush();
        assert_eq!(queue.stats().written(), 1);
    }

    #[test]
    fn full_queue_drops_the_write() {
        let temp = TempDir::new().unwrap();
        let queue = PersistQueue::spawn(DiskStore::open(temp.path()).unwrap(), 1).unwrap();
        let release = queue.stall();

        let queued = route("/a", b"alpha");
        let dropped = route("/b", b"beta");
        assert_eq!(queue.enqueue(queued.clone()), Persistence::Queued);
        assert_eq!(queue.enqueue(dropped.clone()), Persistence::Dropped);
        assert_eq!(queue.stats().dropped(), 1);

        drop(release);
        queue.flush();
        assert_eq!(queue.stats().written(), 1);
        assert!(queue.store().contains(queued.content_hash()));
        assert!(!queue.store().contains(dropped.content_hash()));
    }

    #[test]
    fn drop_drains_pending_jobs() {
        let temp = TempDir::new().unwrap();
        let store = DiskStore::open(temp.path()).unwrap();
        let entry = route("/a", b"alpha");
        {
            let queue = PersistQueue::spawn(store.clone(), 8).unwrap();
            queue.enqueue(entry.clone());
        }
        assert!(store.contains(entry.content_hash()));
    }
}
