//! In-process invalidation bus.
//!
//! A thin wrapper over a tokio broadcast channel. Publishing never blocks and
//! never fails; a subscriber that falls behind skips the events it missed,
//! reports the gap to its lag handler and keeps going. Cross-instance delivery is layered on top by a transport
//! bridge that forwards between this bus and an external channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use authedge_core::InvalidationEvent;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const DEFAULT_CAPACITY: usize = 1024;

/// Errors raised by bus transports.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("bus closed")]
    Closed,
}

struct Inner {
    sender: broadcast::Sender<InvalidationEvent>,
    published: AtomicU64,
    lagged: AtomicU64,
}

/// Cloneable handle to a shared broadcast bus.
#[derive(Clone)]
pub struct InvalidationBus {
    inner: Arc<Inner>,
}

impl Default for InvalidationBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl InvalidationBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sender,
                published: AtomicU64::new(0),
                lagged: AtomicU64::new(0),
            }),
        }
    }

    /// Publishes `event` to every current subscriber.
    ///
    /// Returns the number of subscribers that will see it. Zero subscribers
    /// is not an error.
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        self.inner.published.fetch_add(1, Ordering::Relaxed);
        match self.inner.sender.send(event) {
            Ok(receivers) => receivers,
            Err(_) => {
                tracing::trace!("invalidation event published with no subscribers");
                0
            }
        }
    }

    /// Raw receiver, for transports that drive their own loop.
    pub fn receiver(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.inner.sender.subscribe()
    }

    /// Runs `handler` for every event on a dedicated background task.
    ///
    /// The task ends when every bus handle has been dropped.
    pub fn subscribe<F>(&self, name: &'static str, handler: F) -> JoinHandle<()>
    where
        F: Fn(InvalidationEvent) + Send + Sync + 'static,
    {
        self.subscribe_with_lag(name, handler, |_| {})
    }

    /// Like [`subscribe`](Self::subscribe), and calls `on_lag` with the
    /// number of skipped events whenever the subscriber falls behind.
    pub fn subscribe_with_lag<F, L>(&self, name: &'static str, handler: F, on_lag: L) -> JoinHandle<()>
    where
        F: Fn(InvalidationEvent) + Send + Sync + 'static,
        L: Fn(u64) + Send + Sync + 'static,
    {
        let mut receiver = self.receiver();
        let inner = Arc::downgrade(&self.inner);

        tokio::spawn(async move {
            tracing::debug!(subscriber = name, "invalidation subscriber started");
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(RecvError::Lagged(skipped)) => {
                        if let Some(inner) = inner.upgrade() {
                            inner.lagged.fetch_add(skipped, Ordering::Relaxed);
                        }
                        tracing::warn!(
                            subscriber = name,
                            skipped,
                            "invalidation subscriber lagged, events dropped"
                        );
                        on_lag(skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            tracing::debug!(subscriber = name, "invalidation subscriber stopped");
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sender.receiver_count()
    }

    pub fn stats(&self) -> BusStats {
        BusStats {
            published: self.inner.published.load(Ordering::Relaxed),
            lagged: self.inner.lagged.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct BusStats {
    pub published: u64,
    /// Events skipped by lagging subscribers.
    pub lagged: u64,
    pub subscribers: usize,
}
