//! Request coalescing (single-flight) for Identity Authority calls.
//!
//! When many requests need the same answer at once, only the first caller
//! for a key (the leader) runs the supplier; everyone who arrives while it is
//! in flight (followers) waits for the same result. Nothing is cached: once
//! the result is delivered the key is idle again and the next caller starts a
//! fresh computation.
//!
//! The supplier runs on its own task. A caller that drops its future only
//! stops waiting; the shared computation carries on for the others.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use authedge_core::PermissionKey;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default ceiling on concurrently tracked keys.
pub const DEFAULT_MAX_IN_FLIGHT: usize = 100_000;

type InFlight<T, E> = DashMap<String, broadcast::Sender<Result<T, E>>>;

/// Outcome of claiming a key.
enum Slot<T, E> {
    Leader(broadcast::Sender<Result<T, E>>),
    Follower(broadcast::Receiver<Result<T, E>>),
    Bypass,
}

/// Removes the in-flight entry when the computation ends, including when
/// the supplier panics.
struct InFlightGuard<T, E> {
    in_flight: Arc<InFlight<T, E>>,
    key: String,
}

impl<T, E> Drop for InFlightGuard<T, E> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.key);
    }
}

/// Snapshot of coalescer counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CoalescerStats {
    pub leaders: u64,
    pub followers: u64,
    /// Calls that ran uncoalesced because the in-flight ceiling was reached.
    pub bypassed: u64,
    pub in_flight: usize,
}

impl CoalescerStats {
    /// Share of calls that piggybacked on another caller, as a percentage.
    pub fn dedup_rate(&self) -> f64 {
        let total = self.leaders + self.followers;
        if total == 0 {
            0.0
        } else {
            (self.followers as f64 / total as f64) * 100.0
        }
    }
}

/// Single-flight map from logical key to in-flight computation.
pub struct Coalescer<T, E> {
    in_flight: Arc<InFlight<T, E>>,
    max_in_flight: usize,
    leaders: AtomicU64,
    followers: AtomicU64,
    bypassed: AtomicU64,
}

impl<T, E> Default for Coalescer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IN_FLIGHT)
    }
}

impl<T, E> Coalescer<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    pub fn new(max_in_flight: usize) -> Self {
        Self {
            in_flight: Arc::new(DashMap::new()),
            max_in_flight: max_in_flight.max(1),
            leaders: AtomicU64::new(0),
            followers: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
        }
    }

    /// Runs `supplier` at most once across all concurrent callers of `key`.
    ///
    /// Every caller attached to the same computation receives a clone of the
    /// same result, error included.
    pub async fn coalesce<F, Fut>(&self, key: impl Into<String>, supplier: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let key = key.into();

        let leader = loop {
            match self.acquire(&key) {
                Slot::Leader(sender) => break Some(sender),
                Slot::Bypass => break None,
                Slot::Follower(mut receiver) => {
                    self.followers.fetch_add(1, Ordering::Relaxed);
                    match receiver.recv().await {
                        Ok(result) => return result,
                        // The leader's task died without a result; take over.
                        Err(_) => {
                            tracing::debug!(key = %key, "coalesced leader vanished, retrying");
                        }
                    }
                }
            }
        };

        let Some(sender) = leader else {
            self.bypassed.fetch_add(1, Ordering::Relaxed);
            return supplier().await;
        };

        self.leaders.fetch_add(1, Ordering::Relaxed);
        let work = supplier();
        let guard = InFlightGuard {
            in_flight: self.in_flight.clone(),
            key,
        };

        let handle = tokio::spawn(async move {
            let result = work.await;
            // Unregister before broadcasting so late arrivals start a fresh
            // computation instead of missing the send.
            drop(guard);
            let _ = sender.send(result.clone());
            result
        });

        match handle.await {
            Ok(result) => result,
            Err(err) => std::panic::resume_unwind(
                err.try_into_panic()
                    .unwrap_or_else(|err| Box::new(err.to_string())),
            ),
        }
    }

    fn acquire(&self, key: &str) -> Slot<T, E> {
        if let Some(sender) = self.in_flight.get(key) {
            return Slot::Follower(sender.subscribe());
        }
        if self.in_flight.len() >= self.max_in_flight {
            return Slot::Bypass;
        }
        match self.in_flight.entry(key.to_string()) {
            Entry::Occupied(entry) => Slot::Follower(entry.get().subscribe()),
            Entry::Vacant(entry) => {
                let (sender, _) = broadcast::channel(1);
                entry.insert(sender.clone());
                Slot::Leader(sender)
            }
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn stats(&self) -> CoalescerStats {
        CoalescerStats {
            leaders: self.leaders.load(Ordering::Relaxed),
            followers: self.followers.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
            in_flight: self.in_flight.len(),
        }
    }
}

/// Key for a permission check.
pub fn permission_key(key: &PermissionKey) -> String {
    key.coalescing_key()
}

/// Key for a token validation, from the token's cache hash.
pub fn token_key(token_hash: u64) -> String {
    format!("jwt:{token_hash:016x}")
}

/// Key for loading every permission of a user.
pub fn user_permissions_key(tenant_id: &str, user_id: &str) -> String {
    format!("user_perms:{}:{tenant_id}:{user_id}", tenant_id.len())
}
