//! Counting bloom filter over the permission policy set.
//!
//! The filter answers "is this permission definitely absent?" without a
//! network hop. It is a per-instance replica kept eventually consistent by
//! permission events on the invalidation bus, and periodically rebuilt from
//! the Identity Authority's canonical policy set.
//!
//! ## Guarantees
//!
//! - No false negatives: a key that was added and not removed always probes
//!   as [`FilterVerdict::MaybePresent`].
//! - Counters saturate at `u8::MAX` and are never decremented afterwards.
//! - A removal that would underflow any counter is rejected and schedules a
//!   rebuild instead.
//! - While a rebuild is pending (and before the first build) every probe is
//!   [`FilterVerdict::Indeterminate`].
//!
//! ## Sizing
//!
//! ```text
//! m = ceil(-n * ln(p) / ln(2)^2)     counters
//! k = round((m / n) * ln(2))         hash functions
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use authedge_core::{
    Action, AuthError, EventKind, IdentityAuthority, InvalidationEvent, PermissionChange,
    PermissionKey, pattern,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use xxhash_rust::xxh3::xxh3_64_with_seed;

use crate::bus::InvalidationBus;

const SEED_PRIMARY: u64 = 0x9E37_79B9_7F4A_7C15;
const SEED_SECONDARY: u64 = 0xC2B2_AE3D_27D4_EB4F;

/// Result of probing the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterVerdict {
    /// Definitely not granted.
    Absent,
    /// Possibly granted; ask someone authoritative.
    MaybePresent,
    /// The filter is rebuilding and cannot answer.
    Indeterminate,
}

#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub expected_insertions: usize,
    pub false_positive_rate: f64,
    /// Removals within `removal_burst_window` that trigger a rebuild.
    pub removal_burst_threshold: u32,
    pub removal_burst_window: Duration,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            expected_insertions: 1_000_000,
            false_positive_rate: 0.0001,
            removal_burst_threshold: 1_000,
            removal_burst_window: Duration::from_secs(10),
        }
    }
}

/// Counter array for one generation.
struct FilterState {
    generation: u64,
    counters: Box<[AtomicU8]>,
    ready: bool,
}

impl FilterState {
    fn empty(generation: u64, size: usize, ready: bool) -> Self {
        Self {
            generation,
            counters: (0..size).map(|_| AtomicU8::new(0)).collect(),
            ready,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mutation {
    Add,
    Remove,
}

/// Writer-side bookkeeping, guarded by one lock so that no mutation can slip
/// between a rebuild's snapshot and its swap.
struct WriteSide {
    /// Generation the next completed rebuild must carry.
    target_generation: u64,
    rebuilding: bool,
    /// Mutations applied since the current rebuild began.
    pending: Vec<(Mutation, PermissionKey)>,
    burst_started: Instant,
    burst_removals: u32,
}

/// Snapshot of filter state for `/cache/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct FilterStats {
    pub generation: u64,
    pub ready: bool,
    pub rebuilding: bool,
    pub counters: usize,
    pub hash_functions: u32,
    /// Net number of keys added.
    pub entries: u64,
    pub estimated_false_positive_rate: f64,
    pub probes: u64,
    pub absent_verdicts: u64,
    pub inconsistencies: u64,
    pub rebuilds: u64,
}

/// Counting bloom filter keyed by canonical [`PermissionKey`] strings.
pub struct PermissionFilter {
    config: FilterConfig,
    num_counters: usize,
    num_hashes: u32,
    state: ArcSwap<FilterState>,
    write: Mutex<WriteSide>,
    rebuilding: AtomicBool,
    rebuild_signal: Notify,
    instance_id: String,
    bus: Option<InvalidationBus>,
    entries: AtomicU64,
    probes: AtomicU64,
    absent: AtomicU64,
    inconsistencies: AtomicU64,
    rebuilds: AtomicU64,
}

impl PermissionFilter {
    /// Creates an unbuilt filter. Probes are indeterminate until the first
    /// [`rebuild`](Self::rebuild) completes.
    pub fn new(config: FilterConfig, instance_id: impl Into<String>) -> Self {
        let (num_counters, num_hashes) =
            optimal_size(config.expected_insertions, config.false_positive_rate);

        Self {
            state: ArcSwap::from_pointee(FilterState::empty(0, num_counters, false)),
            write: Mutex::new(WriteSide {
                target_generation: 0,
                rebuilding: true,
                pending: Vec::new(),
                burst_started: Instant::now(),
                burst_removals: 0,
            }),
            rebuilding: AtomicBool::new(true),
            rebuild_signal: Notify::new(),
            instance_id: instance_id.into(),
            bus: None,
            num_counters,
            num_hashes,
            config,
            entries: AtomicU64::new(0),
            probes: AtomicU64::new(0),
            absent: AtomicU64::new(0),
            inconsistencies: AtomicU64::new(0),
            rebuilds: AtomicU64::new(0),
        }
    }

    /// Publishes local mutations on `bus`.
    #[must_use]
    pub fn with_bus(mut self, bus: InvalidationBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn generation(&self) -> u64 {
        self.state.load().generation
    }

    pub fn is_ready(&self) -> bool {
        self.state.load().ready && !self.rebuilding.load(Ordering::Acquire)
    }

    // -------------------------------------------------------------------------
    // Probes
    // -------------------------------------------------------------------------

    pub fn might_exist(&self, key: &PermissionKey) -> FilterVerdict {
        self.probes.fetch_add(1, Ordering::Relaxed);
        if !self.is_ready() {
            return FilterVerdict::Indeterminate;
        }
        let state = self.state.load();
        let verdict = if self.contains(&state, &key.canonical()) {
            FilterVerdict::MaybePresent
        } else {
            FilterVerdict::Absent
        };
        if verdict == FilterVerdict::Absent {
            self.absent.fetch_add(1, Ordering::Relaxed);
        }
        verdict
    }

    /// Probes `path` and every wildcard pattern that could grant it.
    pub fn might_match(
        &self,
        tenant_id: &str,
        user_id: &str,
        path: &str,
        action: Action,
    ) -> FilterVerdict {
        self.probes.fetch_add(1, Ordering::Relaxed);
        if !self.is_ready() {
            return FilterVerdict::Indeterminate;
        }
        let state = self.state.load();
        let hit = pattern::covering_patterns(path).into_iter().any(|resource| {
            let key = PermissionKey::new(tenant_id, user_id, resource, action);
            self.contains(&state, &key.canonical())
        });
        if hit {
            FilterVerdict::MaybePresent
        } else {
            self.absent.fetch_add(1, Ordering::Relaxed);
            FilterVerdict::Absent
        }
    }

    // -------------------------------------------------------------------------
    // Mutations
    // -------------------------------------------------------------------------

    /// Adds a grant locally and announces it to peers.
    pub fn add(&self, key: &PermissionKey) {
        self.mutate(Mutation::Add, key);
        self.announce(InvalidationEvent::permission_granted(key));
    }

    /// Removes a grant locally and announces it to peers.
    ///
    /// Returns `false` when the removal was rejected as inconsistent.
    pub fn remove(&self, key: &PermissionKey) -> bool {
        let applied = self.mutate(Mutation::Remove, key);
        self.announce(InvalidationEvent::permission_revoked(key));
        applied
    }

    /// Applies a peer's permission event without re-publishing it.
    ///
    /// Events from this instance and non-permission events are ignored.
    pub fn apply_event(&self, event: &InvalidationEvent) {
        if event.kind != EventKind::Permission || event.is_from(&self.instance_id) {
            return;
        }
        let Some(key) = event.permission_key() else {
            tracing::debug!(tenant = %event.tenant_id, "permission event without a full key");
            return;
        };
        match event.change {
            Some(PermissionChange::Granted) => {
                self.mutate(Mutation::Add, &key);
            }
            Some(PermissionChange::Revoked) => {
                self.mutate(Mutation::Remove, &key);
            }
            None => {}
        }
    }

    fn announce(&self, event: InvalidationEvent) {
        if let Some(bus) = &self.bus {
            bus.publish(event.with_origin(&self.instance_id));
        }
    }

    fn mutate(&self, mutation: Mutation, key: &PermissionKey) -> bool {
        let canonical = key.canonical();
        let mut write = self.write.lock();
        let state = self.state.load();

        let applied = match mutation {
            Mutation::Add => {
                self.increment(&state, &canonical);
                self.entries.fetch_add(1, Ordering::Relaxed);
                true
            }
            Mutation::Remove => {
                let applied = self.decrement(&state, &canonical);
                if applied {
                    let _ = self.entries.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| {
                        Some(n.saturating_sub(1))
                    });
                }
                applied
            }
        };

        if write.rebuilding {
            write.pending.push((mutation, key.clone()));
        } else if mutation == Mutation::Remove && state.ready {
            if !applied {
                self.inconsistencies.fetch_add(1, Ordering::Relaxed);
                let err = AuthError::filter_inconsistency(canonical);
                tracing::warn!(error = %err, "rejected filter removal, scheduling rebuild");
                self.begin_rebuild_locked(&mut write);
            } else if self.removal_burst(&mut write) {
                tracing::info!(
                    threshold = self.config.removal_burst_threshold,
                    "permission removal burst, scheduling rebuild"
                );
                self.begin_rebuild_locked(&mut write);
            }
        }

        applied
    }

    fn removal_burst(&self, write: &mut WriteSide) -> bool {
        let now = Instant::now();
        if now.duration_since(write.burst_started) > self.config.removal_burst_window {
            write.burst_started = now;
            write.burst_removals = 0;
        }
        write.burst_removals += 1;
        write.burst_removals > self.config.removal_burst_threshold
    }

    // -------------------------------------------------------------------------
    // Rebuilds
    // -------------------------------------------------------------------------

    /// Bumps the generation and wakes the rebuild worker.
    ///
    /// Probes are indeterminate until [`rebuild`](Self::rebuild) is called
    /// with the returned generation.
    pub fn request_rebuild(&self) -> u64 {
        let mut write = self.write.lock();
        self.begin_rebuild_locked(&mut write)
    }

    fn begin_rebuild_locked(&self, write: &mut WriteSide) -> u64 {
        write.target_generation += 1;
        write.rebuilding = true;
        write.pending.clear();
        write.burst_removals = 0;
        self.rebuilding.store(true, Ordering::Release);
        self.rebuild_signal.notify_one();
        write.target_generation
    }

    /// Generation the rebuild worker should build next.
    pub fn target_generation(&self) -> u64 {
        self.write.lock().target_generation
    }

    /// Installs a fresh counter array built from `source`.
    ///
    /// Mutations that arrived since the rebuild began are replayed onto it.
    /// Returns `false` (and discards the work) when a newer rebuild has been
    /// requested in the meantime.
    pub fn rebuild<I>(&self, generation: u64, source: I) -> bool
    where
        I: IntoIterator<Item = PermissionKey>,
    {
        let fresh = FilterState::empty(generation, self.num_counters, true);
        let mut entries = 0u64;
        for key in source {
            self.increment(&fresh, &key.canonical());
            entries += 1;
        }

        let mut write = self.write.lock();
        if write.target_generation != generation {
            tracing::debug!(
                generation,
                target = write.target_generation,
                "discarding stale filter rebuild"
            );
            return false;
        }

        for (mutation, key) in write.pending.drain(..) {
            let canonical = key.canonical();
            match mutation {
                Mutation::Add => {
                    self.increment(&fresh, &canonical);
                    entries += 1;
                }
                Mutation::Remove => {
                    if self.decrement(&fresh, &canonical) {
                        entries = entries.saturating_sub(1);
                    }
                }
            }
        }

        self.state.store(Arc::new(fresh));
        self.entries.store(entries, Ordering::Relaxed);
        write.rebuilding = false;
        self.rebuilding.store(false, Ordering::Release);
        self.rebuilds.fetch_add(1, Ordering::Relaxed);

        tracing::info!(generation, entries, "permission filter rebuilt");
        true
    }

    /// Waits until a rebuild is requested.
    pub async fn rebuild_requested(&self) {
        self.rebuild_signal.notified().await;
    }

    // -------------------------------------------------------------------------
    // Counters
    // -------------------------------------------------------------------------

    fn indexes(&self, canonical: &str) -> impl Iterator<Item = usize> + use<> {
        let bytes = canonical.as_bytes();
        let h1 = xxh3_64_with_seed(bytes, SEED_PRIMARY);
        let h2 = xxh3_64_with_seed(bytes, SEED_SECONDARY) | 1;
        let m = self.num_counters as u64;
        (0..u64::from(self.num_hashes))
            .map(move |i| (h1.wrapping_add(i.wrapping_mul(h2)) % m) as usize)
    }

    fn contains(&self, state: &FilterState, canonical: &str) -> bool {
        self.indexes(canonical)
            .all(|idx| state.counters[idx].load(Ordering::Relaxed) > 0)
    }

    fn increment(&self, state: &FilterState, canonical: &str) {
        for idx in self.indexes(canonical) {
            let _ = state.counters[idx].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                c.checked_add(1)
            });
        }
    }

    /// Decrements every counter of `canonical`, unless one of them is zero.
    /// Saturated counters are left alone.
    fn decrement(&self, state: &FilterState, canonical: &str) -> bool {
        if !self.contains(state, canonical) {
            return false;
        }
        for idx in self.indexes(canonical) {
            let _ = state.counters[idx].fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                (c > 0 && c < u8::MAX).then(|| c - 1)
            });
        }
        true
    }

    pub fn stats(&self) -> FilterStats {
        let state = self.state.load();
        let entries = self.entries.load(Ordering::Relaxed);
        let k = f64::from(self.num_hashes);
        let fill = 1.0 - (-k * entries as f64 / self.num_counters as f64).exp();

        FilterStats {
            generation: state.generation,
            ready: state.ready,
            rebuilding: self.rebuilding.load(Ordering::Acquire),
            counters: self.num_counters,
            hash_functions: self.num_hashes,
            entries,
            estimated_false_positive_rate: fill.powf(k),
            probes: self.probes.load(Ordering::Relaxed),
            absent_verdicts: self.absent.load(Ordering::Relaxed),
            inconsistencies: self.inconsistencies.load(Ordering::Relaxed),
            rebuilds: self.rebuilds.load(Ordering::Relaxed),
        }
    }
}

/// `(m, k)` for `n` expected insertions at false-positive rate `p`.
pub fn optimal_size(expected_insertions: usize, false_positive_rate: f64) -> (usize, u32) {
    let ln2 = std::f64::consts::LN_2;
    let n = expected_insertions.max(1) as f64;
    let p = false_positive_rate.clamp(1e-9, 0.5);

    let m = (-n * p.ln() / (ln2 * ln2)).ceil().max(64.0);
    let k = ((m / n) * ln2).round().clamp(1.0, 32.0);
    (m as usize, k as u32)
}

/// Applies permission events from peers to `filter`.
///
/// Missed events leave the replica behind its peers, so a lagging
/// subscriber schedules a rebuild.
pub fn attach_to_bus(filter: Arc<PermissionFilter>, bus: &InvalidationBus) -> JoinHandle<()> {
    let lagging = filter.clone();
    bus.subscribe_with_lag(
        "permission-filter",
        move |event| filter.apply_event(&event),
        move |skipped| {
            tracing::warn!(skipped, "permission filter missed events, scheduling rebuild");
            lagging.request_rebuild();
        },
    )
}

/// Rebuilds `filter` from `authority` whenever a rebuild is requested.
///
/// Requests the first build immediately. Fetch failures are retried with
/// exponential backoff; a request that arrives meanwhile supersedes the
/// generation being fetched.
pub fn spawn_rebuild_worker<A>(filter: Arc<PermissionFilter>, authority: Arc<A>) -> JoinHandle<()>
where
    A: IdentityAuthority + ?Sized + 'static,
{
    const INITIAL_BACKOFF: Duration = Duration::from_millis(500);
    const MAX_BACKOFF: Duration = Duration::from_secs(60);

    filter.request_rebuild();

    tokio::spawn(async move {
        loop {
            filter.rebuild_requested().await;

            let mut backoff = INITIAL_BACKOFF;
            loop {
                let generation = filter.target_generation();
                match authority.list_permissions().await {
                    Ok(policies) => {
                        filter.rebuild(generation, policies);
                        break;
                    }
                    Err(e) => {
                        tracing::error!(
                            error = %e,
                            generation,
                            backoff_ms = backoff.as_millis() as u64,
                            "filter rebuild failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(MAX_BACKOFF);
                    }
                }
            }
        }
    })
}
