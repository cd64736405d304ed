//! L1 token cache: bearer token → authority-confirmed [`UserContext`].
//!
//! Entries are keyed by a 64-bit xxh3 hash of the token, never the token
//! itself. Storage is a moka cache (TinyLFU admission, per-entry expiry);
//! each entry's TTL comes from the adaptive TTL controller and is capped by
//! the context's own `expires_at`.
//!
//! A secondary index `(tenant, user) → token hashes` lets invalidation
//! events that name a user (or a whole tenant) drop every cached context
//! belonging to them without scanning the cache.
//!
//! Token events are also recorded in a [`RevocationList`], since a revoked
//! token would otherwise validate again on the next miss. A load that
//! overlaps an invalidation of the same user is returned to its callers but
//! not cached.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use authedge_core::{AuthorityError, EventKind, InvalidationEvent, UserContext};
use dashmap::DashMap;
use moka::Expiry;
use moka::notification::RemovalCause;
use moka::sync::Cache;
use serde::Serialize;
use time::OffsetDateTime;
use xxhash_rust::xxh3::xxh3_64;

use crate::adaptive_ttl::AdaptiveTtlController;
use crate::coalesce::{self, Coalescer};
use crate::revocation::{RevocationConfig, RevocationList, RevocationStats};

/// How long invalidation marks outlive the invalidation. Far longer than any
/// bounded authority call.
const INVALIDATION_MARK_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct TokenCacheConfig {
    pub max_entries: u64,
    /// Starting TTL handed to the adaptive controller.
    pub base_ttl: Duration,
    /// How long revocations are remembered at most.
    pub revocation_ttl: Duration,
}

impl Default for TokenCacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            base_ttl: Duration::from_secs(300),
            revocation_ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// A cached value with its access bookkeeping.
///
/// The TTL is fixed at insertion and never extended.
#[derive(Debug)]
pub struct CacheEntry<V> {
    value: V,
    inserted_at: Instant,
    /// Nanoseconds after `inserted_at` of the latest hit.
    last_access_nanos: AtomicU64,
    access_count: AtomicU64,
    ttl: Duration,
}

impl<V> CacheEntry<V> {
    pub fn new(value: V, ttl: Duration) -> Self {
        Self {
            value,
            inserted_at: Instant::now(),
            last_access_nanos: AtomicU64::new(0),
            access_count: AtomicU64::new(0),
            ttl,
        }
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn inserted_at(&self) -> Instant {
        self.inserted_at
    }

    pub fn expires_at(&self) -> Instant {
        self.inserted_at + self.ttl
    }

    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at()
    }

    pub fn last_access_at(&self) -> Instant {
        self.inserted_at + Duration::from_nanos(self.last_access_nanos.load(Ordering::Relaxed))
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }

    fn touch(&self, now: Instant) {
        let since = now.saturating_duration_since(self.inserted_at);
        let nanos = u64::try_from(since.as_nanos()).unwrap_or(u64::MAX);
        self.last_access_nanos.fetch_max(nanos, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }
}

type ContextEntry = Arc<CacheEntry<Arc<UserContext>>>;

/// Hands moka each entry's own TTL.
struct EntryExpiry;

impl Expiry<u64, ContextEntry> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &u64,
        value: &ContextEntry,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &u64,
        value: &ContextEntry,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Hash used as the cache key for `token`.
#[inline]
pub fn token_hash(token: &str) -> u64 {
    xxh3_64(token.as_bytes())
}

/// Hex form of [`token_hash`], as carried in single-token revocation events.
pub fn token_id(token: &str) -> String {
    format!("{:016x}", token_hash(token))
}

/// Statistics for the token cache.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TokenCacheStats {
    pub size: u64,
    pub max_entries: u64,
    pub hits: u64,
    pub misses: u64,
    /// Contexts fetched from the authority.
    pub loads: u64,
    /// Entries removed for size or expiry.
    pub evictions: u64,
    pub indexed_users: usize,
    /// Loads not cached because the user was invalidated meanwhile.
    pub stale_loads: u64,
    pub revocations: RevocationStats,
}

impl TokenCacheStats {
    /// Calculate hit rate as a percentage.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

type UserKey = (String, String);

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    stale_loads: AtomicU64,
    evictions: Arc<AtomicU64>,
}

/// Cloneable handle; clones share storage.
#[derive(Clone)]
pub struct TokenCache {
    entries: Cache<u64, ContextEntry>,
    user_index: Arc<DashMap<UserKey, HashSet<u64>>>,
    revoked: RevocationList,
    /// Bumped by every user or tenant invalidation.
    epoch: Arc<AtomicU64>,
    /// Epoch of the latest full clear.
    cleared_at: Arc<AtomicU64>,
    user_marks: Cache<UserKey, u64>,
    tenant_marks: Cache<String, u64>,
    counters: Arc<Counters>,
    adaptive: Arc<AdaptiveTtlController<u64>>,
    loads: Arc<Coalescer<Arc<UserContext>, AuthorityError>>,
    config: TokenCacheConfig,
}

impl TokenCache {
    pub fn new(
        config: TokenCacheConfig,
        adaptive: Arc<AdaptiveTtlController<u64>>,
        loads: Arc<Coalescer<Arc<UserContext>, AuthorityError>>,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let evictions = counters.evictions.clone();

        let entries = Cache::builder()
            .max_capacity(config.max_entries)
            .expire_after(EntryExpiry)
            .eviction_listener(move |_hash: Arc<u64>, _entry: ContextEntry, cause: RemovalCause| {
                if cause.was_evicted() {
                    evictions.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        let revoked = RevocationList::new(RevocationConfig {
            max_entries: config.max_entries,
            ttl: config.revocation_ttl,
        });

        Self {
            entries,
            user_index: Arc::new(DashMap::new()),
            revoked,
            epoch: Arc::new(AtomicU64::new(0)),
            cleared_at: Arc::new(AtomicU64::new(0)),
            user_marks: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(INVALIDATION_MARK_TTL)
                .build(),
            tenant_marks: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(INVALIDATION_MARK_TTL)
                .build(),
            counters,
            adaptive,
            loads,
            config,
        }
    }

    pub fn config(&self) -> &TokenCacheConfig {
        &self.config
    }

    /// Returns the cached context for `token`, if present and unexpired.
    pub fn get(&self, token: &str) -> Option<Arc<UserContext>> {
        self.get_hashed(token_hash(token))
    }

    fn get_hashed(&self, hash: u64) -> Option<Arc<UserContext>> {
        let now = Instant::now();
        match self.entries.get(&hash) {
            Some(entry) if !entry.is_expired_at(now) && !entry.value.is_expired() => {
                entry.touch(now);
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.adaptive.record_access(&hash);
                Some(entry.value.clone())
            }
            Some(_) => {
                self.entries.invalidate(&hash);
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Caches `ctx` for at most `ttl`, and never past `ctx.expires_at`.
    ///
    /// Returns `false` when nothing was cached because the context has
    /// already expired or its token was revoked.
    pub fn put(&self, token: &str, ctx: Arc<UserContext>, ttl: Duration) -> bool {
        let hash = token_hash(token);
        if self.revoked.is_revoked(hash, &ctx) {
            return false;
        }
        self.put_hashed(hash, ctx, ttl)
    }

    pub fn revocations(&self) -> &RevocationList {
        &self.revoked
    }

    fn put_hashed(&self, hash: u64, ctx: Arc<UserContext>, ttl: Duration) -> bool {
        let Some(remaining) = ctx.remaining_lifetime() else {
            tracing::debug!(user_id = %ctx.user_id, "not caching expired user context");
            return false;
        };
        let ttl = ttl.min(remaining);
        if ttl.is_zero() {
            return false;
        }

        let user = (ctx.tenant_id.clone(), ctx.user_id.clone());
        self.entries.insert(hash, Arc::new(CacheEntry::new(ctx, ttl)));
        self.user_index.entry(user).or_default().insert(hash);
        true
    }

    /// Returns the cached context, or loads it once for all concurrent
    /// callers of the same token.
    ///
    /// The loaded context is cached with the adaptive TTL for the token.
    /// Revoked tokens are rejected as invalid, whether or not the loader
    /// still accepts them.
    pub async fn get_or_load<F, Fut>(
        &self,
        token: &str,
        loader: F,
    ) -> Result<Arc<UserContext>, AuthorityError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<UserContext, AuthorityError>> + Send + 'static,
    {
        let hash = token_hash(token);
        if let Some(ctx) = self.get_hashed(hash) {
            return Ok(ctx);
        }

        if self.revoked.is_token_revoked(hash) {
            return Err(revoked_token());
        }

        let cache = self.clone();
        self.loads
            .coalesce(coalesce::token_key(hash), move || {
                let started = cache.epoch.load(Ordering::Acquire);
                let load = loader();
                async move {
                    let ctx = Arc::new(load.await?);
                    cache.counters.loads.fetch_add(1, Ordering::Relaxed);
                    if cache.revoked.is_revoked(hash, &ctx) {
                        return Err(revoked_token());
                    }

                    let ttl = cache.adaptive.compute_ttl(&hash, cache.config.base_ttl);
                    if cache.put_hashed(hash, ctx.clone(), ttl)
                        && (cache.invalidated_since(started, &ctx) || cache.revoked.is_revoked(hash, &ctx))
                    {
                        cache.invalidate_hash(hash);
                        cache.counters.stale_loads.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(user_id = %ctx.user_id, "user invalidated during load, not cached");
                    }
                    Ok(ctx)
                }
            })
            .await
    }

    fn invalidated_since(&self, epoch: u64, ctx: &UserContext) -> bool {
        if self.cleared_at.load(Ordering::Acquire) > epoch {
            return true;
        }
        let user = (ctx.tenant_id.clone(), ctx.user_id.clone());
        self.user_marks.get(&user).is_some_and(|mark| mark > epoch)
            || self.tenant_marks.get(&ctx.tenant_id).is_some_and(|mark| mark > epoch)
    }

    fn next_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drops the cached context for `token`.
    pub fn invalidate(&self, token: &str) {
        self.invalidate_hash(token_hash(token));
    }

    fn invalidate_hash(&self, hash: u64) {
        self.entries.invalidate(&hash);
        self.adaptive.clear(&hash);
    }

    /// Drops every cached context of one user. Returns how many were live.
    pub fn invalidate_user(&self, tenant_id: &str, user_id: &str) -> usize {
        let key = (tenant_id.to_string(), user_id.to_string());
        self.user_marks.insert(key.clone(), self.next_epoch());
        let Some((_, hashes)) = self.user_index.remove(&key) else {
            return 0;
        };

        let mut dropped = 0;
        for hash in hashes {
            if self.entries.contains_key(&hash) {
                dropped += 1;
            }
            self.invalidate_hash(hash);
        }
        dropped
    }

    /// Drops every cached context of a tenant.
    pub fn invalidate_tenant(&self, tenant_id: &str) -> usize {
        self.tenant_marks.insert(tenant_id.to_string(), self.next_epoch());
        let users: Vec<UserKey> = self
            .user_index
            .iter()
            .filter(|entry| entry.key().0 == tenant_id)
            .map(|entry| entry.key().clone())
            .collect();

        users
            .iter()
            .map(|(tenant, user)| self.invalidate_user(tenant, user))
            .sum()
    }

    /// Drops every cached context, e.g. after missing invalidation events.
    pub fn invalidate_all(&self) {
        self.cleared_at.store(self.next_epoch(), Ordering::Release);
        self.user_index.clear();
        self.entries.invalidate_all();
    }

    /// Applies an invalidation event. Returns how many contexts were dropped.
    ///
    /// Token events carrying a `token_id` revoke and drop just that token;
    /// other token events revoke every token the named user (or tenant) was
    /// issued up to now. Every other event drops the named user's contexts,
    /// or the whole tenant's when no user is named.
    pub fn apply_event(&self, event: &InvalidationEvent) -> usize {
        let single_token = match event.kind {
            EventKind::Token => event
                .token_id
                .as_deref()
                .and_then(|id| u64::from_str_radix(id, 16).ok()),
            _ => None,
        };
        if let Some(hash) = single_token {
            let lifetime = self
                .entries
                .get(&hash)
                .and_then(|entry| entry.value.remaining_lifetime());
            self.revoked.revoke_token(hash, lifetime);
            let live = usize::from(self.entries.contains_key(&hash));
            self.invalidate_hash(hash);
            return live;
        }

        if event.kind == EventKind::Token {
            let revoked_at = event.occurred_at.max(OffsetDateTime::now_utc());
            match &event.user_id {
                Some(user_id) => self.revoked.revoke_user(&event.tenant_id, user_id, revoked_at),
                None => self.revoked.revoke_tenant(&event.tenant_id, revoked_at),
            }
        }

        let dropped = match &event.user_id {
            Some(user_id) => self.invalidate_user(&event.tenant_id, user_id),
            None => self.invalidate_tenant(&event.tenant_id),
        };
        tracing::debug!(
            kind = event.kind.as_str(),
            tenant = %event.tenant_id,
            user = ?event.user_id,
            dropped,
            "applied invalidation event"
        );
        dropped
    }

    /// Runs moka's deferred housekeeping and drops index entries for
    /// tokens that are no longer cached. Returns the number of stale hashes
    /// removed from the index.
    pub fn run_maintenance(&self) -> usize {
        self.entries.run_pending_tasks();
        self.revoked.run_pending_tasks();
        self.user_marks.run_pending_tasks();
        self.tenant_marks.run_pending_tasks();

        let mut stale = 0;
        self.user_index.retain(|_, hashes| {
            let before = hashes.len();
            hashes.retain(|hash| self.entries.contains_key(hash));
            stale += before - hashes.len();
            !hashes.is_empty()
        });
        stale
    }

    pub fn len(&self) -> u64 {
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> TokenCacheStats {
        TokenCacheStats {
            size: self.entries.entry_count(),
            max_entries: self.config.max_entries,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            loads: self.counters.loads.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
            indexed_users: self.user_index.len(),
            stale_loads: self.counters.stale_loads.load(Ordering::Relaxed),
            revocations: self.revoked.stats(),
        }
    }
}

fn revoked_token() -> AuthorityError {
    AuthorityError::InvalidToken("token has been revoked".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adaptive_ttl::AdaptiveTtlConfig;
    use time::OffsetDateTime;

    fn cache() -> TokenCache {
        TokenCache::new(
            TokenCacheConfig {
                max_entries: 1_000,
                base_ttl: Duration::from_secs(300),
                ..TokenCacheConfig::default()
            },
            Arc::new(AdaptiveTtlController::new(AdaptiveTtlConfig::default())),
            Arc::new(Coalescer::default()),
        )
    }

    fn ctx(tenant: &str, user: &str, lifetime: time::Duration) -> Arc<UserContext> {
        Arc::new(UserContext::new(
            user,
            tenant,
            OffsetDateTime::now_utc() + lifetime,
        ))
    }

    #[test]
    fn test_put_and_get() {
        let cache = cache();
        assert!(cache.put("tok", ctx("t1", "u1", time::Duration::hours(1)), Duration::from_secs(60)));

        assert_eq!(cache.get("tok").unwrap().user_id, "u1");
        assert!(cache.get("other").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 50.0).abs() < 0.001);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = cache();
        cache.put("tok", ctx("t1", "u1", time::Duration::hours(1)), Duration::from_millis(100));

        assert!(cache.get("tok").is_some());
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get("tok").is_none());
    }

    #[test]
    fn test_ttl_capped_by_context_expiry() {
        let cache = cache();
        cache.put("tok", ctx("t1", "u1", time::Duration::milliseconds(100)), Duration::from_secs(600));

        assert!(cache.get("tok").is_some());
        std::thread::sleep(Duration::from_millis(150));
        assert!(cache.get("tok").is_none());
    }

    #[test]
    fn test_expired_context_not_cached() {
        let cache = cache();
        assert!(!cache.put("tok", ctx("t1", "u1", time::Duration::seconds(-5)), Duration::from_secs(60)));
        assert!(cache.get("tok").is_none());
    }

    #[test]
    fn test_invalidate_user_drops_every_token() {
        let cache = cache();
        let ttl = Duration::from_secs(60);
        cache.put("a", ctx("t1", "u1", time::Duration::hours(1)), ttl);
        cache.put("b", ctx("t1", "u1", time::Duration::hours(1)), ttl);
        cache.put("c", ctx("t1", "u2", time::Duration::hours(1)), ttl);

        assert_eq!(cache.invalidate_user("t1", "u1"), 2);
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_some());
    }

    #[test]
    fn test_events() {
        let cache = cache();
        let ttl = Duration::from_secs(60);
        cache.put("a", ctx("t1", "u1", time::Duration::hours(1)), ttl);
        cache.put("b", ctx("t1", "u1", time::Duration::hours(1)), ttl);
        cache.put("c", ctx("t1", "u2", time::Duration::hours(1)), ttl);
        cache.put("d", ctx("t2", "u3", time::Duration::hours(1)), ttl);

        let single = InvalidationEvent::single_token_revoked("t1", "u1", token_id("a"));
        assert_eq!(cache.apply_event(&single), 1);
        assert!(cache.get("b").is_some());

        assert_eq!(cache.apply_event(&InvalidationEvent::role_changed("t1", None)), 2);
        assert!(cache.get("b").is_none());
        assert!(cache.get("c").is_none());
        assert!(cache.get("d").is_some());
    }

    #[test]
    fn test_maintenance_prunes_index() {
        let cache = cache();
        cache.put("a", ctx("t1", "u1", time::Duration::hours(1)), Duration::from_secs(60));
        cache.invalidate("a");

        assert_eq!(cache.run_maintenance(), 1);
        assert_eq!(cache.stats().indexed_users, 0);
    }

    #[tokio::test]
    async fn test_get_or_load_populates() {
        let cache = cache();
        let loaded = cache
            .get_or_load("tok", || async {
                Ok(UserContext::new("u1", "t1", OffsetDateTime::now_utc() + time::Duration::hours(1)))
            })
            .await
            .unwrap();
        assert_eq!(loaded.user_id, "u1");

        let again = cache
            .get_or_load("tok", || async { Err(AuthorityError::Unavailable("unused".into())) })
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&loaded, &again));
        assert_eq!(cache.stats().loads, 1);
    }

    fn valid_context() -> UserContext {
        UserContext::new("u1", "t1", OffsetDateTime::now_utc() + time::Duration::hours(1))
            .with_issued_at(OffsetDateTime::now_utc() - time::Duration::minutes(1))
    }

    #[tokio::test]
    async fn test_revoked_token_is_not_reloaded() {
        let cache = cache();
        cache
            .get_or_load("tok", || async { Ok(valid_context()) })
            .await
            .unwrap();

        cache.apply_event(&InvalidationEvent::single_token_revoked("t1", "u1", token_id("tok")));

        // The loader would still accept the token.
        let result = cache.get_or_load("tok", || async { Ok(valid_context()) }).await;
        assert!(matches!(result, Err(AuthorityError::InvalidToken(_))));
        assert_eq!(cache.stats().loads, 1);
        assert!(!cache.put("tok", Arc::new(valid_context()), Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_user_revocation_rejects_older_tokens_only() {
        let cache = cache();
        cache.apply_event(&InvalidationEvent::token_revoked("t1", "u1"));

        let old = cache.get_or_load("old", || async { Ok(valid_context()) }).await;
        assert!(matches!(old, Err(AuthorityError::InvalidToken(_))));
        assert!(cache.get("old").is_none());

        let fresh = cache
            .get_or_load("fresh", || async {
                Ok(valid_context().with_issued_at(OffsetDateTime::now_utc() + time::Duration::seconds(5)))
            })
            .await;
        assert!(fresh.is_ok());
        assert!(cache.get("fresh").is_some());
    }

    #[tokio::test]
    async fn test_invalidation_during_load_is_not_overwritten() {
        let cache = cache();
        let (release, wait) = tokio::sync::oneshot::channel::<()>();

        let loading = {
            let cache = cache.clone();
            tokio::spawn(async move {
                cache
                    .get_or_load("tok", move || async move {
                        let _ = wait.await;
                        Ok(valid_context())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.apply_event(&InvalidationEvent::role_changed("t1", Some("u1".into())));
        let _ = release.send(());

        assert!(loading.await.unwrap().is_ok());
        assert!(cache.get("tok").is_none());
        assert_eq!(cache.stats().stale_loads, 1);

        // Loads that start after the invalidation are cached again.
        cache.get_or_load("tok", || async { Ok(valid_context()) }).await.unwrap();
        assert!(cache.get("tok").is_some());
    }

    #[test]
    fn test_invalidate_all() {
        let cache = cache();
        let ttl = Duration::from_secs(60);
        cache.put("a", ctx("t1", "u1", time::Duration::hours(1)), ttl);
        cache.put("b", ctx("t2", "u2", time::Duration::hours(1)), ttl);

        cache.invalidate_all();
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_none());
        assert_eq!(cache.stats().indexed_users, 0);
    }

    #[tokio::test]
    async fn test_get_or_load_propagates_rejection() {
        let cache = cache();
        let result = cache
            .get_or_load("bad", || async { Err(AuthorityError::InvalidToken("nope".into())) })
            .await;
        assert_eq!(result, Err(AuthorityError::InvalidToken("nope".into())));
        assert!(cache.is_empty());
    }
}
