//! Revoked bearer tokens.
//!
//! A signed token stays valid until its `exp`, so dropping its cached
//! context is not enough: the next request would decode it again and be let
//! through. The list remembers single revoked tokens by cache hash, and
//! "revoked before" instants per user and per tenant, for as long as a
//! revoked token could still be presented.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use authedge_core::UserContext;
use moka::Expiry;
use moka::sync::Cache;
use serde::Serialize;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct RevocationConfig {
    pub max_entries: u64,
    /// Longest a revocation is remembered; should cover the longest token
    /// lifetime the authority issues.
    pub ttl: Duration,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            max_entries: 100_000,
            ttl: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Each revoked token is kept for its own remaining lifetime.
struct RemainingLifetime;

impl Expiry<u64, Duration> for RemainingLifetime {
    fn expire_after_create(&self, _key: &u64, ttl: &Duration, _created_at: Instant) -> Option<Duration> {
        Some(*ttl)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RevocationStats {
    pub revoked_tokens: u64,
    pub revoked_users: u64,
    pub revoked_tenants: u64,
    /// Presented tokens rejected as revoked.
    pub blocked: u64,
}

/// Cloneable handle; clones share storage.
#[derive(Clone)]
pub struct RevocationList {
    tokens: Cache<u64, Duration>,
    users: Cache<(String, String), OffsetDateTime>,
    tenants: Cache<String, OffsetDateTime>,
    ttl: Duration,
    blocked: Arc<AtomicU64>,
}

impl Default for RevocationList {
    fn default() -> Self {
        Self::new(RevocationConfig::default())
    }
}

impl RevocationList {
    pub fn new(config: RevocationConfig) -> Self {
        Self {
            tokens: Cache::builder()
                .max_capacity(config.max_entries)
                .expire_after(RemainingLifetime)
                .build(),
            users: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl)
                .build(),
            tenants: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl)
                .build(),
            ttl: config.ttl,
            blocked: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Revokes one token. `lifetime` is how long it would otherwise stay
    /// valid, when known.
    pub fn revoke_token(&self, hash: u64, lifetime: Option<Duration>) {
        let ttl = lifetime.map_or(self.ttl, |left| left.min(self.ttl));
        if !ttl.is_zero() {
            self.tokens.insert(hash, ttl);
        }
    }

    /// Revokes every token of a user issued at or before `at`.
    pub fn revoke_user(&self, tenant_id: &str, user_id: &str, at: OffsetDateTime) {
        self.users
            .entry((tenant_id.to_string(), user_id.to_string()))
            .and_upsert_with(|existing| existing.map_or(at, |entry| (*entry.value()).max(at)));
    }

    /// Revokes every token of a tenant issued at or before `at`.
    pub fn revoke_tenant(&self, tenant_id: &str, at: OffsetDateTime) {
        self.tenants
            .entry(tenant_id.to_string())
            .and_upsert_with(|existing| existing.map_or(at, |entry| (*entry.value()).max(at)));
    }

    pub fn is_token_revoked(&self, hash: u64) -> bool {
        let revoked = self.tokens.contains_key(&hash);
        if revoked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
        revoked
    }

    /// Whether `ctx`, loaded for the token with `hash`, has been revoked.
    ///
    /// A context without an issue time cannot be told apart from the tokens
    /// a user-wide revocation targeted, so it counts as revoked while the
    /// mark lasts.
    pub fn is_revoked(&self, hash: u64, ctx: &UserContext) -> bool {
        if self.is_token_revoked(hash) {
            return true;
        }
        let user_mark = self
            .users
            .get(&(ctx.tenant_id.clone(), ctx.user_id.clone()));
        let tenant_mark = self.tenants.get(&ctx.tenant_id);
        let revoked = [user_mark, tenant_mark]
            .into_iter()
            .flatten()
            .any(|revoked_at| ctx.issued_at.is_none_or(|issued| issued <= revoked_at));
        if revoked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
        revoked
    }

    pub fn run_pending_tasks(&self) {
        self.tokens.run_pending_tasks();
        self.users.run_pending_tasks();
        self.tenants.run_pending_tasks();
    }

    pub fn stats(&self) -> RevocationStats {
        RevocationStats {
            revoked_tokens: self.tokens.entry_count(),
            revoked_users: self.users.entry_count(),
            revoked_tenants: self.tenants.entry_count(),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(issued_at: Option<OffsetDateTime>) -> UserContext {
        let ctx = UserContext::new(
            "u1",
            "t1",
            OffsetDateTime::now_utc() + time::Duration::hours(1),
        );
        match issued_at {
            Some(at) => ctx.with_issued_at(at),
            None => ctx,
        }
    }

    #[test]
    fn test_single_token_revocation() {
        let list = RevocationList::default();
        list.revoke_token(7, Some(Duration::from_secs(60)));

        assert!(list.is_token_revoked(7));
        assert!(list.is_revoked(7, &ctx(None)));
        assert!(!list.is_revoked(8, &ctx(None)));
        assert_eq!(list.stats().blocked, 2);
    }

    #[test]
    fn test_user_revocation_spares_later_tokens() {
        let list = RevocationList::default();
        let now = OffsetDateTime::now_utc();
        list.revoke_user("t1", "u1", now);

        assert!(list.is_revoked(1, &ctx(Some(now - time::Duration::minutes(5)))));
        assert!(list.is_revoked(1, &ctx(Some(now))));
        assert!(list.is_revoked(1, &ctx(None)));
        assert!(!list.is_revoked(1, &ctx(Some(now + time::Duration::seconds(5)))));
    }

    #[test]
    fn test_later_user_revocation_wins() {
        let list = RevocationList::default();
        let now = OffsetDateTime::now_utc();
        list.revoke_user("t1", "u1", now + time::Duration::minutes(1));
        list.revoke_user("t1", "u1", now);

        assert!(list.is_revoked(1, &ctx(Some(now + time::Duration::seconds(30)))));
    }

    #[test]
    fn test_tenant_revocation_covers_every_user() {
        let list = RevocationList::default();
        let now = OffsetDateTime::now_utc();
        list.revoke_tenant("t1", now);

        assert!(list.is_revoked(1, &ctx(Some(now - time::Duration::seconds(1)))));
        let other_tenant = UserContext::new("u1", "t2", now + time::Duration::hours(1))
            .with_issued_at(now - time::Duration::seconds(1));
        assert!(!list.is_revoked(1, &other_tenant));
    }
}
