//! Identity Authority collaborator.
//!
//! The gateway never owns roles or policies; it only caches answers from an
//! authority that does. [`IdentityAuthority`] is the seam, and
//! [`InMemoryAuthority`] is a self-contained implementation used by tests and
//! local development.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};

use crate::error::AuthorityError;
use crate::model::{Action, PermissionKey, UserContext};
use crate::pattern;

/// Source of truth for identities and permissions.
#[async_trait]
pub trait IdentityAuthority: Send + Sync {
    /// Validates a bearer token and returns the identity behind it.
    async fn validate_token(&self, token: &str) -> Result<UserContext, AuthorityError>;

    /// Authoritative permission check.
    async fn check_permission(
        &self,
        user_id: &str,
        tenant_id: &str,
        resource: &str,
        action: Action,
    ) -> Result<bool, AuthorityError>;

    /// The canonical policy set, used to rebuild the permission filter.
    async fn list_permissions(&self) -> Result<Vec<PermissionKey>, AuthorityError>;
}

#[async_trait]
impl<T: IdentityAuthority + ?Sized> IdentityAuthority for Arc<T> {
    async fn validate_token(&self, token: &str) -> Result<UserContext, AuthorityError> {
        (**self).validate_token(token).await
    }

    async fn check_permission(
        &self,
        user_id: &str,
        tenant_id: &str,
        resource: &str,
        action: Action,
    ) -> Result<bool, AuthorityError> {
        (**self)
            .check_permission(user_id, tenant_id, resource, action)
            .await
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionKey>, AuthorityError> {
        (**self).list_permissions().await
    }
}

/// Call counters kept by [`InMemoryAuthority`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuthorityCalls {
    pub validate_token: u64,
    pub check_permission: u64,
    pub list_permissions: u64,
}

/// Authority backed by in-process maps.
///
/// Grants may use resource patterns; `check_permission` applies the same
/// pattern semantics as claim matching.
#[derive(Default)]
pub struct InMemoryAuthority {
    tokens: DashMap<String, UserContext>,
    grants: DashSet<PermissionKey>,
    latency_micros: AtomicU64,
    unavailable: AtomicBool,
    validate_calls: AtomicU64,
    check_calls: AtomicU64,
    list_calls: AtomicU64,
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `token` as identifying `ctx`.
    pub fn register_token(&self, token: impl Into<String>, ctx: UserContext) {
        self.tokens.insert(token.into(), ctx);
    }

    pub fn revoke_token(&self, token: &str) {
        self.tokens.remove(token);
    }

    pub fn grant(&self, key: PermissionKey) {
        self.grants.insert(key);
    }

    pub fn revoke(&self, key: &PermissionKey) {
        self.grants.remove(key);
    }

    /// Delay applied to every call, to simulate a slow authority.
    pub fn set_latency(&self, latency: Duration) {
        let micros = u64::try_from(latency.as_micros()).unwrap_or(u64::MAX);
        self.latency_micros.store(micros, Ordering::Relaxed);
    }

    /// Makes every call fail with [`AuthorityError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Relaxed);
    }

    pub fn calls(&self) -> AuthorityCalls {
        AuthorityCalls {
            validate_token: self.validate_calls.load(Ordering::Relaxed),
            check_permission: self.check_calls.load(Ordering::Relaxed),
            list_permissions: self.list_calls.load(Ordering::Relaxed),
        }
    }

    async fn simulate(&self) -> Result<(), AuthorityError> {
        let latency = Duration::from_micros(self.latency_micros.load(Ordering::Relaxed));
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(Ordering::Relaxed) {
            return Err(AuthorityError::Unavailable("authority offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl IdentityAuthority for InMemoryAuthority {
    async fn validate_token(&self, token: &str) -> Result<UserContext, AuthorityError> {
        self.validate_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;
        self.tokens
            .get(token)
            .map(|ctx| ctx.clone())
            .ok_or_else(|| AuthorityError::InvalidToken("unknown token".into()))
    }

    async fn check_permission(
        &self,
        user_id: &str,
        tenant_id: &str,
        resource: &str,
        action: Action,
    ) -> Result<bool, AuthorityError> {
        self.check_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;
        Ok(self.grants.iter().any(|grant| {
            grant.tenant_id == tenant_id
                && grant.user_id == user_id
                && grant.action == action
                && pattern::matches(&grant.resource, resource)
        }))
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionKey>, AuthorityError> {
        self.list_calls.fetch_add(1, Ordering::Relaxed);
        self.simulate().await?;
        Ok(self.grants.iter().map(|grant| grant.clone()).collect())
    }
}
