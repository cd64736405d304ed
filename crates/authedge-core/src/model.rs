//! Identity and permission model shared by every gateway component.
//!
//! A [`UserContext`] is the decoded, authority-confirmed identity behind a
//! bearer token. It is immutable: a refresh replaces the whole value, and
//! caches hand it out as `Arc<UserContext>`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::pattern;

// =============================================================================
// Action
// =============================================================================

/// Operation a request performs on a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Read,
    Create,
    Update,
    Delete,
}

impl Action {
    /// Maps an HTTP method to the action it performs.
    ///
    /// `GET→READ`, `POST→CREATE`, `PUT`/`PATCH→UPDATE`, `DELETE→DELETE`.
    /// Anything else (HEAD, OPTIONS, extension methods) is treated as `READ`.
    pub fn from_method(method: &str) -> Self {
        match method.to_ascii_uppercase().as_str() {
            "POST" => Action::Create,
            "PUT" | "PATCH" => Action::Update,
            "DELETE" => Action::Delete,
            _ => Action::Read,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Read => "READ",
            Action::Create => "CREATE",
            Action::Update => "UPDATE",
            Action::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "READ" => Ok(Action::Read),
            "CREATE" => Ok(Action::Create),
            "UPDATE" => Ok(Action::Update),
            "DELETE" => Ok(Action::Delete),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

// =============================================================================
// User Context
// =============================================================================

/// Identity and preloaded permissions of an authenticated caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserContext {
    pub user_id: String,
    pub tenant_id: String,
    #[serde(default)]
    pub roles: HashSet<String>,
    /// Resource pattern → allowed actions.
    #[serde(default)]
    pub permissions: HashMap<String, HashSet<Action>>,
    #[serde(with = "time::serde::rfc3339")]
    pub expires_at: OffsetDateTime,
    /// When the underlying token was issued, if the token says so.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "time::serde::rfc3339::option"
    )]
    pub issued_at: Option<OffsetDateTime>,
}

impl UserContext {
    /// Creates a context with no roles and no permissions.
    pub fn new(
        user_id: impl Into<String>,
        tenant_id: impl Into<String>,
        expires_at: OffsetDateTime,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            tenant_id: tenant_id.into(),
            roles: HashSet::new(),
            permissions: HashMap::new(),
            expires_at,
            issued_at: None,
        }
    }

    #[must_use]
    pub fn with_issued_at(mut self, issued_at: OffsetDateTime) -> Self {
        self.issued_at = Some(issued_at);
        self
    }

    #[must_use]
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.roles.insert(role.into());
        self
    }

    /// Grants `actions` on `pattern`, merging with any existing grant.
    #[must_use]
    pub fn with_permission(
        mut self,
        pattern: impl Into<String>,
        actions: impl IntoIterator<Item = Action>,
    ) -> Self {
        self.permissions
            .entry(pattern.into())
            .or_default()
            .extend(actions);
        self
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(OffsetDateTime::now_utc())
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at <= now
    }

    /// Time left until `expires_at`, or `None` once elapsed.
    pub fn remaining_lifetime(&self) -> Option<std::time::Duration> {
        let left = self.expires_at - OffsetDateTime::now_utc();
        if left.is_positive() {
            std::time::Duration::try_from(left).ok()
        } else {
            None
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Returns the first permission pattern that grants `action` on `path`.
    ///
    /// Entries are an unordered OR: any matching entry is sufficient and no
    /// pattern takes precedence over another.
    pub fn matching_grant(&self, path: &str, action: Action) -> Option<&str> {
        self.permissions
            .iter()
            .find(|(pattern, actions)| actions.contains(&action) && pattern::matches(pattern, path))
            .map(|(pattern, _)| pattern.as_str())
    }

    /// Roles joined with commas, as forwarded in `X-User-Roles`.
    pub fn roles_header(&self) -> String {
        let mut roles: Vec<&str> = self.roles.iter().map(String::as_str).collect();
        roles.sort_unstable();
        roles.join(",")
    }
}

// =============================================================================
// Permission Key
// =============================================================================

/// Canonical `(tenant, user, resource, action)` tuple.
///
/// The string form from [`PermissionKey::canonical`] is what the permission
/// filter hashes; [`PermissionKey::coalescing_key`] prefixes it for the
/// request coalescer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermissionKey {
    pub tenant_id: String,
    pub user_id: String,
    pub resource: String,
    pub action: Action,
}

impl PermissionKey {
    pub fn new(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        resource: impl Into<String>,
        action: Action,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            user_id: user_id.into(),
            resource: resource.into(),
            action,
        }
    }

    /// Key for a request against the context's own tenant and user.
    pub fn for_request(ctx: &UserContext, path: &str, action: Action) -> Self {
        Self::new(&ctx.tenant_id, &ctx.user_id, path, action)
    }

    /// Unambiguous string form: tenant and user are length-prefixed, and the
    /// action (which never contains `:`) follows the last separator.
    pub fn canonical(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}:{}",
            self.tenant_id.len(),
            self.tenant_id,
            self.user_id.len(),
            self.user_id,
            self.resource,
            self.action
        )
    }

    pub fn coalescing_key(&self) -> String {
        format!("perm:{}", self.canonical())
    }

    /// Same tenant, user and action with a different resource.
    pub fn with_resource(&self, resource: impl Into<String>) -> Self {
        Self {
            tenant_id: self.tenant_id.clone(),
            user_id: self.user_id.clone(),
            resource: resource.into(),
            action: self.action,
        }
    }
}

impl fmt::Display for PermissionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.tenant_id, self.user_id, self.resource, self.action
        )
    }
}
