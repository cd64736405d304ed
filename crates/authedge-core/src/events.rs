//! Cache invalidation events exchanged between gateway instances.
//!
//! Events are transient: every subscriber consumes them at most once and the
//! gateway never persists them. The JSON form is the wire format used on the
//! pub/sub transport.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::model::{Action, PermissionKey};

/// What an invalidation event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind {
    /// A token was revoked.
    Token,
    /// A single permission was granted or revoked.
    Permission,
    /// A user's (or a whole tenant's) role assignments changed.
    Role,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Token => "token",
            EventKind::Permission => "permission",
            EventKind::Role => "role",
        }
    }
}

/// Direction of a permission change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PermissionChange {
    Granted,
    Revoked,
}

/// Cache-busting event distributed on the invalidation bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidationEvent {
    pub kind: EventKind,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<Action>,
    /// Set on permission events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change: Option<PermissionChange>,
    /// Hash of a single revoked token, when the revocation is that narrow.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    /// Instance that published the event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
}

impl InvalidationEvent {
    fn new(kind: EventKind, tenant_id: impl Into<String>) -> Self {
        Self {
            kind,
            tenant_id: tenant_id.into(),
            user_id: None,
            resource: None,
            action: None,
            change: None,
            token_id: None,
            origin: None,
            occurred_at: OffsetDateTime::now_utc(),
        }
    }

    /// Every token of `user_id` was revoked.
    pub fn token_revoked(tenant_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        let mut event = Self::new(EventKind::Token, tenant_id);
        event.user_id = Some(user_id.into());
        event
    }

    /// A single token, identified by its cache hash, was revoked.
    pub fn single_token_revoked(
        tenant_id: impl Into<String>,
        user_id: impl Into<String>,
        token_id: impl Into<String>,
    ) -> Self {
        let mut event = Self::token_revoked(tenant_id, user_id);
        event.token_id = Some(token_id.into());
        event
    }

    pub fn permission_granted(key: &PermissionKey) -> Self {
        Self::permission(key, PermissionChange::Granted)
    }

    pub fn permission_revoked(key: &PermissionKey) -> Self {
        Self::permission(key, PermissionChange::Revoked)
    }

    fn permission(key: &PermissionKey, change: PermissionChange) -> Self {
        let mut event = Self::new(EventKind::Permission, &key.tenant_id);
        event.user_id = Some(key.user_id.clone());
        event.resource = Some(key.resource.clone());
        event.action = Some(key.action);
        event.change = Some(change);
        event
    }

    /// Role assignments changed for one user, or for the whole tenant when
    /// `user_id` is `None`.
    pub fn role_changed(tenant_id: impl Into<String>, user_id: Option<String>) -> Self {
        let mut event = Self::new(EventKind::Role, tenant_id);
        event.user_id = user_id;
        event
    }

    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// The permission key a permission event refers to, if complete.
    pub fn permission_key(&self) -> Option<PermissionKey> {
        if self.kind != EventKind::Permission {
            return None;
        }
        match (&self.user_id, &self.resource, self.action) {
            (Some(user), Some(resource), Some(action)) => Some(PermissionKey::new(
                &self.tenant_id,
                user,
                resource,
                action,
            )),
            _ => None,
        }
    }

    pub fn is_from(&self, instance_id: &str) -> bool {
        self.origin.as_deref() == Some(instance_id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_event_round_trips_key() {
        let key = PermissionKey::new("t1", "u1", "/api/customers/**", Action::Read);
        let event = InvalidationEvent::permission_revoked(&key).with_origin("gw-1");

        assert_eq!(event.kind, EventKind::Permission);
        assert_eq!(event.change, Some(PermissionChange::Revoked));
        assert_eq!(event.permission_key(), Some(key));
        assert!(event.is_from("gw-1"));
        assert!(!event.is_from("gw-2"));
    }

    #[test]
    fn test_wire_format() {
        let event = InvalidationEvent::role_changed("t1", Some("u1".into()));
        let json: serde_json::Value = serde_json::from_str(&event.to_json().unwrap()).unwrap();

        assert_eq!(json["kind"], "ROLE");
        assert_eq!(json["tenantId"], "t1");
        assert_eq!(json["userId"], "u1");
        assert!(json.get("resource").is_none());
        assert!(json["occurredAt"].is_string());
    }

    #[test]
    fn test_parse_minimal_payload() {
        let payload = r#"{"kind":"TOKEN","tenantId":"t1","occurredAt":"2025-01-01T00:00:00Z"}"#;
        let event = InvalidationEvent::from_json(payload).unwrap();
        assert_eq!(event.kind, EventKind::Token);
        assert!(event.user_id.is_none());
        assert!(event.permission_key().is_none());
    }
}
