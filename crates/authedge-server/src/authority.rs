//! HTTP client for the Identity Authority.
//!
//! Tokens are verified locally with the authority's signing key; the user's
//! permission map and fine-grained permission checks come from its REST API:
//!
//! | Operation          | Request                                                   |
//! |--------------------|-----------------------------------------------------------|
//! | user permissions   | `GET  /api/v1/auth/permissions/user/{userId}?tenantId=…`  |
//! | check permission   | `POST /api/v1/auth/check-permission`                      |
//! | full policy set    | `GET  /api/v1/auth/permissions`                           |

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use authedge_cache::Coalescer;
use authedge_cache::coalesce::user_permissions_key;
use authedge_core::{Action, AuthError, AuthorityError, IdentityAuthority, PermissionKey, UserContext};
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::AuthorityConfig;

type PermissionMap = HashMap<String, HashSet<Action>>;

/// Claims issued by the identity service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayClaims {
    /// User id.
    pub sub: String,
    pub tenant_id: String,
    #[serde(default)]
    pub roles: Vec<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UserPermissionsResponse {
    #[serde(default)]
    permissions: HashMap<String, Vec<String>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CheckPermissionRequest<'a> {
    user_id: &'a str,
    tenant_id: &'a str,
    resource: &'a str,
    action: Action,
}

#[derive(Debug, Deserialize)]
struct CheckPermissionResponse {
    allowed: bool,
}

#[derive(Debug, Deserialize)]
struct PolicySetResponse {
    permissions: Vec<PermissionKey>,
}

/// [`IdentityAuthority`] backed by the identity service's HTTP API.
#[derive(Clone)]
pub struct HttpAuthority {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
    decoding_key: DecodingKey,
    validation: Validation,
    permission_loads: Arc<Coalescer<PermissionMap, AuthorityError>>,
}

impl HttpAuthority {
    pub fn new(config: &AuthorityConfig) -> Result<Self, AuthError> {
        let algorithm = Algorithm::from_str(config.algorithm.trim())
            .map_err(|e| AuthError::configuration(format!("unsupported JWT algorithm: {e}")))?;
        let decoding_key = decoding_key(config, algorithm)?;

        let mut validation = Validation::new(algorithm);
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = config.issuer.as_deref() {
            validation.set_issuer(&[issuer]);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuthError::configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            timeout: config.timeout,
            decoding_key,
            validation,
            permission_loads: Arc::new(Coalescer::default()),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn decode(&self, token: &str) -> Result<GatewayClaims, AuthorityError> {
        jsonwebtoken::decode::<GatewayClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| AuthorityError::InvalidToken(e.to_string()))
    }

    /// Loads the user's permission map, once for all concurrent callers.
    ///
    /// Failures degrade to an empty map: claim matching then finds nothing
    /// and the request falls through to a permission check.
    async fn user_permissions(&self, tenant_id: &str, user_id: &str) -> PermissionMap {
        let this = self.clone();
        let (tenant, user) = (tenant_id.to_string(), user_id.to_string());
        let loaded = self
            .permission_loads
            .coalesce(user_permissions_key(tenant_id, user_id), move || async move {
                this.fetch_user_permissions(&tenant, &user).await
            })
            .await;

        loaded.unwrap_or_else(|e| {
            tracing::warn!(
                error = %e,
                tenant_id,
                user_id,
                "failed to load user permissions, continuing without claims"
            );
            PermissionMap::new()
        })
    }

    async fn fetch_user_permissions(
        &self,
        tenant_id: &str,
        user_id: &str,
    ) -> Result<PermissionMap, AuthorityError> {
        let response = self
            .client
            .get(self.url(&format!("/api/v1/auth/permissions/user/{user_id}")))
            .query(&[("tenantId", tenant_id)])
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let body: UserPermissionsResponse = self.read_json(response).await?;

        Ok(body
            .permissions
            .into_iter()
            .map(|(pattern, actions)| {
                let actions = actions.iter().filter_map(|a| parse_action(a)).collect();
                (pattern, actions)
            })
            .collect())
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, AuthorityError> {
        let status = response.status();
        if !status.is_success() {
            return Err(AuthorityError::Unavailable(format!(
                "{} returned {status}",
                response.url().path()
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AuthorityError::Protocol(e.to_string()))
    }

    fn transport_error(&self, err: reqwest::Error) -> AuthorityError {
        if err.is_timeout() {
            AuthorityError::Timeout(self.timeout)
        } else {
            AuthorityError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl IdentityAuthority for HttpAuthority {
    async fn validate_token(&self, token: &str) -> Result<UserContext, AuthorityError> {
        let claims = self.decode(token)?;
        let expires_at = OffsetDateTime::from_unix_timestamp(claims.exp)
            .map_err(|e| AuthorityError::InvalidToken(format!("invalid exp claim: {e}")))?;

        let mut ctx = UserContext::new(&claims.sub, &claims.tenant_id, expires_at);
        if let Some(iat) = claims.iat {
            let issued_at = OffsetDateTime::from_unix_timestamp(iat)
                .map_err(|e| AuthorityError::InvalidToken(format!("invalid iat claim: {e}")))?;
            ctx = ctx.with_issued_at(issued_at);
        }
        ctx.roles = claims.roles.into_iter().collect();
        ctx.permissions = self.user_permissions(&claims.tenant_id, &claims.sub).await;

        tracing::debug!(
            user_id = %ctx.user_id,
            tenant_id = %ctx.tenant_id,
            patterns = ctx.permissions.len(),
            "token validated"
        );
        Ok(ctx)
    }

    async fn check_permission(
        &self,
        user_id: &str,
        tenant_id: &str,
        resource: &str,
        action: Action,
    ) -> Result<bool, AuthorityError> {
        let response = self
            .client
            .post(self.url("/api/v1/auth/check-permission"))
            .json(&CheckPermissionRequest {
                user_id,
                tenant_id,
                resource,
                action,
            })
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let body: CheckPermissionResponse = self.read_json(response).await?;
        Ok(body.allowed)
    }

    async fn list_permissions(&self) -> Result<Vec<PermissionKey>, AuthorityError> {
        let response = self
            .client
            .get(self.url("/api/v1/auth/permissions"))
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let body: PolicySetResponse = self.read_json(response).await?;
        Ok(body.permissions)
    }
}

fn decoding_key(config: &AuthorityConfig, algorithm: Algorithm) -> Result<DecodingKey, AuthError> {
    let pem = || {
        config
            .jwt_public_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .map(str::as_bytes)
            .ok_or_else(|| AuthError::configuration("authority.jwt_public_key is required"))
    };
    let invalid = |e: jsonwebtoken::errors::Error| {
        AuthError::configuration(format!("invalid authority.jwt_public_key: {e}"))
    };

    match algorithm {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => config
            .jwt_secret
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| DecodingKey::from_secret(s.as_bytes()))
            .ok_or_else(|| AuthError::configuration("authority.jwt_secret is required")),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem()?).map_err(invalid),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem()?).map_err(invalid),
        _ => DecodingKey::from_rsa_pem(pem()?).map_err(invalid),
    }
}

/// Accepts action names and the HTTP methods they derive from.
fn parse_action(raw: &str) -> Option<Action> {
    raw.parse().ok().or_else(|| {
        match raw.to_ascii_uppercase().as_str() {
            "GET" | "POST" | "PUT" | "PATCH" | "DELETE" => Some(Action::from_method(raw)),
            _ => None,
        }
    })
}
