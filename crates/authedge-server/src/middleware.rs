//! Authorization middleware and error responses.

use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use authedge_core::{AuthError, UserContext};
use serde_json::json;

use crate::gateway::Gateway;
use crate::pipeline::{AuthzRequest, Decision};

pub const X_USER_ID: HeaderName = HeaderName::from_static("x-user-id");
pub const X_TENANT_ID: HeaderName = HeaderName::from_static("x-tenant-id");
pub const X_USER_ROLES: HeaderName = HeaderName::from_static("x-user-roles");

const IDENTITY_HEADERS: [HeaderName; 3] = [X_USER_ID, X_TENANT_ID, X_USER_ROLES];

// =============================================================================
// Rejections
// =============================================================================

/// HTTP rendering of an [`AuthError`].
#[derive(Debug)]
pub struct AuthRejection(pub AuthError);

impl From<AuthError> for AuthRejection {
    fn from(err: AuthError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        let (status, message) = error_details(&self.0);
        let code = self.0.error_code();

        let mut headers = HeaderMap::new();
        if status == StatusCode::UNAUTHORIZED {
            let www_auth = build_www_authenticate_header(code, &message);
            if let Ok(value) = HeaderValue::from_str(&www_auth) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }

        let body = json!({
            "error": code,
            "message": message,
        });
        (status, headers, Json(body)).into_response()
    }
}

/// Returns (HTTP status, client-facing message).
fn error_details(error: &AuthError) -> (StatusCode, String) {
    match error {
        AuthError::Unauthorized { message } | AuthError::InvalidToken { message } => {
            (StatusCode::UNAUTHORIZED, message.clone())
        }
        AuthError::TokenExpired => (StatusCode::UNAUTHORIZED, "Token has expired".to_string()),
        AuthError::Forbidden { message } => (StatusCode::FORBIDDEN, message.clone()),
        // Upstream details stay in the logs.
        AuthError::UpstreamTimeout { .. } => (
            StatusCode::FORBIDDEN,
            "Authorization could not be confirmed".to_string(),
        ),
        AuthError::FilterInconsistency { .. }
        | AuthError::Configuration { .. }
        | AuthError::Internal { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Internal server error".to_string(),
        ),
    }
}

/// Format: `Bearer realm="authedge", error="invalid_token", error_description="..."`
fn build_www_authenticate_header(error: &str, description: &str) -> String {
    let escaped_desc = description.replace('"', "\\\"");
    format!("Bearer realm=\"authedge\", error=\"{error}\", error_description=\"{escaped_desc}\"")
}

// =============================================================================
// Middleware
// =============================================================================

/// Runs the authorization pipeline in front of the wrapped routes.
///
/// Allowed requests continue with the caller's identity in
/// `X-User-Id`/`X-Tenant-Id`/`X-User-Roles` and as an `Arc<UserContext>`
/// extension. Identity headers supplied by the client are always dropped.
pub async fn authorize(
    State(gateway): State<Arc<Gateway>>,
    mut req: Request,
    next: Next,
) -> Response {
    for name in &IDENTITY_HEADERS {
        req.headers_mut().remove(name);
    }

    let bearer = extract_bearer_token(req.headers());
    let path = req.uri().path().to_string();
    let method = req.method().clone();

    let decision = gateway
        .pipeline()
        .decide(AuthzRequest::new(method.as_str(), &path, bearer.as_deref()))
        .await;

    match decision {
        Decision::Allow { identity, .. } => {
            if let Some(ctx) = identity {
                insert_identity_headers(req.headers_mut(), &ctx);
                req.extensions_mut().insert(ctx);
            }
            next.run(req).await
        }
        Decision::Deny { error, .. } => AuthRejection(error).into_response(),
    }
}

/// Extract a bearer token from the Authorization header.
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(ToString::to_string)
}

/// Writes the identity headers for `ctx`; values that are not valid header
/// text are skipped.
pub fn insert_identity_headers(headers: &mut HeaderMap, ctx: &UserContext) {
    let values = [
        (X_USER_ID, ctx.user_id.clone()),
        (X_TENANT_ID, ctx.tenant_id.clone()),
        (X_USER_ROLES, ctx.roles_header()),
    ];
    for (name, value) in values {
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(name, value);
            }
            Err(_) => tracing::warn!(header = %name, "identity value is not a valid header"),
        }
    }
}
