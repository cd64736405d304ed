use std::sync::Arc;

use axum::{
    Json,
    extract::{Request, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use authedge_core::UserContext;
use serde::Serialize;

use crate::gateway::{Gateway, GatewayStats};
use crate::middleware::insert_identity_headers;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// Prometheus text exposition.
pub async fn metrics() -> Response {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics recorder not installed").into_response(),
    }
}

pub async fn cache_stats(State(gateway): State<Arc<Gateway>>) -> Json<GatewayStats> {
    Json(gateway.stats())
}

/// Answer for requests that passed authorization: 204 carrying the caller's
/// identity headers, for a fronting proxy to copy upstream.
pub async fn forward_auth(req: Request) -> Response {
    let mut headers = HeaderMap::new();
    if let Some(ctx) = req.extensions().get::<Arc<UserContext>>() {
        insert_identity_headers(&mut headers, ctx);
    }
    (StatusCode::NO_CONTENT, headers).into_response()
}
