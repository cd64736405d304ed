//! Revoked JWTs stay rejected even though their signature is still valid.

use std::sync::Arc;
use std::time::Duration;

use authedge_cache::token_cache::token_id;
use authedge_core::InvalidationEvent;
use authedge_server::authority::GatewayClaims;
use authedge_server::{AppConfig, Gateway, HttpAuthority, build_app};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use jsonwebtoken::{EncodingKey, Header};
use serde_json::json;
use time::OffsetDateTime;
use tower::ServiceExt;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const SECRET: &str = "revocation-test-secret";

async fn identity_service() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/auth/permissions/user/user-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "permissions": {"/api/customers/**": ["READ"]}
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/auth/permissions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "permissions": [
                {"tenantId": "tenant-1", "userId": "user-1", "resource": "/api/customers/**", "action": "READ"}
            ]
        })))
        .mount(&server)
        .await;
    server
}

async fn gateway_for(server: &MockServer) -> Arc<Gateway> {
    let mut cfg = AppConfig::default();
    cfg.server.instance_id = Some("gw-a".into());
    cfg.filter.expected_insertions = 1_000;
    cfg.authority.base_url = server.uri();
    cfg.authority.jwt_secret = Some(SECRET.into());

    let authority = Arc::new(HttpAuthority::new(&cfg.authority).expect("authority"));
    let gateway = Arc::new(Gateway::new(&cfg, authority));
    gateway.start();
    eventually(|| gateway.filter().is_ready()).await;
    gateway
}

fn sign(issued_at: OffsetDateTime) -> String {
    let claims = GatewayClaims {
        sub: "user-1".into(),
        tenant_id: "tenant-1".into(),
        roles: vec!["sales".into()],
        exp: (OffsetDateTime::now_utc() + time::Duration::hours(1)).unix_timestamp(),
        iat: Some(issued_at.unix_timestamp()),
        iss: None,
    };
    jsonwebtoken::encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(SECRET.as_bytes()),
    )
    .expect("sign")
}

async fn status(app: &Router, token: &str) -> StatusCode {
    let req = Request::builder()
        .uri("/api/customers/1")
        .header(header::AUTHORIZATION, format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap();
    app.clone().oneshot(req).await.unwrap().status()
}

async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn user_revocation_rejects_existing_jwts() {
    let server = identity_service().await;
    let gateway = gateway_for(&server).await;
    let app = build_app(gateway.clone());

    let token = sign(OffsetDateTime::now_utc() - time::Duration::minutes(1));
    assert_eq!(status(&app, &token).await, StatusCode::NO_CONTENT);

    gateway.publish(InvalidationEvent::token_revoked("tenant-1", "user-1"));
    eventually(|| gateway.token_cache().get(&token).is_none()).await;

    // The signature still verifies; the revocation alone rejects it.
    assert_eq!(status(&app, &token).await, StatusCode::UNAUTHORIZED);
    assert_eq!(status(&app, &token).await, StatusCode::UNAUTHORIZED);

    // A token issued after the revocation is accepted.
    let fresh = sign(OffsetDateTime::now_utc() + time::Duration::seconds(2));
    assert_eq!(status(&app, &fresh).await, StatusCode::NO_CONTENT);
    gateway.shutdown();
}

#[tokio::test]
async fn single_token_revocation_spares_other_sessions() {
    let server = identity_service().await;
    let gateway = gateway_for(&server).await;
    let app = build_app(gateway.clone());

    let issued = OffsetDateTime::now_utc() - time::Duration::minutes(1);
    let revoked = sign(issued);
    let other = sign(issued - time::Duration::seconds(1));
    assert_eq!(status(&app, &revoked).await, StatusCode::NO_CONTENT);
    assert_eq!(status(&app, &other).await, StatusCode::NO_CONTENT);

    gateway.publish(InvalidationEvent::single_token_revoked(
        "tenant-1",
        "user-1",
        token_id(&revoked),
    ));
    eventually(|| gateway.token_cache().get(&revoked).is_none()).await;

    assert_eq!(status(&app, &revoked).await, StatusCode::UNAUTHORIZED);
    assert_eq!(status(&app, &other).await, StatusCode::NO_CONTENT);
    gateway.shutdown();
}
