use std::net::SocketAddr;
use std::sync::Arc;

use axum::{Router, middleware, routing::get};
use authedge_core::{AuthError, IdentityAuthority};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

use crate::{
    authority::HttpAuthority, config::AppConfig, gateway::Gateway, handlers,
    middleware as app_middleware, redis_bridge::RedisBridge,
};

pub struct AuthedgeServer {
    addr: SocketAddr,
    app: Router,
    gateway: Arc<Gateway>,
}

/// Operational routes, plus a fallback that authorizes everything else.
pub fn build_app(gateway: Arc<Gateway>) -> Router {
    let protected: Router = Router::new()
        .fallback(handlers::forward_auth)
        .layer(middleware::from_fn_with_state(
            gateway.clone(),
            app_middleware::authorize,
        ));

    Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(handlers::metrics))
        .route("/cache/stats", get(handlers::cache_stats))
        .with_state(gateway)
        .fallback_service(protected)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &axum::http::Request<_>| {
                    use tracing::field::Empty;
                    tracing::info_span!(
                        "http.request",
                        http.method = %req.method(),
                        http.target = %req.uri(),
                        http.status_code = Empty
                    )
                })
                .on_response(
                    |res: &axum::http::Response<_>, latency: std::time::Duration, span: &tracing::Span| {
                        span.record("http.status_code", tracing::field::display(res.status().as_u16()));
                        tracing::info!(
                            http.status = %res.status().as_u16(),
                            elapsed_ms = %latency.as_millis(),
                            "request handled"
                        );
                    },
                ),
        )
}

pub struct ServerBuilder {
    addr: SocketAddr,
    config: AppConfig,
    authority: Option<Arc<dyn IdentityAuthority>>,
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerBuilder {
    pub fn new() -> Self {
        let cfg = AppConfig::default();
        Self {
            addr: cfg.addr(),
            config: cfg,
            authority: None,
        }
    }

    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_config(mut self, cfg: AppConfig) -> Self {
        self.addr = cfg.addr();
        self.config = cfg;
        self
    }

    /// Uses `authority` instead of the HTTP client built from config.
    pub fn with_authority(mut self, authority: Arc<dyn IdentityAuthority>) -> Self {
        self.authority = Some(authority);
        self
    }

    pub async fn build(self) -> Result<AuthedgeServer, AuthError> {
        crate::metrics::init_metrics();

        let authority: Arc<dyn IdentityAuthority> = match self.authority {
            Some(authority) => authority,
            None => Arc::new(HttpAuthority::new(&self.config.authority)?),
        };

        let gateway = Arc::new(Gateway::new(&self.config, authority));
        gateway.start();

        if let Some(bridge) =
            RedisBridge::connect(&self.config.redis, gateway.bus().clone(), gateway.instance_id())
                .await
        {
            let resync = Arc::downgrade(&gateway);
            let bridge = bridge.on_resubscribe(move || {
                if let Some(gateway) = resync.upgrade() {
                    gateway.resync();
                }
            });
            gateway.track(bridge.start());
        }

        Ok(AuthedgeServer {
            addr: self.addr,
            app: build_app(gateway.clone()),
            gateway,
        })
    }
}

impl AuthedgeServer {
    pub fn gateway(&self) -> &Arc<Gateway> {
        &self.gateway
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        self.gateway.shutdown();
        Ok(())
    }
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
