//! AuthEdge gateway server.
//!
//! Wires the caches from `authedge-cache` into an axum service that decides,
//! per request, whether the caller may proceed.

pub mod authority;
pub mod config;
pub mod gateway;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod observability;
pub mod pipeline;
pub mod redis_bridge;
pub mod server;

pub use authority::HttpAuthority;
pub use config::{AppConfig, ConfigError, RedisConfig, ServerConfig};
pub use gateway::{Gateway, GatewayStats};
pub use middleware::AuthRejection;
pub use observability::{init_tracing, shutdown_tracing};
pub use pipeline::{AllowReason, AuthorizationPipeline, AuthzRequest, Decision};
pub use server::{AuthedgeServer, ServerBuilder, build_app};
