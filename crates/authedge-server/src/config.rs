use authedge_cache::{AdaptiveTtlConfig, FilterConfig, TokenCacheConfig};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, time::Duration};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Request pipeline settings
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub token_cache: TokenCacheSettings,
    #[serde(default)]
    pub adaptive_ttl: AdaptiveTtlSettings,
    /// Counting bloom filter over the policy set
    #[serde(default)]
    pub filter: FilterSettings,
    #[serde(default)]
    pub coalescing: CoalescingConfig,
    /// Identity Authority client
    #[serde(default)]
    pub authority: AuthorityConfig,
    /// Redis bridge for cross-instance invalidation
    #[serde(default)]
    pub redis: RedisConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("server.port must be > 0".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        if self.gateway.backend_timeout.is_zero() {
            return Err("gateway.backend_timeout must be > 0".into());
        }
        if self.gateway.public_paths.iter().any(|p| !p.starts_with('/')) {
            return Err("gateway.public_paths entries must start with '/'".into());
        }
        if self.token_cache.max_entries == 0 {
            return Err("token_cache.max_entries must be > 0".into());
        }
        if self.token_cache.base_ttl.is_zero() {
            return Err("token_cache.base_ttl must be > 0".into());
        }
        if self.token_cache.revocation_ttl.is_zero() {
            return Err("token_cache.revocation_ttl must be > 0".into());
        }

        let ttl = &self.adaptive_ttl;
        if ttl.min_ttl.is_zero() || ttl.min_ttl > ttl.max_ttl {
            return Err("adaptive_ttl requires 0 < min_ttl <= max_ttl".into());
        }
        if ttl.step <= 1.0 {
            return Err("adaptive_ttl.step must be > 1".into());
        }
        if !(ttl.alpha > 0.0 && ttl.alpha <= 1.0) {
            return Err("adaptive_ttl.alpha must be in (0, 1]".into());
        }
        if ttl.cold_rate >= ttl.hot_rate {
            return Err("adaptive_ttl.cold_rate must be < hot_rate".into());
        }

        if self.filter.expected_insertions == 0 {
            return Err("filter.expected_insertions must be > 0".into());
        }
        if !(self.filter.false_positive_rate > 0.0 && self.filter.false_positive_rate < 1.0) {
            return Err("filter.false_positive_rate must be in (0, 1)".into());
        }
        if self.coalescing.max_in_flight == 0 {
            return Err("coalescing.max_in_flight must be > 0".into());
        }

        if self.authority.base_url.is_empty() {
            return Err("authority.base_url is required".into());
        }
        let symmetric = self.authority.algorithm.to_ascii_uppercase().starts_with("HS");
        if symmetric && self.authority.jwt_secret.as_deref().unwrap_or("").is_empty() {
            return Err("authority.jwt_secret is required for HMAC algorithms".into());
        }
        if !symmetric && self.authority.jwt_public_key.as_deref().unwrap_or("").is_empty() {
            return Err("authority.jwt_public_key is required for asymmetric algorithms".into());
        }

        if self.redis.enabled && self.redis.url.is_empty() {
            return Err("redis.enabled=true requires redis.url".into());
        }
        Ok(())
    }

    pub fn addr(&self) -> SocketAddr {
        let ip: std::net::IpAddr = self
            .server
            .host
            .parse()
            .unwrap_or_else(|_| std::net::IpAddr::from([0, 0, 0, 0]));
        SocketAddr::from((ip, self.server.port))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Identifies this gateway on the invalidation bus. Generated when unset.
    #[serde(default)]
    pub instance_id: Option<String>,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            instance_id: None,
        }
    }
}

impl ServerConfig {
    pub fn resolved_instance_id(&self) -> String {
        match self.instance_id.as_deref() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => format!("gw-{}", uuid::Uuid::new_v4().simple()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Path prefixes that skip authentication entirely.
    #[serde(default = "default_public_paths")]
    pub public_paths: Vec<String>,

    /// Deadline for a coalesced permission check against the authority.
    #[serde(default = "default_backend_timeout", with = "humantime_serde")]
    pub backend_timeout: Duration,

    /// How often idle TTL statistics are pruned and cache gauges published.
    #[serde(default = "default_maintenance_interval", with = "humantime_serde")]
    pub maintenance_interval: Duration,
}

fn default_public_paths() -> Vec<String> {
    [
        "/api/v1/auth/login",
        "/api/v1/auth/register",
        "/api/v1/auth/refresh",
        "/api/v1/auth/verify",
        "/actuator/health",
        "/actuator/info",
        "/fallback",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_backend_timeout() -> Duration {
    Duration::from_millis(25)
}

fn default_maintenance_interval() -> Duration {
    Duration::from_secs(30)
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            public_paths: default_public_paths(),
            backend_timeout: default_backend_timeout(),
            maintenance_interval: default_maintenance_interval(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenCacheSettings {
    #[serde(default = "default_token_cache_max_entries")]
    pub max_entries: u64,
    /// TTL for tokens the adaptive controller knows nothing about yet.
    #[serde(default = "default_base_ttl", with = "humantime_serde")]
    pub base_ttl: Duration,
    /// How long token revocations are remembered; cover the longest token
    /// lifetime the authority issues.
    #[serde(default = "default_revocation_ttl", with = "humantime_serde")]
    pub revocation_ttl: Duration,
}

fn default_token_cache_max_entries() -> u64 {
    100_000
}

fn default_base_ttl() -> Duration {
    Duration::from_secs(300)
}

fn default_revocation_ttl() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

impl Default for TokenCacheSettings {
    fn default() -> Self {
        Self {
            max_entries: default_token_cache_max_entries(),
            base_ttl: default_base_ttl(),
            revocation_ttl: default_revocation_ttl(),
        }
    }
}

impl From<&TokenCacheSettings> for TokenCacheConfig {
    fn from(s: &TokenCacheSettings) -> Self {
        TokenCacheConfig {
            max_entries: s.max_entries,
            base_ttl: s.base_ttl,
            revocation_ttl: s.revocation_ttl,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveTtlSettings {
    #[serde(default = "default_min_ttl", with = "humantime_serde")]
    pub min_ttl: Duration,
    #[serde(default = "default_max_ttl", with = "humantime_serde")]
    pub max_ttl: Duration,
    /// Largest growth or shrink factor per window.
    #[serde(default = "default_step")]
    pub step: f64,
    #[serde(default = "default_window", with = "humantime_serde")]
    pub window: Duration,
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Accesses per second.
    #[serde(default = "default_hot_rate")]
    pub hot_rate: f64,
    /// Accesses per second.
    #[serde(default = "default_cold_rate")]
    pub cold_rate: f64,
    #[serde(default = "default_max_tracked_keys")]
    pub max_tracked_keys: usize,
    #[serde(default = "default_idle_after", with = "humantime_serde")]
    pub idle_after: Duration,
}

fn default_min_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_max_ttl() -> Duration {
    Duration::from_secs(3600)
}

fn default_step() -> f64 {
    2.0
}

fn default_window() -> Duration {
    Duration::from_secs(10)
}

fn default_alpha() -> f64 {
    0.3
}

fn default_hot_rate() -> f64 {
    1.0
}

fn default_cold_rate() -> f64 {
    1.0 / 300.0
}

fn default_max_tracked_keys() -> usize {
    100_000
}

fn default_idle_after() -> Duration {
    Duration::from_secs(3600)
}

impl Default for AdaptiveTtlSettings {
    fn default() -> Self {
        Self {
            min_ttl: default_min_ttl(),
            max_ttl: default_max_ttl(),
            step: default_step(),
            window: default_window(),
            alpha: default_alpha(),
            hot_rate: default_hot_rate(),
            cold_rate: default_cold_rate(),
            max_tracked_keys: default_max_tracked_keys(),
            idle_after: default_idle_after(),
        }
    }
}

impl From<&AdaptiveTtlSettings> for AdaptiveTtlConfig {
    fn from(s: &AdaptiveTtlSettings) -> Self {
        AdaptiveTtlConfig {
            min_ttl: s.min_ttl,
            max_ttl: s.max_ttl,
            step: s.step,
            window: s.window,
            alpha: s.alpha,
            hot_rate: s.hot_rate,
            cold_rate: s.cold_rate,
            max_tracked_keys: s.max_tracked_keys,
            idle_after: s.idle_after,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterSettings {
    #[serde(default = "default_expected_insertions")]
    pub expected_insertions: usize,
    #[serde(default = "default_false_positive_rate")]
    pub false_positive_rate: f64,
    /// Removals within `removal_burst_window` that trigger a full rebuild.
    #[serde(default = "default_removal_burst_threshold")]
    pub removal_burst_threshold: u32,
    #[serde(default = "default_removal_burst_window", with = "humantime_serde")]
    pub removal_burst_window: Duration,
}

fn default_expected_insertions() -> usize {
    1_000_000
}

fn default_false_positive_rate() -> f64 {
    0.0001
}

fn default_removal_burst_threshold() -> u32 {
    1000
}

fn default_removal_burst_window() -> Duration {
    Duration::from_secs(10)
}

impl Default for FilterSettings {
    fn default() -> Self {
        Self {
            expected_insertions: default_expected_insertions(),
            false_positive_rate: default_false_positive_rate(),
            removal_burst_threshold: default_removal_burst_threshold(),
            removal_burst_window: default_removal_burst_window(),
        }
    }
}

impl From<&FilterSettings> for FilterConfig {
    fn from(s: &FilterSettings) -> Self {
        FilterConfig {
            expected_insertions: s.expected_insertions,
            false_positive_rate: s.false_positive_rate,
            removal_burst_threshold: s.removal_burst_threshold,
            removal_burst_window: s.removal_burst_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoalescingConfig {
    /// Above this many distinct in-flight keys, calls run uncoalesced.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
}

fn default_max_in_flight() -> usize {
    authedge_cache::coalesce::DEFAULT_MAX_IN_FLIGHT
}

impl Default for CoalescingConfig {
    fn default() -> Self {
        Self {
            max_in_flight: default_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorityConfig {
    /// Base URL of the identity service, e.g. "http://iam-service:8081"
    #[serde(default = "default_authority_url")]
    pub base_url: String,

    /// HTTP client timeout for every authority call.
    #[serde(default = "default_authority_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Shared secret for HS* algorithms.
    #[serde(default)]
    pub jwt_secret: Option<String>,

    /// PEM public key for RS*, PS*, ES* and EdDSA.
    #[serde(default)]
    pub jwt_public_key: Option<String>,

    #[serde(default = "default_algorithm")]
    pub algorithm: String,

    /// Expected `iss` claim; not checked when unset.
    #[serde(default)]
    pub issuer: Option<String>,
}

fn default_authority_url() -> String {
    "http://localhost:8081".to_string()
}

fn default_authority_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_algorithm() -> String {
    "HS256".to_string()
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            base_url: default_authority_url(),
            timeout: default_authority_timeout(),
            jwt_secret: None,
            jwt_public_key: None,
            algorithm: default_algorithm(),
            issuer: None,
        }
    }
}

/// Redis configuration for the invalidation bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Default: false (single-instance deployments need no bridge)
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_redis_url")]
    pub url: String,

    #[serde(default = "default_redis_pool_size")]
    pub pool_size: usize,

    #[serde(default = "default_redis_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_redis_channel")]
    pub channel: String,
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_redis_pool_size() -> usize {
    10
}

fn default_redis_timeout_ms() -> u64 {
    5000
}

fn default_redis_channel() -> String {
    "authedge:invalidate".to_string()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: default_redis_url(),
            pool_size: default_redis_pool_size(),
            timeout_ms: default_redis_timeout_ms(),
            channel: default_redis_channel(),
        }
    }
}

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config build error: {0}")]
    Build(#[source] config::ConfigError),

    #[error("config deserialize error: {0}")]
    Deserialize(#[source] config::ConfigError),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

pub mod loader {
    use super::{AppConfig, ConfigError};
    use config::{Config, Environment, File};
    use std::path::PathBuf;

    pub const DEFAULT_CONFIG_PATH: &str = "authedge.toml";

    /// Loads `path` (or `authedge.toml`) layered under `AUTHEDGE__*` overrides.
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_config(path: Option<&str>) -> Result<AppConfig, ConfigError> {
        let pathbuf = PathBuf::from(path.unwrap_or(DEFAULT_CONFIG_PATH));
        let mut builder = Config::builder();
        if pathbuf.exists() {
            builder = builder.add_source(File::from(pathbuf));
        }
        // Environment variable overrides, e.g., AUTHEDGE__SERVER__PORT=9090
        builder = builder.add_source(
            Environment::with_prefix("AUTHEDGE")
                .prefix_separator("__")
                .try_parsing(true)
                .separator("__"),
        );
        let merged: AppConfig = builder
            .build()
            .map_err(ConfigError::Build)?
            .try_deserialize()
            .map_err(ConfigError::Deserialize)?;
        merged.validate().map_err(ConfigError::Invalid)?;
        Ok(merged)
    }
}
