//! The gateway process object.
//!
//! [`Gateway`] constructs and owns every cache component, the authorization
//! pipeline and the background tasks that keep them fresh. Nothing lives in
//! globals; handlers reach the gateway through axum state.

use std::sync::{Arc, Weak};
use std::time::Duration;

use authedge_cache::{
    AdaptiveTtlController, AdaptiveTtlStats, BusStats, Coalescer, CoalescerStats, FilterStats,
    InvalidationBus, PermissionFilter, TokenCache, TokenCacheStats, filter,
};
use authedge_core::{AuthorityError, IdentityAuthority, InvalidationEvent, UserContext};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::config::AppConfig;
use crate::metrics;
use crate::pipeline::{
    Authenticate, AuthorizationPipeline, ClaimMatch, CoalescedBackendCheck, NegativeCheck,
    PublicBypass,
};

/// Snapshot served at `/cache/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayStats {
    pub instance_id: String,
    pub token_cache: TokenCacheStats,
    pub adaptive_ttl: AdaptiveTtlStats,
    pub filter: FilterStats,
    pub permission_checks: CoalescerStats,
    pub token_loads: CoalescerStats,
    pub bus: BusStats,
}

pub struct Gateway {
    instance_id: String,
    authority: Arc<dyn IdentityAuthority>,
    bus: InvalidationBus,
    adaptive: Arc<AdaptiveTtlController<u64>>,
    token_cache: TokenCache,
    token_loads: Arc<Coalescer<Arc<UserContext>, AuthorityError>>,
    filter: Arc<PermissionFilter>,
    checks: Arc<Coalescer<bool, AuthorityError>>,
    pipeline: AuthorizationPipeline,
    maintenance_interval: Duration,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    /// Builds every component from `cfg`. No task is started until
    /// [`start`](Self::start).
    pub fn new(cfg: &AppConfig, authority: Arc<dyn IdentityAuthority>) -> Self {
        Self::with_bus(cfg, authority, InvalidationBus::default())
    }

    /// Like [`new`](Self::new), sharing an existing bus.
    pub fn with_bus(
        cfg: &AppConfig,
        authority: Arc<dyn IdentityAuthority>,
        bus: InvalidationBus,
    ) -> Self {
        let instance_id = cfg.server.resolved_instance_id();

        let adaptive = Arc::new(AdaptiveTtlController::new((&cfg.adaptive_ttl).into()));
        let token_loads = Arc::new(Coalescer::new(cfg.coalescing.max_in_flight));
        let token_cache = TokenCache::new(
            (&cfg.token_cache).into(),
            adaptive.clone(),
            token_loads.clone(),
        );
        let filter = Arc::new(
            PermissionFilter::new((&cfg.filter).into(), instance_id.clone()).with_bus(bus.clone()),
        );
        let checks = Arc::new(Coalescer::new(cfg.coalescing.max_in_flight));

        let pipeline = AuthorizationPipeline::new(vec![
            Box::new(PublicBypass::new(cfg.gateway.public_paths.clone())),
            Box::new(Authenticate::new(token_cache.clone(), authority.clone())),
            Box::new(NegativeCheck::new(filter.clone())),
            Box::new(ClaimMatch),
            Box::new(CoalescedBackendCheck::new(
                authority.clone(),
                checks.clone(),
                cfg.gateway.backend_timeout,
            )),
        ]);

        tracing::info!(
            instance_id = %instance_id,
            stages = ?pipeline.stage_names(),
            backend_timeout_ms = cfg.gateway.backend_timeout.as_millis() as u64,
            "gateway constructed"
        );

        Self {
            instance_id,
            authority,
            bus,
            adaptive,
            token_cache,
            token_loads,
            filter,
            checks,
            pipeline,
            maintenance_interval: cfg.gateway.maintenance_interval,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Starts bus subscribers, the filter rebuild worker and periodic
    /// maintenance.
    pub fn start(self: &Arc<Self>) {
        let cache = self.token_cache.clone();
        let instance_id = self.instance_id.clone();
        let lagging = self.token_cache.clone();
        let cache_subscriber = self.bus.subscribe_with_lag(
            "token-cache",
            move |event| {
                let source = if event.is_from(&instance_id) { "local" } else { "remote" };
                metrics::record_invalidation(event.kind.as_str(), source);
                let dropped = cache.apply_event(&event);
                tracing::debug!(
                    kind = event.kind.as_str(),
                    tenant_id = %event.tenant_id,
                    dropped,
                    "applied invalidation to token cache"
                );
            },
            move |skipped| {
                tracing::warn!(skipped, "token cache missed invalidations, clearing it");
                lagging.invalidate_all();
            },
        );

        let handles = vec![
            cache_subscriber,
            filter::attach_to_bus(self.filter.clone(), &self.bus),
            filter::spawn_rebuild_worker(self.filter.clone(), self.authority.clone()),
            spawn_maintenance(Arc::downgrade(self), self.maintenance_interval),
        ];
        self.tasks.lock().extend(handles);
        tracing::info!(instance_id = %self.instance_id, "gateway background tasks started");
    }

    /// Ties externally spawned tasks (e.g. the Redis bridge) to this gateway.
    pub fn track(&self, handles: impl IntoIterator<Item = JoinHandle<()>>) {
        self.tasks.lock().extend(handles);
    }

    /// Stops every background task.
    pub fn shutdown(&self) {
        for handle in self.tasks.lock().drain(..) {
            handle.abort();
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn pipeline(&self) -> &AuthorizationPipeline {
        &self.pipeline
    }

    pub fn bus(&self) -> &InvalidationBus {
        &self.bus
    }

    pub fn token_cache(&self) -> &TokenCache {
        &self.token_cache
    }

    pub fn filter(&self) -> &Arc<PermissionFilter> {
        &self.filter
    }

    /// Publishes `event` as originating here.
    pub fn publish(&self, event: InvalidationEvent) -> usize {
        let event = if event.origin.is_some() {
            event
        } else {
            event.with_origin(self.instance_id.clone())
        };
        self.bus.publish(event)
    }

    /// Recovers from invalidations this instance may have missed: rebuilds
    /// the filter replica and drops every cached context.
    pub fn resync(&self) {
        tracing::info!(instance_id = %self.instance_id, "resynchronising caches");
        self.filter.request_rebuild();
        self.token_cache.invalidate_all();
    }

    /// One maintenance pass: prune idle TTL stats, flush cache bookkeeping,
    /// publish gauges.
    pub fn run_maintenance(&self) {
        let pruned = self.adaptive.prune_idle();
        let stale = self.token_cache.run_maintenance();
        if pruned > 0 || stale > 0 {
            tracing::debug!(pruned, stale, "gateway maintenance");
        }

        let stats = self.stats();
        metrics::record_token_cache(&stats.token_cache);
        metrics::record_adaptive_ttl(&stats.adaptive_ttl);
        metrics::record_filter(&stats.filter);
        metrics::record_coalescer("permission_check", &stats.permission_checks);
        metrics::record_coalescer("token_load", &stats.token_loads);
    }

    pub fn stats(&self) -> GatewayStats {
        GatewayStats {
            instance_id: self.instance_id.clone(),
            token_cache: self.token_cache.stats(),
            adaptive_ttl: self.adaptive.stats(),
            filter: self.filter.stats(),
            permission_checks: self.checks.stats(),
            token_loads: self.token_loads.stats(),
            bus: self.bus.stats(),
        }
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn spawn_maintenance(gateway: Weak<Gateway>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let Some(gateway) = gateway.upgrade() else {
                break;
            };
            gateway.run_maintenance();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use authedge_core::{Action, InMemoryAuthority, PermissionKey};
    use time::OffsetDateTime;

    fn config() -> AppConfig {
        let mut cfg = AppConfig::default();
        cfg.server.instance_id = Some("gw-a".into());
        cfg.filter.expected_insertions = 1_000;
        cfg.filter.false_positive_rate = 0.001;
        cfg
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
    async fn test_resync_rebuilds_filter_and_clears_tokens() {
        let authority = Arc::new(InMemoryAuthority::new());
        authority.grant(PermissionKey::new("t1", "u1", "/api/orders/**", Action::Read));

        let gateway = Arc::new(Gateway::new(&config(), authority.clone()));
        gateway.start();
        eventually(|| gateway.filter().is_ready()).await;

        let ctx = Arc::new(UserContext::new(
            "u1",
            "t1",
            OffsetDateTime::now_utc() + time::Duration::hours(1),
        ));
        gateway.token_cache().put("tok", ctx, Duration::from_secs(60));

        gateway.resync();
        assert!(gateway.token_cache().get("tok").is_none());

        eventually(|| authority.calls().list_permissions == 2 && gateway.filter().is_ready()).await;
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_start_builds_filter_from_authority() {
        let authority = Arc::new(InMemoryAuthority::new());
        let key = PermissionKey::new("t1", "u1", "/api/orders/**", Action::Read);
        authority.grant(key.clone());

        let gateway = Arc::new(Gateway::new(&config(), authority.clone()));
        assert!(!gateway.filter().is_ready());
        gateway.start();

        eventually(|| gateway.filter().is_ready()).await;
        assert_eq!(authority.calls().list_permissions, 1);
        assert_eq!(gateway.stats().filter.entries, 1);
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_published_revocation_reaches_token_cache() {
        let authority = Arc::new(InMemoryAuthority::new());
        let gateway = Arc::new(Gateway::new(&config(), authority));
        gateway.start();

        let ctx = UserContext::new("u1", "t1", OffsetDateTime::now_utc() + time::Duration::hours(1));
        gateway
            .token_cache()
            .put("tok", Arc::new(ctx), Duration::from_secs(60));

        let delivered = gateway.publish(InvalidationEvent::token_revoked("t1", "u1"));
        assert!(delivered >= 1);
        eventually(|| gateway.token_cache().get("tok").is_none()).await;
        gateway.shutdown();
    }

    #[tokio::test]
    async fn test_publish_stamps_origin() {
        let gateway = Gateway::new(&config(), Arc::new(InMemoryAuthority::new()));
        let mut receiver = gateway.bus().receiver();

        gateway.publish(InvalidationEvent::role_changed("t1", None));
        let event = receiver.recv().await.unwrap();
        assert!(event.is_from("gw-a"));
    }

    #[tokio::test]
    async fn test_stats_snapshot() {
        let gateway = Gateway::new(&config(), Arc::new(InMemoryAuthority::new()));
        gateway.run_maintenance();

        let stats = gateway.stats();
        assert_eq!(stats.instance_id, "gw-a");
        assert_eq!(stats.token_cache.size, 0);
        assert!(!stats.filter.ready);

        let json = serde_json::to_value(&stats).unwrap();
        assert!(json["permission_checks"]["leaders"].is_number());
    }
}
