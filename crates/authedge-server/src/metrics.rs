//! Prometheus metrics for the AuthEdge gateway.
//!
//! This module provides:
//! - Authorization decision metrics (outcome counts, shortcut count, latency)
//! - Cache gauges (token cache, adaptive TTL, permission filter, coalescers)
//! - Invalidation event counts

use authedge_cache::{AdaptiveTtlStats, CoalescerStats, FilterStats, TokenCacheStats};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global Prometheus handle for rendering metrics.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    // Decisions
    pub const AUTHZ_DECISIONS_TOTAL: &str = "authz_decisions_total";
    pub const AUTHZ_FILTER_SHORTCUT_TOTAL: &str = "authz_filter_shortcut_total";
    pub const AUTHZ_DECISION_DURATION_SECONDS: &str = "authz_decision_duration_seconds";

    // Token cache
    pub const TOKEN_CACHE_ENTRIES: &str = "token_cache_entries";
    pub const TOKEN_CACHE_HITS_TOTAL: &str = "token_cache_hits_total";
    pub const TOKEN_CACHE_MISSES_TOTAL: &str = "token_cache_misses_total";
    pub const TOKEN_CACHE_EVICTIONS_TOTAL: &str = "token_cache_evictions_total";
    pub const REVOKED_TOKENS_BLOCKED_TOTAL: &str = "revoked_tokens_blocked_total";
    pub const ADAPTIVE_TTL_TRACKED_KEYS: &str = "adaptive_ttl_tracked_keys";

    // Permission filter
    pub const FILTER_GENERATION: &str = "permission_filter_generation";
    pub const FILTER_READY: &str = "permission_filter_ready";
    pub const FILTER_INCONSISTENCIES_TOTAL: &str = "permission_filter_inconsistencies_total";

    // Coalescing
    pub const COALESCER_IN_FLIGHT: &str = "coalescer_in_flight";
    pub const COALESCER_DEDUP_RATIO: &str = "coalescer_dedup_ratio";

    // Invalidation
    pub const INVALIDATION_EVENTS_TOTAL: &str = "invalidation_events_total";
}

/// Initialize the Prometheus metrics exporter.
///
/// Returns `true` if initialization succeeded, `false` if already initialized.
pub fn init_metrics() -> bool {
    if PROMETHEUS_HANDLE.get().is_some() {
        tracing::debug!("Prometheus metrics already initialized");
        return false;
    }

    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            if PROMETHEUS_HANDLE.set(handle).is_err() {
                tracing::warn!("Failed to store Prometheus handle (already set)");
                return false;
            }
            tracing::info!("Prometheus metrics initialized");
            true
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install Prometheus recorder");
            false
        }
    }
}

/// Render all metrics in Prometheus text format.
///
/// Returns `None` if metrics were not initialized.
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|handle| handle.render())
}

// =============================================================================
// Decision Metrics
// =============================================================================

/// Record one authorization decision.
pub fn record_decision(outcome: &'static str, stage: &'static str, duration: Duration) {
    counter!(
        names::AUTHZ_DECISIONS_TOTAL,
        "outcome" => outcome,
        "stage" => stage
    )
    .increment(1);

    histogram!(names::AUTHZ_DECISION_DURATION_SECONDS, "outcome" => outcome)
        .record(duration.as_secs_f64());
}

/// Record a denial answered by the permission filter alone.
pub fn record_filter_shortcut() {
    counter!(names::AUTHZ_FILTER_SHORTCUT_TOTAL).increment(1);
}

// =============================================================================
// Cache Metrics
// =============================================================================

pub fn record_token_cache(stats: &TokenCacheStats) {
    gauge!(names::TOKEN_CACHE_ENTRIES).set(stats.size as f64);
    counter!(names::TOKEN_CACHE_HITS_TOTAL).absolute(stats.hits);
    counter!(names::TOKEN_CACHE_MISSES_TOTAL).absolute(stats.misses);
    counter!(names::TOKEN_CACHE_EVICTIONS_TOTAL).absolute(stats.evictions);
    counter!(names::REVOKED_TOKENS_BLOCKED_TOTAL).absolute(stats.revocations.blocked);
}

pub fn record_adaptive_ttl(stats: &AdaptiveTtlStats) {
    gauge!(names::ADAPTIVE_TTL_TRACKED_KEYS).set(stats.tracked_keys as f64);
}

pub fn record_filter(stats: &FilterStats) {
    gauge!(names::FILTER_GENERATION).set(stats.generation as f64);
    gauge!(names::FILTER_READY).set(if stats.ready { 1.0 } else { 0.0 });
    counter!(names::FILTER_INCONSISTENCIES_TOTAL).absolute(stats.inconsistencies);
}

/// `name` distinguishes the permission-check and token-load coalescers.
pub fn record_coalescer(name: &'static str, stats: &CoalescerStats) {
    gauge!(names::COALESCER_IN_FLIGHT, "coalescer" => name).set(stats.in_flight as f64);
    gauge!(names::COALESCER_DEDUP_RATIO, "coalescer" => name).set(stats.dedup_rate() / 100.0);
}

// =============================================================================
// Invalidation Metrics
// =============================================================================

/// Record an invalidation event. `source` is `local` or `remote`.
pub fn record_invalidation(kind: &'static str, source: &'static str) {
    counter!(
        names::INVALIDATION_EVENTS_TOTAL,
        "kind" => kind,
        "source" => source
    )
    .increment(1);
}
