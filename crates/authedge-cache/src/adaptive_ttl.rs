//! Adaptive cache lifetimes driven by observed access frequency.
//!
//! Each tracked key keeps an exponential moving average of the interval
//! between accesses. The inverse of that interval is the key's access rate,
//! which maps onto a target TTL:
//!
//! ```text
//! rate <= cold_rate             → min_ttl
//! rate >= hot_rate              → max_ttl
//! cold_rate < rate < hot_rate   → log-interpolated between the two
//! ```
//!
//! A key's assigned TTL only moves toward its target once per observation
//! window, and by at most `step` (a multiplicative factor) each time, so a
//! short burst cannot jump a key straight to `max_ttl`.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;

/// Tuning knobs for [`AdaptiveTtlController`].
#[derive(Debug, Clone)]
pub struct AdaptiveTtlConfig {
    pub min_ttl: Duration,
    pub max_ttl: Duration,
    /// Largest factor a TTL may grow or shrink by per window. Must be > 1.
    pub step: f64,
    pub window: Duration,
    /// Weight of the newest interval in the moving average, in `(0, 1]`.
    pub alpha: f64,
    /// Accesses per second at or above which a key is hot.
    pub hot_rate: f64,
    /// Accesses per second at or below which a key is cold.
    pub cold_rate: f64,
    pub max_tracked_keys: usize,
    /// Keys not accessed for this long are dropped by [`AdaptiveTtlController::prune_idle`].
    pub idle_after: Duration,
}

impl Default for AdaptiveTtlConfig {
    fn default() -> Self {
        Self {
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(3600),
            step: 2.0,
            window: Duration::from_secs(10),
            alpha: 0.3,
            hot_rate: 1.0,
            cold_rate: 1.0 / 300.0,
            max_tracked_keys: 100_000,
            idle_after: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug)]
struct KeyStats {
    accesses: u64,
    last_access: Instant,
    /// Moving average of the inter-access interval, in seconds.
    ema_interval: Option<f64>,
    assigned_ttl: Option<Duration>,
    assigned_at: Option<Instant>,
}

impl KeyStats {
    fn new(now: Instant) -> Self {
        Self {
            accesses: 1,
            last_access: now,
            ema_interval: None,
            assigned_ttl: None,
            assigned_at: None,
        }
    }

    /// Accesses per second, once at least two accesses were seen.
    fn rate(&self) -> Option<f64> {
        if self.accesses < 2 {
            return None;
        }
        self.ema_interval
            .map(|interval| 1.0 / interval.max(f64::EPSILON))
    }
}

/// Aggregate view of the controller, exposed on `/cache/stats`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AdaptiveTtlStats {
    pub tracked_keys: usize,
    pub hot_keys: usize,
    pub cold_keys: usize,
    /// Accesses not tracked because the key limit was reached.
    pub untracked_accesses: u64,
    pub pruned_keys: u64,
}

/// Per-key TTL controller.
///
/// All methods are synchronous and infallible; the map is sharded so
/// concurrent callers on different keys do not contend.
pub struct AdaptiveTtlController<K> {
    config: AdaptiveTtlConfig,
    keys: DashMap<K, KeyStats>,
    untracked: AtomicU64,
    pruned: AtomicU64,
}

impl<K> AdaptiveTtlController<K>
where
    K: Hash + Eq + Clone,
{
    pub fn new(config: AdaptiveTtlConfig) -> Self {
        Self {
            config,
            keys: DashMap::new(),
            untracked: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &AdaptiveTtlConfig {
        &self.config
    }

    pub fn record_access(&self, key: &K) {
        self.record_access_at(key, Instant::now());
    }

    /// [`record_access`](Self::record_access) with an explicit clock.
    pub fn record_access_at(&self, key: &K, now: Instant) {
        if let Some(mut stats) = self.keys.get_mut(key) {
            let interval = now.saturating_duration_since(stats.last_access).as_secs_f64();
            stats.ema_interval = Some(match stats.ema_interval {
                Some(ema) => self.config.alpha * interval + (1.0 - self.config.alpha) * ema,
                None => interval,
            });
            stats.accesses += 1;
            stats.last_access = now;
            return;
        }

        if self.keys.len() >= self.config.max_tracked_keys {
            self.untracked.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.keys.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                // Lost the race to another first access.
                let stats = entry.get_mut();
                stats.accesses += 1;
                stats.last_access = now;
            }
            Entry::Vacant(entry) => {
                entry.insert(KeyStats::new(now));
            }
        }
    }

    pub fn compute_ttl(&self, key: &K, base: Duration) -> Duration {
        self.compute_ttl_at(key, base, Instant::now())
    }

    /// [`compute_ttl`](Self::compute_ttl) with an explicit clock.
    ///
    /// Untracked keys get `base` clamped to the configured bounds. Tracked
    /// keys start from `base` and move toward their target once per window.
    pub fn compute_ttl_at(&self, key: &K, base: Duration, now: Instant) -> Duration {
        let base = self.clamp(base);
        let Some(mut stats) = self.keys.get_mut(key) else {
            return base;
        };

        let current = stats.assigned_ttl.unwrap_or(base);
        let window_elapsed = stats
            .assigned_at
            .is_none_or(|at| now.saturating_duration_since(at) >= self.config.window);
        if !window_elapsed {
            return current;
        }

        let target = self.target_ttl(stats.rate());
        let next = self.step_toward(current, target);
        stats.assigned_ttl = Some(next);
        stats.assigned_at = Some(now);
        next
    }

    /// Forgets everything observed about `key`.
    pub fn clear(&self, key: &K) {
        self.keys.remove(key);
    }

    pub fn prune_idle(&self) -> usize {
        self.prune_idle_at(Instant::now())
    }

    /// Drops keys idle for longer than `idle_after`. Returns how many.
    pub fn prune_idle_at(&self, now: Instant) -> usize {
        let before = self.keys.len();
        let idle_after = self.config.idle_after;
        self.keys
            .retain(|_, stats| now.saturating_duration_since(stats.last_access) < idle_after);
        let removed = before.saturating_sub(self.keys.len());
        self.pruned.fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.len()
    }

    pub fn stats(&self) -> AdaptiveTtlStats {
        let mut hot_keys = 0;
        let mut cold_keys = 0;
        for entry in self.keys.iter() {
            match entry.rate() {
                Some(rate) if rate >= self.config.hot_rate => hot_keys += 1,
                Some(rate) if rate > self.config.cold_rate => {}
                _ => cold_keys += 1,
            }
        }

        AdaptiveTtlStats {
            tracked_keys: self.keys.len(),
            hot_keys,
            cold_keys,
            untracked_accesses: self.untracked.load(Ordering::Relaxed),
            pruned_keys: self.pruned.load(Ordering::Relaxed),
        }
    }

    fn clamp(&self, ttl: Duration) -> Duration {
        ttl.clamp(self.config.min_ttl, self.config.max_ttl)
    }

    /// Target TTL for an access rate. `None` (a single access) is cold.
    fn target_ttl(&self, rate: Option<f64>) -> Duration {
        let (min, max) = (self.config.min_ttl, self.config.max_ttl);
        let Some(rate) = rate else {
            return min;
        };
        if rate >= self.config.hot_rate {
            return max;
        }
        if rate <= self.config.cold_rate {
            return min;
        }

        let span = (self.config.hot_rate / self.config.cold_rate).ln();
        let position = (rate / self.config.cold_rate).ln() / span;
        let ratio = max.as_secs_f64() / min.as_secs_f64().max(f64::EPSILON);
        self.clamp(Duration::from_secs_f64(
            min.as_secs_f64() * ratio.powf(position),
        ))
    }

    fn step_toward(&self, current: Duration, target: Duration) -> Duration {
        let step = self.config.step.max(1.0);
        let current_secs = current.as_secs_f64();
        let bounded = target
            .as_secs_f64()
            .clamp(current_secs / step, current_secs * step);
        self.clamp(Duration::from_secs_f64(bounded))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller() -> AdaptiveTtlController<&'static str> {
        AdaptiveTtlController::new(AdaptiveTtlConfig {
            min_ttl: Duration::from_secs(60),
            max_ttl: Duration::from_secs(3600),
            step: 2.0,
            window: Duration::from_secs(10),
            alpha: 0.5,
            hot_rate: 1.0,
            cold_rate: 0.01,
            max_tracked_keys: 4,
            idle_after: Duration::from_secs(600),
        })
    }

    fn hammer(
        ctl: &AdaptiveTtlController<&'static str>,
        key: &'static str,
        start: Instant,
        every: Duration,
        n: u32,
    ) -> Instant {
        let mut now = start;
        for _ in 0..n {
            ctl.record_access_at(&key, now);
            now += every;
        }
        now
    }

    #[test]
    fn test_untracked_key_gets_clamped_base() {
        let ctl = controller();
        let base = Duration::from_secs(300);
        assert_eq!(ctl.compute_ttl(&"nobody", base), base);
        assert_eq!(
            ctl.compute_ttl(&"nobody", Duration::from_secs(5)),
            Duration::from_secs(60)
        );
    }

    #[test]
    fn test_hot_key_outlives_cold_key() {
        let ctl = controller();
        let start = Instant::now();
        let base = Duration::from_secs(300);

        let now = hammer(&ctl, "hot", start, Duration::from_millis(50), 100);
        ctl.record_access_at(&"cold", start);

        let hot = ctl.compute_ttl_at(&"hot", base, now);
        let cold = ctl.compute_ttl_at(&"cold", base, now);

        assert!(hot >= cold, "hot {hot:?} < cold {cold:?}");
        assert!(hot <= Duration::from_secs(3600));
        assert!(cold >= Duration::from_secs(60));
    }

    #[test]
    fn test_step_limits_movement_per_window() {
        let ctl = controller();
        let start = Instant::now();
        let base = Duration::from_secs(300);
        let mut now = hammer(&ctl, "hot", start, Duration::from_millis(10), 50);

        // First window: at most doubled.
        assert_eq!(ctl.compute_ttl_at(&"hot", base, now), Duration::from_secs(600));
        // Same window: unchanged.
        now += Duration::from_secs(1);
        assert_eq!(ctl.compute_ttl_at(&"hot", base, now), Duration::from_secs(600));

        // Subsequent windows keep climbing until max.
        let mut ttl = Duration::ZERO;
        for _ in 0..10 {
            now = hammer(&ctl, "hot", now + Duration::from_secs(10), Duration::from_millis(10), 20);
            ttl = ctl.compute_ttl_at(&"hot", base, now);
        }
        assert_eq!(ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_cold_key_decays_to_min() {
        let ctl = controller();
        let mut now = Instant::now();
        ctl.record_access_at(&"cold", now);

        let mut ttl = Duration::ZERO;
        for _ in 0..5 {
            now += Duration::from_secs(10);
            ttl = ctl.compute_ttl_at(&"cold", Duration::from_secs(300), now);
        }
        assert_eq!(ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_target_monotone_in_rate() {
        let ctl = controller();
        let rates = [0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 10.0];
        let ttls: Vec<Duration> = rates.iter().map(|r| ctl.target_ttl(Some(*r))).collect();
        assert!(ttls.windows(2).all(|w| w[0] <= w[1]), "{ttls:?}");
    }

    #[test]
    fn test_tracking_is_bounded() {
        let ctl = controller();
        for key in ["a", "b", "c", "d", "e", "f"] {
            ctl.record_access(&key);
        }
        let stats = ctl.stats();
        assert_eq!(stats.tracked_keys, 4);
        assert_eq!(stats.untracked_accesses, 2);
    }

    #[test]
    fn test_prune_idle_and_clear() {
        let ctl = controller();
        let start = Instant::now();
        ctl.record_access_at(&"old", start);
        ctl.record_access_at(&"fresh", start + Duration::from_secs(590));

        assert_eq!(ctl.prune_idle_at(start + Duration::from_secs(700)), 1);
        assert_eq!(ctl.tracked_keys(), 1);

        ctl.clear(&"fresh");
        assert_eq!(ctl.tracked_keys(), 0);
        assert_eq!(ctl.stats().pruned_keys, 1);
    }
}
