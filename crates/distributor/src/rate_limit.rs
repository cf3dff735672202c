//! Per-group sliding-window admission
//!
//! Each group keeps two timestamp logs over the configured window: admitted
//! requests (hard limit, `total`) and successful ones (soft limit,
//! `success`). Checking and incrementing happen under one per-group lock, so
//! concurrent callers cannot both take the last slot.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use channel::GroupRateLimit;
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::debug;

use crate::config::{DegradedPolicy, RateLimitConfig};

/// Result of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Soft limit reached; admitted without retries
    Degraded,
    /// Hard limit reached; nothing was counted
    RateLimited,
}

impl Admission {
    pub fn label(&self) -> &'static str {
        match self {
            Admission::Allowed => "allowed",
            Admission::Degraded => "degraded",
            Admission::RateLimited => "rate_limited",
        }
    }
}

#[derive(Default)]
struct Window {
    admitted: VecDeque<Instant>,
    succeeded: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant, window: Duration) {
        for log in [&mut self.admitted, &mut self.succeeded] {
            while log
                .front()
                .is_some_and(|&t| now.duration_since(t) >= window)
            {
                log.pop_front();
            }
        }
    }

    fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.succeeded.is_empty()
    }
}

pub struct RateLimiter {
    config: ArcSwap<RateLimitConfig>,
    windows: RwLock<HashMap<String, Arc<Mutex<Window>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            windows: RwLock::new(HashMap::new()),
        }
    }

    /// Check the group's limits and count the request if admitted.
    pub fn check_and_increment(&self, group: &str) -> Admission {
        self.admit(group).keep()
    }

    /// Like [`check_and_increment`](Self::check_and_increment), but the
    /// increment is undone when the returned guard is dropped without
    /// [`AdmissionGuard::keep`].
    pub fn admit(&self, group: &str) -> AdmissionGuard<'_> {
        let (decision, stamp) = self.try_admit(group);
        metrics::counter!(
            "distributor_rate_limit_decisions_total",
            "decision" => decision.label()
        )
        .increment(1);
        AdmissionGuard {
            limiter: self,
            group: group.to_string(),
            stamp,
            decision,
        }
    }

    fn try_admit(&self, group: &str) -> (Admission, Option<Instant>) {
        let config = self.config.load();
        let limit = config.limit_for(group);
        if !config.enabled || limit.total == 0 {
            return (Admission::Allowed, None);
        }

        let entry = self.window(group);
        let mut window = entry.lock();
        let now = Instant::now();
        window.prune(now, config.window());

        if window.admitted.len() >= limit.total as usize {
            debug!(group, total = limit.total, "hard rate limit reached");
            return (Admission::RateLimited, None);
        }

        let soft_breach = limit.success > 0 && window.succeeded.len() >= limit.success as usize;
        if soft_breach && config.degraded_policy == DegradedPolicy::Reject {
            debug!(group, success = limit.success, "success limit reached, rejecting");
            return (Admission::RateLimited, None);
        }

        window.admitted.push_back(now);
        if soft_breach {
            debug!(group, success = limit.success, "success limit reached, degrading");
            (Admission::Degraded, Some(now))
        } else {
            (Admission::Allowed, Some(now))
        }
    }

    /// Count a successful request against the group's soft limit.
    pub fn record_success(&self, group: &str) {
        let config = self.config.load();
        let limit = config.limit_for(group);
        if !config.enabled || limit.total == 0 || limit.success == 0 {
            return;
        }
        let entry = self.window(group);
        let mut window = entry.lock();
        let now = Instant::now();
        window.prune(now, config.window());
        window.succeeded.push_back(now);
    }

    fn rollback(&self, group: &str, stamp: Instant) {
        let Some(entry) = self.windows.read().get(group).cloned() else {
            return;
        };
        let mut window = entry.lock();
        if let Some(pos) = window.admitted.iter().rposition(|&t| t == stamp) {
            window.admitted.remove(pos);
        }
    }

    fn window(&self, group: &str) -> Arc<Mutex<Window>> {
        if let Some(entry) = self.windows.read().get(group) {
            return Arc::clone(entry);
        }
        Arc::clone(self.windows.write().entry(group.to_string()).or_default())
    }

    /// Requests admitted in the current window.
    pub fn admitted_count(&self, group: &str) -> usize {
        let window = self.config.load().window();
        self.windows
            .read()
            .get(group)
            .map(|entry| {
                let mut w = entry.lock();
                w.prune(Instant::now(), window);
                w.admitted.len()
            })
            .unwrap_or(0)
    }

    /// Drop windows that have no entries left.
    pub fn prune_idle(&self) -> usize {
        let window = self.config.load().window();
        let now = Instant::now();
        let mut windows = self.windows.write();
        let before = windows.len();
        windows.retain(|_, entry| {
            let mut w = entry.lock();
            w.prune(now, window);
            !w.is_empty()
        });
        before - windows.len()
    }

    pub fn config(&self) -> Arc<RateLimitConfig> {
        self.config.load_full()
    }

    /// Replace the whole configuration atomically.
    pub fn replace_config(&self, config: RateLimitConfig) {
        self.config.store(Arc::new(config));
    }

    /// Replace the group threshold map from its serialized form,
    /// `{"group": [total, success], ...}`. The rest of the configuration is
    /// kept. Nothing changes if the input does not parse.
    pub fn replace_groups_from_json(&self, json: &str) -> Result<usize, serde_json::Error> {
        let parsed: HashMap<String, [u32; 2]> = serde_json::from_str(json)?;
        let groups: HashMap<String, GroupRateLimit> = parsed
            .into_iter()
            .map(|(name, [total, success])| (name, GroupRateLimit { total, success }))
            .collect();
        let count = groups.len();
        self.config.rcu(|current| RateLimitConfig {
            groups: groups.clone(),
            ..RateLimitConfig::clone(current)
        });
        Ok(count)
    }
}

/// Holds one admitted request. Dropping it without [`keep`](Self::keep)
/// removes the request from the window again.
pub struct AdmissionGuard<'a> {
    limiter: &'a RateLimiter,
    group: String,
    stamp: Option<Instant>,
    decision: Admission,
}

impl AdmissionGuard<'_> {
    pub fn decision(&self) -> Admission {
        self.decision
    }

    /// Make the increment permanent.
    pub fn keep(mut self) -> Admission {
        self.stamp = None;
        self.decision
    }
}

impl Drop for AdmissionGuard<'_> {
    fn drop(&mut self) {
        if let Some(stamp) = self.stamp.take() {
            self.limiter.rollback(&self.group, stamp);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(total: u32, success: u32) -> RateLimiter {
        let mut config = RateLimitConfig {
            enabled: true,
            ..Default::default()
        };
        config
            .groups
            .insert("default".into(), GroupRateLimit { total, success });
        RateLimiter::new(config)
    }

    #[tokio::test(start_paused = true)]
    async fn hard_limit_blocks_sixth_request() {
        let limiter = limiter(5, 0);
        for _ in 0..5 {
            assert_eq!(limiter.check_and_increment("default"), Admission::Allowed);
        }
        assert_eq!(limiter.check_and_increment("default"), Admission::RateLimited);
        assert_eq!(limiter.admitted_count("default"), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn window_rolls_over() {
        let limiter = limiter(5, 0);
        for _ in 0..5 {
            limiter.check_and_increment("default");
        }
        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(limiter.check_and_increment("default"), Admission::RateLimited);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(limiter.check_and_increment("default"), Admission::Allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn success_limit_degrades() {
        let limiter = limiter(10, 2);
        limiter.check_and_increment("default");
        limiter.record_success("default");
        limiter.check_and_increment("default");
        limiter.record_success("default");
        assert_eq!(limiter.check_and_increment("default"), Admission::Degraded);
        assert_eq!(limiter.admitted_count("default"), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn reject_policy_turns_soft_breach_hard() {
        let limiter = limiter(10, 1);
        let mut config = RateLimitConfig::clone(&limiter.config());
        config.degraded_policy = DegradedPolicy::Reject;
        limiter.replace_config(config);

        limiter.check_and_increment("default");
        limiter.record_success("default");
        assert_eq!(limiter.check_and_increment("default"), Admission::RateLimited);
        assert_eq!(limiter.admitted_count("default"), 1);
    }

    #[test]
    fn zero_total_is_unlimited() {
        let limiter = limiter(0, 0);
        for _ in 0..100 {
            assert_eq!(limiter.check_and_increment("default"), Admission::Allowed);
        }
        assert_eq!(limiter.admitted_count("default"), 0);
    }

    #[test]
    fn disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(RateLimitConfig {
            enabled: false,
            default_limit: GroupRateLimit { total: 1, success: 0 },
            ..Default::default()
        });
        for _ in 0..3 {
            assert_eq!(limiter.check_and_increment("any"), Admission::Allowed);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_guard_rolls_back() {
        let limiter = limiter(1, 0);
        {
            let guard = limiter.admit("default");
            assert_eq!(guard.decision(), Admission::Allowed);
        }
        assert_eq!(limiter.admitted_count("default"), 0);
        assert_eq!(limiter.check_and_increment("default"), Admission::Allowed);
        assert_eq!(limiter.check_and_increment("default"), Admission::RateLimited);
    }

    #[test]
    fn concurrent_admission_never_exceeds_total() {
        let limiter = Arc::new(limiter(50, 0));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check_and_increment("default") == Admission::Allowed)
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[test]
    fn replace_groups_from_json_swaps_thresholds() {
        let limiter = limiter(1, 0);
        let count = limiter
            .replace_groups_from_json(r#"{"default":[3,0],"vip":[100,20]}"#)
            .unwrap();
        assert_eq!(count, 2);
        let config = limiter.config();
        assert_eq!(config.limit_for("default").total, 3);
        assert_eq!(config.limit_for("vip").success, 20);
        assert!(config.enabled);
    }

    #[test]
    fn malformed_json_leaves_config_untouched() {
        let limiter = limiter(1, 0);
        assert!(limiter.replace_groups_from_json(r#"{"default":[-1]}"#).is_err());
        assert_eq!(limiter.config().limit_for("default").total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_windows_are_pruned() {
        let limiter = limiter(5, 0);
        limiter.check_and_increment("default");
        assert_eq!(limiter.prune_idle(), 0);
        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(limiter.prune_idle(), 1);
    }
}
