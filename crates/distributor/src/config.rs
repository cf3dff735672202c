//! Distributor tuning knobs
//!
//! Deserialized from the gateway's TOML configuration. Every field has a
//! default so an absent section behaves sensibly.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use channel::{Group, GroupRateLimit};
use serde::{Deserialize, Serialize};

/// Routing group name that walks `auto_groups` in order.
pub const AUTO_GROUP: &str = "auto";

/// Core resolution settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DistributorConfig {
    /// How often the ability index and quota ledger sync with the stores
    #[serde(default = "default_sync_interval_secs")]
    pub sync_interval_secs: u64,

    /// Upper bound on any single store call
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Cap on the retry budget handed to the caller
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Added to every weight before the weighted draw. Zero keeps weights
    /// exact; a positive value gives zero-weight channels some traffic.
    #[serde(default)]
    pub weight_smoothing: u32,

    /// Cached balances untouched for this long are evicted on sync
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    /// Reservations never reported back are released after this long
    #[serde(default = "default_reservation_ttl_secs")]
    pub reservation_ttl_secs: u64,
}

fn default_sync_interval_secs() -> u64 {
    60
}

fn default_store_timeout_ms() -> u64 {
    2000
}

fn default_max_retries() -> u32 {
    3
}

fn default_cache_ttl_secs() -> u64 {
    600
}

fn default_reservation_ttl_secs() -> u64 {
    900
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            sync_interval_secs: default_sync_interval_secs(),
            store_timeout_ms: default_store_timeout_ms(),
            max_retries: default_max_retries(),
            weight_smoothing: 0,
            cache_ttl_secs: default_cache_ttl_secs(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
        }
    }
}

impl DistributorConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn reservation_ttl(&self) -> Duration {
        Duration::from_secs(self.reservation_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.sync_interval_secs == 0 {
            return Err("distributor.sync_interval_secs must be positive".into());
        }
        if self.store_timeout_ms == 0 {
            return Err("distributor.store_timeout_ms must be positive".into());
        }
        if self.reservation_ttl_secs <= self.sync_interval_secs {
            return Err(
                "distributor.reservation_ttl_secs must exceed sync_interval_secs".into(),
            );
        }
        Ok(())
    }
}

/// Auto-ban thresholds.
#[derive(Debug, Clone, Deserialize)]
pub struct AutoBanConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Consecutive retriable failures before a channel is banned
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// A probe that never reports back frees the probe slot after this long
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_cooldown_secs() -> u64 {
    300
}

fn default_probe_timeout_secs() -> u64 {
    60
}

impl Default for AutoBanConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

impl AutoBanConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.failure_threshold == 0 {
            return Err("auto_ban.failure_threshold must be at least 1".into());
        }
        if self.probe_timeout_secs == 0 {
            return Err("auto_ban.probe_timeout_secs must be positive".into());
        }
        Ok(())
    }
}

/// What a soft (success-count) breach does to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradedPolicy {
    /// Admit with a zero retry budget
    #[default]
    SuppressRetries,
    /// Reject like a hard breach
    Reject,
}

/// Per-group sliding-window request limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_window_minutes")]
    pub window_minutes: u64,

    /// Limit for groups without their own entry. A zero total disables it.
    #[serde(default)]
    pub default_limit: GroupRateLimit,

    #[serde(default)]
    pub groups: HashMap<String, GroupRateLimit>,

    #[serde(default)]
    pub degraded_policy: DegradedPolicy,
}

fn default_window_minutes() -> u64 {
    1
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            window_minutes: default_window_minutes(),
            default_limit: GroupRateLimit::default(),
            groups: HashMap::new(),
            degraded_policy: DegradedPolicy::default(),
        }
    }
}

impl RateLimitConfig {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_minutes * 60)
    }

    /// Effective limit for a group.
    pub fn limit_for(&self, group: &str) -> GroupRateLimit {
        self.groups
            .get(group)
            .copied()
            .unwrap_or(self.default_limit)
    }

    /// Fold in limits declared on individual groups. Those win over the
    /// `[rate_limit.groups]` table.
    pub fn with_group_overrides(mut self, table: &GroupTable) -> Self {
        for group in table.groups() {
            if let Some(limit) = group.rate_limit {
                self.groups.insert(group.name.clone(), limit);
            }
        }
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.window_minutes == 0 {
            return Err("rate_limit.window_minutes must be positive".into());
        }
        Ok(())
    }
}

/// Group declarations as they appear in configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct GroupSettings {
    #[serde(default)]
    pub groups: Vec<Group>,

    /// Groups tried in order when a token asks for `auto`
    #[serde(default)]
    pub auto_groups: Vec<String>,

    /// User group → additional groups its tokens may route through
    #[serde(default)]
    pub user_usable_groups: HashMap<String, Vec<String>>,
}

/// Runtime lookup table built from [`GroupSettings`].
#[derive(Debug, Clone, Default)]
pub struct GroupTable {
    groups: HashMap<String, Group>,
    auto_groups: Vec<String>,
    usable: HashMap<String, HashSet<String>>,
}

impl From<GroupSettings> for GroupTable {
    fn from(settings: GroupSettings) -> Self {
        Self {
            groups: settings
                .groups
                .into_iter()
                .map(|g| (g.name.clone(), g))
                .collect(),
            auto_groups: settings.auto_groups,
            usable: settings
                .user_usable_groups
                .into_iter()
                .map(|(user_group, groups)| (user_group, groups.into_iter().collect()))
                .collect(),
        }
    }
}

impl GroupTable {
    /// Whether a group may be routed through at all.
    pub fn is_usable(&self, name: &str) -> bool {
        if name == AUTO_GROUP {
            return !self.auto_groups.is_empty();
        }
        self.groups.get(name).is_some_and(|g| g.usable)
    }

    /// Whether a user in `user_group` may route through `group`. Users may
    /// always use their own group if it is usable.
    pub fn can_use(&self, user_group: &str, group: &str) -> bool {
        if !self.is_usable(group) {
            return false;
        }
        group == user_group
            || self
                .usable
                .get(user_group)
                .is_some_and(|groups| groups.contains(group))
    }

    pub fn auto_groups(&self) -> &[String] {
        &self.auto_groups
    }

    pub fn get(&self, name: &str) -> Option<&Group> {
        self.groups.get(name)
    }

    pub fn groups(&self) -> impl Iterator<Item = &Group> {
        self.groups.values()
    }

    pub fn validate(&self) -> Result<(), String> {
        for name in &self.auto_groups {
            if name == AUTO_GROUP {
                return Err("auto_groups must not contain \"auto\"".into());
            }
            if !self.groups.contains_key(name) {
                return Err(format!("auto group {name} is not declared in [[groups]]"));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> GroupTable {
        let settings: GroupSettings = toml::from_str(
            r#"
auto_groups = ["default", "vip"]

[[groups]]
name = "default"

[[groups]]
name = "vip"
rate_limit = { total = 100, success = 50 }

[[groups]]
name = "retired"
usable = false

[user_usable_groups]
default = ["vip", "auto"]
"#,
        )
        .unwrap();
        settings.into()
    }

    #[test]
    fn defaults_when_sections_are_empty() {
        let config: DistributorConfig = toml::from_str("").unwrap();
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.weight_smoothing, 0);
        assert_eq!(config.store_timeout(), Duration::from_secs(2));
        assert!(config.validate().is_ok());

        let auto_ban: AutoBanConfig = toml::from_str("").unwrap();
        assert!(auto_ban.enabled);
        assert_eq!(auto_ban.failure_threshold, 3);

        let limits: RateLimitConfig = toml::from_str("").unwrap();
        assert!(!limits.enabled);
        assert_eq!(limits.degraded_policy, DegradedPolicy::SuppressRetries);
    }

    #[test]
    fn zero_threshold_is_rejected() {
        let auto_ban: AutoBanConfig = toml::from_str("failure_threshold = 0").unwrap();
        assert!(auto_ban.validate().is_err());
    }

    #[test]
    fn reservation_ttl_must_outlast_sync() {
        let config: DistributorConfig =
            toml::from_str("sync_interval_secs = 60\nreservation_ttl_secs = 30").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn degraded_policy_parses_snake_case() {
        let limits: RateLimitConfig = toml::from_str(r#"degraded_policy = "reject""#).unwrap();
        assert_eq!(limits.degraded_policy, DegradedPolicy::Reject);
    }

    #[test]
    fn own_group_is_always_usable() {
        let table = table();
        assert!(table.can_use("default", "default"));
        assert!(table.can_use("vip", "vip"));
    }

    #[test]
    fn extra_groups_follow_user_usable_groups() {
        let table = table();
        assert!(table.can_use("default", "vip"));
        assert!(table.can_use("default", AUTO_GROUP));
        assert!(!table.can_use("vip", "default"));
        assert!(!table.can_use("vip", AUTO_GROUP));
    }

    #[test]
    fn unusable_or_unknown_groups_are_denied() {
        let table = table();
        assert!(!table.can_use("retired", "retired"));
        assert!(!table.can_use("default", "nonexistent"));
    }

    #[test]
    fn group_rate_limits_override_table() {
        let table = table();
        let mut limits = RateLimitConfig::default();
        limits.groups.insert(
            "vip".into(),
            GroupRateLimit {
                total: 1,
                success: 0,
            },
        );
        let limits = limits.with_group_overrides(&table);
        assert_eq!(limits.limit_for("vip").total, 100);
        assert_eq!(limits.limit_for("default").total, 0);
    }

    #[test]
    fn auto_groups_must_be_declared() {
        let settings = GroupSettings {
            auto_groups: vec!["ghost".into()],
            ..Default::default()
        };
        assert!(GroupTable::from(settings).validate().is_err());
        assert!(table().validate().is_ok());
    }
}
