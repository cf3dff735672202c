//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The state file path may be overridden by the STORE_PATH env var so the
//! same TOML can be shipped to every environment.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use channel::Group;
use distributor::{
    AutoBanConfig, DistributorConfig, DistributorSettings, GroupSettings, GroupTable,
    RateLimitConfig,
};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Groups tried in order when a token asks for `auto`. Must appear
    /// before the first table in the TOML file.
    #[serde(default)]
    pub auto_groups: Vec<String>,
    pub server: ServerConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub distributor: DistributorConfig,
    #[serde(default)]
    pub auto_ban: AutoBanConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub user_usable_groups: HashMap<String, Vec<String>>,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener; keep it off public interfaces
    #[serde(default = "default_admin_addr")]
    pub admin_addr: SocketAddr,
    #[serde(default = "default_timeout")]
    pub upstream_timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Quota held for a request that does not state `max_tokens`
    #[serde(default = "default_estimated_cost")]
    pub default_estimated_cost: i64,
}

/// Channel/user/token state file
#[derive(Debug, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_path")]
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
        }
    }
}

fn default_admin_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 9090))
}

fn default_timeout() -> u64 {
    120
}

fn default_max_connections() -> usize {
    1000
}

fn default_estimated_cost() -> i64 {
    1000
}

fn default_store_path() -> PathBuf {
    PathBuf::from("gateway-state.json")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(store_path) = std::env::var("STORE_PATH") {
            if !store_path.trim().is_empty() {
                config.store.path = PathBuf::from(store_path.trim());
            }
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        let server = &self.server;
        if server.upstream_timeout_secs == 0 {
            return Err(common::Error::Config(
                "upstream_timeout_secs must be greater than 0".into(),
            ));
        }
        if server.max_connections == 0 {
            return Err(common::Error::Config(
                "max_connections must be greater than 0".into(),
            ));
        }
        if server.default_estimated_cost < 0 {
            return Err(common::Error::Config(
                "default_estimated_cost must not be negative".into(),
            ));
        }
        if server.listen_addr == server.admin_addr {
            return Err(common::Error::Config(format!(
                "listen_addr and admin_addr must differ, both are {}",
                server.listen_addr
            )));
        }

        self.distributor.validate().map_err(common::Error::Config)?;
        self.auto_ban.validate().map_err(common::Error::Config)?;
        self.rate_limit.validate().map_err(common::Error::Config)?;
        self.group_table().validate().map_err(common::Error::Config)?;
        Ok(())
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.server.upstream_timeout_secs)
    }

    pub fn group_table(&self) -> GroupTable {
        GroupSettings {
            groups: self.groups.clone(),
            auto_groups: self.auto_groups.clone(),
            user_usable_groups: self.user_usable_groups.clone(),
        }
        .into()
    }

    /// Everything the distributor is built from.
    pub fn distributor_settings(&self) -> DistributorSettings {
        DistributorSettings {
            distributor: self.distributor.clone(),
            auto_ban: self.auto_ban.clone(),
            rate_limit: self.rate_limit.clone(),
            groups: self.group_table(),
        }
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("gateway.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distributor::DegradedPolicy;
    use std::sync::Mutex;

    /// Serializes tests that read or mutate environment variables.
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    /// SAFETY: Callers must hold ENV_MUTEX to prevent concurrent env mutation.
    unsafe fn set_env(key: &str, val: &str) {
        unsafe { std::env::set_var(key, val) };
    }

    unsafe fn remove_env(key: &str) {
        unsafe { std::env::remove_var(key) };
    }

    const MINIMAL: &str = r#"
[server]
listen_addr = "127.0.0.1:8080"
"#;

    const FULL: &str = r#"
auto_groups = ["default", "vip"]

[server]
listen_addr = "0.0.0.0:3000"
admin_addr = "127.0.0.1:3001"
upstream_timeout_secs = 30
max_connections = 64
default_estimated_cost = 250

[store]
path = "/var/lib/gateway/state.json"

[distributor]
sync_interval_secs = 15
max_retries = 2
weight_smoothing = 1

[auto_ban]
failure_threshold = 5
cooldown_secs = 120

[rate_limit]
enabled = true
window_minutes = 2
default_limit = { total = 100, success = 80 }
degraded_policy = "reject"

[rate_limit.groups]
vip = { total = 1000, success = 900 }

[[groups]]
name = "default"

[[groups]]
name = "vip"
description = "paid tier"

[user_usable_groups]
default = ["auto"]
"#;

    fn write(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, contents).unwrap();
        (dir, path)
    }

    #[test]
    fn test_load_minimal_config_applies_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("STORE_PATH") };
        let (_dir, path) = write(MINIMAL);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.admin_addr, default_admin_addr());
        assert_eq!(config.server.upstream_timeout_secs, 120);
        assert_eq!(config.server.max_connections, 1000);
        assert_eq!(config.store.path, PathBuf::from("gateway-state.json"));
        assert_eq!(config.distributor.sync_interval_secs, 60);
        assert!(config.auto_ban.enabled);
        assert_eq!(config.auto_ban.failure_threshold, 3);
        assert!(!config.rate_limit.enabled);
        assert!(config.groups.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("STORE_PATH") };
        let (_dir, path) = write(FULL);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.upstream_timeout(), Duration::from_secs(30));
        assert_eq!(config.server.default_estimated_cost, 250);
        assert_eq!(config.store.path, PathBuf::from("/var/lib/gateway/state.json"));
        assert_eq!(config.distributor.max_retries, 2);
        assert_eq!(config.auto_ban.failure_threshold, 5);
        assert_eq!(config.rate_limit.window_minutes, 2);
        assert_eq!(config.rate_limit.degraded_policy, DegradedPolicy::Reject);
        assert_eq!(config.rate_limit.limit_for("vip").total, 1000);
        assert_eq!(config.rate_limit.limit_for("default").total, 100);

        let table = config.group_table();
        assert_eq!(table.auto_groups(), ["default", "vip"]);
        assert!(table.can_use("default", "auto"));
        assert!(!table.can_use("default", "vip"));
        assert_eq!(table.get("vip").unwrap().description, "paid tier");
    }

    #[test]
    fn test_store_path_from_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (_dir, path) = write(FULL);

        unsafe { set_env("STORE_PATH", "/tmp/override.json") };
        let config = Config::load(&path).unwrap();
        unsafe { remove_env("STORE_PATH") };

        assert_eq!(config.store.path, PathBuf::from("/tmp/override.json"));
    }

    #[test]
    fn test_load_missing_file() {
        let result = Config::load(Path::new("/nonexistent/path/gateway.toml"));
        assert!(result.is_err());
    }

    #[test]
    fn test_load_invalid_toml() {
        let (_dir, path) = write("not valid {{{{ toml");
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (_dir, path) = write(&format!("{MINIMAL}upstream_timeout_secs = 0\n"));
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("upstream_timeout_secs"), "got: {err}");
    }

    #[test]
    fn test_zero_max_connections_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (_dir, path) = write(&format!("{MINIMAL}max_connections = 0\n"));
        assert!(Config::load(&path).is_err());
    }

    #[test]
    fn test_shared_listen_and_admin_addr_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (_dir, path) = write(&format!("{MINIMAL}admin_addr = \"127.0.0.1:8080\"\n"));
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("must differ"), "got: {err}");
    }

    #[test]
    fn test_zero_failure_threshold_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let (_dir, path) = write(&format!("{MINIMAL}\n[auto_ban]\nfailure_threshold = 0\n"));
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("failure_threshold"), "got: {err}");
    }

    #[test]
    fn test_undeclared_auto_group_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let toml = format!("auto_groups = [\"ghost\"]\n{MINIMAL}");
        let (_dir, path) = write(&toml);
        let err = Config::load(&path).unwrap_err().to_string();
        assert!(err.contains("ghost"), "got: {err}");
    }

    #[test]
    fn test_distributor_settings_carry_sections() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("STORE_PATH") };
        let (_dir, path) = write(FULL);
        let settings = Config::load(&path).unwrap().distributor_settings();
        assert_eq!(settings.distributor.weight_smoothing, 1);
        assert_eq!(settings.auto_ban.cooldown(), Duration::from_secs(120));
        assert!(settings.rate_limit.enabled);
        assert!(settings.groups.is_usable("auto"));
    }

    #[test]
    fn test_resolve_path_cli_arg() {
        let path = Config::resolve_path(Some("/custom/path.toml"));
        assert_eq!(path, PathBuf::from("/custom/path.toml"));
    }

    #[test]
    fn test_resolve_path_env_var() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/path.toml") };
        let path = Config::resolve_path(None);
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/env/path.toml"));
    }

    #[test]
    fn test_resolve_path_default() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(Config::resolve_path(None), PathBuf::from("gateway.toml"));
    }

    #[test]
    fn test_resolve_path_cli_overrides_env() {
        let _lock = ENV_MUTEX.lock().unwrap();
        unsafe { set_env("CONFIG_PATH", "/env/should-lose.toml") };
        let path = Config::resolve_path(Some("/cli/wins.toml"));
        unsafe { remove_env("CONFIG_PATH") };
        assert_eq!(path, PathBuf::from("/cli/wins.toml"));
    }
}
