//! Token and user records, and the keys their balances are cached under

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;

use common::Secret;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    #[default]
    Enabled,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: i64,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub email: String,
    pub group: String,
    /// Remaining balance in quota units
    #[serde(default)]
    pub quota: i64,
    #[serde(default)]
    pub status: UserStatus,
    /// Opaque per-user preferences passed through to downstream code
    #[serde(default)]
    pub setting: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenRecord {
    pub id: i64,
    pub user_id: i64,
    pub key: Secret<String>,
    #[serde(default)]
    pub name: String,
    /// Empty means "use the owning user's group"
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub unlimited: bool,
    #[serde(default)]
    pub remain_quota: i64,
    #[serde(default)]
    pub model_limits_enabled: bool,
    #[serde(default)]
    pub model_limits: BTreeSet<String>,
    /// Client addresses this token may be used from; empty allows any
    #[serde(default)]
    pub allow_ips: BTreeSet<IpAddr>,
    /// Routes every request of this token to one channel
    #[serde(default)]
    pub pinned_channel: Option<i64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Subject of a quota balance. Its `Display` form is the deterministic
/// cache key (`user:42`, `token:7`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubjectKey {
    User(i64),
    Token(i64),
}

impl fmt::Display for SubjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubjectKey::User(id) => write!(f, "user:{id}"),
            SubjectKey::Token(id) => write!(f, "token:{id}"),
        }
    }
}
