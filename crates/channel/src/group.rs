//! Groups: tenant/billing tiers with their own channel access and rate limits

use serde::{Deserialize, Serialize};

/// Admission thresholds over the rate-limit window.
///
/// `total = 0` disables enforcement for the group entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupRateLimit {
    /// Hard cap on admitted requests per window
    pub total: u32,
    /// Soft cap on successful requests per window
    #[serde(default)]
    pub success: u32,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub usable: bool,
    /// Overrides the global default thresholds for this group
    #[serde(default)]
    pub rate_limit: Option<GroupRateLimit>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            usable: true,
            rate_limit: None,
        }
    }
}
