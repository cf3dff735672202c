//! Channel records as read by the distributor
//!
//! A channel is owned and mutated by the admin layer. The distributor only
//! reads snapshots of it, except for status flips driven by auto-ban.

use std::collections::{BTreeMap, BTreeSet};

use common::Secret;
use serde::{Deserialize, Serialize};

use crate::vendor::ChannelType;

/// Enablement status of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    #[default]
    Enabled,
    /// Disabled by an operator; never routed to and never probed.
    ManuallyDisabled,
    /// Disabled by auto-ban; probed again once the cooldown elapses.
    AutoDisabled,
}

impl ChannelStatus {
    pub fn label(&self) -> &'static str {
        match self {
            ChannelStatus::Enabled => "enabled",
            ChannelStatus::ManuallyDisabled => "manually_disabled",
            ChannelStatus::AutoDisabled => "auto_disabled",
        }
    }
}

/// How a channel holding several credentials picks one per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MultiKeyMode {
    #[default]
    Random,
    Polling,
}

fn default_true() -> bool {
    true
}

/// A configured upstream vendor account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    /// Overrides the vendor's default base URL when set
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub status: ChannelStatus,
    /// Higher tiers are tried first
    #[serde(default)]
    pub priority: i64,
    /// Relative share within a priority tier
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub settings: serde_json::Map<String, serde_json::Value>,
    /// Vendor-specific secondary setting (API version, region, plugin, bot id)
    #[serde(default)]
    pub other: String,
    #[serde(default)]
    pub param_override: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub header_override: BTreeMap<String, String>,
    /// Requested model name → upstream model name
    #[serde(default)]
    pub model_mapping: BTreeMap<String, String>,
    /// Upstream status code → status code shown to the client
    #[serde(default)]
    pub status_code_mapping: BTreeMap<String, String>,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub keys: Vec<Secret<String>>,
    #[serde(default)]
    pub multi_key_mode: MultiKeyMode,
    /// Indexes into `keys` that must not be handed out
    #[serde(default)]
    pub disabled_keys: BTreeSet<usize>,
    /// Whether repeated failures may automatically disable this channel
    #[serde(default = "default_true")]
    pub auto_ban: bool,
    #[serde(default)]
    pub created_time: i64,
}

impl Channel {
    /// Effective base URL: the channel's own, else the vendor default.
    pub fn base_url(&self) -> &str {
        match self.base_url.as_deref() {
            Some(url) if !url.trim().is_empty() => url.trim_end_matches('/'),
            _ => self.channel_type.default_base_url(),
        }
    }

    pub fn is_multi_key(&self) -> bool {
        self.keys.len() > 1
    }

    pub fn key_enabled(&self, index: usize) -> bool {
        index < self.keys.len() && !self.disabled_keys.contains(&index)
    }

    /// Model names this channel accepts: its model list plus mapping sources.
    pub fn eligible_models(&self) -> BTreeSet<&str> {
        self.models
            .iter()
            .map(|m| m.trim())
            .chain(self.model_mapping.keys().map(|m| m.trim()))
            .filter(|m| !m.is_empty())
            .collect()
    }

    pub fn in_group(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.trim() == group)
    }

    /// Model name to send upstream after applying the model mapping.
    pub fn upstream_model(&self, requested: &str) -> String {
        match self.model_mapping.get(requested) {
            Some(mapped) if !mapped.trim().is_empty() => mapped.trim().to_string(),
            _ => requested.to_string(),
        }
    }

    /// Whether the channel may be placed in the ability index. Auto-disabled
    /// channels stay indexed so auto-ban can probe them after cooldown.
    pub fn is_routable(&self) -> bool {
        self.status != ChannelStatus::ManuallyDisabled
    }
}
