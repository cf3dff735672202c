//! Request inputs and the routing context handed back to the relay

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

use channel::{Channel, ChannelType, TokenRecord, UserRecord, UserStatus};
use common::Secret;
use tokio::time::Instant;

use crate::multi_key::PickedKey;
use crate::quota::ReservationId;

/// What the authenticated token allows.
#[derive(Debug, Clone)]
pub struct TokenScope {
    pub id: i64,
    pub key: Secret<String>,
    /// Empty means the owning user's group
    pub group: String,
    pub unlimited: bool,
    pub pinned_channel: Option<i64>,
    pub model_limits_enabled: bool,
    pub model_limits: BTreeSet<String>,
    /// Empty allows any client address
    pub allow_ips: BTreeSet<IpAddr>,
}

impl From<&TokenRecord> for TokenScope {
    fn from(token: &TokenRecord) -> Self {
        Self {
            id: token.id,
            key: token.key.clone(),
            group: token.group.trim().to_string(),
            unlimited: token.unlimited,
            pinned_channel: token.pinned_channel,
            model_limits_enabled: token.model_limits_enabled,
            model_limits: token.model_limits.clone(),
            allow_ips: token.allow_ips.clone(),
        }
    }
}

impl TokenScope {
    pub fn allows_model(&self, model: &str) -> bool {
        !self.model_limits_enabled || self.model_limits.contains(model)
    }

    /// A token with an address list only accepts clients whose address is
    /// known and listed.
    pub fn allows_ip(&self, ip: Option<IpAddr>) -> bool {
        self.allow_ips.is_empty() || ip.is_some_and(|ip| self.allow_ips.contains(&ip))
    }
}

/// The user a request is billed to.
#[derive(Debug, Clone)]
pub struct UserScope {
    pub id: i64,
    pub group: String,
    pub quota: i64,
    pub status: UserStatus,
    pub email: String,
    pub setting: serde_json::Value,
}

impl From<&UserRecord> for UserScope {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id,
            group: user.group.trim().to_string(),
            quota: user.quota,
            status: user.status,
            email: user.email.clone(),
            setting: user.setting.clone(),
        }
    }
}

/// Input to `Distributor::resolve`.
#[derive(Debug, Clone)]
pub struct ResolveRequest {
    pub model: String,
    pub token: TokenScope,
    pub user: UserScope,
    /// Quota held while the request is in flight
    pub estimated_cost: i64,
    /// Zero for the first try
    pub attempt: u32,
    /// Channels already tried for this request
    pub exclude: Vec<i64>,
    /// Peer address of the client, when the transport knows it
    pub client_ip: Option<IpAddr>,
}

impl ResolveRequest {
    pub fn new(
        model: impl Into<String>,
        token: TokenScope,
        user: UserScope,
        estimated_cost: i64,
    ) -> Self {
        Self {
            model: model.into(),
            token,
            user,
            estimated_cost,
            attempt: 0,
            exclude: Vec::new(),
            client_ip: None,
        }
    }

    pub fn with_client_ip(mut self, ip: IpAddr) -> Self {
        self.client_ip = Some(ip);
        self
    }

    /// The follow-up request after `failed_channel` did not answer.
    pub fn retry(&self, failed_channel: i64) -> Self {
        let mut next = self.clone();
        next.attempt += 1;
        if !next.exclude.contains(&failed_channel) {
            next.exclude.push(failed_channel);
        }
        next
    }

    /// Group the request asks for: the token's, else the user's.
    pub fn requested_group(&self) -> &str {
        if self.token.group.is_empty() {
            &self.user.group
        } else {
            &self.token.group
        }
    }
}

/// Per-request view of the chosen channel.
#[derive(Debug, Clone)]
pub struct ChannelRoute {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    pub created_time: i64,
    pub base_url: String,
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub other: String,
    pub param_override: serde_json::Map<String, serde_json::Value>,
    pub header_override: BTreeMap<String, String>,
    pub organization: Option<String>,
    pub auto_ban: bool,
    pub model_mapping: BTreeMap<String, String>,
    pub status_code_mapping: BTreeMap<String, String>,
    pub is_multi_key: bool,
    pub key_index: usize,
    pub key: Secret<String>,
    /// Model name to send upstream after mapping
    pub upstream_model: String,
}

impl ChannelRoute {
    pub fn new(channel: &Channel, key: PickedKey, model: &str) -> Self {
        Self {
            id: channel.id,
            name: channel.name.clone(),
            channel_type: channel.channel_type,
            created_time: channel.created_time,
            base_url: channel.base_url().to_string(),
            settings: channel.settings.clone(),
            other: channel.other.clone(),
            param_override: channel.param_override.clone(),
            header_override: channel.header_override.clone(),
            organization: channel.organization.clone(),
            auto_ban: channel.auto_ban,
            model_mapping: channel.model_mapping.clone(),
            status_code_mapping: channel.status_code_mapping.clone(),
            is_multi_key: channel.is_multi_key(),
            key_index: key.index,
            key: key.key,
            upstream_model: channel.upstream_model(model),
        }
    }

    /// The vendor-specific secondary setting carried in `other`, under the
    /// name that vendor uses for it.
    pub fn secondary_setting(&self) -> Option<(&'static str, &str)> {
        let value = self.other.trim();
        if value.is_empty() {
            return None;
        }
        let name = match self.channel_type {
            ChannelType::Azure
            | ChannelType::Xunfei
            | ChannelType::Gemini
            | ChannelType::Cloudflare
            | ChannelType::MokaAi => "api_version",
            ChannelType::VertexAi => "region",
            ChannelType::Ali => "plugin",
            ChannelType::Coze => "bot_id",
            _ => return None,
        };
        Some((name, value))
    }

    /// Status code to show the client for an upstream status.
    pub fn map_status(&self, upstream: u16) -> u16 {
        self.status_code_mapping
            .get(&upstream.to_string())
            .and_then(|s| s.trim().parse().ok())
            .unwrap_or(upstream)
    }
}

/// Everything the relay needs for one attempt. Built once by `resolve` and
/// only read afterwards.
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub channel: ChannelRoute,
    pub token: TokenScope,
    pub user: UserScope,
    /// Concrete group the channel was chosen from
    pub group: String,
    /// The group `auto` resolved to, if the request used it
    pub auto_group: Option<String>,
    /// Model as requested
    pub model: String,
    pub reservation: ReservationId,
    pub estimated_cost: i64,
    /// Admitted past the soft rate limit
    pub degraded: bool,
    /// Further attempts the caller may make for this request
    pub retry_budget: u32,
    pub attempt: u32,
    /// This attempt is the single recovery probe of a banned channel
    pub probe: bool,
    pub resolved_at: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(channel_type: ChannelType, other: &str) -> ChannelRoute {
        let mut channel: Channel = serde_json::from_value(serde_json::json!({
            "id": 1,
            "name": "c",
            "type": channel_type.id(),
            "keys": ["sk"],
        }))
        .unwrap();
        channel.other = other.into();
        channel.status_code_mapping.insert("429".into(), "503".into());
        let key = PickedKey {
            index: 0,
            key: "sk".into(),
        };
        ChannelRoute::new(&channel, key, "gpt-4")
    }

    fn token() -> TokenScope {
        TokenScope {
            id: 1,
            key: "sk-token".into(),
            group: String::new(),
            unlimited: false,
            pinned_channel: None,
            model_limits_enabled: false,
            model_limits: BTreeSet::new(),
            allow_ips: BTreeSet::new(),
        }
    }

    fn user() -> UserScope {
        UserScope {
            id: 1,
            group: "default".into(),
            quota: 100,
            status: UserStatus::Enabled,
            email: String::new(),
            setting: serde_json::Value::Null,
        }
    }

    #[test]
    fn secondary_setting_named_per_vendor() {
        assert_eq!(
            route(ChannelType::Azure, "2024-02-01").secondary_setting(),
            Some(("api_version", "2024-02-01"))
        );
        assert_eq!(
            route(ChannelType::VertexAi, "us-central1").secondary_setting(),
            Some(("region", "us-central1"))
        );
        assert_eq!(route(ChannelType::OpenAI, "x").secondary_setting(), None);
        assert_eq!(route(ChannelType::Coze, " ").secondary_setting(), None);
    }

    #[test]
    fn status_mapping_applies() {
        let route = route(ChannelType::OpenAI, "");
        assert_eq!(route.map_status(429), 503);
        assert_eq!(route.map_status(500), 500);
    }

    #[test]
    fn requested_group_prefers_token() {
        let mut request = ResolveRequest::new("gpt-4", token(), user(), 10);
        assert_eq!(request.requested_group(), "default");
        request.token.group = "vip".into();
        assert_eq!(request.requested_group(), "vip");
    }

    #[test]
    fn retry_accumulates_exclusions() {
        let first = ResolveRequest::new("gpt-4", token(), user(), 10);
        let second = first.retry(3).retry(3).retry(5);
        assert_eq!(second.attempt, 3);
        assert_eq!(second.exclude, vec![3, 5]);
        assert_eq!(first.attempt, 0);
    }

    #[test]
    fn model_limits() {
        let mut token = token();
        assert!(token.allows_model("anything"));
        token.model_limits_enabled = true;
        token.model_limits.insert("gpt-4".into());
        assert!(token.allows_model("gpt-4"));
        assert!(!token.allows_model("gpt-4o"));
    }

    #[test]
    fn ip_allowlist() {
        let mut token = token();
        let listed: IpAddr = "10.0.0.1".parse().unwrap();
        let other: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(token.allows_ip(None));
        assert!(token.allows_ip(Some(other)));

        token.allow_ips.insert(listed);
        assert!(token.allows_ip(Some(listed)));
        assert!(!token.allows_ip(Some(other)));
        assert!(!token.allows_ip(None));
    }
}
