//! Error types for routing decisions
//!
//! Every failure mode of `Distributor::resolve` has a stable [`ErrorKind`]
//! carrying a localization key and the transport status the caller should
//! render. Bookkeeping in `report_result` never surfaces errors.

/// Errors from resolution and administrative operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("client address {ip} is not allowed for this token")]
    IpNotAllowed { ip: String },

    #[error("group {group} is not accessible")]
    GroupAccessDenied { group: String },

    #[error("token is not allowed to use model {model}")]
    TokenModelForbidden { model: String },

    #[error("channel {id} is unavailable: {reason}")]
    ChannelUnavailable { id: i64, reason: &'static str },

    #[error("no available channel for model {model} in group {group}")]
    NoAvailableChannel { group: String, model: String },

    #[error("rate limit reached for group {group}")]
    RateLimited { group: String },

    #[error("insufficient quota for {subject}: available {available}, requested {requested}")]
    QuotaInsufficient {
        subject: String,
        available: i64,
        requested: i64,
    },

    #[error("all {tried} candidate channels for model {model} in group {group} are saturated")]
    UpstreamSaturated {
        group: String,
        model: String,
        tried: usize,
    },

    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
}

/// Result alias for distributor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Enumerable failure kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidRequest,
    IpNotAllowed,
    GroupAccessDenied,
    TokenModelForbidden,
    ChannelUnavailable,
    NoAvailableChannel,
    RateLimited,
    QuotaInsufficient,
    UpstreamSaturated,
    StoreUnavailable,
}

impl ErrorKind {
    pub const ALL: &'static [ErrorKind] = &[
        ErrorKind::InvalidRequest,
        ErrorKind::IpNotAllowed,
        ErrorKind::GroupAccessDenied,
        ErrorKind::TokenModelForbidden,
        ErrorKind::ChannelUnavailable,
        ErrorKind::NoAvailableChannel,
        ErrorKind::RateLimited,
        ErrorKind::QuotaInsufficient,
        ErrorKind::UpstreamSaturated,
        ErrorKind::StoreUnavailable,
    ];

    /// Label for metrics and logs.
    pub fn label(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::IpNotAllowed => "ip_not_allowed",
            ErrorKind::GroupAccessDenied => "group_access_denied",
            ErrorKind::TokenModelForbidden => "token_model_forbidden",
            ErrorKind::ChannelUnavailable => "channel_unavailable",
            ErrorKind::NoAvailableChannel => "no_available_channel",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::QuotaInsufficient => "quota_insufficient",
            ErrorKind::UpstreamSaturated => "upstream_saturated",
            ErrorKind::StoreUnavailable => "store_unavailable",
        }
    }

    /// Message catalog key for rendering the error to the client.
    pub fn message_key(self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "distributor.invalid_request",
            ErrorKind::IpNotAllowed => "token.ip_not_allowed",
            ErrorKind::GroupAccessDenied => "distributor.group_access_denied",
            ErrorKind::TokenModelForbidden => "distributor.token_model_forbidden",
            ErrorKind::ChannelUnavailable => "distributor.channel_disabled",
            ErrorKind::NoAvailableChannel => "distributor.no_available_channel",
            ErrorKind::RateLimited => "rate_limit.total_reached",
            ErrorKind::QuotaInsufficient => "quota.insufficient",
            ErrorKind::UpstreamSaturated => "channel.upstream_saturated",
            ErrorKind::StoreUnavailable => "distributor.get_channel_failed",
        }
    }

    /// HTTP status the caller should answer with.
    pub fn status_code(self) -> u16 {
        match self {
            ErrorKind::InvalidRequest => 400,
            ErrorKind::IpNotAllowed
            | ErrorKind::GroupAccessDenied
            | ErrorKind::TokenModelForbidden
            | ErrorKind::ChannelUnavailable => 403,
            ErrorKind::QuotaInsufficient => 402,
            ErrorKind::RateLimited => 429,
            ErrorKind::NoAvailableChannel | ErrorKind::UpstreamSaturated => 503,
            ErrorKind::StoreUnavailable => 500,
        }
    }

    /// Capacity failures may clear on their own; the rest are the caller's
    /// request or authorization.
    pub fn is_capacity(self) -> bool {
        matches!(
            self,
            ErrorKind::NoAvailableChannel | ErrorKind::UpstreamSaturated | ErrorKind::RateLimited
        )
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Error::IpNotAllowed { .. } => ErrorKind::IpNotAllowed,
            Error::GroupAccessDenied { .. } => ErrorKind::GroupAccessDenied,
            Error::TokenModelForbidden { .. } => ErrorKind::TokenModelForbidden,
            Error::ChannelUnavailable { .. } => ErrorKind::ChannelUnavailable,
            Error::NoAvailableChannel { .. } => ErrorKind::NoAvailableChannel,
            Error::RateLimited { .. } => ErrorKind::RateLimited,
            Error::QuotaInsufficient { .. } => ErrorKind::QuotaInsufficient,
            Error::UpstreamSaturated { .. } => ErrorKind::UpstreamSaturated,
            Error::StoreUnavailable(_) => ErrorKind::StoreUnavailable,
        }
    }

    pub fn message_key(&self) -> &'static str {
        self.kind().message_key()
    }

    pub fn status_code(&self) -> u16 {
        self.kind().status_code()
    }
}

impl From<channel::StoreError> for Error {
    fn from(err: channel::StoreError) -> Self {
        Error::StoreUnavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_kind_has_distinct_label() {
        let labels: HashSet<&str> = ErrorKind::ALL.iter().map(|k| k.label()).collect();
        assert_eq!(labels.len(), ErrorKind::ALL.len());
    }

    #[test]
    fn message_keys_are_namespaced() {
        for kind in ErrorKind::ALL {
            assert!(kind.message_key().contains('.'), "{kind:?}");
        }
    }

    #[test]
    fn authorization_failures_are_distinct_from_capacity() {
        assert_eq!(ErrorKind::GroupAccessDenied.status_code(), 403);
        assert_eq!(ErrorKind::TokenModelForbidden.status_code(), 403);
        assert_eq!(ErrorKind::IpNotAllowed.status_code(), 403);
        assert!(!ErrorKind::IpNotAllowed.is_capacity());
        assert!(!ErrorKind::GroupAccessDenied.is_capacity());
        assert!(ErrorKind::UpstreamSaturated.is_capacity());
        assert_eq!(ErrorKind::RateLimited.status_code(), 429);
    }

    #[test]
    fn error_maps_to_kind() {
        let err = Error::QuotaInsufficient {
            subject: "user:1".into(),
            available: 10,
            requested: 15,
        };
        assert_eq!(err.kind(), ErrorKind::QuotaInsufficient);
        assert_eq!(err.message_key(), "quota.insufficient");
        assert!(err.to_string().contains("available 10"));
    }

    #[test]
    fn store_errors_become_store_unavailable() {
        let err: Error = channel::StoreError::Io("disk gone".into()).into();
        assert_eq!(err.kind(), ErrorKind::StoreUnavailable);
        assert_eq!(err.status_code(), 500);
    }
}
