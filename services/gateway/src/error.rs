//! Relay error responses
//!
//! Every error the gateway produces itself (as opposed to forwarding an
//! upstream response) is rendered as
//! `{"error":{"type":...,"message":...,"message_key":...,"request_id":...}}`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Errors raised while relaying one request.
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("missing or malformed bearer token")]
    MissingToken,

    #[error("invalid token")]
    InvalidToken,

    #[error("user {0} is disabled")]
    UserDisabled(i64),

    #[error("invalid request body: {0}")]
    InvalidBody(String),

    #[error(transparent)]
    Distributor(#[from] distributor::Error),

    #[error("token store unavailable: {0}")]
    Store(#[from] channel::StoreError),

    #[error("upstream timeout after {0}s")]
    UpstreamTimeout(u64),

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl RelayError {
    pub fn status(&self) -> StatusCode {
        match self {
            RelayError::MissingToken | RelayError::InvalidToken => StatusCode::UNAUTHORIZED,
            RelayError::UserDisabled(_) => StatusCode::FORBIDDEN,
            RelayError::InvalidBody(_) => StatusCode::BAD_REQUEST,
            RelayError::Distributor(err) => StatusCode::from_u16(err.kind().status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            RelayError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            RelayError::UpstreamTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            RelayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn message_key(&self) -> &'static str {
        match self {
            RelayError::MissingToken => "token.missing",
            RelayError::InvalidToken => "token.invalid",
            RelayError::UserDisabled(_) => "user.disabled",
            RelayError::InvalidBody(_) => "request.invalid_body",
            RelayError::Distributor(err) => err.kind().message_key(),
            RelayError::Store(_) => "token.lookup_failed",
            RelayError::UpstreamTimeout(_) => "channel.upstream_timeout",
            RelayError::Upstream(_) => "channel.upstream_error",
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            RelayError::MissingToken | RelayError::InvalidToken | RelayError::UserDisabled(_) => {
                "authentication_error"
            }
            RelayError::InvalidBody(_) => "invalid_request_error",
            RelayError::Distributor(_) => "distributor_error",
            RelayError::Store(_) | RelayError::UpstreamTimeout(_) | RelayError::Upstream(_) => {
                "gateway_error"
            }
        }
    }

    pub fn into_response_with_id(self, request_id: &str) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string(),
                "message_key": self.message_key(),
                "request_id": request_id,
            }
        });
        (
            status,
            [(axum::http::header::CONTENT_TYPE, "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distributor_errors_keep_their_classification() {
        let err = RelayError::from(distributor::Error::QuotaInsufficient {
            subject: "user:1".into(),
            available: 0,
            requested: 10,
        });
        assert_eq!(err.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(err.message_key(), "quota.insufficient");

        let err = RelayError::from(distributor::Error::RateLimited {
            group: "default".into(),
        });
        assert_eq!(err.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(err.message_key(), "rate_limit.total_reached");
    }

    #[test]
    fn authentication_errors_are_unauthorized() {
        assert_eq!(RelayError::MissingToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RelayError::InvalidToken.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(RelayError::UserDisabled(3).status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn response_body_carries_message_key_and_request_id() {
        let response = RelayError::InvalidBody("missing model".into())
            .into_response_with_id("req_abc123");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "invalid_request_error");
        assert_eq!(json["error"]["message_key"], "request.invalid_body");
        assert_eq!(json["error"]["request_id"], "req_abc123");
        assert!(
            json["error"]["message"]
                .as_str()
                .unwrap()
                .contains("missing model")
        );
    }
}
