//! Classification of upstream call results
//!
//! Separates failures that say something about the channel's health
//! (timeouts, 5xx, exhausted vendor accounts) from failures caused by the
//! request itself (bad input, unknown model). Only the former feed auto-ban
//! and move the request on to another channel.

/// Whether a failed upstream call should count against the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Timeouts, connection errors, 5xx, exhausted vendor account
    Retriable,
    /// Authentication or invalid request; the vendor was reached
    NonRetriable,
}

/// Result of an upstream call, reported back to the distributor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Usable response; `consumed` is the actual cost in quota units
    Success { consumed: i64 },
    /// No usable response, nothing is charged
    RetriableFailure,
    /// The call reached the vendor and may be billable
    NonRetriableFailure { consumed: i64 },
}

impl Outcome {
    pub fn label(&self) -> &'static str {
        match self {
            Outcome::Success { .. } => "success",
            Outcome::RetriableFailure => "retriable_failure",
            Outcome::NonRetriableFailure { .. } => "non_retriable_failure",
        }
    }
}

/// Body fragments showing the vendor account itself is out of credit or
/// suspended. These arrive with assorted 4xx statuses but are a property of
/// the channel, not of the request.
const ACCOUNT_EXHAUSTED_PATTERNS: &[&str] = &[
    "insufficient_quota",
    "billing_not_active",
    "credit balance is too low",
    "account is not active",
    "organization has been disabled",
];

/// Classify an upstream HTTP status. `None` means success.
///
/// 408/429/5xx are retriable. Other 4xx are the request's fault. Anything
/// else that is not 2xx (unexpected 1xx/3xx) is treated as retriable.
pub fn classify_status(status: u16) -> Option<FailureClass> {
    match status {
        200..=299 => None,
        408 | 429 => Some(FailureClass::Retriable),
        400..=499 => Some(FailureClass::NonRetriable),
        _ => Some(FailureClass::Retriable),
    }
}

/// Classify an upstream response by status and body.
///
/// A 4xx whose body reports an exhausted or suspended vendor account is
/// promoted to retriable so the channel is penalized and the request moves on.
pub fn classify_response(status: u16, body: &str) -> Option<FailureClass> {
    match classify_status(status)? {
        FailureClass::NonRetriable => {
            let lower = body.to_lowercase();
            if ACCOUNT_EXHAUSTED_PATTERNS.iter().any(|p| lower.contains(p)) {
                Some(FailureClass::Retriable)
            } else {
                Some(FailureClass::NonRetriable)
            }
        }
        retriable => Some(retriable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_statuses_have_no_class() {
        assert_eq!(classify_status(200), None);
        assert_eq!(classify_status(204), None);
    }

    #[test]
    fn timeouts_and_throttling_are_retriable() {
        assert_eq!(classify_status(408), Some(FailureClass::Retriable));
        assert_eq!(classify_status(429), Some(FailureClass::Retriable));
    }

    #[test]
    fn server_errors_are_retriable() {
        for status in [500, 502, 503, 504] {
            assert_eq!(classify_status(status), Some(FailureClass::Retriable), "{status}");
        }
    }

    #[test]
    fn auth_and_bad_request_are_non_retriable() {
        for status in [400, 401, 403, 404, 422] {
            assert_eq!(
                classify_status(status),
                Some(FailureClass::NonRetriable),
                "{status}"
            );
        }
    }

    #[test]
    fn unexpected_redirect_is_retriable() {
        assert_eq!(classify_status(302), Some(FailureClass::Retriable));
    }

    #[test]
    fn exhausted_vendor_account_is_promoted() {
        let body = r#"{"error":{"code":"insufficient_quota","message":"You exceeded your current quota"}}"#;
        assert_eq!(classify_response(403, body), Some(FailureClass::Retriable));
    }

    #[test]
    fn account_patterns_are_case_insensitive() {
        let body = r#"{"error":{"message":"Your Credit Balance Is Too Low"}}"#;
        assert_eq!(classify_response(400, body), Some(FailureClass::Retriable));
    }

    #[test]
    fn plain_bad_request_stays_non_retriable() {
        let body = r#"{"error":{"message":"max_tokens is too large"}}"#;
        assert_eq!(classify_response(400, body), Some(FailureClass::NonRetriable));
    }

    #[test]
    fn success_body_is_ignored() {
        assert_eq!(classify_response(200, "insufficient_quota"), None);
    }
}
