//! Relay logic
//!
//! Authenticates the bearer token, asks the distributor for a channel,
//! rewrites the request for that channel (credential, model mapping,
//! header and parameter overrides) and forwards it. The upstream outcome is
//! reported back so quota and channel health stay current. Retriable
//! failures move on to another channel within the context's retry budget.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use channel::{ChannelType, FailureClass, Outcome, TokenLookup, UserStatus, classify_response};
use distributor::{ChannelRoute, Distributor, ResolveRequest, RoutingContext, TokenScope, UserScope};
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::error::RelayError;
use crate::metrics;
use crate::service::{InFlightGuard, ServiceMetrics};

/// Largest request body accepted from clients.
pub const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Inbound headers replaced per channel: client credentials and framing.
const REWRITTEN_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "api-key",
    "host",
    "content-length",
];

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Shared state passed to the relay handler via axum State extractor
#[derive(Clone)]
pub struct RelayState {
    pub client: reqwest::Client,
    pub distributor: Arc<Distributor>,
    pub tokens: Arc<dyn TokenLookup>,
    pub timeout: Duration,
    pub default_estimated_cost: i64,
    pub metrics: ServiceMetrics,
}

/// Relay one client request. Never fails: gateway-side errors are rendered
/// as JSON error responses.
#[instrument(skip_all, fields(request_id = %request_id, path = %request.uri().path()))]
pub async fn relay_request(
    state: &RelayState,
    request: Request<Body>,
    request_id: String,
) -> Response {
    let started = Instant::now();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let _in_flight = InFlightGuard::new(&state.metrics.in_flight);

    let response = match relay(state, request).await {
        Ok(response) => response,
        Err(err) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            if let RelayError::Distributor(inner) = &err {
                metrics::record_resolve_failure(inner.kind());
                debug!(kind = inner.kind().label(), error = %inner, "resolution refused");
            } else {
                debug!(error = %err, "relay failed");
            }
            err.into_response_with_id(&request_id)
        }
    };

    metrics::record_request(response.status().as_u16(), started.elapsed().as_secs_f64());
    response
}

async fn relay(state: &RelayState, request: Request<Body>) -> Result<Response, RelayError> {
    let (parts, body) = request.into_parts();

    let key = bearer_token(&parts.headers).ok_or(RelayError::MissingToken)?;
    let (token, user) = state
        .tokens
        .token_by_key(key)
        .await?
        .ok_or(RelayError::InvalidToken)?;
    if user.status == UserStatus::Disabled {
        return Err(RelayError::UserDisabled(user.id));
    }

    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| RelayError::InvalidBody(e.to_string()))?;
    let payload: Map<String, Value> =
        serde_json::from_slice(&bytes).map_err(|e| RelayError::InvalidBody(e.to_string()))?;
    let model = payload
        .get("model")
        .and_then(Value::as_str)
        .ok_or_else(|| RelayError::InvalidBody("missing model".into()))?
        .to_string();
    let estimated_cost = payload
        .get("max_tokens")
        .and_then(Value::as_i64)
        .filter(|n| *n > 0)
        .unwrap_or(state.default_estimated_cost);

    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let forwarded = forwardable_headers(&parts.headers);

    let mut request = ResolveRequest::new(
        model,
        TokenScope::from(&token),
        UserScope::from(&user),
        estimated_cost,
    );
    if let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() {
        request = request.with_client_ip(peer.ip());
    }
    let mut budget: Option<u32> = None;
    let mut last_failure: Option<Result<Response, RelayError>> = None;

    loop {
        let context = match state.distributor.resolve(&request).await {
            Ok(context) => context,
            Err(err) => {
                return match last_failure.take() {
                    Some(failure) => {
                        metrics::record_resolve_failure(err.kind());
                        debug!(error = %err, "no further channel, returning last upstream failure");
                        failure
                    }
                    None => Err(err.into()),
                };
            }
        };
        let remaining = *budget.get_or_insert(context.retry_budget);

        let (outcome, result) = forward(state, &context, &payload, &path, &forwarded).await;
        state.distributor.report_result(&context, outcome).await;

        if outcome != Outcome::RetriableFailure {
            return result;
        }
        if remaining == 0 {
            info!(
                channel_id = context.channel.id,
                attempt = context.attempt,
                "retry budget exhausted"
            );
            return result;
        }

        budget = Some(remaining - 1);
        last_failure = Some(result);
        request = request.retry(context.channel.id);
    }
}

/// One upstream call. Returns the outcome to report and what the client
/// sees if no retry follows.
async fn forward(
    state: &RelayState,
    context: &RoutingContext,
    payload: &Map<String, Value>,
    path: &str,
    forwarded: &HeaderMap,
) -> (Outcome, Result<Response, RelayError>) {
    let route = &context.channel;
    let url = upstream_url(route, path);
    let body = upstream_body(route, payload);
    let headers = upstream_headers(route, forwarded);

    let sent = state
        .client
        .post(&url)
        .headers(headers)
        .timeout(state.timeout)
        .body(body)
        .send()
        .await;

    let upstream = match sent {
        Ok(upstream) => upstream,
        Err(e) if e.is_timeout() => {
            metrics::record_upstream_error("timeout");
            warn!(channel_id = route.id, error = %e, "upstream timeout");
            return (
                Outcome::RetriableFailure,
                Err(RelayError::UpstreamTimeout(state.timeout.as_secs())),
            );
        }
        Err(e) => {
            metrics::record_upstream_error(if e.is_connect() { "connection" } else { "request" });
            warn!(channel_id = route.id, error = %e, "upstream request failed");
            return (
                Outcome::RetriableFailure,
                Err(RelayError::Upstream(e.to_string())),
            );
        }
    };

    let status = upstream.status();
    let response_headers = upstream.headers().clone();
    let response_body = match upstream.bytes().await {
        Ok(body) => body,
        Err(e) => {
            metrics::record_upstream_error("body");
            warn!(channel_id = route.id, error = %e, "failed to read upstream response body");
            return (
                Outcome::RetriableFailure,
                Err(RelayError::Upstream(format!("upstream response read error: {e}"))),
            );
        }
    };

    let outcome = match classify_response(status.as_u16(), &String::from_utf8_lossy(&response_body))
    {
        None => Outcome::Success {
            consumed: usage_tokens(&response_body).unwrap_or(context.estimated_cost),
        },
        Some(FailureClass::NonRetriable) => Outcome::NonRetriableFailure {
            consumed: usage_tokens(&response_body).unwrap_or(0),
        },
        Some(FailureClass::Retriable) => {
            warn!(
                channel_id = route.id,
                status = status.as_u16(),
                "retriable upstream failure"
            );
            Outcome::RetriableFailure
        }
    };

    let client_status =
        StatusCode::from_u16(route.map_status(status.as_u16())).unwrap_or(status);
    (
        outcome,
        build_response(client_status, &response_headers, response_body),
    )
}

fn build_response(
    status: StatusCode,
    headers: &HeaderMap,
    body: Bytes,
) -> Result<Response, RelayError> {
    let mut response = Response::builder().status(status);
    for (name, value) in headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from(body))
        .map_err(|e| RelayError::Upstream(format!("response build error: {e}")))
}

/// Token key from `Authorization: Bearer ...`, else `x-api-key`.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    let from_authorization = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            let (scheme, rest) = v.split_once(' ')?;
            scheme.eq_ignore_ascii_case("bearer").then_some(rest)
        });
    from_authorization
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .filter(|key| !key.is_empty())
}

/// Client headers that survive the rewrite.
fn forwardable_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let name_str = name.as_str();
        if !is_hop_by_hop(name_str)
            && !REWRITTEN_HEADERS
                .iter()
                .any(|h| h.eq_ignore_ascii_case(name_str))
        {
            headers.append(name.clone(), value.clone());
        }
    }
    headers
}

/// Headers for the upstream call: forwarded client headers, the channel
/// credential in the vendor's scheme, then the channel's header overrides.
/// `{api_key}` in an override value is replaced with the credential.
fn upstream_headers(route: &ChannelRoute, forwarded: &HeaderMap) -> HeaderMap {
    let mut headers = forwarded.clone();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let key = route.key.expose();
    let credential = match route.channel_type {
        ChannelType::Anthropic => {
            if !headers.contains_key("anthropic-version") {
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_static(ANTHROPIC_VERSION),
                );
            }
            (HeaderName::from_static("x-api-key"), key.to_string())
        }
        ChannelType::Azure => (HeaderName::from_static("api-key"), key.to_string()),
        _ => (AUTHORIZATION, format!("Bearer {key}")),
    };
    match HeaderValue::from_str(&credential.1) {
        Ok(mut value) => {
            value.set_sensitive(true);
            headers.insert(credential.0, value);
        }
        Err(_) => warn!(channel_id = route.id, "channel key is not a valid header value"),
    }

    if let Some(organization) = route.organization.as_deref().filter(|o| !o.is_empty()) {
        if let Ok(value) = HeaderValue::from_str(organization) {
            headers.insert("openai-organization", value);
        }
    }

    for (name, value) in &route.header_override {
        let name = match HeaderName::try_from(name.as_str()) {
            Ok(n) => n,
            Err(e) => {
                warn!(header = %name, error = %e, "skipping invalid header override name");
                continue;
            }
        };
        match HeaderValue::from_str(&value.replace("{api_key}", key)) {
            Ok(v) => {
                headers.insert(name, v);
            }
            Err(e) => warn!(header = %name, error = %e, "skipping invalid header override value"),
        }
    }
    headers
}

/// Request body for the channel: the mapped model, then parameter
/// overrides on top of the client's fields.
fn upstream_body(route: &ChannelRoute, payload: &Map<String, Value>) -> String {
    let mut body = payload.clone();
    body.insert("model".into(), Value::String(route.upstream_model.clone()));
    for (key, value) in &route.param_override {
        body.insert(key.clone(), value.clone());
    }
    Value::Object(body).to_string()
}

fn upstream_url(route: &ChannelRoute, path: &str) -> String {
    let mut url = format!("{}{}", route.base_url.trim_end_matches('/'), path);
    if route.channel_type == ChannelType::Azure {
        if let Some(("api_version", version)) = route.secondary_setting() {
            url.push(if url.contains('?') { '&' } else { '?' });
            url.push_str("api-version=");
            url.push_str(version);
        }
    }
    url
}

/// Tokens consumed according to the response's `usage` object. Accepts the
/// OpenAI (`total_tokens`) and Anthropic (`input_tokens + output_tokens`)
/// shapes.
pub fn usage_tokens(body: &[u8]) -> Option<i64> {
    let value: Value = serde_json::from_slice(body).ok()?;
    let usage = value.get("usage")?;
    if let Some(total) = usage.get("total_tokens").and_then(Value::as_i64) {
        return Some(total);
    }
    let input = usage.get("input_tokens").and_then(Value::as_i64);
    let output = usage.get("output_tokens").and_then(Value::as_i64);
    match (input, output) {
        (None, None) => None,
        (input, output) => Some(input.unwrap_or(0) + output.unwrap_or(0)),
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use channel::Channel;
    use distributor::PickedKey;

    fn route(channel: serde_json::Value) -> ChannelRoute {
        let channel: Channel = serde_json::from_value(channel).unwrap();
        let key = PickedKey {
            index: 0,
            key: channel.keys[0].clone(),
        };
        ChannelRoute::new(&channel, key, "gpt-4")
    }

    fn openai_route() -> ChannelRoute {
        route(serde_json::json!({
            "id": 1,
            "name": "openai",
            "type": 1,
            "base_url": "https://upstream.test/",
            "keys": ["sk-upstream"],
            "organization": "org-42",
            "model_mapping": { "gpt-4": "gpt-4-0613" },
            "param_override": { "temperature": 0.2 },
            "header_override": { "x-trace": "t-{api_key}" },
        }))
    }

    #[test]
    fn test_hop_by_hop_detection() {
        assert!(is_hop_by_hop("Connection"));
        assert!(is_hop_by_hop("TRANSFER-ENCODING"));
        assert!(!is_hop_by_hop("Content-Type"));
        assert!(!is_hop_by_hop("Authorization"));
    }

    #[test]
    fn test_bearer_token_sources() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-client"));
        assert_eq!(bearer_token(&headers), Some("sk-client"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);

        headers.insert("x-api-key", HeaderValue::from_static("sk-header"));
        assert_eq!(bearer_token(&headers), Some("sk-header"));

        headers.insert(AUTHORIZATION, HeaderValue::from_static("bearer   "));
        headers.remove("x-api-key");
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn test_client_credentials_are_not_forwarded() {
        let mut inbound = HeaderMap::new();
        inbound.insert(AUTHORIZATION, HeaderValue::from_static("Bearer sk-client"));
        inbound.insert("x-api-key", HeaderValue::from_static("sk-client"));
        inbound.insert("connection", HeaderValue::from_static("keep-alive"));
        inbound.insert("x-custom", HeaderValue::from_static("preserved"));

        let forwarded = forwardable_headers(&inbound);
        assert!(forwarded.get(AUTHORIZATION).is_none());
        assert!(forwarded.get("x-api-key").is_none());
        assert!(forwarded.get("connection").is_none());
        assert_eq!(forwarded.get("x-custom").unwrap(), "preserved");
    }

    #[test]
    fn test_upstream_headers_openai() {
        let headers = upstream_headers(&openai_route(), &HeaderMap::new());
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer sk-upstream");
        assert!(headers.get(AUTHORIZATION).unwrap().is_sensitive());
        assert_eq!(headers.get("openai-organization").unwrap(), "org-42");
        assert_eq!(headers.get("x-trace").unwrap(), "t-sk-upstream");
        assert_eq!(headers.get(CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_upstream_headers_anthropic() {
        let route = route(serde_json::json!({
            "id": 2, "name": "claude", "type": 14, "keys": ["sk-ant"],
        }));
        let headers = upstream_headers(&route, &HeaderMap::new());
        assert_eq!(headers.get("x-api-key").unwrap(), "sk-ant");
        assert_eq!(headers.get("anthropic-version").unwrap(), ANTHROPIC_VERSION);
        assert!(headers.get(AUTHORIZATION).is_none());
    }

    #[test]
    fn test_upstream_body_maps_model_and_overrides() {
        let mut payload = Map::new();
        payload.insert("model".into(), "gpt-4".into());
        payload.insert("temperature".into(), 1.0.into());
        payload.insert("stream".into(), false.into());

        let body: Value = serde_json::from_str(&upstream_body(&openai_route(), &payload)).unwrap();
        assert_eq!(body["model"], "gpt-4-0613");
        assert_eq!(body["temperature"], 0.2);
        assert_eq!(body["stream"], false);
    }

    #[test]
    fn test_upstream_url_joins_path() {
        assert_eq!(
            upstream_url(&openai_route(), "/v1/chat/completions"),
            "https://upstream.test/v1/chat/completions"
        );
    }

    #[test]
    fn test_azure_url_carries_api_version() {
        let route = route(serde_json::json!({
            "id": 3,
            "name": "azure",
            "type": 3,
            "base_url": "https://example.openai.azure.com",
            "other": "2024-02-01",
            "keys": ["az"],
        }));
        assert_eq!(
            upstream_url(&route, "/v1/chat/completions?x=1"),
            "https://example.openai.azure.com/v1/chat/completions?x=1&api-version=2024-02-01"
        );
    }

    #[test]
    fn test_usage_tokens_shapes() {
        assert_eq!(
            usage_tokens(br#"{"usage":{"prompt_tokens":3,"total_tokens":12}}"#),
            Some(12)
        );
        assert_eq!(
            usage_tokens(br#"{"usage":{"input_tokens":5,"output_tokens":7}}"#),
            Some(12)
        );
        assert_eq!(usage_tokens(br#"{"id":"x"}"#), None);
        assert_eq!(usage_tokens(b"not json"), None);
    }
}
