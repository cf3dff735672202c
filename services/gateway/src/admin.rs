//! Admin API for channel operations
//!
//! Runs on a separate listener (default 127.0.0.1:9090). Not meant to be
//! reachable from clients.
//!
//! Endpoints:
//! - GET  /admin/channels  channels with health state
//! - POST /admin/channels/{id}/ban  force a channel banned (manually disabled)
//! - POST /admin/channels/{id}/unban  force a channel healthy (enabled)
//! - POST /admin/reload  rebuild the ability index from the store
//! - POST /admin/sync  run one sync cycle now
//! - GET  /admin/rate-limits  current rate-limit settings
//! - PUT  /admin/rate-limits  replace the per-group limits map
//! - GET  /admin/groups  group settings

use std::sync::Arc;

use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use distributor::{Distributor, ManualOverride, sync_cycle};
use tracing::{info, warn};

/// Shared state for admin API handlers.
#[derive(Clone)]
pub struct AdminState {
    distributor: Arc<Distributor>,
}

impl AdminState {
    pub fn new(distributor: Arc<Distributor>) -> Self {
        Self { distributor }
    }
}

/// Build the admin axum router.
pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/channels", get(list_channels))
        .route("/admin/channels/{id}/ban", post(ban_channel))
        .route("/admin/channels/{id}/unban", post(unban_channel))
        .route("/admin/reload", post(reload))
        .route("/admin/sync", post(sync_now))
        .route("/admin/rate-limits", get(get_rate_limits).put(put_rate_limits))
        .route("/admin/groups", get(list_groups))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (
        status,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// GET /admin/channels: every indexed channel with its health. Never
/// exposes keys, only their count.
async fn list_channels(State(state): State<AdminState>) -> Response {
    let health = state.distributor.health();
    let channels = health
        .get("channels")
        .cloned()
        .unwrap_or(serde_json::json!([]));
    json_response(StatusCode::OK, serde_json::json!({ "channels": channels }))
}

async fn ban_channel(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    apply_override(&state, id, ManualOverride::Banned).await
}

async fn unban_channel(State(state): State<AdminState>, Path(id): Path<i64>) -> Response {
    apply_override(&state, id, ManualOverride::Healthy).await
}

async fn apply_override(state: &AdminState, id: i64, target: ManualOverride) -> Response {
    match state.distributor.override_health(id, target).await {
        Ok(()) => {
            let health = state.distributor.channel_health(id);
            info!(channel_id = id, health = health.label(), "channel health overridden");
            json_response(
                StatusCode::OK,
                serde_json::json!({ "id": id, "health": health.label() }),
            )
        }
        Err(e) => {
            warn!(channel_id = id, error = %e, "health override failed");
            let status = StatusCode::from_u16(e.kind().status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            // An unknown id is the only ChannelUnavailable an override can hit
            let status = if status == StatusCode::FORBIDDEN {
                StatusCode::NOT_FOUND
            } else {
                status
            };
            json_response(
                status,
                serde_json::json!({
                    "error": e.to_string(),
                    "message_key": e.kind().message_key(),
                }),
            )
        }
    }
}

/// POST /admin/reload: rebuild the ability index now instead of waiting
/// for the next sync tick.
async fn reload(State(state): State<AdminState>) -> Response {
    match state.distributor.reload().await {
        Ok(channels) => {
            info!(channels, "ability index reloaded by admin");
            json_response(StatusCode::OK, serde_json::json!({ "channels": channels }))
        }
        Err(e) => {
            warn!(error = %e, "admin reload failed");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": e.to_string() }),
            )
        }
    }
}

/// POST /admin/sync: reload channels and write back quota immediately.
async fn sync_now(State(state): State<AdminState>) -> Response {
    let report = sync_cycle(&state.distributor).await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "persisted": report.persisted,
            "refreshed": report.refreshed,
            "evicted": report.evicted,
            "failures": report.failures,
            "reservations_outstanding": state.distributor.ledger().outstanding(),
        }),
    )
}

async fn get_rate_limits(State(state): State<AdminState>) -> Response {
    let config = state.distributor.limiter().config();
    match serde_json::to_value(&*config) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(e) => json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": e.to_string() }),
        ),
    }
}

/// PUT /admin/rate-limits: body `{"group": [total, success], ...}`. The
/// whole map is replaced; groups left out fall back to the default limit.
async fn put_rate_limits(State(state): State<AdminState>, body: String) -> Response {
    match state.distributor.limiter().replace_groups_from_json(&body) {
        Ok(groups) => {
            info!(groups, "rate-limit map replaced");
            json_response(StatusCode::OK, serde_json::json!({ "groups": groups }))
        }
        Err(e) => json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": format!("invalid rate-limit map: {e}") }),
        ),
    }
}

async fn list_groups(State(state): State<AdminState>) -> Response {
    let table = state.distributor.groups();
    let mut groups: Vec<_> = table.groups().collect();
    groups.sort_by(|a, b| a.name.cmp(&b.name));
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "groups": groups,
            "auto_groups": table.auto_groups(),
        }),
    )
}
