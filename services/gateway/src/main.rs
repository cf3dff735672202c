//! Channel Gateway
//!
//! Single-binary relay in front of many upstream AI vendor accounts:
//! 1. Authenticates client tokens against the state file
//! 2. Asks the distributor for a channel (group access, rate limits,
//!    quota reservation, weighted choice, auto-ban)
//! 3. Forwards the request with the channel's credential and overrides
//! 4. Reports the outcome so quota and channel health stay current

mod admin;
mod config;
mod error;
mod metrics;
mod proxy;
mod service;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use channel::FileStore;
use distributor::{Distributor, spawn_sync_task};
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::admin::{AdminState, build_admin_router};
use crate::config::Config;
use crate::proxy::RelayState;
use crate::service::{DRAIN_TIMEOUT, ServiceMetrics};

/// Shared application state accessible from all handlers
#[derive(Clone)]
struct AppState {
    relay: RelayState,
    metrics: ServiceMetrics,
    prometheus: PrometheusHandle,
}

/// Build the client-facing router.
///
/// Applies a concurrency limit layer based on `max_connections`.
fn build_router(state: AppState, max_connections: usize) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/v1/{*path}", post(relay_handler))
        .layer(tower::limit::ConcurrencyLimitLayer::new(max_connections))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs, filter from LOG_LEVEL or RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting channel-gateway");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        listen_addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        store = %config.store.path.display(),
        groups = config.groups.len(),
        rate_limit = config.rate_limit.enabled,
        "configuration loaded"
    );

    let store = Arc::new(
        FileStore::load(config.store.path.clone())
            .await
            .with_context(|| format!("failed to load store {}", config.store.path.display()))?,
    );

    let distributor = Arc::new(Distributor::new(
        config.distributor_settings(),
        store.clone(),
        store.clone(),
    ));
    let channels = distributor
        .reload()
        .await
        .context("failed to build the initial ability index")?;
    info!(channels, "ability index ready");

    let sync_task = spawn_sync_task(distributor.clone(), config.distributor.sync_interval());

    let metrics = ServiceMetrics::new();
    let relay = RelayState {
        client: reqwest::Client::new(),
        distributor: distributor.clone(),
        tokens: store.clone(),
        timeout: config.upstream_timeout(),
        default_estimated_cost: config.server.default_estimated_cost,
        metrics: metrics.clone(),
    };
    let app = build_router(
        AppState {
            relay,
            metrics: metrics.clone(),
            prometheus: prometheus_handle,
        },
        config.server.max_connections,
    );
    let admin_app = build_admin_router(AdminState::new(distributor.clone()));

    let listener = TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to bind to {}", config.server.listen_addr))?;
    let admin_listener = TcpListener::bind(config.server.admin_addr)
        .await
        .with_context(|| format!("failed to bind admin API to {}", config.server.admin_addr))?;
    info!(
        addr = %config.server.listen_addr,
        admin_addr = %config.server.admin_addr,
        "accepting requests"
    );

    // Both servers stop accepting on the same signal; the drain timeout
    // starts at signal receipt, not at startup.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_rx = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(wait_for(server_rx))
            .await
    });
    let admin_handle = tokio::spawn(async move {
        axum::serve(admin_listener, admin_app)
            .with_graceful_shutdown(wait_for(shutdown_rx))
            .await
    });

    shutdown_signal().await;
    let _ = shutdown_tx.send(true);

    let in_flight = metrics.in_flight.clone();
    match tokio::time::timeout(DRAIN_TIMEOUT, async { (server_handle.await, admin_handle.await) })
        .await
    {
        Ok((Ok(Ok(())), _)) => info!("all in-flight requests drained"),
        Ok((Ok(Err(e)), _)) => error!(error = %e, "server error during shutdown"),
        Ok((Err(e), _)) => error!(error = %e, "server task panicked"),
        Err(_) => warn!(
            remaining = in_flight.load(Ordering::Relaxed),
            drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
            "drain timeout exceeded, forcing shutdown"
        ),
    }

    // Write back quota committed since the last tick
    sync_task.abort();
    let report = distributor.ledger().sync().await;
    info!(
        persisted = report.persisted,
        failures = report.failures,
        "final quota sync"
    );

    info!("shutdown complete");
    Ok(())
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Health endpoint: distributor channel summary plus process counters.
/// Returns 503 when no channel can serve traffic.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let mut body = state.relay.distributor.health();
    body["uptime_seconds"] = state.metrics.uptime().as_secs().into();
    body["requests_served"] = state.metrics.requests_total.load(Ordering::Relaxed).into();
    body["errors_total"] = state.metrics.errors_total.load(Ordering::Relaxed).into();
    body["in_flight"] = state.metrics.in_flight.load(Ordering::Relaxed).into();

    let status_code = if body["status"] == "unhealthy" {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };

    (
        status_code,
        [(axum::http::header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

/// Prometheus metrics endpoint in text exposition format.
async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        state.prometheus.render(),
    )
}

async fn relay_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let request_id = format!("req_{}", uuid::Uuid::new_v4().as_simple());
    proxy::relay_request(&state.relay, request, request_id).await
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
