//! # http
//!
//! The HTTP API server: route table, universal response policy, and
//! authentication.
//!
//! Every response carries `X-Content-Type-Options: nosniff`,
//! `X-Frame-Options: DENY`, and a pinned `Server` header (no runtime
//! version leak). HTML additionally gets a restrictive CSP. A configured
//! pre-shared key gates every `/api/*` route via the `X-MeshForge-Key`
//! header, compared timing-safely. CORS is emitted only when an origin is
//! explicitly configured.

pub mod export;
pub mod handlers;

use std::sync::Arc;

use axum::extract::Request;
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use sha2::{Digest, Sha256};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::aggregator::Aggregator;
use crate::alerts::AlertEngine;
use crate::breaker::BreakerRegistry;
use crate::config::Config;
use crate::connectivity::ConnectivityTracker;
use crate::drift::DriftDetector;
use crate::events::EventBus;
use crate::health::HealthScorer;
use crate::history::HistoryStore;
use crate::leases::LeaseManager;
use crate::lifecycle::Shutdown;
use crate::mqtt::BrokerSubscriber;
use crate::perf::PerfMonitor;
use crate::util::bind_with_fallback;
use crate::ws::WsBroadcaster;

const SERVER_HEADER: &str = "MeshForge-Maps/1.0";
const PORT_ATTEMPTS: u16 = 5;

pub struct AppState {
    pub config: Config,
    pub started_at: i64,
    pub aggregator: Arc<Aggregator>,
    pub history: Arc<HistoryStore>,
    pub alerts: Arc<AlertEngine>,
    pub health: Arc<HealthScorer>,
    pub connectivity: Arc<ConnectivityTracker>,
    pub drift: Arc<DriftDetector>,
    pub breakers: Arc<BreakerRegistry>,
    pub bus: Arc<EventBus>,
    pub perf: Arc<PerfMonitor>,
    pub leases: Arc<LeaseManager>,
    pub subscriber: Option<Arc<BrokerSubscriber>>,
    pub ws: Option<Arc<WsBroadcaster>>,
}

pub type SharedState = Arc<AppState>;

// ── Errors ────────────────────────────────────────────────────────────────────

/// JSON error response. No stack traces, no internal paths.
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: message.into() }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: message.into() }
    }

    pub fn internal() -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "internal error".into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(e: sqlx::Error) -> Self {
        tracing::error!("history query failed: {e}");
        Self::internal()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

pub fn build_router(state: SharedState) -> Router {
    let mut router = Router::new()
        .route("/", get(handlers::index))
        .route("/api/nodes/geojson", get(handlers::nodes_geojson))
        .route("/api/nodes/:id", get(handlers::nodes_by_source))
        .route("/api/nodes/:id/trajectory", get(handlers::node_trajectory))
        .route("/api/nodes/:id/history", get(handlers::node_history))
        .route("/api/nodes/:id/health", get(handlers::node_health))
        .route("/api/topology", get(handlers::topology))
        .route("/api/topology/geojson", get(handlers::topology_geojson))
        .route("/api/overlay", get(handlers::overlay))
        .route("/api/hamclock", get(handlers::hamclock))
        .route("/api/node-health", get(handlers::node_health_all))
        .route("/api/node-health/summary", get(handlers::node_health_summary))
        .route("/api/health", get(handlers::system_health))
        .route("/api/status", get(handlers::status))
        .route("/api/perf", get(handlers::perf))
        .route("/api/node-states", get(handlers::node_states))
        .route("/api/node-states/summary", get(handlers::node_states_summary))
        .route("/api/config-drift", get(handlers::config_drift))
        .route("/api/mqtt/stats", get(handlers::mqtt_stats))
        .route("/api/alerts", get(handlers::alerts))
        .route("/api/alerts/active", get(handlers::alerts_active))
        .route("/api/alerts/rules", get(handlers::alert_rules))
        .route("/api/alerts/summary", get(handlers::alerts_summary))
        .route("/api/alerts/:id/ack", post(handlers::alert_acknowledge))
        .route("/api/analytics/growth", get(handlers::analytics_growth))
        .route("/api/analytics/activity", get(handlers::analytics_activity))
        .route("/api/analytics/ranking", get(handlers::analytics_ranking))
        .route("/api/analytics/summary", get(handlers::analytics_summary))
        .route("/api/analytics/alert-trends", get(handlers::analytics_alert_trends))
        .route("/api/config", get(handlers::config))
        .route("/api/tile-providers", get(handlers::tile_providers))
        .route("/api/sources", get(handlers::sources))
        .route("/api/export/nodes", get(export::export_nodes))
        .route("/api/export/alerts", get(export::export_alerts))
        .route("/api/export/analytics/:kind", get(export::export_analytics))
        .fallback(handlers::not_found)
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(middleware::from_fn(security_headers));

    if let Some(origin) = state
        .config
        .cors_allowed_origin
        .as_deref()
        .and_then(|o| o.parse::<HeaderValue>().ok())
    {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(origin)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([
                    header::CONTENT_TYPE,
                    axum::http::HeaderName::from_static("x-meshforge-key"),
                ]),
        );
    }

    router.with_state(state)
}

/// Bind (with adjacent-port fallback) and serve until shutdown.
pub async fn serve(state: SharedState, shutdown: Shutdown) -> anyhow::Result<u16> {
    let host = state.config.http_host.clone();
    let port = state.config.http_port;
    let (listener, bound) = bind_with_fallback(&host, port, PORT_ATTEMPTS).await?;
    info!("http api listening on {host}:{bound}");

    let app = build_router(state);
    tokio::spawn(async move {
        let wait = shutdown.clone();
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { wait.wait().await })
            .await
        {
            tracing::warn!("http listener exited: {e}");
        }
    });
    Ok(bound)
}

// ── Middleware ────────────────────────────────────────────────────────────────

async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_HEADER));
    response
}

/// Equal-length digest comparison; the key itself never drives timing.
fn keys_match(expected: &str, presented: &str) -> bool {
    Sha256::digest(expected.as_bytes()) == Sha256::digest(presented.as_bytes())
}

async fn require_api_key(
    axum::extract::State(state): axum::extract::State<SharedState>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = &state.config.api_key else {
        return next.run(request).await;
    };
    if !request.uri().path().starts_with("/api/") {
        return next.run(request).await;
    }

    let presented = request
        .headers()
        .get("x-meshforge-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if keys_match(expected, presented) {
        next.run(request).await
    } else {
        // Same answer whether the key is wrong or missing
        (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "unauthorized" })),
        )
            .into_response()
    }
}
