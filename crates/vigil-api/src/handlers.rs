//! HTTP handlers.
//!
//! Each handler delegates to the `HealthMonitor` and wraps the result in the
//! `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use tracing::{info, warn};

use vigil_core::ServiceConfig;
use vigil_health::MonitorError;
use vigil_metrics::MetricsError;

use crate::ApiState;

pub const ADMIN_TOKEN_HEADER: &str = "x-admin-token";
const DEFAULT_HISTORY_LIMIT: usize = 100;
const MAX_HISTORY_LIMIT: usize = 1000;
const DEFAULT_ALERTS_LIMIT: usize = 100;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

fn monitor_error(e: MonitorError) -> Response {
    let status = match &e {
        MonitorError::NotFound(_) | MonitorError::Metrics(MetricsError::UnknownService(_)) => {
            StatusCode::NOT_FOUND
        }
        MonitorError::AlreadyRegistered(_) => StatusCode::CONFLICT,
        MonitorError::IdMismatch { .. } | MonitorError::Config(_) => StatusCode::BAD_REQUEST,
        MonitorError::Metrics(_) | MonitorError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    error_response(&e.to_string(), status)
}

/// Reject the request unless it carries the configured admin token.
fn require_admin(state: &ApiState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.admin_token.as_deref() else {
        return Err(error_response(
            "admin token not configured",
            StatusCode::FORBIDDEN,
        ));
    };
    let provided = headers
        .get(ADMIN_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        warn!("admin request rejected: bad or missing token");
        Err(error_response("invalid admin token", StatusCode::FORBIDDEN))
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct WindowQuery {
    pub window_hours: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

// ── Health ─────────────────────────────────────────────────────

/// GET /health/dashboard
pub async fn dashboard(State(state): State<ApiState>) -> Response {
    match state.monitor.snapshot().await {
        Ok(snapshot) => ApiResponse::ok(snapshot).into_response(),
        Err(e) => monitor_error(e),
    }
}

/// GET /health/{service}
pub async fn service_detail(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    match state.monitor.service_detail(&service, query.window_hours).await {
        Ok(detail) => ApiResponse::ok(detail).into_response(),
        Err(e) => monitor_error(e),
    }
}

/// GET /health/{service}/errors
pub async fn error_breakdown(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Query(query): Query<WindowQuery>,
) -> Response {
    match state.monitor.error_breakdown(&service, query.window_hours).await {
        Ok(breakdown) => ApiResponse::ok(breakdown).into_response(),
        Err(e) => monitor_error(e),
    }
}

/// GET /health/{service}/uptime
pub async fn uptime(State(state): State<ApiState>, Path(service): Path<String>) -> Response {
    match state.monitor.uptime(&service).await {
        Ok(report) => ApiResponse::ok(report).into_response(),
        Err(e) => monitor_error(e),
    }
}

/// GET /health/{service}/history
pub async fn history(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    match state.monitor.history(&service, limit).await {
        Ok(results) => ApiResponse::ok(results).into_response(),
        Err(e) => monitor_error(e),
    }
}

/// POST /health/{service}/reset
pub async fn reset_service(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = require_admin(&state, &headers) {
        return rejection;
    }
    match state.monitor.reset(&service).await {
        Ok(()) => {
            info!(%service, "service reset via API");
            ApiResponse::ok("reset").into_response()
        }
        Err(e) => monitor_error(e),
    }
}

/// GET /health/alerts
pub async fn recent_alerts(
    State(state): State<ApiState>,
    Query(query): Query<LimitQuery>,
) -> Response {
    let limit = query.limit.unwrap_or(DEFAULT_ALERTS_LIMIT);
    ApiResponse::ok(state.monitor.recent_alerts(limit)).into_response()
}

// ── Admin ──────────────────────────────────────────────────────

/// GET /admin/services
pub async fn list_services(State(state): State<ApiState>) -> Response {
    ApiResponse::ok(state.monitor.list_services().await).into_response()
}

/// POST /admin/services
pub async fn register_service(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(config): Json<ServiceConfig>,
) -> Response {
    if let Err(rejection) = require_admin(&state, &headers) {
        return rejection;
    }
    match state.monitor.register(config.clone()).await {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(config)).into_response(),
        Err(e) => monitor_error(e),
    }
}

/// PUT /admin/services/{service}
pub async fn update_service(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    headers: HeaderMap,
    Json(config): Json<ServiceConfig>,
) -> Response {
    if let Err(rejection) = require_admin(&state, &headers) {
        return rejection;
    }
    match state.monitor.update_config(&service, config.clone()).await {
        Ok(()) => ApiResponse::ok(config).into_response(),
        Err(e) => monitor_error(e),
    }
}

/// DELETE /admin/services/{service}
pub async fn deregister_service(
    State(state): State<ApiState>,
    Path(service): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(rejection) = require_admin(&state, &headers) {
        return rejection;
    }
    match state.monitor.deregister(&service).await {
        Ok(()) => ApiResponse::ok("deregistered").into_response(),
        Err(e) => monitor_error(e),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> Response {
    match state.monitor.render_prometheus().await {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => monitor_error(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use vigil_core::{ErrorKind, ProbeSpec};
    use vigil_dashboard::Alerter;
    use vigil_health::{FnProbe, HealthMonitor, ProbeOutcome};
    use vigil_metrics::MetricsStore;

    fn test_state(token: Option<&str>) -> ApiState {
        let monitor = HealthMonitor::new(Arc::new(MetricsStore::new()), Arc::new(Alerter::new(16)))
            .with_snapshot_ttl(Duration::ZERO);
        ApiState::new(Arc::new(monitor), token.map(str::to_string))
    }

    fn custom_config(id: &str) -> ServiceConfig {
        let mut config = ServiceConfig::new(id, ProbeSpec::Custom { name: id.to_string() });
        config.poll_interval = Duration::from_secs(3600);
        config
    }

    async fn with_failing_service(state: &ApiState, id: &str) {
        let probe = FnProbe::new(id, || async {
            ProbeOutcome::fail(ErrorKind::Timeout, "slow")
        });
        state
            .monitor
            .register_with_probe(custom_config(id), Arc::new(probe))
            .await
            .unwrap();
        state.monitor.check_now(id).await.unwrap();
    }

    fn admin_headers(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ADMIN_TOKEN_HEADER, token.parse().unwrap());
        headers
    }

    fn tcp_config(id: &str) -> ServiceConfig {
        ServiceConfig::new(
            id,
            ProbeSpec::Tcp {
                address: "127.0.0.1:1".to_string(),
            },
        )
    }

    #[tokio::test]
    async fn dashboard_empty() {
        let resp = dashboard(State(test_state(None))).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn detail_of_unknown_service_is_404() {
        let resp = service_detail(
            State(test_state(None)),
            Path("ghost".to_string()),
            Query(WindowQuery::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn detail_errors_and_uptime() {
        let state = test_state(None);
        with_failing_service(&state, "svc").await;

        let resp = service_detail(
            State(state.clone()),
            Path("svc".to_string()),
            Query(WindowQuery {
                window_hours: Some(24),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = error_breakdown(
            State(state.clone()),
            Path("svc".to_string()),
            Query(WindowQuery::default()),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = uptime(State(state), Path("svc".to_string())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn reset_requires_configured_token() {
        let state = test_state(None);
        with_failing_service(&state, "svc").await;
        let resp = reset_service(State(state), Path("svc".to_string()), admin_headers("x")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn reset_rejects_wrong_token() {
        let state = test_state(Some("secret"));
        with_failing_service(&state, "svc").await;
        let resp =
            reset_service(State(state), Path("svc".to_string()), admin_headers("guess")).await;
        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn reset_with_token() {
        let state = test_state(Some("secret"));
        with_failing_service(&state, "svc").await;
        let resp = reset_service(
            State(state.clone()),
            Path("svc".to_string()),
            admin_headers("secret"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let detail = state.monitor.service_detail("svc", None).await.unwrap();
        assert_eq!(detail.metrics.window_len, 0);
    }

    #[tokio::test]
    async fn register_update_and_deregister() {
        let state = test_state(Some("secret"));

        let resp = register_service(
            State(state.clone()),
            admin_headers("secret"),
            Json(tcp_config("db")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CREATED);

        let resp = register_service(
            State(state.clone()),
            admin_headers("secret"),
            Json(tcp_config("db")),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let mut updated = tcp_config("db");
        updated.failure_threshold = 5;
        let resp = update_service(
            State(state.clone()),
            Path("db".to_string()),
            admin_headers("secret"),
            Json(updated),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(state.monitor.list_services().await[0].failure_threshold, 5);

        let resp = deregister_service(
            State(state.clone()),
            Path("db".to_string()),
            admin_headers("secret"),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(state.monitor.list_services().await.is_empty());
    }

    #[tokio::test]
    async fn register_invalid_config_is_400() {
        let state = test_state(Some("secret"));
        let mut bad = tcp_config("db");
        bad.window_size = 0;
        let resp = register_service(State(state), admin_headers("secret"), Json(bad)).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn history_without_store_uses_window() {
        let state = test_state(None);
        with_failing_service(&state, "svc").await;
        let resp = history(
            State(state),
            Path("svc".to_string()),
            Query(LimitQuery { limit: Some(5) }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn alerts_endpoint() {
        let state = test_state(None);
        with_failing_service(&state, "svc").await;
        assert_eq!(state.monitor.recent_alerts(10).len(), 1);
        let resp = recent_alerts(State(state), Query(LimitQuery::default())).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state(None);
        with_failing_service(&state, "svc").await;
        let resp = prometheus_metrics(State(state)).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp.headers().get("content-type").unwrap().to_str().unwrap();
        assert!(content_type.contains("text/plain"));
    }
}
