//! vigil-api — HTTP surface for Vigil.
//!
//! Read-only health queries, operator actions (reset, registration) behind
//! an admin token, and Prometheus exposition.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/health/dashboard` | System-wide snapshot |
//! | GET | `/health/alerts` | Recent status-change alerts |
//! | GET | `/health/{service}` | Service detail (`?window_hours=N`) |
//! | GET | `/health/{service}/errors` | Error breakdown (`?window_hours=N`) |
//! | GET | `/health/{service}/uptime` | All-time uptime and totals |
//! | GET | `/health/{service}/history` | Persisted results (`?limit=N`) |
//! | POST | `/health/{service}/reset` | Clear window, breaker, hysteresis (admin) |
//! | GET | `/admin/services` | List registrations |
//! | POST | `/admin/services` | Register a service (admin) |
//! | PUT | `/admin/services/{service}` | Replace a service's config (admin) |
//! | DELETE | `/admin/services/{service}` | Deregister a service (admin) |
//! | GET | `/metrics` | Prometheus exposition |
//!
//! Admin routes require the `x-admin-token` header to match the configured
//! token. Without a configured token they always answer 403.

pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post, put};
use vigil_health::HealthMonitor;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub monitor: Arc<HealthMonitor>,
    pub admin_token: Option<Arc<str>>,
}

impl ApiState {
    pub fn new(monitor: Arc<HealthMonitor>, admin_token: Option<String>) -> Self {
        Self {
            monitor,
            admin_token: admin_token.map(Arc::from),
        }
    }
}

/// Build the complete API router.
pub fn build_router(state: ApiState) -> Router {
    let health_routes = Router::new()
        .route("/dashboard", get(handlers::dashboard))
        .route("/alerts", get(handlers::recent_alerts))
        .route("/{service}", get(handlers::service_detail))
        .route("/{service}/errors", get(handlers::error_breakdown))
        .route("/{service}/uptime", get(handlers::uptime))
        .route("/{service}/history", get(handlers::history))
        .route("/{service}/reset", post(handlers::reset_service));

    let admin_routes = Router::new()
        .route("/services", get(handlers::list_services).post(handlers::register_service))
        .route(
            "/services/{service}",
            put(handlers::update_service).delete(handlers::deregister_service),
        );

    Router::new()
        .nest("/health", health_routes)
        .nest("/admin", admin_routes)
        .route("/metrics", get(handlers::prometheus_metrics))
        .with_state(state)
}
