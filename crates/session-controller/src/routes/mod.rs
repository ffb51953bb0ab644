//! HTTP routes for the Session Controller.
//!
//! Defines the Axum router and application state.

use crate::actors::SessionControllerHandle;
use crate::engine::SessionEngine;
use crate::handlers;
use crate::middleware::http_metrics_middleware;
use crate::observability::{health_router, HealthState};
use axum::{
    middleware,
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

/// Request timeout. Accept waits on the recording service, so this sits
/// well above the external call timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Routes state-advancing operations through the host actors.
    pub controller: SessionControllerHandle,

    /// Direct engine access for reads and top-ups.
    pub engine: Arc<SessionEngine>,
}

/// Build the application routes.
///
/// - `/health`, `/ready` - probes, unversioned
/// - `/metrics` - Prometheus scrape endpoint, unversioned
/// - `/api/v1/hosts/:host_id/channels/:session_type/...` - channel, waitlist
///   and temp host operations
/// - `/api/v1/participants/:participant_id/top-up` - balance top-up
/// - `/internal/v1/tasks` - scheduled task delivery from the dispatcher
pub fn build_routes(
    state: Arc<AppState>,
    health_state: Arc<HealthState>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let api_routes = Router::new()
        .route(
            "/api/v1/hosts/:host_id/channels/:session_type",
            get(handlers::get_channel),
        )
        .route(
            "/api/v1/hosts/:host_id/channels/:session_type/enable",
            post(handlers::enable_channel),
        )
        .route(
            "/api/v1/hosts/:host_id/channels/:session_type/disable",
            post(handlers::disable_channel),
        )
        .route(
            "/api/v1/hosts/:host_id/channels/:session_type/waitlist",
            get(handlers::get_waitlist).post(handlers::join_waitlist),
        )
        .route(
            "/api/v1/hosts/:host_id/channels/:session_type/waitlist/:user_id",
            delete(handlers::leave_waitlist),
        )
        .route(
            "/api/v1/hosts/:host_id/channels/:session_type/temp-host",
            get(handlers::get_temp_host)
                .post(handlers::admit_temp_host)
                .patch(handlers::patch_temp_host),
        )
        .route(
            "/api/v1/participants/:participant_id/top-up",
            post(handlers::top_up),
        )
        .route("/internal/v1/tasks", post(handlers::deliver_task))
        .with_state(state);

    let metrics_routes = Router::new()
        .route("/metrics", get(handlers::metrics_handler))
        .with_state(metrics_handle);

    // Layer order (bottom-to-top execution):
    // 1. TimeoutLayer (innermost)
    // 2. TraceLayer
    // 3. http_metrics_middleware (outermost, sees every response)
    api_routes
        .merge(health_router(health_state))
        .merge(metrics_routes)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(http_metrics_middleware))
}
