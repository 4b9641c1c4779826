//! HTTP router configuration.
//!
//! This module provides functions to build the Axum router with all
//! necessary routes and middleware.

use std::time::Duration;

use axum::Router;
use axum::routing::get;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::admin::{AdminState, build_admin_router};
use crate::handler::{handle_function, health_check, list_modules, metrics, readiness_check};
use crate::state::AppState;

/// Admin API configuration for router.
#[derive(Debug, Clone)]
pub struct AdminRouterConfig {
    /// Admin API prefix (e.g., "/admin").
    pub prefix: String,
    /// Admin authentication token.
    pub token: String,
}

/// Build the main application router.
///
/// Routes:
/// - `POST /functions/:job_type` - Run a job with the request body as input
/// - `GET /functions/:job_type` - Run a job with empty input
/// - `GET /health` - Health check
/// - `GET /ready` - Readiness check
/// - `GET /modules` - List registered job types
/// - `GET /metrics` - Engine counters
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    build_router_with_admin(state, request_timeout, None)
}

/// Build the main application router with optional Admin API.
pub fn build_router_with_admin(
    state: AppState,
    request_timeout: Duration,
    admin_config: Option<AdminRouterConfig>,
) -> Router {
    let function_routes =
        Router::new().route("/functions/:job_type", get(handle_function).post(handle_function));

    let health_routes = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/modules", get(list_modules))
        .route("/metrics", get(metrics));

    let mut router = Router::new().merge(function_routes).merge(health_routes);

    if let Some(config) = admin_config {
        let admin_state = AdminState {
            app_state: state.clone(),
            admin_token: config.token,
        };
        router = router.nest(&config.prefix, build_admin_router(admin_state));
    }

    router
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
