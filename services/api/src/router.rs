//! Axum Router Configuration
//!
//! This module defines the complete HTTP routing for the application,
//! including the status endpoints, the WebSocket relay endpoint, and the
//! OpenAPI documentation.

use crate::{
    handlers,
    models::{
        ErrorResponse, HealthResponse, RelayStatus, SessionState, SessionSummary, SessionsResponse,
    },
    state::AppState,
    ws::ws_handler,
};

use axum::{Router, routing::get};
use std::sync::Arc;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health,
        handlers::list_sessions,
        handlers::get_session,
        handlers::relay_status,
    ),
    components(
        schemas(HealthResponse, SessionsResponse, SessionSummary, SessionState, RelayStatus, ErrorResponse)
    ),
    tags(
        (name = "Concierge Relay", description = "Operational status of the voice concierge relay")
    )
)]
pub struct ApiDoc;

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    // Group all routes that require AppState into their own router.
    let api_router = Router::new()
        .route("/health", get(handlers::health))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/status", get(handlers::relay_status))
        .route("/ws", get(ws_handler))
        // Apply the state ONLY to this group of routes.
        .with_state(app_state);

    // Create the final router that merges the stateful routes
    // with the stateless routes (like Swagger UI).
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .merge(api_router)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openapi_document_lists_status_paths() {
        let doc = ApiDoc::openapi();
        for path in ["/health", "/sessions", "/sessions/{id}", "/status"] {
            assert!(doc.paths.paths.contains_key(path), "missing {path}");
        }
    }
}
