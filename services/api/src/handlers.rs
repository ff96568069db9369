//! Axum Handlers for the REST API
//!
//! Read-only operational endpoints over the live-session table. They use
//! `utoipa` doc comments to generate OpenAPI documentation.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

use crate::{
    models::{ErrorResponse, HealthResponse, RelayStatus, SessionSummary, SessionsResponse},
    state::AppState,
};

pub enum ApiError {
    NotFound(String),
    InternalServerError(anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(ErrorResponse { message })).into_response()
            }
            ApiError::InternalServerError(err) => {
                error!("Internal Server Error: {:?}", err);
                let message = "An internal server error occurred.".to_string();
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse { message }),
                )
                    .into_response()
            }
        }
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::InternalServerError(err.into())
    }
}

/// Liveness check with the number of live sessions.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is up", body = HealthResponse)
    )
)]
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        live_sessions: state.sessions.live_count(),
    })
}

/// List live relay sessions and their current state.
#[utoipa::path(
    get,
    path = "/sessions",
    responses(
        (status = 200, description = "Live sessions", body = SessionsResponse)
    )
)]
pub async fn list_sessions(State(state): State<Arc<AppState>>) -> Json<SessionsResponse> {
    let sessions = state.sessions.status();
    Json(SessionsResponse {
        live_sessions: sessions.len(),
        sessions,
    })
}

/// Get a single live session by its ID.
#[utoipa::path(
    get,
    path = "/sessions/{id}",
    responses(
        (status = 200, description = "Session details", body = SessionSummary),
        (status = 404, description = "Session not found or already closed", body = ErrorResponse)
    ),
    params(
        ("id" = Uuid, Path, description = "Session ID")
    )
)]
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionSummary>, ApiError> {
    state
        .sessions
        .get(id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("Session {} not found", id)))
}

/// Summary of what the relay supports.
#[utoipa::path(
    get,
    path = "/status",
    responses(
        (status = 200, description = "Relay capabilities", body = RelayStatus)
    )
)]
pub async fn relay_status(State(state): State<Arc<AppState>>) -> Json<RelayStatus> {
    let tools: Vec<String> = state
        .registry
        .specs()
        .iter()
        .map(|spec| spec.name.clone())
        .collect();
    Json(RelayStatus {
        status: "enabled".to_string(),
        provider: state.config.provider.as_str().to_string(),
        voice_to_voice: true,
        barge_in: true,
        vad: "server_side".to_string(),
        tool_count: tools.len(),
        tools,
        max_sessions: state.sessions.max_sessions(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{Config, Provider},
        ws::{
            SessionManager,
            provider::testing::{ConnectBehavior, ScriptedConnector},
            session::SessionSettings,
            transport::testing::link_pair,
        },
    };
    use concierge_core::{
        SessionConfig, ToolRegistry,
        catalog::{CatalogStore, register_catalog_tools},
    };
    use std::{path::PathBuf, time::Duration};
    use tracing::Level;

    fn app_state() -> Arc<AppState> {
        let config = Config {
            bind_address: "127.0.0.1:0".parse().unwrap(),
            provider: Provider::OpenAI,
            openai_api_key: Some("sk-test".to_string()),
            realtime_url: "wss://api.openai.com/v1/realtime".to_string(),
            realtime_model: "gpt-4o-realtime-preview".to_string(),
            azure_endpoint: None,
            azure_api_key: None,
            azure_deployment: "gpt-4o-realtime-preview".to_string(),
            azure_api_version: "2024-10-01-preview".to_string(),
            voice: "alloy".to_string(),
            log_level: Level::INFO,
            prompts_path: PathBuf::from("./prompts"),
            tool_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            configure_timeout: Duration::from_secs(10),
            drain_grace: Duration::from_millis(100),
            max_sessions: 3,
        };
        let registry = Arc::new(
            register_catalog_tools(ToolRegistry::builder(), Arc::new(CatalogStore::demo()))
                .build()
                .unwrap(),
        );
        let settings = Arc::new(SessionSettings {
            connect_timeout: config.connect_timeout,
            configure_timeout: config.configure_timeout,
            drain_grace: config.drain_grace,
            config: SessionConfig::new("test", registry.specs().to_vec()),
        });
        let (connector, _peers) = ScriptedConnector::new(ConnectBehavior::Hang);
        let sessions = SessionManager::new(
            settings,
            Arc::clone(&registry),
            Arc::new(connector),
            config.max_sessions,
        );
        Arc::new(AppState {
            config: Arc::new(config),
            registry,
            sessions,
        })
    }

    #[tokio::test]
    async fn test_health_counts_live_sessions() {
        let state = app_state();
        let Json(report) = health(State(Arc::clone(&state))).await;
        assert_eq!(report.status, "ok");
        assert_eq!(report.live_sessions, 0);

        let (link, _caller) = link_pair();
        state.sessions.accept(link).unwrap();
        let Json(report) = health(State(state)).await;
        assert_eq!(report.live_sessions, 1);
    }

    #[tokio::test]
    async fn test_list_and_get_sessions() {
        let state = app_state();
        let (link, _caller) = link_pair();
        let handle = state.sessions.accept(link).unwrap();

        let Json(listed) = list_sessions(State(Arc::clone(&state))).await;
        assert_eq!(listed.live_sessions, 1);
        assert_eq!(listed.sessions[0].id, handle.id());

        let Json(found) = get_session(State(Arc::clone(&state)), Path(handle.id()))
            .await
            .ok()
            .unwrap();
        assert_eq!(found.id, handle.id());

        let missing = get_session(State(state), Path(Uuid::new_v4())).await;
        match missing {
            Err(err) => assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND),
            Ok(_) => panic!("expected a missing session"),
        }
    }

    #[tokio::test]
    async fn test_relay_status_lists_tools() {
        let state = app_state();
        let Json(status) = relay_status(State(state)).await;
        assert_eq!(status.provider, "openai");
        assert_eq!(status.vad, "server_side");
        assert!(status.barge_in);
        assert_eq!(status.tool_count, status.tools.len());
        assert!(status.tools.contains(&"search_products".to_string()));
        assert_eq!(status.max_sessions, 3);
    }

    #[test]
    fn test_internal_error_is_hidden() {
        let err: ApiError = anyhow::anyhow!("database on fire").into();
        assert_eq!(
            err.into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
