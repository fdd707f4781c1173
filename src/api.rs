use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi as UtoipaOpenApi, ToSchema};

use crate::errors::ErrorBody;
use crate::hub::sse;
use crate::pty::{api as terminal_api, ExitCause, ExitInfo, SessionInfo, SessionState};
use crate::service::AppState;

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    /// Live push connections
    pub connections: usize,
    /// Live terminal sessions
    pub sessions: usize,
}

#[derive(UtoipaOpenApi)]
#[openapi(
    paths(
        health,
        sse::event_stream,
        terminal_api::list_sessions,
        terminal_api::close_session,
    ),
    components(schemas(
        HealthResponse,
        ErrorBody,
        SessionInfo,
        SessionState,
        ExitInfo,
        ExitCause
    )),
    tags(
        (name = "events", description = "Live event push channel"),
        (name = "terminal", description = "Terminal sessions")
    )
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/events/stream", get(sse::event_stream))
        .route("/api-docs/openapi.json", get(openapi))
        .merge(terminal_api::terminal_routes())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Server is healthy", body = HealthResponse))
)]
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.uptime_secs(),
        connections: state.hub.connection_count(),
        sessions: state.sessions.session_count(),
    })
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
