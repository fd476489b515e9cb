use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::websocket::{websocket_handler, AppState, ConnectParams};

pub const LIVENESS_TEXT: &str = "beach-signal relay is running";

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    status: &'static str,
    connections: usize,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .route("/users", get(list_users))
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Clients connect to the bare host, so `/` is both the socket endpoint and
/// the liveness probe.
async fn root(
    upgrade: Option<WebSocketUpgrade>,
    headers: HeaderMap,
    params: Option<Query<ConnectParams>>,
    state: State<AppState>,
) -> Response {
    match upgrade {
        Some(ws) => websocket_handler(ws, headers, params, state).await,
        None => LIVENESS_TEXT.into_response(),
    }
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        connections: state.relay.registry().len(),
    })
}

/// Identities with a live binding, for debugging
pub async fn list_users(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.relay.registry().identities())
}
