//! Health check and stream listing endpoints

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};

use crate::http::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/streams", get(list_streams))
}

/// Basic health check (always returns OK if server is running)
pub async fn health_check() -> impl IntoResponse {
    "OK"
}

/// Active streams ordered by id
pub async fn list_streams(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.list())
}
