// HTTP API module
//
// Routes:
// - POST/DELETE /whip/{stream_id}   WHIP ingest (OPTIONS answered by CORS)
// - GET /ws                          viewer signaling
// - GET /health, GET /api/streams

pub mod error;
pub mod health;
pub mod signaling;
pub mod whip;

use axum::{
    http::{header, HeaderValue},
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use whipcast_sfu::StreamManager;

pub use error::{AppError, AppResult};

/// Shared state of every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<StreamManager>,
    pub max_ws_message_bytes: usize,
}

impl AppState {
    #[must_use]
    pub const fn new(manager: Arc<StreamManager>, max_ws_message_bytes: usize) -> Self {
        Self {
            manager,
            max_ws_message_bytes,
        }
    }
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([header::LOCATION])
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    // CORS answers OPTIONS itself; Accept-Post is added on the way out
    let whip = Router::new()
        .route(
            "/whip/{stream_id}",
            post(whip::publish).delete(whip::unpublish),
        )
        .layer(cors_layer())
        .layer(SetResponseHeaderLayer::if_not_present(
            whip::ACCEPT_POST,
            HeaderValue::from_static(whip::APPLICATION_SDP),
        ));

    Router::new()
        .merge(health::create_health_router())
        .route("/ws", get(signaling::websocket_handler))
        .layer(cors_layer())
        .merge(whip)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
