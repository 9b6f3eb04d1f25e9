// Whipcast API Library
//
// HTTP (WHIP ingest) and WebSocket (viewer signaling) surface of the SFU

pub mod http;

pub use http::{create_router, AppState};
