//! WHIP ingest endpoints

use axum::{
    extract::{Path, State},
    http::{header, HeaderName, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::info;
use whipcast_sfu::StreamId;

use crate::http::{AppResult, AppState};

pub const ACCEPT_POST: HeaderName = HeaderName::from_static("accept-post");
pub const APPLICATION_SDP: &str = "application/sdp";

/// `POST /whip/{stream_id}`: SDP offer in, SDP answer out
pub async fn publish(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
    offer: String,
) -> AppResult<Response> {
    let stream_id = StreamId::from(stream_id);
    let answer = whipcast_sfu::whip::publish(&state.manager, &stream_id, &offer).await?;

    Ok((
        StatusCode::CREATED,
        [
            (header::LOCATION, format!("/whip/{stream_id}")),
            (header::CONTENT_TYPE, APPLICATION_SDP.to_string()),
        ],
        answer,
    )
        .into_response())
}

/// `DELETE /whip/{stream_id}`: end the publish; unknown ids succeed too
pub async fn unpublish(
    State(state): State<AppState>,
    Path(stream_id): Path<String>,
) -> StatusCode {
    let stream_id = StreamId::from(stream_id);
    if whipcast_sfu::whip::unpublish(&state.manager, &stream_id) {
        info!(stream_id = %stream_id, "Publisher ended stream");
    }
    StatusCode::NO_CONTENT
}
