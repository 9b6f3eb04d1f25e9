//! Viewer signaling over WebSocket
//!
//! Text frames are handed to a [`SignalingSession`] one at a time. Replies and
//! server notices share a single writer task so the socket sink has one owner.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use whipcast_sfu::signaling::notice_frame;
use whipcast_sfu::{SignalingSession, StreamManager, ViewerNotice};

use crate::http::AppState;

const OUTBOUND_CAPACITY: usize = 64;
const NOTICE_CAPACITY: usize = 16;

/// `GET /ws`
pub async fn websocket_handler(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(state.max_ws_message_bytes)
        .on_upgrade(move |socket| handle_socket(socket, state.manager))
}

async fn handle_socket(socket: WebSocket, manager: Arc<StreamManager>) {
    let (mut sink, mut receiver) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(OUTBOUND_CAPACITY);
    let (notice_tx, mut notice_rx) = mpsc::channel::<ViewerNotice>(NOTICE_CAPACITY);

    let mut session = SignalingSession::new(manager, notice_tx);
    let viewer_id = session.viewer_id().clone();

    let writer = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                Some(reply) = reply_rx.recv() => reply,
                Some(notice) = notice_rx.recv() => notice_frame(&notice),
                else => break,
            };
            if let Err(e) = sink.send(Message::Text(text.into())).await {
                debug!(error = %e, "WebSocket send failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(message) = receiver.next().await {
        match message {
            Ok(Message::Text(text)) => {
                let Some(reply) = session.handle_text(text.as_str()).await else {
                    continue;
                };
                if reply_tx.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            // binary, ping and pong carry no requests
            Ok(_) => {}
            Err(e) => {
                debug!(viewer_id = %viewer_id, error = %e, "WebSocket receive failed");
                break;
            }
        }
    }

    session.disconnect();
    drop(session);
    drop(reply_tx);
    let _ = writer.await;

    info!(viewer_id = %viewer_id, "Signaling connection closed");
}
