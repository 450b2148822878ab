//! WebSocket activity channel.
//!
//! Every activity `add` is pushed to connected clients as
//! `{type:"activity:new", activity}`. The server keeps no per-client state
//! beyond the broadcast subscription; reconnection is the client's job. A
//! lagging client skips missed events rather than stalling the stream.

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::Extension,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::server::app::AppState;

/// GET /ws/activity
pub async fn activity_ws_handler(
    ws: WebSocketUpgrade,
    Extension(state): Extension<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| stream_activity(socket, state))
}

async fn stream_activity(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let mut events = BroadcastStream::new(state.activity.subscribe());
    loop {
        tokio::select! {
            event = events.next() => match event {
                Some(Ok(payload)) => {
                    if sender.send(Message::Text(payload.to_string())).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(missed))) => {
                    debug!(missed, "activity websocket client lagged");
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                // Clients only ever ping or close; anything else is ignored.
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            },
        }
    }
    debug!("activity websocket client disconnected");
}
