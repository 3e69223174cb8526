use std::time::Duration;

use axum::extract::ws::{close_code, CloseFrame, Message, Utf8Bytes, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use renderfarm_core::types::GroupId;
use renderfarm_events::GroupEventStream;
use tokio::time::{interval_at, Instant};

use crate::error::AppResult;
use crate::state::AppState;

/// Interval between keep-alive pings on an idle event stream.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// GET /api/v1/job-groups/{id}/events
///
/// The subscription is taken before the upgrade, so an unknown group is
/// answered with a plain 404 instead of an empty socket.
pub async fn group_events_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(group_id): Path<GroupId>,
) -> AppResult<Response> {
    let events = state.manager.subscribe(group_id).await?;
    Ok(ws.on_upgrade(move |socket| stream_events(socket, events)))
}

enum Ending {
    Complete,
    StreamClosed,
    ClientGone,
}

/// Forward one subscription to one socket until the group completes or
/// either side goes away.
async fn stream_events(socket: WebSocket, mut events: GroupEventStream) {
    let group_id = events.group_id();
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(conn_id = %conn_id, group_id = %group_id, "Event stream connected");

    let (mut sink, mut inbound) = socket.split();
    let mut ping = interval_at(Instant::now() + PING_INTERVAL, PING_INTERVAL);

    let ending = loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Lagged too far, or the group was released.
                    break Ending::StreamClosed;
                };
                let complete = event.is_group_complete();
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!(group_id = %group_id, error = %e, "Failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break Ending::ClientGone;
                }
                if complete {
                    break Ending::Complete;
                }
            }
            _ = ping.tick() => {
                if sink.send(Message::Ping(Default::default())).await.is_err() {
                    break Ending::ClientGone;
                }
            }
            message = inbound.next() => match message {
                Some(Ok(Message::Close(_))) | None => break Ending::ClientGone,
                Some(Ok(Message::Pong(_))) => {
                    tracing::trace!(conn_id = %conn_id, "Pong received");
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(conn_id = %conn_id, error = %e, "WebSocket receive error");
                    break Ending::ClientGone;
                }
            },
        }
    };

    let reason = match ending {
        Ending::Complete => Some("group complete"),
        Ending::StreamClosed => Some("event stream closed"),
        Ending::ClientGone => None,
    };
    if let Some(reason) = reason {
        let frame = CloseFrame {
            code: close_code::NORMAL,
            reason: Utf8Bytes::from_static(reason),
        };
        if let Err(e) = sink.send(Message::Close(Some(frame))).await {
            tracing::debug!(conn_id = %conn_id, error = %e, "Failed to send close frame");
        }
    }

    tracing::info!(conn_id = %conn_id, group_id = %group_id, "Event stream disconnected");
}
