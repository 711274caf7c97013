use std::time::Duration;

use axum::{
    body::Bytes,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt, stream::SplitSink, stream::SplitStream};
use serde::Serialize;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::api::SharedState;
use crate::events::EventEnvelope;

/// How often to send WebSocket Ping frames.
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// How long to wait for a Pong response before considering the connection dead.
const PONG_TIMEOUT: Duration = Duration::from_secs(60);

// ── WebSocket message types ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum WsMessage {
    Connected { version: &'static str },
    Event(EventEnvelope),
    /// The observer fell behind and `missed` events were dropped.
    Lagged { missed: u64 },
}

impl WsMessage {
    fn to_text(&self) -> Option<Message> {
        match serde_json::to_string(self) {
            Ok(json) => Some(Message::Text(json.into())),
            Err(e) => {
                warn!(error = %e, "failed to serialize websocket message");
                None
            }
        }
    }
}

// ── WebSocket handler ────────────────────────────────────────────────

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<SharedState>) -> impl IntoResponse {
    let rx = state.orchestrator.subscribe();
    ws.on_upgrade(move |socket| handle_socket(socket, rx))
}

async fn handle_socket(socket: WebSocket, rx: broadcast::Receiver<EventEnvelope>) {
    let (sender, receiver) = socket.split();
    run_socket_loop(sender, receiver, rx).await;
}

/// Forward events to one observer with ping/pong keepalive.
///
/// If no Pong arrives within [`PONG_TIMEOUT`] after a Ping, the connection
/// is considered dead and the loop exits.
async fn run_socket_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    mut rx: broadcast::Receiver<EventEnvelope>,
) {
    let hello = WsMessage::Connected {
        version: env!("CARGO_PKG_VERSION"),
    };
    if let Some(msg) = hello.to_text()
        && sender.send(msg).await.is_err()
    {
        return;
    }

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await;

    let mut last_pong = Instant::now();
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                if awaiting_pong && last_pong.elapsed() > PONG_TIMEOUT {
                    debug!("websocket observer missed pong, closing");
                    break;
                }
                if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
                awaiting_pong = true;
            }

            result = rx.recv() => {
                let msg = match result {
                    Ok(envelope) => WsMessage::Event(envelope),
                    Err(broadcast::error::RecvError::Lagged(missed)) => WsMessage::Lagged { missed },
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if let Some(frame) = msg.to_text()
                    && sender.send(frame).await.is_err()
                {
                    break;
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                        awaiting_pong = false;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    let _ = sender.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use chrono::Utc;

    #[test]
    fn test_event_message_shape() {
        let msg = WsMessage::Event(EventEnvelope {
            task_id: Some("task_1".to_string()),
            app_id: Some("app_1".to_string()),
            timestamp: Utc::now(),
            event: Event::status_line("Promoting"),
        });
        let json: serde_json::Value = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "event");
        assert_eq!(json["data"]["taskId"], "task_1");
        assert_eq!(json["data"]["event"]["type"], "status_line");
        assert_eq!(json["data"]["event"]["data"]["text"], "Promoting");
    }

    #[test]
    fn test_lagged_message_shape() {
        let json = serde_json::to_value(WsMessage::Lagged { missed: 7 }).unwrap();
        assert_eq!(json, serde_json::json!({"type": "lagged", "data": {"missed": 7}}));
    }
}
