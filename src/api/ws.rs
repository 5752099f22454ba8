//! WebSocket stream of `EngineEvent` JSON

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use super::routes::AppState;
use crate::models::EngineEvent;

pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(event: &EngineEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("Failed to serialize ws event: {}", e);
        "{}".to_string()
    })
}

async fn handle_socket(mut socket: WebSocket, state: AppState) {
    let mut rx = state.orchestrator.subscribe();

    // Replay current state so a fresh dashboard is not blank until the next tick.
    let mut replay = vec![EngineEvent::Session(state.orchestrator.view())];
    if let Some(snapshot) = state.orchestrator.latest_metrics() {
        replay.push(EngineEvent::Metrics((*snapshot).clone()));
    }
    for event in &replay {
        if socket.send(Message::Text(encode(event))).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(event) => {
                    if socket.send(Message::Text(encode(&event))).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "ws client lagging, events dropped");
                }
                Err(RecvError::Closed) => break,
            },
            msg = socket.recv() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(json) = serde_json::from_str::<serde_json::Value>(&text) {
                        if json.get("type").and_then(|t| t.as_str()) == Some("ping") {
                            let timestamp = json
                                .get("data")
                                .and_then(|d| d.get("timestamp"))
                                .and_then(|t| t.as_i64())
                                .unwrap_or(0);
                            let pong = serde_json::json!({
                                "type": "pong",
                                "data": { "timestamp": timestamp }
                            });
                            let _ = socket.send(Message::Text(pong.to_string())).await;
                        }
                    } else if text == "ping" {
                        let _ = socket.send(Message::Text("pong".to_string())).await;
                    }
                }
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }
}
