//! Live-update channel.
//!
//! One WebSocket per observer. The server pushes JSON envelopes; the client
//! may send:
//!
//! ```text
//! {"type": "subscribe_task", "task_id": "..."}
//! {"type": "unsubscribe_task", "task_id": "..."}
//! {"type": "ping", "timestamp": ...}
//! ```

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::routes::AppState;
use super::types::WsQuery;
use crate::notify::{ConnectionId, Envelope, NotificationHub};
use crate::task::{TaskId, TaskManager};

/// Message sent by an observer.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    SubscribeTask {
        #[serde(alias = "taskId")]
        task_id: String,
    },
    UnsubscribeTask {
        #[serde(alias = "taskId")]
        task_id: String,
    },
    Ping {
        #[serde(default)]
        timestamp: Option<Value>,
    },
}

/// WebSocket endpoint for live task updates.
pub async fn live_updates_ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let client_id = query
        .client_id
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| handle_live_updates(socket, state, client_id))
}

async fn handle_live_updates(socket: WebSocket, state: Arc<AppState>, client_id: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();

    // Keyed per socket: a reconnect under the same client_id gets its own entry
    let conn = state.hub.connect(&client_id, tx);
    state
        .hub
        .send_to(conn, Envelope::ConnectionEstablished { client_id });

    // Writer: drain the connection's queue into the socket
    let mut send_task = tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            let json = match serde_json::to_string(&envelope) {
                Ok(json) => json,
                Err(e) => {
                    tracing::warn!("Failed to serialize envelope: {}", e);
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json)).await.is_err() {
                break;
            }
        }
    });

    let tasks = Arc::clone(&state.tasks);
    let hub = Arc::clone(&state.hub);
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                Message::Text(text) => {
                    if let Some(reply) = handle_client_message(&tasks, conn, &text).await {
                        hub.send_to(conn, reply);
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut recv_task => {
            send_task.abort();
        }
        _ = &mut send_task => {
            recv_task.abort();
        }
    }

    state.hub.disconnect(conn);
}

/// Apply one client message and return the direct reply, if any.
async fn handle_client_message(
    tasks: &TaskManager,
    conn: ConnectionId,
    text: &str,
) -> Option<Envelope> {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(_) => return Some(Envelope::error("Invalid JSON")),
    };
    let kind = raw
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let message: ClientMessage = match serde_json::from_value(raw) {
        Ok(message) => message,
        Err(_) => {
            return Some(Envelope::error(format!("Unknown message type: {}", kind)));
        }
    };

    match message {
        ClientMessage::SubscribeTask { task_id } => {
            let Ok(id) = task_id.parse::<TaskId>() else {
                return Some(Envelope::error(format!("Invalid task ID '{}'", task_id)));
            };
            if let Err(e) = tasks.subscribe(id, conn).await {
                return Some(Envelope::error(e.to_string()));
            }
            let task = tasks.get_task(id).await?;
            let data = serde_json::to_value(&task).ok()?;
            Some(Envelope::TaskUpdate { task_id: id, data })
        }
        ClientMessage::UnsubscribeTask { task_id } => {
            if let Ok(id) = task_id.parse::<TaskId>() {
                tasks.unsubscribe(id, conn);
            }
            None
        }
        ClientMessage::Ping { timestamp } => Some(Envelope::Pong { timestamp }),
    }
}

/// Push a heartbeat to every connection at `every`.
pub fn spawn_heartbeat(hub: Arc<NotificationHub>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.tick().await;
        loop {
            interval.tick().await;
            let reached = hub.broadcast_all(&Envelope::heartbeat());
            tracing::trace!(reached, "Heartbeat sent");
        }
    })
}
