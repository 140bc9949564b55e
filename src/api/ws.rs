//! WebSocket bridge to the task event channel.
//!
//! Clients subscribe per task id. Every subscription is answered with a
//! `snapshot` of the stored state, so a client that subscribes after the
//! task finished still learns the outcome. Events are hints; a client told
//! it `lagged` should poll the status endpoint.

use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;

use super::error::ApiError;
use super::routes::AppState;
use crate::task::TaskId;

/// Client-to-server frames.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
enum ClientCommand {
    Subscribe { task_id: String },
    Unsubscribe { task_id: String },
    Ping,
}

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, None))
}

/// Same channel, already subscribed to one task.
pub async fn ws_task_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let task_id: TaskId = id
        .parse()
        .map_err(|_| ApiError::NotFound(format!("Task {id} not found")))?;
    Ok(ws
        .on_upgrade(move |socket| handle_socket(socket, state, Some(task_id)))
        .into_response())
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, initial: Option<TaskId>) {
    let (mut sender, mut receiver) = socket.split();
    // Subscribe before any snapshot is read so nothing falls in between.
    let mut events = state.notifier.subscribe();
    let mut subscriptions = HashSet::new();

    tracing::info!(task_id = ?initial, "WebSocket client connected");

    let mut greeting = vec![json!({ "event": "connected" })];
    if let Some(task_id) = initial {
        greeting.extend(subscribe(&state, &mut subscriptions, task_id).await);
    }
    for frame in greeting {
        if send_json(&mut sender, &frame).await.is_err() {
            return;
        }
    }

    loop {
        let frames = tokio::select! {
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_command(&state, &mut subscriptions, &text).await
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "WebSocket error");
                    break;
                }
            },
            event = events.recv() => match event {
                Ok(event) if subscriptions.contains(&event.task_id) => {
                    match serde_json::to_value(&event) {
                        Ok(value) => vec![value],
                        Err(e) => {
                            tracing::warn!(error = %e, "Failed to serialize event");
                            continue;
                        }
                    }
                }
                Ok(_) => continue,
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "WebSocket client lagged");
                    vec![lagged_frame(missed)]
                }
                Err(RecvError::Closed) => break,
            },
        };

        let mut closed = false;
        for frame in frames {
            if send_json(&mut sender, &frame).await.is_err() {
                closed = true;
                break;
            }
        }
        if closed {
            break;
        }
    }

    tracing::info!(subscriptions = subscriptions.len(), "WebSocket connection closed");
}

async fn send_json<S>(sender: &mut S, frame: &Value) -> Result<(), axum::Error>
where
    S: futures::Sink<Message, Error = axum::Error> + Unpin,
{
    sender.send(Message::Text(frame.to_string())).await
}

fn lagged_frame(missed: u64) -> Value {
    json!({
        "event": "lagged",
        "payload": {
            "missed": missed,
            "hint": "events were dropped; poll /api/research/:id/status",
        }
    })
}

fn error_frame(message: impl Into<String>) -> Value {
    json!({ "event": "error", "payload": { "error": message.into() } })
}

/// Apply one client frame and return the frames to send back.
async fn handle_command(
    state: &AppState,
    subscriptions: &mut HashSet<TaskId>,
    text: &str,
) -> Vec<Value> {
    let command = match serde_json::from_str::<ClientCommand>(text) {
        Ok(command) => command,
        Err(e) => return vec![error_frame(format!("Invalid message: {e}"))],
    };

    match command {
        ClientCommand::Ping => vec![json!({ "event": "pong" })],
        ClientCommand::Subscribe { task_id } => match task_id.parse::<TaskId>() {
            Ok(id) => subscribe(state, subscriptions, id).await,
            Err(_) => vec![error_frame(format!("Task {task_id} not found"))],
        },
        ClientCommand::Unsubscribe { task_id } => {
            if let Ok(id) = task_id.parse::<TaskId>() {
                subscriptions.remove(&id);
            }
            vec![json!({ "event": "unsubscribed", "task_id": task_id })]
        }
    }
}

/// Register interest in a task and report its stored state.
async fn subscribe(
    state: &AppState,
    subscriptions: &mut HashSet<TaskId>,
    task_id: TaskId,
) -> Vec<Value> {
    let task = match state.store.get_task(task_id).await {
        Ok(task) => task,
        Err(e) => return vec![error_frame(ApiError::from(e).to_string())],
    };
    let message_count = match state.store.message_count(task_id).await {
        Ok(n) => n,
        Err(e) => return vec![error_frame(ApiError::from(e).to_string())],
    };

    subscriptions.insert(task_id);
    tracing::debug!(task_id = %task_id, "WebSocket subscribed");

    vec![
        json!({ "event": "subscribed", "task_id": task_id }),
        json!({
            "event": "snapshot",
            "task_id": task_id,
            "payload": {
                "status": task.status,
                "progress": task.progress,
                "error": task.error,
                "message_count": message_count,
                "from_cache": task.from_cache,
            }
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::llm::ScriptedClient;
    use crate::store::TaskStore;
    use crate::task::Task;

    fn state() -> AppState {
        AppState::new(
            Config::default(),
            TaskStore::open_in_memory().unwrap(),
            Arc::new(ScriptedClient::demo()),
        )
    }

    #[tokio::test]
    async fn test_subscribe_sends_snapshot() {
        let state = state();
        let task = state
            .store
            .create_task(Task::queued("Explain X", None))
            .await
            .unwrap();
        let mut subs = HashSet::new();

        let frame = json!({ "action": "subscribe", "task_id": task.id }).to_string();
        let frames = handle_command(&state, &mut subs, &frame).await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0]["event"], "subscribed");
        assert_eq!(frames[1]["event"], "snapshot");
        assert_eq!(frames[1]["payload"]["status"], "queued");
        assert_eq!(frames[1]["payload"]["message_count"], 0);
        assert!(subs.contains(&task.id));

        let frame = json!({ "action": "unsubscribe", "task_id": task.id }).to_string();
        let frames = handle_command(&state, &mut subs, &frame).await;
        assert_eq!(frames[0]["event"], "unsubscribed");
        assert!(subs.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_task_and_bad_frames() {
        let state = state();
        let mut subs = HashSet::new();

        let frame = json!({ "action": "subscribe", "task_id": TaskId::new() }).to_string();
        let frames = handle_command(&state, &mut subs, &frame).await;
        assert_eq!(frames[0]["event"], "error");
        assert!(subs.is_empty());

        let frames = handle_command(&state, &mut subs, r#"{"action":"dance"}"#).await;
        assert_eq!(frames[0]["event"], "error");

        let frames = handle_command(&state, &mut subs, r#"{"action":"ping"}"#).await;
        assert_eq!(frames[0]["event"], "pong");
    }

    #[test]
    fn test_lagged_frame_points_to_polling() {
        let frame = lagged_frame(7);
        assert_eq!(frame["event"], "lagged");
        assert_eq!(frame["payload"]["missed"], 7);
    }
}
