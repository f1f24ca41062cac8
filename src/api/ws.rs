// =============================================================================
// WebSocket Handler — push-based task progress
// =============================================================================
//
// Clients connect to `/api/v1/ws/tasks/<task_id>` and receive:
//   1. The task's current state immediately on connect.
//   2. A state frame on every status or progress change, in order.
//
// The socket's send half is wrapped as a ProgressSink and registered with
// the owning task manager; once a send fails (client gone) the manager
// drops the subscriber. The receive half only watches for Close frames.
// =============================================================================

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::tasks::{ProgressSink, TaskState};

use super::ApiContext;

/// ProgressSink over the write half of one WebSocket connection.
struct WsSink {
    sender: AsyncMutex<SplitSink<WebSocket, Message>>,
}

#[async_trait]
impl ProgressSink for WsSink {
    async fn send(&self, state: &TaskState) -> Result<()> {
        let frame = serde_json::to_string(state)?;
        self.sender
            .lock()
            .await
            .send(Message::Text(frame))
            .await
            .map_err(|e| anyhow::anyhow!("websocket send failed: {e}"))
    }
}

/// Upgrade handler for task-progress subscriptions.
pub async fn task_progress_handler(
    ws: WebSocketUpgrade,
    State(context): State<ApiContext>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    // Reject unknown tasks before the upgrade so callers get a clean 404.
    if context.find_task(&task_id).is_none() {
        return (StatusCode::NOT_FOUND, format!("no such task: {task_id}")).into_response();
    }

    info!(task_id = %task_id, "task progress subscriber connecting");
    ws.on_upgrade(move |socket| handle_connection(socket, context, task_id))
        .into_response()
}

async fn handle_connection(socket: WebSocket, context: ApiContext, task_id: String) {
    let (sender, mut receiver) = socket.split();
    let sink = Arc::new(WsSink {
        sender: AsyncMutex::new(sender),
    });

    // Register with whichever manager owns the task; registration sends the
    // current state as the first frame.
    if context.backtest_tasks.get(&task_id).is_some() {
        context.backtest_tasks.register_subscriber(&task_id, sink).await;
    } else if context.optimization_tasks.get(&task_id).is_some() {
        context
            .optimization_tasks
            .register_subscriber(&task_id, sink)
            .await;
    } else {
        warn!(task_id = %task_id, "task vanished before subscription");
        return;
    }

    // Drain the read half until the client leaves; fan-out failures on the
    // write half already detach the sink.
    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
    debug!(task_id = %task_id, "task progress subscriber disconnected");
}
