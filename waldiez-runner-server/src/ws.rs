//! Per-task WebSocket bridge.
//!
//! One bridge per accepted connection: downstream it tails the task's
//! output stream and status channel and forwards every record as a text
//! frame; upstream it relays `{request_id, data}` frames onto the input
//! response channel. A bounded channel between the pumps and the socket
//! writer provides backpressure: when the client is slow, stream reads
//! pause instead of buffering.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use waldiez_runner_core::redis::io_stream::{status_channel, TaskIoStream};
use waldiez_runner_core::AppContext;
use waldiez_runner_model::{Audience, InputResponse, StatusMessage};

use crate::auth::ws_token;
use crate::state::AppState;

/// Policy violation (failed auth / ownership).
const CLOSE_POLICY: u16 = 1008;
/// Unsupported data (malformed client frame).
const CLOSE_UNSUPPORTED: u16 = 1003;
/// Normal closure once the task reaches a terminal state.
const CLOSE_NORMAL: u16 = 1000;

/// Buffered frames between the pumps and the socket writer.
const SEND_QUEUE: usize = 100;
const OUTPUT_BLOCK: Duration = Duration::from_secs(1);
const OUTPUT_BATCH: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct WsQuery {
    #[serde(default)]
    pub access_token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Path(task_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let token = ws_token(query.access_token.as_deref(), &headers);
    let (authorized, via_subprotocol) = match token {
        Some((token, via_subprotocol)) => {
            let client = state
                .verifier
                .verify(&token, &[Audience::TasksApi, Audience::Admin])
                .ok();
            let authorized = match client {
                Some((client_id, audience)) => {
                    owns_task(
                        &state,
                        &task_id,
                        &client_id,
                        audience == Audience::Admin,
                    )
                    .await
                }
                None => false,
            };
            (authorized, via_subprotocol)
        }
        None => (false, false),
    };

    let ws = if via_subprotocol {
        // Echo the agreed subprotocol back or browsers drop the socket.
        ws.protocols([Audience::TasksApi.as_str()])
    } else {
        ws
    };
    let ctx = state.ctx.clone();
    ws.on_upgrade(move |socket| async move {
        if !authorized {
            close_with(socket, CLOSE_POLICY, "authentication failed").await;
            return;
        }
        run_bridge(socket, ctx, task_id).await;
    })
}

async fn owns_task(
    state: &AppState,
    task_id: &str,
    client_id: &str,
    is_admin: bool,
) -> bool {
    match state.ctx.tasks().get(task_id).await {
        Ok(Some(task)) => is_admin || task.client_id == client_id,
        Ok(None) => false,
        Err(e) => {
            warn!("task lookup for ws {task_id} failed: {e}");
            false
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}

/// Run both pumps until the socket closes or the task terminates.
pub async fn run_bridge(
    socket: WebSocket,
    ctx: Arc<AppContext>,
    task_id: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(SEND_QUEUE);

    // Writer: the only task touching the socket sink.
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if ws_sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
    });

    let output_pump = tokio::spawn(pump_output(
        ctx.clone(),
        task_id.clone(),
        tx.clone(),
    ));
    let mut status_pump = tokio::spawn(pump_status(
        ctx.clone(),
        task_id.clone(),
        tx.clone(),
    ));

    let upstream = async {
        let conn = match ctx.redis.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("bridge for {task_id} has no redis: {e}");
                return;
            }
        };
        let io = TaskIoStream::new(&task_id, conn);
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    let Ok(response) =
                        serde_json::from_str::<InputResponse>(text.as_str())
                    else {
                        let _ = tx
                            .send(Message::Close(Some(CloseFrame {
                                code: CLOSE_UNSUPPORTED,
                                reason: "malformed frame".into(),
                            })))
                            .await;
                        return;
                    };
                    if let Err(e) =
                        io.publish_input_response(&response).await
                    {
                        warn!(
                            "failed to relay input for {task_id}: {e}"
                        );
                    }
                }
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => {}
            }
        }
    };

    tokio::select! {
        // Terminal status observed: the pump already queued Close(1000).
        _ = &mut status_pump => {}
        _ = upstream => {}
    }

    output_pump.abort();
    status_pump.abort();
    // Writer drains what is queued, then sees the channel close.
    drop(tx);
    let _ = writer.await;
    debug!("bridge for task {task_id} closed");
}

/// Redis → socket: replay the output stream from the beginning, then
/// follow. Sending into the bounded queue is the backpressure point.
async fn pump_output(
    ctx: Arc<AppContext>,
    task_id: String,
    tx: mpsc::Sender<Message>,
) {
    let conn = match ctx.redis.connection().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("output pump for {task_id} has no redis: {e}");
            return;
        }
    };
    let io = TaskIoStream::new(&task_id, conn);
    let mut last_id = "0-0".to_string();
    loop {
        let records = match io
            .read_output_since(&last_id, OUTPUT_BLOCK, OUTPUT_BATCH)
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("output read for {task_id} failed: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        for record in records {
            let frame = Message::Text(record.data.to_string().into());
            if tx.send(frame).await.is_err() {
                return;
            }
            last_id = record.id;
        }
    }
}

/// Status channel → socket; returns once a terminal transition was
/// forwarded, after queueing a normal close.
async fn pump_status(
    ctx: Arc<AppContext>,
    task_id: String,
    tx: mpsc::Sender<Message>,
) {
    let mut pubsub = match ctx.redis.pubsub().await {
        Ok(pubsub) => pubsub,
        Err(e) => {
            warn!("status pump for {task_id} has no redis: {e}");
            return;
        }
    };
    let channel = status_channel(&task_id);
    if let Err(e) = pubsub.subscribe(&channel).await {
        warn!("status subscribe for {task_id} failed: {e}");
        return;
    }

    let mut terminal = false;
    {
        let mut stream = pubsub.on_message();
        while let Some(message) = stream.next().await {
            let Ok(payload) = message.get_payload::<String>() else {
                continue;
            };
            if tx.send(Message::Text(payload.clone().into())).await.is_err()
            {
                break;
            }
            if let Some(parsed) = StatusMessage::decode(&payload) {
                if parsed.is_terminal() {
                    terminal = true;
                    break;
                }
            }
        }
    }
    let _ = pubsub.unsubscribe(&channel).await;
    if terminal {
        let _ = tx
            .send(Message::Close(Some(CloseFrame {
                code: CLOSE_NORMAL,
                reason: "task finished".into(),
            })))
            .await;
    }
}
