//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::PlayerInput;
use crate::util::rate_limit::SessionRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Display name, optional
    pub name: Option<String>,
}

/// WebSocket upgrade handler. Every connection is a fresh session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let session_id = Uuid::new_v4();
    debug!(session_id = %session_id, "WebSocket upgrade");
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, query.name, state))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, session_id: Uuid, name: Option<String>, state: AppState) {
    info!(session_id = %session_id, "New WebSocket connection");

    let (mut ws_sink, ws_stream) = socket.split();

    // Send welcome message
    let welcome = ServerMsg::Welcome {
        session_id,
        server_time: unix_millis(),
    };

    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(session_id = %session_id, error = %e, "Failed to send welcome");
        return;
    }

    let handle = match state.matchmaking.assign() {
        Ok(handle) => handle,
        Err(e) => {
            error!(session_id = %session_id, error = %e, "Failed to create match");
            let _ = send_msg(
                &mut ws_sink,
                &ServerMsg::Error {
                    session_id,
                    code: "match_unavailable".to_string(),
                    message: "No match could be started".to_string(),
                },
            )
            .await;
            return;
        }
    };

    // Subscribe before joining so the join reply is not missed
    let snapshot_rx = handle.snapshot_tx.subscribe();
    let join = PlayerInput {
        session_id,
        msg: ClientMsg::Join { name },
        received_at: unix_millis(),
    };
    if handle.input_tx.send(join).await.is_err() {
        warn!(session_id = %session_id, match_id = %handle.id, "Match closed before join");
        return;
    }

    run_session(session_id, ws_sink, ws_stream, handle.input_tx, snapshot_rx).await;

    info!(session_id = %session_id, match_id = %handle.id, "WebSocket connection closed");
}

/// Run the WebSocket session with read/write split
async fn run_session(
    session_id: Uuid,
    mut ws_sink: futures::stream::SplitSink<WebSocket, Message>,
    mut ws_stream: futures::stream::SplitStream<WebSocket>,
    input_tx: mpsc::Sender<PlayerInput>,
    mut snapshot_rx: broadcast::Receiver<ServerMsg>,
) {
    let rate_limiter = SessionRateLimiter::new();

    // Spawn writer task: match broadcasts -> WebSocket
    let mut writer_handle = tokio::spawn(async move {
        loop {
            match snapshot_rx.recv().await {
                Ok(msg) => {
                    if msg.recipient().is_some_and(|id| id != session_id) {
                        continue;
                    }
                    if let Err(e) = send_msg(&mut ws_sink, &msg).await {
                        debug!(session_id = %session_id, error = %e, "WebSocket send failed");
                        break;
                    }
                    // Errors are only addressed to sessions whose join was refused
                    if matches!(msg, ServerMsg::Error { .. }) {
                        info!(session_id = %session_id, "Join rejected, closing session");
                        let _ = ws_sink.send(Message::Close(None)).await;
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(
                        session_id = %session_id,
                        lagged_count = n,
                        "Client lagged, skipping {} messages", n
                    );
                    // Continue - the next state message resyncs the client
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!(session_id = %session_id, "Match channel closed");
                    break;
                }
            }
        }
    });

    // Reader loop: WebSocket -> match loop, until either side is done
    loop {
        let result = tokio::select! {
            _ = &mut writer_handle => break,
            next = ws_stream.next() => match next {
                Some(result) => result,
                None => break,
            },
        };

        match result {
            Ok(Message::Text(text)) => {
                if !rate_limiter.check_input() {
                    warn!(session_id = %session_id, "Rate limited client message");
                    continue;
                }

                match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(client_msg) => {
                        let leaving = matches!(client_msg, ClientMsg::Leave);
                        let input = PlayerInput {
                            session_id,
                            msg: client_msg,
                            received_at: unix_millis(),
                        };

                        if input_tx.send(input).await.is_err() {
                            debug!(session_id = %session_id, "Input channel closed");
                            break;
                        }
                        if leaving {
                            break;
                        }
                    }
                    Err(e) => {
                        warn!(session_id = %session_id, error = %e, "Failed to parse client message");
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(session_id = %session_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(session_id = %session_id, "Client initiated close");
                break;
            }
            Err(e) => {
                error!(session_id = %session_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    // A dropped socket counts as leaving; a second leave is a no-op
    let _ = input_tx
        .send(PlayerInput {
            session_id,
            msg: ClientMsg::Leave,
            received_at: unix_millis(),
        })
        .await;

    // Abort writer task
    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
