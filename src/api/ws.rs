//! Direct streaming chat over WebSocket: `GET /ws/chat/{chat_id}`.
//!
//! The client sends `{"type":"send","text":"..."}` to start a turn and
//! `{"type":"cancel"}` to stop it. At most one turn runs per connection; a
//! new send cancels the running turn and waits for it to settle first.

use std::sync::Arc;

use axum::extract::ws::{Message as WsFrame, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::AppState;
use super::error::{ApiResult, CallableError};
use super::identity::Caller;
use crate::chat::{
    CancelToken, ChatService, DirectStreamer, Message, SessionKind, StreamOutcome, TurnResult,
};

/// Message from client → server.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    #[serde(rename = "send")]
    Send { text: String },
    #[serde(rename = "cancel")]
    Cancel,
}

/// Message from server → client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    #[serde(rename = "stream_chunk")]
    StreamChunk { content: String },
    /// `message` is the stored reply; `reply_to` the stored user message.
    #[serde(rename = "stream_end")]
    StreamEnd {
        reply_to: String,
        message: Option<Message>,
    },
    #[serde(rename = "stream_cancelled")]
    StreamCancelled {
        reply_to: String,
        message: Option<Message>,
    },
    #[serde(rename = "stream_failed")]
    StreamFailed {
        reply_to: String,
        message: Option<Message>,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

pub(super) async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    caller: Caller,
    Path(chat_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let session = state.chats.session_for(&caller.uid, &chat_id).await?;
    if session.kind != SessionKind::UserAi {
        return Err(CallableError::invalid("Streaming is only available in AI chats"));
    }
    info!(uid = %caller.uid, chat_id = %chat_id, "Stream client connecting");
    let chats = Arc::clone(&state.chats);
    let streamer = Arc::clone(&state.streamer);
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, chats, streamer, caller.uid, chat_id)))
}

struct Turn {
    cancel: CancelToken,
    handle: JoinHandle<()>,
}

impl Turn {
    async fn stop(self) {
        self.cancel.cancel();
        let _ = self.handle.await;
    }
}

async fn handle_socket(
    mut socket: WebSocket,
    chats: Arc<ChatService>,
    streamer: Arc<DirectStreamer>,
    uid: String,
    chat_id: String,
) {
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let mut current: Option<Turn> = None;

    loop {
        tokio::select! {
            Some(msg) = out_rx.recv() => {
                if let Ok(json) = serde_json::to_string(&msg) {
                    if socket.send(WsFrame::Text(json.into())).await.is_err() {
                        debug!("Client disconnected during send");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(WsFrame::Text(text))) => match serde_json::from_str::<ClientMessage>(&text) {
                        Ok(ClientMessage::Send { text }) => {
                            if let Some(turn) = current.take() {
                                turn.stop().await;
                            }
                            if text.trim().is_empty() {
                                let _ = out_tx.send(ServerMessage::Error {
                                    message: "Message text is empty".to_string(),
                                });
                                continue;
                            }
                            current = Some(start_turn(
                                Arc::clone(&chats),
                                Arc::clone(&streamer),
                                uid.clone(),
                                chat_id.clone(),
                                text,
                                out_tx.clone(),
                            ));
                        }
                        Ok(ClientMessage::Cancel) => {
                            if let Some(turn) = current.take() {
                                turn.stop().await;
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "Invalid stream client message");
                            let _ = out_tx.send(ServerMessage::Error {
                                message: format!("Invalid message: {e}"),
                            });
                        }
                    },
                    Some(Ok(WsFrame::Ping(data))) => {
                        if socket.send(WsFrame::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsFrame::Close(_))) | None => {
                        info!(chat_id = %chat_id, "Stream client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    if let Some(turn) = current.take() {
        turn.stop().await;
    }
}

fn start_turn(
    chats: Arc<ChatService>,
    streamer: Arc<DirectStreamer>,
    uid: String,
    chat_id: String,
    text: String,
    out: mpsc::UnboundedSender<ServerMessage>,
) -> Turn {
    let cancel = CancelToken::new();
    let token = cancel.clone();

    let handle = tokio::spawn(async move {
        let session = match chats.session_for(&uid, &chat_id).await {
            Ok(session) => session,
            Err(e) => {
                let _ = out.send(ServerMessage::Error {
                    message: CallableError::from(e).to_string(),
                });
                return;
            }
        };

        let (delta_tx, mut delta_rx) = mpsc::unbounded_channel::<String>();
        let relay = {
            let out = out.clone();
            tokio::spawn(async move {
                while let Some(content) = delta_rx.recv().await {
                    let _ = out.send(ServerMessage::StreamChunk { content });
                }
            })
        };

        let result = streamer.run_turn(&session, &uid, &text, &token, delta_tx).await;
        let _ = relay.await;

        match result {
            Ok(TurnResult {
                user_message,
                outcome,
                stored,
            }) => {
                let reply_to = user_message.id;
                let _ = out.send(match outcome {
                    StreamOutcome::Completed { .. } => ServerMessage::StreamEnd {
                        reply_to,
                        message: stored,
                    },
                    StreamOutcome::Cancelled { .. } => ServerMessage::StreamCancelled {
                        reply_to,
                        message: stored,
                    },
                    StreamOutcome::Failed { .. } => ServerMessage::StreamFailed {
                        reply_to,
                        message: stored,
                    },
                });
            }
            Err(e) => {
                let _ = out.send(ServerMessage::Error {
                    message: CallableError::from(e).to_string(),
                });
            }
        }
    });

    Turn { cancel, handle }
}
