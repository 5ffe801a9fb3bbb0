use std::{sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use shared::{
    domain::{ConnectionId, ConversationId, UserId},
    error::ChatError,
    protocol::{ClientEvent, ServerEvent, TypingTarget},
};
use storage::direct_key;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::AppState;

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(state, socket))
}

/// One task per connection. The socket is authenticated by its first frame,
/// registered, then split: this task keeps reading client events while a
/// writer task drains the connection's outbound queue into the socket.
async fn connection(state: Arc<AppState>, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();

    let user_id = match authenticate(&state, &mut stream, state.auth_timeout).await {
        Ok(user_id) => user_id,
        Err(error) => {
            debug!(%error, "websocket handshake rejected");
            let frame = ServerEvent::MessageError {
                error: error.into(),
            };
            if let Ok(text) = serde_json::to_string(&frame) {
                let _ = sink.send(Message::Text(text)).await;
            }
            let _ = sink.close().await;
            return;
        }
    };

    let connection_id = ConnectionId::generate();
    let (tx, rx) = mpsc::unbounded_channel();
    state.registry.register(user_id, connection_id, tx.clone());
    state.presence.mark_online(user_id).await;
    info!(%user_id, %connection_id, "websocket session established");

    let writer = tokio::spawn(write_loop(state.clone(), sink, rx));

    while let Some(frame) = stream.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(error) => {
                debug!(%user_id, %connection_id, %error, "websocket read error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(event) => handle_event(&state, user_id, &tx, event).await,
                Err(error) => {
                    debug!(%user_id, %error, "unparseable client frame");
                    let _ = tx.send(ServerEvent::MessageError {
                        error: ChatError::ValidationFailed("unrecognized frame".into()).into(),
                    });
                }
            },
            Message::Close(_) => break,
            // Ping/pong is handled by the protocol layer; binary frames are
            // not part of the wire contract.
            _ => {}
        }
    }

    writer.abort();
    if let Some((user, remaining)) = state.registry.unregister(connection_id) {
        state.presence.handle_disconnect(user, remaining);
    }
    info!(%user_id, %connection_id, "websocket session closed");
}

/// The first frame must be `auth` and must arrive within the timeout.
async fn authenticate(
    state: &AppState,
    stream: &mut SplitStream<WebSocket>,
    timeout: Duration,
) -> Result<UserId, ChatError> {
    let frame = tokio::time::timeout(timeout, stream.next())
        .await
        .map_err(|_| ChatError::AuthenticationFailed("authentication timed out".into()))?
        .ok_or_else(|| ChatError::AuthenticationFailed("connection closed".into()))?
        .map_err(|e| ChatError::AuthenticationFailed(e.to_string()))?;

    let Message::Text(text) = frame else {
        return Err(ChatError::AuthenticationFailed(
            "expected an auth frame".into(),
        ));
    };
    match serde_json::from_str::<ClientEvent>(&text) {
        Ok(ClientEvent::Auth { token }) => state.auth.verify(&token),
        Ok(_) => Err(ChatError::AuthenticationFailed(
            "first frame must be auth".into(),
        )),
        Err(_) => Err(ChatError::AuthenticationFailed(
            "malformed auth frame".into(),
        )),
    }
}

/// Drains the connection's queue into the socket. Writing a `message:new`
/// frame is the moment the message reaches this device, so a successful
/// write promotes the message to delivered.
async fn write_loop(
    state: Arc<AppState>,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::UnboundedReceiver<ServerEvent>,
) {
    while let Some(event) = rx.recv().await {
        let delivered = match &event {
            ServerEvent::MessageNew(payload) => Some(payload.id),
            _ => None,
        };
        let text = match serde_json::to_string(&event) {
            Ok(text) => text,
            Err(error) => {
                warn!(%error, "outbound event failed to serialize");
                continue;
            }
        };
        if sink.send(Message::Text(text)).await.is_err() {
            break;
        }
        if let Some(message_id) = delivered {
            if let Err(error) = state.pipeline.mark_delivered(&[message_id]).await {
                warn!(%message_id, %error, "delivery receipt failed");
            }
        }
    }
}

async fn handle_event(
    state: &AppState,
    user_id: UserId,
    tx: &mpsc::UnboundedSender<ServerEvent>,
    event: ClientEvent,
) {
    match event {
        ClientEvent::Auth { .. } => {
            debug!(%user_id, "duplicate auth frame ignored");
        }
        ClientEvent::MessageSend(request) => {
            let temp_id = request.temp_id.clone();
            match state.pipeline.send_message(user_id, request).await {
                Ok(message) => {
                    let _ = tx.send(ServerEvent::MessageSent {
                        message_id: message.id,
                        status: message.status,
                        temp_id,
                    });
                }
                Err(error) => {
                    let _ = tx.send(ServerEvent::MessageError {
                        error: error.into(),
                    });
                }
            }
        }
        ClientEvent::MessageRead(request) => {
            if let Err(error) = state
                .pipeline
                .mark_read(user_id, request.conversation_id, &request.message_ids)
                .await
            {
                let _ = tx.send(ServerEvent::MessageError {
                    error: error.into(),
                });
            }
        }
        ClientEvent::TypingStart(target) => {
            broadcast_typing(state, user_id, target, true).await;
        }
        ClientEvent::TypingStop(target) => {
            broadcast_typing(state, user_id, target, false).await;
        }
        ClientEvent::StatusChange { status } => {
            state.presence.set_status(user_id, status).await;
        }
    }
}

/// Typing is transient: it is never persisted, and a failed lookup drops
/// the indicator instead of surfacing an error to the client.
async fn broadcast_typing(state: &AppState, user_id: UserId, target: TypingTarget, is_typing: bool) {
    let Some(conversation_id) = resolve_typing_target(state, user_id, &target).await else {
        return;
    };
    let event = ServerEvent::TypingUpdate { user_id, is_typing };
    if let Err(error) = state
        .dispatcher
        .broadcast_to_conversation(conversation_id, &event, Some(user_id))
        .await
    {
        debug!(%user_id, %conversation_id, %error, "typing broadcast dropped");
    }
}

async fn resolve_typing_target(
    state: &AppState,
    user_id: UserId,
    target: &TypingTarget,
) -> Option<ConversationId> {
    if let Some(conversation_id) = target.conversation_id {
        match state.conversations.is_participant(conversation_id, user_id).await {
            Ok(true) => return Some(conversation_id),
            Ok(false) | Err(_) => return None,
        }
    }
    let receiver = target.receiver_id?;
    let key = direct_key(user_id, receiver);
    state
        .storage
        .find_direct_conversation(&key)
        .await
        .ok()
        .flatten()
}
