//! Chat WebSocket
//!
//! `GET /api/v1/ws/chats/{conversation_id}?token=<session>`
//!
//! Browsers cannot set headers on a WebSocket handshake, so the session token
//! rides in the query string (a Bearer header or session cookie also works).
//! The upgrade is always accepted; a caller who is not signed in or not a
//! participant gets a close frame with code 4403.
//!
//! Client frames: `{"action":"send_message","text":...}` and
//! `{"action":"typing","value":bool}`. Anything else is ignored.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::api::middleware::{extract_session_token, AppState};
use crate::models::{ClientFrame, UserShort};

/// Close code for a rejected socket
pub const CLOSE_FORBIDDEN: u16 = 4403;

#[derive(Debug, Default, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

pub async fn chat_socket(
    State(state): State<AppState>,
    Path(conversation_id): Path<String>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let token = query
        .token
        .filter(|t| !t.trim().is_empty())
        .or_else(|| extract_session_token(&headers));
    let participant = authenticate(&state, &conversation_id, token.as_deref()).await;

    ws.on_upgrade(move |socket| async move {
        match participant {
            Some(user) => run_session(state, conversation_id, user, socket).await,
            None => reject(socket).await,
        }
    })
}

/// The caller, if the token is a live session of an active participant
pub(crate) async fn authenticate(
    state: &AppState,
    conversation_id: &str,
    token: Option<&str>,
) -> Option<UserShort> {
    let token = token?;
    let user = match state.user_service.validate_session(token).await {
        Ok(Some(user)) if user.is_active => user,
        Ok(_) => return None,
        Err(e) => {
            tracing::error!(error = %e, "Session lookup failed during WebSocket handshake");
            return None;
        }
    };
    match state.chat_service.authorize(conversation_id, user.id).await {
        Ok(_) => Some(UserShort {
            id: user.id,
            username: user.username,
        }),
        Err(e) => {
            tracing::debug!(conversation_id, user_id = user.id, error = %e, "WebSocket rejected");
            None
        }
    }
}

async fn reject(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: CLOSE_FORBIDDEN,
        reason: "forbidden".into(),
    };
    let _ = socket.send(Message::Close(Some(frame))).await;
}

/// Pump frames both ways until either side closes. The subscription is
/// dropped on return, which takes the socket out of the registry.
async fn run_session(state: AppState, conversation_id: String, user: UserShort, socket: WebSocket) {
    let mut events = state.chat_service.registry().subscribe(&conversation_id);
    let (mut sender, mut receiver) = socket.split();
    tracing::debug!(conversation_id = %conversation_id, user_id = user.id, "WebSocket connected");

    loop {
        tokio::select! {
            outgoing = events.recv() => match outgoing {
                Some(frame) => {
                    if sender.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    handle_client_text(&state, &conversation_id, &user, text.as_str()).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket receive failed");
                    break;
                }
            },
        }
    }

    drop(events);
    tracing::debug!(conversation_id = %conversation_id, user_id = user.id, "WebSocket closed");
}

/// Act on one text frame from a connected participant
pub(crate) async fn handle_client_text(
    state: &AppState,
    conversation_id: &str,
    user: &UserShort,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(_) => {
            tracing::debug!(conversation_id, "Ignoring unknown WebSocket frame");
            return;
        }
    };

    match frame {
        ClientFrame::SendMessage { text } => {
            if text.trim().is_empty() {
                return;
            }
            if let Err(e) = state
                .chat_service
                .send_message(conversation_id, user.clone(), &text)
                .await
            {
                tracing::warn!(conversation_id, user_id = user.id, error = %e, "WebSocket message rejected");
            }
        }
        ClientFrame::Typing { value } => {
            state.chat_service.typing(conversation_id, user.id, value).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{login, register_active, test_server};
    use serde_json::Value;

    #[tokio::test]
    async fn test_authenticate_requires_participant() {
        let (server, state) = test_server().await;
        let alice_id = register_active(&server, "alice").await;
        let bob_id = register_active(&server, "bob").await;
        register_active(&server, "eve").await;
        let alice = login(&server, "alice").await;
        let eve = login(&server, "eve").await;

        let conversation = state.chat_service.open_direct(alice_id, bob_id).await.unwrap();

        let user = authenticate(&state, &conversation.id, Some(&alice)).await.unwrap();
        assert_eq!(user.username, "alice");
        assert!(authenticate(&state, &conversation.id, Some(&eve)).await.is_none());
        assert!(authenticate(&state, &conversation.id, Some("bogus")).await.is_none());
        assert!(authenticate(&state, &conversation.id, None).await.is_none());
        assert!(authenticate(&state, "missing", Some(&alice)).await.is_none());
    }

    #[tokio::test]
    async fn test_client_frames_fan_out() {
        let (server, state) = test_server().await;
        let alice_id = register_active(&server, "alice").await;
        let bob_id = register_active(&server, "bob").await;
        let conversation = state.chat_service.open_direct(alice_id, bob_id).await.unwrap();
        let alice = UserShort { id: alice_id, username: "alice".into() };

        let mut live = state.chat_service.registry().subscribe(&conversation.id);

        handle_client_text(&state, &conversation.id, &alice, r#"{"action":"typing","value":true}"#).await;
        let frame: Value = serde_json::from_str(&live.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "typing");
        assert_eq!(frame["payload"]["user_id"], alice_id);

        // ignored frames produce nothing
        handle_client_text(&state, &conversation.id, &alice, "not json").await;
        handle_client_text(&state, &conversation.id, &alice, r#"{"action":"dance"}"#).await;
        handle_client_text(&state, &conversation.id, &alice, r#"{"action":"send_message","text":"   "}"#).await;
        assert!(live.try_recv().is_err());

        handle_client_text(&state, &conversation.id, &alice, r#"{"action":"send_message","text":"hey"}"#).await;
        let frame: Value = serde_json::from_str(&live.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["payload"]["text"], "hey");

        let page = state
            .chat_service
            .messages(&conversation.id, bob_id, None, None)
            .await
            .unwrap();
        assert_eq!(page.count, 1);

        // A finished session leaves nothing behind in the registry
        drop(live);
        assert_eq!(
            state.chat_service.registry().subscriber_count(&conversation.id),
            0
        );
    }
}
