//! Chat API endpoints
//!
//! - GET /api/v1/chats/conversations - Own conversations, latest first
//! - GET /api/v1/chats/users/search?q= - Find someone to talk to
//! - POST /api/v1/chats/conversations/open - Open (or reuse) a direct chat
//! - GET /api/v1/chats/conversations/{id}/messages?page=&page_size=
//! - POST /api/v1/chats/conversations/{id}/send
//!
//! Live updates go over the WebSocket in [`crate::api::ws`].

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::common::PaginationQuery;
use crate::api::middleware::{ApiError, AppState, AuthenticatedUser};
use crate::models::{ConversationSummary, MessagePage, MessageView, UserShort};

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct OpenRequest {
    pub user_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SendRequest {
    #[serde(default)]
    pub text: String,
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(list_conversations))
        .route("/conversations/open", post(open_conversation))
        .route("/conversations/{id}/messages", get(list_messages))
        .route("/conversations/{id}/send", post(send_message))
        .route("/users/search", get(search_users))
}

async fn list_conversations(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<ConversationSummary>>, ApiError> {
    Ok(Json(state.chat_service.list_conversations(user.0.id).await?))
}

async fn search_users(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserShort>>, ApiError> {
    if query.q.trim().is_empty() {
        return Ok(Json(Vec::new()));
    }
    Ok(Json(state.chat_service.search_users(user.0.id, &query.q).await?))
}

async fn open_conversation(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<OpenRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let detail = state
        .chat_service
        .open_direct(user.0.id, body.user_id)
        .await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn list_messages(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Query(query): Query<PaginationQuery>,
) -> Result<Json<MessagePage>, ApiError> {
    Ok(Json(
        state
            .chat_service
            .messages(&id, user.0.id, query.page, query.page_size)
            .await?,
    ))
}

async fn send_message(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<String>,
    Json(body): Json<SendRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let sender = UserShort {
        id: user.0.id,
        username: user.0.username.clone(),
    };
    let message: MessageView = state.chat_service.send_message(&id, sender, &body.text).await?;
    Ok((StatusCode::CREATED, Json(message)))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{login, register_active, test_server};
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_open_send_and_read() {
        let (server, state) = test_server().await;
        register_active(&server, "alice").await;
        let bob_id = register_active(&server, "bob").await;
        register_active(&server, "mallory").await;
        let alice = login(&server, "alice").await;
        let bob = login(&server, "bob").await;
        let mallory = login(&server, "mallory").await;

        let response = server
            .post("/api/v1/chats/conversations/open")
            .authorization_bearer(&alice)
            .json(&json!({"user_id": bob_id}))
            .await;
        response.assert_status(StatusCode::CREATED);
        let conversation: Value = response.json();
        let id = conversation["id"].as_str().unwrap().to_string();
        assert_eq!(conversation["participants"].as_array().unwrap().len(), 2);

        // opening again reuses the conversation
        let again: Value = server
            .post("/api/v1/chats/conversations/open")
            .authorization_bearer(&alice)
            .json(&json!({"user_id": bob_id}))
            .await
            .json();
        assert_eq!(again["id"], id.as_str());

        let mut live = state.chat_service.registry().subscribe(&id);

        let response = server
            .post(&format!("/api/v1/chats/conversations/{}/send", id))
            .authorization_bearer(&alice)
            .json(&json!({"text": "  hello bob  "}))
            .await;
        response.assert_status(StatusCode::CREATED);
        assert_eq!(response.json::<Value>()["text"], "hello bob");

        let frame: Value = serde_json::from_str(&live.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "message");
        assert_eq!(frame["payload"]["sender"]["username"], "alice");

        let page: Value = server
            .get(&format!("/api/v1/chats/conversations/{}/messages", id))
            .authorization_bearer(&bob)
            .await
            .json();
        assert_eq!(page["count"], 1);
        assert_eq!(page["results"][0]["text"], "hello bob");

        let listed: Value = server
            .get("/api/v1/chats/conversations")
            .authorization_bearer(&bob)
            .await
            .json();
        assert_eq!(listed[0]["last_message"]["text"], "hello bob");

        server
            .get(&format!("/api/v1/chats/conversations/{}/messages", id))
            .authorization_bearer(&mallory)
            .await
            .assert_status(StatusCode::FORBIDDEN);
        server
            .post(&format!("/api/v1/chats/conversations/{}/send", id))
            .authorization_bearer(&mallory)
            .json(&json!({"text": "hi"}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_open_rejects_self_and_unknown() {
        let (server, _state) = test_server().await;
        let alice_id = register_active(&server, "alice").await;
        let alice = login(&server, "alice").await;

        server
            .post("/api/v1/chats/conversations/open")
            .authorization_bearer(&alice)
            .json(&json!({"user_id": alice_id}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        server
            .post("/api/v1/chats/conversations/open")
            .authorization_bearer(&alice)
            .json(&json!({"user_id": 9999}))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .get("/api/v1/chats/conversations/missing/messages")
            .authorization_bearer(&alice)
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_search_users_excludes_caller() {
        let (server, _state) = test_server().await;
        register_active(&server, "anna").await;
        register_active(&server, "annabel").await;
        let anna = login(&server, "anna").await;

        let found: Value = server
            .get("/api/v1/chats/users/search?q=ann")
            .authorization_bearer(&anna)
            .await
            .json();
        let found = found.as_array().unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["username"], "annabel");

        let empty: Value = server
            .get("/api/v1/chats/users/search?q=")
            .authorization_bearer(&anna)
            .await
            .json();
        assert!(empty.as_array().unwrap().is_empty());
    }
}
