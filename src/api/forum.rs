//! Forum API endpoints
//!
//! - GET /api/v1/forum/categories, /api/v1/forum/kinds
//! - GET /api/v1/forum/threads?category=&kind=&anime_id=&manga_id=&is_pinned=&q=&page=&page_size=
//! - GET /api/v1/forum/threads/{key} - By id or slug
//! - GET /api/v1/forum/threads/{key}/comments?parent=&page=&page_size=
//! - POST /api/v1/forum/threads
//! - PATCH, DELETE /api/v1/forum/threads/{key}
//! - POST /api/v1/forum/threads/{key}/comments
//! - PATCH, DELETE /api/v1/forum/comments/{id}
//! - POST /api/v1/forum/categories, /api/v1/forum/kinds (admin)

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::middleware::{ApiError, AppState, AuthenticatedUser};
use crate::models::{
    Comment, CreateCategoryInput, CreateCommentInput, CreateKindInput, CreateThreadInput,
    ForumCategory, PagedResult, Thread, ThreadFilter, ThreadKind, UpdateThreadInput,
};

#[derive(Debug, Default, Deserialize)]
pub struct ThreadsQuery {
    pub category: Option<String>,
    pub kind: Option<String>,
    pub anime_id: Option<String>,
    pub manga_id: Option<i64>,
    pub is_pinned: Option<bool>,
    pub q: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl ThreadsQuery {
    fn filter(&self) -> ThreadFilter {
        ThreadFilter {
            category: self.category.clone(),
            kind: self.kind.clone(),
            anime_id: self.anime_id.clone(),
            manga_id: self.manga_id,
            is_pinned: self.is_pinned,
            q: self.q.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CommentsQuery {
    /// Replies of this comment instead of top-level comments
    pub parent: Option<i64>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct UpdateCommentRequest {
    pub content: String,
}

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/categories", get(list_categories))
        .route("/kinds", get(list_kinds))
        .route("/threads", get(list_threads))
        .route("/threads/{key}", get(get_thread))
        .route("/threads/{key}/comments", get(list_comments))
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/threads", post(create_thread))
        .route("/threads/{key}", patch(update_thread).delete(delete_thread))
        .route("/threads/{key}/comments", post(create_comment))
        .route("/comments/{id}", patch(update_comment).delete(delete_comment))
}

pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/categories", post(create_category))
        .route("/kinds", post(create_kind))
}

async fn list_categories(
    State(state): State<AppState>,
) -> Result<Json<Vec<ForumCategory>>, ApiError> {
    Ok(Json(state.forum_service.categories().await?))
}

async fn list_kinds(State(state): State<AppState>) -> Result<Json<Vec<ThreadKind>>, ApiError> {
    Ok(Json(state.forum_service.kinds().await?))
}

async fn list_threads(
    State(state): State<AppState>,
    Query(query): Query<ThreadsQuery>,
) -> Result<Json<PagedResult<Thread>>, ApiError> {
    let page = state
        .forum_service
        .list_threads(&query.filter(), query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

async fn get_thread(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(state.forum_service.get_thread(&key).await?))
}

async fn list_comments(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Query(query): Query<CommentsQuery>,
) -> Result<Json<PagedResult<Comment>>, ApiError> {
    let page = state
        .forum_service
        .list_comments(&key, query.parent, query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

async fn create_thread(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateThreadInput>,
) -> Result<impl IntoResponse, ApiError> {
    let thread = state.forum_service.create_thread(&user.0, body).await?;
    Ok((StatusCode::CREATED, Json(thread)))
}

async fn update_thread(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(key): Path<String>,
    Json(body): Json<UpdateThreadInput>,
) -> Result<Json<Thread>, ApiError> {
    Ok(Json(state.forum_service.update_thread(&user.0, &key, body).await?))
}

async fn delete_thread(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(key): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.forum_service.delete_thread(&user.0, &key).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_comment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(key): Path<String>,
    Json(body): Json<CreateCommentInput>,
) -> Result<impl IntoResponse, ApiError> {
    let comment = state.forum_service.create_comment(&user.0, &key, body).await?;
    Ok((StatusCode::CREATED, Json(comment)))
}

async fn update_comment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<UpdateCommentRequest>,
) -> Result<Json<Comment>, ApiError> {
    Ok(Json(
        state.forum_service.update_comment(&user.0, id, &body.content).await?,
    ))
}

async fn delete_comment(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.forum_service.delete_comment(&user.0, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_category(
    State(state): State<AppState>,
    Json(body): Json<CreateCategoryInput>,
) -> Result<impl IntoResponse, ApiError> {
    let category = state.forum_service.create_category(body).await?;
    Ok((StatusCode::CREATED, Json(category)))
}

async fn create_kind(
    State(state): State<AppState>,
    Json(body): Json<CreateKindInput>,
) -> Result<impl IntoResponse, ApiError> {
    let kind = state.forum_service.create_kind(body).await?;
    Ok((StatusCode::CREATED, Json(kind)))
}
