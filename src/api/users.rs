//! Profile API endpoints
//!
//! - GET /api/v1/users/me/profile - Own profile with progression
//! - PUT /api/v1/users/me/profile - Update display data
//! - GET /api/v1/users/me/progress - XP and level
//! - POST /api/v1/users/me/add-xp - Grant XP to yourself
//! - GET /api/v1/users/{username}/profile - Public profile card

use axum::{
    extract::{Path, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::middleware::{ApiError, AppState, AuthenticatedUser};
use crate::models::{Profile, UpdateProfileInput};
use crate::services::leveling::LevelProgress;
use crate::services::{AddXpResult, PublicProfile};

#[derive(Debug, Serialize)]
pub struct MyProfileResponse {
    #[serde(flatten)]
    pub profile: Profile,
    pub progress: LevelProgress,
}

#[derive(Debug, Deserialize)]
pub struct AddXpRequest {
    pub amount: i64,
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/me/profile", get(get_my_profile).put(update_my_profile))
        .route("/me/progress", get(get_my_progress))
        .route("/me/add-xp", post(add_xp))
}

pub fn public_router() -> Router<AppState> {
    Router::new().route("/{username}/profile", get(get_public_profile))
}

async fn get_my_profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<MyProfileResponse>, ApiError> {
    let profile = state.profile_service.get_or_create(user.0.id).await?;
    let progress = LevelProgress::for_xp(profile.xp);
    Ok(Json(MyProfileResponse { profile, progress }))
}

async fn update_my_profile(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<UpdateProfileInput>,
) -> Result<Json<MyProfileResponse>, ApiError> {
    let profile = state.profile_service.update(user.0.id, body).await?;
    let progress = LevelProgress::for_xp(profile.xp);
    Ok(Json(MyProfileResponse { profile, progress }))
}

async fn get_my_progress(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<LevelProgress>, ApiError> {
    Ok(Json(state.profile_service.progress(user.0.id).await?))
}

async fn add_xp(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<AddXpRequest>,
) -> Result<Json<AddXpResult>, ApiError> {
    Ok(Json(state.profile_service.add_xp(user.0.id, body.amount).await?))
}

async fn get_public_profile(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<PublicProfile>, ApiError> {
    Ok(Json(state.profile_service.public_profile(&username).await?))
}
