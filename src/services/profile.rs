//! Profile service
//!
//! Display data, XP progression and the public profile card, which resolves
//! the equipped items into media URLs.

use crate::db::repositories::{ItemRepository, ProfileRepository, UserRepository};
use crate::db::DynDatabasePool;
use crate::models::{AppliedCustomization, Profile, UpdateProfileInput, UserRole};
use crate::services::leveling::{level_for_xp, total_xp_for_level, LevelProgress, MAX_LEVEL};
use serde::Serialize;
use std::sync::Arc;

const DISPLAY_NAME_MAX_LEN: usize = 64;
const BIO_MAX_LEN: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("User not found")]
    UserNotFound,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Result of granting XP
#[derive(Debug, Clone, Serialize)]
pub struct AddXpResult {
    pub added: i64,
    pub leveled_up: bool,
    pub data: LevelProgress,
}

#[derive(Debug, Clone, Serialize)]
pub struct PublicUser {
    pub username: String,
    pub role: UserRole,
}

/// Profile card visible to everyone
#[derive(Debug, Clone, Serialize)]
pub struct PublicProfile {
    pub user: PublicUser,
    pub display_name: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    pub header_url: Option<String>,
    pub frame_url: Option<String>,
    #[serde(flatten)]
    pub progress: LevelProgress,
    pub header_item_id: Option<i64>,
    pub frame_item_id: Option<i64>,
    pub applied: AppliedCustomization,
}

pub struct ProfileService {
    pool: DynDatabasePool,
    profile_repo: Arc<dyn ProfileRepository>,
    user_repo: Arc<dyn UserRepository>,
    item_repo: Arc<dyn ItemRepository>,
}

impl ProfileService {
    pub fn new(
        pool: DynDatabasePool,
        profile_repo: Arc<dyn ProfileRepository>,
        user_repo: Arc<dyn UserRepository>,
        item_repo: Arc<dyn ItemRepository>,
    ) -> Self {
        Self {
            pool,
            profile_repo,
            user_repo,
            item_repo,
        }
    }

    /// The user's profile, created on first access
    pub async fn get_or_create(&self, user_id: i64) -> Result<Profile, ProfileError> {
        if let Some(profile) = self.profile_repo.get(user_id).await? {
            return Ok(profile);
        }
        let mut tx = self.pool.begin().await?;
        tx.profile_create(user_id).await?;
        tx.commit().await?;
        self.profile_repo
            .get(user_id)
            .await?
            .ok_or(ProfileError::UserNotFound)
    }

    pub async fn progress(&self, user_id: i64) -> Result<LevelProgress, ProfileError> {
        let profile = self.get_or_create(user_id).await?;
        Ok(LevelProgress::for_xp(profile.xp))
    }

    /// Grant XP; the total is capped at the last level.
    ///
    /// # Errors
    ///
    /// `Validation` if `amount <= 0`
    pub async fn add_xp(&self, user_id: i64, amount: i64) -> Result<AddXpResult, ProfileError> {
        if amount <= 0 {
            return Err(ProfileError::Validation("amount must be > 0".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        tx.profile_create(user_id).await?;
        let profile = tx
            .profile_lock(user_id)
            .await?
            .ok_or(ProfileError::UserNotFound)?;

        let before = level_for_xp(profile.xp);
        let xp = profile
            .xp
            .saturating_add(amount)
            .min(total_xp_for_level(MAX_LEVEL));
        tx.profile_set_xp(user_id, xp).await?;
        tx.commit().await?;

        let data = LevelProgress::for_xp(xp);
        if data.level > before {
            tracing::info!(user_id, level = data.level, "Level up");
        }
        Ok(AddXpResult {
            added: amount,
            leveled_up: data.level > before,
            data,
        })
    }

    pub async fn update(
        &self,
        user_id: i64,
        input: UpdateProfileInput,
    ) -> Result<Profile, ProfileError> {
        if let Some(name) = &input.display_name {
            if name.trim().chars().count() > DISPLAY_NAME_MAX_LEN {
                return Err(ProfileError::Validation(format!(
                    "Display name must be at most {} characters",
                    DISPLAY_NAME_MAX_LEN
                )));
            }
        }
        if let Some(bio) = &input.bio {
            if bio.chars().count() > BIO_MAX_LEN {
                return Err(ProfileError::Validation(format!(
                    "Bio must be at most {} characters",
                    BIO_MAX_LEN
                )));
            }
        }

        let mut profile = self.get_or_create(user_id).await?;
        input.apply_to(&mut profile);
        Ok(self.profile_repo.update(&profile).await?)
    }

    /// Public profile by username
    pub async fn public_profile(&self, username: &str) -> Result<PublicProfile, ProfileError> {
        let user = self
            .user_repo
            .get_by_username(username)
            .await?
            .ok_or(ProfileError::UserNotFound)?;
        let profile = self.get_or_create(user.id).await?;
        let applied = self
            .item_repo
            .get_applied(user.id)
            .await?
            .unwrap_or_else(|| AppliedCustomization::empty(user.id));

        let avatar_url = match self.item_url(applied.avatar_item_id).await? {
            Some(url) => Some(url),
            None => profile.avatar_url.clone(),
        };

        Ok(PublicProfile {
            user: PublicUser {
                username: user.username,
                role: user.role,
            },
            display_name: profile.display_name,
            bio: profile.bio,
            avatar_url,
            header_url: self.item_url(applied.header_item_id).await?,
            frame_url: self.item_url(applied.frame_item_id).await?,
            progress: LevelProgress::for_xp(profile.xp),
            header_item_id: applied.header_item_id,
            frame_item_id: applied.frame_item_id,
            applied,
        })
    }

    async fn item_url(&self, item_id: Option<i64>) -> Result<Option<String>, ProfileError> {
        let Some(id) = item_id else {
            return Ok(None);
        };
        Ok(self
            .item_repo
            .get_by_id(id)
            .await?
            .map(|item| item.file_url)
            .filter(|url| !url.is_empty()))
    }
}
