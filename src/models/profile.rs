//! Profile model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Public-facing profile, one per user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    pub user_id: i64,
    pub display_name: String,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
    /// Accumulated experience points, never negative
    pub xp: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for updating a profile. `None` leaves the field untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateProfileInput {
    pub display_name: Option<String>,
    pub bio: Option<String>,
    pub avatar_url: Option<String>,
}

impl UpdateProfileInput {
    /// Apply the changes to a profile in place
    pub fn apply_to(self, profile: &mut Profile) {
        if let Some(display_name) = self.display_name {
            profile.display_name = display_name.trim().to_string();
        }
        if let Some(bio) = self.bio {
            profile.bio = Some(bio);
        }
        if let Some(avatar_url) = self.avatar_url {
            profile.avatar_url = if avatar_url.trim().is_empty() {
                None
            } else {
                Some(avatar_url)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> Profile {
        let now = Utc::now();
        Profile {
            user_id: 1,
            display_name: "old".to_string(),
            bio: None,
            avatar_url: Some("https://cdn/a.png".to_string()),
            xp: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_apply_partial_update() {
        let mut p = profile();
        UpdateProfileInput {
            display_name: Some("  Neo  ".to_string()),
            ..Default::default()
        }
        .apply_to(&mut p);

        assert_eq!(p.display_name, "Neo");
        assert_eq!(p.avatar_url.as_deref(), Some("https://cdn/a.png"));
    }

    #[test]
    fn test_blank_avatar_clears_it() {
        let mut p = profile();
        UpdateProfileInput {
            avatar_url: Some(" ".to_string()),
            ..Default::default()
        }
        .apply_to(&mut p);

        assert!(p.avatar_url.is_none());
    }
}
