//! Forum models
//!
//! Threads sit in a category and have a kind. The kind decides whether a
//! thread may point at an anime (a Kodik material), a manga title, or be
//! posted on behalf of a translator team. Comments nest one level through
//! `parent_id` and are soft-deleted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{TranslatorShort, UserShort};

/// Longest generated thread slug, suffix included
pub const THREAD_SLUG_MAX_LEN: usize = 210;

pub const THREAD_TITLE_MAX_LEN: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForumCategory {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub is_active: bool,
    pub order: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCategoryInput {
    pub title: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default = "default_order")]
    pub order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadKind {
    pub id: i64,
    pub title: String,
    pub slug: String,
    pub description: String,
    pub is_active: bool,
    pub order: i64,
    pub allow_anime: bool,
    pub allow_manga: bool,
    pub allow_publish_as_team: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateKindInput {
    pub title: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_order")]
    pub order: i64,
    #[serde(default)]
    pub allow_anime: bool,
    #[serde(default)]
    pub allow_manga: bool,
    #[serde(default = "default_true")]
    pub allow_publish_as_team: bool,
}

fn default_order() -> i64 {
    100
}

fn default_true() -> bool {
    true
}

/// `{id, title, slug}` of a category or kind embedded in a thread
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForumRef {
    pub id: i64,
    pub title: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    pub id: i64,
    pub category: ForumRef,
    pub kind: ForumRef,
    pub author: UserShort,
    pub publish_as_team: Option<TranslatorShort>,
    pub title: String,
    pub slug: String,
    pub content: String,
    /// Kodik id of the linked anime
    pub anime_id: Option<String>,
    pub manga_id: Option<i64>,
    pub comments_count: i64,
    pub last_activity_at: DateTime<Utc>,
    pub is_locked: bool,
    pub is_pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateThreadInput {
    pub category: String,
    pub kind: String,
    pub title: String,
    pub content: String,
    pub anime_id: Option<String>,
    pub manga_id: Option<i64>,
    /// Slug of the team to post as
    pub publish_as_team: Option<String>,
}

/// Row written for a new thread once references are resolved
#[derive(Debug, Clone)]
pub struct NewThread {
    pub category_id: i64,
    pub kind_id: i64,
    pub author_id: i64,
    pub team_id: Option<i64>,
    pub title: String,
    pub slug: String,
    pub content: String,
    pub anime_id: Option<String>,
    pub manga_id: Option<i64>,
}

/// Partial thread update. Locking and pinning are for moderators.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateThreadInput {
    pub title: Option<String>,
    pub content: Option<String>,
    pub is_locked: Option<bool>,
    pub is_pinned: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThreadFilter {
    /// Category id or slug
    pub category: Option<String>,
    /// Kind slug
    pub kind: Option<String>,
    pub anime_id: Option<String>,
    pub manga_id: Option<i64>,
    pub is_pinned: Option<bool>,
    /// Matches title or content
    pub q: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CommentStatus {
    #[default]
    Published,
    Pending,
    Hidden,
}

impl fmt::Display for CommentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CommentStatus::Published => "published",
            CommentStatus::Pending => "pending",
            CommentStatus::Hidden => "hidden",
        };
        f.write_str(s)
    }
}

impl FromStr for CommentStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "published" => Ok(CommentStatus::Published),
            "pending" => Ok(CommentStatus::Pending),
            "hidden" => Ok(CommentStatus::Hidden),
            _ => Err(anyhow::anyhow!("Invalid comment status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Comment {
    pub id: i64,
    pub thread_id: i64,
    pub author: UserShort,
    pub publish_as_team: Option<TranslatorShort>,
    pub parent_id: Option<i64>,
    pub content: String,
    pub status: CommentStatus,
    pub is_deleted: bool,
    pub is_pinned: bool,
    pub replies_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Comment {
    /// Deleted comments stay in place for their replies but lose the text
    pub fn redacted(mut self) -> Self {
        if self.is_deleted {
            self.content.clear();
        }
        self
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateCommentInput {
    pub content: String,
    pub parent_id: Option<i64>,
    pub publish_as_team: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewComment {
    pub thread_id: i64,
    pub author_id: i64,
    pub team_id: Option<i64>,
    pub parent_id: Option<i64>,
    pub content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_defaults() {
        let input: CreateKindInput =
            serde_json::from_value(serde_json::json!({"title": "Release"})).unwrap();
        assert_eq!(input.order, 100);
        assert!(!input.allow_anime);
        assert!(!input.allow_manga);
        assert!(input.allow_publish_as_team);
    }

    #[test]
    fn test_deleted_comment_is_redacted() {
        let comment = Comment {
            id: 1,
            thread_id: 1,
            author: UserShort { id: 1, username: "aki".into() },
            publish_as_team: None,
            parent_id: None,
            content: "spoilers".into(),
            status: CommentStatus::Published,
            is_deleted: true,
            is_pinned: false,
            replies_count: 2,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let shown = comment.clone().redacted();
        assert!(shown.content.is_empty());
        assert_eq!(shown.replies_count, 2);

        let live = Comment { is_deleted: false, ..comment };
        assert_eq!(live.redacted().content, "spoilers");
    }
}
