//! Manga models
//!
//! A manga title is published by translator teams. Each team keeps its own
//! edition of a title; chapters belong to an edition and pages to a chapter.
//! Chapter numbers carry two decimals (`12.5` is a bonus chapter).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{slugify_or, Hundredths, UserShort};

/// Highest chapter number, `999.99`
pub const MAX_CHAPTER_NUMBER: Hundredths = Hundredths(99_999);

/// Oldest and newest accepted release years
pub const MANGA_YEAR_RANGE: (i64, i64) = (1900, 2100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MangaType {
    #[default]
    Manga,
    Manhwa,
    Manhua,
    OneShot,
    Doujinshi,
    Other,
}

impl fmt::Display for MangaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MangaType::Manga => "manga",
            MangaType::Manhwa => "manhwa",
            MangaType::Manhua => "manhua",
            MangaType::OneShot => "one-shot",
            MangaType::Doujinshi => "doujinshi",
            MangaType::Other => "other",
        };
        f.write_str(s)
    }
}

impl FromStr for MangaType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manga" => Ok(MangaType::Manga),
            "manhwa" => Ok(MangaType::Manhwa),
            "manhua" => Ok(MangaType::Manhua),
            "one-shot" => Ok(MangaType::OneShot),
            "doujinshi" => Ok(MangaType::Doujinshi),
            "other" => Ok(MangaType::Other),
            _ => Err(anyhow::anyhow!("Invalid manga type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    #[default]
    Ongoing,
    Completed,
    Hiatus,
    Frozen,
    Announced,
}

impl fmt::Display for WorkStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkStatus::Ongoing => "ongoing",
            WorkStatus::Completed => "completed",
            WorkStatus::Hiatus => "hiatus",
            WorkStatus::Frozen => "frozen",
            WorkStatus::Announced => "announced",
        };
        f.write_str(s)
    }
}

impl FromStr for WorkStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ongoing" => Ok(WorkStatus::Ongoing),
            "completed" => Ok(WorkStatus::Completed),
            "hiatus" => Ok(WorkStatus::Hiatus),
            "frozen" => Ok(WorkStatus::Frozen),
            "announced" => Ok(WorkStatus::Announced),
            _ => Err(anyhow::anyhow!("Invalid work status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TranslationStatus {
    #[default]
    InProgress,
    Completed,
    Dropped,
}

impl fmt::Display for TranslationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TranslationStatus::InProgress => "in_progress",
            TranslationStatus::Completed => "completed",
            TranslationStatus::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

impl FromStr for TranslationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in_progress" => Ok(TranslationStatus::InProgress),
            "completed" => Ok(TranslationStatus::Completed),
            "dropped" => Ok(TranslationStatus::Dropped),
            _ => Err(anyhow::anyhow!("Invalid translation status: {}", s)),
        }
    }
}

/// Role inside a translator team
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MemberRole {
    Owner,
    Moderator,
    Publisher,
    #[default]
    Member,
}

impl MemberRole {
    /// Owners, moderators and publishers may write chapters and pages
    pub fn can_publish(&self) -> bool {
        matches!(
            self,
            MemberRole::Owner | MemberRole::Moderator | MemberRole::Publisher
        )
    }

    /// Owners and moderators manage the member list
    pub fn can_manage(&self) -> bool {
        matches!(self, MemberRole::Owner | MemberRole::Moderator)
    }
}

impl fmt::Display for MemberRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberRole::Owner => "owner",
            MemberRole::Moderator => "moderator",
            MemberRole::Publisher => "publisher",
            MemberRole::Member => "member",
        };
        f.write_str(s)
    }
}

impl FromStr for MemberRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "owner" => Ok(MemberRole::Owner),
            "moderator" => Ok(MemberRole::Moderator),
            "publisher" => Ok(MemberRole::Publisher),
            "member" => Ok(MemberRole::Member),
            _ => Err(anyhow::anyhow!("Invalid member role: {}", s)),
        }
    }
}

/// Genre or category of a manga title
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MangaTag {
    pub title: String,
    pub slug: String,
}

impl MangaTag {
    pub fn from_title(title: &str, fallback_prefix: &str) -> Self {
        let title = title.trim().to_string();
        Self {
            slug: slugify_or(&title, fallback_prefix),
            title,
        }
    }
}

/// Which tag table a [`MangaTag`] lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TagKind {
    Genre,
    Category,
}

impl TagKind {
    pub fn table(&self) -> &'static str {
        match self {
            TagKind::Genre => "manga_genres",
            TagKind::Category => "manga_categories",
        }
    }

    pub fn link_table(&self) -> &'static str {
        match self {
            TagKind::Genre => "manga_genre_links",
            TagKind::Category => "manga_category_links",
        }
    }

    /// Prefix of random slugs for titles without ASCII letters
    pub fn slug_prefix(&self) -> &'static str {
        match self {
            TagKind::Genre => "genre",
            TagKind::Category => "category",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MangaLink {
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manga {
    pub id: i64,
    pub slug: String,
    pub title_ru: String,
    pub title_en: String,
    pub alt_titles: Vec<String>,
    #[serde(rename = "type")]
    pub manga_type: MangaType,
    pub age_rating: String,
    pub year: Option<i64>,
    pub poster_url: String,
    pub banner_url: String,
    pub description: String,
    pub work_status: WorkStatus,
    pub links: Vec<MangaLink>,
    pub genres: Vec<MangaTag>,
    pub categories: Vec<MangaTag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a manga title. Tags are given by title and created on
/// first use.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateMangaInput {
    pub title_ru: String,
    #[serde(default)]
    pub title_en: String,
    #[serde(default)]
    pub alt_titles: Vec<String>,
    #[serde(default)]
    pub slug: String,
    #[serde(rename = "type", default)]
    pub manga_type: MangaType,
    #[serde(default)]
    pub age_rating: String,
    pub year: Option<i64>,
    #[serde(default)]
    pub poster_url: String,
    #[serde(default)]
    pub banner_url: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub work_status: WorkStatus,
    #[serde(default)]
    pub links: Vec<MangaLink>,
    #[serde(default)]
    pub genres: Vec<String>,
    #[serde(default)]
    pub categories: Vec<String>,
}

impl CreateMangaInput {
    /// Trim text, drop blank alternative titles and derive the slug from
    /// the English title, falling back to the Russian one
    pub fn normalize(&mut self) {
        self.title_ru = self.title_ru.trim().to_string();
        self.title_en = self.title_en.trim().to_string();
        self.alt_titles = self
            .alt_titles
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();
        self.slug = self.slug.trim().to_lowercase();
        if self.slug.is_empty() {
            let source = if self.title_en.is_empty() {
                &self.title_ru
            } else {
                &self.title_en
            };
            self.slug = slugify_or(source, "manga");
        }
    }

    pub fn genre_tags(&self) -> Vec<MangaTag> {
        tags_of(&self.genres, TagKind::Genre)
    }

    pub fn category_tags(&self) -> Vec<MangaTag> {
        tags_of(&self.categories, TagKind::Category)
    }
}

fn tags_of(titles: &[String], kind: TagKind) -> Vec<MangaTag> {
    let mut tags: Vec<MangaTag> = Vec::new();
    for title in titles.iter().filter(|t| !t.trim().is_empty()) {
        let tag = MangaTag::from_title(title, kind.slug_prefix());
        if !tags.iter().any(|t| t.slug == tag.slug) {
            tags.push(tag);
        }
    }
    tags
}

/// Filters of the manga listing
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MangaFilter {
    /// Matches either title or an alternative title
    pub q: Option<String>,
    #[serde(rename = "type")]
    pub manga_type: Option<MangaType>,
    pub year: Option<i64>,
    pub work_status: Option<WorkStatus>,
    /// Genre slug
    pub genre: Option<String>,
    /// Category slug
    pub category: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Translator {
    pub id: i64,
    pub name: String,
    pub slug: String,
    pub avatar_url: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateTranslatorInput {
    pub name: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub description: String,
}

impl CreateTranslatorInput {
    pub fn normalize(&mut self) {
        self.name = self.name.trim().to_string();
        self.slug = self.slug.trim().to_lowercase();
        if self.slug.is_empty() {
            self.slug = slugify_or(&self.name, "team");
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorMember {
    pub translator_id: i64,
    pub user: UserShort,
    pub role: MemberRole,
    pub title: String,
    pub is_active: bool,
    pub joined_at: DateTime<Utc>,
}

impl TranslatorMember {
    pub fn can_publish(&self) -> bool {
        self.is_active && self.role.can_publish()
    }
}

/// Add a member to a team or change an existing one
#[derive(Debug, Clone, Deserialize)]
pub struct MemberInput {
    pub user_id: i64,
    #[serde(default)]
    pub role: MemberRole,
    #[serde(default)]
    pub title: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// Team name as shown on an edition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslatorShort {
    pub id: i64,
    pub name: String,
    pub slug: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edition {
    pub id: i64,
    pub manga_id: i64,
    pub translator: TranslatorShort,
    pub translation_status: TranslationStatus,
    pub chapters_count: i64,
    pub created_at: DateTime<Utc>,
    /// Filled only when chapters were asked for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chapters: Option<Vec<Chapter>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateEditionInput {
    pub translator_slug: String,
    #[serde(default)]
    pub translation_status: TranslationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chapter {
    pub id: i64,
    pub edition_id: i64,
    pub number: Hundredths,
    pub name: String,
    pub volume: Option<i64>,
    pub pages_count: i64,
    pub published_at: Option<DateTime<Utc>>,
    pub uploaded_by: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create or replace a chapter's fields
#[derive(Debug, Clone, Deserialize)]
pub struct ChapterInput {
    pub number: Hundredths,
    #[serde(default)]
    pub name: String,
    pub volume: Option<i64>,
    pub published_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterPage {
    pub id: i64,
    pub chapter_id: i64,
    pub image_url: String,
    pub order: i64,
    pub uploaded_by: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// Chapter with its pages in reading order
#[derive(Debug, Clone, Serialize)]
pub struct ChapterDetail {
    #[serde(flatten)]
    pub chapter: Chapter,
    pub pages: Vec<ChapterPage>,
}

/// New position of one page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct PageOrder {
    pub id: i64,
    pub order: i64,
}

/// Manga with its editions
#[derive(Debug, Clone, Serialize)]
pub struct MangaDetail {
    #[serde(flatten)]
    pub manga: Manga,
    pub editions: Vec<Edition>,
}
