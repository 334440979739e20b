//! Manga repository
//!
//! Titles with their genre and category tags, translator teams and their
//! members, editions, chapters and chapter pages. Writes that touch more
//! than one row (a title with its tags, a team with its owner, page uploads
//! and reordering) go through [`MangaTxOps`].

use crate::db::repositories::user::escape_like;
use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::{
    Chapter, ChapterInput, ChapterPage, CreateMangaInput, CreateTranslatorInput, Edition,
    Hundredths, Manga, MangaFilter, MangaTag, MemberInput, TagKind, TranslationStatus,
    Translator, TranslatorMember, TranslatorShort, UserShort,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{MySqlPool, Row, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;

#[async_trait]
pub trait MangaRepository: Send + Sync {
    /// All tags of one kind by title
    async fn tags(&self, kind: TagKind) -> Result<Vec<MangaTag>>;

    /// Title with its tags
    async fn get_manga(&self, slug: &str) -> Result<Option<Manga>>;

    async fn manga_exists(&self, id: i64) -> Result<bool>;

    /// Filtered page, most recently updated first, with the total count
    async fn list_mangas(
        &self,
        filter: &MangaFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Manga>, i64)>;

    async fn get_translator(&self, slug: &str) -> Result<Option<Translator>>;

    async fn list_translators(&self) -> Result<Vec<Translator>>;

    async fn members(&self, translator_id: i64) -> Result<Vec<TranslatorMember>>;

    async fn member(&self, translator_id: i64, user_id: i64) -> Result<Option<TranslatorMember>>;

    async fn create_edition(
        &self,
        manga_id: i64,
        translator_id: i64,
        status: TranslationStatus,
    ) -> Result<i64>;

    async fn get_edition(&self, id: i64) -> Result<Option<Edition>>;

    async fn find_edition(&self, manga_id: i64, translator_id: i64) -> Result<Option<Edition>>;

    /// Editions of a title, oldest first, without chapters
    async fn editions(&self, manga_id: i64) -> Result<Vec<Edition>>;

    /// Chapters of an edition, highest number first
    async fn chapters(&self, edition_id: i64) -> Result<Vec<Chapter>>;

    async fn get_chapter(&self, id: i64) -> Result<Option<Chapter>>;

    /// Whether another chapter of the edition already has this number
    async fn chapter_number_taken(
        &self,
        edition_id: i64,
        number: Hundredths,
        except_id: Option<i64>,
    ) -> Result<bool>;

    async fn create_chapter(
        &self,
        edition_id: i64,
        input: &ChapterInput,
        uploaded_by: i64,
    ) -> Result<Chapter>;

    async fn update_chapter(&self, id: i64, input: &ChapterInput) -> Result<()>;

    async fn delete_chapter(&self, id: i64) -> Result<()>;

    /// Pages of a chapter in reading order
    async fn pages(&self, chapter_id: i64) -> Result<Vec<ChapterPage>>;
}

/// Manga writes inside a transaction
#[async_trait]
pub trait MangaTxOps: Send {
    async fn manga_insert(&mut self, input: &CreateMangaInput, now: DateTime<Utc>) -> Result<i64>;

    /// Link tags to a title, creating the missing ones by slug
    async fn manga_tags_link(&mut self, manga_id: i64, kind: TagKind, tags: &[MangaTag])
        -> Result<()>;

    async fn translator_insert(
        &mut self,
        input: &CreateTranslatorInput,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// Add a member or overwrite their role, title and active flag
    async fn member_save(
        &mut self,
        translator_id: i64,
        input: &MemberInput,
        now: DateTime<Utc>,
    ) -> Result<()>;

    /// Lock a chapter row
    async fn chapter_lock(&mut self, chapter_id: i64) -> Result<Option<Chapter>>;

    /// `(id, order)` of every page of a chapter
    async fn page_orders(&mut self, chapter_id: i64) -> Result<Vec<(i64, i64)>>;

    async fn page_insert(
        &mut self,
        chapter_id: i64,
        image_url: &str,
        order: i64,
        uploaded_by: i64,
        now: DateTime<Utc>,
    ) -> Result<ChapterPage>;

    async fn page_set_order(&mut self, page_id: i64, order: i64) -> Result<()>;

    /// `false` when the page is not part of the chapter
    async fn page_delete(&mut self, chapter_id: i64, page_id: i64) -> Result<bool>;

    /// Store the real page count on the chapter and return it
    async fn chapter_recount_pages(&mut self, chapter_id: i64, now: DateTime<Utc>) -> Result<i64>;
}

pub struct SqlxMangaRepository {
    pool: DynDatabasePool,
}

impl SqlxMangaRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn MangaRepository> {
        Arc::new(Self::new(pool))
    }
}

const MANGA_COLUMNS: &str = "m.id, m.slug, m.title_ru, m.title_en, m.alt_titles, m.manga_type, \
     m.age_rating, m.year, m.poster_url, m.banner_url, m.description, m.work_status, m.links, \
     m.created_at, m.updated_at";

const TRANSLATOR_COLUMNS: &str = "id, name, slug, avatar_url, description, created_at";

const EDITION_SELECT: &str = "SELECT e.id, e.manga_id, e.translation_status, e.created_at, \
     t.id AS translator_id, t.name AS translator_name, t.slug AS translator_slug, \
     (SELECT COUNT(*) FROM chapters c WHERE c.edition_id = e.id) AS chapters_count \
     FROM editions e JOIN translators t ON t.id = e.translator_id";

const MEMBER_SELECT: &str = "SELECT tm.translator_id, tm.role, tm.title, tm.is_active, \
     tm.joined_at, u.id AS user_id, u.username \
     FROM translator_members tm JOIN users u ON u.id = tm.user_id";

const CHAPTER_COLUMNS: &str = "id, edition_id, number, name, volume, pages_count, published_at, \
     uploaded_by, created_at, updated_at";

const PAGE_COLUMNS: &str = "id, chapter_id, image_url, page_order, uploaded_by, created_at";

const INSERT_MANGA_SQL: &str = r#"
    INSERT INTO mangas (slug, title_ru, title_en, alt_titles, manga_type, age_rating, year,
        poster_url, banner_url, description, work_status, links, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const INSERT_TRANSLATOR_SQL: &str = r#"
    INSERT INTO translators (name, slug, avatar_url, description, created_at)
    VALUES (?, ?, ?, ?, ?)
"#;

const INSERT_CHAPTER_SQL: &str = r#"
    INSERT INTO chapters (edition_id, number, name, volume, pages_count, published_at,
        uploaded_by, created_at, updated_at)
    VALUES (?, ?, ?, ?, 0, ?, ?, ?, ?)
"#;

const UPDATE_CHAPTER_SQL: &str = r#"
    UPDATE chapters SET number = ?, name = ?, volume = ?, published_at = ?, updated_at = ?
    WHERE id = ?
"#;

const INSERT_PAGE_SQL: &str = r#"
    INSERT INTO chapter_pages (chapter_id, image_url, page_order, uploaded_by, created_at)
    VALUES (?, ?, ?, ?, ?)
"#;

const RECOUNT_PAGES_SQL: &str = r#"
    UPDATE chapters
    SET pages_count = (SELECT COUNT(*) FROM chapter_pages p WHERE p.chapter_id = chapters.id),
        updated_at = ?
    WHERE id = ?
"#;

const CHAPTER_NUMBER_TAKEN_SQL: &str =
    "SELECT 1 FROM chapters WHERE edition_id = ? AND number = ? AND (? IS NULL OR id <> ?)";

/// WHERE clause shared by the list and count queries
fn filter_clause(escape: &str) -> String {
    format!(
        "(? IS NULL OR m.manga_type = ?) AND (? IS NULL OR m.year = ?) AND \
         (? IS NULL OR m.work_status = ?) AND \
         (? IS NULL OR EXISTS (SELECT 1 FROM manga_genre_links l \
            JOIN manga_genres g ON g.id = l.tag_id WHERE l.manga_id = m.id AND g.slug = ?)) AND \
         (? IS NULL OR EXISTS (SELECT 1 FROM manga_category_links l \
            JOIN manga_categories c ON c.id = l.tag_id WHERE l.manga_id = m.id AND c.slug = ?)) AND \
         (? IS NULL OR m.title_ru LIKE ? ESCAPE '{0}' OR m.title_en LIKE ? ESCAPE '{0}' \
         OR m.alt_titles LIKE ? ESCAPE '{0}')",
        escape
    )
}

fn list_sql(escape: &str) -> String {
    format!(
        "SELECT {} FROM mangas m WHERE {} ORDER BY m.updated_at DESC, m.id DESC LIMIT ? OFFSET ?",
        MANGA_COLUMNS,
        filter_clause(escape)
    )
}

fn count_sql(escape: &str) -> String {
    format!(
        "SELECT COUNT(*) AS count FROM mangas m WHERE {}",
        filter_clause(escape)
    )
}

fn tags_of_sql(kind: TagKind, count: usize) -> String {
    format!(
        "SELECT l.manga_id, t.title, t.slug FROM {} l JOIN {} t ON t.id = l.tag_id \
         WHERE l.manga_id IN ({}) ORDER BY t.title",
        kind.link_table(),
        kind.table(),
        vec!["?"; count].join(", ")
    )
}

/// Bind values for `filter_clause`, in placeholder order
struct FilterBinds {
    manga_type: Option<String>,
    year: Option<i64>,
    work_status: Option<String>,
    genre: Option<String>,
    category: Option<String>,
    pattern: Option<String>,
}

impl FilterBinds {
    fn from_filter(filter: &MangaFilter) -> Self {
        let trimmed = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            manga_type: filter.manga_type.map(|t| t.to_string()),
            year: filter.year,
            work_status: filter.work_status.map(|s| s.to_string()),
            genre: trimmed(&filter.genre),
            category: trimmed(&filter.category),
            pattern: trimmed(&filter.q).map(|q| format!("%{}%", escape_like(&q))),
        }
    }
}

macro_rules! bind_filter {
    ($query:expr, $binds:expr) => {
        $query
            .bind(&$binds.manga_type)
            .bind(&$binds.manga_type)
            .bind($binds.year)
            .bind($binds.year)
            .bind(&$binds.work_status)
            .bind(&$binds.work_status)
            .bind(&$binds.genre)
            .bind(&$binds.genre)
            .bind(&$binds.category)
            .bind(&$binds.category)
            .bind(&$binds.pattern)
            .bind(&$binds.pattern)
            .bind(&$binds.pattern)
            .bind(&$binds.pattern)
    };
}

macro_rules! bind_chapter_insert {
    ($query:expr, $edition_id:expr, $input:expr, $uploaded_by:expr, $now:expr) => {
        $query
            .bind($edition_id)
            .bind($input.number.0)
            .bind($input.name.trim())
            .bind($input.volume)
            .bind($input.published_at)
            .bind($uploaded_by)
            .bind($now)
            .bind($now)
    };
}

macro_rules! bind_chapter_update {
    ($query:expr, $id:expr, $input:expr, $now:expr) => {
        $query
            .bind($input.number.0)
            .bind($input.name.trim())
            .bind($input.volume)
            .bind($input.published_at)
            .bind($now)
            .bind($id)
    };
}

macro_rules! bind_manga_insert {
    ($query:expr, $input:expr, $alt_titles:expr, $links:expr, $now:expr) => {
        $query
            .bind(&$input.slug)
            .bind(&$input.title_ru)
            .bind(&$input.title_en)
            .bind($alt_titles)
            .bind($input.manga_type.to_string())
            .bind(&$input.age_rating)
            .bind($input.year)
            .bind(&$input.poster_url)
            .bind(&$input.banner_url)
            .bind(&$input.description)
            .bind($input.work_status.to_string())
            .bind($links)
            .bind($now)
            .bind($now)
    };
}

#[async_trait]
impl MangaRepository for SqlxMangaRepository {
    async fn tags(&self, kind: TagKind) -> Result<Vec<MangaTag>> {
        let sql = format!("SELECT title, slug FROM {} ORDER BY title", kind.table());
        let tags = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .fetch_all(pool)
                .await
                .context("Failed to list tags")?
                .iter()
                .map(|row| MangaTag {
                    title: row.get("title"),
                    slug: row.get("slug"),
                })
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .fetch_all(pool)
                .await
                .context("Failed to list tags")?
                .iter()
                .map(|row| MangaTag {
                    title: row.get("title"),
                    slug: row.get("slug"),
                })
                .collect(),
        };
        Ok(tags)
    }

    async fn get_manga(&self, slug: &str) -> Result<Option<Manga>> {
        let sql = format!("SELECT {} FROM mangas m WHERE m.slug = ?", MANGA_COLUMNS);
        let mut mangas = match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let rows = sqlx::query(&sql)
                    .bind(slug)
                    .fetch_all(pool)
                    .await
                    .context("Failed to get manga")?;
                let mut mangas = rows
                    .iter()
                    .map(row_to_manga_sqlite)
                    .collect::<Result<Vec<_>>>()?;
                attach_tags_sqlite(pool, &mut mangas).await?;
                mangas
            }
            DbBackend::Mysql(pool) => {
                let rows = sqlx::query(&sql)
                    .bind(slug)
                    .fetch_all(pool)
                    .await
                    .context("Failed to get manga")?;
                let mut mangas = rows
                    .iter()
                    .map(row_to_manga_mysql)
                    .collect::<Result<Vec<_>>>()?;
                attach_tags_mysql(pool, &mut mangas).await?;
                mangas
            }
        };
        Ok(mangas.pop())
    }

    async fn manga_exists(&self, id: i64) -> Result<bool> {
        let sql = "SELECT 1 FROM mangas WHERE id = ?";
        let found = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .map(|row| row.is_some()),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .map(|row| row.is_some()),
        }
        .context("Failed to look up manga")?;
        Ok(found)
    }

    async fn list_mangas(
        &self,
        filter: &MangaFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Manga>, i64)> {
        let binds = FilterBinds::from_filter(filter);
        let offset = (page.max(1) - 1) * page_size;

        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let count_sql = count_sql("\\");
                let count: i64 = bind_filter!(sqlx::query(&count_sql), binds)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count mangas")?
                    .get("count");
                let list_sql = list_sql("\\");
                let rows = bind_filter!(sqlx::query(&list_sql), binds)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list mangas")?;
                let mut mangas = rows
                    .iter()
                    .map(row_to_manga_sqlite)
                    .collect::<Result<Vec<_>>>()?;
                attach_tags_sqlite(pool, &mut mangas).await?;
                Ok((mangas, count))
            }
            DbBackend::Mysql(pool) => {
                let count_sql = count_sql("\\\\");
                let count: i64 = bind_filter!(sqlx::query(&count_sql), binds)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count mangas")?
                    .get("count");
                let list_sql = list_sql("\\\\");
                let rows = bind_filter!(sqlx::query(&list_sql), binds)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list mangas")?;
                let mut mangas = rows
                    .iter()
                    .map(row_to_manga_mysql)
                    .collect::<Result<Vec<_>>>()?;
                attach_tags_mysql(pool, &mut mangas).await?;
                Ok((mangas, count))
            }
        }
    }

    async fn get_translator(&self, slug: &str) -> Result<Option<Translator>> {
        let sql = format!("SELECT {} FROM translators WHERE slug = ?", TRANSLATOR_COLUMNS);
        let translator = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .context("Failed to get translator")?
                .as_ref()
                .map(row_to_translator_sqlite),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .context("Failed to get translator")?
                .as_ref()
                .map(row_to_translator_mysql),
        };
        Ok(translator)
    }

    async fn list_translators(&self) -> Result<Vec<Translator>> {
        let sql = format!("SELECT {} FROM translators ORDER BY name, id", TRANSLATOR_COLUMNS);
        let translators = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .fetch_all(pool)
                .await
                .context("Failed to list translators")?
                .iter()
                .map(row_to_translator_sqlite)
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .fetch_all(pool)
                .await
                .context("Failed to list translators")?
                .iter()
                .map(row_to_translator_mysql)
                .collect(),
        };
        Ok(translators)
    }

    async fn members(&self, translator_id: i64) -> Result<Vec<TranslatorMember>> {
        let sql = format!(
            "{} WHERE tm.translator_id = ? ORDER BY tm.joined_at, u.id",
            MEMBER_SELECT
        );
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(translator_id)
                .fetch_all(pool)
                .await
                .context("Failed to list members")?
                .iter()
                .map(row_to_member_sqlite)
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(translator_id)
                .fetch_all(pool)
                .await
                .context("Failed to list members")?
                .iter()
                .map(row_to_member_mysql)
                .collect(),
        }
    }

    async fn member(&self, translator_id: i64, user_id: i64) -> Result<Option<TranslatorMember>> {
        let sql = format!(
            "{} WHERE tm.translator_id = ? AND tm.user_id = ?",
            MEMBER_SELECT
        );
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(translator_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("Failed to get member")?
                .as_ref()
                .map(row_to_member_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(translator_id)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("Failed to get member")?
                .as_ref()
                .map(row_to_member_mysql)
                .transpose(),
        }
    }

    async fn create_edition(
        &self,
        manga_id: i64,
        translator_id: i64,
        status: TranslationStatus,
    ) -> Result<i64> {
        let sql = r#"
            INSERT INTO editions (manga_id, translator_id, translation_status, created_at)
            VALUES (?, ?, ?, ?)
        "#;
        let now = Utc::now();
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(manga_id)
                .bind(translator_id)
                .bind(status.to_string())
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create edition")?
                .last_insert_rowid(),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(manga_id)
                .bind(translator_id)
                .bind(status.to_string())
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create edition")?
                .last_insert_id() as i64,
        };
        Ok(id)
    }

    async fn get_edition(&self, id: i64) -> Result<Option<Edition>> {
        let sql = format!("{} WHERE e.id = ?", EDITION_SELECT);
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get edition")?
                .as_ref()
                .map(row_to_edition_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get edition")?
                .as_ref()
                .map(row_to_edition_mysql)
                .transpose(),
        }
    }

    async fn find_edition(&self, manga_id: i64, translator_id: i64) -> Result<Option<Edition>> {
        let sql = format!("{} WHERE e.manga_id = ? AND e.translator_id = ?", EDITION_SELECT);
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(manga_id)
                .bind(translator_id)
                .fetch_optional(pool)
                .await
                .context("Failed to find edition")?
                .as_ref()
                .map(row_to_edition_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(manga_id)
                .bind(translator_id)
                .fetch_optional(pool)
                .await
                .context("Failed to find edition")?
                .as_ref()
                .map(row_to_edition_mysql)
                .transpose(),
        }
    }

    async fn editions(&self, manga_id: i64) -> Result<Vec<Edition>> {
        let sql = format!("{} WHERE e.manga_id = ? ORDER BY e.created_at, e.id", EDITION_SELECT);
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(manga_id)
                .fetch_all(pool)
                .await
                .context("Failed to list editions")?
                .iter()
                .map(row_to_edition_sqlite)
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(manga_id)
                .fetch_all(pool)
                .await
                .context("Failed to list editions")?
                .iter()
                .map(row_to_edition_mysql)
                .collect(),
        }
    }

    async fn chapters(&self, edition_id: i64) -> Result<Vec<Chapter>> {
        let sql = format!(
            "SELECT {} FROM chapters WHERE edition_id = ? ORDER BY number DESC",
            CHAPTER_COLUMNS
        );
        let chapters = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(edition_id)
                .fetch_all(pool)
                .await
                .context("Failed to list chapters")?
                .iter()
                .map(row_to_chapter_sqlite)
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(edition_id)
                .fetch_all(pool)
                .await
                .context("Failed to list chapters")?
                .iter()
                .map(row_to_chapter_mysql)
                .collect(),
        };
        Ok(chapters)
    }

    async fn get_chapter(&self, id: i64) -> Result<Option<Chapter>> {
        let sql = format!("SELECT {} FROM chapters WHERE id = ?", CHAPTER_COLUMNS);
        let chapter = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get chapter")?
                .as_ref()
                .map(row_to_chapter_sqlite),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get chapter")?
                .as_ref()
                .map(row_to_chapter_mysql),
        };
        Ok(chapter)
    }

    async fn chapter_number_taken(
        &self,
        edition_id: i64,
        number: Hundredths,
        except_id: Option<i64>,
    ) -> Result<bool> {
        let taken = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(CHAPTER_NUMBER_TAKEN_SQL)
                .bind(edition_id)
                .bind(number.0)
                .bind(except_id)
                .bind(except_id)
                .fetch_optional(pool)
                .await
                .map(|row| row.is_some()),
            DbBackend::Mysql(pool) => sqlx::query(CHAPTER_NUMBER_TAKEN_SQL)
                .bind(edition_id)
                .bind(number.0)
                .bind(except_id)
                .bind(except_id)
                .fetch_optional(pool)
                .await
                .map(|row| row.is_some()),
        }
        .context("Failed to check chapter number")?;
        Ok(taken)
    }

    async fn create_chapter(
        &self,
        edition_id: i64,
        input: &ChapterInput,
        uploaded_by: i64,
    ) -> Result<Chapter> {
        let now = Utc::now();
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                bind_chapter_insert!(sqlx::query(INSERT_CHAPTER_SQL), edition_id, input, uploaded_by, now)
                    .execute(pool)
                    .await
                    .context("Failed to create chapter")?
                    .last_insert_rowid()
            }
            DbBackend::Mysql(pool) => {
                bind_chapter_insert!(sqlx::query(INSERT_CHAPTER_SQL), edition_id, input, uploaded_by, now)
                    .execute(pool)
                    .await
                    .context("Failed to create chapter")?
                    .last_insert_id() as i64
            }
        };
        Ok(Chapter {
            id,
            edition_id,
            number: input.number,
            name: input.name.trim().to_string(),
            volume: input.volume,
            pages_count: 0,
            published_at: input.published_at,
            uploaded_by: Some(uploaded_by),
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_chapter(&self, id: i64, input: &ChapterInput) -> Result<()> {
        let now = Utc::now();
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => bind_chapter_update!(sqlx::query(UPDATE_CHAPTER_SQL), id, input, now)
                .execute(pool)
                .await
                .map(|_| ()),
            DbBackend::Mysql(pool) => bind_chapter_update!(sqlx::query(UPDATE_CHAPTER_SQL), id, input, now)
                .execute(pool)
                .await
                .map(|_| ()),
        }
        .context("Failed to update chapter")
    }

    async fn delete_chapter(&self, id: i64) -> Result<()> {
        let sql = "DELETE FROM chapters WHERE id = ?";
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql).bind(id).execute(pool).await.map(|_| ()),
            DbBackend::Mysql(pool) => sqlx::query(sql).bind(id).execute(pool).await.map(|_| ()),
        }
        .context("Failed to delete chapter")
    }

    async fn pages(&self, chapter_id: i64) -> Result<Vec<ChapterPage>> {
        let sql = format!(
            "SELECT {} FROM chapter_pages WHERE chapter_id = ? ORDER BY page_order, id",
            PAGE_COLUMNS
        );
        let pages = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(chapter_id)
                .fetch_all(pool)
                .await
                .context("Failed to list pages")?
                .iter()
                .map(row_to_page_sqlite)
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(chapter_id)
                .fetch_all(pool)
                .await
                .context("Failed to list pages")?
                .iter()
                .map(row_to_page_mysql)
                .collect(),
        };
        Ok(pages)
    }
}

fn group_tags(rows: Vec<(i64, MangaTag)>) -> HashMap<i64, Vec<MangaTag>> {
    let mut by_manga: HashMap<i64, Vec<MangaTag>> = HashMap::new();
    for (manga_id, tag) in rows {
        by_manga.entry(manga_id).or_default().push(tag);
    }
    by_manga
}

fn set_tags(mangas: &mut [Manga], kind: TagKind, rows: Vec<(i64, MangaTag)>) {
    let mut by_manga = group_tags(rows);
    for manga in mangas {
        let tags = by_manga.remove(&manga.id).unwrap_or_default();
        match kind {
            TagKind::Genre => manga.genres = tags,
            TagKind::Category => manga.categories = tags,
        }
    }
}

macro_rules! manga_from_row {
    ($row:expr) => {{
        let row = $row;
        let alt_titles: String = row.get("alt_titles");
        let links: String = row.get("links");
        let manga_type: String = row.get("manga_type");
        let work_status: String = row.get("work_status");
        Ok(Manga {
            id: row.get("id"),
            slug: row.get("slug"),
            title_ru: row.get("title_ru"),
            title_en: row.get("title_en"),
            alt_titles: serde_json::from_str(&alt_titles).context("Invalid alt titles JSON")?,
            manga_type: manga_type.parse()?,
            age_rating: row.get("age_rating"),
            year: row.get("year"),
            poster_url: row.get("poster_url"),
            banner_url: row.get("banner_url"),
            description: row.get("description"),
            work_status: work_status.parse()?,
            links: serde_json::from_str(&links).context("Invalid links JSON")?,
            genres: Vec::new(),
            categories: Vec::new(),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }};
}

macro_rules! translator_from_row {
    ($row:expr) => {{
        let row = $row;
        Translator {
            id: row.get("id"),
            name: row.get("name"),
            slug: row.get("slug"),
            avatar_url: row.get("avatar_url"),
            description: row.get("description"),
            created_at: row.get("created_at"),
        }
    }};
}

macro_rules! member_from_row {
    ($row:expr) => {{
        let row = $row;
        let role: String = row.get("role");
        Ok(TranslatorMember {
            translator_id: row.get("translator_id"),
            user: UserShort {
                id: row.get("user_id"),
                username: row.get("username"),
            },
            role: role.parse()?,
            title: row.get("title"),
            is_active: row.get("is_active"),
            joined_at: row.get("joined_at"),
        })
    }};
}

macro_rules! edition_from_row {
    ($row:expr) => {{
        let row = $row;
        let status: String = row.get("translation_status");
        Ok(Edition {
            id: row.get("id"),
            manga_id: row.get("manga_id"),
            translator: TranslatorShort {
                id: row.get("translator_id"),
                name: row.get("translator_name"),
                slug: row.get("translator_slug"),
            },
            translation_status: status.parse()?,
            chapters_count: row.get("chapters_count"),
            created_at: row.get("created_at"),
            chapters: None,
        })
    }};
}

macro_rules! chapter_from_row {
    ($row:expr) => {{
        let row = $row;
        Chapter {
            id: row.get("id"),
            edition_id: row.get("edition_id"),
            number: Hundredths(row.get("number")),
            name: row.get("name"),
            volume: row.get("volume"),
            pages_count: row.get("pages_count"),
            published_at: row.get("published_at"),
            uploaded_by: row.get("uploaded_by"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }};
}

macro_rules! page_from_row {
    ($row:expr) => {{
        let row = $row;
        ChapterPage {
            id: row.get("id"),
            chapter_id: row.get("chapter_id"),
            image_url: row.get("image_url"),
            order: row.get("page_order"),
            uploaded_by: row.get("uploaded_by"),
            created_at: row.get("created_at"),
        }
    }};
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn attach_tags_sqlite(pool: &SqlitePool, mangas: &mut [Manga]) -> Result<()> {
    if mangas.is_empty() {
        return Ok(());
    }
    for kind in [TagKind::Genre, TagKind::Category] {
        let sql = tags_of_sql(kind, mangas.len());
        let mut query = sqlx::query(&sql);
        for manga in mangas.iter() {
            query = query.bind(manga.id);
        }
        let rows = query
            .fetch_all(pool)
            .await
            .context("Failed to load manga tags")?
            .iter()
            .map(|row| {
                let tag = MangaTag {
                    title: row.get("title"),
                    slug: row.get("slug"),
                };
                (row.get("manga_id"), tag)
            })
            .collect();
        set_tags(mangas, kind, rows);
    }
    Ok(())
}

#[async_trait]
impl MangaTxOps for SqliteTx {
    async fn manga_insert(&mut self, input: &CreateMangaInput, now: DateTime<Utc>) -> Result<i64> {
        let alt_titles = serde_json::to_string(&input.alt_titles)?;
        let links = serde_json::to_string(&input.links)?;
        Ok(bind_manga_insert!(sqlx::query(INSERT_MANGA_SQL), input, &alt_titles, &links, now)
            .execute(self.conn()?)
            .await
            .context("Failed to create manga")?
            .last_insert_rowid())
    }

    async fn manga_tags_link(
        &mut self,
        manga_id: i64,
        kind: TagKind,
        tags: &[MangaTag],
    ) -> Result<()> {
        let insert_tag = format!("INSERT OR IGNORE INTO {} (title, slug) VALUES (?, ?)", kind.table());
        let tag_id = format!("SELECT id FROM {} WHERE slug = ?", kind.table());
        let link = format!(
            "INSERT OR IGNORE INTO {} (manga_id, tag_id) VALUES (?, ?)",
            kind.link_table()
        );
        for tag in tags {
            sqlx::query(&insert_tag)
                .bind(&tag.title)
                .bind(&tag.slug)
                .execute(self.conn()?)
                .await
                .context("Failed to save tag")?;
            let id: i64 = sqlx::query(&tag_id)
                .bind(&tag.slug)
                .fetch_one(self.conn()?)
                .await
                .context("Failed to load tag")?
                .get("id");
            sqlx::query(&link)
                .bind(manga_id)
                .bind(id)
                .execute(self.conn()?)
                .await
                .context("Failed to link tag")?;
        }
        Ok(())
    }

    async fn translator_insert(
        &mut self,
        input: &CreateTranslatorInput,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(sqlx::query(INSERT_TRANSLATOR_SQL)
            .bind(&input.name)
            .bind(&input.slug)
            .bind(&input.avatar_url)
            .bind(&input.description)
            .bind(now)
            .execute(self.conn()?)
            .await
            .context("Failed to create translator")?
            .last_insert_rowid())
    }

    async fn member_save(
        &mut self,
        translator_id: i64,
        input: &MemberInput,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO translator_members (translator_id, user_id, role, title, is_active, joined_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(translator_id, user_id) DO UPDATE SET
                role = excluded.role,
                title = excluded.title,
                is_active = excluded.is_active
            "#,
        )
        .bind(translator_id)
        .bind(input.user_id)
        .bind(input.role.to_string())
        .bind(input.title.trim())
        .bind(input.is_active)
        .bind(now)
        .execute(self.conn()?)
        .await
        .context("Failed to save member")?;
        Ok(())
    }

    async fn chapter_lock(&mut self, chapter_id: i64) -> Result<Option<Chapter>> {
        let sql = format!("SELECT {} FROM chapters WHERE id = ?", CHAPTER_COLUMNS);
        Ok(sqlx::query(&sql)
            .bind(chapter_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock chapter")?
            .as_ref()
            .map(row_to_chapter_sqlite))
    }

    async fn page_orders(&mut self, chapter_id: i64) -> Result<Vec<(i64, i64)>> {
        Ok(sqlx::query("SELECT id, page_order FROM chapter_pages WHERE chapter_id = ?")
            .bind(chapter_id)
            .fetch_all(self.conn()?)
            .await
            .context("Failed to load page orders")?
            .iter()
            .map(|row| (row.get("id"), row.get("page_order")))
            .collect())
    }

    async fn page_insert(
        &mut self,
        chapter_id: i64,
        image_url: &str,
        order: i64,
        uploaded_by: i64,
        now: DateTime<Utc>,
    ) -> Result<ChapterPage> {
        let id = sqlx::query(INSERT_PAGE_SQL)
            .bind(chapter_id)
            .bind(image_url)
            .bind(order)
            .bind(uploaded_by)
            .bind(now)
            .execute(self.conn()?)
            .await
            .context("Failed to add page")?
            .last_insert_rowid();
        Ok(ChapterPage {
            id,
            chapter_id,
            image_url: image_url.to_string(),
            order,
            uploaded_by: Some(uploaded_by),
            created_at: now,
        })
    }

    async fn page_set_order(&mut self, page_id: i64, order: i64) -> Result<()> {
        sqlx::query("UPDATE chapter_pages SET page_order = ? WHERE id = ?")
            .bind(order)
            .bind(page_id)
            .execute(self.conn()?)
            .await
            .context("Failed to move page")?;
        Ok(())
    }

    async fn page_delete(&mut self, chapter_id: i64, page_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chapter_pages WHERE id = ? AND chapter_id = ?")
            .bind(page_id)
            .bind(chapter_id)
            .execute(self.conn()?)
            .await
            .context("Failed to delete page")?;
        Ok(result.rows_affected() > 0)
    }

    async fn chapter_recount_pages(&mut self, chapter_id: i64, now: DateTime<Utc>) -> Result<i64> {
        sqlx::query(RECOUNT_PAGES_SQL)
            .bind(now)
            .bind(chapter_id)
            .execute(self.conn()?)
            .await
            .context("Failed to recount pages")?;
        Ok(sqlx::query("SELECT pages_count FROM chapters WHERE id = ?")
            .bind(chapter_id)
            .fetch_one(self.conn()?)
            .await
            .context("Failed to load page count")?
            .get("pages_count"))
    }
}

fn row_to_manga_sqlite(row: &SqliteRow) -> Result<Manga> {
    manga_from_row!(row)
}

fn row_to_translator_sqlite(row: &SqliteRow) -> Translator {
    translator_from_row!(row)
}

fn row_to_member_sqlite(row: &SqliteRow) -> Result<TranslatorMember> {
    member_from_row!(row)
}

fn row_to_edition_sqlite(row: &SqliteRow) -> Result<Edition> {
    edition_from_row!(row)
}

fn row_to_chapter_sqlite(row: &SqliteRow) -> Chapter {
    chapter_from_row!(row)
}

fn row_to_page_sqlite(row: &SqliteRow) -> ChapterPage {
    page_from_row!(row)
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn attach_tags_mysql(pool: &MySqlPool, mangas: &mut [Manga]) -> Result<()> {
    if mangas.is_empty() {
        return Ok(());
    }
    for kind in [TagKind::Genre, TagKind::Category] {
        let sql = tags_of_sql(kind, mangas.len());
        let mut query = sqlx::query(&sql);
        for manga in mangas.iter() {
            query = query.bind(manga.id);
        }
        let rows = query
            .fetch_all(pool)
            .await
            .context("Failed to load manga tags")?
            .iter()
            .map(|row| {
                let tag = MangaTag {
                    title: row.get("title"),
                    slug: row.get("slug"),
                };
                (row.get("manga_id"), tag)
            })
            .collect();
        set_tags(mangas, kind, rows);
    }
    Ok(())
}

#[async_trait]
impl MangaTxOps for MysqlTx {
    async fn manga_insert(&mut self, input: &CreateMangaInput, now: DateTime<Utc>) -> Result<i64> {
        let alt_titles = serde_json::to_string(&input.alt_titles)?;
        let links = serde_json::to_string(&input.links)?;
        Ok(bind_manga_insert!(sqlx::query(INSERT_MANGA_SQL), input, &alt_titles, &links, now)
            .execute(self.conn()?)
            .await
            .context("Failed to create manga")?
            .last_insert_id() as i64)
    }

    async fn manga_tags_link(
        &mut self,
        manga_id: i64,
        kind: TagKind,
        tags: &[MangaTag],
    ) -> Result<()> {
        let insert_tag = format!("INSERT IGNORE INTO {} (title, slug) VALUES (?, ?)", kind.table());
        let tag_id = format!("SELECT id FROM {} WHERE slug = ?", kind.table());
        let link = format!(
            "INSERT IGNORE INTO {} (manga_id, tag_id) VALUES (?, ?)",
            kind.link_table()
        );
        for tag in tags {
            sqlx::query(&insert_tag)
                .bind(&tag.title)
                .bind(&tag.slug)
                .execute(self.conn()?)
                .await
                .context("Failed to save tag")?;
            let id: i64 = sqlx::query(&tag_id)
                .bind(&tag.slug)
                .fetch_one(self.conn()?)
                .await
                .context("Failed to load tag")?
                .get("id");
            sqlx::query(&link)
                .bind(manga_id)
                .bind(id)
                .execute(self.conn()?)
                .await
                .context("Failed to link tag")?;
        }
        Ok(())
    }

    async fn translator_insert(
        &mut self,
        input: &CreateTranslatorInput,
        now: DateTime<Utc>,
    ) -> Result<i64> {
        Ok(sqlx::query(INSERT_TRANSLATOR_SQL)
            .bind(&input.name)
            .bind(&input.slug)
            .bind(&input.avatar_url)
            .bind(&input.description)
            .bind(now)
            .execute(self.conn()?)
            .await
            .context("Failed to create translator")?
            .last_insert_id() as i64)
    }

    async fn member_save(
        &mut self,
        translator_id: i64,
        input: &MemberInput,
        now: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO translator_members (translator_id, user_id, role, title, is_active, joined_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                role = VALUES(role),
                title = VALUES(title),
                is_active = VALUES(is_active)
            "#,
        )
        .bind(translator_id)
        .bind(input.user_id)
        .bind(input.role.to_string())
        .bind(input.title.trim())
        .bind(input.is_active)
        .bind(now)
        .execute(self.conn()?)
        .await
        .context("Failed to save member")?;
        Ok(())
    }

    async fn chapter_lock(&mut self, chapter_id: i64) -> Result<Option<Chapter>> {
        let sql = format!("SELECT {} FROM chapters WHERE id = ? FOR UPDATE", CHAPTER_COLUMNS);
        Ok(sqlx::query(&sql)
            .bind(chapter_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock chapter")?
            .as_ref()
            .map(row_to_chapter_mysql))
    }

    async fn page_orders(&mut self, chapter_id: i64) -> Result<Vec<(i64, i64)>> {
        Ok(sqlx::query("SELECT id, page_order FROM chapter_pages WHERE chapter_id = ? FOR UPDATE")
            .bind(chapter_id)
            .fetch_all(self.conn()?)
            .await
            .context("Failed to load page orders")?
            .iter()
            .map(|row| (row.get("id"), row.get("page_order")))
            .collect())
    }

    async fn page_insert(
        &mut self,
        chapter_id: i64,
        image_url: &str,
        order: i64,
        uploaded_by: i64,
        now: DateTime<Utc>,
    ) -> Result<ChapterPage> {
        let id = sqlx::query(INSERT_PAGE_SQL)
            .bind(chapter_id)
            .bind(image_url)
            .bind(order)
            .bind(uploaded_by)
            .bind(now)
            .execute(self.conn()?)
            .await
            .context("Failed to add page")?
            .last_insert_id() as i64;
        Ok(ChapterPage {
            id,
            chapter_id,
            image_url: image_url.to_string(),
            order,
            uploaded_by: Some(uploaded_by),
            created_at: now,
        })
    }

    async fn page_set_order(&mut self, page_id: i64, order: i64) -> Result<()> {
        sqlx::query("UPDATE chapter_pages SET page_order = ? WHERE id = ?")
            .bind(order)
            .bind(page_id)
            .execute(self.conn()?)
            .await
            .context("Failed to move page")?;
        Ok(())
    }

    async fn page_delete(&mut self, chapter_id: i64, page_id: i64) -> Result<bool> {
        let result = sqlx::query("DELETE FROM chapter_pages WHERE id = ? AND chapter_id = ?")
            .bind(page_id)
            .bind(chapter_id)
            .execute(self.conn()?)
            .await
            .context("Failed to delete page")?;
        Ok(result.rows_affected() > 0)
    }

    async fn chapter_recount_pages(&mut self, chapter_id: i64, now: DateTime<Utc>) -> Result<i64> {
        // MySQL cannot read the updated table in a subquery of the UPDATE
        let count: i64 = sqlx::query("SELECT COUNT(*) AS count FROM chapter_pages WHERE chapter_id = ?")
            .bind(chapter_id)
            .fetch_one(self.conn()?)
            .await
            .context("Failed to count pages")?
            .get("count");
        sqlx::query("UPDATE chapters SET pages_count = ?, updated_at = ? WHERE id = ?")
            .bind(count)
            .bind(now)
            .bind(chapter_id)
            .execute(self.conn()?)
            .await
            .context("Failed to recount pages")?;
        Ok(count)
    }
}

fn row_to_manga_mysql(row: &MySqlRow) -> Result<Manga> {
    manga_from_row!(row)
}

fn row_to_translator_mysql(row: &MySqlRow) -> Translator {
    translator_from_row!(row)
}

fn row_to_member_mysql(row: &MySqlRow) -> Result<TranslatorMember> {
    member_from_row!(row)
}

fn row_to_edition_mysql(row: &MySqlRow) -> Result<Edition> {
    edition_from_row!(row)
}

fn row_to_chapter_mysql(row: &MySqlRow) -> Chapter {
    chapter_from_row!(row)
}

fn row_to_page_mysql(row: &MySqlRow) -> ChapterPage {
    page_from_row!(row)
}
