//! Forum repository
//!
//! Categories, thread kinds, threads and their comments. Thread and comment
//! rows are read with the author, the team they were posted as, and the
//! category and kind joined in. Counter upkeep on comment writes lives in
//! [`ForumTxOps`].

use crate::db::repositories::user::escape_like;
use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::{
    Comment, CreateCategoryInput, CreateKindInput, ForumCategory, ForumRef, NewComment,
    NewThread, Thread, ThreadFilter, ThreadKind, TranslatorShort, UpdateThreadInput, UserShort,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::mysql::MySqlRow;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use std::sync::Arc;

#[async_trait]
pub trait ForumRepository: Send + Sync {
    async fn create_category(&self, input: &CreateCategoryInput) -> Result<ForumCategory>;

    /// Active categories by order, then title
    async fn categories(&self) -> Result<Vec<ForumCategory>>;

    /// Category by id or slug
    async fn get_category(&self, key: &str) -> Result<Option<ForumCategory>>;

    async fn create_kind(&self, input: &CreateKindInput) -> Result<ThreadKind>;

    /// Active kinds by order, then title
    async fn kinds(&self) -> Result<Vec<ThreadKind>>;

    async fn get_kind(&self, slug: &str) -> Result<Option<ThreadKind>>;

    async fn thread_slug_exists(&self, slug: &str) -> Result<bool>;

    async fn create_thread(&self, thread: &NewThread) -> Result<i64>;

    /// Thread by id or slug
    async fn get_thread(&self, key: &str) -> Result<Option<Thread>>;

    /// Pinned first, then by last activity
    async fn list_threads(
        &self,
        filter: &ThreadFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Thread>, i64)>;

    /// Apply the fields that are set; the slug never changes
    async fn update_thread(&self, id: i64, input: &UpdateThreadInput) -> Result<()>;

    async fn delete_thread(&self, id: i64) -> Result<()>;

    /// Published comments of a thread under `parent`, or top level when
    /// `parent` is `None`. Deleted comments are kept while they have
    /// replies.
    async fn list_comments(
        &self,
        thread_id: i64,
        parent: Option<i64>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Comment>, i64)>;

    async fn get_comment(&self, id: i64) -> Result<Option<Comment>>;

    async fn update_comment(&self, id: i64, content: &str) -> Result<()>;
}

/// Forum writes inside a transaction
#[async_trait]
pub trait ForumTxOps: Send {
    /// Lock a thread row and return whether it is locked for replies
    async fn thread_lock(&mut self, thread_id: i64) -> Result<Option<bool>>;

    async fn comment_insert(&mut self, comment: &NewComment, now: DateTime<Utc>) -> Result<i64>;

    /// Mark a comment deleted; `false` when it already was
    async fn comment_soft_delete(&mut self, comment_id: i64, now: DateTime<Utc>) -> Result<bool>;

    /// Store the number of live comments on the thread
    async fn thread_recount(&mut self, thread_id: i64) -> Result<i64>;

    async fn thread_touch(&mut self, thread_id: i64, now: DateTime<Utc>) -> Result<()>;

    /// Store the number of live replies on a comment
    async fn comment_recount_replies(&mut self, comment_id: i64) -> Result<i64>;
}

pub struct SqlxForumRepository {
    pool: DynDatabasePool,
}

impl SqlxForumRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn ForumRepository> {
        Arc::new(Self::new(pool))
    }
}

const CATEGORY_COLUMNS: &str = "id, title, slug, is_active, sort_order, created_at";

const KIND_COLUMNS: &str = "id, title, slug, description, is_active, sort_order, allow_anime, \
     allow_manga, allow_publish_as_team, created_at";

const THREAD_SELECT: &str = "SELECT t.id, t.title, t.slug, t.content, t.anime_id, t.manga_id, \
     t.comments_count, t.last_activity_at, t.is_locked, t.is_pinned, t.created_at, t.updated_at, \
     c.id AS category_id, c.title AS category_title, c.slug AS category_slug, \
     k.id AS kind_id, k.title AS kind_title, k.slug AS kind_slug, \
     u.id AS author_id, u.username AS author_username, \
     tr.id AS team_id, tr.name AS team_name, tr.slug AS team_slug \
     FROM forum_threads t \
     JOIN forum_categories c ON c.id = t.category_id \
     JOIN forum_thread_kinds k ON k.id = t.kind_id \
     JOIN users u ON u.id = t.author_id \
     LEFT JOIN translators tr ON tr.id = t.team_id";

const COMMENT_SELECT: &str = "SELECT cm.id, cm.thread_id, cm.parent_id, cm.content, cm.status, \
     cm.is_deleted, cm.is_pinned, cm.replies_count, cm.created_at, cm.updated_at, \
     u.id AS author_id, u.username AS author_username, \
     tr.id AS team_id, tr.name AS team_name, tr.slug AS team_slug \
     FROM forum_comments cm \
     JOIN users u ON u.id = cm.author_id \
     LEFT JOIN translators tr ON tr.id = cm.team_id";

const COMMENT_SCOPE: &str = "cm.thread_id = ? AND cm.status = 'published' \
     AND ((? IS NULL AND cm.parent_id IS NULL) OR cm.parent_id = ?) \
     AND (cm.is_deleted = ? OR cm.replies_count > 0)";

const INSERT_CATEGORY_SQL: &str =
    "INSERT INTO forum_categories (title, slug, is_active, sort_order, created_at) VALUES (?, ?, ?, ?, ?)";

const INSERT_KIND_SQL: &str = r#"
    INSERT INTO forum_thread_kinds (title, slug, description, is_active, sort_order,
        allow_anime, allow_manga, allow_publish_as_team, created_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const INSERT_THREAD_SQL: &str = r#"
    INSERT INTO forum_threads (category_id, kind_id, author_id, team_id, title, slug, content,
        anime_id, manga_id, comments_count, last_activity_at, is_locked, is_pinned,
        created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?, ?, ?, ?)
"#;

const UPDATE_THREAD_SQL: &str = r#"
    UPDATE forum_threads
    SET title = COALESCE(?, title),
        content = COALESCE(?, content),
        is_locked = COALESCE(?, is_locked),
        is_pinned = COALESCE(?, is_pinned),
        updated_at = ?
    WHERE id = ?
"#;

const INSERT_COMMENT_SQL: &str = r#"
    INSERT INTO forum_comments (thread_id, author_id, team_id, parent_id, content, status,
        is_deleted, is_pinned, replies_count, created_at, updated_at)
    VALUES (?, ?, ?, ?, ?, 'published', ?, ?, 0, ?, ?)
"#;

const THREAD_FILTER: &str = "(? IS NULL OR c.slug = ? OR c.id = ?) AND (? IS NULL OR k.slug = ?) \
     AND (? IS NULL OR t.anime_id = ?) AND (? IS NULL OR t.manga_id = ?) \
     AND (? IS NULL OR t.is_pinned = ?)";

fn thread_filter_clause(escape: &str) -> String {
    format!(
        "{} AND (? IS NULL OR t.title LIKE ? ESCAPE '{1}' OR t.content LIKE ? ESCAPE '{1}')",
        THREAD_FILTER, escape
    )
}

fn list_threads_sql(escape: &str) -> String {
    format!(
        "{} WHERE {} ORDER BY t.is_pinned DESC, t.last_activity_at DESC, t.created_at DESC, t.id DESC \
         LIMIT ? OFFSET ?",
        THREAD_SELECT,
        thread_filter_clause(escape)
    )
}

fn count_threads_sql(escape: &str) -> String {
    format!(
        "SELECT COUNT(*) AS count FROM forum_threads t \
         JOIN forum_categories c ON c.id = t.category_id \
         JOIN forum_thread_kinds k ON k.id = t.kind_id WHERE {}",
        thread_filter_clause(escape)
    )
}

/// Bind values for `thread_filter_clause`, in placeholder order
struct ThreadBinds {
    category: Option<String>,
    category_id: Option<i64>,
    kind: Option<String>,
    anime_id: Option<String>,
    manga_id: Option<i64>,
    is_pinned: Option<bool>,
    pattern: Option<String>,
}

impl ThreadBinds {
    fn from_filter(filter: &ThreadFilter) -> Self {
        let trimmed = |value: &Option<String>| {
            value
                .as_deref()
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        let category = trimmed(&filter.category);
        Self {
            category_id: category.as_deref().and_then(|c| c.parse().ok()),
            category,
            kind: trimmed(&filter.kind),
            anime_id: trimmed(&filter.anime_id),
            manga_id: filter.manga_id,
            is_pinned: filter.is_pinned,
            pattern: trimmed(&filter.q).map(|q| format!("%{}%", escape_like(&q))),
        }
    }
}

macro_rules! bind_thread_filter {
    ($query:expr, $binds:expr) => {
        $query
            .bind(&$binds.category)
            .bind(&$binds.category)
            .bind($binds.category_id)
            .bind(&$binds.kind)
            .bind(&$binds.kind)
            .bind(&$binds.anime_id)
            .bind(&$binds.anime_id)
            .bind($binds.manga_id)
            .bind($binds.manga_id)
            .bind($binds.is_pinned)
            .bind($binds.is_pinned)
            .bind(&$binds.pattern)
            .bind(&$binds.pattern)
            .bind(&$binds.pattern)
    };
}

macro_rules! bind_thread_insert {
    ($query:expr, $thread:expr, $now:expr) => {
        $query
            .bind($thread.category_id)
            .bind($thread.kind_id)
            .bind($thread.author_id)
            .bind($thread.team_id)
            .bind(&$thread.title)
            .bind(&$thread.slug)
            .bind(&$thread.content)
            .bind(&$thread.anime_id)
            .bind($thread.manga_id)
            .bind($now)
            .bind(false)
            .bind(false)
            .bind($now)
            .bind($now)
    };
}

macro_rules! bind_comment_scope {
    ($query:expr, $thread_id:expr, $parent:expr) => {
        $query
            .bind($thread_id)
            .bind($parent)
            .bind($parent)
            .bind(false)
    };
}

macro_rules! bind_kind_insert {
    ($query:expr, $input:expr, $now:expr) => {
        $query
            .bind(&$input.title)
            .bind(&$input.slug)
            .bind(&$input.description)
            .bind(true)
            .bind($input.order)
            .bind($input.allow_anime)
            .bind($input.allow_manga)
            .bind($input.allow_publish_as_team)
            .bind($now)
    };
}

macro_rules! team_from_row {
    ($row:expr) => {{
        let team_id: Option<i64> = $row.get("team_id");
        team_id.map(|id| TranslatorShort {
            id,
            name: $row.get("team_name"),
            slug: $row.get("team_slug"),
        })
    }};
}

macro_rules! category_from_row {
    ($row:expr) => {{
        let row = $row;
        ForumCategory {
            id: row.get("id"),
            title: row.get("title"),
            slug: row.get("slug"),
            is_active: row.get("is_active"),
            order: row.get("sort_order"),
            created_at: row.get("created_at"),
        }
    }};
}

macro_rules! kind_from_row {
    ($row:expr) => {{
        let row = $row;
        ThreadKind {
            id: row.get("id"),
            title: row.get("title"),
            slug: row.get("slug"),
            description: row.get("description"),
            is_active: row.get("is_active"),
            order: row.get("sort_order"),
            allow_anime: row.get("allow_anime"),
            allow_manga: row.get("allow_manga"),
            allow_publish_as_team: row.get("allow_publish_as_team"),
            created_at: row.get("created_at"),
        }
    }};
}

macro_rules! thread_from_row {
    ($row:expr) => {{
        let row = $row;
        Thread {
            id: row.get("id"),
            category: ForumRef {
                id: row.get("category_id"),
                title: row.get("category_title"),
                slug: row.get("category_slug"),
            },
            kind: ForumRef {
                id: row.get("kind_id"),
                title: row.get("kind_title"),
                slug: row.get("kind_slug"),
            },
            author: UserShort {
                id: row.get("author_id"),
                username: row.get("author_username"),
            },
            publish_as_team: team_from_row!(row),
            title: row.get("title"),
            slug: row.get("slug"),
            content: row.get("content"),
            anime_id: row.get("anime_id"),
            manga_id: row.get("manga_id"),
            comments_count: row.get("comments_count"),
            last_activity_at: row.get("last_activity_at"),
            is_locked: row.get("is_locked"),
            is_pinned: row.get("is_pinned"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }
    }};
}

macro_rules! comment_from_row {
    ($row:expr) => {{
        let row = $row;
        let status: String = row.get("status");
        Ok(Comment {
            id: row.get("id"),
            thread_id: row.get("thread_id"),
            author: UserShort {
                id: row.get("author_id"),
                username: row.get("author_username"),
            },
            publish_as_team: team_from_row!(row),
            parent_id: row.get("parent_id"),
            content: row.get("content"),
            status: status.parse()?,
            is_deleted: row.get("is_deleted"),
            is_pinned: row.get("is_pinned"),
            replies_count: row.get("replies_count"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }};
}

fn row_to_category_sqlite(row: &SqliteRow) -> ForumCategory {
    category_from_row!(row)
}

fn row_to_kind_sqlite(row: &SqliteRow) -> ThreadKind {
    kind_from_row!(row)
}

fn row_to_thread_sqlite(row: &SqliteRow) -> Thread {
    thread_from_row!(row)
}

fn row_to_comment_sqlite(row: &SqliteRow) -> Result<Comment> {
    comment_from_row!(row)
}

fn row_to_category_mysql(row: &MySqlRow) -> ForumCategory {
    category_from_row!(row)
}

fn row_to_kind_mysql(row: &MySqlRow) -> ThreadKind {
    kind_from_row!(row)
}

fn row_to_thread_mysql(row: &MySqlRow) -> Thread {
    thread_from_row!(row)
}

fn row_to_comment_mysql(row: &MySqlRow) -> Result<Comment> {
    comment_from_row!(row)
}

#[async_trait]
impl ForumRepository for SqlxForumRepository {
    async fn create_category(&self, input: &CreateCategoryInput) -> Result<ForumCategory> {
        let now = Utc::now();
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(INSERT_CATEGORY_SQL)
                .bind(&input.title)
                .bind(&input.slug)
                .bind(true)
                .bind(input.order)
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create forum category")?
                .last_insert_rowid(),
            DbBackend::Mysql(pool) => sqlx::query(INSERT_CATEGORY_SQL)
                .bind(&input.title)
                .bind(&input.slug)
                .bind(true)
                .bind(input.order)
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create forum category")?
                .last_insert_id() as i64,
        };
        Ok(ForumCategory {
            id,
            title: input.title.clone(),
            slug: input.slug.clone(),
            is_active: true,
            order: input.order,
            created_at: now,
        })
    }

    async fn categories(&self) -> Result<Vec<ForumCategory>> {
        let sql = format!(
            "SELECT {} FROM forum_categories WHERE is_active = ? ORDER BY sort_order, title",
            CATEGORY_COLUMNS
        );
        let categories = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(true)
                .fetch_all(pool)
                .await
                .context("Failed to list forum categories")?
                .iter()
                .map(row_to_category_sqlite)
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(true)
                .fetch_all(pool)
                .await
                .context("Failed to list forum categories")?
                .iter()
                .map(row_to_category_mysql)
                .collect(),
        };
        Ok(categories)
    }

    async fn get_category(&self, key: &str) -> Result<Option<ForumCategory>> {
        let sql = format!(
            "SELECT {} FROM forum_categories WHERE slug = ? OR id = ?",
            CATEGORY_COLUMNS
        );
        let id: Option<i64> = key.parse().ok();
        let category = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(key)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get forum category")?
                .as_ref()
                .map(row_to_category_sqlite),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(key)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get forum category")?
                .as_ref()
                .map(row_to_category_mysql),
        };
        Ok(category)
    }

    async fn create_kind(&self, input: &CreateKindInput) -> Result<ThreadKind> {
        let now = Utc::now();
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => bind_kind_insert!(sqlx::query(INSERT_KIND_SQL), input, now)
                .execute(pool)
                .await
                .context("Failed to create thread kind")?
                .last_insert_rowid(),
            DbBackend::Mysql(pool) => bind_kind_insert!(sqlx::query(INSERT_KIND_SQL), input, now)
                .execute(pool)
                .await
                .context("Failed to create thread kind")?
                .last_insert_id() as i64,
        };
        Ok(ThreadKind {
            id,
            title: input.title.clone(),
            slug: input.slug.clone(),
            description: input.description.clone(),
            is_active: true,
            order: input.order,
            allow_anime: input.allow_anime,
            allow_manga: input.allow_manga,
            allow_publish_as_team: input.allow_publish_as_team,
            created_at: now,
        })
    }

    async fn kinds(&self) -> Result<Vec<ThreadKind>> {
        let sql = format!(
            "SELECT {} FROM forum_thread_kinds WHERE is_active = ? ORDER BY sort_order, title",
            KIND_COLUMNS
        );
        let kinds = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(true)
                .fetch_all(pool)
                .await
                .context("Failed to list thread kinds")?
                .iter()
                .map(row_to_kind_sqlite)
                .collect(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(true)
                .fetch_all(pool)
                .await
                .context("Failed to list thread kinds")?
                .iter()
                .map(row_to_kind_mysql)
                .collect(),
        };
        Ok(kinds)
    }

    async fn get_kind(&self, slug: &str) -> Result<Option<ThreadKind>> {
        let sql = format!("SELECT {} FROM forum_thread_kinds WHERE slug = ?", KIND_COLUMNS);
        let kind = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .context("Failed to get thread kind")?
                .as_ref()
                .map(row_to_kind_sqlite),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .context("Failed to get thread kind")?
                .as_ref()
                .map(row_to_kind_mysql),
        };
        Ok(kind)
    }

    async fn thread_slug_exists(&self, slug: &str) -> Result<bool> {
        let sql = "SELECT 1 FROM forum_threads WHERE slug = ?";
        let found = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .map(|row| row.is_some()),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .map(|row| row.is_some()),
        }
        .context("Failed to check thread slug")?;
        Ok(found)
    }

    async fn create_thread(&self, thread: &NewThread) -> Result<i64> {
        let now = Utc::now();
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => bind_thread_insert!(sqlx::query(INSERT_THREAD_SQL), thread, now)
                .execute(pool)
                .await
                .context("Failed to create thread")?
                .last_insert_rowid(),
            DbBackend::Mysql(pool) => bind_thread_insert!(sqlx::query(INSERT_THREAD_SQL), thread, now)
                .execute(pool)
                .await
                .context("Failed to create thread")?
                .last_insert_id() as i64,
        };
        Ok(id)
    }

    async fn get_thread(&self, key: &str) -> Result<Option<Thread>> {
        let sql = format!("{} WHERE t.slug = ? OR t.id = ?", THREAD_SELECT);
        let id: Option<i64> = key.parse().ok();
        let thread = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(key)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get thread")?
                .as_ref()
                .map(row_to_thread_sqlite),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(key)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get thread")?
                .as_ref()
                .map(row_to_thread_mysql),
        };
        Ok(thread)
    }

    async fn list_threads(
        &self,
        filter: &ThreadFilter,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Thread>, i64)> {
        let binds = ThreadBinds::from_filter(filter);
        let offset = (page.max(1) - 1) * page_size;

        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let count_sql = count_threads_sql("\\");
                let count: i64 = bind_thread_filter!(sqlx::query(&count_sql), binds)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count threads")?
                    .get("count");
                let list_sql = list_threads_sql("\\");
                let threads = bind_thread_filter!(sqlx::query(&list_sql), binds)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list threads")?
                    .iter()
                    .map(row_to_thread_sqlite)
                    .collect();
                Ok((threads, count))
            }
            DbBackend::Mysql(pool) => {
                let count_sql = count_threads_sql("\\\\");
                let count: i64 = bind_thread_filter!(sqlx::query(&count_sql), binds)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count threads")?
                    .get("count");
                let list_sql = list_threads_sql("\\\\");
                let threads = bind_thread_filter!(sqlx::query(&list_sql), binds)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list threads")?
                    .iter()
                    .map(row_to_thread_mysql)
                    .collect();
                Ok((threads, count))
            }
        }
    }

    async fn update_thread(&self, id: i64, input: &UpdateThreadInput) -> Result<()> {
        let now = Utc::now();
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(UPDATE_THREAD_SQL)
                .bind(&input.title)
                .bind(&input.content)
                .bind(input.is_locked)
                .bind(input.is_pinned)
                .bind(now)
                .bind(id)
                .execute(pool)
                .await
                .map(|_| ()),
            DbBackend::Mysql(pool) => sqlx::query(UPDATE_THREAD_SQL)
                .bind(&input.title)
                .bind(&input.content)
                .bind(input.is_locked)
                .bind(input.is_pinned)
                .bind(now)
                .bind(id)
                .execute(pool)
                .await
                .map(|_| ()),
        }
        .context("Failed to update thread")
    }

    async fn delete_thread(&self, id: i64) -> Result<()> {
        let sql = "DELETE FROM forum_threads WHERE id = ?";
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql).bind(id).execute(pool).await.map(|_| ()),
            DbBackend::Mysql(pool) => sqlx::query(sql).bind(id).execute(pool).await.map(|_| ()),
        }
        .context("Failed to delete thread")
    }

    async fn list_comments(
        &self,
        thread_id: i64,
        parent: Option<i64>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<Comment>, i64)> {
        let count_sql = format!(
            "SELECT COUNT(*) AS count FROM forum_comments cm WHERE {}",
            COMMENT_SCOPE
        );
        let list_sql = format!(
            "{} WHERE {} ORDER BY cm.is_pinned DESC, cm.created_at, cm.id LIMIT ? OFFSET ?",
            COMMENT_SELECT, COMMENT_SCOPE
        );
        let offset = (page.max(1) - 1) * page_size;

        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let count: i64 = bind_comment_scope!(sqlx::query(&count_sql), thread_id, parent)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count comments")?
                    .get("count");
                let comments = bind_comment_scope!(sqlx::query(&list_sql), thread_id, parent)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list comments")?
                    .iter()
                    .map(row_to_comment_sqlite)
                    .collect::<Result<Vec<_>>>()?;
                Ok((comments, count))
            }
            DbBackend::Mysql(pool) => {
                let count: i64 = bind_comment_scope!(sqlx::query(&count_sql), thread_id, parent)
                    .fetch_one(pool)
                    .await
                    .context("Failed to count comments")?
                    .get("count");
                let comments = bind_comment_scope!(sqlx::query(&list_sql), thread_id, parent)
                    .bind(page_size)
                    .bind(offset)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list comments")?
                    .iter()
                    .map(row_to_comment_mysql)
                    .collect::<Result<Vec<_>>>()?;
                Ok((comments, count))
            }
        }
    }

    async fn get_comment(&self, id: i64) -> Result<Option<Comment>> {
        let sql = format!("{} WHERE cm.id = ?", COMMENT_SELECT);
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get comment")?
                .as_ref()
                .map(row_to_comment_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get comment")?
                .as_ref()
                .map(row_to_comment_mysql)
                .transpose(),
        }
    }

    async fn update_comment(&self, id: i64, content: &str) -> Result<()> {
        let sql = "UPDATE forum_comments SET content = ?, updated_at = ? WHERE id = ?";
        let now = Utc::now();
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(content)
                .bind(now)
                .bind(id)
                .execute(pool)
                .await
                .map(|_| ()),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(content)
                .bind(now)
                .bind(id)
                .execute(pool)
                .await
                .map(|_| ()),
        }
        .context("Failed to update comment")
    }
}

const COUNT_LIVE_COMMENTS_SQL: &str = "SELECT COUNT(*) AS count FROM forum_comments \
     WHERE thread_id = ? AND status = 'published' AND is_deleted = ?";

const COUNT_LIVE_REPLIES_SQL: &str = "SELECT COUNT(*) AS count FROM forum_comments \
     WHERE parent_id = ? AND status = 'published' AND is_deleted = ?";

// ============================================================================
// SQLite implementations
// ============================================================================

#[async_trait]
impl ForumTxOps for SqliteTx {
    async fn thread_lock(&mut self, thread_id: i64) -> Result<Option<bool>> {
        Ok(sqlx::query("SELECT is_locked FROM forum_threads WHERE id = ?")
            .bind(thread_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock thread")?
            .map(|row| row.get("is_locked")))
    }

    async fn comment_insert(&mut self, comment: &NewComment, now: DateTime<Utc>) -> Result<i64> {
        Ok(sqlx::query(INSERT_COMMENT_SQL)
            .bind(comment.thread_id)
            .bind(comment.author_id)
            .bind(comment.team_id)
            .bind(comment.parent_id)
            .bind(&comment.content)
            .bind(false)
            .bind(false)
            .bind(now)
            .bind(now)
            .execute(self.conn()?)
            .await
            .context("Failed to create comment")?
            .last_insert_rowid())
    }

    async fn comment_soft_delete(&mut self, comment_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE forum_comments SET is_deleted = ?, updated_at = ? WHERE id = ? AND is_deleted = ?",
        )
        .bind(true)
        .bind(now)
        .bind(comment_id)
        .bind(false)
        .execute(self.conn()?)
        .await
        .context("Failed to delete comment")?;
        Ok(result.rows_affected() > 0)
    }

    async fn thread_recount(&mut self, thread_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query(COUNT_LIVE_COMMENTS_SQL)
            .bind(thread_id)
            .bind(false)
            .fetch_one(self.conn()?)
            .await
            .context("Failed to count comments")?
            .get("count");
        sqlx::query("UPDATE forum_threads SET comments_count = ? WHERE id = ?")
            .bind(count)
            .bind(thread_id)
            .execute(self.conn()?)
            .await
            .context("Failed to store comment count")?;
        Ok(count)
    }

    async fn thread_touch(&mut self, thread_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE forum_threads SET last_activity_at = ? WHERE id = ?")
            .bind(now)
            .bind(thread_id)
            .execute(self.conn()?)
            .await
            .context("Failed to bump thread activity")?;
        Ok(())
    }

    async fn comment_recount_replies(&mut self, comment_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query(COUNT_LIVE_REPLIES_SQL)
            .bind(comment_id)
            .bind(false)
            .fetch_one(self.conn()?)
            .await
            .context("Failed to count replies")?
            .get("count");
        sqlx::query("UPDATE forum_comments SET replies_count = ? WHERE id = ?")
            .bind(count)
            .bind(comment_id)
            .execute(self.conn()?)
            .await
            .context("Failed to store reply count")?;
        Ok(count)
    }
}

// ============================================================================
// MySQL implementations
// ============================================================================

#[async_trait]
impl ForumTxOps for MysqlTx {
    async fn thread_lock(&mut self, thread_id: i64) -> Result<Option<bool>> {
        Ok(sqlx::query("SELECT is_locked FROM forum_threads WHERE id = ? FOR UPDATE")
            .bind(thread_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock thread")?
            .map(|row| row.get("is_locked")))
    }

    async fn comment_insert(&mut self, comment: &NewComment, now: DateTime<Utc>) -> Result<i64> {
        Ok(sqlx::query(INSERT_COMMENT_SQL)
            .bind(comment.thread_id)
            .bind(comment.author_id)
            .bind(comment.team_id)
            .bind(comment.parent_id)
            .bind(&comment.content)
            .bind(false)
            .bind(false)
            .bind(now)
            .bind(now)
            .execute(self.conn()?)
            .await
            .context("Failed to create comment")?
            .last_insert_id() as i64)
    }

    async fn comment_soft_delete(&mut self, comment_id: i64, now: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE forum_comments SET is_deleted = ?, updated_at = ? WHERE id = ? AND is_deleted = ?",
        )
        .bind(true)
        .bind(now)
        .bind(comment_id)
        .bind(false)
        .execute(self.conn()?)
        .await
        .context("Failed to delete comment")?;
        Ok(result.rows_affected() > 0)
    }

    async fn thread_recount(&mut self, thread_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query(COUNT_LIVE_COMMENTS_SQL)
            .bind(thread_id)
            .bind(false)
            .fetch_one(self.conn()?)
            .await
            .context("Failed to count comments")?
            .get("count");
        sqlx::query("UPDATE forum_threads SET comments_count = ? WHERE id = ?")
            .bind(count)
            .bind(thread_id)
            .execute(self.conn()?)
            .await
            .context("Failed to store comment count")?;
        Ok(count)
    }

    async fn thread_touch(&mut self, thread_id: i64, now: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE forum_threads SET last_activity_at = ? WHERE id = ?")
            .bind(now)
            .bind(thread_id)
            .execute(self.conn()?)
            .await
            .context("Failed to bump thread activity")?;
        Ok(())
    }

    async fn comment_recount_replies(&mut self, comment_id: i64) -> Result<i64> {
        let count: i64 = sqlx::query(COUNT_LIVE_REPLIES_SQL)
            .bind(comment_id)
            .bind(false)
            .fetch_one(self.conn()?)
            .await
            .context("Failed to count replies")?
            .get("count");
        sqlx::query("UPDATE forum_comments SET replies_count = ? WHERE id = ?")
            .bind(count)
            .bind(comment_id)
            .execute(self.conn()?)
            .await
            .context("Failed to store reply count")?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_pool};

    struct Fixture {
        pool: DynDatabasePool,
        repo: SqlxForumRepository,
        category_id: i64,
        kind_id: i64,
        aki: i64,
    }

    async fn setup() -> Fixture {
        let pool = migrated_pool().await;
        let repo = SqlxForumRepository::new(pool.clone());
        let category = repo
            .create_category(&CreateCategoryInput {
                title: "News".into(),
                slug: "news".into(),
                order: 10,
            })
            .await
            .unwrap();
        let kind_input: CreateKindInput = serde_json::from_value(serde_json::json!({
            "title": "Discussion",
            "slug": "discussion",
        }))
        .unwrap();
        let kind = repo.create_kind(&kind_input).await.unwrap();
        let aki = insert_user(&pool, "aki").await;
        Fixture {
            pool,
            repo,
            category_id: category.id,
            kind_id: kind.id,
            aki,
        }
    }

    fn new_thread(f: &Fixture, title: &str) -> NewThread {
        NewThread {
            category_id: f.category_id,
            kind_id: f.kind_id,
            author_id: f.aki,
            team_id: None,
            title: title.to_string(),
            slug: title.to_lowercase().replace(' ', "-"),
            content: format!("{} body", title),
            anime_id: None,
            manga_id: None,
        }
    }

    async fn add_comment(f: &Fixture, thread_id: i64, parent_id: Option<i64>, text: &str) -> i64 {
        let mut tx = f.pool.begin().await.unwrap();
        let id = tx
            .comment_insert(
                &NewComment {
                    thread_id,
                    author_id: f.aki,
                    team_id: None,
                    parent_id,
                    content: text.to_string(),
                },
                Utc::now(),
            )
            .await
            .unwrap();
        tx.thread_recount(thread_id).await.unwrap();
        if let Some(parent) = parent_id {
            tx.comment_recount_replies(parent).await.unwrap();
        }
        tx.commit().await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_categories_and_kinds() {
        let f = setup().await;
        let by_slug = f.repo.get_category("news").await.unwrap().unwrap();
        let by_id = f.repo.get_category(&f.category_id.to_string()).await.unwrap().unwrap();
        assert_eq!(by_slug.id, by_id.id);
        assert!(f.repo.get_category("missing").await.unwrap().is_none());
        assert_eq!(f.repo.categories().await.unwrap().len(), 1);

        let kind = f.repo.get_kind("discussion").await.unwrap().unwrap();
        assert!(kind.allow_publish_as_team);
        assert!(!kind.allow_anime);
        assert_eq!(f.repo.kinds().await.unwrap()[0].order, 100);

        // Titles are unique
        assert!(f
            .repo
            .create_category(&CreateCategoryInput {
                title: "News".into(),
                slug: "news-2".into(),
                order: 1,
            })
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_threads_filter_and_order() {
        let f = setup().await;
        let first = f.repo.create_thread(&new_thread(&f, "First post")).await.unwrap();
        let second = f.repo.create_thread(&new_thread(&f, "Second post")).await.unwrap();
        assert!(f.repo.thread_slug_exists("first-post").await.unwrap());
        assert!(!f.repo.thread_slug_exists("third-post").await.unwrap());

        let thread = f.repo.get_thread("first-post").await.unwrap().unwrap();
        assert_eq!(thread.id, first);
        assert_eq!(thread.category.slug, "news");
        assert_eq!(thread.author.username, "aki");
        assert!(thread.publish_as_team.is_none());
        assert!(f.repo.get_thread(&second.to_string()).await.unwrap().is_some());

        let pin = UpdateThreadInput { is_pinned: Some(true), ..Default::default() };
        f.repo.update_thread(first, &pin).await.unwrap();
        let (threads, count) = f.repo.list_threads(&ThreadFilter::default(), 1, 10).await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(threads[0].id, first);
        assert_eq!(threads[0].title, "First post");

        let by_category = ThreadFilter { category: Some(f.category_id.to_string()), ..Default::default() };
        assert_eq!(f.repo.list_threads(&by_category, 1, 10).await.unwrap().1, 2);
        let by_text = ThreadFilter { q: Some("second".into()), ..Default::default() };
        let (found, _) = f.repo.list_threads(&by_text, 1, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, second);
        let by_kind = ThreadFilter { kind: Some("news".into()), ..Default::default() };
        assert_eq!(f.repo.list_threads(&by_kind, 1, 10).await.unwrap().1, 0);

        f.repo.delete_thread(second).await.unwrap();
        assert!(f.repo.get_thread("second-post").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_comment_counters() {
        let f = setup().await;
        let thread_id = f.repo.create_thread(&new_thread(&f, "Counters")).await.unwrap();
        let root = add_comment(&f, thread_id, None, "root").await;
        add_comment(&f, thread_id, Some(root), "reply one").await;
        let reply = add_comment(&f, thread_id, Some(root), "reply two").await;

        let thread = f.repo.get_thread("counters").await.unwrap().unwrap();
        assert_eq!(thread.comments_count, 3);
        assert_eq!(f.repo.get_comment(root).await.unwrap().unwrap().replies_count, 2);

        let (top, count) = f.repo.list_comments(thread_id, None, 1, 10).await.unwrap();
        assert_eq!(count, 1);
        assert_eq!(top[0].id, root);
        let (replies, _) = f.repo.list_comments(thread_id, Some(root), 1, 10).await.unwrap();
        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].content, "reply one");

        let mut tx = f.pool.begin().await.unwrap();
        assert!(tx.comment_soft_delete(reply, Utc::now()).await.unwrap());
        assert!(!tx.comment_soft_delete(reply, Utc::now()).await.unwrap());
        assert_eq!(tx.thread_recount(thread_id).await.unwrap(), 2);
        assert_eq!(tx.comment_recount_replies(root).await.unwrap(), 1);
        tx.commit().await.unwrap();

        // A deleted leaf disappears from the listing
        let (replies, _) = f.repo.list_comments(thread_id, Some(root), 1, 10).await.unwrap();
        assert_eq!(replies.len(), 1);

        // A deleted comment with replies stays
        let mut tx = f.pool.begin().await.unwrap();
        tx.comment_soft_delete(root, Utc::now()).await.unwrap();
        tx.commit().await.unwrap();
        let (top, _) = f.repo.list_comments(thread_id, None, 1, 10).await.unwrap();
        assert!(top[0].is_deleted);

        let mut tx = f.pool.begin().await.unwrap();
        assert_eq!(tx.thread_lock(thread_id).await.unwrap(), Some(false));
        assert_eq!(tx.thread_lock(thread_id + 100).await.unwrap(), None);
        tx.commit().await.unwrap();
    }
}
