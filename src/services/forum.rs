//! Forum service
//!
//! Threads live in a category and have a kind; the kind decides what a
//! thread may link to. Authors edit and delete their own threads and
//! comments, staff edit and delete any, and only staff lock or pin.
//! Comment writes keep the thread's counters and activity time in the same
//! transaction.

use crate::db::repositories::{ForumRepository, MangaRepository, MaterialRepository};
use crate::db::{DbTx, DynDatabasePool};
use crate::models::{
    clamp_page, slugify_or, Comment, CreateCategoryInput, CreateCommentInput, CreateKindInput,
    CreateThreadInput, ForumCategory, NewComment, NewThread, PagedResult, Thread, ThreadFilter,
    ThreadKind, UpdateThreadInput, User, THREAD_SLUG_MAX_LEN, THREAD_TITLE_MAX_LEN,
};
use chrono::Utc;
use std::sync::Arc;

/// Longest comment body in characters
pub const COMMENT_MAX_LEN: usize = 10_000;

/// Suffixes tried before falling back to a random one
const SLUG_ATTEMPTS: usize = 50;

#[derive(Debug, thiserror::Error)]
pub enum ForumError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub struct ForumService {
    pool: DynDatabasePool,
    forum_repo: Arc<dyn ForumRepository>,
    manga_repo: Arc<dyn MangaRepository>,
    material_repo: Arc<dyn MaterialRepository>,
}

impl ForumService {
    pub fn new(
        pool: DynDatabasePool,
        forum_repo: Arc<dyn ForumRepository>,
        manga_repo: Arc<dyn MangaRepository>,
        material_repo: Arc<dyn MaterialRepository>,
    ) -> Self {
        Self {
            pool,
            forum_repo,
            manga_repo,
            material_repo,
        }
    }

    pub async fn categories(&self) -> Result<Vec<ForumCategory>, ForumError> {
        Ok(self.forum_repo.categories().await?)
    }

    pub async fn kinds(&self) -> Result<Vec<ThreadKind>, ForumError> {
        Ok(self.forum_repo.kinds().await?)
    }

    /// Admin: add a category
    pub async fn create_category(
        &self,
        mut input: CreateCategoryInput,
    ) -> Result<ForumCategory, ForumError> {
        input.title = input.title.trim().to_string();
        if input.title.is_empty() {
            return Err(ForumError::Validation("title is required".to_string()));
        }
        input.slug = normalized_slug(&input.slug, &input.title, "category");
        if self.forum_repo.get_category(&input.slug).await?.is_some() {
            return Err(ForumError::Conflict(format!(
                "Slug '{}' is already taken",
                input.slug
            )));
        }
        let category = self.forum_repo.create_category(&input).await?;
        tracing::info!(category_id = category.id, slug = %category.slug, "Forum category created");
        Ok(category)
    }

    /// Admin: add a thread kind
    pub async fn create_kind(&self, mut input: CreateKindInput) -> Result<ThreadKind, ForumError> {
        input.title = input.title.trim().to_string();
        if input.title.is_empty() {
            return Err(ForumError::Validation("title is required".to_string()));
        }
        input.slug = normalized_slug(&input.slug, &input.title, "kind");
        if self.forum_repo.get_kind(&input.slug).await?.is_some() {
            return Err(ForumError::Conflict(format!(
                "Slug '{}' is already taken",
                input.slug
            )));
        }
        let kind = self.forum_repo.create_kind(&input).await?;
        tracing::info!(kind_id = kind.id, slug = %kind.slug, "Thread kind created");
        Ok(kind)
    }

    pub async fn list_threads(
        &self,
        filter: &ThreadFilter,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<PagedResult<Thread>, ForumError> {
        let (page, page_size) = clamp_page(page, page_size, 20);
        let (threads, count) = self.forum_repo.list_threads(filter, page, page_size).await?;
        Ok(PagedResult::new(threads, page, page_size, count))
    }

    /// Thread by id or slug
    pub async fn get_thread(&self, key: &str) -> Result<Thread, ForumError> {
        self.forum_repo
            .get_thread(key)
            .await?
            .ok_or_else(|| ForumError::NotFound("Thread not found".to_string()))
    }

    pub async fn create_thread(
        &self,
        actor: &User,
        input: CreateThreadInput,
    ) -> Result<Thread, ForumError> {
        let title = validate_title(&input.title)?;
        let content = input.content.trim().to_string();
        if content.is_empty() {
            return Err(ForumError::Validation("content is required".to_string()));
        }

        let category = self
            .forum_repo
            .get_category(input.category.trim())
            .await?
            .filter(|c| c.is_active)
            .ok_or_else(|| ForumError::NotFound("Category not found".to_string()))?;
        let kind = self
            .forum_repo
            .get_kind(input.kind.trim())
            .await?
            .filter(|k| k.is_active)
            .ok_or_else(|| ForumError::NotFound("Thread kind not found".to_string()))?;

        let anime_id = input
            .anime_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty());
        if let Some(anime_id) = &anime_id {
            if !kind.allow_anime {
                return Err(ForumError::Validation(format!(
                    "Threads of kind '{}' cannot link an anime",
                    kind.slug
                )));
            }
            if self.material_repo.get(anime_id).await?.is_none() {
                return Err(ForumError::NotFound("Anime not found".to_string()));
            }
        }
        if let Some(manga_id) = input.manga_id {
            if !kind.allow_manga {
                return Err(ForumError::Validation(format!(
                    "Threads of kind '{}' cannot link a manga",
                    kind.slug
                )));
            }
            if !self.manga_repo.manga_exists(manga_id).await? {
                return Err(ForumError::NotFound("Manga not found".to_string()));
            }
        }
        let team_id = match input.publish_as_team.as_deref().map(str::trim) {
            Some(team) if !team.is_empty() => {
                if !kind.allow_publish_as_team {
                    return Err(ForumError::Validation(format!(
                        "Threads of kind '{}' cannot be posted as a team",
                        kind.slug
                    )));
                }
                Some(self.team_for(actor, team).await?)
            }
            _ => None,
        };

        let slug = self.unique_slug(&title).await?;
        let id = self
            .forum_repo
            .create_thread(&NewThread {
                category_id: category.id,
                kind_id: kind.id,
                author_id: actor.id,
                team_id,
                title,
                slug,
                content,
                anime_id,
                manga_id: input.manga_id,
            })
            .await?;
        tracing::info!(thread_id = id, author_id = actor.id, category_id = category.id, "Thread created");
        self.get_thread(&id.to_string()).await
    }

    pub async fn update_thread(
        &self,
        actor: &User,
        key: &str,
        mut input: UpdateThreadInput,
    ) -> Result<Thread, ForumError> {
        let thread = self.get_thread(key).await?;
        ensure_author_or_staff(actor, thread.author.id)?;
        if (input.is_locked.is_some() || input.is_pinned.is_some()) && !actor.is_staff() {
            return Err(ForumError::Forbidden(
                "Only moderators lock or pin threads".to_string(),
            ));
        }
        if let Some(title) = &input.title {
            input.title = Some(validate_title(title)?);
        }
        if let Some(content) = &input.content {
            let content = content.trim().to_string();
            if content.is_empty() {
                return Err(ForumError::Validation("content is required".to_string()));
            }
            input.content = Some(content);
        }

        self.forum_repo.update_thread(thread.id, &input).await?;
        self.get_thread(&thread.id.to_string()).await
    }

    pub async fn delete_thread(&self, actor: &User, key: &str) -> Result<(), ForumError> {
        let thread = self.get_thread(key).await?;
        ensure_author_or_staff(actor, thread.author.id)?;
        self.forum_repo.delete_thread(thread.id).await?;
        tracing::info!(thread_id = thread.id, user_id = actor.id, "Thread deleted");
        Ok(())
    }

    /// Top-level comments, or the replies to `parent`
    pub async fn list_comments(
        &self,
        key: &str,
        parent: Option<i64>,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<PagedResult<Comment>, ForumError> {
        let thread = self.get_thread(key).await?;
        let (page, page_size) = clamp_page(page, page_size, 50);
        let (comments, count) = self
            .forum_repo
            .list_comments(thread.id, parent, page, page_size)
            .await?;
        let comments = comments.into_iter().map(Comment::redacted).collect();
        Ok(PagedResult::new(comments, page, page_size, count))
    }

    /// Post a comment. A reply to a reply is attached to the top-level
    /// comment, so threads nest one level.
    pub async fn create_comment(
        &self,
        actor: &User,
        key: &str,
        input: CreateCommentInput,
    ) -> Result<Comment, ForumError> {
        let content = validate_comment(&input.content)?;
        let thread = self.get_thread(key).await?;

        let parent_id = match input.parent_id {
            Some(parent_id) => {
                let parent = self
                    .forum_repo
                    .get_comment(parent_id)
                    .await?
                    .filter(|c| c.thread_id == thread.id && !c.is_deleted)
                    .ok_or_else(|| ForumError::NotFound("Comment not found".to_string()))?;
                Some(parent.parent_id.unwrap_or(parent.id))
            }
            None => None,
        };
        let team_id = match input.publish_as_team.as_deref().map(str::trim) {
            Some(team) if !team.is_empty() => {
                let kind = self.forum_repo.get_kind(&thread.kind.slug).await?;
                if !kind.is_some_and(|k| k.allow_publish_as_team) {
                    return Err(ForumError::Validation(
                        "Comments in this thread cannot be posted as a team".to_string(),
                    ));
                }
                Some(self.team_for(actor, team).await?)
            }
            _ => None,
        };

        let comment = NewComment {
            thread_id: thread.id,
            author_id: actor.id,
            team_id,
            parent_id,
            content,
        };
        let mut tx = self.pool.begin().await?;
        let id = comment_in(tx.as_mut(), &comment, actor.is_staff()).await?;
        tx.commit().await?;

        tracing::info!(comment_id = id, thread_id = thread.id, author_id = actor.id, "Comment posted");
        self.comment(id).await
    }

    pub async fn update_comment(
        &self,
        actor: &User,
        id: i64,
        content: &str,
    ) -> Result<Comment, ForumError> {
        let content = validate_comment(content)?;
        let comment = self.comment(id).await?;
        if comment.is_deleted {
            return Err(ForumError::NotFound("Comment not found".to_string()));
        }
        ensure_author_or_staff(actor, comment.author.id)?;
        self.forum_repo.update_comment(id, &content).await?;
        self.comment(id).await
    }

    /// Soft-delete a comment; its replies stay
    pub async fn delete_comment(&self, actor: &User, id: i64) -> Result<(), ForumError> {
        let comment = self.comment(id).await?;
        ensure_author_or_staff(actor, comment.author.id)?;

        let mut tx = self.pool.begin().await?;
        if !tx.comment_soft_delete(id, Utc::now()).await? {
            return Err(ForumError::NotFound("Comment not found".to_string()));
        }
        tx.thread_recount(comment.thread_id).await?;
        if let Some(parent_id) = comment.parent_id {
            tx.comment_recount_replies(parent_id).await?;
        }
        tx.commit().await?;

        tracing::info!(comment_id = id, user_id = actor.id, "Comment deleted");
        Ok(())
    }

    async fn comment(&self, id: i64) -> Result<Comment, ForumError> {
        self.forum_repo
            .get_comment(id)
            .await?
            .map(Comment::redacted)
            .ok_or_else(|| ForumError::NotFound("Comment not found".to_string()))
    }

    /// Id of a team the actor is an active member of
    async fn team_for(&self, actor: &User, slug: &str) -> Result<i64, ForumError> {
        let translator = self
            .manga_repo
            .get_translator(slug)
            .await?
            .ok_or_else(|| ForumError::NotFound("Translator not found".to_string()))?;
        let active = self
            .manga_repo
            .member(translator.id, actor.id)
            .await?
            .is_some_and(|m| m.is_active);
        if !active {
            return Err(ForumError::Forbidden(
                "You are not an active member of this team".to_string(),
            ));
        }
        Ok(translator.id)
    }

    async fn unique_slug(&self, title: &str) -> Result<String, ForumError> {
        let base: String = slugify_or(title, "thread")
            .chars()
            .take(THREAD_SLUG_MAX_LEN - 8)
            .collect();
        let base = base.trim_end_matches('-').to_string();
        if !self.forum_repo.thread_slug_exists(&base).await? {
            return Ok(base);
        }
        for n in 2..SLUG_ATTEMPTS + 2 {
            let candidate = format!("{}-{}", base, n);
            if !self.forum_repo.thread_slug_exists(&candidate).await? {
                return Ok(candidate);
            }
        }
        let id = uuid::Uuid::new_v4().simple().to_string();
        Ok(format!("{}-{}", base, &id[..6]))
    }
}

async fn comment_in(
    tx: &mut dyn DbTx,
    comment: &NewComment,
    is_staff: bool,
) -> Result<i64, ForumError> {
    let locked = tx
        .thread_lock(comment.thread_id)
        .await?
        .ok_or_else(|| ForumError::NotFound("Thread not found".to_string()))?;
    if locked && !is_staff {
        return Err(ForumError::Forbidden("Thread is locked".to_string()));
    }

    let now = Utc::now();
    let id = tx.comment_insert(comment, now).await?;
    tx.thread_recount(comment.thread_id).await?;
    tx.thread_touch(comment.thread_id, now).await?;
    if let Some(parent_id) = comment.parent_id {
        tx.comment_recount_replies(parent_id).await?;
    }
    Ok(id)
}

fn normalized_slug(slug: &str, title: &str, fallback_prefix: &str) -> String {
    let slug = slug.trim().to_lowercase();
    if slug.is_empty() {
        slugify_or(title, fallback_prefix)
    } else {
        slug
    }
}

fn validate_title(title: &str) -> Result<String, ForumError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(ForumError::Validation("title is required".to_string()));
    }
    if title.chars().count() > THREAD_TITLE_MAX_LEN {
        return Err(ForumError::Validation(format!(
            "title must be at most {} characters",
            THREAD_TITLE_MAX_LEN
        )));
    }
    Ok(title.to_string())
}

fn validate_comment(content: &str) -> Result<String, ForumError> {
    let content = content.trim();
    if content.is_empty() {
        return Err(ForumError::Validation("Comment cannot be empty".to_string()));
    }
    if content.chars().count() > COMMENT_MAX_LEN {
        return Err(ForumError::Validation(format!(
            "Comment must be at most {} characters",
            COMMENT_MAX_LEN
        )));
    }
    Ok(content.to_string())
}

fn ensure_author_or_staff(actor: &User, author_id: i64) -> Result<(), ForumError> {
    if actor.id == author_id || actor.is_staff() {
        Ok(())
    } else {
        Err(ForumError::Forbidden(
            "Only the author or a moderator can do this".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_file_pool, migrated_pool};
    use crate::db::repositories::{
        SqlxForumRepository, SqlxMangaRepository, SqlxMaterialRepository, SqlxUserRepository,
        UserRepository,
    };
    use crate::models::{CreateTranslatorInput, KodikItem, UserRole};
    use crate::services::MangaService;

    struct Fixture {
        pool: DynDatabasePool,
        forum: ForumService,
        aki: User,
        rin: User,
        moderator: User,
    }

    async fn user(pool: &DynDatabasePool, name: &str, role: UserRole) -> User {
        let id = insert_user(pool, name).await;
        let repo = SqlxUserRepository::new(pool.clone());
        let mut user = repo.get_by_id(id).await.unwrap().unwrap();
        if role != UserRole::User {
            user.role = role;
            repo.update(&user).await.unwrap();
        }
        user
    }

    fn forum_for(pool: &DynDatabasePool) -> ForumService {
        ForumService::new(
            pool.clone(),
            SqlxForumRepository::boxed(pool.clone()),
            SqlxMangaRepository::boxed(pool.clone()),
            SqlxMaterialRepository::boxed(pool.clone()),
        )
    }

    async fn setup_with(pool: DynDatabasePool) -> Fixture {
        let forum = forum_for(&pool);
        forum
            .create_category(CreateCategoryInput {
                title: "Anime".into(),
                slug: String::new(),
                order: 1,
            })
            .await
            .unwrap();
        let review: CreateKindInput = serde_json::from_value(serde_json::json!({
            "title": "Review",
            "allow_anime": true,
        }))
        .unwrap();
        forum.create_kind(review).await.unwrap();
        let chat: CreateKindInput = serde_json::from_value(serde_json::json!({
            "title": "Chatter",
            "allow_publish_as_team": false,
        }))
        .unwrap();
        forum.create_kind(chat).await.unwrap();

        let aki = user(&pool, "aki", UserRole::User).await;
        let rin = user(&pool, "rin", UserRole::User).await;
        let moderator = user(&pool, "mori", UserRole::Moderator).await;
        Fixture {
            pool,
            forum,
            aki,
            rin,
            moderator,
        }
    }

    async fn setup() -> Fixture {
        setup_with(migrated_pool().await).await
    }

    fn thread_input(title: &str, kind: &str) -> CreateThreadInput {
        CreateThreadInput {
            category: "anime".into(),
            kind: kind.into(),
            title: title.into(),
            content: "First!".into(),
            anime_id: None,
            manga_id: None,
            publish_as_team: None,
        }
    }

    fn comment(content: &str, parent_id: Option<i64>) -> CreateCommentInput {
        CreateCommentInput {
            content: content.into(),
            parent_id,
            publish_as_team: None,
        }
    }

    #[tokio::test]
    async fn test_thread_slugs_are_unique() {
        let f = setup().await;
        let first = f.forum.create_thread(&f.aki, thread_input("Best of 2024", "review")).await.unwrap();
        let second = f.forum.create_thread(&f.rin, thread_input("Best of 2024", "review")).await.unwrap();
        let third = f.forum.create_thread(&f.rin, thread_input("Best of 2024", "chatter")).await.unwrap();
        assert_eq!(first.slug, "best-of-2024");
        assert_eq!(second.slug, "best-of-2024-2");
        assert_eq!(third.slug, "best-of-2024-3");
        assert_eq!(first.category.slug, "anime");

        let long = "x".repeat(THREAD_TITLE_MAX_LEN);
        let created = f.forum.create_thread(&f.aki, thread_input(&long, "review")).await.unwrap();
        assert!(created.slug.len() <= THREAD_SLUG_MAX_LEN);
        let too_long = "x".repeat(THREAD_TITLE_MAX_LEN + 1);
        assert!(matches!(
            f.forum.create_thread(&f.aki, thread_input(&too_long, "review")).await.unwrap_err(),
            ForumError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_kind_gates_links() {
        let f = setup().await;
        let material: KodikItem = serde_json::from_value(serde_json::json!({
            "id": "serial-1",
            "type": "anime-serial",
            "title": "Frieren",
            "title_orig": "Sousou no Frieren",
        }))
        .unwrap();
        SqlxMaterialRepository::new(f.pool.clone())
            .upsert(&material.into_material(Utc::now()))
            .await
            .unwrap();

        let review = CreateThreadInput {
            anime_id: Some("serial-1".into()),
            ..thread_input("Frieren review", "review")
        };
        let thread = f.forum.create_thread(&f.aki, review).await.unwrap();
        assert_eq!(thread.anime_id.as_deref(), Some("serial-1"));

        let chatter = CreateThreadInput {
            anime_id: Some("serial-1".into()),
            ..thread_input("Frieren chat", "chatter")
        };
        assert!(matches!(
            f.forum.create_thread(&f.aki, chatter).await.unwrap_err(),
            ForumError::Validation(_)
        ));

        let missing = CreateThreadInput {
            anime_id: Some("serial-404".into()),
            ..thread_input("Lost", "review")
        };
        assert!(matches!(
            f.forum.create_thread(&f.aki, missing).await.unwrap_err(),
            ForumError::NotFound(_)
        ));

        let manga = CreateThreadInput {
            manga_id: Some(1),
            ..thread_input("Manga", "review")
        };
        assert!(matches!(
            f.forum.create_thread(&f.aki, manga).await.unwrap_err(),
            ForumError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_posting_as_team_needs_membership() {
        let f = setup().await;
        let manga = MangaService::new(
            f.pool.clone(),
            SqlxMangaRepository::boxed(f.pool.clone()),
            SqlxUserRepository::boxed(f.pool.clone()),
        );
        let team: CreateTranslatorInput =
            serde_json::from_value(serde_json::json!({"name": "Night Owls"})).unwrap();
        manga.create_translator(f.aki.id, team).await.unwrap();

        let as_team = CreateThreadInput {
            publish_as_team: Some("night-owls".into()),
            ..thread_input("Recruiting", "review")
        };
        let thread = f.forum.create_thread(&f.aki, as_team.clone()).await.unwrap();
        assert_eq!(thread.publish_as_team.unwrap().slug, "night-owls");

        assert!(matches!(
            f.forum.create_thread(&f.rin, as_team).await.unwrap_err(),
            ForumError::Forbidden(_)
        ));
        let not_allowed = CreateThreadInput {
            publish_as_team: Some("night-owls".into()),
            ..thread_input("Chat", "chatter")
        };
        assert!(matches!(
            f.forum.create_thread(&f.aki, not_allowed).await.unwrap_err(),
            ForumError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_comments_update_counters_and_nest_one_level() {
        let f = setup().await;
        let thread = f.forum.create_thread(&f.aki, thread_input("Talk", "review")).await.unwrap();
        let key = thread.slug.clone();

        let root = f.forum.create_comment(&f.rin, &key, comment("hello", None)).await.unwrap();
        let reply = f.forum.create_comment(&f.aki, &key, comment("hi", Some(root.id))).await.unwrap();
        let nested = f
            .forum
            .create_comment(&f.rin, &key, comment("hey", Some(reply.id)))
            .await
            .unwrap();
        assert_eq!(nested.parent_id, Some(root.id));

        let thread_now = f.forum.get_thread(&key).await.unwrap();
        assert_eq!(thread_now.comments_count, 3);
        assert!(thread_now.last_activity_at >= thread.last_activity_at);
        let top = f.forum.list_comments(&key, None, None, None).await.unwrap();
        assert_eq!(top.count, 1);
        assert_eq!(top.results[0].replies_count, 2);

        assert!(matches!(
            f.forum.create_comment(&f.rin, &key, comment("   ", None)).await.unwrap_err(),
            ForumError::Validation(_)
        ));
        let other = f.forum.create_thread(&f.aki, thread_input("Other", "review")).await.unwrap();
        assert!(matches!(
            f.forum
                .create_comment(&f.rin, &other.slug, comment("x", Some(root.id)))
                .await
                .unwrap_err(),
            ForumError::NotFound(_)
        ));

        // Only the author or staff edit and delete
        assert!(matches!(
            f.forum.update_comment(&f.aki, root.id, "edited").await.unwrap_err(),
            ForumError::Forbidden(_)
        ));
        let edited = f.forum.update_comment(&f.rin, root.id, "edited").await.unwrap();
        assert_eq!(edited.content, "edited");
        f.forum.delete_comment(&f.moderator, root.id).await.unwrap();

        let top = f.forum.list_comments(&key, None, None, None).await.unwrap();
        assert!(top.results[0].is_deleted);
        assert!(top.results[0].content.is_empty());
        assert_eq!(f.forum.get_thread(&key).await.unwrap().comments_count, 2);
        assert!(matches!(
            f.forum.delete_comment(&f.rin, root.id).await.unwrap_err(),
            ForumError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_lock_and_pin_are_for_staff() {
        let f = setup().await;
        let thread = f.forum.create_thread(&f.aki, thread_input("Rules", "review")).await.unwrap();
        let lock = UpdateThreadInput { is_locked: Some(true), ..Default::default() };

        assert!(matches!(
            f.forum.update_thread(&f.aki, &thread.slug, lock.clone()).await.unwrap_err(),
            ForumError::Forbidden(_)
        ));
        let locked = f.forum.update_thread(&f.moderator, &thread.slug, lock).await.unwrap();
        assert!(locked.is_locked);

        assert!(matches!(
            f.forum.create_comment(&f.rin, &thread.slug, comment("late", None)).await.unwrap_err(),
            ForumError::Forbidden(_)
        ));
        f.forum
            .create_comment(&f.moderator, &thread.slug, comment("Locked", None))
            .await
            .unwrap();

        let retitle = UpdateThreadInput { title: Some(" House rules ".into()), ..Default::default() };
        assert!(matches!(
            f.forum.update_thread(&f.rin, &thread.slug, retitle.clone()).await.unwrap_err(),
            ForumError::Forbidden(_)
        ));
        let renamed = f.forum.update_thread(&f.aki, &thread.slug, retitle).await.unwrap();
        assert_eq!(renamed.title, "House rules");
        assert_eq!(renamed.slug, "rules");

        f.forum.delete_thread(&f.aki, "rules").await.unwrap();
        assert!(matches!(
            f.forum.get_thread("rules").await.unwrap_err(),
            ForumError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_concurrent_comments_keep_count() {
        let (_dir, pool) = migrated_file_pool().await;
        let f = setup_with(pool).await;
        let thread = f.forum.create_thread(&f.aki, thread_input("Busy", "review")).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..8 {
            let forum = forum_for(&f.pool);
            let author = if n % 2 == 0 { f.aki.clone() } else { f.rin.clone() };
            let key = thread.slug.clone();
            handles.push(tokio::spawn(async move {
                forum
                    .create_comment(&author, &key, comment(&format!("comment {}", n), None))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(f.forum.get_thread(&thread.slug).await.unwrap().comments_count, 8);
    }
}
