//! Manga service
//!
//! Titles are created by admins. Translator teams are created by any user,
//! who becomes the owner. A team publishes a title through its edition;
//! chapter and page writes need an active member with a publishing role,
//! or site staff.

use crate::db::repositories::{MangaRepository, UserRepository};
use crate::db::{DbTx, DynDatabasePool};
use crate::models::{
    clamp_page, Chapter, ChapterDetail, ChapterInput, ChapterPage, CreateEditionInput,
    CreateMangaInput, CreateTranslatorInput, Edition, Manga, MangaDetail, MangaFilter, MangaTag,
    MemberInput, MemberRole, PageOrder, PagedResult, TagKind, Translator, TranslatorMember, User,
    MANGA_YEAR_RANGE, MAX_CHAPTER_NUMBER,
};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Most pages accepted in one upload
pub const MAX_PAGES_PER_UPLOAD: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum MangaError {
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

pub struct MangaService {
    pool: DynDatabasePool,
    manga_repo: Arc<dyn MangaRepository>,
    user_repo: Arc<dyn UserRepository>,
}

impl MangaService {
    pub fn new(
        pool: DynDatabasePool,
        manga_repo: Arc<dyn MangaRepository>,
        user_repo: Arc<dyn UserRepository>,
    ) -> Self {
        Self {
            pool,
            manga_repo,
            user_repo,
        }
    }

    pub async fn list_mangas(
        &self,
        filter: &MangaFilter,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<PagedResult<Manga>, MangaError> {
        let (page, page_size) = clamp_page(page, page_size, 20);
        let (mangas, count) = self.manga_repo.list_mangas(filter, page, page_size).await?;
        Ok(PagedResult::new(mangas, page, page_size, count))
    }

    pub async fn get_manga(&self, slug: &str) -> Result<Manga, MangaError> {
        self.manga_repo
            .get_manga(slug)
            .await?
            .ok_or_else(|| MangaError::NotFound("Manga not found".to_string()))
    }

    /// Title with every edition and its chapters
    pub async fn get_manga_full(&self, slug: &str) -> Result<MangaDetail, MangaError> {
        let manga = self.get_manga(slug).await?;
        let mut editions = self.manga_repo.editions(manga.id).await?;
        for edition in &mut editions {
            edition.chapters = Some(self.manga_repo.chapters(edition.id).await?);
        }
        Ok(MangaDetail { manga, editions })
    }

    pub async fn tags(&self, kind: TagKind) -> Result<Vec<MangaTag>, MangaError> {
        Ok(self.manga_repo.tags(kind).await?)
    }

    /// Admin: create a title, creating missing genres and categories
    pub async fn create_manga(&self, mut input: CreateMangaInput) -> Result<Manga, MangaError> {
        input.normalize();
        if input.title_ru.is_empty() {
            return Err(MangaError::Validation("title_ru is required".to_string()));
        }
        if let Some(year) = input.year {
            if year < MANGA_YEAR_RANGE.0 || year > MANGA_YEAR_RANGE.1 {
                return Err(MangaError::Validation(format!(
                    "year must be between {} and {}",
                    MANGA_YEAR_RANGE.0, MANGA_YEAR_RANGE.1
                )));
            }
        }
        if input.links.iter().any(|link| !is_http_url(&link.url)) {
            return Err(MangaError::Validation(
                "Links must be http(s) URLs".to_string(),
            ));
        }
        if self.manga_repo.get_manga(&input.slug).await?.is_some() {
            return Err(MangaError::Conflict(format!(
                "Slug '{}' is already taken",
                input.slug
            )));
        }

        let mut tx = self.pool.begin().await?;
        let id = tx.manga_insert(&input, Utc::now()).await?;
        tx.manga_tags_link(id, TagKind::Genre, &input.genre_tags())
            .await?;
        tx.manga_tags_link(id, TagKind::Category, &input.category_tags())
            .await?;
        tx.commit().await?;

        tracing::info!(manga_id = id, slug = %input.slug, "Manga created");
        self.get_manga(&input.slug).await
    }

    pub async fn list_translators(&self) -> Result<Vec<Translator>, MangaError> {
        Ok(self.manga_repo.list_translators().await?)
    }

    pub async fn get_translator(&self, slug: &str) -> Result<Translator, MangaError> {
        self.manga_repo
            .get_translator(slug)
            .await?
            .ok_or_else(|| MangaError::NotFound("Translator not found".to_string()))
    }

    pub async fn members(&self, slug: &str) -> Result<Vec<TranslatorMember>, MangaError> {
        let translator = self.get_translator(slug).await?;
        Ok(self.manga_repo.members(translator.id).await?)
    }

    /// Create a team owned by `owner_id`
    pub async fn create_translator(
        &self,
        owner_id: i64,
        mut input: CreateTranslatorInput,
    ) -> Result<Translator, MangaError> {
        input.normalize();
        if input.name.is_empty() {
            return Err(MangaError::Validation("name is required".to_string()));
        }
        if self.manga_repo.get_translator(&input.slug).await?.is_some() {
            return Err(MangaError::Conflict(format!(
                "Slug '{}' is already taken",
                input.slug
            )));
        }

        let now = Utc::now();
        let owner = MemberInput {
            user_id: owner_id,
            role: MemberRole::Owner,
            title: String::new(),
            is_active: true,
        };
        let mut tx = self.pool.begin().await?;
        let id = tx.translator_insert(&input, now).await?;
        tx.member_save(id, &owner, now).await?;
        tx.commit().await?;

        tracing::info!(translator_id = id, owner_id, slug = %input.slug, "Translator team created");
        self.get_translator(&input.slug).await
    }

    /// Add a member or change one. Owners and moderators manage members;
    /// only an owner hands out the owner and moderator roles.
    pub async fn save_member(
        &self,
        actor: &User,
        slug: &str,
        input: MemberInput,
    ) -> Result<TranslatorMember, MangaError> {
        let translator = self.get_translator(slug).await?;
        let actor_role = self
            .manga_repo
            .member(translator.id, actor.id)
            .await?
            .filter(|m| m.is_active)
            .map(|m| m.role);

        if !actor.is_staff() {
            match actor_role {
                Some(role) if role.can_manage() => {}
                _ => {
                    return Err(MangaError::Forbidden(
                        "Only team owners and moderators manage members".to_string(),
                    ))
                }
            }
            if input.role.can_manage() && actor_role != Some(MemberRole::Owner) {
                return Err(MangaError::Forbidden(
                    "Only the owner grants this role".to_string(),
                ));
            }
        }
        if input.user_id == actor.id
            && actor_role == Some(MemberRole::Owner)
            && (input.role != MemberRole::Owner || !input.is_active)
        {
            return Err(MangaError::Validation(
                "The owner cannot step down".to_string(),
            ));
        }
        if let Some(existing) = self.manga_repo.member(translator.id, input.user_id).await? {
            if existing.role == MemberRole::Owner && actor_role != Some(MemberRole::Owner) && !actor.is_staff() {
                return Err(MangaError::Forbidden(
                    "Only the owner changes an owner".to_string(),
                ));
            }
        }
        if self.user_repo.get_by_id(input.user_id).await?.is_none() {
            return Err(MangaError::NotFound("User not found".to_string()));
        }

        let mut tx = self.pool.begin().await?;
        tx.member_save(translator.id, &input, Utc::now()).await?;
        tx.commit().await?;

        tracing::info!(
            translator_id = translator.id,
            user_id = input.user_id,
            role = %input.role,
            "Team member saved"
        );
        self.manga_repo
            .member(translator.id, input.user_id)
            .await?
            .ok_or_else(|| MangaError::NotFound("Member not found".to_string()))
    }

    /// Start a team's edition of a title
    pub async fn create_edition(
        &self,
        actor: &User,
        manga_slug: &str,
        input: CreateEditionInput,
    ) -> Result<Edition, MangaError> {
        let manga = self.get_manga(manga_slug).await?;
        let translator = self.get_translator(input.translator_slug.trim()).await?;
        self.ensure_publisher(actor, translator.id).await?;
        if self
            .manga_repo
            .find_edition(manga.id, translator.id)
            .await?
            .is_some()
        {
            return Err(MangaError::Conflict(
                "This team already has an edition of the title".to_string(),
            ));
        }

        let id = self
            .manga_repo
            .create_edition(manga.id, translator.id, input.translation_status)
            .await?;
        tracing::info!(edition_id = id, manga_id = manga.id, translator_id = translator.id, "Edition created");
        self.get_edition(id, false).await
    }

    pub async fn get_edition(&self, id: i64, with_chapters: bool) -> Result<Edition, MangaError> {
        let mut edition = self
            .manga_repo
            .get_edition(id)
            .await?
            .ok_or_else(|| MangaError::NotFound("Edition not found".to_string()))?;
        if with_chapters {
            edition.chapters = Some(self.manga_repo.chapters(id).await?);
        }
        Ok(edition)
    }

    pub async fn chapters(&self, edition_id: i64) -> Result<Vec<Chapter>, MangaError> {
        Ok(self
            .get_edition(edition_id, true)
            .await?
            .chapters
            .unwrap_or_default())
    }

    /// Chapter with its pages in reading order
    pub async fn get_chapter(&self, id: i64) -> Result<ChapterDetail, MangaError> {
        let chapter = self.chapter(id).await?;
        let pages = self.manga_repo.pages(id).await?;
        Ok(ChapterDetail { chapter, pages })
    }

    pub async fn create_chapter(
        &self,
        actor: &User,
        edition_id: i64,
        input: ChapterInput,
    ) -> Result<Chapter, MangaError> {
        validate_chapter(&input)?;
        let edition = self.get_edition(edition_id, false).await?;
        self.ensure_publisher(actor, edition.translator.id).await?;
        self.ensure_number_free(edition_id, &input, None).await?;

        let chapter = self
            .manga_repo
            .create_chapter(edition_id, &input, actor.id)
            .await?;
        tracing::info!(chapter_id = chapter.id, edition_id, number = %chapter.number, "Chapter created");
        Ok(chapter)
    }

    pub async fn update_chapter(
        &self,
        actor: &User,
        chapter_id: i64,
        input: ChapterInput,
    ) -> Result<Chapter, MangaError> {
        validate_chapter(&input)?;
        let chapter = self.chapter(chapter_id).await?;
        self.ensure_chapter_publisher(actor, &chapter).await?;
        self.ensure_number_free(chapter.edition_id, &input, Some(chapter_id))
            .await?;

        self.manga_repo.update_chapter(chapter_id, &input).await?;
        self.chapter(chapter_id).await
    }

    pub async fn delete_chapter(&self, actor: &User, chapter_id: i64) -> Result<(), MangaError> {
        let chapter = self.chapter(chapter_id).await?;
        self.ensure_chapter_publisher(actor, &chapter).await?;
        self.manga_repo.delete_chapter(chapter_id).await?;
        tracing::info!(chapter_id, user_id = actor.id, "Chapter deleted");
        Ok(())
    }

    /// Append pages after the last one, in the given order
    pub async fn add_pages(
        &self,
        actor: &User,
        chapter_id: i64,
        image_urls: Vec<String>,
    ) -> Result<Vec<ChapterPage>, MangaError> {
        let urls: Vec<String> = image_urls.iter().map(|u| u.trim().to_string()).collect();
        if urls.is_empty() {
            return Err(MangaError::Validation("No pages given".to_string()));
        }
        if urls.len() > MAX_PAGES_PER_UPLOAD {
            return Err(MangaError::Validation(format!(
                "At most {} pages per upload",
                MAX_PAGES_PER_UPLOAD
            )));
        }
        if let Some(bad) = urls.iter().find(|u| !is_http_url(u)) {
            return Err(MangaError::Validation(format!(
                "Invalid page URL: {}",
                bad
            )));
        }
        let chapter = self.chapter(chapter_id).await?;
        self.ensure_chapter_publisher(actor, &chapter).await?;

        let mut tx = self.pool.begin().await?;
        let pages = add_pages_in(tx.as_mut(), chapter_id, &urls, actor.id).await?;
        tx.commit().await?;
        Ok(pages)
    }

    pub async fn delete_page(
        &self,
        actor: &User,
        chapter_id: i64,
        page_id: i64,
    ) -> Result<(), MangaError> {
        let chapter = self.chapter(chapter_id).await?;
        self.ensure_chapter_publisher(actor, &chapter).await?;

        let mut tx = self.pool.begin().await?;
        if !tx.page_delete(chapter_id, page_id).await? {
            return Err(MangaError::NotFound("Page not found".to_string()));
        }
        tx.chapter_recount_pages(chapter_id, Utc::now()).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Move pages to new positions. Pages not listed keep theirs; the
    /// resulting orders must stay unique.
    pub async fn reorder_pages(
        &self,
        actor: &User,
        chapter_id: i64,
        orders: Vec<PageOrder>,
    ) -> Result<Vec<ChapterPage>, MangaError> {
        if orders.is_empty() {
            return Err(MangaError::Validation("No pages given".to_string()));
        }
        if orders.iter().any(|o| o.order < 1) {
            return Err(MangaError::Validation(
                "Page order starts at 1".to_string(),
            ));
        }
        let chapter = self.chapter(chapter_id).await?;
        self.ensure_chapter_publisher(actor, &chapter).await?;

        let mut tx = self.pool.begin().await?;
        reorder_in(tx.as_mut(), chapter_id, &orders).await?;
        tx.commit().await?;

        tracing::info!(chapter_id, moved = orders.len(), "Pages reordered");
        Ok(self.manga_repo.pages(chapter_id).await?)
    }

    async fn chapter(&self, id: i64) -> Result<Chapter, MangaError> {
        self.manga_repo
            .get_chapter(id)
            .await?
            .ok_or_else(|| MangaError::NotFound("Chapter not found".to_string()))
    }

    async fn ensure_publisher(&self, actor: &User, translator_id: i64) -> Result<(), MangaError> {
        if actor.is_staff() {
            return Ok(());
        }
        let allowed = self
            .manga_repo
            .member(translator_id, actor.id)
            .await?
            .is_some_and(|m| m.can_publish());
        if allowed {
            Ok(())
        } else {
            Err(MangaError::Forbidden(
                "Only team publishers can do this".to_string(),
            ))
        }
    }

    async fn ensure_chapter_publisher(
        &self,
        actor: &User,
        chapter: &Chapter,
    ) -> Result<(), MangaError> {
        let edition = self.get_edition(chapter.edition_id, false).await?;
        self.ensure_publisher(actor, edition.translator.id).await
    }

    async fn ensure_number_free(
        &self,
        edition_id: i64,
        input: &ChapterInput,
        except_id: Option<i64>,
    ) -> Result<(), MangaError> {
        if self
            .manga_repo
            .chapter_number_taken(edition_id, input.number, except_id)
            .await?
        {
            return Err(MangaError::Conflict(format!(
                "Chapter {} already exists in this edition",
                input.number
            )));
        }
        Ok(())
    }
}

fn validate_chapter(input: &ChapterInput) -> Result<(), MangaError> {
    if input.number.0 <= 0 || input.number > MAX_CHAPTER_NUMBER {
        return Err(MangaError::Validation(format!(
            "Chapter number must be between 0.01 and {}",
            MAX_CHAPTER_NUMBER
        )));
    }
    if input.volume.is_some_and(|v| v < 0) {
        return Err(MangaError::Validation(
            "Volume cannot be negative".to_string(),
        ));
    }
    if input.name.trim().chars().count() > 255 {
        return Err(MangaError::Validation(
            "Chapter name is too long".to_string(),
        ));
    }
    Ok(())
}

fn is_http_url(value: &str) -> bool {
    reqwest::Url::parse(value)
        .map(|url| matches!(url.scheme(), "http" | "https") && url.has_host())
        .unwrap_or(false)
}

async fn add_pages_in(
    tx: &mut dyn DbTx,
    chapter_id: i64,
    urls: &[String],
    uploaded_by: i64,
) -> Result<Vec<ChapterPage>, MangaError> {
    tx.chapter_lock(chapter_id)
        .await?
        .ok_or_else(|| MangaError::NotFound("Chapter not found".to_string()))?;
    let last = tx
        .page_orders(chapter_id)
        .await?
        .into_iter()
        .map(|(_, order)| order)
        .max()
        .unwrap_or(0);

    let now = Utc::now();
    let mut pages = Vec::with_capacity(urls.len());
    for (offset, url) in urls.iter().enumerate() {
        let order = last + 1 + offset as i64;
        pages.push(tx.page_insert(chapter_id, url, order, uploaded_by, now).await?);
    }
    let count = tx.chapter_recount_pages(chapter_id, now).await?;
    tracing::info!(chapter_id, added = pages.len(), pages_count = count, "Pages added");
    Ok(pages)
}

async fn reorder_in(
    tx: &mut dyn DbTx,
    chapter_id: i64,
    orders: &[PageOrder],
) -> Result<(), MangaError> {
    tx.chapter_lock(chapter_id)
        .await?
        .ok_or_else(|| MangaError::NotFound("Chapter not found".to_string()))?;
    let mut current: HashMap<i64, i64> = tx.page_orders(chapter_id).await?.into_iter().collect();

    let mut moved = HashSet::new();
    for change in orders {
        if !moved.insert(change.id) {
            return Err(MangaError::Validation(format!(
                "Page {} is listed twice",
                change.id
            )));
        }
        match current.get_mut(&change.id) {
            Some(order) => *order = change.order,
            None => {
                return Err(MangaError::Validation(format!(
                    "Page {} is not part of this chapter",
                    change.id
                )))
            }
        }
    }
    let mut seen = HashSet::new();
    if !current.values().all(|order| seen.insert(*order)) {
        return Err(MangaError::Validation(
            "Page orders must be unique".to_string(),
        ));
    }

    // Park moved pages on negative orders first so that swaps do not trip
    // the unique (chapter_id, page_order) index
    for change in orders {
        tx.page_set_order(change.id, -change.id).await?;
    }
    for change in orders {
        tx.page_set_order(change.id, change.order).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_file_pool, migrated_pool};
    use crate::db::repositories::{SqlxMangaRepository, SqlxUserRepository};
    use crate::models::{Hundredths, TranslationStatus};

    struct Fixture {
        pool: DynDatabasePool,
        service: MangaService,
        owner: User,
        outsider: User,
    }

    async fn user(pool: &DynDatabasePool, name: &str) -> User {
        let id = insert_user(pool, name).await;
        SqlxUserRepository::new(pool.clone())
            .get_by_id(id)
            .await
            .unwrap()
            .unwrap()
    }

    fn service_for(pool: &DynDatabasePool) -> MangaService {
        MangaService::new(
            pool.clone(),
            SqlxMangaRepository::boxed(pool.clone()),
            SqlxUserRepository::boxed(pool.clone()),
        )
    }

    async fn setup_with(pool: DynDatabasePool) -> Fixture {
        let service = service_for(&pool);
        let owner = user(&pool, "aki").await;
        let outsider = user(&pool, "rin").await;
        Fixture {
            pool,
            service,
            owner,
            outsider,
        }
    }

    async fn setup() -> Fixture {
        setup_with(migrated_pool().await).await
    }

    fn manga(title: &str) -> CreateMangaInput {
        serde_json::from_value(serde_json::json!({
            "title_ru": title,
            "title_en": title,
            "year": 2001,
            "genres": ["Action", "Drama"],
            "categories": ["Seinen"],
            "links": [{"title": "MAL", "url": "https://myanimelist.net/manga/2"}],
        }))
        .unwrap()
    }

    fn team(name: &str) -> CreateTranslatorInput {
        serde_json::from_value(serde_json::json!({ "name": name })).unwrap()
    }

    fn chapter(number: i64) -> ChapterInput {
        ChapterInput {
            number: Hundredths(number),
            name: String::new(),
            volume: Some(1),
            published_at: None,
        }
    }

    /// Title, team owned by `owner` and the team's edition
    async fn edition(f: &Fixture) -> Edition {
        f.service.create_manga(manga("Berserk")).await.unwrap();
        f.service.create_translator(f.owner.id, team("Night Owls")).await.unwrap();
        f.service
            .create_edition(
                &f.owner,
                "berserk",
                CreateEditionInput {
                    translator_slug: "night-owls".into(),
                    translation_status: TranslationStatus::InProgress,
                },
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_create_manga_validates_and_links_tags() {
        let f = setup().await;
        let created = f.service.create_manga(manga("Berserk")).await.unwrap();
        assert_eq!(created.slug, "berserk");
        assert_eq!(created.genres.len(), 2);
        assert_eq!(created.links[0].title, "MAL");

        let err = f.service.create_manga(manga("Berserk")).await.unwrap_err();
        assert!(matches!(err, MangaError::Conflict(_)));

        let mut bad_year = manga("Vagabond");
        bad_year.year = Some(1800);
        assert!(matches!(
            f.service.create_manga(bad_year).await.unwrap_err(),
            MangaError::Validation(_)
        ));

        let mut bad_link = manga("Vagabond");
        bad_link.links[0].url = "javascript:alert(1)".into();
        assert!(matches!(
            f.service.create_manga(bad_link).await.unwrap_err(),
            MangaError::Validation(_)
        ));

        let mut untitled = manga("Vagabond");
        untitled.title_ru = "  ".into();
        assert!(matches!(
            f.service.create_manga(untitled).await.unwrap_err(),
            MangaError::Validation(_)
        ));

        let page = f
            .service
            .list_mangas(&MangaFilter::default(), None, None)
            .await
            .unwrap();
        assert_eq!(page.count, 1);
        assert_eq!(f.service.tags(TagKind::Category).await.unwrap()[0].slug, "seinen");
    }

    #[tokio::test]
    async fn test_team_roles() {
        let f = setup().await;
        let mod_user = user(&f.pool, "mori").await;
        let translator = f.service.create_translator(f.owner.id, team("Night Owls")).await.unwrap();
        assert_eq!(translator.slug, "night-owls");
        let members = f.service.members("night-owls").await.unwrap();
        assert_eq!(members[0].role, MemberRole::Owner);

        let as_moderator = MemberInput {
            user_id: mod_user.id,
            role: MemberRole::Moderator,
            title: "Editor".into(),
            is_active: true,
        };
        // Outsiders cannot manage
        let err = f
            .service
            .save_member(&f.outsider, "night-owls", as_moderator.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, MangaError::Forbidden(_)));

        let saved = f
            .service
            .save_member(&f.owner, "night-owls", as_moderator)
            .await
            .unwrap();
        assert_eq!(saved.role, MemberRole::Moderator);
        assert_eq!(saved.title, "Editor");

        // A moderator adds publishers but not other moderators
        let publisher = MemberInput {
            user_id: f.outsider.id,
            role: MemberRole::Publisher,
            title: String::new(),
            is_active: true,
        };
        f.service
            .save_member(&mod_user, "night-owls", publisher.clone())
            .await
            .unwrap();
        let promote = MemberInput { role: MemberRole::Moderator, ..publisher };
        assert!(matches!(
            f.service.save_member(&mod_user, "night-owls", promote).await.unwrap_err(),
            MangaError::Forbidden(_)
        ));

        // The owner stays the owner
        let step_down = MemberInput {
            user_id: f.owner.id,
            role: MemberRole::Member,
            title: String::new(),
            is_active: true,
        };
        assert!(matches!(
            f.service.save_member(&f.owner, "night-owls", step_down.clone()).await.unwrap_err(),
            MangaError::Validation(_)
        ));
        assert!(matches!(
            f.service.save_member(&mod_user, "night-owls", step_down).await.unwrap_err(),
            MangaError::Forbidden(_)
        ));

        let ghost = MemberInput {
            user_id: 9_999,
            role: MemberRole::Member,
            title: String::new(),
            is_active: true,
        };
        assert!(matches!(
            f.service.save_member(&f.owner, "night-owls", ghost).await.unwrap_err(),
            MangaError::NotFound(_)
        ));

        let err = f.service.create_translator(f.outsider.id, team("Night Owls")).await.unwrap_err();
        assert!(matches!(err, MangaError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_chapters_need_publisher() {
        let f = setup().await;
        let edition = edition(&f).await;

        let err = f
            .service
            .create_chapter(&f.outsider, edition.id, chapter(100))
            .await
            .unwrap_err();
        assert!(matches!(err, MangaError::Forbidden(_)));

        let first = f.service.create_chapter(&f.owner, edition.id, chapter(100)).await.unwrap();
        f.service.create_chapter(&f.owner, edition.id, chapter(1050)).await.unwrap();
        assert!(matches!(
            f.service.create_chapter(&f.owner, edition.id, chapter(100)).await.unwrap_err(),
            MangaError::Conflict(_)
        ));
        assert!(matches!(
            f.service.create_chapter(&f.owner, edition.id, chapter(0)).await.unwrap_err(),
            MangaError::Validation(_)
        ));
        assert!(matches!(
            f.service
                .create_chapter(&f.owner, edition.id, chapter(MAX_CHAPTER_NUMBER.0 + 1))
                .await
                .unwrap_err(),
            MangaError::Validation(_)
        ));

        // Keeping its own number is not a clash
        let renamed = ChapterInput { name: "Prologue".into(), ..chapter(100) };
        let updated = f.service.update_chapter(&f.owner, first.id, renamed).await.unwrap();
        assert_eq!(updated.name, "Prologue");
        assert!(matches!(
            f.service.update_chapter(&f.owner, first.id, chapter(1050)).await.unwrap_err(),
            MangaError::Conflict(_)
        ));

        let detail = f.service.get_manga_full("berserk").await.unwrap();
        let chapters = detail.editions[0].chapters.as_ref().unwrap();
        assert_eq!(chapters[0].number, Hundredths(1050));
        assert_eq!(detail.editions[0].chapters_count, 2);

        // A second edition by the same team is refused
        let err = f
            .service
            .create_edition(
                &f.owner,
                "berserk",
                CreateEditionInput {
                    translator_slug: "night-owls".into(),
                    translation_status: TranslationStatus::Completed,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MangaError::Conflict(_)));

        f.service.delete_chapter(&f.owner, first.id).await.unwrap();
        assert_eq!(f.service.chapters(edition.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_pages_append_delete_and_reorder() {
        let f = setup().await;
        let edition = edition(&f).await;
        let chapter = f.service.create_chapter(&f.owner, edition.id, chapter(100)).await.unwrap();
        let urls = |names: &[&str]| -> Vec<String> {
            names.iter().map(|n| format!("https://cdn.example.com/{}.webp", n)).collect()
        };

        let pages = f.service.add_pages(&f.owner, chapter.id, urls(&["a", "b"])).await.unwrap();
        assert_eq!(pages[1].order, 2);
        let more = f.service.add_pages(&f.owner, chapter.id, urls(&["c"])).await.unwrap();
        assert_eq!(more[0].order, 3);
        assert!(matches!(
            f.service
                .add_pages(&f.owner, chapter.id, vec!["ftp://x/y.png".into()])
                .await
                .unwrap_err(),
            MangaError::Validation(_)
        ));
        assert!(matches!(
            f.service.add_pages(&f.outsider, chapter.id, urls(&["d"])).await.unwrap_err(),
            MangaError::Forbidden(_)
        ));

        // Swap the first and last page
        let (a, c) = (pages[0].id, more[0].id);
        let reordered = f
            .service
            .reorder_pages(
                &f.owner,
                chapter.id,
                vec![PageOrder { id: a, order: 3 }, PageOrder { id: c, order: 1 }],
            )
            .await
            .unwrap();
        let ids: Vec<i64> = reordered.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![c, pages[1].id, a]);

        // Clashing with a page that is not moved
        assert!(matches!(
            f.service
                .reorder_pages(&f.owner, chapter.id, vec![PageOrder { id: a, order: 2 }])
                .await
                .unwrap_err(),
            MangaError::Validation(_)
        ));
        assert!(matches!(
            f.service
                .reorder_pages(&f.owner, chapter.id, vec![PageOrder { id: 9_999, order: 7 }])
                .await
                .unwrap_err(),
            MangaError::Validation(_)
        ));

        f.service.delete_page(&f.owner, chapter.id, a).await.unwrap();
        assert!(matches!(
            f.service.delete_page(&f.owner, chapter.id, a).await.unwrap_err(),
            MangaError::NotFound(_)
        ));
        let detail = f.service.get_chapter(chapter.id).await.unwrap();
        assert_eq!(detail.chapter.pages_count, 2);
        assert_eq!(detail.pages.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_get_distinct_orders() {
        let (_dir, pool) = migrated_file_pool().await;
        let f = setup_with(pool).await;
        let edition = edition(&f).await;
        let chapter = f.service.create_chapter(&f.owner, edition.id, chapter(100)).await.unwrap();

        let mut handles = Vec::new();
        for n in 0..6 {
            let service = service_for(&f.pool);
            let owner = f.owner.clone();
            let chapter_id = chapter.id;
            handles.push(tokio::spawn(async move {
                service
                    .add_pages(&owner, chapter_id, vec![format!("https://cdn.example.com/{}.webp", n)])
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let detail = f.service.get_chapter(chapter.id).await.unwrap();
        let orders: Vec<i64> = detail.pages.iter().map(|p| p.order).collect();
        assert_eq!(orders, vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(detail.chapter.pages_count, 6);
    }
}
