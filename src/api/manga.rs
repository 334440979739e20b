//! Manga API endpoints
//!
//! - GET /api/v1/manga/titles?q=&type=&year=&work_status=&genre=&category=&page=&page_size=
//! - GET /api/v1/manga/titles/{slug}
//! - GET /api/v1/manga/titles/{slug}/full - With editions and chapters
//! - GET /api/v1/manga/genres, /api/v1/manga/categories
//! - GET /api/v1/manga/translators, /translators/{slug}, /translators/{slug}/members
//! - GET /api/v1/manga/editions/{id} - With chapters
//! - GET /api/v1/manga/chapters/{id} - With pages
//! - POST /api/v1/manga/translators - Create a team, caller becomes owner
//! - POST /api/v1/manga/translators/{slug}/members - Add or change a member
//! - POST /api/v1/manga/titles/{slug}/editions
//! - POST /api/v1/manga/editions/{id}/chapters
//! - PUT, DELETE /api/v1/manga/chapters/{id}
//! - POST /api/v1/manga/chapters/{id}/pages - Append pages by URL
//! - PUT /api/v1/manga/chapters/{id}/pages/order
//! - DELETE /api/v1/manga/chapters/{id}/pages/{page_id}
//! - POST /api/v1/manga/titles (admin)

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;

use crate::api::middleware::{ApiError, AppState, AuthenticatedUser};
use crate::models::{
    Chapter, ChapterDetail, ChapterInput, ChapterPage, CreateEditionInput, CreateMangaInput,
    CreateTranslatorInput, Edition, Manga, MangaDetail, MangaFilter, MangaTag, MangaType,
    MemberInput, PageOrder, PagedResult, TagKind, Translator, TranslatorMember, WorkStatus,
};

/// Query string of the title listing, flat for numeric values
#[derive(Debug, Default, Deserialize)]
pub struct TitlesQuery {
    pub q: Option<String>,
    #[serde(rename = "type")]
    pub manga_type: Option<MangaType>,
    pub year: Option<i64>,
    pub work_status: Option<WorkStatus>,
    pub genre: Option<String>,
    pub category: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl TitlesQuery {
    fn filter(&self) -> MangaFilter {
        MangaFilter {
            q: self.q.clone(),
            manga_type: self.manga_type,
            year: self.year,
            work_status: self.work_status,
            genre: self.genre.clone(),
            category: self.category.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AddPagesRequest {
    #[serde(default)]
    pub image_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct ReorderRequest {
    #[serde(default)]
    pub pages: Vec<PageOrder>,
}

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/titles", get(list_titles))
        .route("/titles/{slug}", get(get_title))
        .route("/titles/{slug}/full", get(get_title_full))
        .route("/genres", get(list_genres))
        .route("/categories", get(list_categories))
        .route("/translators", get(list_translators))
        .route("/translators/{slug}", get(get_translator))
        .route("/translators/{slug}/members", get(list_members))
        .route("/editions/{id}", get(get_edition))
        .route("/chapters/{id}", get(get_chapter))
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/translators", post(create_translator))
        .route("/translators/{slug}/members", post(save_member))
        .route("/titles/{slug}/editions", post(create_edition))
        .route("/editions/{id}/chapters", post(create_chapter))
        .route("/chapters/{id}", put(update_chapter).delete(delete_chapter))
        .route("/chapters/{id}/pages", post(add_pages))
        .route("/chapters/{id}/pages/order", put(reorder_pages))
        .route("/chapters/{id}/pages/{page_id}", delete(delete_page))
}

pub fn admin_router() -> Router<AppState> {
    Router::new().route("/titles", post(create_title))
}

async fn list_titles(
    State(state): State<AppState>,
    Query(query): Query<TitlesQuery>,
) -> Result<Json<PagedResult<Manga>>, ApiError> {
    let page = state
        .manga_service
        .list_mangas(&query.filter(), query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

async fn get_title(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Manga>, ApiError> {
    Ok(Json(state.manga_service.get_manga(&slug).await?))
}

async fn get_title_full(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<MangaDetail>, ApiError> {
    Ok(Json(state.manga_service.get_manga_full(&slug).await?))
}

async fn list_genres(State(state): State<AppState>) -> Result<Json<Vec<MangaTag>>, ApiError> {
    Ok(Json(state.manga_service.tags(TagKind::Genre).await?))
}

async fn list_categories(State(state): State<AppState>) -> Result<Json<Vec<MangaTag>>, ApiError> {
    Ok(Json(state.manga_service.tags(TagKind::Category).await?))
}

async fn list_translators(
    State(state): State<AppState>,
) -> Result<Json<Vec<Translator>>, ApiError> {
    Ok(Json(state.manga_service.list_translators().await?))
}

async fn get_translator(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Translator>, ApiError> {
    Ok(Json(state.manga_service.get_translator(&slug).await?))
}

async fn list_members(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<TranslatorMember>>, ApiError> {
    Ok(Json(state.manga_service.members(&slug).await?))
}

async fn get_edition(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<Edition>, ApiError> {
    Ok(Json(state.manga_service.get_edition(id, true).await?))
}

async fn get_chapter(
    State(state): State<AppState>,
    Path(id): Path<i64>,
) -> Result<Json<ChapterDetail>, ApiError> {
    Ok(Json(state.manga_service.get_chapter(id).await?))
}

async fn create_translator(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CreateTranslatorInput>,
) -> Result<impl IntoResponse, ApiError> {
    let translator = state.manga_service.create_translator(user.0.id, body).await?;
    Ok((StatusCode::CREATED, Json(translator)))
}

async fn save_member(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(slug): Path<String>,
    Json(body): Json<MemberInput>,
) -> Result<Json<TranslatorMember>, ApiError> {
    Ok(Json(state.manga_service.save_member(&user.0, &slug, body).await?))
}

async fn create_edition(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(slug): Path<String>,
    Json(body): Json<CreateEditionInput>,
) -> Result<impl IntoResponse, ApiError> {
    let edition = state.manga_service.create_edition(&user.0, &slug, body).await?;
    Ok((StatusCode::CREATED, Json(edition)))
}

async fn create_chapter(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(edition_id): Path<i64>,
    Json(body): Json<ChapterInput>,
) -> Result<impl IntoResponse, ApiError> {
    let chapter = state
        .manga_service
        .create_chapter(&user.0, edition_id, body)
        .await?;
    Ok((StatusCode::CREATED, Json(chapter)))
}

async fn update_chapter(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<ChapterInput>,
) -> Result<Json<Chapter>, ApiError> {
    Ok(Json(state.manga_service.update_chapter(&user.0, id, body).await?))
}

async fn delete_chapter(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
) -> Result<StatusCode, ApiError> {
    state.manga_service.delete_chapter(&user.0, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn add_pages(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<AddPagesRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let pages: Vec<ChapterPage> = state
        .manga_service
        .add_pages(&user.0, id, body.image_urls)
        .await?;
    Ok((StatusCode::CREATED, Json(pages)))
}

async fn reorder_pages(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path(id): Path<i64>,
    Json(body): Json<ReorderRequest>,
) -> Result<Json<Vec<ChapterPage>>, ApiError> {
    Ok(Json(
        state.manga_service.reorder_pages(&user.0, id, body.pages).await?,
    ))
}

async fn delete_page(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Path((id, page_id)): Path<(i64, i64)>,
) -> Result<StatusCode, ApiError> {
    state.manga_service.delete_page(&user.0, id, page_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_title(
    State(state): State<AppState>,
    Json(body): Json<CreateMangaInput>,
) -> Result<impl IntoResponse, ApiError> {
    let manga = state.manga_service.create_manga(body).await?;
    Ok((StatusCode::CREATED, Json(manga)))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{login, register_active, test_server};
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_publishing_flow() {
        let (server, _state) = test_server().await;
        register_active(&server, "admin").await;
        let bob_id = register_active(&server, "bob").await;
        register_active(&server, "eve").await;
        let admin = login(&server, "admin").await;
        let bob = login(&server, "bob").await;
        let eve = login(&server, "eve").await;

        let title = json!({
            "title_ru": "Берсерк",
            "title_en": "Berserk",
            "type": "manga",
            "year": 1989,
            "genres": ["Dark Fantasy"],
        });
        server
            .post("/api/v1/manga/titles")
            .authorization_bearer(&bob)
            .json(&title)
            .await
            .assert_status(StatusCode::FORBIDDEN);
        let created = server
            .post("/api/v1/manga/titles")
            .authorization_bearer(&admin)
            .json(&title)
            .await;
        created.assert_status(StatusCode::CREATED);
        assert_eq!(created.json::<Value>()["slug"], "berserk");

        let team = server
            .post("/api/v1/manga/translators")
            .authorization_bearer(&bob)
            .json(&json!({"name": "Night Owls"}))
            .await;
        team.assert_status(StatusCode::CREATED);
        let members: Value = server.get("/api/v1/manga/translators/night-owls/members").await.json();
        assert_eq!(members[0]["user"]["id"], bob_id);
        assert_eq!(members[0]["role"], "owner");

        let edition = server
            .post("/api/v1/manga/titles/berserk/editions")
            .authorization_bearer(&bob)
            .json(&json!({"translator_slug": "night-owls"}))
            .await;
        edition.assert_status(StatusCode::CREATED);
        let edition_id = edition.json::<Value>()["id"].as_i64().unwrap();

        server
            .post(&format!("/api/v1/manga/editions/{}/chapters", edition_id))
            .authorization_bearer(&eve)
            .json(&json!({"number": 1}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        let chapter = server
            .post(&format!("/api/v1/manga/editions/{}/chapters", edition_id))
            .authorization_bearer(&bob)
            .json(&json!({"number": "1.5", "name": "The Black Swordsman"}))
            .await;
        chapter.assert_status(StatusCode::CREATED);
        let chapter: Value = chapter.json();
        assert_eq!(chapter["number"], "1.50");
        let chapter_url = format!("/api/v1/manga/chapters/{}", chapter["id"]);

        let pages = server
            .post(&format!("{}/pages", chapter_url))
            .authorization_bearer(&bob)
            .json(&json!({"image_urls": ["https://cdn.example.com/1.webp", "https://cdn.example.com/2.webp"]}))
            .await;
        pages.assert_status(StatusCode::CREATED);
        let pages: Value = pages.json();
        let (first, second) = (pages[0]["id"].clone(), pages[1]["id"].clone());

        let reordered = server
            .put(&format!("{}/pages/order", chapter_url))
            .authorization_bearer(&bob)
            .json(&json!({"pages": [{"id": first, "order": 2}, {"id": second, "order": 1}]}))
            .await;
        reordered.assert_status_ok();
        assert_eq!(reordered.json::<Value>()[0]["id"], second);

        let detail: Value = server.get(&chapter_url).await.json();
        assert_eq!(detail["pages_count"], 2);
        assert_eq!(detail["pages"][0]["id"], second);

        server
            .delete(&format!("{}/pages/{}", chapter_url, first))
            .authorization_bearer(&bob)
            .await
            .assert_status(StatusCode::NO_CONTENT);

        let full: Value = server.get("/api/v1/manga/titles/berserk/full").await.json();
        assert_eq!(full["editions"][0]["translator"]["slug"], "night-owls");
        assert_eq!(full["editions"][0]["chapters"][0]["pages_count"], 1);
        assert_eq!(full["genres"][0]["slug"], "dark-fantasy");

        let listed: Value = server.get("/api/v1/manga/titles?genre=dark-fantasy&type=manga").await.json();
        assert_eq!(listed["count"], 1);
        let listed: Value = server.get("/api/v1/manga/titles?type=manhwa").await.json();
        assert_eq!(listed["count"], 0);

        server
            .delete(&chapter_url)
            .authorization_bearer(&bob)
            .await
            .assert_status(StatusCode::NO_CONTENT);
        server.get(&chapter_url).await.assert_status(StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_member_management() {
        let (server, _state) = test_server().await;
        register_active(&server, "admin").await;
        register_active(&server, "bob").await;
        let eve_id = register_active(&server, "eve").await;
        let bob = login(&server, "bob").await;
        let eve = login(&server, "eve").await;

        server
            .post("/api/v1/manga/translators")
            .authorization_bearer(&bob)
            .json(&json!({"name": "Night Owls"}))
            .await
            .assert_status(StatusCode::CREATED);
        server
            .post("/api/v1/manga/translators")
            .authorization_bearer(&eve)
            .json(&json!({"name": "Night Owls"}))
            .await
            .assert_status(StatusCode::CONFLICT);

        server
            .post("/api/v1/manga/translators/night-owls/members")
            .authorization_bearer(&eve)
            .json(&json!({"user_id": eve_id, "role": "owner"}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
        let saved = server
            .post("/api/v1/manga/translators/night-owls/members")
            .authorization_bearer(&bob)
            .json(&json!({"user_id": eve_id, "role": "publisher", "title": "Typesetter"}))
            .await;
        saved.assert_status_ok();
        assert_eq!(saved.json::<Value>()["role"], "publisher");

        server
            .post("/api/v1/manga/translators/missing/members")
            .authorization_bearer(&bob)
            .json(&json!({"user_id": eve_id}))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .post("/api/v1/manga/translators")
            .json(&json!({"name": "Anonymous"}))
            .await
            .assert_status(StatusCode::UNAUTHORIZED);
    }
}
