//! Catalog API endpoints (read-only mirror of Kodik)
//!
//! - GET /api/v1/catalog/materials?search=&type=&year=&genre=&translation_id=&page=&page_size=
//! - GET /api/v1/catalog/materials/{kodik_id} (with seasons and episodes)
//! - GET /api/v1/catalog/genres?source=&q=

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::middleware::{ApiError, AppState};
use crate::models::{Genre, Material, MaterialFilter, PagedResult};

/// Query string of the listing. Kept flat since `serde(flatten)` does not
/// mix with numeric query values.
#[derive(Debug, Default, Deserialize)]
pub struct MaterialsQuery {
    pub search: Option<String>,
    #[serde(rename = "type")]
    pub material_type: Option<String>,
    pub year: Option<i64>,
    pub genre: Option<String>,
    pub translation_id: Option<i64>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

impl MaterialsQuery {
    fn filter(&self) -> MaterialFilter {
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        MaterialFilter {
            search: non_empty(&self.search),
            material_type: non_empty(&self.material_type),
            year: self.year,
            genre: non_empty(&self.genre),
            translation_id: self.translation_id,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct GenresQuery {
    pub source: Option<String>,
    pub q: Option<String>,
}

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/materials", get(list_materials))
        .route("/materials/{kodik_id}", get(get_material))
        .route("/genres", get(list_genres))
}

async fn list_materials(
    State(state): State<AppState>,
    Query(query): Query<MaterialsQuery>,
) -> Result<Json<PagedResult<Material>>, ApiError> {
    let page = state
        .catalog_service
        .list(&query.filter(), query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

async fn get_material(
    State(state): State<AppState>,
    Path(kodik_id): Path<String>,
) -> Result<Json<Material>, ApiError> {
    state
        .catalog_service
        .get(&kodik_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::not_found("Material not found"))
}

async fn list_genres(
    State(state): State<AppState>,
    Query(query): Query<GenresQuery>,
) -> Result<Json<Vec<Genre>>, ApiError> {
    let genres = state
        .catalog_service
        .genres(query.source.as_deref(), query.q.as_deref())
        .await?;
    Ok(Json(genres))
}
