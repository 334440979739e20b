//! Cosmetic item API endpoints
//!
//! - GET /api/v1/customitems?type=&active=&search=
//! - GET /api/v1/customitems/{slug}
//! - GET /api/v1/customitems/me/inventory
//! - GET|PUT /api/v1/customitems/me/applied
//! - POST /api/v1/customitems (admin)

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::middleware::{ApiError, AppState, AuthenticatedUser};
use crate::db::repositories::ItemFilter;
use crate::models::{
    AppliedCustomization, CreateItemInput, InventoryView, Item, ItemType, UpdateAppliedInput,
};

#[derive(Debug, Default, Deserialize)]
pub struct ItemsQuery {
    #[serde(rename = "type")]
    pub item_type: Option<String>,
    pub active: Option<bool>,
    pub search: Option<String>,
}

impl ItemsQuery {
    fn into_filter(self) -> Result<ItemFilter, ApiError> {
        let item_type = match self.item_type.as_deref().filter(|t| !t.is_empty()) {
            Some(raw) => Some(
                raw.parse::<ItemType>()
                    .map_err(|e| ApiError::validation_error(e.to_string()))?,
            ),
            None => None,
        };
        Ok(ItemFilter {
            item_type,
            is_active: self.active,
            search: self.search.filter(|s| !s.trim().is_empty()),
        })
    }
}

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_items))
        .route("/{slug}", get(get_item))
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/me/inventory", get(my_inventory))
        .route("/me/applied", get(my_applied).put(update_applied))
}

pub fn admin_router() -> Router<AppState> {
    Router::new().route("/", axum::routing::post(create_item))
}

async fn list_items(
    State(state): State<AppState>,
    Query(query): Query<ItemsQuery>,
) -> Result<Json<Vec<Item>>, ApiError> {
    let filter = query.into_filter()?;
    Ok(Json(state.customitem_service.list(&filter).await?))
}

async fn get_item(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Item>, ApiError> {
    Ok(Json(state.customitem_service.get_by_slug(&slug).await?))
}

async fn my_inventory(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<InventoryView>>, ApiError> {
    Ok(Json(state.customitem_service.inventory(user.0.id).await?))
}

async fn my_applied(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<AppliedCustomization>, ApiError> {
    Ok(Json(state.customitem_service.applied(user.0.id).await?))
}

async fn update_applied(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<UpdateAppliedInput>,
) -> Result<Json<AppliedCustomization>, ApiError> {
    Ok(Json(
        state
            .customitem_service
            .update_applied(user.0.id, body)
            .await?,
    ))
}

async fn create_item(
    State(state): State<AppState>,
    Json(body): Json<CreateItemInput>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state.customitem_service.create(body).await?;
    tracing::info!(item_id = item.id, slug = %item.slug, "Item created");
    Ok((StatusCode::CREATED, Json(item)))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{login, register_active, test_server};
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_default_headers_owned_and_applied() {
        let (server, _state) = test_server().await;
        register_active(&server, "alice").await;
        let token = login(&server, "alice").await;

        let inventory: Value = server
            .get("/api/v1/customitems/me/inventory")
            .authorization_bearer(&token)
            .await
            .json();
        let inventory = inventory.as_array().unwrap();
        assert_eq!(inventory.len(), 3);
        assert!(inventory.iter().all(|e| e["source"] == "gift"));
        let header_id = inventory[0]["item"]["id"].as_i64().unwrap();

        let response = server
            .put("/api/v1/customitems/me/applied")
            .authorization_bearer(&token)
            .json(&json!({"header_item": header_id}))
            .await;
        response.assert_status_ok();
        assert_eq!(response.json::<Value>()["header_item_id"], header_id);

        // a header cannot go into the avatar slot
        server
            .put("/api/v1/customitems/me/applied")
            .authorization_bearer(&token)
            .json(&json!({"avatar_item": header_id}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let applied: Value = server
            .get("/api/v1/customitems/me/applied")
            .authorization_bearer(&token)
            .await
            .json();
        assert_eq!(applied["header_item_id"], header_id);
        assert!(applied["avatar_item_id"].is_null());
    }

    #[tokio::test]
    async fn test_admin_creates_items() {
        let (server, _state) = test_server().await;
        register_active(&server, "admin").await;
        register_active(&server, "bob").await;
        let admin = login(&server, "admin").await;
        let bob = login(&server, "bob").await;

        let item = json!({"type": "avatar", "title": "Neon Fox", "file_url": "https://cdn.example.com/fox.webp", "price_aki": 50});
        server
            .post("/api/v1/customitems")
            .authorization_bearer(&bob)
            .json(&item)
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let response = server
            .post("/api/v1/customitems")
            .authorization_bearer(&admin)
            .json(&item)
            .await;
        response.assert_status(StatusCode::CREATED);
        assert_eq!(response.json::<Value>()["slug"], "neon-fox");

        let fetched: Value = server.get("/api/v1/customitems/neon-fox").await.json();
        assert_eq!(fetched["price_aki"], 50);

        let avatars: Value = server.get("/api/v1/customitems?type=avatar").await.json();
        assert_eq!(avatars.as_array().unwrap().len(), 1);

        server
            .get("/api/v1/customitems?type=hat")
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        server
            .get("/api/v1/customitems/missing")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
