//! Shop API endpoints
//!
//! - GET /api/v1/shop/offers - Offers selling right now
//! - GET /api/v1/shop/offers/{id_or_slug}
//! - POST /api/v1/shop/purchase - Buy by `offer_id` or `item_slug`
//! - POST /api/v1/shop/offers (admin)

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::middleware::{ApiError, AppState, AuthenticatedUser};
use crate::models::{CreateOfferInput, OfferView};
use crate::services::{PurchaseResult, PurchaseTarget};

#[derive(Debug, Default, Deserialize)]
pub struct PurchaseRequest {
    pub offer_id: Option<i64>,
    pub item_slug: Option<String>,
}

pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/offers", get(list_offers))
        .route("/offers/{id_or_slug}", get(get_offer))
}

pub fn protected_router() -> Router<AppState> {
    Router::new().route("/purchase", post(purchase))
}

pub fn admin_router() -> Router<AppState> {
    Router::new().route("/offers", post(create_offer))
}

async fn list_offers(State(state): State<AppState>) -> Result<Json<Vec<OfferView>>, ApiError> {
    Ok(Json(state.shop_service.list_offers().await?))
}

async fn get_offer(
    State(state): State<AppState>,
    Path(id_or_slug): Path<String>,
) -> Result<Json<OfferView>, ApiError> {
    Ok(Json(state.shop_service.get_offer(&id_or_slug).await?))
}

async fn purchase(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<PurchaseRequest>,
) -> Result<Json<PurchaseResult>, ApiError> {
    let target = PurchaseTarget::from_request(body.offer_id, body.item_slug)?;
    Ok(Json(state.shop_service.purchase(user.0.id, target).await?))
}

async fn create_offer(
    State(state): State<AppState>,
    Json(body): Json<CreateOfferInput>,
) -> Result<impl IntoResponse, ApiError> {
    let offer = state.shop_service.create_offer(body).await?;
    Ok((StatusCode::CREATED, Json(offer)))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{login, register_active, test_server_with};
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_offer_and_purchase_flow() {
        let (server, _state) = test_server_with(|config| config.economy.demo_enabled = true).await;
        register_active(&server, "admin").await;
        register_active(&server, "bob").await;
        let admin = login(&server, "admin").await;
        let bob = login(&server, "bob").await;

        let item: Value = server
            .post("/api/v1/customitems")
            .authorization_bearer(&admin)
            .json(&json!({"type": "avatar_frame", "title": "Gold Frame", "file_url": "https://cdn.example.com/gold.webp", "price_aki": 120}))
            .await
            .json();
        let item_id = item["id"].as_i64().unwrap();

        server
            .post("/api/v1/shop/offers")
            .authorization_bearer(&bob)
            .json(&json!({"item_id": item_id}))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        let offer = server
            .post("/api/v1/shop/offers")
            .authorization_bearer(&admin)
            .json(&json!({"item_id": item_id, "price_override_aki": 100}))
            .await;
        offer.assert_status(StatusCode::CREATED);
        let offer: Value = offer.json();
        assert_eq!(offer["current_price"], 100);

        let listed: Value = server.get("/api/v1/shop/offers").await.json();
        assert_eq!(listed.as_array().unwrap().len(), 1);
        let by_slug: Value = server.get("/api/v1/shop/offers/gold-frame").await.json();
        assert_eq!(by_slug["id"], offer["id"]);

        // bob has no AKI yet
        let response = server
            .post("/api/v1/shop/purchase")
            .authorization_bearer(&bob)
            .json(&json!({"item_slug": "gold-frame"}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Value>()["error"]["code"], "INSUFFICIENT_FUNDS");

        // the admin funds themselves and buys
        server
            .post("/api/v1/economy/demo/deposit-aki")
            .authorization_bearer(&admin)
            .json(&json!({"amount": 150}))
            .await
            .assert_status(StatusCode::CREATED);
        let response = server
            .post("/api/v1/shop/purchase")
            .authorization_bearer(&admin)
            .json(&json!({"offer_id": offer["id"]}))
            .await;
        response.assert_status_ok();
        let body: Value = response.json();
        assert_eq!(body["ok"], true);
        assert_eq!(body["new_balance"], 50);

        server
            .post("/api/v1/shop/purchase")
            .authorization_bearer(&admin)
            .json(&json!({"offer_id": offer["id"]}))
            .await
            .assert_status(StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_purchase_needs_a_target() {
        let (server, _state) = test_server_with(|_| {}).await;
        register_active(&server, "alice").await;
        let token = login(&server, "alice").await;

        server
            .post("/api/v1/shop/purchase")
            .authorization_bearer(&token)
            .json(&json!({}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);
        server
            .post("/api/v1/shop/purchase")
            .authorization_bearer(&token)
            .json(&json!({"offer_id": 999}))
            .await
            .assert_status(StatusCode::NOT_FOUND);
        server
            .get("/api/v1/shop/offers/999")
            .await
            .assert_status(StatusCode::NOT_FOUND);
    }
}
