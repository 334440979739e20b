//! Wallet and ledger API endpoints
//!
//! - GET /api/v1/economy/wallets/me
//! - GET /api/v1/economy/transactions/me?currency=&page=&page_size=
//! - POST /api/v1/economy/demo/{deposit-aki,deposit-rub,transfer-aki} (staff,
//!   only with `economy.demo_enabled`)

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;

use crate::api::middleware::{ApiError, AppState, AuthenticatedUser};
use crate::models::{Currency, PagedResult, Wallet, WalletTransaction};
use crate::services::economy::DEMO_MAX_AMOUNT;

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    pub currency: Option<String>,
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct AmountRequest {
    pub amount: i64,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub to_user_id: i64,
    pub amount: i64,
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/wallets/me", get(my_wallets))
        .route("/transactions/me", get(my_transactions))
}

/// Mounted behind `require_staff`
pub fn demo_router() -> Router<AppState> {
    Router::new()
        .route("/demo/deposit-aki", post(demo_deposit_aki))
        .route("/demo/deposit-rub", post(demo_deposit_rub))
        .route("/demo/transfer-aki", post(demo_transfer_aki))
}

async fn my_wallets(
    State(state): State<AppState>,
    user: AuthenticatedUser,
) -> Result<Json<Vec<Wallet>>, ApiError> {
    Ok(Json(state.economy_service.wallets_for_user(user.0.id).await?))
}

async fn my_transactions(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Query(query): Query<TransactionsQuery>,
) -> Result<Json<PagedResult<WalletTransaction>>, ApiError> {
    let currency = match query.currency.as_deref().filter(|c| !c.trim().is_empty()) {
        Some(raw) => raw
            .parse::<Currency>()
            .map_err(|e| ApiError::validation_error(e.to_string()))?,
        None => Currency::Aki,
    };
    let page = state
        .economy_service
        .transactions_for_user(user.0.id, currency, query.page, query.page_size)
        .await?;
    Ok(Json(page))
}

fn ensure_demo_enabled(state: &AppState) -> Result<(), ApiError> {
    if state.settings.demo_enabled {
        Ok(())
    } else {
        Err(ApiError::forbidden("Demo economy actions are disabled"))
    }
}

fn demo_amount(amount: i64) -> Result<i64, ApiError> {
    if (1..=DEMO_MAX_AMOUNT).contains(&amount) {
        Ok(amount)
    } else {
        Err(ApiError::validation_error(format!(
            "Amount must be between 1 and {}",
            DEMO_MAX_AMOUNT
        )))
    }
}

async fn demo_deposit(
    state: &AppState,
    user_id: i64,
    currency: Currency,
    amount: i64,
) -> Result<impl IntoResponse, ApiError> {
    ensure_demo_enabled(state)?;
    let amount = demo_amount(amount)?;
    let (_, row) = state
        .economy_service
        .deposit_to_user(user_id, currency, amount, &format!("Demo deposit {}", currency))
        .await?;
    Ok((StatusCode::CREATED, Json(row)))
}

async fn demo_deposit_aki(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<AmountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    demo_deposit(&state, user.0.id, Currency::Aki, body.amount).await
}

async fn demo_deposit_rub(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<AmountRequest>,
) -> Result<impl IntoResponse, ApiError> {
    demo_deposit(&state, user.0.id, Currency::Rub, body.amount).await
}

async fn demo_transfer_aki(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<TransferRequest>,
) -> Result<impl IntoResponse, ApiError> {
    ensure_demo_enabled(&state)?;
    let amount = demo_amount(body.amount)?;
    if body.to_user_id == user.0.id {
        return Err(ApiError::validation_error("Cannot transfer to yourself"));
    }
    state
        .user_repo
        .get_by_id(body.to_user_id)
        .await
        .map_err(|e| ApiError::internal_error(e.to_string()))?
        .ok_or_else(|| ApiError::not_found("Recipient not found"))?;

    let result = state
        .economy_service
        .transfer_between_users(user.0.id, body.to_user_id, Currency::Aki, amount)
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

#[cfg(test)]
mod tests {
    use crate::api::test_support::{login, register_active, test_server, test_server_with};
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_wallets_created_on_registration() {
        let (server, _state) = test_server().await;
        register_active(&server, "alice").await;
        let token = login(&server, "alice").await;

        let wallets: Value = server
            .get("/api/v1/economy/wallets/me")
            .authorization_bearer(&token)
            .await
            .json();
        let wallets = wallets.as_array().unwrap();
        assert_eq!(wallets.len(), 2);
        assert!(wallets.iter().all(|w| w["balance"] == 0));
    }

    #[tokio::test]
    async fn test_demo_disabled_is_forbidden() {
        let (server, _state) = test_server().await;
        // the first account is admin
        register_active(&server, "admin").await;
        let token = login(&server, "admin").await;

        server
            .post("/api/v1/economy/demo/deposit-aki")
            .authorization_bearer(&token)
            .json(&json!({"amount": 100}))
            .await
            .assert_status(StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_demo_deposit_and_transfer() {
        let (server, _state) = test_server_with(|config| config.economy.demo_enabled = true).await;
        register_active(&server, "admin").await;
        let bob_id = register_active(&server, "bob").await;
        let admin = login(&server, "admin").await;
        let bob = login(&server, "bob").await;

        // plain users never reach the demo actions
        server
            .post("/api/v1/economy/demo/deposit-aki")
            .authorization_bearer(&bob)
            .json(&json!({"amount": 100}))
            .await
            .assert_status(StatusCode::FORBIDDEN);

        server
            .post("/api/v1/economy/demo/deposit-aki")
            .authorization_bearer(&admin)
            .json(&json!({"amount": 0}))
            .await
            .assert_status(StatusCode::BAD_REQUEST);

        let response = server
            .post("/api/v1/economy/demo/deposit-aki")
            .authorization_bearer(&admin)
            .json(&json!({"amount": 500}))
            .await;
        response.assert_status(StatusCode::CREATED);
        assert_eq!(response.json::<Value>()["tx_type"], "deposit");

        let response = server
            .post("/api/v1/economy/demo/transfer-aki")
            .authorization_bearer(&admin)
            .json(&json!({"to_user_id": bob_id, "amount": 200}))
            .await;
        response.assert_status(StatusCode::CREATED);
        let body: Value = response.json();
        assert_eq!(body["out_tx"]["related_tx_id"], body["in_tx"]["id"]);

        let response = server
            .post("/api/v1/economy/demo/transfer-aki")
            .authorization_bearer(&admin)
            .json(&json!({"to_user_id": bob_id, "amount": 1000}))
            .await;
        response.assert_status(StatusCode::BAD_REQUEST);
        assert_eq!(response.json::<Value>()["error"]["code"], "INSUFFICIENT_FUNDS");

        let history: Value = server
            .get("/api/v1/economy/transactions/me?currency=AKI")
            .authorization_bearer(&bob)
            .await
            .json();
        assert_eq!(history["count"], 1);
        assert_eq!(history["results"][0]["tx_type"], "transfer_in");
        assert_eq!(history["results"][0]["amount"], 200);
    }

    #[tokio::test]
    async fn test_transactions_rejects_unknown_currency() {
        let (server, _state) = test_server().await;
        register_active(&server, "carol").await;
        let token = login(&server, "carol").await;
        server
            .get("/api/v1/economy/transactions/me?currency=USD")
            .authorization_bearer(&token)
            .await
            .assert_status(StatusCode::BAD_REQUEST);
    }
}
