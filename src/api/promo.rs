//! Promo code API endpoints
//!
//! - POST /api/v1/promo/validate
//! - POST /api/v1/promo/redeem
//! - POST /api/v1/promo/quote
//! - POST /api/v1/promo/reserve
//! - POST /api/v1/promo/payments/{payment_id}/succeeded (signed webhook)
//! - POST /api/v1/promo/payments/{payment_id}/cancelled (signed webhook)
//! - POST /api/v1/promo/codes (admin)
//!
//! Refusals carry the short reason code (`promo_not_found`,
//! `already_redeemed`, ...) as the error code.
//!
//! Webhook bodies are JSON `{"payment_id": ..., "amount_minor": ...}` signed
//! as a whole. The signed `payment_id` must match the path, and a success is
//! settled with the signed `amount_minor`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Json, Router,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::api::common::client_info;
use crate::api::middleware::{ApiError, AppState, AuthenticatedUser};
use crate::models::{CreatePromoInput, PromoRedemption, PromoView};
use crate::services::ReserveInput;

/// Header carrying the hex HMAC-SHA256 of the raw webhook body
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Deserialize)]
pub struct CodeRequest {
    #[serde(default)]
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct QuoteRequest {
    #[serde(default)]
    pub code: String,
    pub topup_amount_minor: i64,
}

/// Signed body of a payment webhook
#[derive(Debug, Deserialize, Serialize)]
pub struct PaymentEvent {
    pub payment_id: String,
    /// Amount actually paid, required on success
    #[serde(default)]
    pub amount_minor: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct RedeemResponse {
    pub ok: bool,
    pub redeemed_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

pub fn protected_router() -> Router<AppState> {
    Router::new()
        .route("/validate", post(validate))
        .route("/redeem", post(redeem))
        .route("/quote", post(quote))
        .route("/reserve", post(reserve))
}

/// Authenticated by signature, not by session
pub fn webhook_router() -> Router<AppState> {
    Router::new()
        .route("/payments/{payment_id}/succeeded", post(payment_succeeded))
        .route("/payments/{payment_id}/cancelled", post(payment_cancelled))
}

pub fn admin_router() -> Router<AppState> {
    Router::new().route("/codes", post(create_code))
}

/// Constant-time check of a hex HMAC-SHA256 signature over `body`
pub fn verify_signature(secret: &str, body: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = data_encoding::HEXLOWER_PERMISSIVE.decode(signature_hex.trim().as_bytes())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&signature).is_ok()
}

/// Hex HMAC-SHA256 of `body`, as payment providers are expected to send it
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(data_encoding::HEXLOWER.encode(&mac.finalize().into_bytes()))
}

/// Check the signature and return the event, which must be for `payment_id`
fn authorize_webhook(
    state: &AppState,
    headers: &HeaderMap,
    payment_id: &str,
    body: &[u8],
) -> Result<PaymentEvent, ApiError> {
    let Some(secret) = state.settings.webhook_secret.as_deref() else {
        return Err(ApiError::forbidden("Payment webhooks are not configured"));
    };
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| ApiError::forbidden("Missing webhook signature"))?;
    if !verify_signature(secret, body, signature) {
        tracing::warn!("Rejected payment webhook with a bad signature");
        return Err(ApiError::forbidden("Invalid webhook signature"));
    }
    let event: PaymentEvent = serde_json::from_slice(body)
        .map_err(|e| ApiError::validation_error(format!("Invalid webhook body: {}", e)))?;
    if event.payment_id.trim() != payment_id.trim() {
        tracing::warn!(
            path_payment_id = payment_id,
            signed_payment_id = %event.payment_id,
            "Rejected payment webhook signed for another payment"
        );
        return Err(ApiError::forbidden("Webhook is signed for another payment"));
    }
    Ok(event)
}

async fn validate(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<CodeRequest>,
) -> Result<Json<PromoView>, ApiError> {
    Ok(Json(state.promo_service.validate(&body.code, user.0.id).await?))
}

async fn redeem(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: HeaderMap,
    Json(body): Json<CodeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let redemption = state
        .promo_service
        .redeem_manual(&body.code, user.0.id, client_info(&headers))
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RedeemResponse {
            ok: true,
            redeemed_at: redemption.redeemed_at,
            payload: redemption.payload,
        }),
    ))
}

async fn quote(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    Json(body): Json<QuoteRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    Ok(Json(
        state
            .promo_service
            .quote_topup(&body.code, user.0.id, body.topup_amount_minor)
            .await?,
    ))
}

async fn reserve(
    State(state): State<AppState>,
    user: AuthenticatedUser,
    headers: HeaderMap,
    Json(body): Json<ReserveInput>,
) -> Result<Json<PromoRedemption>, ApiError> {
    Ok(Json(
        state
            .promo_service
            .reserve(user.0.id, body, client_info(&headers))
            .await?,
    ))
}

async fn payment_succeeded(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<PromoRedemption>, ApiError> {
    let event = authorize_webhook(&state, &headers, &payment_id, &body)?;
    Ok(Json(
        state
            .promo_service
            .apply_after_payment(&payment_id, event.amount_minor.unwrap_or_default())
            .await?,
    ))
}

async fn payment_cancelled(
    State(state): State<AppState>,
    Path(payment_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<Option<PromoRedemption>>, ApiError> {
    authorize_webhook(&state, &headers, &payment_id, &body)?;
    Ok(Json(
        state.promo_service.cancel_reservation(&payment_id).await?,
    ))
}

async fn create_code(
    State(state): State<AppState>,
    Json(body): Json<CreatePromoInput>,
) -> Result<impl IntoResponse, ApiError> {
    let promo = state.promo_service.create(body).await?;
    Ok((StatusCode::CREATED, Json(promo)))
}
