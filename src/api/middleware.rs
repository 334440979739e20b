//! API middleware
//!
//! Contains middleware for:
//! - Authentication (session token validation)
//! - Authorization (admin and staff checks)
//! - Request statistics
//!
//! It also holds the shared [`AppState`] and the [`ApiError`] envelope every
//! handler returns.

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{ttl_from_config, Cache};
use crate::config::Config;
use crate::db::repositories::{
    SqlxChatRepository, SqlxForumRepository, SqlxItemRepository, SqlxMangaRepository,
    SqlxMaterialRepository, SqlxProfileRepository, SqlxPromoRepository, SqlxSessionRepository,
    SqlxShopRepository, SqlxUserRepository, SqlxVerificationRepository, SqlxWalletRepository,
    UserRepository,
};
use crate::db::DynDatabasePool;
use crate::models::User;
use crate::services::{
    CatalogService, ChatBus, ChatError, ChatService, ConnectionRegistry, CustomItemError,
    CustomItemService, EconomyError, EconomyService, EmailService, ForumError, ForumService,
    KodikError, LoginRateLimiter, MangaError, MangaService, ProfileError, ProfileService,
    PromoError, PromoService, ShopError, ShopService, UserService, UserServiceError,
    UserServiceOptions,
};

// ============================================================================
// Request Statistics
// ============================================================================

/// Lightweight request statistics using atomic operations (no locks)
pub struct RequestStats {
    total_requests: AtomicU64,
    /// Responses with a 4xx or 5xx status
    total_errors: AtomicU64,
    /// Total response time in microseconds (for calculating average)
    total_response_time_us: AtomicU64,
    start_time: Instant,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a request with its response time
    pub fn record(&self, duration_us: u64, is_error: bool) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
        if is_error {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.total_errors.load(Ordering::Relaxed)
    }

    /// Get average response time in microseconds
    pub fn avg_response_time_us(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let total_time = self.total_response_time_us.load(Ordering::Relaxed);
        total_time as f64 / total as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Application State
// ============================================================================

/// Settings the handlers read directly
#[derive(Debug, Clone, Default)]
pub struct ApiSettings {
    /// Whether the demo deposit/transfer endpoints are mounted
    pub demo_enabled: bool,
    /// HMAC key of the payment webhooks; `None` rejects every webhook
    pub webhook_secret: Option<String>,
    /// Lifetime of the session cookie
    pub session_days: i64,
}

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub pool: DynDatabasePool,
    pub user_service: Arc<UserService>,
    pub user_repo: Arc<dyn UserRepository>,
    pub profile_service: Arc<ProfileService>,
    pub economy_service: Arc<EconomyService>,
    pub customitem_service: Arc<CustomItemService>,
    pub shop_service: Arc<ShopService>,
    pub promo_service: Arc<PromoService>,
    pub chat_service: Arc<ChatService>,
    pub catalog_service: Arc<CatalogService>,
    pub manga_service: Arc<MangaService>,
    pub forum_service: Arc<ForumService>,
    pub rate_limiter: Arc<LoginRateLimiter>,
    pub request_stats: Arc<RequestStats>,
    pub settings: Arc<ApiSettings>,
}

impl AppState {
    /// Wire repositories and services over one pool, cache and chat bus
    pub fn new(
        pool: DynDatabasePool,
        cache: Arc<Cache>,
        chat_bus: ChatBus,
        config: &Config,
    ) -> Self {
        let ttl = ttl_from_config(&config.cache);

        let user_repo = SqlxUserRepository::boxed(pool.clone());
        let item_repo = SqlxItemRepository::boxed(pool.clone());

        let user_service = Arc::new(UserService::new(
            pool.clone(),
            user_repo.clone(),
            SqlxSessionRepository::boxed(pool.clone()),
            SqlxVerificationRepository::boxed(pool.clone()),
            Arc::new(EmailService::new(config.smtp.clone())),
            UserServiceOptions::from(&config.auth),
        ));
        let profile_service = Arc::new(ProfileService::new(
            pool.clone(),
            SqlxProfileRepository::boxed(pool.clone()),
            user_repo.clone(),
            item_repo.clone(),
        ));
        let economy_service = Arc::new(EconomyService::new(
            pool.clone(),
            SqlxWalletRepository::boxed(pool.clone()),
        ));
        let customitem_service = Arc::new(CustomItemService::new(
            item_repo.clone(),
            cache.clone(),
            ttl,
        ));
        let shop_service = Arc::new(ShopService::new(
            pool.clone(),
            SqlxShopRepository::boxed(pool.clone()),
            item_repo.clone(),
            cache,
            ttl,
        ));
        let promo_service = Arc::new(PromoService::new(
            pool.clone(),
            SqlxPromoRepository::boxed(pool.clone()),
            item_repo,
            chrono::Duration::minutes(config.promo.reserve_ttl_minutes),
        ));
        let chat_service = Arc::new(
            ChatService::new(
                pool.clone(),
                SqlxChatRepository::boxed(pool.clone()),
                user_repo.clone(),
                ConnectionRegistry::new(),
            )
            .with_limits(config.chat.page_size, config.chat.search_limit)
            .with_bus(chat_bus),
        );
        let material_repo = SqlxMaterialRepository::boxed(pool.clone());
        let manga_repo = SqlxMangaRepository::boxed(pool.clone());
        let catalog_service = Arc::new(CatalogService::new(material_repo.clone()));
        let manga_service = Arc::new(MangaService::new(
            pool.clone(),
            manga_repo.clone(),
            user_repo.clone(),
        ));
        let forum_service = Arc::new(ForumService::new(
            pool.clone(),
            SqlxForumRepository::boxed(pool.clone()),
            manga_repo,
            material_repo,
        ));

        Self {
            pool,
            user_service,
            user_repo,
            profile_service,
            economy_service,
            customitem_service,
            shop_service,
            promo_service,
            chat_service,
            catalog_service,
            manga_service,
            forum_service,
            rate_limiter: Arc::new(LoginRateLimiter::new()),
            request_stats: Arc::new(RequestStats::new()),
            settings: Arc::new(ApiSettings {
                demo_enabled: config.economy.demo_enabled,
                webhook_secret: config
                    .promo
                    .webhook_secret
                    .clone()
                    .filter(|s| !s.is_empty()),
                session_days: config.auth.session_days,
            }),
        }
    }

    /// `Max-Age` of the session cookie
    pub fn session_max_age(&self) -> Duration {
        Duration::from_secs(self.settings.session_days.max(1) as u64 * 24 * 60 * 60)
    }
}

// ============================================================================
// Authentication
// ============================================================================

/// Authenticated user extracted from request
#[derive(Debug, Clone)]
pub struct AuthenticatedUser(pub User);

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("Authentication required"))
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new("FORBIDDEN", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new("CONFLICT", message)
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::new("INTERNAL_ERROR", message)
    }

    /// Log the cause and hide it from the client
    fn internal(err: anyhow::Error) -> Self {
        tracing::error!(error = %format!("{:#}", err), "Internal error");
        Self::internal_error("Internal server error")
    }
}

/// HTTP status for an error code.
///
/// Upper-case codes are generic; lower-case codes are promo reasons, where
/// lookups are 404, the idempotency clash is 409 and the rest are 400.
pub fn status_for_code(code: &str) -> StatusCode {
    match code {
        "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
        "FORBIDDEN" | "ACCOUNT_INACTIVE" => StatusCode::FORBIDDEN,
        "NOT_FOUND" => StatusCode::NOT_FOUND,
        "VALIDATION_ERROR" | "INSUFFICIENT_FUNDS" => StatusCode::BAD_REQUEST,
        "CONFLICT" => StatusCode::CONFLICT,
        "RATE_LIMIT" => StatusCode::TOO_MANY_REQUESTS,
        "idempotency_key_conflict" | "payment_id_conflict" => StatusCode::CONFLICT,
        c if c.ends_with("_not_found") => StatusCode::NOT_FOUND,
        c if !c.is_empty() && c.chars().all(|ch| ch.is_ascii_lowercase() || ch == '_') => {
            StatusCode::BAD_REQUEST
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for_code(&self.error.code);
        (status, Json(self)).into_response()
    }
}

impl From<UserServiceError> for ApiError {
    fn from(err: UserServiceError) -> Self {
        match err {
            UserServiceError::AuthenticationError(msg) => ApiError::unauthorized(msg),
            UserServiceError::AccountInactive => {
                ApiError::new("ACCOUNT_INACTIVE", "Account is not activated")
            }
            UserServiceError::ValidationError(msg) => ApiError::validation_error(msg),
            UserServiceError::UserExists(msg) => ApiError::conflict(msg),
            UserServiceError::UserNotFound => ApiError::not_found("User not found"),
            UserServiceError::InternalError(e) => ApiError::internal(e),
        }
    }
}

impl From<ProfileError> for ApiError {
    fn from(err: ProfileError) -> Self {
        match err {
            ProfileError::Validation(msg) => ApiError::validation_error(msg),
            ProfileError::UserNotFound => ApiError::not_found("User not found"),
            ProfileError::Internal(e) => ApiError::internal(e),
        }
    }
}

impl From<EconomyError> for ApiError {
    fn from(err: EconomyError) -> Self {
        match err {
            EconomyError::Validation(msg) => ApiError::validation_error(msg),
            EconomyError::WalletNotFound => ApiError::not_found("Wallet not found"),
            EconomyError::InsufficientFunds => {
                ApiError::new("INSUFFICIENT_FUNDS", "Insufficient funds")
            }
            EconomyError::CurrencyMismatch => {
                ApiError::validation_error("Wallet currencies do not match")
            }
            EconomyError::IdempotencyConflict => {
                ApiError::conflict("Idempotency key already used for another operation")
            }
            EconomyError::Internal(e) => ApiError::internal(e),
        }
    }
}

impl From<CustomItemError> for ApiError {
    fn from(err: CustomItemError) -> Self {
        match err {
            CustomItemError::NotFound => ApiError::not_found("Item not found"),
            CustomItemError::Validation(msg) => ApiError::validation_error(msg),
            CustomItemError::SlugExists(slug) => {
                ApiError::conflict(format!("Slug '{}' is already taken", slug))
            }
            CustomItemError::Internal(e) => ApiError::internal(e),
        }
    }
}

impl From<ShopError> for ApiError {
    fn from(err: ShopError) -> Self {
        match err {
            ShopError::Validation(msg) => ApiError::validation_error(msg),
            ShopError::NotFound(msg) => ApiError::not_found(msg),
            ShopError::Conflict(msg) => ApiError::conflict(msg),
            ShopError::InsufficientFunds => {
                ApiError::new("INSUFFICIENT_FUNDS", "Not enough AKI")
            }
            ShopError::Internal(e) => ApiError::internal(e),
        }
    }
}

impl From<PromoError> for ApiError {
    fn from(err: PromoError) -> Self {
        match err {
            PromoError::Rejected(reason) => ApiError::new(reason.as_str(), reason.as_str()),
            PromoError::Validation(msg) => ApiError::validation_error(msg),
            PromoError::CodeExists(code) => {
                ApiError::conflict(format!("Promo code '{}' already exists", code))
            }
            PromoError::Internal(e) => ApiError::internal(e),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::NotFound => ApiError::not_found("Conversation not found"),
            ChatError::UserNotFound => ApiError::not_found("User not found"),
            ChatError::Forbidden => ApiError::forbidden("Not a participant of this conversation"),
            ChatError::Validation(msg) => ApiError::validation_error(msg),
            ChatError::Internal(e) => ApiError::internal(e),
        }
    }
}

impl From<MangaError> for ApiError {
    fn from(err: MangaError) -> Self {
        match err {
            MangaError::Validation(msg) => ApiError::validation_error(msg),
            MangaError::NotFound(msg) => ApiError::not_found(msg),
            MangaError::Conflict(msg) => ApiError::conflict(msg),
            MangaError::Forbidden(msg) => ApiError::forbidden(msg),
            MangaError::Internal(e) => ApiError::internal(e),
        }
    }
}

impl From<ForumError> for ApiError {
    fn from(err: ForumError) -> Self {
        match err {
            ForumError::Validation(msg) => ApiError::validation_error(msg),
            ForumError::NotFound(msg) => ApiError::not_found(msg),
            ForumError::Conflict(msg) => ApiError::conflict(msg),
            ForumError::Forbidden(msg) => ApiError::forbidden(msg),
            ForumError::Internal(e) => ApiError::internal(e),
        }
    }
}

impl From<KodikError> for ApiError {
    fn from(err: KodikError) -> Self {
        match err {
            KodikError::Internal(e) => ApiError::internal(e),
            other => ApiError::internal(anyhow::anyhow!(other.to_string())),
        }
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Session token from `Authorization: Bearer` or the `session` cookie
pub fn extract_session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        if let Ok(auth_str) = auth_header.to_str() {
            if let Some(token) = auth_str.strip_prefix("Bearer ") {
                return Some(token.trim().to_string());
            }
        }
    }

    if let Some(cookie_header) = headers.get(header::COOKIE) {
        if let Ok(cookie_str) = cookie_header.to_str() {
            for cookie in cookie_str.split(';') {
                let cookie = cookie.trim();
                if let Some(token) = cookie.strip_prefix("session=") {
                    if !token.is_empty() {
                        return Some(token.to_string());
                    }
                }
            }
        }
    }

    None
}

/// Authentication middleware
pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_session_token(request.headers())
        .ok_or_else(|| ApiError::unauthorized("Missing authentication token"))?;

    let user = state
        .user_service
        .validate_session(&token)
        .await?
        .ok_or_else(|| ApiError::unauthorized("Invalid or expired session"))?;

    request.extensions_mut().insert(AuthenticatedUser(user));
    Ok(next.run(request).await)
}

/// Admin authorization middleware
pub async fn require_admin(request: Request, next: Next) -> Result<Response, ApiError> {
    let user = request
        .extensions()
        .get::<AuthenticatedUser>()
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    if !user.0.is_admin() {
        return Err(ApiError::forbidden("Admin privileges required"));
    }

    Ok(next.run(request).await)
}

/// Moderator-or-admin authorization middleware
pub async fn require_staff(request: Request, next: Next) -> Result<Response, ApiError> {
    let user = request
        .extensions()
        .get::<AuthenticatedUser>()
        .ok_or_else(|| ApiError::unauthorized("Authentication required"))?;

    if !user.0.is_staff() {
        return Err(ApiError::forbidden("Moderator privileges required"));
    }

    Ok(next.run(request).await)
}

/// Request statistics middleware
///
/// Records request count, error count and response time.
pub async fn request_stats_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;

    let duration_us = start.elapsed().as_micros() as u64;
    let status = response.status();
    state
        .request_stats
        .record(duration_us, status.is_client_error() || status.is_server_error());

    response
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(50))]

        #[test]
        fn bearer_token_round_trips(token in "[A-Za-z0-9-]{1,64}") {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::AUTHORIZATION,
                format!("Bearer {}", token).parse().unwrap(),
            );
            prop_assert_eq!(extract_session_token(&headers), Some(token));
        }

        #[test]
        fn cookie_token_found_among_others(token in "[a-f0-9-]{8,40}", other in "[a-z]{1,10}") {
            let mut headers = HeaderMap::new();
            headers.insert(
                header::COOKIE,
                format!("x{}=1; session={}; lang=ru", other, token).parse().unwrap(),
            );
            prop_assert_eq!(extract_session_token(&headers), Some(token));
        }

        #[test]
        fn reason_codes_are_client_errors(code in "[a-z]{1,12}(_[a-z]{1,12}){0,3}") {
            let status = status_for_code(&code);
            prop_assert!(status.is_client_error());
        }
    }
}
