//! API layer - HTTP handlers and routing
//!
//! Everything is served under `/api/v1`:
//! - Account endpoints (`/auth`)
//! - Profiles and progression (`/users`)
//! - Wallets, ledger and the demo economy actions (`/economy`)
//! - Cosmetic items and inventory (`/customitems`)
//! - Shop offers and purchases (`/shop`)
//! - Promo codes and payment webhooks (`/promo`)
//! - Direct chats (`/chats`) and their WebSocket (`/ws/chats/{id}`)
//! - Kodik catalog mirror (`/catalog`)
//! - Manga titles, translator teams, chapters and pages (`/manga`)
//! - Forum threads and comments (`/forum`)

pub mod auth;
pub mod catalog;
pub mod chats;
pub mod common;
pub mod customitems;
pub mod economy;
pub mod forum;
pub mod manga;
pub mod middleware;
pub mod promo;
pub mod shop;
pub mod users;
pub mod ws;

use axum::{
    http::{header, HeaderValue, Method},
    middleware as axum_middleware,
    routing::get,
    Router,
};
use tower_http::{compression::CompressionLayer, cors::CorsLayer, trace::TraceLayer};

pub use middleware::{ApiError, ApiSettings, AppState, AuthenticatedUser, RequestStats};

/// Build the main API router
pub fn build_api_router(state: AppState) -> Router<AppState> {
    // Admin routes (need admin role)
    let admin_routes = Router::new()
        .nest("/customitems", customitems::admin_router())
        .nest("/shop", shop::admin_router())
        .nest("/promo", promo::admin_router())
        .nest("/manga", manga::admin_router())
        .nest("/forum", forum::admin_router())
        .route_layer(axum_middleware::from_fn(middleware::require_admin))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    // Moderator or admin
    let staff_routes = Router::new()
        .nest("/economy", economy::demo_router())
        .route_layer(axum_middleware::from_fn(middleware::require_staff))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    // Protected routes (need auth but not admin)
    let protected_routes = Router::new()
        .nest("/auth", auth::protected_router())
        .nest("/users", users::protected_router())
        .nest("/economy", economy::protected_router())
        .nest("/customitems", customitems::protected_router())
        .nest("/shop", shop::protected_router())
        .nest("/promo", promo::protected_router())
        .nest("/chats", chats::protected_router())
        .nest("/manga", manga::protected_router())
        .nest("/forum", forum::protected_router())
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ));

    // Public routes
    Router::new()
        .nest("/auth", auth::public_router())
        .nest("/users", users::public_router())
        .nest("/customitems", customitems::public_router())
        .nest("/shop", shop::public_router())
        .nest("/promo", promo::webhook_router())
        .nest("/catalog", catalog::public_router())
        .nest("/manga", manga::public_router())
        .nest("/forum", forum::public_router())
        // Authenticates with the `token` query parameter
        .route("/ws/chats/{conversation_id}", get(ws::chat_socket))
        .merge(admin_routes)
        .merge(staff_routes)
        .merge(protected_routes)
}

/// Build the complete router with middleware
pub fn build_router(state: AppState, cors_origin: &str) -> Router {
    // Cookie auth needs an explicit origin
    let mut cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::PATCH, Method::DELETE])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::COOKIE])
        .allow_credentials(true);
    match cors_origin.parse::<HeaderValue>() {
        Ok(origin) => cors = cors.allow_origin(origin),
        Err(_) => tracing::warn!(cors_origin, "Invalid CORS origin, cross-origin requests disabled"),
    }

    Router::new()
        .nest("/api/v1", build_api_router(state.clone()))
        .layer(cors)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        // Request stats middleware (outermost layer, runs for all requests)
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::request_stats_middleware,
        ))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::cache::{Cache, MemoryCache};
    use crate::config::Config;
    use crate::services::ChatBus;
    use crate::db::repositories::test_support::migrated_pool;
    use axum_test::TestServer;
    use serde_json::{json, Value};
    use std::sync::Arc;

    pub const PASSWORD: &str = "password123";

    /// Server over a fresh in-memory database, email verification off
    pub async fn test_server() -> (TestServer, AppState) {
        test_server_with(|_| {}).await
    }

    pub async fn test_server_with(configure: impl FnOnce(&mut Config)) -> (TestServer, AppState) {
        let mut config = Config::default();
        config.auth.require_email_verification = false;
        configure(&mut config);

        let pool = migrated_pool().await;
        let cache = Arc::new(Cache::Memory(MemoryCache::new()));
        let state = AppState::new(pool, cache, ChatBus::Local, &config);
        let app = build_router(state.clone(), &config.server.cors_origin);
        let server = TestServer::new(app).unwrap();
        (server, state)
    }

    /// Register `username` (email `{username}@example.com`) and return the id
    pub async fn register_active(server: &TestServer, username: &str) -> i64 {
        let response = server
            .post("/api/v1/auth/register")
            .json(&json!({
                "username": username,
                "email": format!("{}@example.com", username),
                "password": PASSWORD,
            }))
            .await;
        response.assert_status(axum::http::StatusCode::CREATED);
        response.json::<Value>()["user"]["id"].as_i64().unwrap()
    }

    /// Log in and return the session token
    pub async fn login(server: &TestServer, username: &str) -> String {
        let response = server
            .post("/api/v1/auth/login")
            .json(&json!({"username_or_email": username, "password": PASSWORD}))
            .await;
        response.assert_status_ok();
        response.json::<Value>()["token"].as_str().unwrap().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::test_server;
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_cors_and_request_stats() {
        let (_server, state) = test_server().await;
        let app = build_router(state.clone(), "http://localhost:3000");

        let preflight = Request::builder()
            .method("OPTIONS")
            .uri("/api/v1/shop/offers")
            .header("origin", "http://localhost:3000")
            .header("access-control-request-method", "GET")
            .body(Body::empty())
            .unwrap();
        let response = app.clone().oneshot(preflight).await.unwrap();
        assert_eq!(
            response.headers()["access-control-allow-origin"],
            "http://localhost:3000"
        );

        let before = state.request_stats.total_errors();
        let missing = Request::builder()
            .uri("/api/v1/nothing-here")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(missing).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(state.request_stats.total_errors(), before + 1);
    }

    #[tokio::test]
    async fn test_invalid_cors_origin_is_ignored() {
        let (_server, state) = test_server().await;
        let app = build_router(state, "bad\norigin");
        let request = Request::builder()
            .uri("/api/v1/shop/offers")
            .header("origin", "http://localhost:3000")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("access-control-allow-origin").is_none());
    }
}
