//! Akimori API server

use anyhow::Result;
use std::path::Path;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use akimori::{
    api, api::AppState, cache::create_cache, config::Config, db, services::create_chat_bus,
};

/// How often expired sessions and stale rate-limit entries are dropped
const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "akimori=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Akimori backend...");

    // Load configuration
    let config = Config::load_with_env(Path::new("config.yml"))?;
    tracing::info!("Configuration loaded");

    // Initialize database
    let pool = db::create_pool(&config.database).await?;
    tracing::info!("Database connected: {:?}", config.database.driver);

    // Run migrations
    db::migrations::run_migrations(&pool).await?;
    tracing::info!("Database migrations completed");

    // Initialize cache
    let cache = create_cache(&config.cache).await?;
    tracing::info!("Cache initialized: {:?}", config.cache.driver);

    // Chat fan-out: in process, or across instances through Redis
    let chat_bus = create_chat_bus(&config.chat).await?;
    tracing::info!("Chat bus initialized: {:?}", chat_bus);

    let state = AppState::new(pool, cache, chat_bus, &config);
    state.chat_service.start_relay();
    if state.settings.demo_enabled {
        tracing::warn!("Demo economy endpoints are enabled");
    }
    if state.settings.webhook_secret.is_none() {
        tracing::warn!("No webhook secret configured, payment webhooks will be rejected");
    }

    // Periodic cleanup of sessions and login rate limits, plus a stats line
    {
        let user_service = state.user_service.clone();
        let limiter = state.rate_limiter.clone();
        let stats = state.request_stats.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(CLEANUP_INTERVAL);
            loop {
                interval.tick().await;
                limiter.cleanup().await;
                match user_service.cleanup_expired_sessions().await {
                    Ok(0) => {}
                    Ok(removed) => tracing::debug!(removed, "Expired sessions removed"),
                    Err(e) => tracing::warn!("Session cleanup failed: {}", e),
                }
                tracing::info!(
                    requests = stats.total_requests(),
                    errors = stats.total_errors(),
                    avg_us = stats.avg_response_time_us() as u64,
                    uptime_s = stats.uptime_seconds(),
                    "Request stats"
                );
            }
        });
    }

    // Build router
    let app = api::build_router(state, &config.server.cors_origin);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on http://{}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
