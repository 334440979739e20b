//! Fixtures shared by repository tests

use crate::db::repositories::{ItemRepository, SqlxItemRepository, SqlxUserRepository, UserRepository};
use crate::config::{DatabaseConfig, DatabaseDriver};
use crate::db::{create_pool, create_test_pool, migrations, DynDatabasePool};
use crate::models::{CreateItemInput, Item, ItemType, User, UserRole};

/// In-memory database with every migration applied
pub async fn migrated_pool() -> DynDatabasePool {
    let pool = create_test_pool().await.expect("Failed to create test pool");
    migrations::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Database file with a full connection pool, for tests that race
/// transactions against each other. The directory must outlive the pool.
pub async fn migrated_file_pool() -> (tempfile::TempDir, DynDatabasePool) {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let config = DatabaseConfig {
        driver: DatabaseDriver::Sqlite,
        url: dir.path().join("akimori.db").to_string_lossy().into_owned(),
    };
    let pool = create_pool(&config).await.expect("Failed to create file pool");
    migrations::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");
    (dir, pool)
}

/// Insert an active user and return its id
pub async fn insert_user(pool: &DynDatabasePool, username: &str) -> i64 {
    let mut user = User::new(
        username.to_string(),
        format!("{}@example.com", username),
        "$argon2id$stub".to_string(),
        UserRole::User,
    );
    user.is_active = true;
    SqlxUserRepository::new(pool.clone())
        .create(&user)
        .await
        .expect("Failed to create test user")
        .id
}

/// A catalog item input with a file URL and the given AKI price
pub fn item_input(item_type: ItemType, title: &str, price: i64) -> CreateItemInput {
    let mut input: CreateItemInput = serde_json::from_value(serde_json::json!({
        "type": item_type,
        "title": title,
        "file_url": "https://cdn.example.com/x.webp",
        "price_aki": price,
    }))
    .expect("valid item input");
    input.normalize();
    input
}

/// Insert an active catalog item
pub async fn insert_item(pool: &DynDatabasePool, item_type: ItemType, title: &str, price: i64) -> Item {
    SqlxItemRepository::new(pool.clone())
        .create(&item_input(item_type, title, price))
        .await
        .expect("Failed to create test item")
}
