//! User repository
//!
//! Database operations for users.
//!
//! This module provides:
//! - `UserRepository` trait defining the interface for user data access
//! - `SqlxUserRepository` implementing the trait for SQLite and MySQL

use crate::db::{DbBackend, DynDatabasePool};
use crate::models::{User, UserRole, UserShort};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{MySqlPool, Row, SqlitePool};
use std::str::FromStr;
use std::sync::Arc;

/// User repository trait
#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Create a new user
    async fn create(&self, user: &User) -> Result<User>;

    /// Get user by ID
    async fn get_by_id(&self, id: i64) -> Result<Option<User>>;

    /// Get user by username
    async fn get_by_username(&self, username: &str) -> Result<Option<User>>;

    /// Get user by email
    async fn get_by_email(&self, email: &str) -> Result<Option<User>>;

    /// Get user by username or email
    async fn get_by_login(&self, login: &str) -> Result<Option<User>>;

    /// Update a user
    async fn update(&self, user: &User) -> Result<User>;

    /// Count total users
    async fn count(&self) -> Result<i64>;

    /// Case-insensitive username search, excluding one user
    async fn search(&self, query: &str, exclude_id: i64, limit: i64) -> Result<Vec<UserShort>>;

    /// Short views of the given users, in no particular order
    async fn get_short_many(&self, ids: &[i64]) -> Result<Vec<UserShort>>;
}

/// SQLx-based user repository implementation
///
/// Supports both SQLite and MySQL databases.
pub struct SqlxUserRepository {
    pool: DynDatabasePool,
}

impl SqlxUserRepository {
    /// Create a new SQLx user repository
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    /// Create a boxed repository for use with dependency injection
    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn UserRepository> {
        Arc::new(Self::new(pool))
    }
}

const USER_COLUMNS: &str =
    "id, username, email, password_hash, role, is_active, created_at, updated_at";

/// User columns qualified with a table alias, for joins
pub(crate) fn user_columns_of(alias: &str) -> String {
    USER_COLUMNS
        .split(", ")
        .map(|column| format!("{}.{}", alias, column))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Unique keys a user can be looked up by
#[derive(Clone, Copy)]
enum UserLookup<'a> {
    Id(i64),
    Username(&'a str),
    Email(&'a str),
}

impl UserLookup<'_> {
    fn sql(&self) -> String {
        let filter = match self {
            UserLookup::Id(_) => "id = ?",
            UserLookup::Username(_) => "username = ?",
            UserLookup::Email(_) => "LOWER(email) = LOWER(?)",
        };
        format!("SELECT {} FROM users WHERE {}", USER_COLUMNS, filter)
    }
}

impl SqlxUserRepository {
    async fn find(&self, lookup: UserLookup<'_>) -> Result<Option<User>> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => get_user_sqlite(pool, lookup).await,
            DbBackend::Mysql(pool) => get_user_mysql(pool, lookup).await,
        }
    }
}

#[async_trait]
impl UserRepository for SqlxUserRepository {
    async fn create(&self, user: &User) -> Result<User> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => create_user_sqlite(pool, user).await,
            DbBackend::Mysql(pool) => create_user_mysql(pool, user).await,
        }
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<User>> {
        self.find(UserLookup::Id(id)).await
    }

    async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        self.find(UserLookup::Username(username)).await
    }

    async fn get_by_email(&self, email: &str) -> Result<Option<User>> {
        self.find(UserLookup::Email(email)).await
    }

    async fn get_by_login(&self, login: &str) -> Result<Option<User>> {
        if login.contains('@') {
            if let Some(user) = self.get_by_email(login).await? {
                return Ok(Some(user));
            }
        }
        self.get_by_username(login).await
    }

    async fn update(&self, user: &User) -> Result<User> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => update_user_sqlite(pool, user).await,
            DbBackend::Mysql(pool) => update_user_mysql(pool, user).await,
        }
    }

    async fn count(&self) -> Result<i64> {
        let row = match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let row = sqlx::query("SELECT COUNT(*) as count FROM users")
                    .fetch_one(pool)
                    .await
                    .context("Failed to count users")?;
                row.get::<i64, _>("count")
            }
            DbBackend::Mysql(pool) => {
                let row = sqlx::query("SELECT COUNT(*) as count FROM users")
                    .fetch_one(pool)
                    .await
                    .context("Failed to count users")?;
                row.get::<i64, _>("count")
            }
        };
        Ok(row)
    }

    async fn search(&self, query: &str, exclude_id: i64, limit: i64) -> Result<Vec<UserShort>> {
        let pattern = format!("%{}%", escape_like(&query.to_lowercase()));
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => search_users_sqlite(pool, &pattern, exclude_id, limit).await,
            DbBackend::Mysql(pool) => search_users_mysql(pool, &pattern, exclude_id, limit).await,
        }
    }

    async fn get_short_many(&self, ids: &[i64]) -> Result<Vec<UserShort>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let sql = format!(
            "SELECT id, username FROM users WHERE id IN ({}) ORDER BY id",
            placeholders
        );
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let mut query = sqlx::query(&sql);
                for id in ids {
                    query = query.bind(id);
                }
                let rows = query
                    .fetch_all(pool)
                    .await
                    .context("Failed to load users")?;
                Ok(rows
                    .iter()
                    .map(|row| UserShort {
                        id: row.get("id"),
                        username: row.get("username"),
                    })
                    .collect())
            }
            DbBackend::Mysql(pool) => {
                let mut query = sqlx::query(&sql);
                for id in ids {
                    query = query.bind(id);
                }
                let rows = query
                    .fetch_all(pool)
                    .await
                    .context("Failed to load users")?;
                Ok(rows
                    .iter()
                    .map(|row| UserShort {
                        id: row.get("id"),
                        username: row.get("username"),
                    })
                    .collect())
            }
        }
    }
}

/// Escape `%`, `_` and `\` for a LIKE pattern using `\` as the escape character
pub(crate) fn escape_like(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn create_user_sqlite(pool: &SqlitePool, user: &User) -> Result<User> {
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO users (username, email, password_hash, role, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.to_string())
    .bind(user.is_active)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("Failed to create user")?;

    Ok(User {
        id: result.last_insert_rowid(),
        created_at: now,
        updated_at: now,
        ..user.clone()
    })
}

async fn get_user_sqlite(pool: &SqlitePool, lookup: UserLookup<'_>) -> Result<Option<User>> {
    let sql = lookup.sql();
    let query = sqlx::query(&sql);
    let query = match lookup {
        UserLookup::Id(id) => query.bind(id),
        UserLookup::Username(value) | UserLookup::Email(value) => query.bind(value),
    };
    let row = query
        .fetch_optional(pool)
        .await
        .context("Failed to get user")?;

    row.as_ref().map(row_to_user_sqlite).transpose()
}

async fn update_user_sqlite(pool: &SqlitePool, user: &User) -> Result<User> {
    let now = Utc::now();

    sqlx::query(
        r#"
        UPDATE users
        SET username = ?, email = ?, password_hash = ?, role = ?, is_active = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.to_string())
    .bind(user.is_active)
    .bind(now)
    .bind(user.id)
    .execute(pool)
    .await
    .context("Failed to update user")?;

    Ok(User {
        updated_at: now,
        ..user.clone()
    })
}

async fn search_users_sqlite(
    pool: &SqlitePool,
    pattern: &str,
    exclude_id: i64,
    limit: i64,
) -> Result<Vec<UserShort>> {
    let rows = sqlx::query(
        r#"
        SELECT id, username FROM users
        WHERE id <> ? AND LOWER(username) LIKE ? ESCAPE '\'
        ORDER BY username
        LIMIT ?
        "#,
    )
    .bind(exclude_id)
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to search users")?;

    Ok(rows
        .iter()
        .map(|row| UserShort {
            id: row.get("id"),
            username: row.get("username"),
        })
        .collect())
}

pub(crate) fn row_to_user_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<User> {
    let role_str: String = row.get("role");
    let role = UserRole::from_str(&role_str)
        .with_context(|| format!("Invalid role in database: {}", role_str))?;

    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role,
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn create_user_mysql(pool: &MySqlPool, user: &User) -> Result<User> {
    let now = Utc::now();

    let result = sqlx::query(
        r#"
        INSERT INTO users (username, email, password_hash, role, is_active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.to_string())
    .bind(user.is_active)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await
    .context("Failed to create user")?;

    Ok(User {
        id: result.last_insert_id() as i64,
        created_at: now,
        updated_at: now,
        ..user.clone()
    })
}

async fn get_user_mysql(pool: &MySqlPool, lookup: UserLookup<'_>) -> Result<Option<User>> {
    let sql = lookup.sql();
    let query = sqlx::query(&sql);
    let query = match lookup {
        UserLookup::Id(id) => query.bind(id),
        UserLookup::Username(value) | UserLookup::Email(value) => query.bind(value),
    };
    let row = query
        .fetch_optional(pool)
        .await
        .context("Failed to get user")?;

    row.as_ref().map(row_to_user_mysql).transpose()
}

async fn update_user_mysql(pool: &MySqlPool, user: &User) -> Result<User> {
    let now = Utc::now();

    sqlx::query(
        r#"
        UPDATE users
        SET username = ?, email = ?, password_hash = ?, role = ?, is_active = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&user.username)
    .bind(&user.email)
    .bind(&user.password_hash)
    .bind(user.role.to_string())
    .bind(user.is_active)
    .bind(now)
    .bind(user.id)
    .execute(pool)
    .await
    .context("Failed to update user")?;

    Ok(User {
        updated_at: now,
        ..user.clone()
    })
}

async fn search_users_mysql(
    pool: &MySqlPool,
    pattern: &str,
    exclude_id: i64,
    limit: i64,
) -> Result<Vec<UserShort>> {
    let rows = sqlx::query(
        r#"
        SELECT id, username FROM users
        WHERE id <> ? AND LOWER(username) LIKE ? ESCAPE '\\'
        ORDER BY username
        LIMIT ?
        "#,
    )
    .bind(exclude_id)
    .bind(pattern)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("Failed to search users")?;

    Ok(rows
        .iter()
        .map(|row| UserShort {
            id: row.get("id"),
            username: row.get("username"),
        })
        .collect())
}

pub(crate) fn row_to_user_mysql(row: &sqlx::mysql::MySqlRow) -> Result<User> {
    let role_str: String = row.get("role");
    let role = UserRole::from_str(&role_str)
        .with_context(|| format!("Invalid role in database: {}", role_str))?;

    Ok(User {
        id: row.get("id"),
        username: row.get("username"),
        email: row.get("email"),
        password_hash: row.get("password_hash"),
        role,
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
