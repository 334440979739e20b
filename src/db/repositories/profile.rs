//! Profile repository

use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::Profile;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use std::sync::Arc;

/// Profile repository trait
#[async_trait]
pub trait ProfileRepository: Send + Sync {
    async fn get(&self, user_id: i64) -> Result<Option<Profile>>;

    /// Persist the editable fields (`display_name`, `bio`, `avatar_url`)
    async fn update(&self, profile: &Profile) -> Result<Profile>;
}

/// Profile mutations inside a transaction
#[async_trait]
pub trait ProfileTxOps: Send {
    /// Create an empty profile unless one exists
    async fn profile_create(&mut self, user_id: i64) -> Result<()>;

    /// Lock a profile row
    async fn profile_lock(&mut self, user_id: i64) -> Result<Option<Profile>>;

    async fn profile_set_xp(&mut self, user_id: i64, xp: i64) -> Result<()>;
}

pub struct SqlxProfileRepository {
    pool: DynDatabasePool,
}

impl SqlxProfileRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn ProfileRepository> {
        Arc::new(Self::new(pool))
    }
}

const PROFILE_SELECT: &str = r#"
    SELECT user_id, display_name, bio, avatar_url, xp, created_at, updated_at
    FROM profiles
    WHERE user_id = ?
"#;

const PROFILE_UPDATE: &str = r#"
    UPDATE profiles
    SET display_name = ?, bio = ?, avatar_url = ?, updated_at = ?
    WHERE user_id = ?
"#;

#[async_trait]
impl ProfileRepository for SqlxProfileRepository {
    async fn get(&self, user_id: i64) -> Result<Option<Profile>> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(PROFILE_SELECT)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("Failed to get profile")?
                .as_ref()
                .map(row_to_profile_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(PROFILE_SELECT)
                .bind(user_id)
                .fetch_optional(pool)
                .await
                .context("Failed to get profile")?
                .as_ref()
                .map(row_to_profile_mysql)
                .transpose(),
        }
    }

    async fn update(&self, profile: &Profile) -> Result<Profile> {
        let now = Utc::now();
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                sqlx::query(PROFILE_UPDATE)
                    .bind(&profile.display_name)
                    .bind(&profile.bio)
                    .bind(&profile.avatar_url)
                    .bind(now)
                    .bind(profile.user_id)
                    .execute(pool)
                    .await
                    .context("Failed to update profile")?;
            }
            DbBackend::Mysql(pool) => {
                sqlx::query(PROFILE_UPDATE)
                    .bind(&profile.display_name)
                    .bind(&profile.bio)
                    .bind(&profile.avatar_url)
                    .bind(now)
                    .bind(profile.user_id)
                    .execute(pool)
                    .await
                    .context("Failed to update profile")?;
            }
        }

        Ok(Profile {
            updated_at: now,
            ..profile.clone()
        })
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

#[async_trait]
impl ProfileTxOps for SqliteTx {
    async fn profile_create(&mut self, user_id: i64) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO profiles (user_id, display_name, xp, created_at, updated_at)
            VALUES (?, '', 0, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(self.conn()?)
        .await
        .context("Failed to create profile")?;
        Ok(())
    }

    async fn profile_lock(&mut self, user_id: i64) -> Result<Option<Profile>> {
        sqlx::query(PROFILE_SELECT)
            .bind(user_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock profile")?
            .as_ref()
            .map(row_to_profile_sqlite)
            .transpose()
    }

    async fn profile_set_xp(&mut self, user_id: i64, xp: i64) -> Result<()> {
        sqlx::query("UPDATE profiles SET xp = ?, updated_at = ? WHERE user_id = ?")
            .bind(xp)
            .bind(Utc::now())
            .bind(user_id)
            .execute(self.conn()?)
            .await
            .context("Failed to update xp")?;
        Ok(())
    }
}

fn row_to_profile_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Profile> {
    Ok(Profile {
        user_id: row.get("user_id"),
        display_name: row.get("display_name"),
        bio: row.get("bio"),
        avatar_url: row.get("avatar_url"),
        xp: row.get("xp"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

#[async_trait]
impl ProfileTxOps for MysqlTx {
    async fn profile_create(&mut self, user_id: i64) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT IGNORE INTO profiles (user_id, display_name, xp, created_at, updated_at)
            VALUES (?, '', 0, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(self.conn()?)
        .await
        .context("Failed to create profile")?;
        Ok(())
    }

    async fn profile_lock(&mut self, user_id: i64) -> Result<Option<Profile>> {
        let sql = format!("{} FOR UPDATE", PROFILE_SELECT.trim_end());
        sqlx::query(&sql)
            .bind(user_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock profile")?
            .as_ref()
            .map(row_to_profile_mysql)
            .transpose()
    }

    async fn profile_set_xp(&mut self, user_id: i64, xp: i64) -> Result<()> {
        sqlx::query("UPDATE profiles SET xp = ?, updated_at = ? WHERE user_id = ?")
            .bind(xp)
            .bind(Utc::now())
            .bind(user_id)
            .execute(self.conn()?)
            .await
            .context("Failed to update xp")?;
        Ok(())
    }
}

fn row_to_profile_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Profile> {
    Ok(Profile {
        user_id: row.get("user_id"),
        display_name: row.get("display_name"),
        bio: row.get("bio"),
        avatar_url: row.get("avatar_url"),
        xp: row.get("xp"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}
