//! Email verification code repository

use crate::db::{DbBackend, DynDatabasePool};
use crate::models::EmailVerification;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::Row;
use std::sync::Arc;

#[async_trait]
pub trait VerificationRepository: Send + Sync {
    /// Store a new code; the returned row carries its id
    async fn create(&self, verification: &EmailVerification) -> Result<EmailVerification>;

    /// Look up a user's code
    async fn find_for_user(&self, user_id: i64, code: &str) -> Result<Option<EmailVerification>>;

    /// Whether any row already uses `code`
    async fn code_exists(&self, code: &str) -> Result<bool>;

    async fn mark_used(&self, id: i64) -> Result<()>;
}

pub struct SqlxVerificationRepository {
    pool: DynDatabasePool,
}

impl SqlxVerificationRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn VerificationRepository> {
        Arc::new(Self::new(pool))
    }
}

const INSERT_SQL: &str = r#"
    INSERT INTO email_verifications (user_id, code, expires_at, is_used, created_at)
    VALUES (?, ?, ?, ?, ?)
"#;

const FIND_SQL: &str = r#"
    SELECT id, user_id, code, expires_at, is_used, created_at
    FROM email_verifications
    WHERE user_id = ? AND code = ?
"#;

#[async_trait]
impl VerificationRepository for SqlxVerificationRepository {
    async fn create(&self, verification: &EmailVerification) -> Result<EmailVerification> {
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(INSERT_SQL)
                .bind(verification.user_id)
                .bind(&verification.code)
                .bind(verification.expires_at)
                .bind(verification.is_used)
                .bind(verification.created_at)
                .execute(pool)
                .await
                .context("Failed to create verification code")?
                .last_insert_rowid(),
            DbBackend::Mysql(pool) => sqlx::query(INSERT_SQL)
                .bind(verification.user_id)
                .bind(&verification.code)
                .bind(verification.expires_at)
                .bind(verification.is_used)
                .bind(verification.created_at)
                .execute(pool)
                .await
                .context("Failed to create verification code")?
                .last_insert_id() as i64,
        };

        Ok(EmailVerification {
            id,
            ..verification.clone()
        })
    }

    async fn find_for_user(&self, user_id: i64, code: &str) -> Result<Option<EmailVerification>> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let row = sqlx::query(FIND_SQL)
                    .bind(user_id)
                    .bind(code)
                    .fetch_optional(pool)
                    .await
                    .context("Failed to get verification code")?;
                Ok(row.map(|row| EmailVerification {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    code: row.get("code"),
                    expires_at: row.get("expires_at"),
                    is_used: row.get("is_used"),
                    created_at: row.get("created_at"),
                }))
            }
            DbBackend::Mysql(pool) => {
                let row = sqlx::query(FIND_SQL)
                    .bind(user_id)
                    .bind(code)
                    .fetch_optional(pool)
                    .await
                    .context("Failed to get verification code")?;
                Ok(row.map(|row| EmailVerification {
                    id: row.get("id"),
                    user_id: row.get("user_id"),
                    code: row.get("code"),
                    expires_at: row.get("expires_at"),
                    is_used: row.get("is_used"),
                    created_at: row.get("created_at"),
                }))
            }
        }
    }

    async fn code_exists(&self, code: &str) -> Result<bool> {
        let sql = "SELECT COUNT(*) as count FROM email_verifications WHERE code = ?";
        let count: i64 = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(code)
                .fetch_one(pool)
                .await
                .context("Failed to check verification code")?
                .get("count"),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(code)
                .fetch_one(pool)
                .await
                .context("Failed to check verification code")?
                .get("count"),
        };
        Ok(count > 0)
    }

    async fn mark_used(&self, id: i64) -> Result<()> {
        let sql = "UPDATE email_verifications SET is_used = ? WHERE id = ?";
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                sqlx::query(sql)
                    .bind(true)
                    .bind(id)
                    .execute(pool)
                    .await
                    .context("Failed to mark verification code used")?;
            }
            DbBackend::Mysql(pool) => {
                sqlx::query(sql)
                    .bind(true)
                    .bind(id)
                    .execute(pool)
                    .await
                    .context("Failed to mark verification code used")?;
            }
        }
        Ok(())
    }
}
