//! Login sessions
//!
//! The session id is the bearer token. [`SessionRepository::resolve`] joins
//! the owning user in the same query, so authenticating a request costs one
//! round trip. Expiry is checked by the caller, which also removes the row.

use crate::db::repositories::user::{row_to_user_mysql, row_to_user_sqlite, user_columns_of};
use crate::db::{DbBackend, DynDatabasePool};
use crate::models::{Session, User};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use std::sync::Arc;

#[async_trait]
pub trait SessionRepository: Send + Sync {
    async fn create(&self, session: &Session) -> Result<()>;

    /// Session with its user, expired or not
    async fn resolve(&self, token: &str) -> Result<Option<(Session, User)>>;

    async fn delete(&self, token: &str) -> Result<()>;

    /// Drop every session of a user except `keep`; returns how many went
    async fn delete_for_user_except(&self, user_id: i64, keep: Option<&str>) -> Result<u64>;

    /// Drop sessions that expired before `now`; returns how many went
    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64>;
}

pub struct SqlxSessionRepository {
    pool: DynDatabasePool,
}

impl SqlxSessionRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn SessionRepository> {
        Arc::new(Self::new(pool))
    }
}

const INSERT_SQL: &str =
    "INSERT INTO sessions (id, user_id, expires_at, created_at) VALUES (?, ?, ?, ?)";

const DELETE_FOR_USER_SQL: &str =
    "DELETE FROM sessions WHERE user_id = ? AND (? IS NULL OR id <> ?)";

fn resolve_sql() -> String {
    format!(
        "SELECT s.id AS session_id, s.expires_at, s.created_at AS session_created_at, {} \
         FROM sessions s JOIN users u ON u.id = s.user_id WHERE s.id = ?",
        user_columns_of("u")
    )
}

#[async_trait]
impl SessionRepository for SqlxSessionRepository {
    async fn create(&self, session: &Session) -> Result<()> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(INSERT_SQL)
                .bind(&session.id)
                .bind(session.user_id)
                .bind(session.expires_at)
                .bind(session.created_at)
                .execute(pool)
                .await
                .map(|_| ()),
            DbBackend::Mysql(pool) => sqlx::query(INSERT_SQL)
                .bind(&session.id)
                .bind(session.user_id)
                .bind(session.expires_at)
                .bind(session.created_at)
                .execute(pool)
                .await
                .map(|_| ()),
        }
        .context("Failed to create session")
    }

    async fn resolve(&self, token: &str) -> Result<Option<(Session, User)>> {
        let sql = resolve_sql();
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let row = sqlx::query(&sql)
                    .bind(token)
                    .fetch_optional(pool)
                    .await
                    .context("Failed to resolve session")?;
                row.map(|row| {
                    let user = row_to_user_sqlite(&row)?;
                    let session = Session {
                        id: row.get("session_id"),
                        user_id: user.id,
                        expires_at: row.get("expires_at"),
                        created_at: row.get("session_created_at"),
                    };
                    Ok((session, user))
                })
                .transpose()
            }
            DbBackend::Mysql(pool) => {
                let row = sqlx::query(&sql)
                    .bind(token)
                    .fetch_optional(pool)
                    .await
                    .context("Failed to resolve session")?;
                row.map(|row| {
                    let user = row_to_user_mysql(&row)?;
                    let session = Session {
                        id: row.get("session_id"),
                        user_id: user.id,
                        expires_at: row.get("expires_at"),
                        created_at: row.get("session_created_at"),
                    };
                    Ok((session, user))
                })
                .transpose()
            }
        }
    }

    async fn delete(&self, token: &str) -> Result<()> {
        let sql = "DELETE FROM sessions WHERE id = ?";
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql).bind(token).execute(pool).await.map(|_| ()),
            DbBackend::Mysql(pool) => sqlx::query(sql).bind(token).execute(pool).await.map(|_| ()),
        }
        .context("Failed to delete session")
    }

    async fn delete_for_user_except(&self, user_id: i64, keep: Option<&str>) -> Result<u64> {
        let removed = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(DELETE_FOR_USER_SQL)
                .bind(user_id)
                .bind(keep)
                .bind(keep)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            DbBackend::Mysql(pool) => sqlx::query(DELETE_FOR_USER_SQL)
                .bind(user_id)
                .bind(keep)
                .bind(keep)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        }
        .context("Failed to delete sessions of user")?;
        Ok(removed)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let sql = "DELETE FROM sessions WHERE expires_at < ?";
        let removed = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(now)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(now)
                .execute(pool)
                .await
                .map(|r| r.rows_affected()),
        }
        .context("Failed to delete expired sessions")?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_pool};
    use chrono::Duration;

    async fn setup() -> (SqlxSessionRepository, i64, i64) {
        let pool = migrated_pool().await;
        let aki = insert_user(&pool, "aki").await;
        let mori = insert_user(&pool, "mori").await;
        (SqlxSessionRepository::new(pool), aki, mori)
    }

    #[tokio::test]
    async fn test_resolve_returns_owner() {
        let (repo, aki, _) = setup().await;
        let session = Session::new(aki, Duration::days(7));
        repo.create(&session).await.unwrap();

        let (found, user) = repo.resolve(&session.id).await.unwrap().unwrap();
        assert_eq!(found.id, session.id);
        assert_eq!(found.user_id, aki);
        assert_eq!(user.username, "aki");

        assert!(repo.resolve("not-a-session").await.unwrap().is_none());

        repo.delete(&session.id).await.unwrap();
        assert!(repo.resolve(&session.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_keeps_expired_rows() {
        let (repo, aki, _) = setup().await;
        let expired = Session::new(aki, Duration::seconds(-5));
        repo.create(&expired).await.unwrap();

        let (found, _) = repo.resolve(&expired.id).await.unwrap().unwrap();
        assert!(found.is_expired());
    }

    #[tokio::test]
    async fn test_delete_for_user_except_keeps_current() {
        let (repo, aki, mori) = setup().await;
        let current = Session::new(aki, Duration::days(7));
        let other = Session::new(aki, Duration::days(7));
        let foreign = Session::new(mori, Duration::days(7));
        for session in [&current, &other, &foreign] {
            repo.create(session).await.unwrap();
        }

        assert_eq!(repo.delete_for_user_except(aki, Some(&current.id)).await.unwrap(), 1);
        assert!(repo.resolve(&current.id).await.unwrap().is_some());
        assert!(repo.resolve(&other.id).await.unwrap().is_none());
        assert!(repo.resolve(&foreign.id).await.unwrap().is_some());

        assert_eq!(repo.delete_for_user_except(aki, None).await.unwrap(), 1);
        assert!(repo.resolve(&current.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_expired_counts() {
        let (repo, aki, mori) = setup().await;
        let now = Utc::now();
        repo.create(&Session::new(aki, Duration::seconds(-1))).await.unwrap();
        repo.create(&Session::new(mori, Duration::hours(-2))).await.unwrap();
        let live = Session::new(aki, Duration::days(7));
        repo.create(&live).await.unwrap();

        assert_eq!(repo.delete_expired(now).await.unwrap(), 2);
        assert_eq!(repo.delete_expired(now).await.unwrap(), 0);
        assert!(repo.resolve(&live.id).await.unwrap().is_some());

        // Past the 7-day lifetime the last one goes too
        assert_eq!(repo.delete_expired(now + Duration::days(8)).await.unwrap(), 1);
    }
}
