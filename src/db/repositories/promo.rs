//! Promo code and redemption repository
//!
//! The effect of a promo is stored as tagged JSON in `promo_codes.effect`.
//! Every state transition of a redemption runs through [`PromoTxOps`] with
//! the promo row locked.

use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::{CreatePromoInput, PromoCode, PromoEffect, PromoRedemption};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{MySqlConnection, Row, SqliteConnection};
use std::sync::Arc;

#[async_trait]
pub trait PromoRepository: Send + Sync {
    /// Create a promo; `input.code` must already be normalized
    async fn create(&self, input: &CreatePromoInput) -> Result<PromoCode>;

    async fn get_by_code(&self, code: &str) -> Result<Option<PromoCode>>;

    /// Number of APPLIED redemptions of a promo by a user
    async fn applied_count(&self, promo_id: i64, user_id: i64) -> Result<i64>;
}

/// Promo mutations inside a transaction
#[async_trait]
pub trait PromoTxOps: Send {
    async fn promo_lock_by_code(&mut self, code: &str) -> Result<Option<PromoCode>>;

    async fn promo_lock(&mut self, promo_id: i64) -> Result<Option<PromoCode>>;

    async fn promo_increment_uses(&mut self, promo_id: i64) -> Result<()>;

    async fn redemption_by_key(&mut self, key: &str) -> Result<Option<PromoRedemption>>;

    /// Most recent redemption attached to a payment, locked
    async fn redemption_latest_for_payment(
        &mut self,
        payment_id: &str,
    ) -> Result<Option<PromoRedemption>>;

    async fn redemption_applied_count(&mut self, promo_id: i64, user_id: i64) -> Result<i64>;

    /// All PENDING redemptions of a promo
    async fn redemptions_pending(&mut self, promo_id: i64) -> Result<Vec<PromoRedemption>>;

    /// Insert a redemption; the returned row carries its id
    async fn redemption_insert(&mut self, redemption: &PromoRedemption)
        -> Result<PromoRedemption>;

    /// Persist status, top-up amount, payload and timestamps of an existing redemption
    async fn redemption_update(&mut self, redemption: &PromoRedemption) -> Result<()>;
}

pub struct SqlxPromoRepository {
    pool: DynDatabasePool,
}

impl SqlxPromoRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn PromoRepository> {
        Arc::new(Self::new(pool))
    }
}

const PROMO_COLUMNS: &str = "id, code, is_active, starts_at, ends_at, max_total_uses, \
     max_uses_per_user, uses_count, note, effect, created_at";

const REDEMPTION_COLUMNS: &str = "id, promo_id, user_id, status, context, topup_amount_minor, \
     payment_id, topup_id, idempotency_key, reserved_until, redeemed_at, applied_at, ip, \
     user_agent, payload";

const APPLIED_COUNT_SQL: &str = r#"
    SELECT COUNT(*) as count FROM promo_redemptions
    WHERE promo_id = ? AND user_id = ? AND status = 'applied'
"#;

const INSERT_REDEMPTION_SQL: &str = r#"
    INSERT INTO promo_redemptions (promo_id, user_id, status, context, topup_amount_minor,
        payment_id, topup_id, idempotency_key, reserved_until, redeemed_at, applied_at, ip,
        user_agent, payload)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
"#;

const UPDATE_REDEMPTION_SQL: &str = r#"
    UPDATE promo_redemptions
    SET status = ?, topup_amount_minor = ?, reserved_until = ?, applied_at = ?, payload = ?
    WHERE id = ?
"#;

fn effect_to_json(effect: &Option<PromoEffect>) -> Result<Option<String>> {
    effect
        .as_ref()
        .map(|e| serde_json::to_string(e).context("Failed to encode promo effect"))
        .transpose()
}

fn effect_from_json(raw: Option<String>) -> Result<Option<PromoEffect>> {
    raw.filter(|s| !s.trim().is_empty())
        .map(|s| serde_json::from_str(&s).context("Invalid promo effect JSON"))
        .transpose()
}

#[async_trait]
impl PromoRepository for SqlxPromoRepository {
    async fn create(&self, input: &CreatePromoInput) -> Result<PromoCode> {
        let now = Utc::now();
        let effect = effect_to_json(&input.effect)?;
        let sql = r#"
            INSERT INTO promo_codes (code, is_active, starts_at, ends_at, max_total_uses,
                max_uses_per_user, uses_count, note, effect, created_at)
            VALUES (?, ?, ?, ?, ?, ?, 0, ?, ?, ?)
        "#;
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(&input.code)
                .bind(input.is_active)
                .bind(input.starts_at)
                .bind(input.ends_at)
                .bind(input.max_total_uses)
                .bind(input.max_uses_per_user)
                .bind(&input.note)
                .bind(&effect)
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create promo code")?
                .last_insert_rowid(),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(&input.code)
                .bind(input.is_active)
                .bind(input.starts_at)
                .bind(input.ends_at)
                .bind(input.max_total_uses)
                .bind(input.max_uses_per_user)
                .bind(&input.note)
                .bind(&effect)
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create promo code")?
                .last_insert_id() as i64,
        };

        Ok(PromoCode {
            id,
            code: input.code.clone(),
            is_active: input.is_active,
            starts_at: input.starts_at,
            ends_at: input.ends_at,
            max_total_uses: input.max_total_uses,
            max_uses_per_user: input.max_uses_per_user,
            uses_count: 0,
            note: input.note.clone(),
            effect: input.effect.clone(),
            created_at: now,
        })
    }

    async fn get_by_code(&self, code: &str) -> Result<Option<PromoCode>> {
        let sql = format!("SELECT {} FROM promo_codes WHERE code = ?", PROMO_COLUMNS);
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(code)
                .fetch_optional(pool)
                .await
                .context("Failed to get promo code")?
                .as_ref()
                .map(row_to_promo_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(code)
                .fetch_optional(pool)
                .await
                .context("Failed to get promo code")?
                .as_ref()
                .map(row_to_promo_mysql)
                .transpose(),
        }
    }

    async fn applied_count(&self, promo_id: i64, user_id: i64) -> Result<i64> {
        let count = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(APPLIED_COUNT_SQL)
                .bind(promo_id)
                .bind(user_id)
                .fetch_one(pool)
                .await
                .context("Failed to count redemptions")?
                .get("count"),
            DbBackend::Mysql(pool) => sqlx::query(APPLIED_COUNT_SQL)
                .bind(promo_id)
                .bind(user_id)
                .fetch_one(pool)
                .await
                .context("Failed to count redemptions")?
                .get("count"),
        };
        Ok(count)
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn lock_promo_sqlite(
    conn: &mut SqliteConnection,
    column: &str,
    value: PromoKey<'_>,
) -> Result<Option<PromoCode>> {
    let sql = format!("SELECT {} FROM promo_codes WHERE {} = ?", PROMO_COLUMNS, column);
    let query = sqlx::query(&sql);
    let query = match value {
        PromoKey::Id(id) => query.bind(id),
        PromoKey::Code(code) => query.bind(code),
    };
    query
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock promo code")?
        .as_ref()
        .map(row_to_promo_sqlite)
        .transpose()
}

async fn find_redemptions_sqlite(
    conn: &mut SqliteConnection,
    filter: &str,
    value: &str,
) -> Result<Vec<PromoRedemption>> {
    let sql = format!(
        "SELECT {} FROM promo_redemptions WHERE {} ORDER BY redeemed_at DESC, id DESC",
        REDEMPTION_COLUMNS, filter
    );
    let rows = sqlx::query(&sql)
        .bind(value)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to load redemptions")?;
    rows.iter().map(row_to_redemption_sqlite).collect()
}

/// Lookup value for a promo row
enum PromoKey<'a> {
    Id(i64),
    Code(&'a str),
}

#[async_trait]
impl PromoTxOps for SqliteTx {
    async fn promo_lock_by_code(&mut self, code: &str) -> Result<Option<PromoCode>> {
        lock_promo_sqlite(self.conn()?, "code", PromoKey::Code(code)).await
    }

    async fn promo_lock(&mut self, promo_id: i64) -> Result<Option<PromoCode>> {
        lock_promo_sqlite(self.conn()?, "id", PromoKey::Id(promo_id)).await
    }

    async fn promo_increment_uses(&mut self, promo_id: i64) -> Result<()> {
        sqlx::query("UPDATE promo_codes SET uses_count = uses_count + 1 WHERE id = ?")
            .bind(promo_id)
            .execute(self.conn()?)
            .await
            .context("Failed to increment promo uses")?;
        Ok(())
    }

    async fn redemption_by_key(&mut self, key: &str) -> Result<Option<PromoRedemption>> {
        let rows = find_redemptions_sqlite(self.conn()?, "idempotency_key = ?", key).await?;
        Ok(rows.into_iter().next())
    }

    async fn redemption_latest_for_payment(
        &mut self,
        payment_id: &str,
    ) -> Result<Option<PromoRedemption>> {
        let rows = find_redemptions_sqlite(self.conn()?, "payment_id = ?", payment_id).await?;
        Ok(rows.into_iter().next())
    }

    async fn redemption_applied_count(&mut self, promo_id: i64, user_id: i64) -> Result<i64> {
        let count = sqlx::query(APPLIED_COUNT_SQL)
            .bind(promo_id)
            .bind(user_id)
            .fetch_one(self.conn()?)
            .await
            .context("Failed to count redemptions")?
            .get("count");
        Ok(count)
    }

    async fn redemptions_pending(&mut self, promo_id: i64) -> Result<Vec<PromoRedemption>> {
        let sql = format!(
            "SELECT {} FROM promo_redemptions WHERE promo_id = ? AND status = 'pending' ORDER BY id",
            REDEMPTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(promo_id)
            .fetch_all(self.conn()?)
            .await
            .context("Failed to load pending redemptions")?;
        rows.iter().map(row_to_redemption_sqlite).collect()
    }

    async fn redemption_insert(
        &mut self,
        redemption: &PromoRedemption,
    ) -> Result<PromoRedemption> {
        let payload = serde_json::to_string(&redemption.payload)?;
        let id = sqlx::query(INSERT_REDEMPTION_SQL)
            .bind(redemption.promo_id)
            .bind(redemption.user_id)
            .bind(redemption.status.to_string())
            .bind(redemption.context.to_string())
            .bind(redemption.topup_amount_minor)
            .bind(&redemption.payment_id)
            .bind(&redemption.topup_id)
            .bind(&redemption.idempotency_key)
            .bind(redemption.reserved_until)
            .bind(redemption.redeemed_at)
            .bind(redemption.applied_at)
            .bind(&redemption.ip)
            .bind(&redemption.user_agent)
            .bind(payload)
            .execute(self.conn()?)
            .await
            .context("Failed to insert redemption")?
            .last_insert_rowid();
        Ok(PromoRedemption {
            id,
            ..redemption.clone()
        })
    }

    async fn redemption_update(&mut self, redemption: &PromoRedemption) -> Result<()> {
        let payload = serde_json::to_string(&redemption.payload)?;
        sqlx::query(UPDATE_REDEMPTION_SQL)
            .bind(redemption.status.to_string())
            .bind(redemption.topup_amount_minor)
            .bind(redemption.reserved_until)
            .bind(redemption.applied_at)
            .bind(payload)
            .bind(redemption.id)
            .execute(self.conn()?)
            .await
            .context("Failed to update redemption")?;
        Ok(())
    }
}

fn row_to_promo_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<PromoCode> {
    Ok(PromoCode {
        id: row.get("id"),
        code: row.get("code"),
        is_active: row.get("is_active"),
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        max_total_uses: row.get("max_total_uses"),
        max_uses_per_user: row.get("max_uses_per_user"),
        uses_count: row.get("uses_count"),
        note: row.get("note"),
        effect: effect_from_json(row.get("effect"))?,
        created_at: row.get("created_at"),
    })
}

fn row_to_redemption_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<PromoRedemption> {
    let status: String = row.get("status");
    let context: String = row.get("context");
    let payload: String = row.get("payload");
    Ok(PromoRedemption {
        id: row.get("id"),
        promo_id: row.get("promo_id"),
        user_id: row.get("user_id"),
        status: status.parse()?,
        context: context.parse()?,
        topup_amount_minor: row.get("topup_amount_minor"),
        payment_id: row.get("payment_id"),
        topup_id: row.get("topup_id"),
        idempotency_key: row.get("idempotency_key"),
        reserved_until: row.get("reserved_until"),
        redeemed_at: row.get("redeemed_at"),
        applied_at: row.get("applied_at"),
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        payload: serde_json::from_str(&payload).context("Invalid redemption payload")?,
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn lock_promo_mysql(
    conn: &mut MySqlConnection,
    column: &str,
    value: PromoKey<'_>,
) -> Result<Option<PromoCode>> {
    let sql = format!(
        "SELECT {} FROM promo_codes WHERE {} = ? FOR UPDATE",
        PROMO_COLUMNS, column
    );
    let query = sqlx::query(&sql);
    let query = match value {
        PromoKey::Id(id) => query.bind(id),
        PromoKey::Code(code) => query.bind(code),
    };
    query
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock promo code")?
        .as_ref()
        .map(row_to_promo_mysql)
        .transpose()
}

async fn find_redemptions_mysql(
    conn: &mut MySqlConnection,
    filter: &str,
    value: &str,
) -> Result<Vec<PromoRedemption>> {
    let sql = format!(
        "SELECT {} FROM promo_redemptions WHERE {} ORDER BY redeemed_at DESC, id DESC FOR UPDATE",
        REDEMPTION_COLUMNS, filter
    );
    let rows = sqlx::query(&sql)
        .bind(value)
        .fetch_all(&mut *conn)
        .await
        .context("Failed to load redemptions")?;
    rows.iter().map(row_to_redemption_mysql).collect()
}

#[async_trait]
impl PromoTxOps for MysqlTx {
    async fn promo_lock_by_code(&mut self, code: &str) -> Result<Option<PromoCode>> {
        lock_promo_mysql(self.conn()?, "code", PromoKey::Code(code)).await
    }

    async fn promo_lock(&mut self, promo_id: i64) -> Result<Option<PromoCode>> {
        lock_promo_mysql(self.conn()?, "id", PromoKey::Id(promo_id)).await
    }

    async fn promo_increment_uses(&mut self, promo_id: i64) -> Result<()> {
        sqlx::query("UPDATE promo_codes SET uses_count = uses_count + 1 WHERE id = ?")
            .bind(promo_id)
            .execute(self.conn()?)
            .await
            .context("Failed to increment promo uses")?;
        Ok(())
    }

    async fn redemption_by_key(&mut self, key: &str) -> Result<Option<PromoRedemption>> {
        let rows = find_redemptions_mysql(self.conn()?, "idempotency_key = ?", key).await?;
        Ok(rows.into_iter().next())
    }

    async fn redemption_latest_for_payment(
        &mut self,
        payment_id: &str,
    ) -> Result<Option<PromoRedemption>> {
        let rows = find_redemptions_mysql(self.conn()?, "payment_id = ?", payment_id).await?;
        Ok(rows.into_iter().next())
    }

    async fn redemption_applied_count(&mut self, promo_id: i64, user_id: i64) -> Result<i64> {
        let count = sqlx::query(APPLIED_COUNT_SQL)
            .bind(promo_id)
            .bind(user_id)
            .fetch_one(self.conn()?)
            .await
            .context("Failed to count redemptions")?
            .get("count");
        Ok(count)
    }

    async fn redemptions_pending(&mut self, promo_id: i64) -> Result<Vec<PromoRedemption>> {
        let sql = format!(
            "SELECT {} FROM promo_redemptions WHERE promo_id = ? AND status = 'pending' ORDER BY id FOR UPDATE",
            REDEMPTION_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(promo_id)
            .fetch_all(self.conn()?)
            .await
            .context("Failed to load pending redemptions")?;
        rows.iter().map(row_to_redemption_mysql).collect()
    }

    async fn redemption_insert(
        &mut self,
        redemption: &PromoRedemption,
    ) -> Result<PromoRedemption> {
        let payload = serde_json::to_string(&redemption.payload)?;
        let id = sqlx::query(INSERT_REDEMPTION_SQL)
            .bind(redemption.promo_id)
            .bind(redemption.user_id)
            .bind(redemption.status.to_string())
            .bind(redemption.context.to_string())
            .bind(redemption.topup_amount_minor)
            .bind(&redemption.payment_id)
            .bind(&redemption.topup_id)
            .bind(&redemption.idempotency_key)
            .bind(redemption.reserved_until)
            .bind(redemption.redeemed_at)
            .bind(redemption.applied_at)
            .bind(&redemption.ip)
            .bind(&redemption.user_agent)
            .bind(payload)
            .execute(self.conn()?)
            .await
            .context("Failed to insert redemption")?
            .last_insert_id() as i64;
        Ok(PromoRedemption {
            id,
            ..redemption.clone()
        })
    }

    async fn redemption_update(&mut self, redemption: &PromoRedemption) -> Result<()> {
        let payload = serde_json::to_string(&redemption.payload)?;
        sqlx::query(UPDATE_REDEMPTION_SQL)
            .bind(redemption.status.to_string())
            .bind(redemption.topup_amount_minor)
            .bind(redemption.reserved_until)
            .bind(redemption.applied_at)
            .bind(payload)
            .bind(redemption.id)
            .execute(self.conn()?)
            .await
            .context("Failed to update redemption")?;
        Ok(())
    }
}

fn row_to_promo_mysql(row: &sqlx::mysql::MySqlRow) -> Result<PromoCode> {
    Ok(PromoCode {
        id: row.get("id"),
        code: row.get("code"),
        is_active: row.get("is_active"),
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        max_total_uses: row.get("max_total_uses"),
        max_uses_per_user: row.get("max_uses_per_user"),
        uses_count: row.get("uses_count"),
        note: row.get("note"),
        effect: effect_from_json(row.get("effect"))?,
        created_at: row.get("created_at"),
    })
}

fn row_to_redemption_mysql(row: &sqlx::mysql::MySqlRow) -> Result<PromoRedemption> {
    let status: String = row.get("status");
    let context: String = row.get("context");
    let payload: String = row.get("payload");
    Ok(PromoRedemption {
        id: row.get("id"),
        promo_id: row.get("promo_id"),
        user_id: row.get("user_id"),
        status: status.parse()?,
        context: context.parse()?,
        topup_amount_minor: row.get("topup_amount_minor"),
        payment_id: row.get("payment_id"),
        topup_id: row.get("topup_id"),
        idempotency_key: row.get("idempotency_key"),
        reserved_until: row.get("reserved_until"),
        redeemed_at: row.get("redeemed_at"),
        applied_at: row.get("applied_at"),
        ip: row.get("ip"),
        user_agent: row.get("user_agent"),
        payload: serde_json::from_str(&payload).context("Invalid redemption payload")?,
    })
}
