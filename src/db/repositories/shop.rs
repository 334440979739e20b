//! Shop offer and purchase repository

use crate::db::repositories::item::{qualified_item_columns, row_to_item_mysql, row_to_item_sqlite};
use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::{CreateOfferInput, Item, Offer, Purchase};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use std::sync::Arc;

#[async_trait]
pub trait ShopRepository: Send + Sync {
    async fn create_offer(&self, input: &CreateOfferInput) -> Result<Offer>;

    /// Active offers with their items, newest first
    async fn list_active_offers(&self) -> Result<Vec<(Offer, Item)>>;

    async fn get_offer(&self, id: i64) -> Result<Option<(Offer, Item)>>;

    async fn get_offer_by_item_slug(&self, slug: &str) -> Result<Option<(Offer, Item)>>;
}

/// Shop mutations inside a transaction
#[async_trait]
pub trait ShopTxOps: Send {
    /// Lock an offer by id
    async fn offer_lock(&mut self, offer_id: i64) -> Result<Option<Offer>>;

    /// Lock the offer of an item
    async fn offer_lock_by_item(&mut self, item_id: i64) -> Result<Option<Offer>>;

    /// Insert a purchase; the returned row carries its id
    async fn purchase_insert(&mut self, purchase: &Purchase) -> Result<Purchase>;
}

pub struct SqlxShopRepository {
    pool: DynDatabasePool,
}

impl SqlxShopRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn ShopRepository> {
        Arc::new(Self::new(pool))
    }
}

const OFFER_COLUMNS: &str =
    "id, item_id, is_active, price_override_aki, starts_at, ends_at, created_at";

const INSERT_PURCHASE_SQL: &str = r#"
    INSERT INTO purchases (user_id, item_id, price_aki, transaction_id, status, created_at)
    VALUES (?, ?, ?, ?, ?, ?)
"#;

/// Offers joined with items. Offer columns are aliased so that the item
/// columns keep their plain names.
fn offer_join_sql(filter: &str) -> String {
    format!(
        r#"
        SELECT o.id AS offer_id, o.is_active AS offer_is_active, o.price_override_aki,
               o.starts_at, o.ends_at, o.created_at AS offer_created_at, {}
        FROM shop_offers o
        JOIN items i ON i.id = o.item_id
        WHERE {}
        ORDER BY o.created_at DESC, o.id DESC
        "#,
        qualified_item_columns(),
        filter
    )
}

#[async_trait]
impl ShopRepository for SqlxShopRepository {
    async fn create_offer(&self, input: &CreateOfferInput) -> Result<Offer> {
        let now = Utc::now();
        let sql = r#"
            INSERT INTO shop_offers (item_id, is_active, price_override_aki, starts_at, ends_at, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
        "#;
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(input.item_id)
                .bind(input.is_active)
                .bind(input.price_override_aki)
                .bind(input.starts_at)
                .bind(input.ends_at)
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create offer")?
                .last_insert_rowid(),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(input.item_id)
                .bind(input.is_active)
                .bind(input.price_override_aki)
                .bind(input.starts_at)
                .bind(input.ends_at)
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create offer")?
                .last_insert_id() as i64,
        };

        Ok(Offer {
            id,
            item_id: input.item_id,
            is_active: input.is_active,
            price_override_aki: input.price_override_aki,
            starts_at: input.starts_at,
            ends_at: input.ends_at,
            created_at: now,
        })
    }

    async fn list_active_offers(&self) -> Result<Vec<(Offer, Item)>> {
        let sql = offer_join_sql("o.is_active = ?");
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let rows = sqlx::query(&sql)
                    .bind(true)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list offers")?;
                rows.iter().map(row_to_offer_item_sqlite).collect()
            }
            DbBackend::Mysql(pool) => {
                let rows = sqlx::query(&sql)
                    .bind(true)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list offers")?;
                rows.iter().map(row_to_offer_item_mysql).collect()
            }
        }
    }

    async fn get_offer(&self, id: i64) -> Result<Option<(Offer, Item)>> {
        let sql = offer_join_sql("o.id = ?");
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get offer")?
                .as_ref()
                .map(row_to_offer_item_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get offer")?
                .as_ref()
                .map(row_to_offer_item_mysql)
                .transpose(),
        }
    }

    async fn get_offer_by_item_slug(&self, slug: &str) -> Result<Option<(Offer, Item)>> {
        let sql = offer_join_sql("i.slug = ?");
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .context("Failed to get offer")?
                .as_ref()
                .map(row_to_offer_item_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .context("Failed to get offer")?
                .as_ref()
                .map(row_to_offer_item_mysql)
                .transpose(),
        }
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

#[async_trait]
impl ShopTxOps for SqliteTx {
    async fn offer_lock(&mut self, offer_id: i64) -> Result<Option<Offer>> {
        let sql = format!("SELECT {} FROM shop_offers WHERE id = ?", OFFER_COLUMNS);
        sqlx::query(&sql)
            .bind(offer_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock offer")?
            .as_ref()
            .map(row_to_offer_sqlite)
            .transpose()
    }

    async fn offer_lock_by_item(&mut self, item_id: i64) -> Result<Option<Offer>> {
        let sql = format!("SELECT {} FROM shop_offers WHERE item_id = ?", OFFER_COLUMNS);
        sqlx::query(&sql)
            .bind(item_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock offer")?
            .as_ref()
            .map(row_to_offer_sqlite)
            .transpose()
    }

    async fn purchase_insert(&mut self, purchase: &Purchase) -> Result<Purchase> {
        let id = sqlx::query(INSERT_PURCHASE_SQL)
            .bind(purchase.user_id)
            .bind(purchase.item_id)
            .bind(purchase.price_aki)
            .bind(&purchase.transaction_id)
            .bind(purchase.status.to_string())
            .bind(purchase.created_at)
            .execute(self.conn()?)
            .await
            .context("Failed to record purchase")?
            .last_insert_rowid();
        Ok(Purchase {
            id,
            ..purchase.clone()
        })
    }
}

fn row_to_offer_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Offer> {
    Ok(Offer {
        id: row.get("id"),
        item_id: row.get("item_id"),
        is_active: row.get("is_active"),
        price_override_aki: row.get("price_override_aki"),
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        created_at: row.get("created_at"),
    })
}

fn row_to_offer_item_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<(Offer, Item)> {
    let item = row_to_item_sqlite(row)?;
    let offer = Offer {
        id: row.get("offer_id"),
        item_id: item.id,
        is_active: row.get("offer_is_active"),
        price_override_aki: row.get("price_override_aki"),
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        created_at: row.get("offer_created_at"),
    };
    Ok((offer, item))
}

// ============================================================================
// MySQL implementations
// ============================================================================

#[async_trait]
impl ShopTxOps for MysqlTx {
    async fn offer_lock(&mut self, offer_id: i64) -> Result<Option<Offer>> {
        let sql = format!(
            "SELECT {} FROM shop_offers WHERE id = ? FOR UPDATE",
            OFFER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(offer_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock offer")?
            .as_ref()
            .map(row_to_offer_mysql)
            .transpose()
    }

    async fn offer_lock_by_item(&mut self, item_id: i64) -> Result<Option<Offer>> {
        let sql = format!(
            "SELECT {} FROM shop_offers WHERE item_id = ? FOR UPDATE",
            OFFER_COLUMNS
        );
        sqlx::query(&sql)
            .bind(item_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock offer")?
            .as_ref()
            .map(row_to_offer_mysql)
            .transpose()
    }

    async fn purchase_insert(&mut self, purchase: &Purchase) -> Result<Purchase> {
        let id = sqlx::query(INSERT_PURCHASE_SQL)
            .bind(purchase.user_id)
            .bind(purchase.item_id)
            .bind(purchase.price_aki)
            .bind(&purchase.transaction_id)
            .bind(purchase.status.to_string())
            .bind(purchase.created_at)
            .execute(self.conn()?)
            .await
            .context("Failed to record purchase")?
            .last_insert_id() as i64;
        Ok(Purchase {
            id,
            ..purchase.clone()
        })
    }
}

fn row_to_offer_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Offer> {
    Ok(Offer {
        id: row.get("id"),
        item_id: row.get("item_id"),
        is_active: row.get("is_active"),
        price_override_aki: row.get("price_override_aki"),
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        created_at: row.get("created_at"),
    })
}

fn row_to_offer_item_mysql(row: &sqlx::mysql::MySqlRow) -> Result<(Offer, Item)> {
    let item = row_to_item_mysql(row)?;
    let offer = Offer {
        id: row.get("offer_id"),
        item_id: item.id,
        is_active: row.get("offer_is_active"),
        price_override_aki: row.get("price_override_aki"),
        starts_at: row.get("starts_at"),
        ends_at: row.get("ends_at"),
        created_at: row.get("offer_created_at"),
    };
    Ok((offer, item))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_pool};
    use crate::db::repositories::{ItemRepository, SqlxItemRepository};
    use crate::models::{CreateItemInput, PurchaseStatus};

    async fn create_item(pool: &DynDatabasePool, title: &str, price: i64) -> Item {
        let mut input: CreateItemInput = serde_json::from_value(serde_json::json!({
            "type": "avatar",
            "title": title,
            "file_url": "https://cdn.example.com/a.png",
            "price_aki": price,
        }))
        .unwrap();
        input.normalize();
        SqlxItemRepository::new(pool.clone())
            .create(&input)
            .await
            .unwrap()
    }

    fn offer_input(item_id: i64) -> CreateOfferInput {
        CreateOfferInput {
            item_id,
            is_active: true,
            price_override_aki: None,
            starts_at: None,
            ends_at: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_get_offer() {
        let pool = migrated_pool().await;
        let item = create_item(&pool, "Neon Fox", 40).await;
        let repo = SqlxShopRepository::new(pool.clone());

        let mut input = offer_input(item.id);
        input.price_override_aki = Some(25);
        let offer = repo.create_offer(&input).await.unwrap();

        let (found, found_item) = repo.get_offer(offer.id).await.unwrap().unwrap();
        assert_eq!(found.item_id, item.id);
        assert_eq!(found.current_price(&found_item), 25);
        assert_eq!(found_item.slug, "neon-fox");

        let (by_slug, _) = repo
            .get_offer_by_item_slug("neon-fox")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(by_slug.id, offer.id);
        assert!(repo.get_offer(offer.id + 100).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_offer_per_item() {
        let pool = migrated_pool().await;
        let item = create_item(&pool, "Neon Fox", 40).await;
        let repo = SqlxShopRepository::new(pool.clone());
        repo.create_offer(&offer_input(item.id)).await.unwrap();
        assert!(repo.create_offer(&offer_input(item.id)).await.is_err());
    }

    #[tokio::test]
    async fn test_list_active_offers() {
        let pool = migrated_pool().await;
        let a = create_item(&pool, "A", 10).await;
        let b = create_item(&pool, "B", 10).await;
        let repo = SqlxShopRepository::new(pool.clone());
        repo.create_offer(&offer_input(a.id)).await.unwrap();
        let mut hidden = offer_input(b.id);
        hidden.is_active = false;
        repo.create_offer(&hidden).await.unwrap();

        let offers = repo.list_active_offers().await.unwrap();
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].1.id, a.id);
    }

    #[tokio::test]
    async fn test_lock_and_purchase() {
        let pool = migrated_pool().await;
        let user_id = insert_user(&pool, "alice").await;
        let item = create_item(&pool, "Neon Fox", 40).await;
        let repo = SqlxShopRepository::new(pool.clone());
        let offer = repo.create_offer(&offer_input(item.id)).await.unwrap();

        let mut tx = pool.begin().await.unwrap();
        let locked = tx.offer_lock(offer.id).await.unwrap().unwrap();
        assert_eq!(locked.item_id, item.id);
        let by_item = tx.offer_lock_by_item(item.id).await.unwrap().unwrap();
        assert_eq!(by_item.id, offer.id);

        let purchase = tx
            .purchase_insert(&Purchase {
                id: 0,
                user_id,
                item_id: item.id,
                price_aki: 40,
                transaction_id: None,
                status: PurchaseStatus::Success,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        assert!(purchase.id > 0);
        tx.commit().await.unwrap();
    }
}
