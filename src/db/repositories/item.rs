//! Item, inventory and applied-slot repository
//!
//! Catalog reads and the applied-slot upsert use the pool. Grants and
//! stock changes run on an open transaction via [`InventoryTxOps`].

use crate::db::repositories::user::escape_like;
use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::{
    AppliedCustomization, CreateItemInput, InventoryEntry, InventorySource, InventoryView, Item,
    ItemType, DEFAULT_HEADER_SLUGS,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{MySqlPool, Row, SqlitePool};
use std::sync::Arc;

/// Catalog listing filters
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub item_type: Option<ItemType>,
    pub is_active: Option<bool>,
    pub search: Option<String>,
}

#[async_trait]
pub trait ItemRepository: Send + Sync {
    async fn create(&self, input: &CreateItemInput) -> Result<Item>;

    async fn get_by_id(&self, id: i64) -> Result<Option<Item>>;

    async fn get_by_slug(&self, slug: &str) -> Result<Option<Item>>;

    /// Items matching the filter, newest first
    async fn list(&self, filter: &ItemFilter) -> Result<Vec<Item>>;

    /// The user's inventory joined with items, newest acquisition first
    async fn inventory_for_user(&self, user_id: i64) -> Result<Vec<InventoryView>>;

    async fn owns(&self, user_id: i64, item_id: i64) -> Result<bool>;

    async fn get_applied(&self, user_id: i64) -> Result<Option<AppliedCustomization>>;

    /// Insert or replace the user's applied slots
    async fn save_applied(&self, applied: &AppliedCustomization) -> Result<()>;
}

/// Inventory mutations inside a transaction
#[async_trait]
pub trait InventoryTxOps: Send {
    /// Lock an item row
    async fn item_lock(&mut self, item_id: i64) -> Result<Option<Item>>;

    /// Lock an item row found by slug
    async fn item_lock_by_slug(&mut self, slug: &str) -> Result<Option<Item>>;

    /// The active default headers granted on sign-up
    async fn items_default_headers(&mut self) -> Result<Vec<Item>>;

    async fn inventory_owned(&mut self, user_id: i64, item_id: i64) -> Result<bool>;

    /// Give an item to a user. The caller checks ownership first.
    async fn inventory_grant(
        &mut self,
        user_id: i64,
        item_id: i64,
        source: InventorySource,
        note: &str,
    ) -> Result<InventoryEntry>;

    /// Create the empty applied-slot row unless one exists
    async fn applied_ensure(&mut self, user_id: i64) -> Result<()>;

    async fn item_increment_sold(&mut self, item_id: i64) -> Result<()>;
}

pub struct SqlxItemRepository {
    pool: DynDatabasePool,
}

impl SqlxItemRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn ItemRepository> {
        Arc::new(Self::new(pool))
    }
}

pub(crate) const ITEM_COLUMNS: &str = "id, item_type, slug, title, description, file_url, preview_url, \
     is_animated, mime, width, height, duration_ms, rarity, attributes, price_aki, \
     limited_total, limited_sold, is_active, created_at";

const INSERT_ITEM_SQL: &str = r#"
    INSERT INTO items (item_type, slug, title, description, file_url, preview_url, is_animated,
        mime, width, height, duration_ms, rarity, attributes, price_aki, limited_total,
        limited_sold, is_active, created_at)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
"#;

const APPLIED_SELECT: &str = r#"
    SELECT user_id, avatar_item_id, header_item_id, theme_item_id, frame_item_id, updated_at
    FROM applied_customizations
    WHERE user_id = ?
"#;

fn list_sql(escape: &str) -> String {
    format!(
        r#"
        SELECT {} FROM items
        WHERE (? IS NULL OR item_type = ?)
          AND (? IS NULL OR is_active = ?)
          AND (? IS NULL OR title LIKE ? ESCAPE '{}' OR slug LIKE ? ESCAPE '{}')
        ORDER BY created_at DESC, id DESC
        "#,
        ITEM_COLUMNS, escape, escape
    )
}

/// `ITEM_COLUMNS` qualified with the `i` alias
pub(crate) fn qualified_item_columns() -> String {
    ITEM_COLUMNS
        .split(',')
        .map(|c| format!("i.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}

fn inventory_sql() -> String {
    format!(
        r#"
        SELECT inv.id AS inventory_id, inv.source, inv.note, inv.acquired_at, {}
        FROM inventory inv
        JOIN items i ON i.id = inv.item_id
        WHERE inv.user_id = ?
        ORDER BY inv.acquired_at DESC, inv.id DESC
        "#,
        qualified_item_columns()
    )
}

#[async_trait]
impl ItemRepository for SqlxItemRepository {
    async fn create(&self, input: &CreateItemInput) -> Result<Item> {
        let now = Utc::now();
        let attributes = serde_json::to_string(&input.attributes)?;
        let id = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(INSERT_ITEM_SQL)
                .bind(input.item_type.to_string())
                .bind(&input.slug)
                .bind(&input.title)
                .bind(&input.description)
                .bind(&input.file_url)
                .bind(&input.preview_url)
                .bind(input.is_animated)
                .bind(&input.mime)
                .bind(input.width)
                .bind(input.height)
                .bind(input.duration_ms)
                .bind(input.rarity.to_string())
                .bind(&attributes)
                .bind(input.price_aki)
                .bind(input.limited_total)
                .bind(input.is_active)
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create item")?
                .last_insert_rowid(),
            DbBackend::Mysql(pool) => sqlx::query(INSERT_ITEM_SQL)
                .bind(input.item_type.to_string())
                .bind(&input.slug)
                .bind(&input.title)
                .bind(&input.description)
                .bind(&input.file_url)
                .bind(&input.preview_url)
                .bind(input.is_animated)
                .bind(&input.mime)
                .bind(input.width)
                .bind(input.height)
                .bind(input.duration_ms)
                .bind(input.rarity.to_string())
                .bind(&attributes)
                .bind(input.price_aki)
                .bind(input.limited_total)
                .bind(input.is_active)
                .bind(now)
                .execute(pool)
                .await
                .context("Failed to create item")?
                .last_insert_id() as i64,
        };

        Ok(Item {
            id,
            item_type: input.item_type,
            slug: input.slug.clone(),
            title: input.title.clone(),
            description: input.description.clone(),
            file_url: input.file_url.clone(),
            preview_url: input.preview_url.clone(),
            is_animated: input.is_animated,
            mime: input.mime.clone(),
            width: input.width,
            height: input.height,
            duration_ms: input.duration_ms,
            rarity: input.rarity,
            attributes: input.attributes.clone(),
            price_aki: input.price_aki,
            limited_total: input.limited_total,
            limited_sold: 0,
            is_active: input.is_active,
            created_at: now,
        })
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS);
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get item")?
                .as_ref()
                .map(row_to_item_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(id)
                .fetch_optional(pool)
                .await
                .context("Failed to get item")?
                .as_ref()
                .map(row_to_item_mysql)
                .transpose(),
        }
    }

    async fn get_by_slug(&self, slug: &str) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE slug = ?", ITEM_COLUMNS);
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .context("Failed to get item by slug")?
                .as_ref()
                .map(row_to_item_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(slug)
                .fetch_optional(pool)
                .await
                .context("Failed to get item by slug")?
                .as_ref()
                .map(row_to_item_mysql)
                .transpose(),
        }
    }

    async fn list(&self, filter: &ItemFilter) -> Result<Vec<Item>> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => list_items_sqlite(pool, filter).await,
            DbBackend::Mysql(pool) => list_items_mysql(pool, filter).await,
        }
    }

    async fn inventory_for_user(&self, user_id: i64) -> Result<Vec<InventoryView>> {
        let sql = inventory_sql();
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let rows = sqlx::query(&sql)
                    .bind(user_id)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list inventory")?;
                rows.iter()
                    .map(|row| {
                        let source: String = row.get("source");
                        Ok(InventoryView {
                            id: row.get("inventory_id"),
                            item: row_to_item_sqlite(row)?,
                            source: source.parse()?,
                            note: row.get("note"),
                            acquired_at: row.get("acquired_at"),
                        })
                    })
                    .collect()
            }
            DbBackend::Mysql(pool) => {
                let rows = sqlx::query(&sql)
                    .bind(user_id)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list inventory")?;
                rows.iter()
                    .map(|row| {
                        let source: String = row.get("source");
                        Ok(InventoryView {
                            id: row.get("inventory_id"),
                            item: row_to_item_mysql(row)?,
                            source: source.parse()?,
                            note: row.get("note"),
                            acquired_at: row.get("acquired_at"),
                        })
                    })
                    .collect()
            }
        }
    }

    async fn owns(&self, user_id: i64, item_id: i64) -> Result<bool> {
        let sql = "SELECT COUNT(*) as count FROM inventory WHERE user_id = ? AND item_id = ?";
        let count: i64 = match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(sql)
                .bind(user_id)
                .bind(item_id)
                .fetch_one(pool)
                .await
                .context("Failed to check inventory")?
                .get("count"),
            DbBackend::Mysql(pool) => sqlx::query(sql)
                .bind(user_id)
                .bind(item_id)
                .fetch_one(pool)
                .await
                .context("Failed to check inventory")?
                .get("count"),
        };
        Ok(count > 0)
    }

    async fn get_applied(&self, user_id: i64) -> Result<Option<AppliedCustomization>> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let row = sqlx::query(APPLIED_SELECT)
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await
                    .context("Failed to get applied customization")?;
                Ok(row.map(|row| AppliedCustomization {
                    user_id: row.get("user_id"),
                    avatar_item_id: row.get("avatar_item_id"),
                    header_item_id: row.get("header_item_id"),
                    theme_item_id: row.get("theme_item_id"),
                    frame_item_id: row.get("frame_item_id"),
                    updated_at: row.get("updated_at"),
                }))
            }
            DbBackend::Mysql(pool) => {
                let row = sqlx::query(APPLIED_SELECT)
                    .bind(user_id)
                    .fetch_optional(pool)
                    .await
                    .context("Failed to get applied customization")?;
                Ok(row.map(|row| AppliedCustomization {
                    user_id: row.get("user_id"),
                    avatar_item_id: row.get("avatar_item_id"),
                    header_item_id: row.get("header_item_id"),
                    theme_item_id: row.get("theme_item_id"),
                    frame_item_id: row.get("frame_item_id"),
                    updated_at: row.get("updated_at"),
                }))
            }
        }
    }

    async fn save_applied(&self, applied: &AppliedCustomization) -> Result<()> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO applied_customizations
                        (user_id, avatar_item_id, header_item_id, theme_item_id, frame_item_id, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(user_id) DO UPDATE SET
                        avatar_item_id = excluded.avatar_item_id,
                        header_item_id = excluded.header_item_id,
                        theme_item_id = excluded.theme_item_id,
                        frame_item_id = excluded.frame_item_id,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(applied.user_id)
                .bind(applied.avatar_item_id)
                .bind(applied.header_item_id)
                .bind(applied.theme_item_id)
                .bind(applied.frame_item_id)
                .bind(applied.updated_at)
                .execute(pool)
                .await
                .context("Failed to save applied customization")?;
            }
            DbBackend::Mysql(pool) => {
                sqlx::query(
                    r#"
                    INSERT INTO applied_customizations
                        (user_id, avatar_item_id, header_item_id, theme_item_id, frame_item_id, updated_at)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON DUPLICATE KEY UPDATE
                        avatar_item_id = VALUES(avatar_item_id),
                        header_item_id = VALUES(header_item_id),
                        theme_item_id = VALUES(theme_item_id),
                        frame_item_id = VALUES(frame_item_id),
                        updated_at = VALUES(updated_at)
                    "#,
                )
                .bind(applied.user_id)
                .bind(applied.avatar_item_id)
                .bind(applied.header_item_id)
                .bind(applied.theme_item_id)
                .bind(applied.frame_item_id)
                .bind(applied.updated_at)
                .execute(pool)
                .await
                .context("Failed to save applied customization")?;
            }
        }
        Ok(())
    }
}

fn search_pattern(filter: &ItemFilter) -> Option<String> {
    filter
        .search
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| format!("%{}%", escape_like(s)))
}

fn default_headers_sql() -> String {
    let placeholders = vec!["?"; DEFAULT_HEADER_SLUGS.len()].join(", ");
    format!(
        "SELECT {} FROM items WHERE slug IN ({}) AND is_active = ? ORDER BY slug",
        ITEM_COLUMNS, placeholders
    )
}

const GRANT_SQL: &str = r#"
    INSERT INTO inventory (user_id, item_id, source, note, acquired_at)
    VALUES (?, ?, ?, ?, ?)
"#;

// ============================================================================
// SQLite implementations
// ============================================================================

async fn list_items_sqlite(pool: &SqlitePool, filter: &ItemFilter) -> Result<Vec<Item>> {
    let item_type = filter.item_type.map(|t| t.to_string());
    let pattern = search_pattern(filter);
    let sql = list_sql("\\");
    let rows = sqlx::query(&sql)
        .bind(&item_type)
        .bind(&item_type)
        .bind(filter.is_active)
        .bind(filter.is_active)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(pool)
        .await
        .context("Failed to list items")?;
    rows.iter().map(row_to_item_sqlite).collect()
}

#[async_trait]
impl InventoryTxOps for SqliteTx {
    async fn item_lock(&mut self, item_id: i64) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE id = ?", ITEM_COLUMNS);
        sqlx::query(&sql)
            .bind(item_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock item")?
            .as_ref()
            .map(row_to_item_sqlite)
            .transpose()
    }

    async fn item_lock_by_slug(&mut self, slug: &str) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE slug = ?", ITEM_COLUMNS);
        sqlx::query(&sql)
            .bind(slug)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock item")?
            .as_ref()
            .map(row_to_item_sqlite)
            .transpose()
    }

    async fn items_default_headers(&mut self) -> Result<Vec<Item>> {
        let sql = default_headers_sql();
        let mut query = sqlx::query(&sql);
        for slug in DEFAULT_HEADER_SLUGS {
            query = query.bind(slug);
        }
        let rows = query
            .bind(true)
            .fetch_all(self.conn()?)
            .await
            .context("Failed to load default headers")?;
        rows.iter().map(row_to_item_sqlite).collect()
    }

    async fn inventory_owned(&mut self, user_id: i64, item_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) as count FROM inventory WHERE user_id = ? AND item_id = ?",
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_one(self.conn()?)
        .await
        .context("Failed to check inventory")?
        .get("count");
        Ok(count > 0)
    }

    async fn inventory_grant(
        &mut self,
        user_id: i64,
        item_id: i64,
        source: InventorySource,
        note: &str,
    ) -> Result<InventoryEntry> {
        let now = Utc::now();
        let id = sqlx::query(GRANT_SQL)
            .bind(user_id)
            .bind(item_id)
            .bind(source.to_string())
            .bind(note)
            .bind(now)
            .execute(self.conn()?)
            .await
            .context("Failed to grant item")?
            .last_insert_rowid();

        Ok(InventoryEntry {
            id,
            user_id,
            item_id,
            source,
            note: note.to_string(),
            acquired_at: now,
        })
    }

    async fn applied_ensure(&mut self, user_id: i64) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO applied_customizations (user_id, updated_at) VALUES (?, ?)",
        )
        .bind(user_id)
        .bind(Utc::now())
        .execute(self.conn()?)
        .await
        .context("Failed to create applied customization")?;
        Ok(())
    }

    async fn item_increment_sold(&mut self, item_id: i64) -> Result<()> {
        sqlx::query("UPDATE items SET limited_sold = limited_sold + 1 WHERE id = ?")
            .bind(item_id)
            .execute(self.conn()?)
            .await
            .context("Failed to update item stock")?;
        Ok(())
    }
}

pub(crate) fn row_to_item_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Item> {
    let item_type: String = row.get("item_type");
    let rarity: String = row.get("rarity");
    let attributes: String = row.get("attributes");
    Ok(Item {
        id: row.get("id"),
        item_type: item_type.parse()?,
        slug: row.get("slug"),
        title: row.get("title"),
        description: row.get("description"),
        file_url: row.get("file_url"),
        preview_url: row.get("preview_url"),
        is_animated: row.get("is_animated"),
        mime: row.get("mime"),
        width: row.get("width"),
        height: row.get("height"),
        duration_ms: row.get("duration_ms"),
        rarity: rarity.parse()?,
        attributes: serde_json::from_str(&attributes)
            .with_context(|| format!("Invalid attributes JSON for item {}", item_type))?,
        price_aki: row.get("price_aki"),
        limited_total: row.get("limited_total"),
        limited_sold: row.get("limited_sold"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn list_items_mysql(pool: &MySqlPool, filter: &ItemFilter) -> Result<Vec<Item>> {
    let item_type = filter.item_type.map(|t| t.to_string());
    let pattern = search_pattern(filter);
    let sql = list_sql("\\\\");
    let rows = sqlx::query(&sql)
        .bind(&item_type)
        .bind(&item_type)
        .bind(filter.is_active)
        .bind(filter.is_active)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(pool)
        .await
        .context("Failed to list items")?;
    rows.iter().map(row_to_item_mysql).collect()
}

#[async_trait]
impl InventoryTxOps for MysqlTx {
    async fn item_lock(&mut self, item_id: i64) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE id = ? FOR UPDATE", ITEM_COLUMNS);
        sqlx::query(&sql)
            .bind(item_id)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock item")?
            .as_ref()
            .map(row_to_item_mysql)
            .transpose()
    }

    async fn item_lock_by_slug(&mut self, slug: &str) -> Result<Option<Item>> {
        let sql = format!("SELECT {} FROM items WHERE slug = ? FOR UPDATE", ITEM_COLUMNS);
        sqlx::query(&sql)
            .bind(slug)
            .fetch_optional(self.conn()?)
            .await
            .context("Failed to lock item")?
            .as_ref()
            .map(row_to_item_mysql)
            .transpose()
    }

    async fn items_default_headers(&mut self) -> Result<Vec<Item>> {
        let sql = default_headers_sql();
        let mut query = sqlx::query(&sql);
        for slug in DEFAULT_HEADER_SLUGS {
            query = query.bind(slug);
        }
        let rows = query
            .bind(true)
            .fetch_all(self.conn()?)
            .await
            .context("Failed to load default headers")?;
        rows.iter().map(row_to_item_mysql).collect()
    }

    async fn inventory_owned(&mut self, user_id: i64, item_id: i64) -> Result<bool> {
        let count: i64 = sqlx::query(
            "SELECT COUNT(*) as count FROM inventory WHERE user_id = ? AND item_id = ?",
        )
        .bind(user_id)
        .bind(item_id)
        .fetch_one(self.conn()?)
        .await
        .context("Failed to check inventory")?
        .get("count");
        Ok(count > 0)
    }

    async fn inventory_grant(
        &mut self,
        user_id: i64,
        item_id: i64,
        source: InventorySource,
        note: &str,
    ) -> Result<InventoryEntry> {
        let now = Utc::now();
        let id = sqlx::query(GRANT_SQL)
            .bind(user_id)
            .bind(item_id)
            .bind(source.to_string())
            .bind(note)
            .bind(now)
            .execute(self.conn()?)
            .await
            .context("Failed to grant item")?
            .last_insert_id() as i64;

        Ok(InventoryEntry {
            id,
            user_id,
            item_id,
            source,
            note: note.to_string(),
            acquired_at: now,
        })
    }

    async fn applied_ensure(&mut self, user_id: i64) -> Result<()> {
        sqlx::query("INSERT IGNORE INTO applied_customizations (user_id, updated_at) VALUES (?, ?)")
            .bind(user_id)
            .bind(Utc::now())
            .execute(self.conn()?)
            .await
            .context("Failed to create applied customization")?;
        Ok(())
    }

    async fn item_increment_sold(&mut self, item_id: i64) -> Result<()> {
        sqlx::query("UPDATE items SET limited_sold = limited_sold + 1 WHERE id = ?")
            .bind(item_id)
            .execute(self.conn()?)
            .await
            .context("Failed to update item stock")?;
        Ok(())
    }
}

pub(crate) fn row_to_item_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Item> {
    let item_type: String = row.get("item_type");
    let rarity: String = row.get("rarity");
    let attributes: String = row.get("attributes");
    Ok(Item {
        id: row.get("id"),
        item_type: item_type.parse()?,
        slug: row.get("slug"),
        title: row.get("title"),
        description: row.get("description"),
        file_url: row.get("file_url"),
        preview_url: row.get("preview_url"),
        is_animated: row.get("is_animated"),
        mime: row.get("mime"),
        width: row.get("width"),
        height: row.get("height"),
        duration_ms: row.get("duration_ms"),
        rarity: rarity.parse()?,
        attributes: serde_json::from_str(&attributes)
            .with_context(|| format!("Invalid attributes JSON for item {}", item_type))?,
        price_aki: row.get("price_aki"),
        limited_total: row.get("limited_total"),
        limited_sold: row.get("limited_sold"),
        is_active: row.get("is_active"),
        created_at: row.get("created_at"),
    })
}
