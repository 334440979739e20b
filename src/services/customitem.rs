//! Custom item service
//!
//! Catalog reads (cached), the user's inventory and the equipped slots.

use crate::cache::{Cache, ITEMS_PREFIX};
use crate::db::repositories::{ItemFilter, ItemRepository};
use crate::models::{
    AppliedCustomization, CreateItemInput, InventoryView, Item, UpdateAppliedInput, SLUG_MAX_LEN,
};
use anyhow::Context;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

/// Error types for custom item operations
#[derive(Debug, thiserror::Error)]
pub enum CustomItemError {
    #[error("Item not found")]
    NotFound,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Item slug '{0}' already exists")]
    SlugExists(String),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub struct CustomItemService {
    item_repo: Arc<dyn ItemRepository>,
    cache: Arc<Cache>,
    cache_ttl: Duration,
}

impl CustomItemService {
    pub fn new(item_repo: Arc<dyn ItemRepository>, cache: Arc<Cache>, cache_ttl: Duration) -> Self {
        Self {
            item_repo,
            cache,
            cache_ttl,
        }
    }

    /// Catalog listing, newest first
    pub async fn list(&self, filter: &ItemFilter) -> Result<Vec<Item>, CustomItemError> {
        let key = format!(
            "{}list:{}:{}:{}",
            ITEMS_PREFIX,
            filter.item_type.map(|t| t.to_string()).unwrap_or_default(),
            filter.is_active.map(|a| a.to_string()).unwrap_or_default(),
            filter.search.as_deref().unwrap_or_default().to_lowercase(),
        );
        self.cache
            .get_or_load(&key, self.cache_ttl, || async {
                self.item_repo
                    .list(filter)
                    .await
                    .map_err(CustomItemError::from)
            })
            .await
    }

    pub async fn get_by_slug(&self, slug: &str) -> Result<Item, CustomItemError> {
        let key = format!("{}slug:{}", ITEMS_PREFIX, slug);
        let item: Option<Item> = self
            .cache
            .get_or_load(&key, self.cache_ttl, || async {
                self.item_repo
                    .get_by_slug(slug)
                    .await
                    .map_err(CustomItemError::from)
            })
            .await?;
        item.ok_or(CustomItemError::NotFound)
    }

    /// The user's items, newest acquisition first
    pub async fn inventory(&self, user_id: i64) -> Result<Vec<InventoryView>, CustomItemError> {
        Ok(self.item_repo.inventory_for_user(user_id).await?)
    }

    /// Equipped slots; an account without a row has everything empty
    pub async fn applied(&self, user_id: i64) -> Result<AppliedCustomization, CustomItemError> {
        Ok(self
            .item_repo
            .get_applied(user_id)
            .await?
            .unwrap_or_else(|| AppliedCustomization::empty(user_id)))
    }

    /// Equip or clear slots.
    ///
    /// # Errors
    ///
    /// `Validation` if an item is unknown, of the wrong type for its slot, or
    /// not in the user's inventory. Nothing is saved in that case.
    pub async fn update_applied(
        &self,
        user_id: i64,
        input: UpdateAppliedInput,
    ) -> Result<AppliedCustomization, CustomItemError> {
        for (slot, item_id) in input.assignments() {
            let item = self
                .item_repo
                .get_by_id(item_id)
                .await?
                .ok_or_else(|| {
                    CustomItemError::Validation(format!("{}_item: item {} does not exist", slot.name(), item_id))
                })?;
            if item.item_type != slot.accepts() {
                return Err(CustomItemError::Validation(format!(
                    "{}_item: expected a {} item, got {}",
                    slot.name(),
                    slot.accepts(),
                    item.item_type
                )));
            }
            if !self.item_repo.owns(user_id, item_id).await? {
                return Err(CustomItemError::Validation(format!(
                    "{}_item: you do not own this item",
                    slot.name()
                )));
            }
        }

        let mut applied = self.applied(user_id).await?;
        input.apply_to(&mut applied);
        applied.updated_at = Utc::now();
        self.item_repo
            .save_applied(&applied)
            .await
            .context("Failed to update applied customization")?;
        Ok(applied)
    }

    /// Admin: add an item to the catalog
    pub async fn create(&self, mut input: CreateItemInput) -> Result<Item, CustomItemError> {
        input.normalize();
        if input.title.is_empty() {
            return Err(CustomItemError::Validation("Title is required".to_string()));
        }
        if input.slug.is_empty() || input.slug.len() > SLUG_MAX_LEN {
            return Err(CustomItemError::Validation(format!(
                "Slug must be 1 to {} characters",
                SLUG_MAX_LEN
            )));
        }
        if input.price_aki < 0 {
            return Err(CustomItemError::Validation(
                "Price cannot be negative".to_string(),
            ));
        }
        if input.limited_total.is_some_and(|total| total < 0) {
            return Err(CustomItemError::Validation(
                "Limited total cannot be negative".to_string(),
            ));
        }
        if self.item_repo.get_by_slug(&input.slug).await?.is_some() {
            return Err(CustomItemError::SlugExists(input.slug));
        }

        let item = self.item_repo.create(&input).await?;
        self.cache.invalidate(ITEMS_PREFIX).await;
        tracing::info!(item_id = item.id, slug = %item.slug, "Item created");
        Ok(item)
    }

    /// Drop cached catalog entries after a write elsewhere (e.g. a sale)
    pub async fn invalidate_cache(&self) {
        self.cache.invalidate(ITEMS_PREFIX).await;
    }
}
