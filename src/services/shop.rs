//! Shop service
//!
//! Offers put catalog items on sale for AKI. A purchase locks the offer and
//! the item, charges the buyer's AKI wallet through the ledger and grants the
//! item, all in one transaction.

use crate::cache::{Cache, ITEMS_PREFIX, OFFERS_PREFIX};
use crate::db::repositories::{ItemRepository, ShopRepository};
use crate::db::{DbTx, DynDatabasePool};
use crate::models::{
    CreateOfferInput, Currency, InventorySource, Item, Offer, OfferView, Purchase, PurchaseStatus,
};
use crate::services::economy::{withdraw_in, EconomyError};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ShopError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("Insufficient AKI balance")]
    InsufficientFunds,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<EconomyError> for ShopError {
    fn from(err: EconomyError) -> Self {
        match err {
            EconomyError::InsufficientFunds => ShopError::InsufficientFunds,
            EconomyError::Validation(msg) => ShopError::Validation(msg),
            EconomyError::IdempotencyConflict => {
                ShopError::Conflict("Purchase is already being processed".to_string())
            }
            EconomyError::WalletNotFound | EconomyError::CurrencyMismatch => {
                ShopError::Internal(anyhow::anyhow!("Invalid AKI wallet configuration"))
            }
            EconomyError::Internal(e) => ShopError::Internal(e),
        }
    }
}

/// How the buyer names what they want
#[derive(Debug, Clone)]
pub enum PurchaseTarget {
    Offer(i64),
    ItemSlug(String),
}

impl PurchaseTarget {
    /// `offer_id` wins when both are given; neither is a validation error
    pub fn from_request(
        offer_id: Option<i64>,
        item_slug: Option<String>,
    ) -> Result<Self, ShopError> {
        match (offer_id, item_slug.filter(|s| !s.trim().is_empty())) {
            (Some(id), _) => Ok(PurchaseTarget::Offer(id)),
            (None, Some(slug)) => Ok(PurchaseTarget::ItemSlug(slug.trim().to_string())),
            (None, None) => Err(ShopError::Validation(
                "Specify item_slug or offer_id".to_string(),
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PurchaseResult {
    pub ok: bool,
    pub purchase_id: i64,
    pub inventory_id: i64,
    /// AKI balance after the charge
    pub new_balance: i64,
}

pub struct ShopService {
    pool: DynDatabasePool,
    shop_repo: Arc<dyn ShopRepository>,
    item_repo: Arc<dyn ItemRepository>,
    cache: Arc<Cache>,
    cache_ttl: Duration,
}

impl ShopService {
    pub fn new(
        pool: DynDatabasePool,
        shop_repo: Arc<dyn ShopRepository>,
        item_repo: Arc<dyn ItemRepository>,
        cache: Arc<Cache>,
        cache_ttl: Duration,
    ) -> Self {
        Self {
            pool,
            shop_repo,
            item_repo,
            cache,
            cache_ttl,
        }
    }

    /// Offers on sale right now
    pub async fn list_offers(&self) -> Result<Vec<OfferView>, ShopError> {
        let key = format!("{}active", OFFERS_PREFIX);
        let offers: Vec<(Offer, Item)> = self
            .cache
            .get_or_load(&key, self.cache_ttl, || async {
                self.shop_repo
                    .list_active_offers()
                    .await
                    .map_err(ShopError::from)
            })
            .await?;

        let now = Utc::now();
        Ok(offers
            .into_iter()
            .map(|(offer, item)| OfferView::new(offer, item, now))
            .filter(|view| view.is_selling_now)
            .collect())
    }

    /// One offer by numeric id, or by its item's slug
    pub async fn get_offer(&self, id_or_slug: &str) -> Result<OfferView, ShopError> {
        let found = match id_or_slug.parse::<i64>() {
            Ok(id) => self.shop_repo.get_offer(id).await?,
            Err(_) => None,
        };
        let found = match found {
            Some(found) => Some(found),
            None => self.shop_repo.get_offer_by_item_slug(id_or_slug).await?,
        };
        let (offer, item) = found.ok_or_else(|| ShopError::NotFound("Offer not found".to_string()))?;
        Ok(OfferView::new(offer, item, Utc::now()))
    }

    /// Admin: put an item on sale
    pub async fn create_offer(&self, input: CreateOfferInput) -> Result<OfferView, ShopError> {
        if input.price_override_aki.is_some_and(|price| price < 0) {
            return Err(ShopError::Validation(
                "Price override cannot be negative".to_string(),
            ));
        }
        if let (Some(starts), Some(ends)) = (input.starts_at, input.ends_at) {
            if ends < starts {
                return Err(ShopError::Validation(
                    "Sale window ends before it starts".to_string(),
                ));
            }
        }
        let item = self
            .item_repo
            .get_by_id(input.item_id)
            .await?
            .ok_or_else(|| ShopError::NotFound("Item not found".to_string()))?;
        if self.shop_repo.get_offer_by_item_slug(&item.slug).await?.is_some() {
            return Err(ShopError::Conflict(
                "Item already has an offer".to_string(),
            ));
        }

        let offer = self.shop_repo.create_offer(&input).await?;
        self.cache.invalidate(OFFERS_PREFIX).await;
        tracing::info!(offer_id = offer.id, item_id = item.id, "Offer created");
        Ok(OfferView::new(offer, item, Utc::now()))
    }

    /// Buy an item for AKI.
    ///
    /// # Errors
    ///
    /// - `NotFound` for an unknown offer or item slug
    /// - `Validation` if the offer is not selling or has no price
    /// - `Conflict` if the item is already owned or the limit is reached
    /// - `InsufficientFunds` if the AKI balance is short
    pub async fn purchase(
        &self,
        user_id: i64,
        target: PurchaseTarget,
    ) -> Result<PurchaseResult, ShopError> {
        let mut tx = self.pool.begin().await?;
        let result = purchase_in(tx.as_mut(), user_id, &target).await?;
        tx.commit().await?;

        // limited_sold changed
        self.cache.invalidate(ITEMS_PREFIX).await;
        self.cache.invalidate(OFFERS_PREFIX).await;
        Ok(result)
    }
}

async fn purchase_in(
    tx: &mut dyn DbTx,
    user_id: i64,
    target: &PurchaseTarget,
) -> Result<PurchaseResult, ShopError> {
    let offer = match target {
        PurchaseTarget::Offer(id) => tx
            .offer_lock(*id)
            .await?
            .ok_or_else(|| ShopError::NotFound("Offer not found".to_string()))?,
        PurchaseTarget::ItemSlug(slug) => {
            let item = tx
                .item_lock_by_slug(slug)
                .await?
                .ok_or_else(|| ShopError::NotFound("No offer for this slug".to_string()))?;
            tx.offer_lock_by_item(item.id)
                .await?
                .ok_or_else(|| ShopError::NotFound("No offer for this slug".to_string()))?
        }
    };
    let item = tx
        .item_lock(offer.item_id)
        .await?
        .ok_or_else(|| ShopError::NotFound("Item not found".to_string()))?;

    let now = Utc::now();
    if !offer.is_selling_at(&item, now) {
        return Err(ShopError::Validation(
            "This item is not on sale".to_string(),
        ));
    }
    if tx.inventory_owned(user_id, item.id).await? {
        return Err(ShopError::Conflict("You already own this item".to_string()));
    }
    if item.is_sold_out() {
        return Err(ShopError::Conflict("Sales limit reached".to_string()));
    }
    let price = offer.current_price(&item);
    if price <= 0 {
        return Err(ShopError::Validation(
            "This item cannot be bought".to_string(),
        ));
    }

    let wallet = tx.wallet_get_or_create(user_id, Currency::Aki).await?;
    let key = format!("shop:buy:{}:{}:{}:{}", user_id, offer.id, item.id, price);
    let charge = withdraw_in(
        tx,
        wallet.id,
        price,
        &format!("Purchase {}", item.slug),
        Some(&key),
    )
    .await?;

    let purchase = tx
        .purchase_insert(&Purchase {
            id: 0,
            user_id,
            item_id: item.id,
            price_aki: price,
            transaction_id: Some(charge.id.clone()),
            status: PurchaseStatus::Success,
            created_at: now,
        })
        .await?;
    let entry = tx
        .inventory_grant(user_id, item.id, InventorySource::Purchase, "")
        .await?;
    if item.limited_total.is_some() {
        tx.item_increment_sold(item.id).await?;
    }

    let balance = tx
        .wallet_lock(wallet.id)
        .await?
        .map(|w| w.balance)
        .unwrap_or_default();

    tracing::info!(
        user_id,
        item_id = item.id,
        offer_id = offer.id,
        price,
        purchase_id = purchase.id,
        "Item purchased"
    );
    Ok(PurchaseResult {
        ok: true,
        purchase_id: purchase.id,
        inventory_id: entry.id,
        new_balance: balance,
    })
}
