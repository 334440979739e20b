//! Shop models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::Item;

/// Storefront entry for a single item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: i64,
    pub item_id: i64,
    pub is_active: bool,
    /// Replaces `Item::price_aki` when set
    pub price_override_aki: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Offer {
    pub fn current_price(&self, item: &Item) -> i64 {
        self.price_override_aki.unwrap_or(item.price_aki)
    }

    /// Whether the offer can be bought at `now`. Window bounds are inclusive.
    pub fn is_selling_at(&self, item: &Item, now: DateTime<Utc>) -> bool {
        if !self.is_active || !item.can_sell_now() {
            return false;
        }
        if matches!(self.starts_at, Some(starts) if now < starts) {
            return false;
        }
        if matches!(self.ends_at, Some(ends) if now > ends) {
            return false;
        }
        self.current_price(item) > 0
    }
}

/// Offer joined with its item
#[derive(Debug, Clone, Serialize)]
pub struct OfferView {
    pub id: i64,
    pub item: Item,
    pub is_active: bool,
    pub price_override_aki: Option<i64>,
    pub current_price: i64,
    pub is_selling_now: bool,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl OfferView {
    pub fn new(offer: Offer, item: Item, now: DateTime<Utc>) -> Self {
        Self {
            id: offer.id,
            is_active: offer.is_active,
            price_override_aki: offer.price_override_aki,
            current_price: offer.current_price(&item),
            is_selling_now: offer.is_selling_at(&item, now),
            starts_at: offer.starts_at,
            ends_at: offer.ends_at,
            created_at: offer.created_at,
            item,
        }
    }
}

/// Input for creating an offer
#[derive(Debug, Clone, Deserialize)]
pub struct CreateOfferInput {
    pub item_id: i64,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub price_override_aki: Option<i64>,
    pub starts_at: Option<DateTime<Utc>>,
    pub ends_at: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Success,
    Failed,
}

impl fmt::Display for PurchaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PurchaseStatus::Success => write!(f, "success"),
            PurchaseStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for PurchaseStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(PurchaseStatus::Success),
            "failed" => Ok(PurchaseStatus::Failed),
            _ => Err(anyhow::anyhow!("Invalid purchase status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Purchase {
    pub id: i64,
    pub user_id: i64,
    pub item_id: i64,
    pub price_aki: i64,
    pub transaction_id: Option<String>,
    pub status: PurchaseStatus,
    pub created_at: DateTime<Utc>,
}
