//! Custom item models
//!
//! Catalog items, the per-user inventory and the applied (equipped) slots.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum slug length
pub const SLUG_MAX_LEN: usize = 160;

/// Slugs of the headers every new account receives
pub const DEFAULT_HEADER_SLUGS: [&str; 3] =
    ["header-default-1", "header-default-2", "header-default-3"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    Avatar,
    Header,
    Theme,
    AvatarFrame,
}

impl fmt::Display for ItemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemType::Avatar => "avatar",
            ItemType::Header => "header",
            ItemType::Theme => "theme",
            ItemType::AvatarFrame => "avatar_frame",
        };
        f.write_str(s)
    }
}

impl FromStr for ItemType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "avatar" => Ok(ItemType::Avatar),
            "header" => Ok(ItemType::Header),
            "theme" => Ok(ItemType::Theme),
            "avatar_frame" => Ok(ItemType::AvatarFrame),
            _ => Err(anyhow::anyhow!("Invalid item type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Rarity {
    #[default]
    Common,
    Rare,
    Epic,
    Legend,
}

impl fmt::Display for Rarity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Rarity::Common => "common",
            Rarity::Rare => "rare",
            Rarity::Epic => "epic",
            Rarity::Legend => "legend",
        };
        f.write_str(s)
    }
}

impl FromStr for Rarity {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "common" => Ok(Rarity::Common),
            "rare" => Ok(Rarity::Rare),
            "epic" => Ok(Rarity::Epic),
            "legend" => Ok(Rarity::Legend),
            _ => Err(anyhow::anyhow!("Invalid rarity: {}", s)),
        }
    }
}

/// Catalog item. Prices are whole AKI coins; `0` means the item is not for sale.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    #[serde(rename = "type")]
    pub item_type: ItemType,
    pub slug: String,
    pub title: String,
    pub description: String,
    pub file_url: String,
    pub preview_url: String,
    pub is_animated: bool,
    pub mime: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration_ms: Option<i64>,
    pub rarity: Rarity,
    pub attributes: serde_json::Value,
    pub price_aki: i64,
    pub limited_total: Option<i64>,
    pub limited_sold: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// Whether the limited edition is exhausted
    pub fn is_sold_out(&self) -> bool {
        matches!(self.limited_total, Some(total) if self.limited_sold >= total)
    }

    /// Active, priced and not sold out
    pub fn can_sell_now(&self) -> bool {
        self.is_active && self.price_aki > 0 && !self.is_sold_out()
    }
}

/// Input for creating a catalog item
#[derive(Debug, Clone, Deserialize)]
pub struct CreateItemInput {
    #[serde(rename = "type")]
    pub item_type: ItemType,
    #[serde(default)]
    pub slug: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub file_url: String,
    #[serde(default)]
    pub preview_url: String,
    #[serde(default)]
    pub is_animated: bool,
    #[serde(default)]
    pub mime: String,
    pub width: Option<i64>,
    pub height: Option<i64>,
    pub duration_ms: Option<i64>,
    #[serde(default)]
    pub rarity: Rarity,
    #[serde(default = "empty_object")]
    pub attributes: serde_json::Value,
    #[serde(default)]
    pub price_aki: i64,
    pub limited_total: Option<i64>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn empty_object() -> serde_json::Value {
    serde_json::json!({})
}

fn default_true() -> bool {
    true
}

impl CreateItemInput {
    /// Fill in derived fields: the slug from the title, and headers are always animated.
    pub fn normalize(&mut self) {
        self.title = self.title.trim().to_string();
        if self.slug.trim().is_empty() {
            self.slug = slugify(&self.title);
        } else {
            self.slug = slugify(&self.slug);
        }
        if self.item_type == ItemType::Header {
            self.is_animated = true;
        }
    }
}

/// How an inventory entry was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InventorySource {
    Purchase,
    Gift,
    Achieve,
}

impl fmt::Display for InventorySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InventorySource::Purchase => "purchase",
            InventorySource::Gift => "gift",
            InventorySource::Achieve => "achieve",
        };
        f.write_str(s)
    }
}

impl FromStr for InventorySource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "purchase" => Ok(InventorySource::Purchase),
            "gift" => Ok(InventorySource::Gift),
            "achieve" => Ok(InventorySource::Achieve),
            _ => Err(anyhow::anyhow!("Invalid inventory source: {}", s)),
        }
    }
}

/// Ownership record; one per (user, item)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub id: i64,
    pub user_id: i64,
    pub item_id: i64,
    pub source: InventorySource,
    pub note: String,
    pub acquired_at: DateTime<Utc>,
}

/// Inventory entry joined with its item, as listed to the owner
#[derive(Debug, Clone, Serialize)]
pub struct InventoryView {
    pub id: i64,
    pub item: Item,
    pub source: InventorySource,
    pub note: String,
    pub acquired_at: DateTime<Utc>,
}

/// Equipped items per slot
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AppliedCustomization {
    pub user_id: i64,
    pub avatar_item_id: Option<i64>,
    pub header_item_id: Option<i64>,
    pub theme_item_id: Option<i64>,
    pub frame_item_id: Option<i64>,
    pub updated_at: DateTime<Utc>,
}

impl AppliedCustomization {
    pub fn empty(user_id: i64) -> Self {
        Self {
            user_id,
            avatar_item_id: None,
            header_item_id: None,
            theme_item_id: None,
            frame_item_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// The four equip slots and the item type each accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Avatar,
    Header,
    Theme,
    Frame,
}

impl Slot {
    pub fn accepts(&self) -> ItemType {
        match self {
            Slot::Avatar => ItemType::Avatar,
            Slot::Header => ItemType::Header,
            Slot::Theme => ItemType::Theme,
            Slot::Frame => ItemType::AvatarFrame,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Slot::Avatar => "avatar",
            Slot::Header => "header",
            Slot::Theme => "theme",
            Slot::Frame => "frame",
        }
    }
}

/// Partial update of the applied slots.
///
/// A missing field keeps the slot; an explicit `null` clears it.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateAppliedInput {
    #[serde(default, deserialize_with = "double_option")]
    pub avatar_item: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub header_item: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub theme_item: Option<Option<i64>>,
    #[serde(default, deserialize_with = "double_option")]
    pub frame_item: Option<Option<i64>>,
}

impl UpdateAppliedInput {
    /// Slots being set to an item
    pub fn assignments(&self) -> Vec<(Slot, i64)> {
        [
            (Slot::Avatar, self.avatar_item),
            (Slot::Header, self.header_item),
            (Slot::Theme, self.theme_item),
            (Slot::Frame, self.frame_item),
        ]
        .into_iter()
        .filter_map(|(slot, value)| value.flatten().map(|id| (slot, id)))
        .collect()
    }

    pub fn apply_to(&self, applied: &mut AppliedCustomization) {
        if let Some(v) = self.avatar_item {
            applied.avatar_item_id = v;
        }
        if let Some(v) = self.header_item {
            applied.header_item_id = v;
        }
        if let Some(v) = self.theme_item {
            applied.theme_item_id = v;
        }
        if let Some(v) = self.frame_item {
            applied.frame_item_id = v;
        }
    }
}

fn double_option<'de, D>(deserializer: D) -> Result<Option<Option<i64>>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Option::<i64>::deserialize(deserializer).map(Some)
}

static NON_SLUG_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w\s-]").expect("valid regex"));
static SLUG_SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[-\s]+").expect("valid regex"));

/// Turn a title into a URL slug: ASCII only, lowercase, words joined with `-`.
///
/// Titles without any ASCII word characters get a random `item-xxxxxxxx` slug.
pub fn slugify(title: &str) -> String {
    slugify_or(title, "item")
}

/// [`slugify`] with a different prefix for the random fallback slug
pub fn slugify_or(title: &str, fallback_prefix: &str) -> String {
    let ascii: String = title.chars().filter(char::is_ascii).collect();
    let lowered = ascii.to_lowercase();
    let cleaned = NON_SLUG_CHARS.replace_all(&lowered, "");
    let joined = SLUG_SEPARATORS.replace_all(cleaned.trim(), "-");
    let slug: String = joined
        .trim_matches(|c| c == '-' || c == '_')
        .chars()
        .take(SLUG_MAX_LEN)
        .collect();

    if slug.is_empty() {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}", fallback_prefix, &id[..8])
    } else {
        slug
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(price: i64, total: Option<i64>, sold: i64, active: bool) -> Item {
        Item {
            id: 1,
            item_type: ItemType::Theme,
            slug: "night".into(),
            title: "Night".into(),
            description: String::new(),
            file_url: "https://cdn/night.webp".into(),
            preview_url: String::new(),
            is_animated: false,
            mime: String::new(),
            width: None,
            height: None,
            duration_ms: None,
            rarity: Rarity::Rare,
            attributes: serde_json::json!({}),
            price_aki: price,
            limited_total: total,
            limited_sold: sold,
            is_active: active,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_can_sell_now() {
        assert!(item(10, None, 0, true).can_sell_now());
        assert!(item(10, Some(5), 4, true).can_sell_now());
        assert!(!item(10, Some(5), 5, true).can_sell_now());
        assert!(!item(0, None, 0, true).can_sell_now());
        assert!(!item(10, None, 0, false).can_sell_now());
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Sakura Night Theme"), "sakura-night-theme");
        assert_eq!(slugify("  Hello,  World!! "), "hello-world");
        assert_eq!(slugify("a -- b__c"), "a-b__c");
        assert!(slugify("Сакура").starts_with("item-"));
        assert!(slugify_or("Ванпанчмен", "manga").starts_with("manga-"));
        assert_eq!(slugify(&"x".repeat(300)).len(), SLUG_MAX_LEN);
    }

    #[test]
    fn test_headers_are_always_animated() {
        let mut input: CreateItemInput = serde_json::from_value(serde_json::json!({
            "type": "header",
            "title": "Blue Sky",
            "file_url": "https://cdn/sky.webm"
        }))
        .unwrap();
        input.normalize();

        assert!(input.is_animated);
        assert_eq!(input.slug, "blue-sky");
        assert!(input.is_active);
    }

    #[test]
    fn test_update_applied_distinguishes_null_from_missing() {
        let input: UpdateAppliedInput =
            serde_json::from_value(serde_json::json!({"header_item": null, "theme_item": 7}))
                .unwrap();

        let mut applied = AppliedCustomization::empty(1);
        applied.header_item_id = Some(3);
        applied.avatar_item_id = Some(2);
        input.apply_to(&mut applied);

        assert_eq!(applied.header_item_id, None);
        assert_eq!(applied.avatar_item_id, Some(2));
        assert_eq!(applied.theme_item_id, Some(7));
        assert_eq!(input.assignments(), vec![(Slot::Theme, 7)]);
    }

    #[test]
    fn test_slot_accepts_matching_type() {
        assert_eq!(Slot::Frame.accepts(), ItemType::AvatarFrame);
        assert_eq!(Slot::Header.name(), "header");
    }
}
