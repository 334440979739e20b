//! Data models
//!
//! This module contains the data structures used throughout the Akimori backend:
//! - Database entities (User, Session, Profile, Wallet, Item, Offer, PromoCode,
//!   Manga, Thread, ...)
//! - Request inputs and response views
//! - Wire types of the Kodik API

mod chat;
mod forum;
mod item;
mod manga;
mod material;
mod profile;
mod promo;
mod session;
mod shop;
mod user;
mod wallet;

pub use chat::{
    page_count, ClientFrame, Conversation, ConversationDetail, ConversationSummary, Message,
    MessagePage, MessageView, Participant, ServerEvent, UserShort,
};
pub use forum::{
    Comment, CommentStatus, CreateCategoryInput, CreateCommentInput, CreateKindInput,
    CreateThreadInput, ForumCategory, ForumRef, NewComment, NewThread, Thread, ThreadFilter,
    ThreadKind, UpdateThreadInput, THREAD_SLUG_MAX_LEN, THREAD_TITLE_MAX_LEN,
};
pub use item::{
    slugify, slugify_or, AppliedCustomization, CreateItemInput, InventoryEntry, InventorySource,
    InventoryView, Item, ItemType, Rarity, Slot, UpdateAppliedInput, DEFAULT_HEADER_SLUGS,
    SLUG_MAX_LEN,
};
pub use manga::{
    Chapter, ChapterDetail, ChapterInput, ChapterPage, CreateEditionInput, CreateMangaInput,
    CreateTranslatorInput, Edition, Manga, MangaDetail, MangaFilter, MangaLink, MangaTag,
    MangaType, MemberInput, MemberRole, PageOrder, TagKind, TranslationStatus, Translator,
    TranslatorMember, TranslatorShort, WorkStatus, MANGA_YEAR_RANGE, MAX_CHAPTER_NUMBER,
};
pub use material::{
    Episode, Genre, KodikItem, KodikMaterialData, KodikPage, Material, MaterialFilter, Season,
    Translation, MAX_EPISODE_SCREENSHOTS, MAX_SCREENSHOTS, SERIAL_TYPES,
};
pub use profile::{Profile, UpdateProfileInput};
pub use promo::{
    normalize_code, BalanceBonus, BonusType, CreatePromoInput, DiscountType, Hundredths,
    ItemGrant, PromoCode, PromoEffect, PromoReason, PromoRedemption, PromoView,
    RedemptionContext, RedemptionStatus, TopupDiscount, TopupQuote, PROMO_CODE_MAX_LEN,
    USER_AGENT_MAX_LEN,
};
pub use session::Session;
pub use shop::{CreateOfferInput, Offer, OfferView, Purchase, PurchaseStatus};
pub use user::{CreateUserInput, EmailVerification, User, UserRole};
pub use wallet::{Currency, TxType, Wallet, WalletTransaction};

/// A page of results with the total row count
#[derive(Debug, Clone, serde::Serialize)]
pub struct PagedResult<T> {
    pub results: Vec<T>,
    pub page: i64,
    pub page_size: i64,
    pub count: i64,
}

impl<T> PagedResult<T> {
    pub fn new(results: Vec<T>, page: i64, page_size: i64, count: i64) -> Self {
        Self {
            results,
            page,
            page_size,
            count,
        }
    }
}

/// Clamp user-supplied pagination to sane bounds
pub fn clamp_page(page: Option<i64>, page_size: Option<i64>, default_size: i64) -> (i64, i64) {
    let page = page.unwrap_or(1).max(1);
    let page_size = page_size.unwrap_or(default_size).clamp(1, 100);
    (page, page_size)
}
