//! Services layer - Business logic
//!
//! This module contains all business logic services for the Akimori backend.
//! Services are responsible for:
//! - Implementing business rules
//! - Running multi-row writes inside one transaction
//! - Coordinating between repositories and cache

pub mod chat;
#[cfg(feature = "redis-cache")]
pub mod chat_relay;
pub mod customitem;
pub mod economy;
pub mod email;
pub mod forum;
pub mod kodik;
pub mod leveling;
pub mod manga;
pub mod password;
pub mod profile;
pub mod promo;
pub mod rate_limiter;
pub mod shop;
pub mod user;

pub use chat::{create_chat_bus, ChatBus, ChatError, ChatService, ConnectionRegistry, Subscription};
pub use customitem::{CustomItemError, CustomItemService};
pub use economy::{EconomyError, EconomyService, TransferResult};
pub use email::{generate_verification_code, EmailService};
pub use forum::{ForumError, ForumService};
pub use kodik::{CatalogService, ImportOptions, ImportStats, KodikClient, KodikError, KodikImporter};
pub use leveling::LevelProgress;
pub use manga::{MangaError, MangaService};
pub use password::{hash_password, verify_password};
pub use profile::{AddXpResult, ProfileError, ProfileService, PublicProfile};
pub use promo::{ClientInfo, PromoError, PromoService, ReserveInput};
pub use rate_limiter::LoginRateLimiter;
pub use shop::{PurchaseResult, PurchaseTarget, ShopError, ShopService};
pub use user::{LoginInput, RegisterInput, UserService, UserServiceError, UserServiceOptions};
