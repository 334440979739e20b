//! Database repositories
//!
//! Repository pattern implementations for database access.
//! Each repository handles reads and simple writes for one aggregate; writes
//! that must be atomic with others are exposed as `*TxOps` traits implemented
//! on the driver transactions.

pub mod chat;
pub mod forum;
pub mod item;
pub mod manga;
pub mod material;
pub mod profile;
pub mod promo;
pub mod session;
pub mod shop;
pub mod user;
pub mod verification;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_support;

pub use chat::{ChatRepository, ChatTxOps, SqlxChatRepository};
pub use forum::{ForumRepository, ForumTxOps, SqlxForumRepository};
pub use item::{InventoryTxOps, ItemFilter, ItemRepository, SqlxItemRepository};
pub use manga::{MangaRepository, MangaTxOps, SqlxMangaRepository};
pub use material::{MaterialRepository, MaterialTxOps, SqlxMaterialRepository};
pub use profile::{ProfileRepository, ProfileTxOps, SqlxProfileRepository};
pub use promo::{PromoRepository, PromoTxOps, SqlxPromoRepository};
pub use session::{SessionRepository, SqlxSessionRepository};
pub use shop::{ShopRepository, ShopTxOps, SqlxShopRepository};
pub use user::{SqlxUserRepository, UserRepository};
pub use verification::{SqlxVerificationRepository, VerificationRepository};
pub use wallet::{SqlxWalletRepository, WalletRepository, WalletTxOps};
