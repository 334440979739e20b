//! Database migrations module
//!
//! All migrations are embedded directly in Rust code as SQL strings, supporting
//! both SQLite and MySQL databases for single-binary deployment.
//!
//! # Usage
//!
//! ```ignore
//! use akimori::db::{create_pool, migrations};
//!
//! let pool = create_pool(&config).await?;
//! migrations::run_migrations(&pool).await?;
//! ```
//!
//! Each migration is defined as a `Migration` struct containing:
//! - `version`: Unique version number for ordering
//! - `name`: Human-readable migration name
//! - `up_sqlite`: SQL for SQLite database
//! - `up_mysql`: SQL for MySQL database
//!
//! Timestamps are always bound from Rust (never `CURRENT_TIMESTAMP`) so that
//! SQLite text timestamps share one format and compare correctly.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row, SqlitePool};

use super::{DbBackend, DynDatabasePool};
use crate::config::DatabaseDriver;

/// A database migration with SQL for both SQLite and MySQL
#[derive(Debug, Clone)]
pub struct Migration {
    /// Migration version number (must be unique and sequential)
    pub version: i32,
    /// Human-readable migration name
    pub name: &'static str,
    /// SQL statements for SQLite
    pub up_sqlite: &'static str,
    /// SQL statements for MySQL
    pub up_mysql: &'static str,
}

/// Migration record stored in the database
#[derive(Debug, Clone)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    pub applied_at: DateTime<Utc>,
}

/// All migrations, embedded in the binary.
pub const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "create_users",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username VARCHAR(150) NOT NULL UNIQUE,
                email VARCHAR(255) NOT NULL UNIQUE,
                password_hash VARCHAR(255) NOT NULL,
                role VARCHAR(20) NOT NULL DEFAULT 'user',
                is_active BOOLEAN NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS users (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                username VARCHAR(150) NOT NULL UNIQUE,
                email VARCHAR(255) NOT NULL UNIQUE,
                password_hash VARCHAR(255) NOT NULL,
                role VARCHAR(20) NOT NULL DEFAULT 'user',
                is_active BOOLEAN NOT NULL DEFAULT FALSE,
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6) NOT NULL
            );
        "#,
    },
    Migration {
        version: 2,
        name: "create_sessions",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id VARCHAR(64) PRIMARY KEY,
                user_id INTEGER NOT NULL,
                expires_at TIMESTAMP NOT NULL,
                created_at TIMESTAMP NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_sessions_user_id ON sessions(user_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_expires_at ON sessions(expires_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id VARCHAR(64) PRIMARY KEY,
                user_id BIGINT NOT NULL,
                expires_at DATETIME(6) NOT NULL,
                created_at DATETIME(6) NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_sessions_user_id ON sessions(user_id);
            CREATE INDEX idx_sessions_expires_at ON sessions(expires_at);
        "#,
    },
    Migration {
        version: 3,
        name: "create_email_verifications",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS email_verifications (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                code VARCHAR(6) NOT NULL UNIQUE,
                expires_at TIMESTAMP NOT NULL,
                is_used BOOLEAN NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_email_verifications_user ON email_verifications(user_id, created_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS email_verifications (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                user_id BIGINT NOT NULL,
                code VARCHAR(6) NOT NULL UNIQUE,
                expires_at DATETIME(6) NOT NULL,
                is_used BOOLEAN NOT NULL DEFAULT FALSE,
                created_at DATETIME(6) NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_email_verifications_user ON email_verifications(user_id, created_at);
        "#,
    },
    Migration {
        version: 4,
        name: "create_profiles",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id INTEGER PRIMARY KEY,
                display_name VARCHAR(100) NOT NULL DEFAULT '',
                bio TEXT,
                avatar_url VARCHAR(500),
                xp BIGINT NOT NULL DEFAULT 0 CHECK (xp >= 0),
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS profiles (
                user_id BIGINT PRIMARY KEY,
                display_name VARCHAR(100) NOT NULL DEFAULT '',
                bio TEXT,
                avatar_url VARCHAR(500),
                xp BIGINT NOT NULL DEFAULT 0 CHECK (xp >= 0),
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6) NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
        "#,
    },
    Migration {
        version: 5,
        name: "create_wallets_and_transactions",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS wallets (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                currency VARCHAR(3) NOT NULL,
                balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                UNIQUE (user_id, currency),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS wallet_transactions (
                id VARCHAR(36) PRIMARY KEY,
                wallet_id INTEGER NOT NULL,
                tx_type VARCHAR(20) NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                description VARCHAR(255) NOT NULL DEFAULT '',
                related_tx_id VARCHAR(36),
                idempotency_key VARCHAR(128) UNIQUE,
                created_at TIMESTAMP NOT NULL,
                FOREIGN KEY (wallet_id) REFERENCES wallets(id) ON DELETE CASCADE,
                FOREIGN KEY (related_tx_id) REFERENCES wallet_transactions(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_wallet_tx_wallet_created ON wallet_transactions(wallet_id, created_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS wallets (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                user_id BIGINT NOT NULL,
                currency VARCHAR(3) NOT NULL,
                balance BIGINT NOT NULL DEFAULT 0 CHECK (balance >= 0),
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6) NOT NULL,
                UNIQUE KEY uq_wallets_user_currency (user_id, currency),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS wallet_transactions (
                id VARCHAR(36) PRIMARY KEY,
                wallet_id BIGINT NOT NULL,
                tx_type VARCHAR(20) NOT NULL,
                amount BIGINT NOT NULL CHECK (amount > 0),
                description VARCHAR(255) NOT NULL DEFAULT '',
                related_tx_id VARCHAR(36),
                idempotency_key VARCHAR(128) UNIQUE,
                created_at DATETIME(6) NOT NULL,
                FOREIGN KEY (wallet_id) REFERENCES wallets(id) ON DELETE CASCADE,
                FOREIGN KEY (related_tx_id) REFERENCES wallet_transactions(id) ON DELETE SET NULL
            );
            CREATE INDEX idx_wallet_tx_wallet_created ON wallet_transactions(wallet_id, created_at);
        "#,
    },
    Migration {
        version: 6,
        name: "create_items_and_inventory",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS items (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_type VARCHAR(20) NOT NULL,
                slug VARCHAR(160) NOT NULL UNIQUE,
                title VARCHAR(160) NOT NULL,
                description TEXT NOT NULL,
                file_url VARCHAR(500) NOT NULL DEFAULT '',
                preview_url VARCHAR(500) NOT NULL DEFAULT '',
                is_animated BOOLEAN NOT NULL DEFAULT 0,
                mime VARCHAR(100) NOT NULL DEFAULT '',
                width BIGINT,
                height BIGINT,
                duration_ms BIGINT,
                rarity VARCHAR(10) NOT NULL DEFAULT 'common',
                attributes TEXT NOT NULL,
                price_aki BIGINT NOT NULL DEFAULT 0 CHECK (price_aki >= 0),
                limited_total BIGINT,
                limited_sold BIGINT NOT NULL DEFAULT 0,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                created_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_items_type_active ON items(item_type, is_active);
            CREATE TABLE IF NOT EXISTS inventory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                source VARCHAR(10) NOT NULL,
                note VARCHAR(255) NOT NULL DEFAULT '',
                acquired_at TIMESTAMP NOT NULL,
                UNIQUE (user_id, item_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS applied_customizations (
                user_id INTEGER PRIMARY KEY,
                avatar_item_id INTEGER,
                header_item_id INTEGER,
                theme_item_id INTEGER,
                frame_item_id INTEGER,
                updated_at TIMESTAMP NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (avatar_item_id) REFERENCES items(id) ON DELETE SET NULL,
                FOREIGN KEY (header_item_id) REFERENCES items(id) ON DELETE SET NULL,
                FOREIGN KEY (theme_item_id) REFERENCES items(id) ON DELETE SET NULL,
                FOREIGN KEY (frame_item_id) REFERENCES items(id) ON DELETE SET NULL
            );
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS items (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                item_type VARCHAR(20) NOT NULL,
                slug VARCHAR(160) NOT NULL UNIQUE,
                title VARCHAR(160) NOT NULL,
                description TEXT NOT NULL,
                file_url VARCHAR(500) NOT NULL DEFAULT '',
                preview_url VARCHAR(500) NOT NULL DEFAULT '',
                is_animated BOOLEAN NOT NULL DEFAULT FALSE,
                mime VARCHAR(100) NOT NULL DEFAULT '',
                width BIGINT,
                height BIGINT,
                duration_ms BIGINT,
                rarity VARCHAR(10) NOT NULL DEFAULT 'common',
                attributes TEXT NOT NULL,
                price_aki BIGINT NOT NULL DEFAULT 0 CHECK (price_aki >= 0),
                limited_total BIGINT,
                limited_sold BIGINT NOT NULL DEFAULT 0,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                created_at DATETIME(6) NOT NULL
            );
            CREATE INDEX idx_items_type_active ON items(item_type, is_active);
            CREATE TABLE IF NOT EXISTS inventory (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                user_id BIGINT NOT NULL,
                item_id BIGINT NOT NULL,
                source VARCHAR(10) NOT NULL,
                note VARCHAR(255) NOT NULL DEFAULT '',
                acquired_at DATETIME(6) NOT NULL,
                UNIQUE KEY uq_inventory_user_item (user_id, item_id),
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS applied_customizations (
                user_id BIGINT PRIMARY KEY,
                avatar_item_id BIGINT,
                header_item_id BIGINT,
                theme_item_id BIGINT,
                frame_item_id BIGINT,
                updated_at DATETIME(6) NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (avatar_item_id) REFERENCES items(id) ON DELETE SET NULL,
                FOREIGN KEY (header_item_id) REFERENCES items(id) ON DELETE SET NULL,
                FOREIGN KEY (theme_item_id) REFERENCES items(id) ON DELETE SET NULL,
                FOREIGN KEY (frame_item_id) REFERENCES items(id) ON DELETE SET NULL
            );
        "#,
    },
    // Default profile headers granted to every new account
    Migration {
        version: 7,
        name: "seed_default_headers",
        up_sqlite: r#"
            INSERT OR IGNORE INTO items (item_type, slug, title, description, is_animated, rarity, attributes, price_aki, is_active, created_at)
            VALUES ('header', 'header-default-1', 'Default header 1', '', 1, 'common', '{}', 0, 1, '2025-01-01T00:00:00+00:00');
            INSERT OR IGNORE INTO items (item_type, slug, title, description, is_animated, rarity, attributes, price_aki, is_active, created_at)
            VALUES ('header', 'header-default-2', 'Default header 2', '', 1, 'common', '{}', 0, 1, '2025-01-01T00:00:00+00:00');
            INSERT OR IGNORE INTO items (item_type, slug, title, description, is_animated, rarity, attributes, price_aki, is_active, created_at)
            VALUES ('header', 'header-default-3', 'Default header 3', '', 1, 'common', '{}', 0, 1, '2025-01-01T00:00:00+00:00');
        "#,
        up_mysql: r#"
            INSERT IGNORE INTO items (item_type, slug, title, description, is_animated, rarity, attributes, price_aki, is_active, created_at)
            VALUES ('header', 'header-default-1', 'Default header 1', '', TRUE, 'common', '{}', 0, TRUE, '2025-01-01 00:00:00');
            INSERT IGNORE INTO items (item_type, slug, title, description, is_animated, rarity, attributes, price_aki, is_active, created_at)
            VALUES ('header', 'header-default-2', 'Default header 2', '', TRUE, 'common', '{}', 0, TRUE, '2025-01-01 00:00:00');
            INSERT IGNORE INTO items (item_type, slug, title, description, is_animated, rarity, attributes, price_aki, is_active, created_at)
            VALUES ('header', 'header-default-3', 'Default header 3', '', TRUE, 'common', '{}', 0, TRUE, '2025-01-01 00:00:00');
        "#,
    },
    Migration {
        version: 8,
        name: "create_shop",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS shop_offers (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                item_id INTEGER NOT NULL UNIQUE,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                price_override_aki BIGINT,
                starts_at TIMESTAMP,
                ends_at TIMESTAMP,
                created_at TIMESTAMP NOT NULL,
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS purchases (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id INTEGER NOT NULL,
                item_id INTEGER NOT NULL,
                price_aki BIGINT NOT NULL,
                transaction_id VARCHAR(36),
                status VARCHAR(10) NOT NULL DEFAULT 'success',
                created_at TIMESTAMP NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE,
                FOREIGN KEY (transaction_id) REFERENCES wallet_transactions(id) ON DELETE SET NULL
            );
            CREATE INDEX IF NOT EXISTS idx_purchases_user ON purchases(user_id, created_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS shop_offers (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                item_id BIGINT NOT NULL UNIQUE,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                price_override_aki BIGINT,
                starts_at DATETIME(6) NULL,
                ends_at DATETIME(6) NULL,
                created_at DATETIME(6) NOT NULL,
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS purchases (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                user_id BIGINT NOT NULL,
                item_id BIGINT NOT NULL,
                price_aki BIGINT NOT NULL,
                transaction_id VARCHAR(36),
                status VARCHAR(10) NOT NULL DEFAULT 'success',
                created_at DATETIME(6) NOT NULL,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE,
                FOREIGN KEY (item_id) REFERENCES items(id) ON DELETE CASCADE,
                FOREIGN KEY (transaction_id) REFERENCES wallet_transactions(id) ON DELETE SET NULL
            );
            CREATE INDEX idx_purchases_user ON purchases(user_id, created_at);
        "#,
    },
    Migration {
        version: 9,
        name: "create_promo",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS promo_codes (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                code VARCHAR(32) NOT NULL UNIQUE,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                starts_at TIMESTAMP,
                ends_at TIMESTAMP,
                max_total_uses BIGINT NOT NULL DEFAULT 1,
                max_uses_per_user BIGINT NOT NULL DEFAULT 1,
                uses_count BIGINT NOT NULL DEFAULT 0,
                note VARCHAR(255) NOT NULL DEFAULT '',
                effect TEXT,
                created_at TIMESTAMP NOT NULL
            );
            CREATE TABLE IF NOT EXISTS promo_redemptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                promo_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'pending',
                context VARCHAR(16) NOT NULL DEFAULT 'manual',
                topup_amount_minor BIGINT,
                payment_id VARCHAR(128) NOT NULL DEFAULT '',
                topup_id VARCHAR(64) NOT NULL DEFAULT '',
                idempotency_key VARCHAR(64) UNIQUE,
                reserved_until TIMESTAMP,
                redeemed_at TIMESTAMP NOT NULL,
                applied_at TIMESTAMP,
                ip VARCHAR(64) NOT NULL DEFAULT '',
                user_agent VARCHAR(255) NOT NULL DEFAULT '',
                payload TEXT NOT NULL,
                FOREIGN KEY (promo_id) REFERENCES promo_codes(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_promo_red_lookup ON promo_redemptions(promo_id, user_id, status, redeemed_at);
            CREATE INDEX IF NOT EXISTS idx_promo_red_payment ON promo_redemptions(payment_id);
            CREATE INDEX IF NOT EXISTS idx_promo_red_topup ON promo_redemptions(topup_id);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS promo_codes (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                code VARCHAR(32) NOT NULL UNIQUE,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                starts_at DATETIME(6) NULL,
                ends_at DATETIME(6) NULL,
                max_total_uses BIGINT NOT NULL DEFAULT 1,
                max_uses_per_user BIGINT NOT NULL DEFAULT 1,
                uses_count BIGINT NOT NULL DEFAULT 0,
                note VARCHAR(255) NOT NULL DEFAULT '',
                effect TEXT,
                created_at DATETIME(6) NOT NULL
            );
            CREATE TABLE IF NOT EXISTS promo_redemptions (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                promo_id BIGINT NOT NULL,
                user_id BIGINT NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'pending',
                context VARCHAR(16) NOT NULL DEFAULT 'manual',
                topup_amount_minor BIGINT,
                payment_id VARCHAR(128) NOT NULL DEFAULT '',
                topup_id VARCHAR(64) NOT NULL DEFAULT '',
                idempotency_key VARCHAR(64) UNIQUE,
                reserved_until DATETIME(6) NULL,
                redeemed_at DATETIME(6) NOT NULL,
                applied_at DATETIME(6) NULL,
                ip VARCHAR(64) NOT NULL DEFAULT '',
                user_agent VARCHAR(255) NOT NULL DEFAULT '',
                payload TEXT NOT NULL,
                FOREIGN KEY (promo_id) REFERENCES promo_codes(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_promo_red_lookup ON promo_redemptions(promo_id, user_id, status, redeemed_at);
            CREATE INDEX idx_promo_red_payment ON promo_redemptions(payment_id);
            CREATE INDEX idx_promo_red_topup ON promo_redemptions(topup_id);
        "#,
    },
    Migration {
        version: 10,
        name: "create_chats",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id VARCHAR(36) PRIMARY KEY,
                title VARCHAR(200) NOT NULL DEFAULT '',
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_conversations_updated ON conversations(updated_at);
            CREATE TABLE IF NOT EXISTS conversation_participants (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id VARCHAR(36) NOT NULL,
                user_id INTEGER NOT NULL,
                is_admin BOOLEAN NOT NULL DEFAULT 0,
                joined_at TIMESTAMP NOT NULL,
                UNIQUE (conversation_id, user_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_participants_user ON conversation_participants(user_id);
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                conversation_id VARCHAR(36) NOT NULL,
                sender_id INTEGER NOT NULL,
                text TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                edited_at TIMESTAMP,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
                FOREIGN KEY (sender_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation ON messages(conversation_id, created_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS conversations (
                id VARCHAR(36) PRIMARY KEY,
                title VARCHAR(200) NOT NULL DEFAULT '',
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6) NOT NULL
            );
            CREATE INDEX idx_conversations_updated ON conversations(updated_at);
            CREATE TABLE IF NOT EXISTS conversation_participants (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                conversation_id VARCHAR(36) NOT NULL,
                user_id BIGINT NOT NULL,
                is_admin BOOLEAN NOT NULL DEFAULT FALSE,
                joined_at DATETIME(6) NOT NULL,
                UNIQUE KEY uq_participants (conversation_id, user_id),
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_participants_user ON conversation_participants(user_id);
            CREATE TABLE IF NOT EXISTS messages (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                conversation_id VARCHAR(36) NOT NULL,
                sender_id BIGINT NOT NULL,
                text TEXT NOT NULL,
                created_at DATETIME(6) NOT NULL,
                edited_at DATETIME(6) NULL,
                FOREIGN KEY (conversation_id) REFERENCES conversations(id) ON DELETE CASCADE,
                FOREIGN KEY (sender_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_messages_conversation ON messages(conversation_id, created_at);
        "#,
    },
    Migration {
        version: 11,
        name: "create_kodik_materials",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS kodik_materials (
                kodik_id VARCHAR(64) PRIMARY KEY,
                slug VARCHAR(255) NOT NULL DEFAULT '',
                material_type VARCHAR(32) NOT NULL DEFAULT '',
                link VARCHAR(500) NOT NULL DEFAULT '',
                title VARCHAR(500) NOT NULL DEFAULT '',
                title_orig VARCHAR(500) NOT NULL DEFAULT '',
                other_title TEXT,
                year BIGINT,
                quality VARCHAR(64) NOT NULL DEFAULT '',
                camrip BOOLEAN NOT NULL DEFAULT 0,
                lgbt BOOLEAN NOT NULL DEFAULT 0,
                kinopoisk_id VARCHAR(32),
                imdb_id VARCHAR(32),
                mdl_id VARCHAR(64),
                worldart_link VARCHAR(500),
                shikimori_id VARCHAR(32),
                remote_created_at TIMESTAMP,
                remote_updated_at TIMESTAMP,
                last_season BIGINT,
                last_episode BIGINT,
                episodes_count BIGINT,
                screenshots TEXT NOT NULL,
                poster_url VARCHAR(500),
                synced_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_kodik_materials_shikimori ON kodik_materials(shikimori_id);
            CREATE INDEX IF NOT EXISTS idx_kodik_materials_year ON kodik_materials(year);
            CREATE INDEX IF NOT EXISTS idx_kodik_materials_updated ON kodik_materials(remote_updated_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS kodik_materials (
                kodik_id VARCHAR(64) PRIMARY KEY,
                slug VARCHAR(255) NOT NULL DEFAULT '',
                material_type VARCHAR(32) NOT NULL DEFAULT '',
                link VARCHAR(500) NOT NULL DEFAULT '',
                title VARCHAR(500) NOT NULL DEFAULT '',
                title_orig VARCHAR(500) NOT NULL DEFAULT '',
                other_title TEXT,
                year BIGINT,
                quality VARCHAR(64) NOT NULL DEFAULT '',
                camrip BOOLEAN NOT NULL DEFAULT FALSE,
                lgbt BOOLEAN NOT NULL DEFAULT FALSE,
                kinopoisk_id VARCHAR(32),
                imdb_id VARCHAR(32),
                mdl_id VARCHAR(64),
                worldart_link VARCHAR(500),
                shikimori_id VARCHAR(32),
                remote_created_at DATETIME(6) NULL,
                remote_updated_at DATETIME(6) NULL,
                last_season BIGINT,
                last_episode BIGINT,
                episodes_count BIGINT,
                screenshots TEXT NOT NULL,
                poster_url VARCHAR(500),
                synced_at DATETIME(6) NOT NULL
            );
            CREATE INDEX idx_kodik_materials_shikimori ON kodik_materials(shikimori_id);
            CREATE INDEX idx_kodik_materials_year ON kodik_materials(year);
            CREATE INDEX idx_kodik_materials_updated ON kodik_materials(remote_updated_at);
        "#,
    },
    Migration {
        version: 12,
        name: "create_kodik_relations",
        up_sqlite: r#"
            ALTER TABLE kodik_materials ADD COLUMN translation_id BIGINT;
            ALTER TABLE kodik_materials ADD COLUMN blocked_countries TEXT NOT NULL DEFAULT '[]';
            CREATE INDEX IF NOT EXISTS idx_kodik_materials_translation ON kodik_materials(translation_id);
            CREATE TABLE IF NOT EXISTS kodik_translations (
                id BIGINT PRIMARY KEY,
                title VARCHAR(255) NOT NULL DEFAULT '',
                translation_type VARCHAR(16) NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS kodik_genres (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(100) NOT NULL,
                source VARCHAR(16) NOT NULL,
                UNIQUE (name, source)
            );
            CREATE TABLE IF NOT EXISTS material_genres (
                kodik_id VARCHAR(64) NOT NULL,
                genre_id BIGINT NOT NULL,
                PRIMARY KEY (kodik_id, genre_id),
                FOREIGN KEY (kodik_id) REFERENCES kodik_materials(kodik_id) ON DELETE CASCADE,
                FOREIGN KEY (genre_id) REFERENCES kodik_genres(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_material_genres_genre ON material_genres(genre_id);
            CREATE TABLE IF NOT EXISTS material_seasons (
                kodik_id VARCHAR(64) NOT NULL,
                number BIGINT NOT NULL,
                link VARCHAR(500) NOT NULL DEFAULT '',
                PRIMARY KEY (kodik_id, number),
                FOREIGN KEY (kodik_id) REFERENCES kodik_materials(kodik_id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS material_episodes (
                kodik_id VARCHAR(64) NOT NULL,
                season_number BIGINT NOT NULL,
                number BIGINT NOT NULL,
                link VARCHAR(500) NOT NULL DEFAULT '',
                title VARCHAR(255) NOT NULL DEFAULT '',
                screenshots TEXT NOT NULL,
                PRIMARY KEY (kodik_id, season_number, number),
                FOREIGN KEY (kodik_id, season_number) REFERENCES material_seasons(kodik_id, number) ON DELETE CASCADE
            );
        "#,
        up_mysql: r#"
            ALTER TABLE kodik_materials ADD COLUMN translation_id BIGINT NULL;
            ALTER TABLE kodik_materials ADD COLUMN blocked_countries TEXT NULL;
            CREATE INDEX idx_kodik_materials_translation ON kodik_materials(translation_id);
            CREATE TABLE IF NOT EXISTS kodik_translations (
                id BIGINT PRIMARY KEY,
                title VARCHAR(255) NOT NULL DEFAULT '',
                translation_type VARCHAR(16) NOT NULL DEFAULT ''
            );
            CREATE TABLE IF NOT EXISTS kodik_genres (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                name VARCHAR(100) NOT NULL,
                source VARCHAR(16) NOT NULL,
                UNIQUE KEY uq_kodik_genres (name, source)
            );
            CREATE TABLE IF NOT EXISTS material_genres (
                kodik_id VARCHAR(64) NOT NULL,
                genre_id BIGINT NOT NULL,
                PRIMARY KEY (kodik_id, genre_id),
                FOREIGN KEY (kodik_id) REFERENCES kodik_materials(kodik_id) ON DELETE CASCADE,
                FOREIGN KEY (genre_id) REFERENCES kodik_genres(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_material_genres_genre ON material_genres(genre_id);
            CREATE TABLE IF NOT EXISTS material_seasons (
                kodik_id VARCHAR(64) NOT NULL,
                number BIGINT NOT NULL,
                link VARCHAR(500) NOT NULL DEFAULT '',
                PRIMARY KEY (kodik_id, number),
                FOREIGN KEY (kodik_id) REFERENCES kodik_materials(kodik_id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS material_episodes (
                kodik_id VARCHAR(64) NOT NULL,
                season_number BIGINT NOT NULL,
                number BIGINT NOT NULL,
                link VARCHAR(500) NOT NULL DEFAULT '',
                title VARCHAR(255) NOT NULL DEFAULT '',
                screenshots TEXT NOT NULL,
                PRIMARY KEY (kodik_id, season_number, number),
                FOREIGN KEY (kodik_id, season_number) REFERENCES material_seasons(kodik_id, number) ON DELETE CASCADE
            );
        "#,
    },
    Migration {
        version: 13,
        name: "create_manga",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS manga_genres (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title VARCHAR(100) NOT NULL,
                slug VARCHAR(160) NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS manga_categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title VARCHAR(100) NOT NULL,
                slug VARCHAR(160) NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS translators (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name VARCHAR(255) NOT NULL,
                slug VARCHAR(160) NOT NULL UNIQUE,
                avatar_url VARCHAR(500) NOT NULL DEFAULT '',
                description TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL
            );
            CREATE TABLE IF NOT EXISTS translator_members (
                translator_id INTEGER NOT NULL,
                user_id INTEGER NOT NULL,
                role VARCHAR(16) NOT NULL DEFAULT 'member',
                title VARCHAR(100) NOT NULL DEFAULT '',
                is_active BOOLEAN NOT NULL DEFAULT 1,
                joined_at TIMESTAMP NOT NULL,
                PRIMARY KEY (translator_id, user_id),
                FOREIGN KEY (translator_id) REFERENCES translators(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_translator_members_user ON translator_members(user_id);
            CREATE TABLE IF NOT EXISTS mangas (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                slug VARCHAR(160) NOT NULL UNIQUE,
                title_ru VARCHAR(255) NOT NULL,
                title_en VARCHAR(255) NOT NULL DEFAULT '',
                alt_titles TEXT NOT NULL,
                manga_type VARCHAR(16) NOT NULL DEFAULT 'manga',
                age_rating VARCHAR(8) NOT NULL DEFAULT '',
                year INTEGER,
                poster_url VARCHAR(500) NOT NULL DEFAULT '',
                banner_url VARCHAR(500) NOT NULL DEFAULT '',
                description TEXT NOT NULL,
                work_status VARCHAR(16) NOT NULL DEFAULT 'ongoing',
                links TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_mangas_updated ON mangas(updated_at);
            CREATE TABLE IF NOT EXISTS manga_genre_links (
                manga_id INTEGER NOT NULL,
                tag_id INTEGER NOT NULL,
                PRIMARY KEY (manga_id, tag_id),
                FOREIGN KEY (manga_id) REFERENCES mangas(id) ON DELETE CASCADE,
                FOREIGN KEY (tag_id) REFERENCES manga_genres(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS manga_category_links (
                manga_id INTEGER NOT NULL,
                tag_id INTEGER NOT NULL,
                PRIMARY KEY (manga_id, tag_id),
                FOREIGN KEY (manga_id) REFERENCES mangas(id) ON DELETE CASCADE,
                FOREIGN KEY (tag_id) REFERENCES manga_categories(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS editions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                manga_id INTEGER NOT NULL,
                translator_id INTEGER NOT NULL,
                translation_status VARCHAR(16) NOT NULL DEFAULT 'in_progress',
                created_at TIMESTAMP NOT NULL,
                UNIQUE (manga_id, translator_id),
                FOREIGN KEY (manga_id) REFERENCES mangas(id) ON DELETE CASCADE,
                FOREIGN KEY (translator_id) REFERENCES translators(id)
            );
            CREATE TABLE IF NOT EXISTS chapters (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                edition_id INTEGER NOT NULL,
                number BIGINT NOT NULL,
                name VARCHAR(255) NOT NULL DEFAULT '',
                volume INTEGER,
                pages_count INTEGER NOT NULL DEFAULT 0,
                published_at TIMESTAMP,
                uploaded_by INTEGER,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                UNIQUE (edition_id, number),
                FOREIGN KEY (edition_id) REFERENCES editions(id) ON DELETE CASCADE,
                FOREIGN KEY (uploaded_by) REFERENCES users(id) ON DELETE SET NULL
            );
            CREATE TABLE IF NOT EXISTS chapter_pages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                chapter_id INTEGER NOT NULL,
                image_url VARCHAR(500) NOT NULL,
                page_order INTEGER NOT NULL,
                uploaded_by INTEGER,
                created_at TIMESTAMP NOT NULL,
                UNIQUE (chapter_id, page_order),
                FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE,
                FOREIGN KEY (uploaded_by) REFERENCES users(id) ON DELETE SET NULL
            );
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS manga_genres (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                title VARCHAR(100) NOT NULL,
                slug VARCHAR(160) NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS manga_categories (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                title VARCHAR(100) NOT NULL,
                slug VARCHAR(160) NOT NULL UNIQUE
            );
            CREATE TABLE IF NOT EXISTS translators (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                name VARCHAR(255) NOT NULL,
                slug VARCHAR(160) NOT NULL UNIQUE,
                avatar_url VARCHAR(500) NOT NULL DEFAULT '',
                description TEXT NOT NULL,
                created_at DATETIME(6) NOT NULL
            );
            CREATE TABLE IF NOT EXISTS translator_members (
                translator_id BIGINT NOT NULL,
                user_id BIGINT NOT NULL,
                role VARCHAR(16) NOT NULL DEFAULT 'member',
                title VARCHAR(100) NOT NULL DEFAULT '',
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                joined_at DATETIME(6) NOT NULL,
                PRIMARY KEY (translator_id, user_id),
                FOREIGN KEY (translator_id) REFERENCES translators(id) ON DELETE CASCADE,
                FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_translator_members_user ON translator_members(user_id);
            CREATE TABLE IF NOT EXISTS mangas (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                slug VARCHAR(160) NOT NULL UNIQUE,
                title_ru VARCHAR(255) NOT NULL,
                title_en VARCHAR(255) NOT NULL DEFAULT '',
                alt_titles TEXT NOT NULL,
                manga_type VARCHAR(16) NOT NULL DEFAULT 'manga',
                age_rating VARCHAR(8) NOT NULL DEFAULT '',
                year BIGINT NULL,
                poster_url VARCHAR(500) NOT NULL DEFAULT '',
                banner_url VARCHAR(500) NOT NULL DEFAULT '',
                description TEXT NOT NULL,
                work_status VARCHAR(16) NOT NULL DEFAULT 'ongoing',
                links TEXT NOT NULL,
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6) NOT NULL
            );
            CREATE INDEX idx_mangas_updated ON mangas(updated_at);
            CREATE TABLE IF NOT EXISTS manga_genre_links (
                manga_id BIGINT NOT NULL,
                tag_id BIGINT NOT NULL,
                PRIMARY KEY (manga_id, tag_id),
                FOREIGN KEY (manga_id) REFERENCES mangas(id) ON DELETE CASCADE,
                FOREIGN KEY (tag_id) REFERENCES manga_genres(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS manga_category_links (
                manga_id BIGINT NOT NULL,
                tag_id BIGINT NOT NULL,
                PRIMARY KEY (manga_id, tag_id),
                FOREIGN KEY (manga_id) REFERENCES mangas(id) ON DELETE CASCADE,
                FOREIGN KEY (tag_id) REFERENCES manga_categories(id) ON DELETE CASCADE
            );
            CREATE TABLE IF NOT EXISTS editions (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                manga_id BIGINT NOT NULL,
                translator_id BIGINT NOT NULL,
                translation_status VARCHAR(16) NOT NULL DEFAULT 'in_progress',
                created_at DATETIME(6) NOT NULL,
                UNIQUE KEY uq_editions (manga_id, translator_id),
                FOREIGN KEY (manga_id) REFERENCES mangas(id) ON DELETE CASCADE,
                FOREIGN KEY (translator_id) REFERENCES translators(id)
            );
            CREATE TABLE IF NOT EXISTS chapters (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                edition_id BIGINT NOT NULL,
                number BIGINT NOT NULL,
                name VARCHAR(255) NOT NULL DEFAULT '',
                volume BIGINT NULL,
                pages_count BIGINT NOT NULL DEFAULT 0,
                published_at DATETIME(6) NULL,
                uploaded_by BIGINT NULL,
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6) NOT NULL,
                UNIQUE KEY uq_chapters (edition_id, number),
                FOREIGN KEY (edition_id) REFERENCES editions(id) ON DELETE CASCADE,
                FOREIGN KEY (uploaded_by) REFERENCES users(id) ON DELETE SET NULL
            );
            CREATE TABLE IF NOT EXISTS chapter_pages (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                chapter_id BIGINT NOT NULL,
                image_url VARCHAR(500) NOT NULL,
                page_order BIGINT NOT NULL,
                uploaded_by BIGINT NULL,
                created_at DATETIME(6) NOT NULL,
                UNIQUE KEY uq_chapter_pages (chapter_id, page_order),
                FOREIGN KEY (chapter_id) REFERENCES chapters(id) ON DELETE CASCADE,
                FOREIGN KEY (uploaded_by) REFERENCES users(id) ON DELETE SET NULL
            );
        "#,
    },
    Migration {
        version: 14,
        name: "create_forum",
        up_sqlite: r#"
            CREATE TABLE IF NOT EXISTS forum_categories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title VARCHAR(120) NOT NULL UNIQUE,
                slug VARCHAR(140) NOT NULL UNIQUE,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                sort_order INTEGER NOT NULL DEFAULT 100,
                created_at TIMESTAMP NOT NULL
            );
            CREATE TABLE IF NOT EXISTS forum_thread_kinds (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title VARCHAR(100) NOT NULL UNIQUE,
                slug VARCHAR(120) NOT NULL UNIQUE,
                description TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                sort_order INTEGER NOT NULL DEFAULT 100,
                allow_anime BOOLEAN NOT NULL DEFAULT 0,
                allow_manga BOOLEAN NOT NULL DEFAULT 0,
                allow_publish_as_team BOOLEAN NOT NULL DEFAULT 1,
                created_at TIMESTAMP NOT NULL
            );
            CREATE TABLE IF NOT EXISTS forum_threads (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                category_id INTEGER NOT NULL,
                kind_id INTEGER NOT NULL,
                author_id INTEGER NOT NULL,
                team_id INTEGER,
                title VARCHAR(200) NOT NULL,
                slug VARCHAR(220) NOT NULL UNIQUE,
                content TEXT NOT NULL,
                anime_id VARCHAR(64),
                manga_id INTEGER,
                comments_count INTEGER NOT NULL DEFAULT 0,
                last_activity_at TIMESTAMP NOT NULL,
                is_locked BOOLEAN NOT NULL DEFAULT 0,
                is_pinned BOOLEAN NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                FOREIGN KEY (category_id) REFERENCES forum_categories(id),
                FOREIGN KEY (kind_id) REFERENCES forum_thread_kinds(id),
                FOREIGN KEY (author_id) REFERENCES users(id),
                FOREIGN KEY (team_id) REFERENCES translators(id),
                FOREIGN KEY (anime_id) REFERENCES kodik_materials(kodik_id),
                FOREIGN KEY (manga_id) REFERENCES mangas(id)
            );
            CREATE INDEX IF NOT EXISTS idx_forum_threads_category ON forum_threads(category_id, last_activity_at);
            CREATE INDEX IF NOT EXISTS idx_forum_threads_kind ON forum_threads(kind_id, last_activity_at);
            CREATE TABLE IF NOT EXISTS forum_comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                thread_id INTEGER NOT NULL,
                author_id INTEGER NOT NULL,
                team_id INTEGER,
                parent_id INTEGER,
                content TEXT NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'published',
                is_deleted BOOLEAN NOT NULL DEFAULT 0,
                is_pinned BOOLEAN NOT NULL DEFAULT 0,
                replies_count INTEGER NOT NULL DEFAULT 0,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL,
                FOREIGN KEY (thread_id) REFERENCES forum_threads(id) ON DELETE CASCADE,
                FOREIGN KEY (author_id) REFERENCES users(id),
                FOREIGN KEY (team_id) REFERENCES translators(id),
                FOREIGN KEY (parent_id) REFERENCES forum_comments(id) ON DELETE CASCADE
            );
            CREATE INDEX IF NOT EXISTS idx_forum_comments_thread ON forum_comments(thread_id, status, is_deleted, created_at);
            CREATE INDEX IF NOT EXISTS idx_forum_comments_parent ON forum_comments(parent_id, created_at);
        "#,
        up_mysql: r#"
            CREATE TABLE IF NOT EXISTS forum_categories (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                title VARCHAR(120) NOT NULL UNIQUE,
                slug VARCHAR(140) NOT NULL UNIQUE,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                sort_order BIGINT NOT NULL DEFAULT 100,
                created_at DATETIME(6) NOT NULL
            );
            CREATE TABLE IF NOT EXISTS forum_thread_kinds (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                title VARCHAR(100) NOT NULL UNIQUE,
                slug VARCHAR(120) NOT NULL UNIQUE,
                description TEXT NOT NULL,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                sort_order BIGINT NOT NULL DEFAULT 100,
                allow_anime BOOLEAN NOT NULL DEFAULT FALSE,
                allow_manga BOOLEAN NOT NULL DEFAULT FALSE,
                allow_publish_as_team BOOLEAN NOT NULL DEFAULT TRUE,
                created_at DATETIME(6) NOT NULL
            );
            CREATE TABLE IF NOT EXISTS forum_threads (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                category_id BIGINT NOT NULL,
                kind_id BIGINT NOT NULL,
                author_id BIGINT NOT NULL,
                team_id BIGINT NULL,
                title VARCHAR(200) NOT NULL,
                slug VARCHAR(220) NOT NULL UNIQUE,
                content TEXT NOT NULL,
                anime_id VARCHAR(64) NULL,
                manga_id BIGINT NULL,
                comments_count BIGINT NOT NULL DEFAULT 0,
                last_activity_at DATETIME(6) NOT NULL,
                is_locked BOOLEAN NOT NULL DEFAULT FALSE,
                is_pinned BOOLEAN NOT NULL DEFAULT FALSE,
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6) NOT NULL,
                FOREIGN KEY (category_id) REFERENCES forum_categories(id),
                FOREIGN KEY (kind_id) REFERENCES forum_thread_kinds(id),
                FOREIGN KEY (author_id) REFERENCES users(id),
                FOREIGN KEY (team_id) REFERENCES translators(id),
                FOREIGN KEY (anime_id) REFERENCES kodik_materials(kodik_id),
                FOREIGN KEY (manga_id) REFERENCES mangas(id)
            );
            CREATE INDEX idx_forum_threads_category ON forum_threads(category_id, last_activity_at);
            CREATE INDEX idx_forum_threads_kind ON forum_threads(kind_id, last_activity_at);
            CREATE TABLE IF NOT EXISTS forum_comments (
                id BIGINT PRIMARY KEY AUTO_INCREMENT,
                thread_id BIGINT NOT NULL,
                author_id BIGINT NOT NULL,
                team_id BIGINT NULL,
                parent_id BIGINT NULL,
                content TEXT NOT NULL,
                status VARCHAR(16) NOT NULL DEFAULT 'published',
                is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
                is_pinned BOOLEAN NOT NULL DEFAULT FALSE,
                replies_count BIGINT NOT NULL DEFAULT 0,
                created_at DATETIME(6) NOT NULL,
                updated_at DATETIME(6) NOT NULL,
                FOREIGN KEY (thread_id) REFERENCES forum_threads(id) ON DELETE CASCADE,
                FOREIGN KEY (author_id) REFERENCES users(id),
                FOREIGN KEY (team_id) REFERENCES translators(id),
                FOREIGN KEY (parent_id) REFERENCES forum_comments(id) ON DELETE CASCADE
            );
            CREATE INDEX idx_forum_comments_thread ON forum_comments(thread_id, status, is_deleted, created_at);
            CREATE INDEX idx_forum_comments_parent ON forum_comments(parent_id, created_at);
        "#,
    },
];

/// Run all pending migrations
///
/// This function:
/// 1. Creates the migrations tracking table if it doesn't exist
/// 2. Checks which migrations have already been applied
/// 3. Runs any pending migrations in order
///
/// # Returns
///
/// Number of migrations applied
///
/// # Errors
///
/// Returns an error if any migration fails to apply
pub async fn run_migrations(pool: &DynDatabasePool) -> Result<usize> {
    create_migrations_table(pool).await?;

    let applied = get_applied_migrations(pool).await?;
    let applied_versions: Vec<i32> = applied.iter().map(|m| m.version as i32).collect();

    let mut count = 0;
    for migration in MIGRATIONS {
        if !applied_versions.contains(&migration.version) {
            tracing::info!("Applying migration {}: {}", migration.version, migration.name);

            apply_migration(pool, migration)
                .await
                .with_context(|| format!("Failed to apply migration: {}", migration.name))?;

            count += 1;
        }
    }

    if count > 0 {
        tracing::info!("Applied {} migration(s)", count);
    } else {
        tracing::debug!("No pending migrations");
    }

    Ok(count)
}

/// Create the migrations tracking table if it doesn't exist
async fn create_migrations_table(pool: &DynDatabasePool) -> Result<()> {
    let sql = match pool.driver() {
        DatabaseDriver::Sqlite => {
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INTEGER PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMP NOT NULL
            )
            "#
        }
        DatabaseDriver::Mysql => {
            r#"
            CREATE TABLE IF NOT EXISTS _migrations (
                version INT PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at DATETIME(6) NOT NULL
            )
            "#
        }
    };

    pool.execute(sql).await?;
    Ok(())
}

async fn get_applied_migrations(pool: &DynDatabasePool) -> Result<Vec<MigrationRecord>> {
    match pool.backend() {
        DbBackend::Sqlite(pool) => get_applied_migrations_sqlite(pool).await,
        DbBackend::Mysql(pool) => get_applied_migrations_mysql(pool).await,
    }
}

async fn get_applied_migrations_sqlite(pool: &SqlitePool) -> Result<Vec<MigrationRecord>> {
    let rows = sqlx::query("SELECT version, name, applied_at FROM _migrations ORDER BY version")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| MigrationRecord {
            version: row.get("version"),
            name: row.get("name"),
            applied_at: row.get("applied_at"),
        })
        .collect())
}

async fn get_applied_migrations_mysql(pool: &MySqlPool) -> Result<Vec<MigrationRecord>> {
    let rows = sqlx::query("SELECT version, name, applied_at FROM _migrations ORDER BY version")
        .fetch_all(pool)
        .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let version: i32 = row.get("version");
            MigrationRecord {
                version: version as i64,
                name: row.get("name"),
                applied_at: row.get("applied_at"),
            }
        })
        .collect())
}

async fn apply_migration(pool: &DynDatabasePool, migration: &Migration) -> Result<()> {
    match pool.backend() {
        DbBackend::Sqlite(pool) => apply_migration_sqlite(pool, migration).await,
        DbBackend::Mysql(pool) => apply_migration_mysql(pool, migration).await,
    }
}

async fn apply_migration_sqlite(pool: &SqlitePool, migration: &Migration) -> Result<()> {
    for statement in split_sql_statements(migration.up_sqlite) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    sqlx::query("INSERT INTO _migrations (version, name, applied_at) VALUES (?, ?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

async fn apply_migration_mysql(pool: &MySqlPool, migration: &Migration) -> Result<()> {
    for statement in split_sql_statements(migration.up_mysql) {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("Failed to execute: {}", truncate_sql(statement)))?;
    }

    sqlx::query("INSERT INTO _migrations (version, name, applied_at) VALUES (?, ?, ?)")
        .bind(migration.version)
        .bind(migration.name)
        .bind(Utc::now())
        .execute(pool)
        .await?;

    Ok(())
}

/// Truncate SQL for error messages
fn truncate_sql(sql: &str) -> String {
    match sql.char_indices().nth(100) {
        Some((idx, _)) => format!("{}...", &sql[..idx]),
        None => sql.to_string(),
    }
}

/// Split SQL into individual statements, skipping comment-only fragments
fn split_sql_statements(sql: &str) -> Vec<&str> {
    sql.split(';')
        .map(str::trim)
        .filter(|stmt| !stmt.is_empty() && !is_comment_only(stmt))
        .collect()
}

/// Check if a string contains only SQL comments
fn is_comment_only(s: &str) -> bool {
    s.lines()
        .map(str::trim)
        .all(|line| line.is_empty() || line.starts_with("--"))
}

/// Check if migrations are up to date
pub async fn is_up_to_date(pool: &DynDatabasePool) -> Result<bool> {
    create_migrations_table(pool).await?;
    let applied = get_applied_migrations(pool).await?;
    Ok(applied.len() == MIGRATIONS.len())
}

/// Get pending migrations count
pub async fn pending_count(pool: &DynDatabasePool) -> Result<usize> {
    create_migrations_table(pool).await?;
    let applied = get_applied_migrations(pool).await?;
    Ok(MIGRATIONS.len().saturating_sub(applied.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;

    async fn migrated_pool() -> DynDatabasePool {
        let pool = create_test_pool().await.expect("Failed to create test pool");
        run_migrations(&pool).await.expect("Failed to run migrations");
        pool
    }

    async fn insert_user(pool: &SqlitePool, username: &str) -> i64 {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO users (username, email, password_hash, role, is_active, created_at, updated_at) VALUES (?, ?, 'hash', 'user', 1, ?, ?)",
        )
        .bind(username)
        .bind(format!("{}@example.com", username))
        .bind(now)
        .bind(now)
        .execute(pool)
        .await
        .expect("Failed to insert user")
        .last_insert_rowid()
    }

    #[tokio::test]
    async fn test_run_migrations() {
        let pool = create_test_pool().await.expect("Failed to create test pool");

        let count = run_migrations(&pool).await.expect("Failed to run migrations");
        assert_eq!(count, MIGRATIONS.len());

        let count = run_migrations(&pool).await.expect("Failed to run migrations");
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_is_up_to_date_and_pending_count() {
        let pool = create_test_pool().await.expect("Failed to create test pool");

        assert!(!is_up_to_date(&pool).await.unwrap());
        assert_eq!(pending_count(&pool).await.unwrap(), MIGRATIONS.len());

        run_migrations(&pool).await.unwrap();

        assert!(is_up_to_date(&pool).await.unwrap());
        assert_eq!(pending_count(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_default_headers_seeded() {
        let pool = migrated_pool().await;
        let row = sqlx::query(
            "SELECT COUNT(*) AS count FROM items WHERE slug LIKE 'header-default-%' AND item_type = 'header'",
        )
        .fetch_one(pool.as_sqlite().unwrap())
        .await
        .unwrap();
        let count: i64 = row.get("count");
        assert_eq!(count, 3);
    }

    #[tokio::test]
    async fn test_wallet_balance_cannot_go_negative() {
        let pool = migrated_pool().await;
        let sqlite = pool.as_sqlite().unwrap();
        let user_id = insert_user(sqlite, "alice").await;
        let now = Utc::now();

        let result = sqlx::query(
            "INSERT INTO wallets (user_id, currency, balance, created_at, updated_at) VALUES (?, 'AKI', -1, ?, ?)",
        )
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(sqlite)
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_wallet_unique_per_currency() {
        let pool = migrated_pool().await;
        let sqlite = pool.as_sqlite().unwrap();
        let user_id = insert_user(sqlite, "bob").await;
        let now = Utc::now();

        let insert = || {
            sqlx::query(
                "INSERT INTO wallets (user_id, currency, balance, created_at, updated_at) VALUES (?, 'RUB', 0, ?, ?)",
            )
            .bind(user_id)
            .bind(now)
            .bind(now)
            .execute(sqlite)
        };
        assert!(insert().await.is_ok());
        assert!(insert().await.is_err());
    }

    #[tokio::test]
    async fn test_inventory_unique_per_item() {
        let pool = migrated_pool().await;
        let sqlite = pool.as_sqlite().unwrap();
        let user_id = insert_user(sqlite, "carol").await;
        let now = Utc::now();

        let insert = || {
            sqlx::query(
                "INSERT INTO inventory (user_id, item_id, source, acquired_at) VALUES (?, 1, 'gift', ?)",
            )
            .bind(user_id)
            .bind(now)
            .execute(sqlite)
        };
        assert!(insert().await.is_ok());
        assert!(insert().await.is_err());
    }

    #[tokio::test]
    async fn test_chapter_numbers_unique_per_edition() {
        let pool = migrated_pool().await;
        let sqlite = pool.as_sqlite().unwrap();
        let now = Utc::now();
        sqlx::query("INSERT INTO translators (name, slug, description, created_at) VALUES ('Team', 'team', '', ?)")
            .bind(now)
            .execute(sqlite)
            .await
            .unwrap();
        sqlx::query(
            "INSERT INTO mangas (slug, title_ru, alt_titles, description, links, created_at, updated_at) VALUES ('m', 'M', '[]', '', '[]', ?, ?)",
        )
        .bind(now)
        .bind(now)
        .execute(sqlite)
        .await
        .unwrap();
        sqlx::query("INSERT INTO editions (manga_id, translator_id, created_at) VALUES (1, 1, ?)")
            .bind(now)
            .execute(sqlite)
            .await
            .unwrap();

        let insert = |number: i64| {
            sqlx::query(
                "INSERT INTO chapters (edition_id, number, created_at, updated_at) VALUES (1, ?, ?, ?)",
            )
            .bind(number)
            .bind(now)
            .bind(now)
            .execute(sqlite)
        };
        assert!(insert(100).await.is_ok());
        assert!(insert(150).await.is_ok());
        assert!(insert(100).await.is_err());
    }

    #[test]
    fn test_split_sql_statements() {
        let sql = "CREATE TABLE a (id INT);\n-- comment only;\nCREATE INDEX i ON a(id);";
        let statements = split_sql_statements(sql);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("CREATE TABLE"));
        assert!(statements[1].starts_with("CREATE INDEX"));
    }

    #[test]
    fn test_migration_versions_are_sequential() {
        for (idx, migration) in MIGRATIONS.iter().enumerate() {
            assert_eq!(migration.version as usize, idx + 1);
        }
    }
}
