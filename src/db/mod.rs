//! Database layer
//!
//! This module provides database abstraction for the Akimori backend.
//! It supports:
//! - SQLite (default, for single-binary deployment)
//! - MySQL (for larger deployments)
//!
//! The database driver is selected based on configuration.
//!
//! # Usage
//!
//! ```ignore
//! use akimori::config::DatabaseConfig;
//! use akimori::db::{create_pool, migrations};
//!
//! let pool = create_pool(&DatabaseConfig::default()).await?;
//! migrations::run_migrations(&pool).await?;
//!
//! let mut tx = pool.begin().await?;
//! // ... domain mutations through the *TxOps traits ...
//! tx.commit().await?;
//! ```

pub mod migrations;
pub mod pool;
pub mod repositories;
pub mod tx;

pub use pool::{
    create_pool, create_test_pool, DatabasePool, DbBackend, DynDatabasePool, MysqlDatabase,
    SqliteDatabase,
};
pub use tx::{DbTx, MysqlTx, SqliteTx};
