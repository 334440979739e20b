//! Database transactions
//!
//! Multi-row mutations (ledger postings, promo transitions, purchases, chat
//! sends, catalog upserts, chapter pages, forum comments) run inside a single transaction handed out by
//! [`DatabasePool::begin`](super::DatabasePool::begin). Business logic is
//! written once against `&mut dyn DbTx`; the per-driver SQL lives next to
//! the matching repository as implementations of the `*TxOps` traits for
//! [`SqliteTx`] and [`MysqlTx`].
//!
//! Row locks: MySQL uses `SELECT ... FOR UPDATE`. SQLite has a single writer,
//! so a transaction upgrades to a write transaction right after `BEGIN`,
//! which serializes all mutating transactions.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{MySql, MySqlConnection, MySqlPool, Sqlite, SqliteConnection, SqlitePool, Transaction};

use super::repositories::{
    ChatTxOps, ForumTxOps, InventoryTxOps, MangaTxOps, MaterialTxOps, ProfileTxOps, PromoTxOps,
    ShopTxOps, WalletTxOps,
};

/// A database transaction able to run every domain mutation.
#[async_trait]
pub trait DbTx:
    WalletTxOps
    + InventoryTxOps
    + ProfileTxOps
    + ShopTxOps
    + PromoTxOps
    + ChatTxOps
    + MaterialTxOps
    + MangaTxOps
    + ForumTxOps
    + Send
{
    /// Commit the transaction. Calling it again is a no-op.
    async fn commit(&mut self) -> Result<()>;
}

/// SQLite transaction
pub struct SqliteTx {
    tx: Option<Transaction<'static, Sqlite>>,
}

impl SqliteTx {
    pub(crate) async fn begin(pool: &SqlitePool) -> Result<Self> {
        let mut tx = pool.begin().await.context("Failed to begin transaction")?;

        // Same effect as BEGIN IMMEDIATE: take the write lock before the first read.
        sqlx::query("UPDATE _migrations SET version = version WHERE 1 = 0")
            .execute(&mut *tx)
            .await
            .context("Failed to acquire write lock")?;

        Ok(Self { tx: Some(tx) })
    }

    pub(crate) fn conn(&mut self) -> Result<&mut SqliteConnection> {
        self.tx
            .as_deref_mut()
            .context("Transaction already committed")
    }
}

#[async_trait]
impl DbTx for SqliteTx {
    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await.context("Failed to commit transaction")?;
        }
        Ok(())
    }
}

/// MySQL transaction
pub struct MysqlTx {
    tx: Option<Transaction<'static, MySql>>,
}

impl MysqlTx {
    pub(crate) async fn begin(pool: &MySqlPool) -> Result<Self> {
        let tx = pool.begin().await.context("Failed to begin transaction")?;
        Ok(Self { tx: Some(tx) })
    }

    pub(crate) fn conn(&mut self) -> Result<&mut MySqlConnection> {
        self.tx
            .as_deref_mut()
            .context("Transaction already committed")
    }
}

#[async_trait]
impl DbTx for MysqlTx {
    async fn commit(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await.context("Failed to commit transaction")?;
        }
        Ok(())
    }
}
