//! Wallet repository
//!
//! Read access to wallets and the ledger goes through [`WalletRepository`];
//! every balance mutation goes through [`WalletTxOps`] on an open
//! transaction so that the balance and its ledger row commit together.

use crate::db::{DbBackend, DynDatabasePool, MysqlTx, SqliteTx};
use crate::models::{Currency, TxType, Wallet, WalletTransaction};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sqlx::{MySqlConnection, MySqlPool, Row, SqliteConnection, SqlitePool};
use std::sync::Arc;

/// Wallet read operations
#[async_trait]
pub trait WalletRepository: Send + Sync {
    /// All wallets of a user, ordered by currency
    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Wallet>>;

    /// The user's wallet in one currency
    async fn get_for_user(&self, user_id: i64, currency: Currency) -> Result<Option<Wallet>>;

    /// Ledger page of a wallet, newest first, with the total row count
    async fn list_transactions(
        &self,
        wallet_id: i64,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<WalletTransaction>, i64)>;
}

/// Wallet mutations inside a transaction
#[async_trait]
pub trait WalletTxOps: Send {
    /// Get the user's wallet in `currency`, creating it with a zero balance
    /// when missing. The returned row is locked.
    async fn wallet_get_or_create(&mut self, user_id: i64, currency: Currency) -> Result<Wallet>;

    /// Lock a wallet by id
    async fn wallet_lock(&mut self, wallet_id: i64) -> Result<Option<Wallet>>;

    /// Overwrite the balance of a locked wallet
    async fn wallet_set_balance(&mut self, wallet_id: i64, balance: i64) -> Result<()>;

    /// Ledger row carrying an idempotency key
    async fn wallet_tx_by_key(&mut self, key: &str) -> Result<Option<WalletTransaction>>;

    /// Ledger row by id
    async fn wallet_tx_get(&mut self, id: &str) -> Result<Option<WalletTransaction>>;

    /// Append a ledger row
    async fn wallet_tx_insert(&mut self, tx: &WalletTransaction) -> Result<()>;

    /// Link a ledger row to its counterpart
    async fn wallet_tx_set_related(&mut self, id: &str, related_tx_id: &str) -> Result<()>;
}

/// SQLx-based wallet repository implementation
pub struct SqlxWalletRepository {
    pool: DynDatabasePool,
}

impl SqlxWalletRepository {
    pub fn new(pool: DynDatabasePool) -> Self {
        Self { pool }
    }

    pub fn boxed(pool: DynDatabasePool) -> Arc<dyn WalletRepository> {
        Arc::new(Self::new(pool))
    }
}

const WALLET_COLUMNS: &str = "id, user_id, currency, balance, created_at, updated_at";
const TX_COLUMNS: &str =
    "id, wallet_id, tx_type, amount, description, related_tx_id, idempotency_key, created_at";

#[async_trait]
impl WalletRepository for SqlxWalletRepository {
    async fn list_for_user(&self, user_id: i64) -> Result<Vec<Wallet>> {
        let sql = format!(
            "SELECT {} FROM wallets WHERE user_id = ? ORDER BY currency",
            WALLET_COLUMNS
        );
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                let rows = sqlx::query(&sql)
                    .bind(user_id)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list wallets")?;
                rows.iter().map(row_to_wallet_sqlite).collect()
            }
            DbBackend::Mysql(pool) => {
                let rows = sqlx::query(&sql)
                    .bind(user_id)
                    .fetch_all(pool)
                    .await
                    .context("Failed to list wallets")?;
                rows.iter().map(row_to_wallet_mysql).collect()
            }
        }
    }

    async fn get_for_user(&self, user_id: i64, currency: Currency) -> Result<Option<Wallet>> {
        let sql = format!(
            "SELECT {} FROM wallets WHERE user_id = ? AND currency = ?",
            WALLET_COLUMNS
        );
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => sqlx::query(&sql)
                .bind(user_id)
                .bind(currency.to_string())
                .fetch_optional(pool)
                .await
                .context("Failed to get wallet")?
                .as_ref()
                .map(row_to_wallet_sqlite)
                .transpose(),
            DbBackend::Mysql(pool) => sqlx::query(&sql)
                .bind(user_id)
                .bind(currency.to_string())
                .fetch_optional(pool)
                .await
                .context("Failed to get wallet")?
                .as_ref()
                .map(row_to_wallet_mysql)
                .transpose(),
        }
    }

    async fn list_transactions(
        &self,
        wallet_id: i64,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<WalletTransaction>, i64)> {
        match self.pool.backend() {
            DbBackend::Sqlite(pool) => {
                list_transactions_sqlite(pool, wallet_id, page, page_size).await
            }
            DbBackend::Mysql(pool) => list_transactions_mysql(pool, wallet_id, page, page_size).await,
        }
    }
}

// ============================================================================
// SQLite implementations
// ============================================================================

async fn list_transactions_sqlite(
    pool: &SqlitePool,
    wallet_id: i64,
    page: i64,
    page_size: i64,
) -> Result<(Vec<WalletTransaction>, i64)> {
    let count: i64 = sqlx::query("SELECT COUNT(*) as count FROM wallet_transactions WHERE wallet_id = ?")
        .bind(wallet_id)
        .fetch_one(pool)
        .await
        .context("Failed to count transactions")?
        .get("count");

    let sql = format!(
        "SELECT {} FROM wallet_transactions WHERE wallet_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        TX_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(wallet_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(pool)
        .await
        .context("Failed to list transactions")?;

    let items = rows
        .iter()
        .map(row_to_tx_sqlite)
        .collect::<Result<Vec<_>>>()?;
    Ok((items, count))
}

async fn lock_wallet_sqlite(conn: &mut SqliteConnection, wallet_id: i64) -> Result<Option<Wallet>> {
    let sql = format!("SELECT {} FROM wallets WHERE id = ?", WALLET_COLUMNS);
    sqlx::query(&sql)
        .bind(wallet_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock wallet")?
        .as_ref()
        .map(row_to_wallet_sqlite)
        .transpose()
}

async fn get_tx_sqlite(
    conn: &mut SqliteConnection,
    column: &str,
    value: &str,
) -> Result<Option<WalletTransaction>> {
    let sql = format!(
        "SELECT {} FROM wallet_transactions WHERE {} = ?",
        TX_COLUMNS, column
    );
    sqlx::query(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to get transaction")?
        .as_ref()
        .map(row_to_tx_sqlite)
        .transpose()
}

#[async_trait]
impl WalletTxOps for SqliteTx {
    async fn wallet_get_or_create(&mut self, user_id: i64, currency: Currency) -> Result<Wallet> {
        let conn = self.conn()?;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO wallets (user_id, currency, balance, created_at, updated_at)
            VALUES (?, ?, 0, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(currency.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("Failed to create wallet")?;

        let sql = format!(
            "SELECT {} FROM wallets WHERE user_id = ? AND currency = ?",
            WALLET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(currency.to_string())
            .fetch_one(&mut *conn)
            .await
            .context("Failed to get wallet")?;
        row_to_wallet_sqlite(&row)
    }

    async fn wallet_lock(&mut self, wallet_id: i64) -> Result<Option<Wallet>> {
        lock_wallet_sqlite(self.conn()?, wallet_id).await
    }

    async fn wallet_set_balance(&mut self, wallet_id: i64, balance: i64) -> Result<()> {
        sqlx::query("UPDATE wallets SET balance = ?, updated_at = ? WHERE id = ?")
            .bind(balance)
            .bind(Utc::now())
            .bind(wallet_id)
            .execute(self.conn()?)
            .await
            .context("Failed to update wallet balance")?;
        Ok(())
    }

    async fn wallet_tx_by_key(&mut self, key: &str) -> Result<Option<WalletTransaction>> {
        get_tx_sqlite(self.conn()?, "idempotency_key", key).await
    }

    async fn wallet_tx_get(&mut self, id: &str) -> Result<Option<WalletTransaction>> {
        get_tx_sqlite(self.conn()?, "id", id).await
    }

    async fn wallet_tx_insert(&mut self, tx: &WalletTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_transactions
                (id, wallet_id, tx_type, amount, description, related_tx_id, idempotency_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tx.id)
        .bind(tx.wallet_id)
        .bind(tx.tx_type.to_string())
        .bind(tx.amount)
        .bind(&tx.description)
        .bind(&tx.related_tx_id)
        .bind(&tx.idempotency_key)
        .bind(tx.created_at)
        .execute(self.conn()?)
        .await
        .context("Failed to insert wallet transaction")?;
        Ok(())
    }

    async fn wallet_tx_set_related(&mut self, id: &str, related_tx_id: &str) -> Result<()> {
        sqlx::query("UPDATE wallet_transactions SET related_tx_id = ? WHERE id = ?")
            .bind(related_tx_id)
            .bind(id)
            .execute(self.conn()?)
            .await
            .context("Failed to link wallet transactions")?;
        Ok(())
    }
}

fn row_to_wallet_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<Wallet> {
    let currency: String = row.get("currency");
    Ok(Wallet {
        id: row.get("id"),
        user_id: row.get("user_id"),
        currency: currency.parse()?,
        balance: row.get("balance"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_tx_sqlite(row: &sqlx::sqlite::SqliteRow) -> Result<WalletTransaction> {
    let tx_type: String = row.get("tx_type");
    Ok(WalletTransaction {
        id: row.get("id"),
        wallet_id: row.get("wallet_id"),
        tx_type: tx_type.parse::<TxType>()?,
        amount: row.get("amount"),
        description: row.get("description"),
        related_tx_id: row.get("related_tx_id"),
        idempotency_key: row.get("idempotency_key"),
        created_at: row.get("created_at"),
    })
}

// ============================================================================
// MySQL implementations
// ============================================================================

async fn list_transactions_mysql(
    pool: &MySqlPool,
    wallet_id: i64,
    page: i64,
    page_size: i64,
) -> Result<(Vec<WalletTransaction>, i64)> {
    let count: i64 = sqlx::query("SELECT COUNT(*) as count FROM wallet_transactions WHERE wallet_id = ?")
        .bind(wallet_id)
        .fetch_one(pool)
        .await
        .context("Failed to count transactions")?
        .get("count");

    let sql = format!(
        "SELECT {} FROM wallet_transactions WHERE wallet_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?",
        TX_COLUMNS
    );
    let rows = sqlx::query(&sql)
        .bind(wallet_id)
        .bind(page_size)
        .bind((page - 1) * page_size)
        .fetch_all(pool)
        .await
        .context("Failed to list transactions")?;

    let items = rows
        .iter()
        .map(row_to_tx_mysql)
        .collect::<Result<Vec<_>>>()?;
    Ok((items, count))
}

async fn lock_wallet_mysql(conn: &mut MySqlConnection, wallet_id: i64) -> Result<Option<Wallet>> {
    let sql = format!("SELECT {} FROM wallets WHERE id = ? FOR UPDATE", WALLET_COLUMNS);
    sqlx::query(&sql)
        .bind(wallet_id)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to lock wallet")?
        .as_ref()
        .map(row_to_wallet_mysql)
        .transpose()
}

async fn get_tx_mysql(
    conn: &mut MySqlConnection,
    column: &str,
    value: &str,
) -> Result<Option<WalletTransaction>> {
    let sql = format!(
        "SELECT {} FROM wallet_transactions WHERE {} = ?",
        TX_COLUMNS, column
    );
    sqlx::query(&sql)
        .bind(value)
        .fetch_optional(&mut *conn)
        .await
        .context("Failed to get transaction")?
        .as_ref()
        .map(row_to_tx_mysql)
        .transpose()
}

#[async_trait]
impl WalletTxOps for MysqlTx {
    async fn wallet_get_or_create(&mut self, user_id: i64, currency: Currency) -> Result<Wallet> {
        let conn = self.conn()?;
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT IGNORE INTO wallets (user_id, currency, balance, created_at, updated_at)
            VALUES (?, ?, 0, ?, ?)
            "#,
        )
        .bind(user_id)
        .bind(currency.to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *conn)
        .await
        .context("Failed to create wallet")?;

        let sql = format!(
            "SELECT {} FROM wallets WHERE user_id = ? AND currency = ? FOR UPDATE",
            WALLET_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(user_id)
            .bind(currency.to_string())
            .fetch_one(&mut *conn)
            .await
            .context("Failed to get wallet")?;
        row_to_wallet_mysql(&row)
    }

    async fn wallet_lock(&mut self, wallet_id: i64) -> Result<Option<Wallet>> {
        lock_wallet_mysql(self.conn()?, wallet_id).await
    }

    async fn wallet_set_balance(&mut self, wallet_id: i64, balance: i64) -> Result<()> {
        sqlx::query("UPDATE wallets SET balance = ?, updated_at = ? WHERE id = ?")
            .bind(balance)
            .bind(Utc::now())
            .bind(wallet_id)
            .execute(self.conn()?)
            .await
            .context("Failed to update wallet balance")?;
        Ok(())
    }

    async fn wallet_tx_by_key(&mut self, key: &str) -> Result<Option<WalletTransaction>> {
        get_tx_mysql(self.conn()?, "idempotency_key", key).await
    }

    async fn wallet_tx_get(&mut self, id: &str) -> Result<Option<WalletTransaction>> {
        get_tx_mysql(self.conn()?, "id", id).await
    }

    async fn wallet_tx_insert(&mut self, tx: &WalletTransaction) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wallet_transactions
                (id, wallet_id, tx_type, amount, description, related_tx_id, idempotency_key, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&tx.id)
        .bind(tx.wallet_id)
        .bind(tx.tx_type.to_string())
        .bind(tx.amount)
        .bind(&tx.description)
        .bind(&tx.related_tx_id)
        .bind(&tx.idempotency_key)
        .bind(tx.created_at)
        .execute(self.conn()?)
        .await
        .context("Failed to insert wallet transaction")?;
        Ok(())
    }

    async fn wallet_tx_set_related(&mut self, id: &str, related_tx_id: &str) -> Result<()> {
        sqlx::query("UPDATE wallet_transactions SET related_tx_id = ? WHERE id = ?")
            .bind(related_tx_id)
            .bind(id)
            .execute(self.conn()?)
            .await
            .context("Failed to link wallet transactions")?;
        Ok(())
    }
}

fn row_to_wallet_mysql(row: &sqlx::mysql::MySqlRow) -> Result<Wallet> {
    let currency: String = row.get("currency");
    Ok(Wallet {
        id: row.get("id"),
        user_id: row.get("user_id"),
        currency: currency.parse()?,
        balance: row.get("balance"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn row_to_tx_mysql(row: &sqlx::mysql::MySqlRow) -> Result<WalletTransaction> {
    let tx_type: String = row.get("tx_type");
    Ok(WalletTransaction {
        id: row.get("id"),
        wallet_id: row.get("wallet_id"),
        tx_type: tx_type.parse::<TxType>()?,
        amount: row.get("amount"),
        description: row.get("description"),
        related_tx_id: row.get("related_tx_id"),
        idempotency_key: row.get("idempotency_key"),
        created_at: row.get("created_at"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_pool};

    #[tokio::test]
    async fn test_get_or_create_is_idempotent() {
        let pool = migrated_pool().await;
        let user_id = insert_user(&pool, "alice").await;

        let mut tx = pool.begin().await.unwrap();
        let first = tx.wallet_get_or_create(user_id, Currency::Aki).await.unwrap();
        let second = tx.wallet_get_or_create(user_id, Currency::Aki).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.balance, 0);

        let repo = SqlxWalletRepository::new(pool.clone());
        let wallets = repo.list_for_user(user_id).await.unwrap();
        assert_eq!(wallets.len(), 1);
        assert_eq!(wallets[0].currency, Currency::Aki);
    }

    #[tokio::test]
    async fn test_uncommitted_changes_roll_back() {
        let pool = migrated_pool().await;
        let user_id = insert_user(&pool, "bob").await;

        {
            let mut tx = pool.begin().await.unwrap();
            tx.wallet_get_or_create(user_id, Currency::Rub).await.unwrap();
        }

        let repo = SqlxWalletRepository::new(pool.clone());
        assert!(repo
            .get_for_user(user_id, Currency::Rub)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_ledger_rows_and_pagination() {
        let pool = migrated_pool().await;
        let user_id = insert_user(&pool, "carol").await;

        let mut tx = pool.begin().await.unwrap();
        let wallet = tx.wallet_get_or_create(user_id, Currency::Aki).await.unwrap();
        for i in 1..=3 {
            let mut row = WalletTransaction::new(
                wallet.id,
                TxType::Deposit,
                i * 10,
                "Deposit",
                Some(format!("key-{}", i)),
            );
            row.created_at = Utc::now() + chrono::Duration::seconds(i);
            tx.wallet_tx_insert(&row).await.unwrap();
        }
        tx.wallet_set_balance(wallet.id, 60).await.unwrap();

        let found = tx.wallet_tx_by_key("key-2").await.unwrap().unwrap();
        assert_eq!(found.amount, 20);
        assert!(tx.wallet_tx_by_key("missing").await.unwrap().is_none());
        tx.commit().await.unwrap();

        let repo = SqlxWalletRepository::new(pool.clone());
        let (page, count) = repo.list_transactions(wallet.id, 1, 2).await.unwrap();
        assert_eq!(count, 3);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].amount, 30);

        let (page, _) = repo.list_transactions(wallet.id, 2, 2).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].amount, 10);

        let reloaded = repo
            .get_for_user(user_id, Currency::Aki)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reloaded.balance, 60);
    }

    #[tokio::test]
    async fn test_related_transactions_link() {
        let pool = migrated_pool().await;
        let user_id = insert_user(&pool, "dave").await;

        let mut tx = pool.begin().await.unwrap();
        let wallet = tx.wallet_get_or_create(user_id, Currency::Aki).await.unwrap();
        let out = WalletTransaction::new(wallet.id, TxType::TransferOut, 5, "Transfer", None);
        let mut inn = WalletTransaction::new(wallet.id, TxType::TransferIn, 5, "Transfer", None);
        inn.related_tx_id = Some(out.id.clone());
        tx.wallet_tx_insert(&out).await.unwrap();
        tx.wallet_tx_insert(&inn).await.unwrap();
        tx.wallet_tx_set_related(&out.id, &inn.id).await.unwrap();

        let reloaded = tx.wallet_tx_get(&out.id).await.unwrap().unwrap();
        assert_eq!(reloaded.related_tx_id.as_deref(), Some(inn.id.as_str()));
        assert!(reloaded.idempotency_key.is_none());
    }

    #[tokio::test]
    async fn test_negative_balance_is_rejected() {
        let pool = migrated_pool().await;
        let user_id = insert_user(&pool, "erin").await;

        let mut tx = pool.begin().await.unwrap();
        let wallet = tx.wallet_get_or_create(user_id, Currency::Aki).await.unwrap();
        assert!(tx.wallet_set_balance(wallet.id, -1).await.is_err());
    }
}
