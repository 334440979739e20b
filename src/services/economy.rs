//! Economy service
//!
//! Wallets hold integer minor units and every balance change is mirrored by
//! an immutable ledger row. The `*_in` functions run inside a caller-owned
//! transaction so that shop purchases and promo payouts post to the ledger
//! atomically with their own writes; [`EconomyService`] wraps each of them
//! in a transaction of its own.
//!
//! Idempotency: a ledger row may carry a unique key. Replaying an operation
//! with the same key and parameters returns the original row; reusing the
//! key for anything else is rejected.

use crate::db::repositories::{WalletRepository, WalletTxOps};
use crate::db::{DbTx, DynDatabasePool};
use crate::models::{clamp_page, Currency, PagedResult, TxType, Wallet, WalletTransaction};
use anyhow::Context;
use std::sync::Arc;

/// Largest amount accepted by the demo endpoints
pub const DEMO_MAX_AMOUNT: i64 = 1_000_000_000;

/// Error types for economy operations
#[derive(Debug, thiserror::Error)]
pub enum EconomyError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Wallet not found")]
    WalletNotFound,

    #[error("Insufficient funds")]
    InsufficientFunds,

    #[error("Wallet currencies do not match")]
    CurrencyMismatch,

    #[error("Idempotency key already used for another operation")]
    IdempotencyConflict,

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Both legs of a transfer
#[derive(Debug, Clone, serde::Serialize)]
pub struct TransferResult {
    pub out_tx: WalletTransaction,
    pub in_tx: WalletTransaction,
}

/// Amounts are positive integers in minor units
pub fn normalize_amount(amount: i64) -> Result<i64, EconomyError> {
    if amount <= 0 {
        return Err(EconomyError::Validation(
            "Amount must be a positive integer".to_string(),
        ));
    }
    Ok(amount)
}

fn non_empty(key: Option<&str>) -> Option<&str> {
    key.filter(|k| !k.is_empty())
}

/// Replay check for a keyed single-leg operation
async fn replay(
    tx: &mut dyn DbTx,
    key: Option<&str>,
    wallet_id: i64,
    tx_type: TxType,
    amount: i64,
) -> Result<Option<WalletTransaction>, EconomyError> {
    let Some(key) = non_empty(key) else {
        return Ok(None);
    };
    match tx.wallet_tx_by_key(key).await? {
        Some(existing) if existing.matches(wallet_id, tx_type, amount) => Ok(Some(existing)),
        Some(_) => Err(EconomyError::IdempotencyConflict),
        None => Ok(None),
    }
}

/// Create the RUB and AKI wallets of a user if missing
pub async fn ensure_wallets_in(
    tx: &mut dyn DbTx,
    user_id: i64,
) -> Result<Vec<Wallet>, EconomyError> {
    let mut wallets = Vec::with_capacity(Currency::ALL.len());
    for currency in Currency::ALL {
        wallets.push(tx.wallet_get_or_create(user_id, currency).await?);
    }
    Ok(wallets)
}

/// Credit a wallet inside an open transaction
pub async fn deposit_in(
    tx: &mut dyn DbTx,
    wallet_id: i64,
    amount: i64,
    description: &str,
    idempotency_key: Option<&str>,
) -> Result<WalletTransaction, EconomyError> {
    let amount = normalize_amount(amount)?;
    let wallet = tx
        .wallet_lock(wallet_id)
        .await?
        .ok_or(EconomyError::WalletNotFound)?;

    if let Some(existing) = replay(tx, idempotency_key, wallet_id, TxType::Deposit, amount).await? {
        return Ok(existing);
    }

    let balance = wallet
        .balance
        .checked_add(amount)
        .ok_or_else(|| EconomyError::Validation("Balance overflow".to_string()))?;
    tx.wallet_set_balance(wallet_id, balance).await?;

    let row = WalletTransaction::new(
        wallet_id,
        TxType::Deposit,
        amount,
        description,
        idempotency_key.map(str::to_string),
    );
    tx.wallet_tx_insert(&row).await?;

    tracing::info!(wallet_id, amount, balance, tx_id = %row.id, "Deposit posted");
    Ok(row)
}

/// Debit a wallet inside an open transaction
pub async fn withdraw_in(
    tx: &mut dyn DbTx,
    wallet_id: i64,
    amount: i64,
    description: &str,
    idempotency_key: Option<&str>,
) -> Result<WalletTransaction, EconomyError> {
    let amount = normalize_amount(amount)?;
    let wallet = tx
        .wallet_lock(wallet_id)
        .await?
        .ok_or(EconomyError::WalletNotFound)?;

    if let Some(existing) = replay(tx, idempotency_key, wallet_id, TxType::Withdraw, amount).await?
    {
        return Ok(existing);
    }

    if wallet.balance < amount {
        return Err(EconomyError::InsufficientFunds);
    }
    let balance = wallet.balance - amount;
    tx.wallet_set_balance(wallet_id, balance).await?;

    let row = WalletTransaction::new(
        wallet_id,
        TxType::Withdraw,
        amount,
        description,
        idempotency_key.map(str::to_string),
    );
    tx.wallet_tx_insert(&row).await?;

    tracing::info!(wallet_id, amount, balance, tx_id = %row.id, "Withdrawal posted");
    Ok(row)
}

/// Move funds between two wallets of the same currency inside an open transaction
pub async fn transfer_in(
    tx: &mut dyn DbTx,
    from_wallet_id: i64,
    to_wallet_id: i64,
    amount: i64,
    description: Option<&str>,
    idempotency_key_out: Option<&str>,
    idempotency_key_in: Option<&str>,
) -> Result<TransferResult, EconomyError> {
    let amount = normalize_amount(amount)?;
    if from_wallet_id == to_wallet_id {
        return Err(EconomyError::Validation(
            "Cannot transfer to the same wallet".to_string(),
        ));
    }

    if let Some(key) = non_empty(idempotency_key_out) {
        if let Some(out_tx) = tx.wallet_tx_by_key(key).await? {
            if !out_tx.matches(from_wallet_id, TxType::TransferOut, amount) {
                return Err(EconomyError::IdempotencyConflict);
            }
            let related = out_tx
                .related_tx_id
                .clone()
                .context("Transfer has no incoming leg")?;
            let in_tx = tx
                .wallet_tx_get(&related)
                .await?
                .context("Incoming leg of transfer is missing")?;
            return Ok(TransferResult { out_tx, in_tx });
        }
    }

    // Fixed lock order keeps concurrent opposite transfers from deadlocking
    let (first, second) = if from_wallet_id < to_wallet_id {
        (from_wallet_id, to_wallet_id)
    } else {
        (to_wallet_id, from_wallet_id)
    };
    let first = tx
        .wallet_lock(first)
        .await?
        .ok_or(EconomyError::WalletNotFound)?;
    let second = tx
        .wallet_lock(second)
        .await?
        .ok_or(EconomyError::WalletNotFound)?;
    let (from, to) = if first.id == from_wallet_id {
        (first, second)
    } else {
        (second, first)
    };

    if from.currency != to.currency {
        return Err(EconomyError::CurrencyMismatch);
    }
    if from.balance < amount {
        return Err(EconomyError::InsufficientFunds);
    }
    let to_balance = to
        .balance
        .checked_add(amount)
        .ok_or_else(|| EconomyError::Validation("Balance overflow".to_string()))?;

    tx.wallet_set_balance(from.id, from.balance - amount).await?;
    tx.wallet_set_balance(to.id, to_balance).await?;

    let out_description = description
        .map(str::to_string)
        .unwrap_or_else(|| format!("Transfer to wallet {}", to.id));
    let in_description = description
        .map(str::to_string)
        .unwrap_or_else(|| format!("Transfer from wallet {}", from.id));

    let mut out_tx = WalletTransaction::new(
        from.id,
        TxType::TransferOut,
        amount,
        out_description,
        idempotency_key_out.map(str::to_string),
    );
    tx.wallet_tx_insert(&out_tx).await?;

    let mut in_tx = WalletTransaction::new(
        to.id,
        TxType::TransferIn,
        amount,
        in_description,
        idempotency_key_in.map(str::to_string),
    );
    in_tx.related_tx_id = Some(out_tx.id.clone());
    tx.wallet_tx_insert(&in_tx).await?;

    tx.wallet_tx_set_related(&out_tx.id, &in_tx.id).await?;
    out_tx.related_tx_id = Some(in_tx.id.clone());

    tracing::info!(
        from_wallet = from.id,
        to_wallet = to.id,
        amount,
        out_tx = %out_tx.id,
        "Transfer posted"
    );
    Ok(TransferResult { out_tx, in_tx })
}

/// Economy service for wallets and the ledger
pub struct EconomyService {
    pool: DynDatabasePool,
    wallet_repo: Arc<dyn WalletRepository>,
}

impl EconomyService {
    pub fn new(pool: DynDatabasePool, wallet_repo: Arc<dyn WalletRepository>) -> Self {
        Self { pool, wallet_repo }
    }

    /// Create the user's RUB and AKI wallets if missing (idempotent)
    pub async fn ensure_user_wallets(&self, user_id: i64) -> Result<Vec<Wallet>, EconomyError> {
        let mut tx = self.pool.begin().await?;
        let wallets = ensure_wallets_in(tx.as_mut(), user_id).await?;
        tx.commit().await?;
        Ok(wallets)
    }

    /// The user's wallets, created on first access
    pub async fn wallets_for_user(&self, user_id: i64) -> Result<Vec<Wallet>, EconomyError> {
        let wallets = self.wallet_repo.list_for_user(user_id).await?;
        if wallets.len() == Currency::ALL.len() {
            return Ok(wallets);
        }
        self.ensure_user_wallets(user_id).await?;
        Ok(self.wallet_repo.list_for_user(user_id).await?)
    }

    /// Ledger page of the user's wallet in `currency`, newest first
    pub async fn transactions_for_user(
        &self,
        user_id: i64,
        currency: Currency,
        page: Option<i64>,
        page_size: Option<i64>,
    ) -> Result<PagedResult<WalletTransaction>, EconomyError> {
        let (page, page_size) = clamp_page(page, page_size, 20);
        let Some(wallet) = self.wallet_repo.get_for_user(user_id, currency).await? else {
            return Ok(PagedResult::new(Vec::new(), page, page_size, 0));
        };
        let (rows, count) = self
            .wallet_repo
            .list_transactions(wallet.id, page, page_size)
            .await?;
        Ok(PagedResult::new(rows, page, page_size, count))
    }

    /// Credit a wallet.
    ///
    /// # Errors
    ///
    /// - `Validation` if `amount <= 0`
    /// - `WalletNotFound` if the wallet does not exist
    /// - `IdempotencyConflict` if the key belongs to a different operation
    pub async fn deposit(
        &self,
        wallet_id: i64,
        amount: i64,
        description: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<WalletTransaction, EconomyError> {
        let mut tx = self.pool.begin().await?;
        let row = deposit_in(
            tx.as_mut(),
            wallet_id,
            amount,
            description.unwrap_or("Deposit"),
            idempotency_key,
        )
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Debit a wallet.
    ///
    /// # Errors
    ///
    /// As [`deposit`](Self::deposit), plus `InsufficientFunds`
    pub async fn withdraw(
        &self,
        wallet_id: i64,
        amount: i64,
        description: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<WalletTransaction, EconomyError> {
        let mut tx = self.pool.begin().await?;
        let row = withdraw_in(
            tx.as_mut(),
            wallet_id,
            amount,
            description.unwrap_or("Withdrawal"),
            idempotency_key,
        )
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    /// Move funds between wallets of the same currency.
    ///
    /// # Errors
    ///
    /// - `Validation` for a non-positive amount or identical wallets
    /// - `CurrencyMismatch`, `InsufficientFunds`, `WalletNotFound`
    /// - `IdempotencyConflict` if `idempotency_key_out` belongs to a different operation
    pub async fn transfer(
        &self,
        from_wallet_id: i64,
        to_wallet_id: i64,
        amount: i64,
        description: Option<&str>,
        idempotency_key_out: Option<&str>,
        idempotency_key_in: Option<&str>,
    ) -> Result<TransferResult, EconomyError> {
        let mut tx = self.pool.begin().await?;
        let result = transfer_in(
            tx.as_mut(),
            from_wallet_id,
            to_wallet_id,
            amount,
            description,
            idempotency_key_out,
            idempotency_key_in,
        )
        .await?;
        tx.commit().await?;
        Ok(result)
    }

    /// Credit the user's wallet in `currency`, creating it if needed
    pub async fn deposit_to_user(
        &self,
        user_id: i64,
        currency: Currency,
        amount: i64,
        description: &str,
    ) -> Result<(Wallet, WalletTransaction), EconomyError> {
        let mut tx = self.pool.begin().await?;
        let wallet = tx.wallet_get_or_create(user_id, currency).await?;
        let row = deposit_in(tx.as_mut(), wallet.id, amount, description, None).await?;
        let wallet = tx
            .wallet_lock(wallet.id)
            .await?
            .ok_or(EconomyError::WalletNotFound)?;
        tx.commit().await?;
        Ok((wallet, row))
    }

    /// Transfer between two users' wallets in `currency`
    pub async fn transfer_between_users(
        &self,
        from_user_id: i64,
        to_user_id: i64,
        currency: Currency,
        amount: i64,
    ) -> Result<TransferResult, EconomyError> {
        if from_user_id == to_user_id {
            return Err(EconomyError::Validation(
                "Cannot transfer to yourself".to_string(),
            ));
        }
        let mut tx = self.pool.begin().await?;
        let from = tx.wallet_get_or_create(from_user_id, currency).await?;
        let to = tx.wallet_get_or_create(to_user_id, currency).await?;
        let result = transfer_in(
            tx.as_mut(),
            from.id,
            to.id,
            amount,
            Some(&format!("Transfer {} {}", amount, currency)),
            None,
            None,
        )
        .await?;
        tx.commit().await?;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::repositories::test_support::{insert_user, migrated_file_pool, migrated_pool};
    use crate::db::repositories::SqlxWalletRepository;

    async fn setup() -> (DynDatabasePool, EconomyService, i64) {
        let pool = migrated_pool().await;
        let user_id = insert_user(&pool, "alice").await;
        let service = EconomyService::new(pool.clone(), SqlxWalletRepository::boxed(pool.clone()));
        (pool, service, user_id)
    }

    fn wallet(wallets: &[Wallet], currency: Currency) -> Wallet {
        wallets
            .iter()
            .find(|w| w.currency == currency)
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ensure_wallets_idempotent() {
        let (_pool, service, user_id) = setup().await;
        let first = service.ensure_user_wallets(user_id).await.unwrap();
        let second = service.ensure_user_wallets(user_id).await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(
            wallet(&first, Currency::Aki).id,
            wallet(&second, Currency::Aki).id
        );
    }

    #[tokio::test]
    async fn test_deposit_and_withdraw() {
        let (_pool, service, user_id) = setup().await;
        let wallets = service.ensure_user_wallets(user_id).await.unwrap();
        let aki = wallet(&wallets, Currency::Aki);

        let dep = service.deposit(aki.id, 100, None, None).await.unwrap();
        assert_eq!(dep.description, "Deposit");
        let wd = service.withdraw(aki.id, 40, None, None).await.unwrap();
        assert_eq!(wd.tx_type, TxType::Withdraw);

        let wallets = service.wallets_for_user(user_id).await.unwrap();
        assert_eq!(wallet(&wallets, Currency::Aki).balance, 60);

        let err = service.withdraw(aki.id, 61, None, None).await.unwrap_err();
        assert!(matches!(err, EconomyError::InsufficientFunds));
        let wallets = service.wallets_for_user(user_id).await.unwrap();
        assert_eq!(wallet(&wallets, Currency::Aki).balance, 60);
    }

    #[tokio::test]
    async fn test_amount_must_be_positive() {
        let (_pool, service, user_id) = setup().await;
        let wallets = service.ensure_user_wallets(user_id).await.unwrap();
        let aki = wallet(&wallets, Currency::Aki);

        for amount in [0, -5] {
            let err = service.deposit(aki.id, amount, None, None).await.unwrap_err();
            assert!(matches!(err, EconomyError::Validation(_)));
        }
        assert!(matches!(
            service.deposit(9999, 1, None, None).await.unwrap_err(),
            EconomyError::WalletNotFound
        ));
    }

    #[tokio::test]
    async fn test_idempotent_deposit_replay_and_conflict() {
        let (_pool, service, user_id) = setup().await;
        let wallets = service.ensure_user_wallets(user_id).await.unwrap();
        let aki = wallet(&wallets, Currency::Aki);

        let first = service.deposit(aki.id, 50, None, Some("k1")).await.unwrap();
        let replayed = service.deposit(aki.id, 50, None, Some("k1")).await.unwrap();
        assert_eq!(first.id, replayed.id);

        let wallets = service.wallets_for_user(user_id).await.unwrap();
        assert_eq!(wallet(&wallets, Currency::Aki).balance, 50);

        let err = service.deposit(aki.id, 51, None, Some("k1")).await.unwrap_err();
        assert!(matches!(err, EconomyError::IdempotencyConflict));
        let err = service.withdraw(aki.id, 50, None, Some("k1")).await.unwrap_err();
        assert!(matches!(err, EconomyError::IdempotencyConflict));
    }

    #[tokio::test]
    async fn test_transfer_links_both_legs() {
        let (pool, service, alice) = setup().await;
        let bob = insert_user(&pool, "bob").await;
        let alice_aki = wallet(&service.ensure_user_wallets(alice).await.unwrap(), Currency::Aki);
        let bob_wallets = service.ensure_user_wallets(bob).await.unwrap();
        let bob_aki = wallet(&bob_wallets, Currency::Aki);
        service.deposit(alice_aki.id, 100, None, None).await.unwrap();

        let result = service
            .transfer(alice_aki.id, bob_aki.id, 30, None, Some("t-out"), Some("t-in"))
            .await
            .unwrap();
        assert_eq!(result.out_tx.related_tx_id.as_deref(), Some(result.in_tx.id.as_str()));
        assert_eq!(result.in_tx.related_tx_id.as_deref(), Some(result.out_tx.id.as_str()));

        let replay = service
            .transfer(alice_aki.id, bob_aki.id, 30, None, Some("t-out"), Some("t-in"))
            .await
            .unwrap();
        assert_eq!(replay.out_tx.id, result.out_tx.id);
        assert_eq!(replay.in_tx.id, result.in_tx.id);

        let alice_balance = wallet(&service.wallets_for_user(alice).await.unwrap(), Currency::Aki).balance;
        let bob_balance = wallet(&service.wallets_for_user(bob).await.unwrap(), Currency::Aki).balance;
        assert_eq!((alice_balance, bob_balance), (70, 30));
    }

    #[tokio::test]
    async fn test_transfer_rejections() {
        let (pool, service, alice) = setup().await;
        let bob = insert_user(&pool, "bob").await;
        let alice_wallets = service.ensure_user_wallets(alice).await.unwrap();
        let bob_wallets = service.ensure_user_wallets(bob).await.unwrap();
        let alice_aki = wallet(&alice_wallets, Currency::Aki);
        let bob_rub = wallet(&bob_wallets, Currency::Rub);
        let bob_aki = wallet(&bob_wallets, Currency::Aki);

        assert!(matches!(
            service.transfer(alice_aki.id, alice_aki.id, 1, None, None, None).await,
            Err(EconomyError::Validation(_))
        ));
        assert!(matches!(
            service.transfer(alice_aki.id, bob_rub.id, 1, None, None, None).await,
            Err(EconomyError::CurrencyMismatch)
        ));
        assert!(matches!(
            service.transfer(alice_aki.id, bob_aki.id, 1, None, None, None).await,
            Err(EconomyError::InsufficientFunds)
        ));
    }

    #[tokio::test]
    async fn test_transactions_for_user_paginates() {
        let (_pool, service, user_id) = setup().await;
        let aki = wallet(&service.ensure_user_wallets(user_id).await.unwrap(), Currency::Aki);
        for _ in 0..3 {
            service.deposit(aki.id, 10, None, None).await.unwrap();
        }

        let page = service
            .transactions_for_user(user_id, Currency::Aki, Some(1), Some(2))
            .await
            .unwrap();
        assert_eq!(page.count, 3);
        assert_eq!(page.results.len(), 2);

        let empty = service
            .transactions_for_user(user_id, Currency::Rub, None, None)
            .await
            .unwrap();
        assert_eq!(empty.count, 0);
    }

    #[tokio::test]
    async fn test_demo_helpers() {
        let (pool, service, alice) = setup().await;
        let bob = insert_user(&pool, "bob").await;

        let (wallet_after, _) = service
            .deposit_to_user(alice, Currency::Aki, 25, "Demo deposit")
            .await
            .unwrap();
        assert_eq!(wallet_after.balance, 25);

        service
            .transfer_between_users(alice, bob, Currency::Aki, 5)
            .await
            .unwrap();
        assert!(matches!(
            service.transfer_between_users(alice, alice, Currency::Aki, 5).await,
            Err(EconomyError::Validation(_))
        ));
    }

    mod property_tests {
        use super::super::normalize_amount;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn positive_amounts_pass_through(amount in 1i64..i64::MAX) {
                prop_assert_eq!(normalize_amount(amount).unwrap(), amount);
            }

            #[test]
            fn non_positive_amounts_rejected(amount in i64::MIN..=0i64) {
                prop_assert!(normalize_amount(amount).is_err());
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_withdraws_never_overdraw() {
        let (_dir, pool) = migrated_file_pool().await;
        let user_id = insert_user(&pool, "alice").await;
        let service = Arc::new(EconomyService::new(
            pool.clone(),
            SqlxWalletRepository::boxed(pool.clone()),
        ));
        let aki = wallet(&service.ensure_user_wallets(user_id).await.unwrap(), Currency::Aki);
        service.deposit(aki.id, 100, None, None).await.unwrap();

        let wallet_id = aki.id;
        let attempts = (0..20).map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.withdraw(wallet_id, 10, None, None).await })
        });
        let mut succeeded = 0;
        let mut insufficient = 0;
        for result in futures::future::join_all(attempts).await {
            match result.unwrap() {
                Ok(_) => succeeded += 1,
                Err(EconomyError::InsufficientFunds) => insufficient += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(succeeded, 10);
        assert_eq!(insufficient, 10);

        let wallets = service.wallets_for_user(user_id).await.unwrap();
        assert_eq!(wallet(&wallets, Currency::Aki).balance, 0);
        let ledger = service
            .transactions_for_user(user_id, Currency::Aki, None, Some(100))
            .await
            .unwrap();
        assert_eq!(ledger.count, 11);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_replays_post_once() {
        let (_dir, pool) = migrated_file_pool().await;
        let user_id = insert_user(&pool, "alice").await;
        let service = Arc::new(EconomyService::new(
            pool.clone(),
            SqlxWalletRepository::boxed(pool.clone()),
        ));
        let aki = wallet(&service.ensure_user_wallets(user_id).await.unwrap(), Currency::Aki);

        let wallet_id = aki.id;
        let attempts = (0..10).map(|_| {
            let service = service.clone();
            tokio::spawn(async move { service.deposit(wallet_id, 25, None, Some("topup-1")).await })
        });
        let ids: Vec<String> = futures::future::join_all(attempts)
            .await
            .into_iter()
            .map(|result| result.unwrap().unwrap().id)
            .collect();
        assert!(ids.iter().all(|id| id == &ids[0]));

        let wallets = service.wallets_for_user(user_id).await.unwrap();
        assert_eq!(wallet(&wallets, Currency::Aki).balance, 25);
    }
}
