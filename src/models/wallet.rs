//! Wallet and ledger models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Supported currencies.
///
/// Balances are stored in minor units: kopecks for RUB, whole coins for AKI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Rub,
    Aki,
}

impl Currency {
    pub const ALL: [Currency; 2] = [Currency::Rub, Currency::Aki];

    /// Minor units per major unit
    pub fn scale(&self) -> i64 {
        match self {
            Currency::Rub => 100,
            Currency::Aki => 1,
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Currency::Rub => write!(f, "RUB"),
            Currency::Aki => write!(f, "AKI"),
        }
    }
}

impl FromStr for Currency {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "RUB" => Ok(Currency::Rub),
            "AKI" => Ok(Currency::Aki),
            _ => Err(anyhow::anyhow!("Invalid currency: {}", s)),
        }
    }
}

/// A user's balance in one currency
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub id: i64,
    pub user_id: i64,
    pub currency: Currency,
    /// Balance in minor units, never negative
    pub balance: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger entry kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Deposit,
    Withdraw,
    TransferOut,
    TransferIn,
    Adjust,
}

impl fmt::Display for TxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TxType::Deposit => "deposit",
            TxType::Withdraw => "withdraw",
            TxType::TransferOut => "transfer_out",
            TxType::TransferIn => "transfer_in",
            TxType::Adjust => "adjust",
        };
        f.write_str(s)
    }
}

impl FromStr for TxType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "deposit" => Ok(TxType::Deposit),
            "withdraw" => Ok(TxType::Withdraw),
            "transfer_out" => Ok(TxType::TransferOut),
            "transfer_in" => Ok(TxType::TransferIn),
            "adjust" => Ok(TxType::Adjust),
            _ => Err(anyhow::anyhow!("Invalid transaction type: {}", s)),
        }
    }
}

/// Immutable ledger row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    /// UUID v4
    pub id: String,
    pub wallet_id: i64,
    pub tx_type: TxType,
    /// Always positive; the direction comes from `tx_type`
    pub amount: i64,
    pub description: String,
    pub related_tx_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl WalletTransaction {
    /// Build a new ledger row with a fresh id.
    ///
    /// An empty idempotency key is stored as `None`.
    pub fn new(
        wallet_id: i64,
        tx_type: TxType,
        amount: i64,
        description: impl Into<String>,
        idempotency_key: Option<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            wallet_id,
            tx_type,
            amount,
            description: description.into(),
            related_tx_id: None,
            idempotency_key: idempotency_key.filter(|k| !k.is_empty()),
            created_at: Utc::now(),
        }
    }

    /// Whether a replay with these parameters refers to the same operation
    pub fn matches(&self, wallet_id: i64, tx_type: TxType, amount: i64) -> bool {
        self.wallet_id == wallet_id && self.tx_type == tx_type && self.amount == amount
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_currency_parse_and_scale() {
        assert_eq!(Currency::from_str("rub").unwrap(), Currency::Rub);
        assert_eq!(Currency::from_str(" AKI ").unwrap(), Currency::Aki);
        assert!(Currency::from_str("USD").is_err());
        assert_eq!(Currency::Rub.scale(), 100);
        assert_eq!(Currency::Aki.scale(), 1);
    }

    #[test]
    fn test_currency_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&Currency::Aki).unwrap(), "\"AKI\"");
    }

    #[test]
    fn test_tx_type_strings() {
        for tx_type in [
            TxType::Deposit,
            TxType::Withdraw,
            TxType::TransferOut,
            TxType::TransferIn,
            TxType::Adjust,
        ] {
            assert_eq!(TxType::from_str(&tx_type.to_string()).unwrap(), tx_type);
        }
    }

    #[test]
    fn test_empty_idempotency_key_is_none() {
        let tx = WalletTransaction::new(1, TxType::Deposit, 10, "Deposit", Some(String::new()));
        assert!(tx.idempotency_key.is_none());
        assert!(tx.matches(1, TxType::Deposit, 10));
        assert!(!tx.matches(1, TxType::Withdraw, 10));
    }
}
