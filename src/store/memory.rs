use crate::core::errors::ExchangeError;
use crate::core::traits::{PositionValuer, TransactionStore, WalletStore};
use crate::core::types::{Transaction, Wallet};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Keeps the last saved wallet in memory
#[derive(Debug, Default)]
pub struct MemoryWalletStore {
    wallet: RwLock<Option<Wallet>>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_wallet(wallet: Wallet) -> Self {
        Self {
            wallet: RwLock::new(Some(wallet)),
        }
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn load(&self) -> Result<Option<Wallet>, ExchangeError> {
        Ok(self.wallet.read().await.clone())
    }

    async fn save(&self, wallet: &Wallet) -> Result<(), ExchangeError> {
        *self.wallet.write().await = Some(wallet.clone());
        Ok(())
    }
}

/// Append-only transaction log held in memory
#[derive(Debug, Default)]
pub struct MemoryTransactionStore {
    records: RwLock<Vec<Transaction>>,
}

impl MemoryTransactionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    pub async fn all(&self) -> Vec<Transaction> {
        self.records.read().await.clone()
    }
}

#[async_trait]
impl TransactionStore for MemoryTransactionStore {
    async fn append(&self, transaction: Transaction) -> Result<(), ExchangeError> {
        self.records.write().await.push(transaction);
        Ok(())
    }

    async fn find_by_time_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Transaction>, ExchangeError> {
        let mut found: Vec<_> = self
            .records
            .read()
            .await
            .iter()
            .filter(|t| t.timestamp >= start && t.timestamp <= end)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.timestamp);
        Ok(found)
    }
}

/// Fixed position values, replaceable at runtime
#[derive(Debug, Default)]
pub struct StaticPositions {
    values: RwLock<HashMap<String, f64>>,
}

impl StaticPositions {
    pub fn new(values: HashMap<String, f64>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    pub async fn set(&self, symbol: impl Into<String>, value_usd: f64) {
        self.values.write().await.insert(symbol.into(), value_usd);
    }

    pub async fn remove(&self, symbol: &str) {
        self.values.write().await.remove(symbol);
    }
}

#[async_trait]
impl PositionValuer for StaticPositions {
    async fn position_values(&self) -> Result<HashMap<String, f64>, ExchangeError> {
        Ok(self.values.read().await.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn tx(amount: f64, secs: i64) -> Transaction {
        Transaction {
            amount,
            balance_after: 0.0,
            reason: "test".to_string(),
            timestamp: Utc.timestamp_opt(secs, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_time_range_is_inclusive_and_sorted() {
        let store = MemoryTransactionStore::new();
        store.append(tx(3.0, 300)).await.unwrap();
        store.append(tx(1.0, 100)).await.unwrap();
        store.append(tx(2.0, 200)).await.unwrap();
        store.append(tx(4.0, 400)).await.unwrap();

        let found = store
            .find_by_time_range(
                Utc.timestamp_opt(100, 0).unwrap(),
                Utc.timestamp_opt(300, 0).unwrap(),
            )
            .await
            .unwrap();
        let amounts: Vec<f64> = found.iter().map(|t| t.amount).collect();
        assert_eq!(amounts, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_wallet_store_round_trip() {
        let store = MemoryWalletStore::new();
        assert!(store.load().await.unwrap().is_none());
        let wallet = Wallet::empty(Utc.timestamp_opt(1, 0).unwrap());
        store.save(&wallet).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(wallet));
    }
}
