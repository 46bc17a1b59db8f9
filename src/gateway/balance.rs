use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BalanceError {
    #[error("balance oracle error: {0}")]
    Backend(String),
    #[error("unknown group: {0}")]
    UnknownGroup(String),
}

/// Authoritative remaining-spend tracker for groups.
///
/// A positive `post_consume` deducts spend; a negative amount refunds an
/// earlier reservation.
#[async_trait]
pub trait BalanceOracle: Send + Sync {
    async fn remaining_balance(&self, group_id: &str) -> Result<f64, BalanceError>;
    async fn post_consume(&self, group_id: &str, amount: f64) -> Result<(), BalanceError>;

    /// Deducts `amount` only when the balance covers it. Returns the balance
    /// observed before the deduction.
    async fn reserve(&self, group_id: &str, amount: f64) -> Result<f64, BalanceError> {
        let remaining = self.remaining_balance(group_id).await?;
        if remaining >= amount {
            self.post_consume(group_id, amount).await?;
        }
        Ok(remaining)
    }
}

/// In-process ledger. Groups without an explicit balance start at
/// `default_balance`.
#[derive(Debug)]
pub struct FixedBalance {
    default_balance: f64,
    balances: Mutex<HashMap<String, f64>>,
}

impl Default for FixedBalance {
    fn default() -> Self {
        Self::new(f64::INFINITY)
    }
}

impl FixedBalance {
    pub fn new(default_balance: f64) -> Self {
        Self {
            default_balance,
            balances: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_balance(self, group_id: impl Into<String>, balance: f64) -> Self {
        self.set_balance(group_id, balance);
        self
    }

    pub fn set_balance(&self, group_id: impl Into<String>, balance: f64) {
        self.balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id.into(), balance);
    }

    pub fn balance(&self, group_id: &str) -> f64 {
        self.balances
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_id)
            .copied()
            .unwrap_or(self.default_balance)
    }
}

#[async_trait]
impl BalanceOracle for FixedBalance {
    async fn remaining_balance(&self, group_id: &str) -> Result<f64, BalanceError> {
        Ok(self.balance(group_id))
    }

    async fn post_consume(&self, group_id: &str, amount: f64) -> Result<(), BalanceError> {
        let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        let balance = balances
            .entry(group_id.to_string())
            .or_insert(self.default_balance);
        *balance -= amount;
        Ok(())
    }

    async fn reserve(&self, group_id: &str, amount: f64) -> Result<f64, BalanceError> {
        let mut balances = self.balances.lock().unwrap_or_else(PoisonError::into_inner);
        let balance = balances
            .entry(group_id.to_string())
            .or_insert(self.default_balance);
        let remaining = *balance;
        if remaining >= amount {
            *balance -= amount;
        }
        Ok(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn consume_and_refund_move_the_balance() {
        let oracle = FixedBalance::new(10.0).with_balance("g1", 100.0);
        oracle.post_consume("g1", 30.0).await.expect("consume");
        oracle.post_consume("g1", -5.0).await.expect("refund");
        assert_eq!(oracle.remaining_balance("g1").await.expect("balance"), 75.0);

        oracle.post_consume("g2", 4.0).await.expect("consume");
        assert_eq!(oracle.remaining_balance("g2").await.expect("balance"), 6.0);
    }

    #[tokio::test]
    async fn reserve_only_deducts_when_covered() {
        let oracle = FixedBalance::new(0.0).with_balance("g1", 5.0);
        assert_eq!(oracle.reserve("g1", 3.0).await.expect("reserve"), 5.0);
        assert_eq!(oracle.reserve("g1", 3.0).await.expect("reserve"), 2.0);
        assert_eq!(oracle.balance("g1"), 2.0);
    }

    #[tokio::test]
    async fn default_oracle_is_unbounded() {
        let oracle = FixedBalance::default();
        oracle.post_consume("g", 1e9).await.expect("consume");
        assert!(oracle.remaining_balance("g").await.expect("balance").is_infinite());
    }
}
