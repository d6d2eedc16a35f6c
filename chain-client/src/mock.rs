//! In-memory mock chain for tests and demos

use crate::{
    error::{Error, Result},
    source::{ChainSource, Deposit, Payment},
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct MockState {
    latest_block: u64,
    deposits: Vec<Deposit>,
    payments: HashMap<String, Vec<Payment>>,
    fail_calls: bool,
}

/// A scripted chain: tests stage deposits and batch payments, the core
/// observes them through the regular [`ChainSource`] interface.
#[derive(Debug, Clone, Default)]
pub struct MockChain {
    state: Arc<RwLock<MockState>>,
}

impl MockChain {
    /// Create an empty mock chain at block 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the latest block number
    pub async fn set_latest_block(&self, block: u64) {
        self.state.write().await.latest_block = block;
    }

    /// Record a deposit observable from its block onwards
    pub async fn push_deposit(&self, deposit: Deposit) {
        self.state.write().await.deposits.push(deposit);
    }

    /// Register the itemized payments of a batch transaction
    pub async fn set_payments(&self, batch_tx: impl Into<String>, payments: Vec<Payment>) {
        self.state.write().await.payments.insert(batch_tx.into(), payments);
    }

    /// Make every subsequent call fail, simulating a collaborator outage
    pub async fn set_failing(&self, failing: bool) {
        self.state.write().await.fail_calls = failing;
    }

    fn check_availability(state: &MockState) -> Result<()> {
        if state.fail_calls {
            return Err(Error::BadResponse("mock chain outage".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn latest_block_number(&self) -> Result<u64> {
        let state = self.state.read().await;
        Self::check_availability(&state)?;
        Ok(state.latest_block)
    }

    async fn deposits(
        &self,
        _address: &str,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<Deposit>> {
        let state = self.state.read().await;
        Self::check_availability(&state)?;
        Ok(state
            .deposits
            .iter()
            .filter(|deposit| {
                deposit.block_number >= start_block && deposit.block_number <= end_block
            })
            .cloned()
            .collect())
    }

    async fn payments(&self, _address: &str, batch_tx: &str) -> Result<Vec<Payment>> {
        let state = self.state.read().await;
        Self::check_availability(&state)?;
        Ok(state.payments.get(batch_tx).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deposits_filtered_by_block_range() {
        let chain = MockChain::new();
        for block_number in [5u64, 10, 15] {
            chain
                .push_deposit(Deposit {
                    source: "aa".repeat(20),
                    amount_wei: 100,
                    block_number,
                    tx: format!("{block_number:0>64}"),
                })
                .await;
        }

        let in_range = chain.deposits("safe", 6, 14).await.unwrap();
        assert_eq!(in_range.len(), 1);
        assert_eq!(in_range[0].block_number, 10);
    }

    #[tokio::test]
    async fn test_unknown_batch_has_no_payments() {
        let chain = MockChain::new();
        assert!(chain.payments("safe", &"0".repeat(64)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outage_fails_calls() {
        let chain = MockChain::new();
        chain.set_failing(true).await;
        assert!(chain.latest_block_number().await.is_err());
        chain.set_failing(false).await;
        assert_eq!(chain.latest_block_number().await.unwrap(), 0);
    }
}
