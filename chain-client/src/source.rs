//! The chain data source trait and its wire types

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// An inbound payment to the watched address, as observed on chain
///
/// Already filtered by the implementation to successful, positive-value
/// transfers targeting the watched address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    /// Paying address, lower-case hex without `0x` prefix
    pub source: String,

    /// Paid amount in wei
    pub amount_wei: u128,

    /// Block the payment was included in
    pub block_number: u64,

    /// External transaction identifier, lower-case hex without `0x` prefix
    pub tx: String,
}

/// One itemized payment inside an outbound batch transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    /// Receiving address, lower-case hex without `0x` prefix
    pub address: String,

    /// Paid amount in wei
    pub amount_wei: u128,
}

/// Upstream blockchain data source consumed by the accounting core
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Number of the latest block known to the chain
    async fn latest_block_number(&self) -> Result<u64>;

    /// All deposits made to `address` within `[start_block, end_block]`
    async fn deposits(&self, address: &str, start_block: u64, end_block: u64)
        -> Result<Vec<Deposit>>;

    /// Itemized payments made by `address` in the batch transaction `batch_tx`
    ///
    /// Returns an empty list when the batch's sender is not `address`,
    /// rejecting spoofed batch identifiers.
    async fn payments(&self, address: &str, batch_tx: &str) -> Result<Vec<Payment>>;
}
