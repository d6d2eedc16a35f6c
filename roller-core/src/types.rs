//! Core types for the roller ledger
//!
//! Roller amounts are plain integers (`u128`); derived balances are signed
//! (`i128`) because the Safe and the bots run negative, representing the
//! backing reserves. All entities are immutable once written.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::error;

use crate::error::{Error, Result};

/// Canonical on-chain address: 40 lower-case hex characters, no prefix
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Parse and canonicalize an address
    pub fn new(address: impl AsRef<str>) -> Result<Self> {
        let canonical = canonical_hex(address.as_ref(), 40)
            .ok_or_else(|| Error::Argument(format!("bad address {}", address.as_ref())))?;
        Ok(Self(canonical))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw key bytes for storage lookups
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

/// External transaction or batch identifier: 64 lower-case hex characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    /// Parse and canonicalize a transaction hash
    pub fn new(hash: impl AsRef<str>) -> Result<Self> {
        let canonical = canonical_hex(hash.as_ref(), 64)
            .ok_or_else(|| Error::Argument(format!("bad transaction hash {}", hash.as_ref())))?;
        Ok(Self(canonical))
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw key bytes for storage lookups
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TxHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

fn canonical_hex(raw: &str, length: usize) -> Option<String> {
    let stripped = raw.strip_prefix("0x").unwrap_or(raw);
    if stripped.len() != length || !stripped.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(stripped.to_lowercase())
}

/// One signed ledger entry, immutable once written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Monotonic identifier, assigned on insert
    pub id: u64,

    /// Insertion time
    pub timestamp: DateTime<Utc>,

    /// Debited address
    pub source: Address,

    /// Credited address
    pub target: Address,

    /// Moved amount in rollers
    pub amount: u128,
}

/// Association of one ledger entry with one observed on-chain event
///
/// A given transfer is settled at most once; a given remote transaction
/// may settle many transfers (batched payouts).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettlementLink {
    /// Remote batch/transaction identifier
    pub remote_tx: TxHash,

    /// Settled ledger entry
    pub local_transfer_id: u64,
}

/// One completed, idempotent deposit-scan window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DepositScanRecord {
    /// First block of the window
    pub start_block: u64,

    /// Last block of the window; the persisted watermark
    pub end_block: u64,

    /// Commit time
    pub timestamp: DateTime<Utc>,

    /// Raw fetched deposit events, JSON, kept for audit
    pub raw_events: String,
}

/// One bot lease event; current state per bot is its most recent record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotLeaseRecord {
    /// Monotonic identifier, assigned on insert
    pub idx: u64,

    /// Insertion time
    pub timestamp: DateTime<Utc>,

    /// Leased bot
    pub bot: Address,

    /// Leasing player
    pub player: Address,

    /// Whether this record opens (`true`) or releases (`false`) a lease
    pub busy: bool,
}

/// Derived lease state of one bot
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseState {
    /// Nobody holds the bot
    Free,
    /// Exclusively held
    Leased {
        /// Holding player
        player: Address,
        /// Acquisition time
        since: DateTime<Utc>,
    },
}

/// A pending debit against the Safe awaiting an outbound payment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsettledWithdrawal {
    /// The withdrawing ledger entry
    pub transfer_id: u64,

    /// Withdrawing address
    pub address: Address,

    /// Amount in rollers
    pub amount: u128,
}

/// Result of one settlement call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleOutcome {
    /// Debits settled by this call
    pub settled_count: usize,

    /// Debits still pending afterwards
    pub remaining_unsettled: usize,
}

/// Result of one committed deposit scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanOutcome {
    /// First block of the scanned window
    pub start_block: u64,

    /// Last block of the scanned window
    pub end_block: u64,

    /// Deposits credited in this window
    pub deposits_credited: usize,
}

/// A leased bot handed to a player
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotGrant {
    /// Bot address
    pub address: Address,

    /// Bot balance at lease time
    pub balance: i128,
}

/// Currency peg parameters exposed to the surrounding service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Prices {
    /// The custodial aggregation address
    pub safe: Address,

    /// Wei paid for one roller on deposit
    pub wei_deposit_per_roller: u64,

    /// Wei paid out for one roller on withdrawal
    pub wei_withdraw_per_roller: u64,
}

/// Convert a roller amount to its ether sell price
///
/// Exact: the result carries the full 18 decimal places of wei. An
/// amount too large to represent in wei is flagged and capped, in the
/// same register as inexact peg conversions.
pub fn roller_to_eth(amount: u128, wei_per_roller: u64) -> Decimal {
    amount
        .checked_mul(u128::from(wei_per_roller))
        .and_then(|wei| i128::try_from(wei).ok())
        .and_then(|wei| Decimal::try_from_i128_with_scale(wei, 18).ok())
        .map(|ether| ether.normalize())
        .unwrap_or_else(|| {
            error!(amount, wei_per_roller, "ether conversion overflow");
            Decimal::MAX
        })
}
