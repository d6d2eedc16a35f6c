//! Roller Balance Core
//!
//! Accounting and reconciliation engine for the "roller" in-game currency,
//! custodied through a single on-chain aggregation address (the Safe).
//!
//! # Architecture
//!
//! - **Event Sourcing**: every entity is created once and never mutated;
//!   balances and bot-lease state are derived by aggregation
//! - **Single Writer**: all check-then-write sequences run inside one
//!   actor task, so concurrent callers never act on stale state
//! - **Idempotent Reconciliation**: deposit scans advance a persisted
//!   watermark; external transaction identifiers are credited or settled
//!   at most once
//!
//! # Invariants
//!
//! - balance(addr) = Σ(amount, target = addr) − Σ(amount, source = addr)
//! - ordinary addresses never go negative; the Safe and bots may, as
//!   they represent backing reserves
//! - no deposit block range is scanned twice, none is skipped
//! - a settlement link requires an on-chain payment fully covering the
//!   matched debits; residual payment aborts the settlement

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod actor;
pub mod bots;
pub mod config;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod scanner;
pub mod settle;
pub mod storage;
pub mod types;

// Re-exports
pub use config::Config;
pub use error::{Error, Result};
pub use ledger::Ledger;
pub use types::{
    Address, BotGrant, BotLeaseRecord, DepositScanRecord, LeaseState, Prices, ScanOutcome,
    SettleOutcome, SettlementLink, Transfer, TxHash, UnsettledWithdrawal,
};
