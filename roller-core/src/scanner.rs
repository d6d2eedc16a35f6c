//! Deposit scanner
//!
//! Scans a window of confirmed blocks for payments into the Safe and
//! converts them into ledger credits. The window is committed as a
//! [`DepositScanRecord`] in the same atomic write as the credits, so the
//! persisted watermark and the credited deposits can never diverge: a
//! half-applied scan is not observable, and a rerun with no new blocks
//! is a no-op.

use crate::{
    config::Config,
    error::{Error, Result},
    storage::Storage,
    types::{Address, DepositScanRecord, ScanOutcome, SettlementLink, TxHash},
};
use chain_client::Deposit;
use chrono::Utc;
use std::collections::BTreeSet;
use tracing::{error, info};

/// One inclusive block range to scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanWindow {
    /// First block of the window
    pub start_block: u64,

    /// Last block of the window
    pub end_block: u64,
}

/// The block a resumed scan starts from: one past the watermark
pub fn next_start(watermark: Option<u64>) -> u64 {
    watermark.map_or(0, |mark| mark + 1)
}

/// The newest block deep enough to act on, given the required
/// confirmation depth (avoids reorg-prone blocks)
///
/// `None` while the chain is shallower than the required depth; not
/// even block 0 is confirmed then, and no scan should run.
pub fn confirmed_head(latest_block: u64, required_depth: u64) -> Option<u64> {
    latest_block.checked_sub(required_depth)
}

/// Convert a wei deposit to rollers by truncating division
///
/// An inexact multiple is a peg violation worth flagging, but the
/// deposit is still credited with the truncated amount.
pub fn convert_deposit_amount(deposit: &Deposit, wei_per_roller: u64) -> u128 {
    let divisor = u128::from(wei_per_roller);
    if deposit.amount_wei % divisor != 0 {
        error!(
            tx = %deposit.tx,
            amount_wei = deposit.amount_wei,
            "non integer deposit"
        );
    }
    deposit.amount_wei / divisor
}

/// Validate the window, credit its deposits, and commit the watermark
///
/// Runs inside the single-writer scope. Any [`Error::Scan`] aborts the
/// entire window before anything is written; the caller retries the same
/// window after investigation.
pub fn apply_scan(
    storage: &Storage,
    config: &Config,
    window: ScanWindow,
    deposits: &[Deposit],
    raw_events: String,
) -> Result<ScanOutcome> {
    // The watermark must not have moved since the window was resolved,
    // and explicit windows must not rescan or skip ranges.
    if let Some(watermark) = storage.watermark()? {
        if window.start_block != watermark + 1 {
            return Err(Error::Scan(format!(
                "scan window starts at {} but the watermark is {}",
                window.start_block, watermark
            )));
        }
    }

    // A deposit identifier seen before, in an earlier window or twice in
    // this batch, means the collaborator delivered it more than once;
    // abort before any append.
    let mut parsed = Vec::with_capacity(deposits.len());
    let mut seen = BTreeSet::new();
    for deposit in deposits {
        let source = Address::new(&deposit.source)
            .map_err(|_| Error::Scan(format!("bad deposit source {}", deposit.source)))?;
        let remote_tx = TxHash::new(&deposit.tx)
            .map_err(|_| Error::Scan(format!("bad deposit transaction {}", deposit.tx)))?;
        if storage.has_remote_tx(&remote_tx)? || !seen.insert(remote_tx.clone()) {
            error!(tx = %remote_tx, "duplicate deposit reported");
            return Err(Error::Scan("invalid deposits detected".to_string()));
        }
        parsed.push((source, remote_tx, convert_deposit_amount(deposit, config.wei_deposit_per_roller)));
    }

    let mut staged = storage.begin();
    for (source, remote_tx, amount) in &parsed {
        let transfer_id =
            staged.stage_transfer(&config.safe_address, source, *amount, false)?;
        staged.stage_settlement_link(&SettlementLink {
            remote_tx: remote_tx.clone(),
            local_transfer_id: transfer_id,
        })?;
    }

    // Recorded even for an empty window; this is what advances the
    // watermark and makes the next call idempotent.
    staged.stage_scan(&DepositScanRecord {
        start_block: window.start_block,
        end_block: window.end_block,
        timestamp: Utc::now(),
        raw_events,
    })?;
    staged.commit()?;

    info!(
        start_block = window.start_block,
        end_block = window.end_block,
        deposits = parsed.len(),
        "deposit scan committed"
    );

    Ok(ScanOutcome {
        start_block: window.start_block,
        end_block: window.end_block,
        deposits_credited: parsed.len(),
    })
}
