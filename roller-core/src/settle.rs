//! Settlement matcher
//!
//! Matches pending withdrawal debits against the itemized payments of an
//! outbound batch transaction. Debits are consumed whole, oldest first,
//! per address. A payment that cannot be fully explained by known debits
//! aborts the whole settlement; debits nobody paid stay pending for a
//! future call.

use crate::{
    config::Config,
    error::{Error, Result},
    storage::Storage,
    types::{Address, SettleOutcome, SettlementLink, TxHash, UnsettledWithdrawal},
};
use chrono::{Duration, Utc};
use std::collections::BTreeSet;
use tracing::{error, info, warn};

/// One batch payment converted to roller units
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollerPayment {
    /// Paid address
    pub address: Address,

    /// Paid amount in rollers
    pub amount: u128,
}

/// Convert batch payments from wei to rollers by truncating division
pub fn convert_payments(
    payments: &[chain_client::Payment],
    wei_per_roller: u64,
) -> Result<Vec<RollerPayment>> {
    let divisor = u128::from(wei_per_roller);
    payments
        .iter()
        .map(|payment| {
            if payment.amount_wei % divisor != 0 {
                error!(
                    address = %payment.address,
                    amount_wei = payment.amount_wei,
                    "non integer payment"
                );
            }
            Ok(RollerPayment {
                address: Address::new(&payment.address)
                    .map_err(|_| Error::Settle(format!("bad payment address {}", payment.address)))?,
                amount: payment.amount_wei / divisor,
            })
        })
        .collect()
}

/// Greedily match payments against unsettled debits
///
/// Returns the ids of the matched debits. Each payment must be entirely
/// consumed: residual amount after all eligible debits is an
/// [`Error::Settle`] - unexplained overpayment is never absorbed.
pub fn match_payments(
    unsettled: &[UnsettledWithdrawal],
    payments: &[RollerPayment],
) -> Result<BTreeSet<u64>> {
    let mut matched = BTreeSet::new();
    for payment in payments {
        let mut remaining = payment.amount;
        for withdrawal in unsettled {
            if withdrawal.address != payment.address || matched.contains(&withdrawal.transfer_id) {
                continue;
            }
            if withdrawal.amount > remaining {
                // Never split a debit; it stays pending for a later batch.
                warn!(
                    transfer_id = withdrawal.transfer_id,
                    amount = withdrawal.amount,
                    remaining,
                    "unmatched withdrawal"
                );
                continue;
            }
            remaining -= withdrawal.amount;
            matched.insert(withdrawal.transfer_id);
        }
        if remaining != 0 {
            return Err(Error::Settle(format!(
                "unmatched payment of {} rollers to {}",
                remaining, payment.address
            )));
        }
    }
    Ok(matched)
}

/// Match a batch against the pending debits and commit the links
///
/// Runs inside the single-writer scope; the read-match-commit sequence
/// is atomic across all matched debits. On [`Error::Settle`] nothing is
/// committed.
pub fn apply(
    storage: &Storage,
    config: &Config,
    batch_tx: &TxHash,
    payments: &[chain_client::Payment],
) -> Result<SettleOutcome> {
    let cutoff = Utc::now()
        - Duration::from_std(config.settlement_grace()).unwrap_or_else(|_| Duration::zero());
    let unsettled = storage.unsettled_withdrawals(Some(cutoff))?;

    let converted = convert_payments(payments, config.wei_withdraw_per_roller)?;
    let matched = match_payments(&unsettled, &converted)?;

    if !matched.is_empty() {
        let mut staged = storage.begin();
        for transfer_id in &matched {
            staged.stage_settlement_link(&SettlementLink {
                remote_tx: batch_tx.clone(),
                local_transfer_id: *transfer_id,
            })?;
        }
        staged.commit()?;
    }

    let remaining_unsettled = storage.unsettled_withdrawals(Some(cutoff))?.len();
    info!(
        batch_tx = %batch_tx,
        settled = matched.len(),
        remaining_unsettled,
        "settlement committed"
    );

    Ok(SettleOutcome {
        settled_count: matched.len(),
        remaining_unsettled,
    })
}
