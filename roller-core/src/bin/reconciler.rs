//! One-shot reconciliation binary
//!
//! Scans the next confirmed block window for deposits to the Safe and,
//! when `ROLLER_SETTLE_TX` names an outbound batch transaction, settles
//! the pending withdrawals it covers. Meant to run from cron or an
//! operator shell.

use anyhow::Context;
use chain_client::EtherscanClient;
use roller_core::{Config, Ledger, TxHash};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let config = Config::from_env().context("loading configuration")?;
    let api_key =
        std::env::var("ROLLER_ETHERSCAN_API_KEY").context("ROLLER_ETHERSCAN_API_KEY not set")?;
    let chain = Arc::new(EtherscanClient::new(api_key));

    let ledger = Ledger::open(config, chain).context("opening ledger")?;

    match ledger.scan_for_deposits(None, None).await? {
        Some(outcome) => tracing::info!(
            start_block = outcome.start_block,
            end_block = outcome.end_block,
            deposits = outcome.deposits_credited,
            "scan committed"
        ),
        None => tracing::info!("no new confirmed blocks"),
    }

    if let Ok(batch_tx) = std::env::var("ROLLER_SETTLE_TX") {
        let batch_tx: TxHash = batch_tx.parse()?;
        let outcome = ledger.settle(&batch_tx).await?;
        tracing::info!(
            settled = outcome.settled_count,
            remaining = outcome.remaining_unsettled,
            "settlement committed"
        );
    }

    let pending = ledger.unsettled_withdrawals_csv()?;
    if !pending.is_empty() {
        tracing::info!("pending payouts:\n{}", pending);
    }

    ledger.shutdown().await?;
    Ok(())
}
