//! High-level ledger facade
//!
//! [`Ledger`] wires the storage, the single-writer actor, the bot pool
//! and a [`ChainSource`] together and exposes the operations the
//! surrounding service calls: balances, transfers, withdrawals, deposit
//! scans, settlement and bot leasing.

use crate::{
    actor::{spawn_ledger_actor, LedgerHandle},
    config::Config,
    error::Result,
    metrics::Metrics,
    scanner::{self, ScanWindow},
    storage::Storage,
    types::{
        roller_to_eth, Address, BotGrant, Prices, ScanOutcome, SettleOutcome, SettlementLink,
        TxHash, UnsettledWithdrawal,
    },
};
use chain_client::ChainSource;
use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::info;

/// The accounting core
pub struct Ledger {
    handle: LedgerHandle,
    storage: Arc<Storage>,
    chain: Arc<dyn ChainSource>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl Ledger {
    /// Open the ledger, funding the bot pool on first run
    pub fn open(config: Config, chain: Arc<dyn ChainSource>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let storage = Arc::new(Storage::open(&config)?);

        if storage.transfer_count() == 0 {
            bootstrap_bots(&storage, &config)?;
        }

        let metrics = Arc::new(Metrics::new());
        let handle = spawn_ledger_actor(
            Arc::clone(&storage),
            Arc::clone(&config),
            Arc::clone(&metrics),
        );

        Ok(Self {
            handle,
            storage,
            chain,
            config,
            metrics,
        })
    }

    /// Current balance of an address, from the projection
    pub fn get_balance(&self, address: &Address) -> Result<i128> {
        self.storage.balance(address)
    }

    /// Balance recomputed from the full transfer log, for audits
    pub fn recompute_balance(&self, address: &Address) -> Result<i128> {
        self.storage.recompute_balance(address)
    }

    /// Move rollers between two addresses
    pub async fn transfer(&self, source: &Address, target: &Address, amount: u128) -> Result<u64> {
        self.handle
            .transfer(source.clone(), target.clone(), amount)
            .await
    }

    /// Debit an address against a future on-chain payout
    pub async fn withdraw(&self, address: &Address, amount: u128) -> Result<u64> {
        self.handle
            .transfer(address.clone(), self.config.safe_address.clone(), amount)
            .await
    }

    /// Credit a deposit directly, bypassing the chain scan
    ///
    /// For development and tests only; the remote tx still counts
    /// against the at-most-once settlement index.
    pub async fn debug_deposit(
        &self,
        address: &Address,
        amount: u128,
        remote_tx: TxHash,
    ) -> Result<u64> {
        self.handle.deposit(address.clone(), amount, remote_tx).await
    }

    /// Scan the next block window for deposits to the Safe
    ///
    /// With no explicit bounds the window resumes one past the persisted
    /// watermark and ends at the newest sufficiently confirmed block.
    /// Returns `Ok(None)` when no new block is ready, without touching
    /// the watermark.
    pub async fn scan_for_deposits(
        &self,
        start: Option<u64>,
        end: Option<u64>,
    ) -> Result<Option<ScanOutcome>> {
        let start = match start {
            Some(block) => block,
            None => scanner::next_start(self.storage.watermark()?),
        };
        let end = match end {
            Some(block) => block,
            None => {
                let latest = self.chain.latest_block_number().await?;
                match scanner::confirmed_head(latest, self.config.required_block_depth) {
                    Some(head) => head,
                    // The chain is shallower than the confirmation
                    // depth; nothing is safe to scan yet.
                    None => return Ok(None),
                }
            }
        };
        if end < start {
            return Ok(None);
        }

        let deposits = self
            .chain
            .deposits(self.config.safe_address.as_str(), start, end)
            .await?;
        let raw_events = serde_json::to_string(&deposits)?;

        let window = ScanWindow {
            start_block: start,
            end_block: end,
        };
        let outcome = self.handle.commit_scan(window, deposits, raw_events).await?;
        Ok(Some(outcome))
    }

    /// Withdrawals waiting for an on-chain payout, oldest first
    pub fn get_unsettled_withdrawals(&self) -> Result<Vec<UnsettledWithdrawal>> {
        self.storage.unsettled_withdrawals(None)
    }

    /// Pending payout totals per address, as CSV lines of
    /// `0x<address>, <ether>`, ordered by oldest pending debit
    pub fn unsettled_withdrawals_csv(&self) -> Result<String> {
        let unsettled = self.storage.unsettled_withdrawals(None)?;

        let mut order = Vec::new();
        let mut totals: HashMap<Address, u128> = HashMap::new();
        for withdrawal in unsettled {
            if !totals.contains_key(&withdrawal.address) {
                order.push(withdrawal.address.clone());
            }
            *totals.entry(withdrawal.address).or_insert(0) += withdrawal.amount;
        }

        let mut csv = String::new();
        for address in order {
            let ether = roller_to_eth(totals[&address], self.config.wei_withdraw_per_roller);
            let _ = writeln!(csv, "0x{}, {}", address, ether);
        }
        Ok(csv)
    }

    /// Match the itemized payments of an outbound batch transaction
    /// against the pending withdrawals
    pub async fn settle(&self, batch_tx: &TxHash) -> Result<SettleOutcome> {
        let payments = self
            .chain
            .payments(self.config.safe_address.as_str(), batch_tx.as_str())
            .await?;
        self.handle.settle(batch_tx.clone(), payments).await
    }

    /// Lease a bot to a player
    pub async fn acquire_bot(&self, player: &Address) -> Result<BotGrant> {
        self.handle.acquire_bot(player.clone()).await
    }

    /// Currency peg parameters
    pub fn prices(&self) -> Prices {
        Prices {
            safe: self.config.safe_address.clone(),
            wei_deposit_per_roller: self.config.wei_deposit_per_roller,
            wei_withdraw_per_roller: self.config.wei_withdraw_per_roller,
        }
    }

    /// Render the metrics registry in the Prometheus text format
    pub fn metrics_text(&self) -> String {
        self.metrics.render()
    }

    /// Stop the writer task
    pub async fn shutdown(&self) -> Result<()> {
        self.handle.shutdown().await
    }
}

/// Fund the configured bots from the Safe, once, atomically
///
/// Each grant is marked settled against a synthetic remote tx derived
/// from the bot address, so reconciliation never treats the pool funding
/// as a pending payout.
fn bootstrap_bots(storage: &Storage, config: &Config) -> Result<()> {
    let mut staged = storage.begin();
    for bot in &config.bots {
        let id = staged.stage_transfer(
            &config.safe_address,
            bot,
            u128::from(config.bot_initial_fund),
            false,
        )?;
        staged.stage_settlement_link(&SettlementLink {
            remote_tx: TxHash::new(format!("{:0>64}", bot.as_str()))?,
            local_transfer_id: id,
        })?;
        staged.stage_lease(bot, &config.safe_address, false)?;
    }
    staged.commit()?;
    info!(bots = config.bots.len(), fund = config.bot_initial_fund, "bot pool funded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use chain_client::{Deposit, MockChain, Payment};
    use tempfile::TempDir;

    fn addr(digit: char) -> Address {
        Address::new(std::iter::repeat(digit).take(40).collect::<String>()).unwrap()
    }

    fn test_config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        config.safe_address = addr('f');
        config.bots = vec![];
        config
    }

    fn deposit_for(player: &Address, rollers: u128, block_number: u64, tx_digit: char) -> Deposit {
        Deposit {
            source: player.as_str().to_string(),
            amount_wei: rollers * 100_000_000_000_000,
            block_number,
            tx: std::iter::repeat(tx_digit).take(64).collect(),
        }
    }

    async fn open(config: Config) -> (Ledger, MockChain) {
        let chain = MockChain::new();
        let ledger = Ledger::open(config, Arc::new(chain.clone())).unwrap();
        (ledger, chain)
    }

    #[tokio::test]
    async fn test_deposit_transfer_withdraw_settle_cycle() {
        let dir = TempDir::new().unwrap();
        let config = test_config(&dir);
        let (ledger, chain) = open(config).await;
        let alice = addr('1');
        let bob = addr('2');

        // A confirmed 10-roller deposit is picked up by the scan.
        chain.set_latest_block(20).await;
        chain.push_deposit(deposit_for(&alice, 10, 5, 'a')).await;
        let outcome = ledger.scan_for_deposits(None, None).await.unwrap().unwrap();
        assert_eq!(outcome.start_block, 0);
        assert_eq!(outcome.end_block, 10);
        assert_eq!(outcome.deposits_credited, 1);
        assert_eq!(ledger.get_balance(&alice).unwrap(), 10);
        assert_eq!(ledger.get_balance(&ledger.prices().safe).unwrap(), -10);

        ledger.transfer(&alice, &bob, 3).await.unwrap();
        assert_eq!(ledger.get_balance(&alice).unwrap(), 7);
        assert_eq!(ledger.get_balance(&bob).unwrap(), 3);

        ledger.withdraw(&alice, 4).await.unwrap();
        assert_eq!(ledger.get_balance(&alice).unwrap(), 3);
        let pending = ledger.get_unsettled_withdrawals().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].amount, 4);

        // An exact payout of 4 rollers settles the debit.
        let batch = TxHash::new("b".repeat(64)).unwrap();
        chain
            .set_payments(
                batch.as_str(),
                vec![Payment {
                    address: alice.as_str().to_string(),
                    amount_wei: 4 * 70_000_000_000_000,
                }],
            )
            .await;
        let outcome = ledger.settle(&batch).await.unwrap();
        assert_eq!(outcome.settled_count, 1);
        assert_eq!(outcome.remaining_unsettled, 0);
        assert!(ledger.get_unsettled_withdrawals().unwrap().is_empty());

        // The projection agrees with the full log.
        assert_eq!(
            ledger.get_balance(&alice).unwrap(),
            ledger.recompute_balance(&alice).unwrap()
        );
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_without_new_blocks_is_a_no_op() {
        let dir = TempDir::new().unwrap();
        let (ledger, chain) = open(test_config(&dir)).await;

        chain.set_latest_block(20).await;
        ledger.scan_for_deposits(None, None).await.unwrap().unwrap();

        // Head unchanged: watermark is at 10, the next window is empty.
        let second = ledger.scan_for_deposits(None, None).await.unwrap();
        assert_eq!(second, None);

        // A new block extends the window by exactly one.
        chain.set_latest_block(21).await;
        let third = ledger.scan_for_deposits(None, None).await.unwrap().unwrap();
        assert_eq!(third.start_block, 11);
        assert_eq!(third.end_block, 11);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shallow_chain_defers_scanning() {
        let dir = TempDir::new().unwrap();
        let (ledger, chain) = open(test_config(&dir)).await;
        let alice = addr('1');

        // Head 5 with depth 10: no block is confirmed, not even 0.
        chain.set_latest_block(5).await;
        chain.push_deposit(deposit_for(&alice, 10, 2, 'a')).await;
        assert_eq!(ledger.scan_for_deposits(None, None).await.unwrap(), None);
        assert_eq!(ledger.get_balance(&alice).unwrap(), 0);

        // Once deep enough, the window still starts at block 0.
        chain.set_latest_block(12).await;
        let outcome = ledger.scan_for_deposits(None, None).await.unwrap().unwrap();
        assert_eq!(outcome.start_block, 0);
        assert_eq!(outcome.end_block, 2);
        assert_eq!(ledger.get_balance(&alice).unwrap(), 10);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_remote_tx_aborts_the_scan() {
        let dir = TempDir::new().unwrap();
        let (ledger, chain) = open(test_config(&dir)).await;
        let alice = addr('1');

        chain.set_latest_block(20).await;
        chain.push_deposit(deposit_for(&alice, 10, 5, 'a')).await;
        ledger.scan_for_deposits(None, None).await.unwrap().unwrap();
        assert_eq!(ledger.get_balance(&alice).unwrap(), 10);

        // The same tx surfaces again in a later block.
        chain.push_deposit(deposit_for(&alice, 10, 15, 'a')).await;
        chain.set_latest_block(30).await;
        let result = ledger.scan_for_deposits(None, None).await;
        assert!(matches!(result, Err(Error::Scan(_))));

        // Nothing was credited and the watermark did not move.
        assert_eq!(ledger.get_balance(&alice).unwrap(), 10);
        let retry = ledger.scan_for_deposits(None, Some(14)).await;
        assert!(retry.is_ok());
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_residual_payment_settles_nothing() {
        let dir = TempDir::new().unwrap();
        let (ledger, chain) = open(test_config(&dir)).await;
        let alice = addr('1');

        let tx = TxHash::new("a".repeat(64)).unwrap();
        ledger.debug_deposit(&alice, 10, tx).await.unwrap();
        ledger.withdraw(&alice, 4).await.unwrap();

        // 5 rollers against a 4-roller debit leaves a residual.
        let batch = TxHash::new("b".repeat(64)).unwrap();
        chain
            .set_payments(
                batch.as_str(),
                vec![Payment {
                    address: alice.as_str().to_string(),
                    amount_wei: 5 * 70_000_000_000_000,
                }],
            )
            .await;
        let result = ledger.settle(&batch).await;
        assert!(matches!(result, Err(Error::Settle(_))));
        assert_eq!(ledger.get_unsettled_withdrawals().unwrap().len(), 1);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_withdrawals_csv_groups_by_address() {
        let dir = TempDir::new().unwrap();
        let (ledger, _chain) = open(test_config(&dir)).await;
        let alice = addr('1');
        let bob = addr('2');

        let tx_a = TxHash::new("a".repeat(64)).unwrap();
        let tx_b = TxHash::new("b".repeat(64)).unwrap();
        ledger.debug_deposit(&alice, 10, tx_a).await.unwrap();
        ledger.debug_deposit(&bob, 10, tx_b).await.unwrap();
        ledger.withdraw(&alice, 3).await.unwrap();
        ledger.withdraw(&bob, 5).await.unwrap();
        ledger.withdraw(&alice, 1).await.unwrap();

        // 4 rollers at 7e13 wei each is 0.00028 ether.
        let csv = ledger.unsettled_withdrawals_csv().unwrap();
        assert_eq!(
            csv,
            format!("0x{}, 0.00028\n0x{}, 0.00035\n", alice, bob)
        );
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bootstrap_funds_bots_once() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.bots = vec![addr('a'), addr('b')];

        let (ledger, _chain) = open(config.clone()).await;
        assert_eq!(ledger.get_balance(&addr('a')).unwrap(), 1_000);
        assert_eq!(ledger.get_balance(&ledger.prices().safe).unwrap(), -2_000);
        ledger.shutdown().await.unwrap();
        drop(ledger);

        // Reopening does not fund again.
        let (ledger, _chain) = open(config).await;
        assert_eq!(ledger.get_balance(&addr('a')).unwrap(), 1_000);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bot_lease_contention() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.bots = vec![addr('a')];
        config.bot_usage_min_secs = 0;
        let (ledger, _chain) = open(config).await;

        let grant = ledger.acquire_bot(&addr('1')).await.unwrap();
        assert_eq!(grant.address, addr('a'));
        assert_eq!(grant.balance, 1_000);

        // Same player cannot hold twice, and nobody else gets the bot.
        assert!(matches!(
            ledger.acquire_bot(&addr('1')).await,
            Err(Error::BotNotFound(_))
        ));
        assert!(matches!(
            ledger.acquire_bot(&addr('2')).await,
            Err(Error::BotNotFound(_))
        ));
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bot_transfer_guarded() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.bots = vec![addr('a')];
        config.bot_usage_min_secs = 0;
        let (ledger, _chain) = open(config).await;
        let player = addr('1');

        // Without a lease the bot refuses to pay out.
        assert!(matches!(
            ledger.transfer(&addr('a'), &player, 10).await,
            Err(Error::BotNotFound(_))
        ));

        ledger.acquire_bot(&player).await.unwrap();

        // The per-transfer cap binds even during a lease.
        assert!(matches!(
            ledger.transfer(&addr('a'), &player, 51).await,
            Err(Error::InsufficientFunds(_))
        ));

        ledger.transfer(&addr('a'), &player, 50).await.unwrap();
        assert_eq!(ledger.get_balance(&player).unwrap(), 50);
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_bot_usage_window_blocks_immediate_cash_out() {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(&dir);
        config.bots = vec![addr('a')];
        config.bot_usage_min_secs = 300;
        let (ledger, _chain) = open(config).await;
        let player = addr('1');

        ledger.acquire_bot(&player).await.unwrap();
        let result = ledger.transfer(&addr('a'), &player, 10).await;
        assert!(matches!(result, Err(Error::BotNotFound(_))));
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_chain_outage_surfaces_as_error() {
        let dir = TempDir::new().unwrap();
        let (ledger, chain) = open(test_config(&dir)).await;

        chain.set_failing(true).await;
        let result = ledger.scan_for_deposits(None, None).await;
        assert!(matches!(result, Err(Error::Chain(_))));
        ledger.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_metrics_count_ledger_activity() {
        let dir = TempDir::new().unwrap();
        let (ledger, _chain) = open(test_config(&dir)).await;
        let alice = addr('1');

        let tx = TxHash::new("a".repeat(64)).unwrap();
        ledger.debug_deposit(&alice, 10, tx).await.unwrap();
        ledger.transfer(&alice, &addr('2'), 3).await.unwrap();

        let text = ledger.metrics_text();
        assert!(text.contains("roller_transfers_total 2"));
        assert!(text.contains("roller_deposits_total 1"));
        ledger.shutdown().await.unwrap();
    }
}
