//! Actor-based concurrency for the ledger
//!
//! All mutations flow through one Tokio task owning the storage handle
//! and the bot pool, so every check-then-append sequence (balance
//! check before a transfer, duplicate check before a deposit credit,
//! lease check before a grant) runs without interleaving. Handles are
//! cheap clones of the mailbox sender.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            LedgerHandle (Clone)              │
//! │        sends messages, awaits replies        │
//! └──────────────────────┬───────────────────────┘
//!                        │ mpsc::channel (bounded)
//!                        ▼
//! ┌──────────────────────────────────────────────┐
//! │           LedgerActor (single task)          │
//! │   check → StagedWrite → atomic WriteBatch    │
//! └──────────────────────────────────────────────┘
//! ```

use crate::{
    bots::BotLeaseManager,
    config::Config,
    error::{Error, Result},
    metrics::Metrics,
    scanner::{self, ScanWindow},
    settle,
    storage::Storage,
    types::{Address, BotGrant, ScanOutcome, SettleOutcome, SettlementLink, TxHash},
};
use chain_client::{Deposit, Payment};
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message sent to the ledger actor
pub enum LedgerMessage {
    /// Move rollers between two addresses
    Transfer {
        source: Address,
        target: Address,
        amount: u128,
        response: oneshot::Sender<Result<u64>>,
    },

    /// Credit one deposit outside a scan, linked to a remote tx
    Deposit {
        address: Address,
        amount: u128,
        remote_tx: TxHash,
        response: oneshot::Sender<Result<u64>>,
    },

    /// Commit a fetched deposit scan window
    CommitScan {
        window: ScanWindow,
        deposits: Vec<Deposit>,
        raw_events: String,
        response: oneshot::Sender<Result<ScanOutcome>>,
    },

    /// Match an outbound payment batch against pending withdrawals
    Settle {
        batch_tx: TxHash,
        payments: Vec<Payment>,
        response: oneshot::Sender<Result<SettleOutcome>>,
    },

    /// Lease a bot to a player
    AcquireBot {
        player: Address,
        response: oneshot::Sender<Result<BotGrant>>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that processes ledger messages
pub struct LedgerActor {
    storage: Arc<Storage>,
    config: Arc<Config>,
    bots: BotLeaseManager,
    metrics: Arc<Metrics>,
    mailbox: mpsc::Receiver<LedgerMessage>,
}

impl LedgerActor {
    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                LedgerMessage::Shutdown => break,
                other => self.handle_message(other),
            }
        }
    }

    fn handle_message(&mut self, msg: LedgerMessage) {
        match msg {
            LedgerMessage::Transfer {
                source,
                target,
                amount,
                response,
            } => {
                let _ = response.send(self.handle_transfer(&source, &target, amount));
            }

            LedgerMessage::Deposit {
                address,
                amount,
                remote_tx,
                response,
            } => {
                let _ = response.send(self.handle_deposit(&address, amount, &remote_tx));
            }

            LedgerMessage::CommitScan {
                window,
                deposits,
                raw_events,
                response,
            } => {
                let result =
                    scanner::apply_scan(&self.storage, &self.config, window, &deposits, raw_events);
                if let Ok(outcome) = &result {
                    self.metrics.scans_total.inc();
                    self.metrics
                        .deposits_total
                        .inc_by(outcome.deposits_credited as u64);
                }
                let _ = response.send(result);
            }

            LedgerMessage::Settle {
                batch_tx,
                payments,
                response,
            } => {
                let result = settle::apply(&self.storage, &self.config, &batch_tx, &payments);
                if let Ok(outcome) = &result {
                    self.metrics.settled_total.inc_by(outcome.settled_count as u64);
                }
                let _ = response.send(result);
            }

            LedgerMessage::AcquireBot { player, response } => {
                let result = self.bots.acquire(&self.storage, &player, Utc::now());
                if result.is_ok() {
                    self.metrics.bot_leases_total.inc();
                }
                let _ = response.send(result);
            }

            LedgerMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn handle_transfer(&mut self, source: &Address, target: &Address, amount: u128) -> Result<u64> {
        let release = self
            .bots
            .transfer_guard(&self.storage, source, target, amount, Utc::now())?;

        // The Safe may go negative; everyone else needs cover.
        if *source != self.config.safe_address {
            let balance = self.storage.balance(source)?;
            if balance < 0 || (balance as u128) < amount {
                return Err(Error::InsufficientFunds(format!(
                    "{} has {} rollers, cannot send {}",
                    source, balance, amount
                )));
            }
        }

        let is_withdrawal = *target == self.config.safe_address;
        let mut staged = self.storage.begin();
        let id = staged.stage_transfer(source, target, amount, is_withdrawal)?;
        if let Some(release) = release {
            staged.stage_lease(&release.bot, &release.player, false)?;
        }
        staged.commit()?;

        self.metrics.transfers_total.inc();
        tracing::debug!(id, source = %source, target = %target, amount, "transfer appended");
        Ok(id)
    }

    fn handle_deposit(&mut self, address: &Address, amount: u128, remote_tx: &TxHash) -> Result<u64> {
        // Same at-most-once rule as scanned deposits: a redelivered
        // remote tx must not credit twice.
        if self.storage.has_remote_tx(remote_tx)? {
            return Err(Error::Scan(format!(
                "transaction {} was already credited",
                remote_tx
            )));
        }

        let mut staged = self.storage.begin();
        let id = staged.stage_transfer(&self.config.safe_address, address, amount, false)?;
        staged.stage_settlement_link(&SettlementLink {
            remote_tx: remote_tx.clone(),
            local_transfer_id: id,
        })?;
        staged.commit()?;

        self.metrics.transfers_total.inc();
        self.metrics.deposits_total.inc();
        Ok(id)
    }
}

/// Handle for sending messages to the actor
#[derive(Clone)]
pub struct LedgerHandle {
    sender: mpsc::Sender<LedgerMessage>,
}

impl LedgerHandle {
    async fn request<T>(
        &self,
        msg: LedgerMessage,
        receiver: oneshot::Receiver<Result<T>>,
    ) -> Result<T> {
        self.sender
            .send(msg)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        receiver
            .await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))?
    }

    /// Append a transfer
    pub async fn transfer(&self, source: Address, target: Address, amount: u128) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.request(
            LedgerMessage::Transfer {
                source,
                target,
                amount,
                response: tx,
            },
            rx,
        )
        .await
    }

    /// Credit one deposit
    pub async fn deposit(&self, address: Address, amount: u128, remote_tx: TxHash) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.request(
            LedgerMessage::Deposit {
                address,
                amount,
                remote_tx,
                response: tx,
            },
            rx,
        )
        .await
    }

    /// Commit a scan window
    pub async fn commit_scan(
        &self,
        window: ScanWindow,
        deposits: Vec<Deposit>,
        raw_events: String,
    ) -> Result<ScanOutcome> {
        let (tx, rx) = oneshot::channel();
        self.request(
            LedgerMessage::CommitScan {
                window,
                deposits,
                raw_events,
                response: tx,
            },
            rx,
        )
        .await
    }

    /// Settle an outbound payment batch
    pub async fn settle(&self, batch_tx: TxHash, payments: Vec<Payment>) -> Result<SettleOutcome> {
        let (tx, rx) = oneshot::channel();
        self.request(
            LedgerMessage::Settle {
                batch_tx,
                payments,
                response: tx,
            },
            rx,
        )
        .await
    }

    /// Lease a bot
    pub async fn acquire_bot(&self, player: Address) -> Result<BotGrant> {
        let (tx, rx) = oneshot::channel();
        self.request(LedgerMessage::AcquireBot { player, response: tx }, rx)
            .await
    }

    /// Shutdown actor, waiting until it has released its resources
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(LedgerMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        self.sender.closed().await;
        Ok(())
    }
}

/// Spawn the ledger actor
pub fn spawn_ledger_actor(
    storage: Arc<Storage>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
) -> LedgerHandle {
    let (tx, rx) = mpsc::channel(1000); // Bounded channel for backpressure
    let actor = LedgerActor {
        bots: BotLeaseManager::new(&config),
        storage,
        config,
        metrics,
        mailbox: rx,
    };

    tokio::spawn(async move {
        actor.run().await;
    });

    LedgerHandle { sender: tx }
}
