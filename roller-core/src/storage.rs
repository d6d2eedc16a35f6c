//! Storage layer using RocksDB
//!
//! # Column Families
//!
//! - `transfers` - append-only transfer log (key: BE transfer id)
//! - `balances` - derived balance projection (key: address bytes),
//!   updated in the same `WriteBatch` as the transfers that move it;
//!   `recompute_balance` re-derives it from the log for audit
//! - `settlements` - settlement links (key: BE local transfer id,
//!   enforcing settle-at-most-once)
//! - `settlement_index` - remote id lookup (key: remote_tx || BE local id)
//! - `withdrawal_index` - transfers targeting the Safe (key: BE local id)
//! - `scans` - deposit scan records (key: BE end_block); the watermark is
//!   the last key
//! - `leases` - bot lease event log (key: BE lease idx)
//!
//! All writes are staged through [`StagedWrite`] and committed atomically.
//! Only the single-writer actor stages writes, which is what makes the
//! read-modify-write of the balance projection race-free.

use crate::{
    error::{Error, Result},
    types::{Address, BotLeaseRecord, DepositScanRecord, SettlementLink, Transfer, TxHash},
    Config,
};
use chrono::{DateTime, Utc};
use rocksdb::{
    ColumnFamily, ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const CF_TRANSFERS: &str = "transfers";
const CF_BALANCES: &str = "balances";
const CF_SETTLEMENTS: &str = "settlements";
const CF_SETTLEMENT_INDEX: &str = "settlement_index";
const CF_WITHDRAWAL_INDEX: &str = "withdrawal_index";
const CF_SCANS: &str = "scans";
const CF_LEASES: &str = "leases";

/// Storage wrapper for RocksDB
pub struct Storage {
    db: Arc<DB>,

    /// Next transfer id; recovered from the log tail at open
    next_transfer_id: AtomicU64,

    /// Next lease idx; recovered from the lease log tail at open
    next_lease_idx: AtomicU64,
}

impl Storage {
    /// Open or create the database
    pub fn open(config: &Config) -> Result<Self> {
        let path = &config.data_dir;
        std::fs::create_dir_all(path)?;

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_write_buffer_size(config.rocksdb.write_buffer_size_mb * 1024 * 1024);
        db_opts.set_max_write_buffer_number(config.rocksdb.max_write_buffer_number);
        db_opts.set_max_background_jobs(config.rocksdb.max_background_jobs);

        let cf_descriptors = [
            CF_TRANSFERS,
            CF_BALANCES,
            CF_SETTLEMENTS,
            CF_SETTLEMENT_INDEX,
            CF_WITHDRAWAL_INDEX,
            CF_SCANS,
            CF_LEASES,
        ]
        .into_iter()
        .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
        .collect::<Vec<_>>();

        let db = DB::open_cf_descriptors(&db_opts, path, cf_descriptors)?;
        let db = Arc::new(db);

        let next_transfer_id = last_key_u64(&db, CF_TRANSFERS)?.map_or(0, |last| last + 1);
        let next_lease_idx = last_key_u64(&db, CF_LEASES)?.map_or(0, |last| last + 1);

        tracing::info!(
            ?path,
            next_transfer_id,
            next_lease_idx,
            "opened roller ledger storage"
        );

        Ok(Self {
            db,
            next_transfer_id: AtomicU64::new(next_transfer_id),
            next_lease_idx: AtomicU64::new(next_lease_idx),
        })
    }

    fn cf_handle(&self, name: &str) -> Result<&ColumnFamily> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::Storage(format!("Column family {} not found", name)))
    }

    /// Begin staging an atomic group of writes
    pub fn begin(&self) -> StagedWrite<'_> {
        StagedWrite {
            storage: self,
            batch: WriteBatch::default(),
            balance_deltas: HashMap::new(),
            staged_links: Vec::new(),
        }
    }

    // Transfer log

    /// Number of transfers ever appended
    pub fn transfer_count(&self) -> u64 {
        self.next_transfer_id.load(Ordering::SeqCst)
    }

    /// Get a transfer by id
    pub fn get_transfer(&self, id: u64) -> Result<Option<Transfer>> {
        let cf = self.cf_handle(CF_TRANSFERS)?;
        match self.db.get_cf(cf, id.to_be_bytes())? {
            Some(value) => Ok(Some(bincode::deserialize(&value)?)),
            None => Ok(None),
        }
    }

    // Balances

    /// Projected balance of an address; 0 for unknown addresses
    pub fn balance(&self, address: &Address) -> Result<i128> {
        let cf = self.cf_handle(CF_BALANCES)?;
        match self.db.get_cf(cf, address.as_bytes())? {
            Some(value) => Ok(bincode::deserialize(&value)?),
            None => Ok(0),
        }
    }

    /// Re-derive a balance by aggregating the whole transfer log
    ///
    /// The projection in the `balances` column family must always agree
    /// with this; it exists for audit and recovery.
    pub fn recompute_balance(&self, address: &Address) -> Result<i128> {
        let cf = self.cf_handle(CF_TRANSFERS)?;
        let mut balance: i128 = 0;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let transfer: Transfer = bincode::deserialize(&value)?;
            let amount = amount_to_i128(transfer.amount)?;
            if transfer.target == *address {
                balance += amount;
            }
            if transfer.source == *address {
                balance -= amount;
            }
        }
        Ok(balance)
    }

    // Settlements

    /// Whether a transfer already has a settlement link
    pub fn is_settled(&self, transfer_id: u64) -> Result<bool> {
        let cf = self.cf_handle(CF_SETTLEMENTS)?;
        Ok(self.db.get_cf(cf, transfer_id.to_be_bytes())?.is_some())
    }

    /// Whether a remote transaction id was already credited or settled
    pub fn has_remote_tx(&self, remote_tx: &TxHash) -> Result<bool> {
        let cf = self.cf_handle(CF_SETTLEMENT_INDEX)?;
        let prefix = remote_tx.as_bytes();
        let mut iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(prefix, Direction::Forward));
        match iter.next() {
            Some(item) => {
                let (key, _) = item?;
                Ok(key.starts_with(prefix))
            }
            None => Ok(false),
        }
    }

    /// All unsettled withdrawals no younger than `cutoff`, oldest first
    pub fn unsettled_withdrawals(
        &self,
        cutoff: Option<DateTime<Utc>>,
    ) -> Result<Vec<crate::types::UnsettledWithdrawal>> {
        let cf = self.cf_handle(CF_WITHDRAWAL_INDEX)?;
        let mut withdrawals = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            let id = key_to_u64(&key)?;
            if self.is_settled(id)? {
                continue;
            }
            let transfer = self
                .get_transfer(id)?
                .ok_or_else(|| Error::Storage(format!("indexed transfer {} missing", id)))?;
            if let Some(cutoff) = cutoff {
                if transfer.timestamp > cutoff {
                    continue;
                }
            }
            withdrawals.push(crate::types::UnsettledWithdrawal {
                transfer_id: id,
                address: transfer.source,
                amount: transfer.amount,
            });
        }
        Ok(withdrawals)
    }

    // Deposit scans

    /// Highest block number already scanned for deposits
    pub fn watermark(&self) -> Result<Option<u64>> {
        last_key_u64(&self.db, CF_SCANS)
    }

    /// The most recent deposit scan record
    pub fn last_scan(&self) -> Result<Option<DepositScanRecord>> {
        let cf = self.cf_handle(CF_SCANS)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (_, value) = item?;
                Ok(Some(bincode::deserialize(&value)?))
            }
            None => Ok(None),
        }
    }

    // Bot leases

    /// Most recent lease record for every bot that ever appears in the log
    pub fn latest_lease_per_bot(&self) -> Result<HashMap<Address, BotLeaseRecord>> {
        let cf = self.cf_handle(CF_LEASES)?;
        let mut latest = HashMap::new();
        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            let (_, value) = item?;
            let record: BotLeaseRecord = bincode::deserialize(&value)?;
            latest.entry(record.bot.clone()).or_insert(record);
        }
        Ok(latest)
    }

    /// The player's most recent lease record, if any
    pub fn latest_lease_for_player(&self, player: &Address) -> Result<Option<BotLeaseRecord>> {
        let cf = self.cf_handle(CF_LEASES)?;
        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            let (_, value) = item?;
            let record: BotLeaseRecord = bincode::deserialize(&value)?;
            if record.player == *player {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    /// The most recent acquisition (`busy = true`) record for a pair
    pub fn latest_acquisition(
        &self,
        bot: &Address,
        player: &Address,
    ) -> Result<Option<BotLeaseRecord>> {
        let cf = self.cf_handle(CF_LEASES)?;
        for item in self.db.iterator_cf(cf, IteratorMode::End) {
            let (_, value) = item?;
            let record: BotLeaseRecord = bincode::deserialize(&value)?;
            if record.bot == *bot && record.player == *player && record.busy {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }
}

/// An uncommitted, atomic group of ledger writes
///
/// Balance updates are accumulated as deltas and folded into the
/// projection at commit, so several transfers touching one address in
/// the same group stay consistent.
pub struct StagedWrite<'a> {
    storage: &'a Storage,
    batch: WriteBatch,
    balance_deltas: HashMap<Address, i128>,
    staged_links: Vec<u64>,
}

impl StagedWrite<'_> {
    /// Stage one transfer; returns its assigned id
    pub fn stage_transfer(
        &mut self,
        source: &Address,
        target: &Address,
        amount: u128,
        is_withdrawal: bool,
    ) -> Result<u64> {
        let amount_signed = amount_to_i128(amount)?;
        let id = self.storage.next_transfer_id.fetch_add(1, Ordering::SeqCst);
        let transfer = Transfer {
            id,
            timestamp: Utc::now(),
            source: source.clone(),
            target: target.clone(),
            amount,
        };

        let cf = self.storage.cf_handle(CF_TRANSFERS)?;
        self.batch
            .put_cf(cf, id.to_be_bytes(), bincode::serialize(&transfer)?);

        if is_withdrawal {
            let cf = self.storage.cf_handle(CF_WITHDRAWAL_INDEX)?;
            self.batch.put_cf(cf, id.to_be_bytes(), []);
        }

        *self.balance_deltas.entry(target.clone()).or_insert(0) += amount_signed;
        *self.balance_deltas.entry(source.clone()).or_insert(0) -= amount_signed;

        Ok(id)
    }

    /// Stage one settlement link
    ///
    /// Refuses to link a transfer that already carries a link; the
    /// semantic duplicate checks run earlier, this is the storage-level
    /// invariant.
    pub fn stage_settlement_link(&mut self, link: &SettlementLink) -> Result<()> {
        if self.storage.is_settled(link.local_transfer_id)?
            || self.staged_links.contains(&link.local_transfer_id)
        {
            return Err(Error::Storage(format!(
                "transfer {} is already settled",
                link.local_transfer_id
            )));
        }

        let cf = self.storage.cf_handle(CF_SETTLEMENTS)?;
        self.batch.put_cf(
            cf,
            link.local_transfer_id.to_be_bytes(),
            bincode::serialize(link)?,
        );

        let cf = self.storage.cf_handle(CF_SETTLEMENT_INDEX)?;
        let mut key = link.remote_tx.as_bytes().to_vec();
        key.extend_from_slice(&link.local_transfer_id.to_be_bytes());
        self.batch.put_cf(cf, key, []);

        self.staged_links.push(link.local_transfer_id);
        Ok(())
    }

    /// Stage one deposit scan record, keyed by its end block
    pub fn stage_scan(&mut self, record: &DepositScanRecord) -> Result<()> {
        let cf = self.storage.cf_handle(CF_SCANS)?;
        self.batch.put_cf(
            cf,
            record.end_block.to_be_bytes(),
            bincode::serialize(record)?,
        );
        Ok(())
    }

    /// Stage one bot lease record; returns the appended record
    pub fn stage_lease(
        &mut self,
        bot: &Address,
        player: &Address,
        busy: bool,
    ) -> Result<BotLeaseRecord> {
        let idx = self.storage.next_lease_idx.fetch_add(1, Ordering::SeqCst);
        let record = BotLeaseRecord {
            idx,
            timestamp: Utc::now(),
            bot: bot.clone(),
            player: player.clone(),
            busy,
        };
        let cf = self.storage.cf_handle(CF_LEASES)?;
        self.batch
            .put_cf(cf, idx.to_be_bytes(), bincode::serialize(&record)?);
        Ok(record)
    }

    /// Fold balance deltas into the projection and commit everything
    pub fn commit(mut self) -> Result<()> {
        let cf = self.storage.cf_handle(CF_BALANCES)?;
        for (address, delta) in &self.balance_deltas {
            if *delta == 0 {
                continue;
            }
            let current = self.storage.balance(address)?;
            let updated = current
                .checked_add(*delta)
                .ok_or_else(|| Error::Storage(format!("balance overflow for {}", address)))?;
            self.batch
                .put_cf(cf, address.as_bytes(), bincode::serialize(&updated)?);
        }
        self.storage.db.write(self.batch)?;
        Ok(())
    }
}

fn last_key_u64(db: &DB, cf_name: &str) -> Result<Option<u64>> {
    let cf = db
        .cf_handle(cf_name)
        .ok_or_else(|| Error::Storage(format!("Column family {} not found", cf_name)))?;
    match db.iterator_cf(cf, IteratorMode::End).next() {
        Some(item) => {
            let (key, _) = item?;
            Ok(Some(key_to_u64(&key)?))
        }
        None => Ok(None),
    }
}

fn key_to_u64(key: &[u8]) -> Result<u64> {
    let bytes: [u8; 8] = key
        .try_into()
        .map_err(|_| Error::Storage("malformed u64 key".to_string()))?;
    Ok(u64::from_be_bytes(bytes))
}

fn amount_to_i128(amount: u128) -> Result<i128> {
    i128::try_from(amount).map_err(|_| Error::Storage(format!("amount {} too large", amount)))
}
