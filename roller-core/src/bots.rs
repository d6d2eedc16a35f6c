//! Bot lease manager
//!
//! A fixed pool of pre-funded house addresses that players borrow for
//! short, exclusive sessions. Lease state is never stored as a mutable
//! field: each grant or release appends a [`BotLeaseRecord`], and the
//! current state of a bot is derived from its most recent record.
//!
//! The manager is owned by the single-writer actor, so pool membership
//! and every check-then-append sequence below are serialized with all
//! other ledger mutations.

use crate::{
    config::Config,
    error::{Error, Result},
    storage::Storage,
    types::{Address, BotGrant, BotLeaseRecord, LeaseState},
};
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use tracing::{info, warn};

/// Manages the active bot pool and its leases
pub struct BotLeaseManager {
    /// Active pool, ordered; a bot leaves it permanently when its
    /// balance reaches zero
    active: BTreeSet<Address>,

    usage_min: chrono::Duration,
    usage_max: chrono::Duration,
    transfer_max: u128,
}

/// A (bot, player) pair whose transfer passed the guard; the caller
/// appends the release record together with the transfer itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRelease {
    /// Involved bot
    pub bot: Address,

    /// Counterparty player
    pub player: Address,
}

impl BotLeaseManager {
    /// Create a manager over the configured pool
    pub fn new(config: &Config) -> Self {
        Self {
            active: config.bots.iter().cloned().collect(),
            usage_min: chrono::Duration::seconds(config.bot_usage_min_secs as i64),
            usage_max: chrono::Duration::seconds(config.bot_usage_max_secs as i64),
            transfer_max: u128::from(config.bot_transfer_max),
        }
    }

    /// Whether an address is an active pool bot
    pub fn is_bot(&self, address: &Address) -> bool {
        self.active.contains(address)
    }

    /// Recompute bot balances and retire exhausted bots
    ///
    /// Removal is permanent for the lifetime of the manager; a retired
    /// bot is never re-added automatically.
    pub fn refresh_pool(&mut self, storage: &Storage) -> Result<()> {
        let mut exhausted = Vec::new();
        for bot in &self.active {
            if storage.balance(bot)? == 0 {
                warn!(bot = %bot, "bot is out of funds");
                exhausted.push(bot.clone());
            }
        }
        for bot in exhausted {
            self.active.remove(&bot);
        }
        Ok(())
    }

    /// Derived lease state of one bot at `now`
    pub fn lease_state(
        &self,
        storage: &Storage,
        bot: &Address,
        now: DateTime<Utc>,
    ) -> Result<LeaseState> {
        let latest = storage.latest_lease_per_bot()?;
        Ok(match latest.get(bot) {
            Some(record) if record.busy && now - record.timestamp < self.usage_max => {
                LeaseState::Leased {
                    player: record.player.clone(),
                    since: record.timestamp,
                }
            }
            _ => LeaseState::Free,
        })
    }

    /// Lease a bot to a player
    ///
    /// Picks the lowest-address free bot. Fails with
    /// [`Error::BotNotFound`] when the pool is empty, when the player
    /// still holds an unexpired lease, or when every bot is taken.
    pub fn acquire(
        &mut self,
        storage: &Storage,
        player: &Address,
        now: DateTime<Utc>,
    ) -> Result<BotGrant> {
        self.refresh_pool(storage)?;
        if self.active.is_empty() {
            return Err(Error::BotNotFound("the bot pool is exhausted".to_string()));
        }

        // One bot per player: the player's most recent lease must not be
        // an unexpired grant.
        if let Some(record) = storage.latest_lease_for_player(player)? {
            if record.busy && now - record.timestamp < self.usage_max {
                return Err(Error::BotNotFound(format!(
                    "no bot available for {} because they are using bot {}",
                    player, record.bot
                )));
            }
        }

        let latest = storage.latest_lease_per_bot()?;
        let chosen = self
            .active
            .iter()
            .find(|bot| match latest.get(*bot) {
                Some(record) => !(record.busy && now - record.timestamp < self.usage_max),
                None => true,
            })
            .cloned()
            .ok_or_else(|| Error::BotNotFound("every bot is leased".to_string()))?;

        let balance = storage.balance(&chosen)?;
        let mut staged = storage.begin();
        staged.stage_lease(&chosen, player, true)?;
        staged.commit()?;

        info!(bot = %chosen, player = %player, "bot leased");
        Ok(BotGrant {
            address: chosen,
            balance,
        })
    }

    /// Check whether a transfer touching a bot is allowed
    ///
    /// Returns the lease pair to release alongside the transfer, or
    /// `None` when no active bot participates. A bot as source is
    /// additionally capped per transfer. Either side requires the pair's
    /// current lease to be at least `usage_min` and strictly less than
    /// `usage_max` old - no immediate cash-out, no stale cash-out.
    pub fn transfer_guard(
        &self,
        storage: &Storage,
        source: &Address,
        target: &Address,
        amount: u128,
        now: DateTime<Utc>,
    ) -> Result<Option<LeaseRelease>> {
        let (bot, player) = if self.is_bot(source) {
            if amount > self.transfer_max {
                return Err(Error::InsufficientFunds(format!(
                    "bot transfer of {} from {} to {} too big",
                    amount, source, target
                )));
            }
            (source, target)
        } else if self.is_bot(target) {
            (target, source)
        } else {
            return Ok(None);
        };

        let acquisition = storage
            .latest_acquisition(bot, player)?
            .ok_or_else(|| Error::BotNotFound(format!("bot {} not available for {}", bot, player)))?;
        let age = now - acquisition.timestamp;
        if age < self.usage_min || age >= self.usage_max {
            return Err(Error::BotNotFound(format!(
                "bot {} not available for {}",
                bot, player
            )));
        }

        Ok(Some(LeaseRelease {
            bot: bot.clone(),
            player: player.clone(),
        }))
    }
}
