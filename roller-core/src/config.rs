//! Configuration for the accounting core

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::types::Address;

/// Accounting core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Data directory for RocksDB
    pub data_dir: PathBuf,

    /// The custodial aggregation address
    pub safe_address: Address,

    /// Fixed pool of house-funded bot addresses
    pub bots: Vec<Address>,

    /// Wei per roller on deposit (1/1000 ether buys one roller)
    pub wei_deposit_per_roller: u64,

    /// Wei per roller on withdrawal
    pub wei_withdraw_per_roller: u64,

    /// Confirmation depth before deposit blocks are acted on
    pub required_block_depth: u64,

    /// Rollers each bot is funded with at bootstrap
    pub bot_initial_fund: u64,

    /// Per-transfer cap on amounts leaving a bot
    pub bot_transfer_max: u64,

    /// Minimum lease age before a bot may participate in a transfer
    pub bot_usage_min_secs: u64,

    /// Maximum lease age; beyond it the lease is stale
    pub bot_usage_max_secs: u64,

    /// Minimum debit age before it is eligible for settlement
    pub settlement_grace_secs: u64,

    /// RocksDB configuration
    pub rocksdb: RocksDbConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data/roller"),
            safe_address: Address::new("0".repeat(40)).expect("static address"),
            bots: vec![
                // The three initial house bots.
                Address::new("dD2FD4581271e230360230F9337D5c0430Bf44C0").expect("static address"),
                Address::new("9873b417A5276ac533B51238C8E314BCCced2a1F").expect("static address"),
                Address::new("53993b1a1c6FB4714e9D02FaF9c72a0118e2F9FE").expect("static address"),
            ],
            wei_deposit_per_roller: 100_000_000_000_000, // 1/1000 ether
            wei_withdraw_per_roller: 70_000_000_000_000, // 7/10000 ether
            required_block_depth: 10,
            bot_initial_fund: 1_000,
            bot_transfer_max: 50,
            bot_usage_min_secs: 10,
            bot_usage_max_secs: 600,
            settlement_grace_secs: 0,
            rocksdb: RocksDbConfig::default(),
        }
    }
}

/// RocksDB configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RocksDbConfig {
    /// Write buffer size (MB)
    pub write_buffer_size_mb: usize,

    /// Max write buffers
    pub max_write_buffer_number: i32,

    /// Max background jobs (compaction + flush)
    pub max_background_jobs: i32,
}

impl Default for RocksDbConfig {
    fn default() -> Self {
        Self {
            write_buffer_size_mb: 64,
            max_write_buffer_number: 4,
            max_background_jobs: 4,
        }
    }
}

impl Config {
    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("ROLLER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(safe) = std::env::var("ROLLER_SAFE_ADDRESS") {
            config.safe_address = Address::new(safe)?;
        }

        if let Ok(bots) = std::env::var("ROLLER_BOTS") {
            config.bots = bots
                .split(',')
                .map(Address::new)
                .collect::<crate::Result<Vec<_>>>()?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the core cannot run with
    pub fn validate(&self) -> crate::Result<()> {
        if self.wei_deposit_per_roller == 0 || self.wei_withdraw_per_roller == 0 {
            return Err(crate::Error::Config(
                "conversion divisors must be positive".to_string(),
            ));
        }
        if self.bot_usage_min_secs >= self.bot_usage_max_secs {
            return Err(crate::Error::Config(
                "bot usage window is empty".to_string(),
            ));
        }
        if self.bots.contains(&self.safe_address) {
            return Err(crate::Error::Config(
                "the safe cannot be a bot".to_string(),
            ));
        }
        Ok(())
    }

    /// Minimum lease age as a duration
    pub fn bot_usage_min(&self) -> Duration {
        Duration::from_secs(self.bot_usage_min_secs)
    }

    /// Maximum lease age as a duration
    pub fn bot_usage_max(&self) -> Duration {
        Duration::from_secs(self.bot_usage_max_secs)
    }

    /// Settlement grace period as a duration
    pub fn settlement_grace(&self) -> Duration {
        Duration::from_secs(self.settlement_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bots.len(), 3);
        assert_eq!(config.wei_deposit_per_roller, 100_000_000_000_000);
        assert_eq!(config.required_block_depth, 10);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_bots_are_canonical() {
        let config = Config::default();
        for bot in &config.bots {
            assert_eq!(bot.as_str(), bot.as_str().to_lowercase());
        }
    }

    #[test]
    fn test_rejects_empty_usage_window() {
        let mut config = Config::default();
        config.bot_usage_min_secs = config.bot_usage_max_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_round_trip() {
        let config = Config::default();
        let raw = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.safe_address, config.safe_address);
        assert_eq!(parsed.bots, config.bots);
    }
}
