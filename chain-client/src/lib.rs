//! Blockchain data source for the roller-balance ledger
//!
//! The accounting core never talks to the chain directly; it consumes the
//! [`ChainSource`] trait defined here. Two implementations are provided:
//!
//! - [`EtherscanClient`] - production client against the Etherscan HTTP API
//! - [`MockChain`] - in-memory implementation for tests and demos
//!
//! All amounts cross this boundary in the smallest native unit (wei);
//! conversion to roller units is the core's concern.

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, unused_qualifications)]

pub mod error;
pub mod etherscan;
pub mod mock;
pub mod source;

// Re-exports
pub use error::{Error, Result};
pub use etherscan::EtherscanClient;
pub use mock::MockChain;
pub use source::{ChainSource, Deposit, Payment};
