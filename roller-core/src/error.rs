//! Error types for the accounting core

use thiserror::Error;

/// Result type for accounting operations
pub type Result<T> = std::result::Result<T, Error>;

/// Accounting errors
///
/// The first four variants are semantic outcomes of the business rules;
/// they are raised strictly before anything is committed, so a caller
/// seeing one can be sure the ledger is unchanged. The rest are
/// infrastructure failures.
#[derive(Error, Debug)]
pub enum Error {
    /// Balance or per-transfer cap violation
    #[error("Insufficient funds: {0}")]
    InsufficientFunds(String),

    /// No usable bot: empty pool, lease contention, or usage-window violation
    #[error("Bot not found: {0}")]
    BotNotFound(String),

    /// Inconsistent or duplicate deposit data from the chain collaborator
    #[error("Scan error: {0}")]
    Scan(String),

    /// Batch payments do not reconcile exactly against known debits
    #[error("Settle error: {0}")]
    Settle(String),

    /// Transient chain collaborator failure; callers may retry
    #[error("Chain error: {0}")]
    Chain(#[from] chain_client::Error),

    /// An argument did not pass validation
    #[error("Invalid argument: {0}")]
    Argument(String),

    /// Storage error (RocksDB)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rocksdb::Error> for Error {
    fn from(err: rocksdb::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl Error {
    /// Whether this error is an expected business outcome, as opposed to
    /// an infrastructure failure
    pub fn is_semantic(&self) -> bool {
        matches!(
            self,
            Error::InsufficientFunds(_)
                | Error::BotNotFound(_)
                | Error::Scan(_)
                | Error::Settle(_)
                | Error::Argument(_)
        )
    }
}
