//! Error types for the chain client

use thiserror::Error;

/// Result type for chain data operations
pub type Result<T> = std::result::Result<T, Error>;

/// Chain client errors
///
/// All variants are transient collaborator failures, distinct from the
/// semantic errors of the accounting core; callers may retry.
#[derive(Error, Debug)]
pub enum Error {
    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered, but not with a usable result
    #[error("API error calling {module}.{action}: {message}")]
    Api {
        /// API module that was called
        module: String,
        /// API action that was called
        action: String,
        /// What went wrong
        message: String,
    },

    /// A response field could not be parsed
    #[error("Bad response: {0}")]
    BadResponse(String),
}

impl Error {
    pub(crate) fn api(module: &str, action: &str, message: impl Into<String>) -> Self {
        Error::Api {
            module: module.to_string(),
            action: action.to_string(),
            message: message.into(),
        }
    }
}
