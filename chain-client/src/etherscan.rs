//! Etherscan implementation of [`ChainSource`]
//!
//! Talks to the Etherscan HTTP API with form-encoded POST requests. Every
//! response arrives wrapped in a `{"result": ...}` envelope; anything else
//! is surfaced as an API error.

use crate::{
    error::{Error, Result},
    source::{ChainSource, Deposit, Payment},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::{error, info, warn};

const DEFAULT_API_URL: &str = "https://api-ropsten.etherscan.io/api";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Etherscan HTTP client
pub struct EtherscanClient {
    http: Client,
    api_url: String,
    api_key: String,
}

/// One entry of an `account.txlist` response
#[derive(Debug, Deserialize)]
struct TxListEntry {
    #[serde(rename = "from")]
    from_addr: String,
    to: String,
    value: String,
    #[serde(rename = "blockNumber")]
    block_number: String,
    hash: String,
    #[serde(rename = "isError")]
    is_error: String,
}

/// One entry of an `account.txlistinternal` response
#[derive(Debug, Deserialize)]
struct InternalCall {
    to: String,
    value: String,
}

/// The interesting fields of `proxy.eth_getTransactionByHash`
#[derive(Debug, Deserialize)]
struct TransactionByHash {
    #[serde(rename = "from")]
    from_addr: String,
}

impl EtherscanClient {
    /// Create a client against the default API endpoint
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_api_url(DEFAULT_API_URL, api_key)
    }

    /// Create a client against a specific API endpoint
    pub fn with_api_url(api_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        let http = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent("Mozilla/5.0")
            .build()
            .unwrap_or_default();

        Self {
            http,
            api_url: api_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Call the API and return the parsed `result` field
    async fn call(&self, module: &str, action: &str, params: &[(&str, String)]) -> Result<Value> {
        let mut form: Vec<(&str, String)> = vec![
            ("apikey", self.api_key.clone()),
            ("module", module.to_string()),
            ("action", action.to_string()),
        ];
        form.extend(params.iter().cloned());

        let response = self.http.post(&self.api_url).form(&form).send().await?;
        let mut body: Value = response.json().await.map_err(|err| {
            error!(module, action, %err, "etherscan returned unparsable body");
            Error::api(module, action, "response body is not JSON")
        })?;

        match body.get_mut("result") {
            Some(result) => Ok(result.take()),
            None => {
                error!(module, action, %body, "etherscan response has no result");
                Err(Error::api(module, action, "response has no result field"))
            }
        }
    }
}

#[async_trait]
impl ChainSource for EtherscanClient {
    async fn latest_block_number(&self) -> Result<u64> {
        let result = self.call("proxy", "eth_blockNumber", &[]).await?;
        let block_number_hex = result
            .as_str()
            .ok_or_else(|| Error::BadResponse("block number is not a string".to_string()))?;
        parse_hex_quantity(block_number_hex)
            .map_err(|_| Error::BadResponse(format!("bad block number {block_number_hex}")))
    }

    async fn deposits(
        &self,
        address: &str,
        start_block: u64,
        end_block: u64,
    ) -> Result<Vec<Deposit>> {
        info!(start_block, end_block, "scanning for deposits");
        let result = self
            .call(
                "account",
                "txlist",
                &[
                    ("address", format!("0x{address}")),
                    ("startblock", start_block.to_string()),
                    ("endblock", end_block.to_string()),
                    ("sort", "asc".to_string()),
                ],
            )
            .await?;

        let entries: Vec<TxListEntry> = serde_json::from_value(result)
            .map_err(|err| Error::BadResponse(format!("bad txlist entry: {err}")))?;

        let watched = format!("0x{}", address.to_lowercase());
        let mut deposits = Vec::new();
        for entry in entries {
            if entry.to.to_lowercase() != watched || entry.is_error != "0" {
                continue;
            }
            let amount_wei: u128 = entry
                .value
                .parse()
                .map_err(|_| Error::BadResponse(format!("bad transaction value {}", entry.value)))?;
            if amount_wei == 0 {
                continue;
            }
            deposits.push(Deposit {
                source: strip_0x(&entry.from_addr).to_lowercase(),
                amount_wei,
                block_number: entry
                    .block_number
                    .parse()
                    .map_err(|_| {
                        Error::BadResponse(format!("bad block number {}", entry.block_number))
                    })?,
                tx: strip_0x(&entry.hash).to_lowercase(),
            });
        }
        Ok(deposits)
    }

    async fn payments(&self, address: &str, batch_tx: &str) -> Result<Vec<Payment>> {
        let txhash = format!("0x{batch_tx}");
        let result = self
            .call(
                "proxy",
                "eth_getTransactionByHash",
                &[("txhash", txhash.clone())],
            )
            .await?;
        let transaction: TransactionByHash = serde_json::from_value(result)
            .map_err(|err| Error::BadResponse(format!("bad transaction: {err}")))?;

        if transaction.from_addr.to_lowercase() != format!("0x{}", address.to_lowercase()) {
            warn!(
                sender = %transaction.from_addr,
                expected = %address,
                "batch transaction sender mismatch"
            );
            return Ok(Vec::new());
        }

        let result = self
            .call("account", "txlistinternal", &[("txhash", txhash)])
            .await?;
        let calls: Vec<InternalCall> = serde_json::from_value(result)
            .map_err(|err| Error::BadResponse(format!("bad internal call: {err}")))?;

        calls
            .into_iter()
            .map(|call| {
                Ok(Payment {
                    address: strip_0x(&call.to).to_lowercase(),
                    amount_wei: call.value.parse().map_err(|_| {
                        Error::BadResponse(format!("bad internal call value {}", call.value))
                    })?,
                })
            })
            .collect()
    }
}

fn strip_0x(hex: &str) -> &str {
    hex.strip_prefix("0x").unwrap_or(hex)
}

fn parse_hex_quantity(hex: &str) -> std::result::Result<u64, std::num::ParseIntError> {
    u64::from_str_radix(strip_0x(hex), 16)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_quantity() {
        assert_eq!(parse_hex_quantity("0x10").unwrap(), 16);
        assert_eq!(parse_hex_quantity("ff").unwrap(), 255);
        assert!(parse_hex_quantity("0xzz").is_err());
    }

    #[test]
    fn test_strip_0x() {
        assert_eq!(strip_0x("0xabc"), "abc");
        assert_eq!(strip_0x("abc"), "abc");
    }

    #[test]
    fn test_txlist_entry_parses() {
        let entry: TxListEntry = serde_json::from_value(serde_json::json!({
            "from": "0xAA00000000000000000000000000000000000001",
            "to": "0xbb00000000000000000000000000000000000002",
            "value": "200000000000000",
            "blockNumber": "1234",
            "hash": "0xdeadbeef",
            "isError": "0",
        }))
        .unwrap();
        assert_eq!(entry.block_number, "1234");
        assert_eq!(entry.is_error, "0");
        assert_eq!(entry.value.parse::<u128>().unwrap(), 200_000_000_000_000);
    }
}
