//! Minimal Ethereum JSON-RPC 2.0 client over HTTP.

use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU64, Ordering};

use super::http::{HttpSettings, VenueHttp};
use crate::error::FetchError;

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i64,
    message: String,
}

pub struct EthereumRpc {
    http: VenueHttp,
    rpc_url: String,
    next_id: AtomicU64,
}

impl EthereumRpc {
    pub fn new(venue: &'static str, rpc_url: &str, settings: HttpSettings) -> Result<Self, FetchError> {
        Ok(Self {
            http: VenueHttp::new(venue, settings)?,
            rpc_url: rpc_url.to_string(),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn settings(&self) -> &HttpSettings {
        self.http.settings()
    }

    /// `eth_blockNumber`
    pub async fn block_number(&self) -> Result<u64, FetchError> {
        let result = self.call("eth_blockNumber", json!([])).await?;
        result
            .as_str()
            .and_then(parse_quantity)
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| self.malformed(format!("eth_blockNumber returned {}", result)))
    }

    /// `eth_getBlockByNumber(n, true)`: the block with full transaction objects.
    pub async fn get_block(&self, number: u64) -> Result<Value, FetchError> {
        let result = self
            .call("eth_getBlockByNumber", json!([to_quantity(number), true]))
            .await?;
        if result.is_null() {
            return Err(self.malformed(format!("block {} not found", number)));
        }
        Ok(result)
    }

    /// `eth_getTransactionReceipt`
    pub async fn get_receipt(&self, tx_hash: &str) -> Result<Value, FetchError> {
        let result = self
            .call("eth_getTransactionReceipt", json!([tx_hash]))
            .await?;
        if result.is_null() {
            return Err(self.malformed(format!("no receipt for {}", tx_hash)));
        }
        Ok(result)
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, FetchError> {
        let payload = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": self.next_id.fetch_add(1, Ordering::Relaxed),
        });

        let response = self
            .http
            .send(&self.rpc_url, |client| Ok(client.post(&self.rpc_url).json(&payload)))
            .await?;
        let response: JsonRpcResponse = self.http.json(response).await?;

        if let Some(err) = response.error {
            return Err(self.malformed(format!(
                "{} failed: {} (code {})",
                method, err.message, err.code
            )));
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    fn malformed(&self, reason: String) -> FetchError {
        FetchError::malformed(self.http.venue(), reason)
    }
}

/// Decode a hex `QUANTITY` (`0x1b4`).
pub fn parse_quantity(s: &str) -> Option<u128> {
    let digits = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X"))?;
    if digits.is_empty() {
        return None;
    }
    u128::from_str_radix(digits, 16).ok()
}

pub fn to_quantity(n: u64) -> String {
    format!("{:#x}", n)
}
