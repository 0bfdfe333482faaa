//! Ethereum venue
//!
//! Scans a block range over JSON-RPC and archives every transaction sent from
//! or to one of the configured addresses, together with its receipt.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, StreamExt, TryStreamExt};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info};

use super::ethereum_rpc::{parse_quantity, EthereumRpc};
use super::http::HttpSettings;
use super::{owned_kind, vocabulary, Venue};
use crate::envelope::{Envelope, Kind, Meta, VenueKind};
use crate::error::{FetchError, UnparseableEnvelope};
use crate::ledger::{LedgerEntry, Posting, RawFields, TRANSFER_ACCOUNT};

pub const VENUE: &str = "ethereum";

const ETH: &str = "ETH";
const WEI_SCALE: u32 = 18;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EthereumKind {
    Transaction,
}

impl VenueKind for EthereumKind {
    const VENUE: &'static str = VENUE;
    const ALL: &'static [Self] = &[Self::Transaction];

    fn as_str(self) -> &'static str {
        match self {
            Self::Transaction => "transaction",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EthereumConfig {
    pub rpc_url: String,

    /// Watched addresses; matched case-insensitively.
    pub addresses: Vec<String>,

    pub start_block: u64,

    /// Inclusive. Defaults to the chain head at fetch time.
    #[serde(default)]
    pub end_block: Option<u64>,

    #[serde(default = "default_account_prefix")]
    pub account_prefix: String,

    #[serde(default = "default_expenses_prefix")]
    pub expenses_prefix: String,
}

pub fn default_account_prefix() -> String {
    "Assets:Ethereum".to_string()
}

pub fn default_expenses_prefix() -> String {
    "Expenses:Fees:Ethereum".to_string()
}

pub struct EthereumVenue {
    config: EthereumConfig,
    addresses: HashSet<String>,
    rpc: EthereumRpc,
}

impl EthereumVenue {
    pub fn new(config: EthereumConfig, http: HttpSettings) -> Result<Self, FetchError> {
        let rpc = EthereumRpc::new(VENUE, &config.rpc_url, http)?;
        let addresses = config
            .addresses
            .iter()
            .map(|a| a.to_ascii_lowercase())
            .collect();
        Ok(Self {
            config,
            addresses,
            rpc,
        })
    }

    fn is_ours(&self, address: Option<&str>) -> bool {
        address
            .map(|a| self.addresses.contains(&a.to_ascii_lowercase()))
            .unwrap_or(false)
    }

    /// Matching transactions of one block, each paired with its receipt.
    async fn scan_block(&self, number: u64) -> Result<Vec<Envelope>, FetchError> {
        let block = self.rpc.get_block(number).await?;
        let timestamp = block_timestamp(&block)?;

        let transactions = block
            .get("transactions")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::malformed(VENUE, format!("block {} has no transactions", number)))?;

        let mut out = Vec::new();
        for tx in transactions {
            let from = tx.get("from").and_then(Value::as_str);
            let to = tx.get("to").and_then(Value::as_str);
            if !self.is_ours(from) && !self.is_ours(to) {
                continue;
            }

            let hash = tx
                .get("hash")
                .and_then(Value::as_str)
                .ok_or_else(|| FetchError::malformed(VENUE, format!("transaction without hash in block {}", number)))?;
            let receipt = self.rpc.get_receipt(hash).await?;
            debug!(block = number, tx = hash, "matched transaction");

            let mut meta = Meta::new();
            meta.insert("tx_hash".to_string(), hash.to_string());
            meta.insert("block_number".to_string(), number.to_string());

            out.push(Envelope::new(
                EthereumKind::Transaction,
                timestamp,
                json!({ "transaction": tx, "receipt": receipt }),
                Some(meta),
            ));
        }
        Ok(out)
    }

    fn account(&self, address: &str) -> String {
        format!("{}:{}", self.config.account_prefix, address.to_ascii_lowercase())
    }
}

#[async_trait]
impl Venue for EthereumVenue {
    fn id(&self) -> &'static str {
        VENUE
    }

    fn kinds(&self) -> Vec<Kind> {
        vocabulary::<EthereumKind>()
    }

    async fn fetch(&self) -> Result<Vec<Envelope>, FetchError> {
        let end = match self.config.end_block {
            Some(end) => end,
            None => self.rpc.block_number().await?,
        };
        let start = self.config.start_block;
        if start > end {
            info!(venue = VENUE, start, end, "start block is past the chain head, nothing to scan");
            return Ok(Vec::new());
        }

        let blocks: Vec<Vec<Envelope>> = stream::iter(start..=end)
            .map(|number| self.scan_block(number))
            .buffered(self.rpc.settings().concurrency())
            .try_collect()
            .await?;

        let out: Vec<Envelope> = blocks.into_iter().flatten().collect();
        info!(venue = VENUE, start, end, transactions = out.len(), "fetch complete");
        Ok(out)
    }

    fn parse(&self, envelope: &Envelope) -> Result<LedgerEntry, UnparseableEnvelope> {
        owned_kind::<EthereumKind>(envelope)?;
        let f = RawFields::new(envelope);

        let hash = f.str("transaction.hash")?;
        let from = f.str("transaction.from")?;
        let to = f.opt_str("transaction.to");
        let value = wei(&f, "transaction.value")?;

        let from_ours = self.is_ours(Some(from));
        let to_ours = self.is_ours(to);
        if !from_ours && !to_ours {
            return Err(f.unparseable("transaction involves no configured address"));
        }

        let narration = if from_ours {
            format!(
                "send {} ETH to {}",
                value.normalize(),
                to.unwrap_or("contract creation")
            )
        } else {
            format!("receive {} ETH from {}", value.normalize(), from)
        };
        let mut entry = LedgerEntry::new(envelope, narration).with_meta("tx_hash", hash);

        if !value.is_zero() {
            entry = entry.post(Posting::new(
                if from_ours { self.account(from) } else { TRANSFER_ACCOUNT.to_string() },
                -value,
                ETH,
            ));
            entry = entry.post(Posting::new(
                match to {
                    Some(to) if to_ours => self.account(to),
                    _ => TRANSFER_ACCOUNT.to_string(),
                },
                value,
                ETH,
            ));
        }

        // the sender pays gas
        if from_ours {
            let gas_used = quantity(&f, "receipt.gasUsed")?;
            let gas_price = match f.opt_str("receipt.effectiveGasPrice") {
                Some(_) => quantity(&f, "receipt.effectiveGasPrice")?,
                None => quantity(&f, "transaction.gasPrice")?,
            };
            let fee = gas_used
                .checked_mul(gas_price)
                .and_then(wei_to_eth)
                .ok_or_else(|| f.unparseable("gas fee out of range"))?;
            if !fee.is_zero() {
                entry = entry
                    .post(Posting::new(self.account(from), -fee, ETH))
                    .post(Posting::new(self.config.expenses_prefix.clone(), fee, ETH));
            }
        }

        if let Some(block) = f.opt_str("transaction.blockNumber").and_then(parse_quantity) {
            entry = entry.with_meta("block_number", block.to_string());
        }
        Ok(entry)
    }
}

fn block_timestamp(block: &Value) -> Result<DateTime<Utc>, FetchError> {
    block
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_quantity)
        .and_then(|secs| i64::try_from(secs).ok())
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
        .ok_or_else(|| FetchError::malformed(VENUE, "block without a valid timestamp"))
}

fn quantity(f: &RawFields<'_>, path: &str) -> Result<u128, UnparseableEnvelope> {
    let raw = f.str(path)?;
    parse_quantity(raw).ok_or_else(|| f.unparseable(format!("`{}` is not a hex quantity: {}", path, raw)))
}

fn wei(f: &RawFields<'_>, path: &str) -> Result<Decimal, UnparseableEnvelope> {
    quantity(f, path).and_then(|w| {
        wei_to_eth(w).ok_or_else(|| f.unparseable(format!("`{}` out of range", path)))
    })
}

fn wei_to_eth(wei: u128) -> Option<Decimal> {
    let wei = i128::try_from(wei).ok()?;
    Decimal::try_from_i128_with_scale(wei, WEI_SCALE).ok()
}
