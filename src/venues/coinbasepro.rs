//! Coinbase Pro venue
//!
//! Fetch merges two independent sub-fetches: fills per product and ledger
//! transfers per account. Both fan out with bounded concurrency and are
//! merged back in product/account order.

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::coinbasepro_api::{Account, CoinbaseProClient, Product, DEFAULT_API_URL};
use super::http::HttpSettings;
use super::{owned_kind, vocabulary, Venue};
use crate::envelope::{parse_timestamp, Envelope, Kind, Meta, VenueKind};
use crate::error::{FetchError, UnparseableEnvelope};
use crate::ledger::{LedgerEntry, Posting, RawFields, TRANSFER_ACCOUNT};

pub const VENUE: &str = "coinbasepro";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoinbaseProKind {
    Fill,
    Deposit,
    Withdraw,
}

impl VenueKind for CoinbaseProKind {
    const VENUE: &'static str = VENUE;
    const ALL: &'static [Self] = &[Self::Fill, Self::Deposit, Self::Withdraw];

    fn as_str(self) -> &'static str {
        match self {
            Self::Fill => "fill",
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinbaseProConfig {
    #[serde(default)]
    pub api_key: String,

    /// Base64 secret as issued by the exchange.
    #[serde(default)]
    pub api_secret: String,

    #[serde(default)]
    pub api_passphrase: String,

    pub assets_prefix: String,

    pub expenses_prefix: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,
}

pub fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

pub struct CoinbaseProVenue {
    config: CoinbaseProConfig,
    client: CoinbaseProClient,
}

impl CoinbaseProVenue {
    pub fn new(config: CoinbaseProConfig, http: HttpSettings) -> Result<Self, FetchError> {
        let client = CoinbaseProClient::new(
            VENUE,
            &config.api_url,
            &config.api_key,
            &config.api_secret,
            &config.api_passphrase,
            http,
        )?;
        Ok(Self { config, client })
    }

    async fn fills(&self, products: &[Product]) -> Result<Vec<Envelope>, FetchError> {
        let per_product: Vec<Vec<Envelope>> = stream::iter(products.to_vec())
            .map(|product| async move {
                let fills = self.client.get_fills(&product.id).await?;
                debug!(product = %product.id, count = fills.len(), "fetched fills");
                fills.into_iter().map(fill_envelope).collect::<Result<Vec<_>, FetchError>>()
            })
            .buffered(self.client.settings().concurrency())
            .try_collect()
            .await?;
        Ok(per_product.into_iter().flatten().collect())
    }

    async fn transfers(&self, accounts: &[Account]) -> Result<Vec<Envelope>, FetchError> {
        let per_account: Vec<Vec<Envelope>> = stream::iter(accounts.to_vec())
            .map(|account| async move {
                let history = self.client.get_account_history(&account.id).await?;
                let mut out = Vec::new();
                for entry in history {
                    if let Some(env) = transfer_envelope(entry, &account)? {
                        out.push(env);
                    }
                }
                debug!(account = %account.id, count = out.len(), "fetched transfers");
                Ok::<_, FetchError>(out)
            })
            .buffered(self.client.settings().concurrency())
            .try_collect()
            .await?;
        Ok(per_account.into_iter().flatten().collect())
    }

    fn parse_fill(&self, envelope: &Envelope) -> Result<LedgerEntry, UnparseableEnvelope> {
        let f = RawFields::new(envelope);
        let product_id = f.str("product_id")?;
        let (base, quote) = product_id
            .split_once('-')
            .ok_or_else(|| f.unparseable(format!("product_id `{}` is not BASE-QUOTE", product_id)))?;
        let price = f.decimal("price")?;
        let size = f.decimal("size")?;
        let fee = f.decimal("fee")?;
        let side = f.str("side")?;

        let notional = price * size;
        let (base_amount, quote_amount) = match side {
            "buy" => (size, -(notional + fee)),
            "sell" => (-size, notional - fee),
            other => return Err(f.unparseable(format!("unknown side `{}`", other))),
        };

        let mut entry = LedgerEntry::new(
            envelope,
            format!("{} {} {} @ {} {}", side, size.normalize(), base, price.normalize(), quote),
        )
        .post(
            Posting::new(self.asset_account(base), base_amount, base).at_price(price, quote),
        )
        .post(Posting::new(self.asset_account(quote), quote_amount, quote));

        if !fee.is_zero() {
            entry = entry.post(Posting::new(self.expense_account(quote), fee, quote));
        }
        if let Some(trade_id) = f.get("trade_id") {
            entry = entry.with_meta("trade_id", json_scalar(trade_id));
        }
        if let Some(order_id) = f.opt_str("order_id") {
            entry = entry.with_meta("order_id", order_id);
        }
        Ok(entry)
    }

    fn parse_transfer(
        &self,
        envelope: &Envelope,
        kind: CoinbaseProKind,
    ) -> Result<LedgerEntry, UnparseableEnvelope> {
        let f = RawFields::new(envelope);
        let amount = f.decimal("entry.amount")?;
        let currency = f.str("account.currency")?;

        // ledger amounts are signed; normalise in case the venue reports magnitudes
        let amount = match kind {
            CoinbaseProKind::Withdraw => -amount.abs(),
            _ => amount.abs(),
        };

        let mut entry = LedgerEntry::new(
            envelope,
            format!("{} {} {}", kind.as_str(), amount.abs().normalize(), currency),
        )
        .post(Posting::new(self.asset_account(currency), amount, currency))
        .post(Posting::new(TRANSFER_ACCOUNT, -amount, currency));

        if let Some(id) = f.opt_str("entry.details.transfer_id") {
            entry = entry.with_meta("transfer_id", id);
        }
        if let Some(account_id) = f.opt_str("account.id") {
            entry = entry.with_meta("account_id", account_id);
        }
        Ok(entry)
    }

    fn asset_account(&self, currency: &str) -> String {
        format!("{}:{}", self.config.assets_prefix, currency)
    }

    fn expense_account(&self, currency: &str) -> String {
        format!("{}:{}", self.config.expenses_prefix, currency)
    }
}

#[async_trait]
impl Venue for CoinbaseProVenue {
    fn id(&self) -> &'static str {
        VENUE
    }

    fn kinds(&self) -> Vec<Kind> {
        vocabulary::<CoinbaseProKind>()
    }

    async fn fetch(&self) -> Result<Vec<Envelope>, FetchError> {
        let products = self.client.get_products().await?;
        let accounts = self.client.get_accounts().await?;

        let (fills, transfers) =
            futures_util::try_join!(self.fills(&products), self.transfers(&accounts))?;

        info!(
            venue = VENUE,
            products = products.len(),
            accounts = accounts.len(),
            fills = fills.len(),
            transfers = transfers.len(),
            "fetch complete"
        );

        let mut out = fills;
        out.extend(transfers);
        Ok(out)
    }

    fn parse(&self, envelope: &Envelope) -> Result<LedgerEntry, UnparseableEnvelope> {
        match owned_kind::<CoinbaseProKind>(envelope)? {
            CoinbaseProKind::Fill => self.parse_fill(envelope),
            kind => self.parse_transfer(envelope, kind),
        }
    }
}

// =============================================================================
// NORMALIZATION
// =============================================================================

fn fill_envelope(fill: Value) -> Result<Envelope, FetchError> {
    let timestamp = created_at(&fill)?;
    Ok(Envelope::new(CoinbaseProKind::Fill, timestamp, fill, None))
}

/// Ledger entries other than transfers (match, fee, rebate, ...) are skipped.
///
/// A ledger entry does not name its account or currency, so the raw payload
/// pairs it with the account it was listed under.
fn transfer_envelope(entry: Value, account: &Account) -> Result<Option<Envelope>, FetchError> {
    if entry.get("type").and_then(Value::as_str) != Some("transfer") {
        return Ok(None);
    }

    let transfer_type = entry
        .pointer("/details/transfer_type")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::malformed(VENUE, "transfer without details.transfer_type"))?;
    let kind = CoinbaseProKind::from_name(transfer_type)
        .filter(|k| *k != CoinbaseProKind::Fill)
        .ok_or_else(|| {
            FetchError::malformed(VENUE, format!("unknown transfer_type `{}`", transfer_type))
        })?;

    let timestamp = created_at(&entry)?;
    let mut meta = Meta::new();
    meta.insert("account_id".to_string(), account.id.clone());
    meta.insert("currency".to_string(), account.currency.clone());

    let raw = json!({
        "account": {"id": account.id, "currency": account.currency},
        "entry": entry,
    });
    Ok(Some(Envelope::new(kind, timestamp, raw, Some(meta))))
}

fn created_at(value: &Value) -> Result<chrono::DateTime<chrono::Utc>, FetchError> {
    let raw = value
        .get("created_at")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::malformed(VENUE, "record without created_at"))?;
    parse_timestamp(raw)
        .ok_or_else(|| FetchError::malformed(VENUE, format!("unparseable created_at `{}`", raw)))
}

fn json_scalar(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
