//! Coinbase (retail) venue

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::coinbase_api::{Account, CoinbaseClient, DEFAULT_API_URL, RESOURCES};
use super::http::HttpSettings;
use super::{owned_kind, vocabulary, Venue};
use crate::envelope::{parse_timestamp, Envelope, Kind, Meta, VenueKind};
use crate::error::{FetchError, UnparseableEnvelope};
use crate::ledger::{LedgerEntry, Posting, RawFields, TRANSFER_ACCOUNT};

pub const VENUE: &str = "coinbase";

const FEES_ACCOUNT: &str = "Expenses:Fees:Coinbase";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CoinbaseKind {
    Buy,
    Sell,
    Deposit,
    Withdrawal,
}

impl CoinbaseKind {
    /// Kind of the records returned by a per-account list endpoint.
    fn for_resource(resource: &str) -> Option<Self> {
        match resource {
            "buys" => Some(Self::Buy),
            "sells" => Some(Self::Sell),
            "deposits" => Some(Self::Deposit),
            "withdrawals" => Some(Self::Withdrawal),
            _ => None,
        }
    }
}

impl VenueKind for CoinbaseKind {
    const VENUE: &'static str = VENUE;
    const ALL: &'static [Self] = &[Self::Buy, Self::Sell, Self::Deposit, Self::Withdrawal];

    fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "buy",
            Self::Sell => "sell",
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoinbaseConfig {
    #[serde(default)]
    pub api_key: String,

    #[serde(default)]
    pub api_secret: String,

    /// Accounts are named `{account_prefix}:{CURRENCY}`.
    pub account_prefix: String,

    #[serde(default = "default_api_url")]
    pub api_url: String,
}

pub fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

pub struct CoinbaseVenue {
    config: CoinbaseConfig,
    client: CoinbaseClient,
}

impl CoinbaseVenue {
    pub fn new(config: CoinbaseConfig, http: HttpSettings) -> Result<Self, FetchError> {
        let client = CoinbaseClient::new(
            VENUE,
            &config.api_url,
            &config.api_key,
            &config.api_secret,
            http,
        )?;
        Ok(Self { config, client })
    }

    fn account(&self, currency: &str) -> String {
        format!("{}:{}", self.config.account_prefix, currency)
    }

    fn parse_trade(
        &self,
        envelope: &Envelope,
        kind: CoinbaseKind,
    ) -> Result<LedgerEntry, UnparseableEnvelope> {
        let f = RawFields::new(envelope);
        let amount = f.decimal("amount.amount")?.abs();
        let asset = f.str("amount.currency")?;
        let total = f.decimal("total.amount")?.abs();
        let quote = f.str("total.currency")?;
        let fee = f.opt_decimal("fee.amount")?.unwrap_or_default().abs();

        if amount.is_zero() {
            return Err(f.unparseable("zero `amount.amount`"));
        }

        // buys pay total = subtotal + fee; sells receive total = subtotal - fee
        let (asset_amount, quote_amount, subtotal) = match kind {
            CoinbaseKind::Buy => (amount, -total, total - fee),
            _ => (-amount, total, total + fee),
        };
        let price = (subtotal / amount).round_dp(8);

        let mut entry = LedgerEntry::new(
            envelope,
            format!("{} {} {}", kind.as_str(), amount.normalize(), asset),
        )
        .post(Posting::new(self.account(asset), asset_amount, asset).at_price(price, quote))
        .post(Posting::new(self.account(quote), quote_amount, quote));

        if !fee.is_zero() {
            entry = entry.post(Posting::new(FEES_ACCOUNT, fee, quote));
        }
        Ok(with_transaction_id(entry, &f))
    }

    fn parse_transfer(
        &self,
        envelope: &Envelope,
        kind: CoinbaseKind,
    ) -> Result<LedgerEntry, UnparseableEnvelope> {
        let f = RawFields::new(envelope);
        let amount = f.decimal("amount.amount")?.abs();
        let currency = f.str("amount.currency")?;
        let fee = f.opt_decimal("fee.amount")?.unwrap_or_default().abs();
        let fee_currency = f.opt_str("fee.currency").unwrap_or(currency);

        let signed = match kind {
            CoinbaseKind::Withdrawal => -amount,
            _ => amount,
        };

        let mut entry = LedgerEntry::new(
            envelope,
            format!("{} {} {}", kind.as_str(), amount.normalize(), currency),
        )
        .post(Posting::new(self.account(currency), signed, currency))
        .post(Posting::new(TRANSFER_ACCOUNT, -signed, currency));

        if !fee.is_zero() {
            entry = entry
                .post(Posting::new(self.account(fee_currency), -fee, fee_currency))
                .post(Posting::new(FEES_ACCOUNT, fee, fee_currency));
        }
        Ok(with_transaction_id(entry, &f))
    }
}

fn with_transaction_id(mut entry: LedgerEntry, f: &RawFields<'_>) -> LedgerEntry {
    if let Some(id) = f.opt_str("id") {
        entry = entry.with_meta("transaction_id", id);
    }
    entry
}

#[async_trait]
impl Venue for CoinbaseVenue {
    fn id(&self) -> &'static str {
        VENUE
    }

    fn kinds(&self) -> Vec<Kind> {
        vocabulary::<CoinbaseKind>()
    }

    async fn fetch(&self) -> Result<Vec<Envelope>, FetchError> {
        let accounts = self.client.get_accounts().await?;

        let jobs: Vec<(Account, &'static str)> = accounts
            .iter()
            .flat_map(|account| RESOURCES.iter().map(move |resource| (account.clone(), *resource)))
            .collect();

        let fetches: Vec<_> = jobs
            .into_iter()
            .map(|(account, resource)| {
                async move {
                    let records = self.client.get_transactions(&account.id, resource).await?;
                    debug!(account = %account.id, resource, count = records.len(), "fetched");
                    records
                        .into_iter()
                        .map(|record| transaction_envelope(record, resource, &account))
                        .collect::<Result<Vec<_>, FetchError>>()
                }
                .boxed()
            })
            .collect();

        let batches: Vec<Vec<Envelope>> = stream::iter(fetches)
            .buffered(self.client.settings().concurrency())
            .try_collect()
            .await?;

        let out: Vec<Envelope> = batches.into_iter().flatten().collect();
        info!(venue = VENUE, accounts = accounts.len(), envelopes = out.len(), "fetch complete");
        Ok(out)
    }

    fn parse(&self, envelope: &Envelope) -> Result<LedgerEntry, UnparseableEnvelope> {
        match owned_kind::<CoinbaseKind>(envelope)? {
            kind @ (CoinbaseKind::Buy | CoinbaseKind::Sell) => self.parse_trade(envelope, kind),
            kind => self.parse_transfer(envelope, kind),
        }
    }
}

fn transaction_envelope(
    record: Value,
    resource: &str,
    account: &Account,
) -> Result<Envelope, FetchError> {
    let kind = CoinbaseKind::for_resource(resource)
        .ok_or_else(|| FetchError::malformed(VENUE, format!("unknown resource `{}`", resource)))?;
    let created_at = record
        .get("created_at")
        .and_then(Value::as_str)
        .ok_or_else(|| FetchError::malformed(VENUE, format!("{} without created_at", resource)))?;
    let timestamp = parse_timestamp(created_at).ok_or_else(|| {
        FetchError::malformed(VENUE, format!("unparseable created_at `{}`", created_at))
    })?;

    let mut meta = Meta::new();
    meta.insert("account_id".to_string(), account.id.clone());
    meta.insert("currency".to_string(), account.currency.clone());

    Ok(Envelope::new(kind, timestamp, record, Some(meta)))
}

#[cfg(test)]
mod tests {
    use super::super::http::stub::{Reply, StubServer};
    use super::*;
    use rust_decimal::Decimal;
    use serde_json::json;

    fn venue() -> CoinbaseVenue {
        CoinbaseVenue::new(
            CoinbaseConfig {
                api_key: "k".to_string(),
                api_secret: "s".to_string(),
                account_prefix: "Assets:Coinbase".to_string(),
                api_url: default_api_url(),
            },
            HttpSettings::default(),
        )
        .unwrap()
    }

    fn account() -> Account {
        Account {
            id: "2bbf394c".to_string(),
            currency: "BTC".to_string(),
        }
    }

    fn buy() -> Value {
        json!({
            "id": "67e0eaec-07d7-54c4-a72c-2e92826897df",
            "status": "completed",
            "amount": {"amount": "0.01", "currency": "BTC"},
            "total": {"amount": "102.99", "currency": "USD"},
            "subtotal": {"amount": "100.00", "currency": "USD"},
            "fee": {"amount": "2.99", "currency": "USD"},
            "created_at": "2015-01-31T20:49:02Z"
        })
    }

    #[test]
    fn test_resources_cover_vocabulary() {
        let kinds: Vec<_> = RESOURCES
            .iter()
            .map(|r| CoinbaseKind::for_resource(r).unwrap())
            .collect();
        assert_eq!(kinds, CoinbaseKind::ALL.to_vec());
    }

    #[test]
    fn test_transaction_envelope() {
        let env = transaction_envelope(buy(), "buys", &account()).unwrap();
        assert_eq!(env.venue(), "coinbase");
        assert_eq!(env.kind().as_str(), "buy");
        assert_eq!(env.meta_value("account_id"), Some("2bbf394c"));
        assert_eq!(env.meta_value("currency"), Some("BTC"));

        let mut undated = buy();
        undated.as_object_mut().unwrap().remove("created_at");
        assert!(matches!(
            transaction_envelope(undated, "buys", &account()),
            Err(FetchError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn test_fetch_walks_every_resource_of_every_account() {
        let empty = || Reply::json(json!({"pagination": {"next_uri": null}, "data": []}));
        let server = StubServer::start(vec![
            Reply::json(json!({
                "pagination": {"next_uri": null},
                "data": [{"id": "2bbf394c", "currency": "BTC"}]
            })),
            Reply::json(json!({"pagination": {"next_uri": null}, "data": [buy()]})),
            empty(),
            empty(),
            empty(),
        ])
        .await;
        let venue = CoinbaseVenue::new(
            CoinbaseConfig {
                api_key: "k".to_string(),
                api_secret: "s".to_string(),
                account_prefix: "Assets:Coinbase".to_string(),
                api_url: server.base_url.clone(),
            },
            HttpSettings {
                timeout_secs: 5,
                max_retries: 1,
                concurrency: 1,
            },
        )
        .unwrap();

        let envelopes = venue.fetch().await.unwrap();

        assert_eq!(envelopes.len(), 1);
        assert_eq!(envelopes[0].kind().as_str(), "buy");
        assert_eq!(envelopes[0].meta_value("account_id"), Some("2bbf394c"));
        assert_eq!(
            server.request_lines(),
            vec![
                "GET /v2/accounts",
                "GET /v2/accounts/2bbf394c/buys",
                "GET /v2/accounts/2bbf394c/sells",
                "GET /v2/accounts/2bbf394c/deposits",
                "GET /v2/accounts/2bbf394c/withdrawals",
            ]
        );
    }

    #[test]
    fn test_parse_buy() {
        let env = transaction_envelope(buy(), "buys", &account()).unwrap();
        let entry = venue().parse(&env).unwrap();
        assert_eq!(entry.narration, "buy 0.01 BTC");
        assert_eq!(entry.postings[0].account, "Assets:Coinbase:BTC");
        assert_eq!(entry.postings[0].amount, Decimal::new(1, 2));
        assert_eq!(
            entry.postings[0].price,
            Some((Decimal::from(10000), "USD".to_string()))
        );
        assert_eq!(entry.postings[1].amount, Decimal::new(-10299, 2));
        assert_eq!(entry.postings[2].account, FEES_ACCOUNT);
        assert_eq!(entry.meta["transaction_id"], "67e0eaec-07d7-54c4-a72c-2e92826897df");
    }

    #[test]
    fn test_parse_ignores_meta() {
        let env = transaction_envelope(buy(), "buys", &account()).unwrap();
        let bare = Envelope::new(CoinbaseKind::Buy, env.timestamp(), env.raw().clone(), None);
        let v = venue();
        assert_eq!(v.parse(&bare).unwrap(), v.parse(&env).unwrap());
    }

    #[test]
    fn test_parse_sell_signs() {
        let mut sell = buy();
        sell["total"] = json!({"amount": "97.01", "currency": "USD"});
        let env = transaction_envelope(sell, "sells", &account()).unwrap();
        let entry = venue().parse(&env).unwrap();
        assert_eq!(entry.postings[0].amount, Decimal::new(-1, 2));
        assert_eq!(entry.postings[1].amount, Decimal::new(9701, 2));
    }

    #[test]
    fn test_parse_withdrawal() {
        let record = json!({
            "id": "w1",
            "amount": {"amount": "10.00", "currency": "USD"},
            "fee": {"amount": "0.15", "currency": "USD"},
            "created_at": "2015-01-31T20:49:02Z"
        });
        let env = transaction_envelope(record, "withdrawals", &account()).unwrap();
        let entry = venue().parse(&env).unwrap();
        assert_eq!(entry.postings[0].amount, Decimal::new(-1000, 2));
        assert_eq!(entry.postings[1].account, TRANSFER_ACCOUNT);
        assert_eq!(entry.postings.len(), 4);
    }

    #[test]
    fn test_parse_missing_total() {
        let mut record = buy();
        record.as_object_mut().unwrap().remove("total");
        let env = transaction_envelope(record, "buys", &account()).unwrap();
        let err = venue().parse(&env).unwrap_err();
        assert_eq!(err.venue, "coinbase");
        assert!(err.reason.contains("total.amount"));
    }
}
