//! Coinbase Pro REST client
//!
//! Requests are signed with HMAC-SHA256 over
//! `timestamp + METHOD + request_path(+query) + body`, keyed by the
//! base64-decoded API secret; the signature is sent base64-encoded.
//! List endpoints paginate through the `cb-after` response header.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use tracing::debug;

use super::http::{HttpSettings, VenueHttp};
use crate::error::FetchError;

type HmacSha256 = Hmac<Sha256>;

pub const DEFAULT_API_URL: &str = "https://api.pro.coinbase.com";

/// <https://docs.pro.coinbase.com/#products>
#[derive(Debug, Clone, Deserialize)]
pub struct Product {
    pub id: String,
    pub base_currency: String,
    pub quote_currency: String,
}

/// <https://docs.pro.coinbase.com/#accounts>
#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    pub id: String,
    pub currency: String,
}

pub struct CoinbaseProClient {
    http: VenueHttp,
    base_url: String,
    api_key: String,
    secret: Vec<u8>,
    passphrase: String,
}

impl CoinbaseProClient {
    pub fn new(
        venue: &'static str,
        base_url: &str,
        api_key: &str,
        api_secret: &str,
        passphrase: &str,
        settings: HttpSettings,
    ) -> Result<Self, FetchError> {
        let secret = BASE64.decode(api_secret.trim()).map_err(|e| FetchError::Config {
            venue: venue.to_string(),
            reason: format!("api_secret is not base64: {}", e),
        })?;

        Ok(Self {
            http: VenueHttp::new(venue, settings)?,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            secret,
            passphrase: passphrase.to_string(),
        })
    }

    pub fn settings(&self) -> &HttpSettings {
        self.http.settings()
    }

    pub async fn get_products(&self) -> Result<Vec<Product>, FetchError> {
        let response = self.get("/products", &[]).await?;
        self.http.json(response).await
    }

    pub async fn get_accounts(&self) -> Result<Vec<Account>, FetchError> {
        let response = self.get("/accounts", &[]).await?;
        self.http.json(response).await
    }

    /// All fills for one product, raw.
    pub async fn get_fills(&self, product_id: &str) -> Result<Vec<Value>, FetchError> {
        self.get_paginated("/fills", vec![("product_id", product_id.to_string())])
            .await
    }

    /// Full ledger history of one account, raw.
    pub async fn get_account_history(&self, account_id: &str) -> Result<Vec<Value>, FetchError> {
        self.get_paginated(&format!("/accounts/{}/ledger", account_id), Vec::new())
            .await
    }

    async fn get_paginated(
        &self,
        path: &str,
        mut params: Vec<(&'static str, String)>,
    ) -> Result<Vec<Value>, FetchError> {
        let mut out = Vec::new();
        loop {
            let response = self.get(path, &params).await?;
            let after = response
                .headers()
                .get("cb-after")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);

            let page: Vec<Value> = self.http.json(response).await?;
            let page_len = page.len();
            out.extend(page);

            match after {
                Some(cursor) if page_len > 0 => {
                    debug!(path, cursor = %cursor, "following cb-after");
                    params.retain(|(k, _)| *k != "after");
                    params.push(("after", cursor));
                }
                _ => break,
            }
        }
        Ok(out)
    }

    async fn get(
        &self,
        path: &str,
        params: &[(&'static str, String)],
    ) -> Result<reqwest::Response, FetchError> {
        let url = Url::parse_with_params(&format!("{}{}", self.base_url, path), params)
            .map_err(|e| FetchError::Config {
                venue: self.http.venue().to_string(),
                reason: format!("bad api_url: {}", e),
            })?;
        let request_path = match url.query() {
            Some(q) if !q.is_empty() => format!("{}?{}", url.path(), q),
            _ => url.path().to_string(),
        };

        self.http
            .send(url.as_str(), |client| {
                let timestamp = Utc::now().timestamp().to_string();
                let signature = self.sign(&timestamp, &Method::GET, &request_path, "")?;
                Ok(client
                    .get(url.clone())
                    .header("CB-ACCESS-KEY", &self.api_key)
                    .header("CB-ACCESS-SIGN", signature)
                    .header("CB-ACCESS-TIMESTAMP", timestamp)
                    .header("CB-ACCESS-PASSPHRASE", &self.passphrase)
                    .header("Content-Type", "application/json"))
            })
            .await
    }

    fn sign(
        &self,
        timestamp: &str,
        method: &Method,
        request_path: &str,
        body: &str,
    ) -> Result<String, FetchError> {
        sign_request(&self.secret, timestamp, method.as_str(), request_path, body).map_err(|e| {
            FetchError::Config {
                venue: self.http.venue().to_string(),
                reason: e,
            }
        })
    }
}

/// Base64 HMAC-SHA256 of the prehash string.
pub fn sign_request(
    secret: &[u8],
    timestamp: &str,
    method: &str,
    request_path: &str,
    body: &str,
) -> Result<String, String> {
    let mut mac =
        HmacSha256::new_from_slice(secret).map_err(|e| format!("HMAC key error: {}", e))?;
    mac.update(timestamp.as_bytes());
    mac.update(method.to_uppercase().as_bytes());
    mac.update(request_path.as_bytes());
    mac.update(body.as_bytes());
    Ok(BASE64.encode(mac.finalize().into_bytes()))
}

#[cfg(test)]
mod tests {
    use super::super::http::stub::{Reply, StubServer};
    use super::*;
    use serde_json::json;

    fn client(base_url: &str) -> CoinbaseProClient {
        CoinbaseProClient::new(
            "coinbasepro",
            base_url,
            "key",
            "c2VjcmV0",
            "pass",
            HttpSettings {
                timeout_secs: 5,
                max_retries: 1,
                concurrency: 1,
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_fills_follow_cb_after_until_empty_page() {
        let server = StubServer::start(vec![
            Reply::json(json!([{"trade_id": 3}, {"trade_id": 2}])).header("CB-AFTER", "2"),
            Reply::json(json!([{"trade_id": 1}])).header("CB-AFTER", "1"),
            Reply::json(json!([])).header("CB-AFTER", "0"),
        ])
        .await;

        let fills = client(&server.base_url).get_fills("BTC-USD").await.unwrap();

        let ids: Vec<_> = fills.iter().map(|f| f["trade_id"].as_u64().unwrap()).collect();
        assert_eq!(ids, vec![3, 2, 1]);
        assert_eq!(
            server.request_lines(),
            vec![
                "GET /fills?product_id=BTC-USD",
                "GET /fills?product_id=BTC-USD&after=2",
                "GET /fills?product_id=BTC-USD&after=1",
            ]
        );
        for request in server.requests() {
            let head = request.to_ascii_lowercase();
            assert!(head.contains("cb-access-key: key"));
            assert!(head.contains("cb-access-passphrase: pass"));
            assert!(head.contains("cb-access-sign: "));
            assert!(head.contains("cb-access-timestamp: "));
        }
    }

    #[tokio::test]
    async fn test_ledger_stops_without_cursor() {
        let server = StubServer::start(vec![Reply::json(json!([
            {"id": "1", "type": "transfer"}
        ]))])
        .await;

        let history = client(&server.base_url)
            .get_account_history("acc-1")
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(server.request_lines(), vec!["GET /accounts/acc-1/ledger"]);
    }

    #[test]
    fn test_signature_is_deterministic_base64() {
        let secret = BASE64.decode("c2VjcmV0").unwrap();
        let a = sign_request(&secret, "1600000000", "get", "/fills?product_id=BTC-USD", "").unwrap();
        let b = sign_request(&secret, "1600000000", "GET", "/fills?product_id=BTC-USD", "").unwrap();
        assert_eq!(a, b);
        assert_eq!(BASE64.decode(&a).unwrap().len(), 32);

        let c = sign_request(&secret, "1600000001", "GET", "/fills?product_id=BTC-USD", "").unwrap();
        assert_ne!(a, c);
    }

    #[test]
    fn test_rejects_non_base64_secret() {
        let err = CoinbaseProClient::new(
            "coinbasepro",
            DEFAULT_API_URL,
            "key",
            "not base64 !!",
            "pass",
            HttpSettings::default(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, FetchError::Config { .. }));
    }

    #[test]
    fn test_product_decodes_extra_fields() {
        let product: Product = serde_json::from_value(serde_json::json!({
            "id": "BTC-USD",
            "base_currency": "BTC",
            "quote_currency": "USD",
            "base_min_size": "0.001",
            "status": "online"
        }))
        .unwrap();
        assert_eq!(product.id, "BTC-USD");
    }
}
