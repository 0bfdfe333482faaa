//! Shared request execution for venue clients.
//!
//! Every venue call goes through [`VenueHttp::send`]: per-request timeout,
//! bounded retries with exponential backoff on transport errors, timeouts,
//! 429 and 5xx, and a mapping of everything else onto [`FetchError`].

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

use crate::error::FetchError;

const INITIAL_BACKOFF_MS: u64 = 250;
const MAX_BACKOFF_MS: u64 = 30_000;
const USER_AGENT: &str = concat!("bean-fetch/", env!("CARGO_PKG_VERSION"));

/// HTTP tuning shared by all venue clients (`[http]` config table).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HttpSettings {
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Upper bound on in-flight sub-fetches inside one adapter.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_concurrency() -> usize {
    4
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            concurrency: default_concurrency(),
        }
    }
}

impl HttpSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency.max(1)
    }
}

/// HTTP client bound to one venue, so every error it raises names that venue.
#[derive(Debug, Clone)]
pub struct VenueHttp {
    client: Client,
    venue: &'static str,
    settings: HttpSettings,
}

impl VenueHttp {
    pub fn new(venue: &'static str, settings: HttpSettings) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(settings.timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|source| FetchError::Http {
                venue: venue.to_string(),
                source,
            })?;

        Ok(Self {
            client,
            venue,
            settings,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn venue(&self) -> &'static str {
        self.venue
    }

    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// Execute a request with retries. `build` is called once per attempt so
    /// signed requests get a fresh timestamp.
    pub async fn send<F>(&self, url: &str, build: F) -> Result<Response, FetchError>
    where
        F: Fn(&Client) -> Result<RequestBuilder, FetchError>,
    {
        let mut backoff = INITIAL_BACKOFF_MS;
        let attempts = self.settings.max_retries.max(1);
        let mut last_error: Option<FetchError> = None;

        for attempt in 0..attempts {
            let request = build(&self.client)?;

            match timeout(self.settings.timeout(), request.send()).await {
                Ok(Ok(response)) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                        let body = response.text().await.unwrap_or_default();
                        return Err(FetchError::Auth {
                            venue: self.venue.to_string(),
                            status: status.as_u16(),
                            body,
                        });
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        warn!(venue = self.venue, url, attempt = attempt + 1, "rate limited, backing off");
                        last_error = Some(FetchError::RateLimited {
                            venue: self.venue.to_string(),
                            url: url.to_string(),
                        });
                    } else if status.is_server_error() {
                        let body = response.text().await.unwrap_or_default();
                        warn!(venue = self.venue, url, status = status.as_u16(), "server error");
                        last_error = Some(FetchError::Api {
                            venue: self.venue.to_string(),
                            status: status.as_u16(),
                            body,
                        });
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        return Err(FetchError::Api {
                            venue: self.venue.to_string(),
                            status: status.as_u16(),
                            body,
                        });
                    }
                }
                Ok(Err(source)) => {
                    warn!(venue = self.venue, url, attempt = attempt + 1, error = %source, "request failed");
                    last_error = Some(if source.is_timeout() {
                        FetchError::Timeout {
                            venue: self.venue.to_string(),
                            url: url.to_string(),
                        }
                    } else {
                        FetchError::Http {
                            venue: self.venue.to_string(),
                            source,
                        }
                    });
                }
                Err(_) => {
                    warn!(venue = self.venue, url, attempt = attempt + 1, "request timed out");
                    last_error = Some(FetchError::Timeout {
                        venue: self.venue.to_string(),
                        url: url.to_string(),
                    });
                }
            }

            if attempt + 1 < attempts {
                debug!(venue = self.venue, "retrying in {}ms", backoff);
                sleep(Duration::from_millis(backoff)).await;
                backoff = (backoff * 2).min(MAX_BACKOFF_MS);
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::Timeout {
            venue: self.venue.to_string(),
            url: url.to_string(),
        }))
    }

    /// Decode a JSON body, mapping failures to [`FetchError::Malformed`].
    pub async fn json<T: DeserializeOwned>(&self, response: Response) -> Result<T, FetchError> {
        let url = response.url().to_string();
        let bytes = response.bytes().await.map_err(|source| FetchError::Http {
            venue: self.venue.to_string(),
            source,
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            FetchError::malformed(self.venue, format!("{}: {}", url, e))
        })
    }
}
