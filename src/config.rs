//! Run configuration
//!
//! Loaded from a TOML file. Secrets may be left out of the file and supplied
//! through the environment (a `.env` next to the working directory is read
//! first).

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::ConfigError;
use crate::venues::coinbase::CoinbaseConfig;
use crate::venues::coinbasepro::CoinbaseProConfig;
use crate::venues::ethereum::EthereumConfig;
use crate::venues::http::HttpSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Archive root. Relative paths are resolved against the config file's
    /// directory by [`Config::load`].
    pub archive_dir: PathBuf,

    #[serde(default)]
    pub coinbase: Option<CoinbaseConfig>,

    #[serde(default)]
    pub coinbasepro: Option<CoinbaseProConfig>,

    #[serde(default)]
    pub ethereum: Option<EthereumConfig>,

    #[serde(default)]
    pub http: HttpSettings,
}

impl Config {
    /// Read, parse and validate a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        if dotenv::dotenv().is_ok() {
            debug!("loaded .env");
        }

        let base = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_toml(&contents, &base)
    }

    /// Parse config text; `base` is the directory relative paths resolve from.
    /// Missing credentials are looked up in the process environment.
    pub fn from_toml(contents: &str, base: &Path) -> Result<Self, ConfigError> {
        Self::from_toml_with_env(contents, base, |name| std::env::var(name).ok())
    }

    /// As [`Config::from_toml`], with missing credentials resolved through `env`.
    pub fn from_toml_with_env<E>(contents: &str, base: &Path, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let mut config: Self = toml::from_str(contents)?;

        if config.archive_dir.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("archive_dir is empty".to_string()));
        }
        if config.archive_dir.is_relative() {
            config.archive_dir = base.join(&config.archive_dir);
        }

        if let Some(cb) = config.coinbase.as_mut() {
            require(&env, &mut cb.api_key, "coinbase", "api_key", "COINBASE_API_KEY")?;
            require(&env, &mut cb.api_secret, "coinbase", "api_secret", "COINBASE_API_SECRET")?;
        }
        if let Some(pro) = config.coinbasepro.as_mut() {
            require(&env, &mut pro.api_key, "coinbasepro", "api_key", "COINBASEPRO_API_KEY")?;
            require(
                &env,
                &mut pro.api_secret,
                "coinbasepro",
                "api_secret",
                "COINBASEPRO_API_SECRET",
            )?;
            require(
                &env,
                &mut pro.api_passphrase,
                "coinbasepro",
                "api_passphrase",
                "COINBASEPRO_API_PASSPHRASE",
            )?;
        }
        if let Some(eth) = config.ethereum.as_ref() {
            if let Some(end) = eth.end_block {
                if end < eth.start_block {
                    return Err(ConfigError::Invalid(format!(
                        "ethereum end_block {} is before start_block {}",
                        end, eth.start_block
                    )));
                }
            }
            if eth.addresses.is_empty() {
                return Err(ConfigError::Invalid(
                    "ethereum.addresses must list at least one address".to_string(),
                ));
            }
        }

        Ok(config)
    }

    /// Configured venue ids in run order.
    pub fn venue_ids(&self) -> Vec<&'static str> {
        let mut ids = Vec::new();
        if self.coinbase.is_some() {
            ids.push(crate::venues::coinbase::VENUE);
        }
        if self.coinbasepro.is_some() {
            ids.push(crate::venues::coinbasepro::VENUE);
        }
        if self.ethereum.is_some() {
            ids.push(crate::venues::ethereum::VENUE);
        }
        ids
    }
}

/// Fill an empty credential from the environment, or fail naming both places.
fn require<E>(
    lookup: &E,
    value: &mut String,
    venue: &'static str,
    field: &'static str,
    env: &'static str,
) -> Result<(), ConfigError>
where
    E: Fn(&str) -> Option<String>,
{
    if !value.is_empty() {
        return Ok(());
    }
    match lookup(env) {
        Some(v) if !v.is_empty() => {
            *value = v;
            Ok(())
        }
        _ => Err(ConfigError::MissingCredential { venue, field, env }),
    }
}
