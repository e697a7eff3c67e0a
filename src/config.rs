//! TOML configuration loading and fail-fast validation.

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde::Deserialize;

use crate::sources::{Endpoint, ProviderKind};
use crate::types::{CurrencyPair, ProviderPairs};

pub const DENOM_USD: &str = "USD";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:7171";
const DEFAULT_SRV_TIMEOUT: &str = "15s";
const DEFAULT_PROVIDER_TIMEOUT: &str = "100ms";
const DEFAULT_FEES: &str = "50uxprt";

/// Keyring passphrase fallback when the config leaves it empty.
const ENV_KEY_PASSPHRASE: &str = "ORACLE_FEEDER_KEY_PASSPHRASE";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("empty configuration file path")]
    EmptyPath,

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode config: {0}")]
    Decode(#[from] toml::de::Error),

    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub currency_pairs: Vec<CurrencyPairConfig>,
    #[serde(default)]
    pub deviation_thresholds: Vec<Deviation>,
    pub account: AccountConfig,
    pub keyring: KeyringConfig,
    pub rpc: RpcConfig,
    pub gas_adjustment: f64,
    #[serde(default = "default_fees")]
    pub fees: String,
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout: String,
    /// Disables the startup provider-count check against CoinGecko.
    #[serde(default)]
    pub provider_min_override: bool,
    #[serde(default)]
    pub provider_endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub write_timeout: String,
    pub read_timeout: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            write_timeout: DEFAULT_SRV_TIMEOUT.to_string(),
            read_timeout: DEFAULT_SRV_TIMEOUT.to_string(),
        }
    }
}

/// A price quote of the exchange rate for two different currencies and
/// the providers to source it from.
#[derive(Debug, Clone, Deserialize)]
pub struct CurrencyPairConfig {
    pub base: String,
    pub quote: String,
    pub providers: Vec<ProviderKind>,
}

/// Per-base override of how many σ a provider may deviate before being
/// filtered out of the vote.
#[derive(Debug, Clone, Deserialize)]
pub struct Deviation {
    pub base: String,
    pub threshold: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub chain_id: String,
    pub address: String,
    pub validator: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct KeyringConfig {
    pub dir: String,
    pub backend: String,
    pub passphrase: String,
    pub priv_key_hex: String,
    pub mnemonic: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    pub tmrpc_endpoint: String,
    pub grpc_endpoint: String,
    pub rpc_timeout: String,
}

fn default_fees() -> String {
    DEFAULT_FEES.to_string()
}

fn default_provider_timeout() -> String {
    DEFAULT_PROVIDER_TIMEOUT.to_string()
}

/// The maximum σ multiplier validators may configure for an asset.
fn max_deviation_threshold() -> Decimal {
    Decimal::from(3)
}

impl Config {
    /// Read, parse and validate the configuration at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyPath);
        }

        let contents = std::fs::read_to_string(path)?;
        let mut cfg: Config = toml::from_str(&contents)?;

        if cfg.keyring.passphrase.is_empty() {
            if let Ok(pass) = std::env::var(ENV_KEY_PASSPHRASE) {
                cfg.keyring.passphrase = pass;
            }
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.currency_pairs.is_empty() {
            return Err(ConfigError::Invalid(
                "at least one currency pair is required".to_string(),
            ));
        }

        for pair in &self.currency_pairs {
            if pair.providers.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "currency pair {}{} has no providers",
                    pair.base, pair.quote
                )));
            }
        }

        // Any quote other than USD needs its own USD feed somewhere, or
        // the aggregation pipeline could never bridge it.
        for pair in &self.currency_pairs {
            let quote = pair.quote.to_uppercase();
            if quote == DENOM_USD {
                continue;
            }
            let convertible = self.currency_pairs.iter().any(|p| {
                p.base.to_uppercase() == quote && p.quote.to_uppercase() == DENOM_USD
            });
            if !convertible {
                return Err(ConfigError::Invalid(
                    "all non-usd quotes require a conversion rate feed".to_string(),
                ));
            }
        }

        for deviation in &self.deviation_thresholds {
            let threshold = Decimal::from_str(&deviation.threshold).map_err(|_| {
                ConfigError::Invalid("deviation thresholds must be numeric".to_string())
            })?;
            if threshold > max_deviation_threshold() {
                return Err(ConfigError::Invalid(
                    "deviation thresholds must not exceed 3.0".to_string(),
                ));
            }
        }

        if self.gas_adjustment <= 0.0 {
            return Err(ConfigError::Invalid(
                "gas_adjustment must be positive".to_string(),
            ));
        }

        for endpoint in &self.provider_endpoints {
            if endpoint.rest.is_empty() || endpoint.websocket.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "provider endpoint {} must set both rest and websocket",
                    endpoint.name
                )));
            }
        }

        for (field, value) in [
            ("server.write_timeout", &self.server.write_timeout),
            ("server.read_timeout", &self.server.read_timeout),
            ("provider_timeout", &self.provider_timeout),
            ("rpc.rpc_timeout", &self.rpc.rpc_timeout),
        ] {
            parse_duration(value)
                .map_err(|e| ConfigError::Invalid(format!("{field}: {e}")))?;
        }

        Ok(())
    }

    /// Pairs grouped by the providers configured to source them.
    pub fn provider_pairs(&self) -> ProviderPairs {
        let mut out = ProviderPairs::new();
        for pair in &self.currency_pairs {
            for provider in &pair.providers {
                out.entry(*provider)
                    .or_default()
                    .push(CurrencyPair::new(pair.base.clone(), pair.quote.clone()));
            }
        }
        out
    }

    pub fn deviation_map(&self) -> HashMap<String, Decimal> {
        self.deviation_thresholds
            .iter()
            .filter_map(|d| Some((d.base.clone(), Decimal::from_str(&d.threshold).ok()?)))
            .collect()
    }

    pub fn endpoints_map(&self) -> HashMap<ProviderKind, Endpoint> {
        self.provider_endpoints
            .iter()
            .map(|e| (e.name, e.clone()))
            .collect()
    }

    pub fn provider_timeout_duration(&self) -> Duration {
        parse_duration(&self.provider_timeout).expect("validated at load")
    }

    pub fn rpc_timeout_duration(&self) -> Duration {
        parse_duration(&self.rpc.rpc_timeout).expect("validated at load")
    }
}

/// Parse duration strings of the form `100ms`, `15s`, `2m` or `1h`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    let split = s
        .find(|c: char| c.is_alphabetic())
        .ok_or_else(|| format!("missing unit in duration {s:?}"))?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration value {s:?}"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(format!("unknown duration unit {unit:?}")),
    }
}
