use std::collections::HashMap;
use std::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::sources::ProviderKind;

/// A currency exchange pair consisting of a base and a quote.
///
/// The base is what we broadcast exchange rates for; the full pair is the
/// key used when querying a provider's ticker cache.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CurrencyPair {
    pub base: String,
    pub quote: String,
}

impl CurrencyPair {
    pub fn new(base: impl Into<String>, quote: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            quote: quote.into(),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.base, self.quote)
    }
}

/// Latest price observation from an exchange. Freshness is implied by
/// reception time; tickers carry no timestamp of their own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TickerPrice {
    pub price: Decimal,
    pub volume: Decimal,
}

/// A single OHLC bar reduced to close price, volume and close time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandlePrice {
    pub price: Decimal,
    pub volume: Decimal,
    /// Candle close time in epoch milliseconds (UTC).
    pub timestamp: i64,
}

/// Ticker snapshots per provider, keyed by base symbol.
///
/// e.g. `{Kraken: {"ATOM": <price, volume>, ...}}`
pub type AggregatedProviderPrices = HashMap<ProviderKind, HashMap<String, TickerPrice>>;

/// Candle snapshots per provider, keyed by base symbol, sorted by
/// timestamp ascending.
pub type AggregatedProviderCandles = HashMap<ProviderKind, HashMap<String, Vec<CandlePrice>>>;

/// The currency pairs each provider is configured to source.
pub type ProviderPairs = HashMap<ProviderKind, Vec<CurrencyPair>>;

/// Computed prices per provider, keyed by base symbol. Published for the
/// status API alongside the canonical prices.
pub type PricesByProvider = HashMap<ProviderKind, HashMap<String, Decimal>>;

/// Errors surfaced by provider adapters. Transient network and parse
/// failures are absorbed inside the adapter; only missing-pair lookups
/// reach callers.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("{provider} failed to get ticker price for {symbol}")]
    TickerNotFound {
        provider: ProviderKind,
        symbol: String,
    },

    #[error("{provider} failed to get candle price for {symbol}")]
    CandleNotFound {
        provider: ProviderKind,
        symbol: String,
    },

    #[error("api request failed: {0}")]
    Api(String),

    #[error("invalid response format: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;
