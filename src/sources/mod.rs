//! Exchange provider adapters.
//!
//! Each adapter owns its own ticker and candle caches, fed by a websocket
//! subscription (or a REST poll loop for Osmosis and Mock), and exposes
//! read-only snapshots of them through the [`Provider`] contract.

pub mod binance;
pub mod coinbase;
pub mod crypto_com;
pub mod huobi;
pub mod kraken;
pub mod mock;
pub mod osmosis;
mod websocket;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::types::{CandlePrice, CurrencyPair, ProviderError, Result, TickerPrice};

/// How long candles are retained inside an adapter: the TVWAP window plus
/// one candle period of slack.
pub(crate) const CANDLE_WINDOW_MS: i64 = (5 * 60 + 60) * 1000;

/// The supported exchange providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Kraken,
    Binance,
    #[serde(rename = "binanceus")]
    BinanceUs,
    Osmosis,
    Crypto,
    Coinbase,
    Huobi,
    Mock,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Kraken => "kraken",
            ProviderKind::Binance => "binance",
            ProviderKind::BinanceUs => "binanceus",
            ProviderKind::Osmosis => "osmosis",
            ProviderKind::Crypto => "crypto",
            ProviderKind::Coinbase => "coinbase",
            ProviderKind::Huobi => "huobi",
            ProviderKind::Mock => "mock",
        };
        f.write_str(name)
    }
}

/// Optional per-provider endpoint override from the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: ProviderKind,
    pub rest: String,
    pub websocket: String,
}

/// Common capability contract every adapter fulfils. The aggregation
/// pipeline only ever sees this trait; [`ProviderKind`] controls
/// construction.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Add pairs to the live subscription set. Idempotent; websocket
    /// adapters amend the running subscription or pick the pairs up on
    /// the next reconnect.
    async fn subscribe(&self, pairs: &[CurrencyPair]) -> Result<()>;

    /// Latest ticker for each requested pair, keyed by the canonical
    /// `BASEQUOTE` symbol.
    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>>;

    /// Cached candle window for each requested pair, keyed by the
    /// canonical `BASEQUOTE` symbol, sorted by timestamp ascending.
    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>>;
}

/// Construct the adapter for a provider kind, spawning its background
/// tasks. Websocket adapters start subscribed to `pairs`.
pub async fn new_provider(
    kind: ProviderKind,
    endpoint: Option<&Endpoint>,
    pairs: &[CurrencyPair],
    shutdown: watch::Receiver<bool>,
) -> Result<Arc<dyn Provider>> {
    let provider: Arc<dyn Provider> = match kind {
        ProviderKind::Binance => Arc::new(binance::BinanceProvider::new(
            endpoint, false, pairs, shutdown,
        )),
        ProviderKind::BinanceUs => Arc::new(binance::BinanceProvider::new(
            endpoint, true, pairs, shutdown,
        )),
        ProviderKind::Kraken => Arc::new(kraken::KrakenProvider::new(endpoint, pairs, shutdown)),
        ProviderKind::Coinbase => {
            Arc::new(coinbase::CoinbaseProvider::new(endpoint, pairs, shutdown))
        }
        ProviderKind::Crypto => Arc::new(crypto_com::CryptoProvider::new(endpoint, pairs, shutdown)),
        ProviderKind::Huobi => Arc::new(huobi::HuobiProvider::new(endpoint, pairs, shutdown)),
        ProviderKind::Osmosis => Arc::new(osmosis::OsmosisProvider::new(endpoint, pairs, shutdown)),
        ProviderKind::Mock => Arc::new(mock::MockProvider::new(endpoint).await?),
    };

    tracing::info!(provider = %kind, pairs = pairs.len(), "provider initialized");
    Ok(provider)
}

/// Normalize a venue symbol into the canonical `BASEQUOTE` form by
/// stripping venue separators and upper-casing.
pub(crate) fn normalize_symbol(raw: &str) -> String {
    raw.replace(['-', '/', '_'], "").to_uppercase()
}

/// Shared ticker/candle cache every adapter owns. Single writer (the
/// adapter's read task), many readers (the oracle tick); readers always
/// get a copy, never the internal map.
#[derive(Default)]
pub(crate) struct PriceCache {
    tickers: std::sync::RwLock<HashMap<String, TickerPrice>>,
    candles: std::sync::RwLock<HashMap<String, Vec<CandlePrice>>>,
}

impl PriceCache {
    pub(crate) fn set_ticker(&self, symbol: String, ticker: TickerPrice) {
        self.tickers
            .write()
            .expect("ticker cache poisoned")
            .insert(symbol, ticker);
    }

    /// Replace the candle sharing `candle.timestamp`, or insert it in
    /// timestamp order, pruning everything older than the retention
    /// window. Streaming venues re-emit the forming bar under the same
    /// bucket timestamp until it closes.
    pub(crate) fn upsert_candle(&self, symbol: String, candle: CandlePrice) {
        let cutoff = candle.timestamp - CANDLE_WINDOW_MS;
        let mut candles = self.candles.write().expect("candle cache poisoned");
        let series = candles.entry(symbol).or_default();
        series.retain(|c| c.timestamp >= cutoff);
        match series.iter_mut().find(|c| c.timestamp == candle.timestamp) {
            Some(existing) => *existing = candle,
            None => {
                let at = series.partition_point(|c| c.timestamp <= candle.timestamp);
                series.insert(at, candle);
            }
        }
    }

    pub(crate) fn tickers_for(
        &self,
        kind: ProviderKind,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>> {
        let tickers = self.tickers.read().expect("ticker cache poisoned");
        let mut out = HashMap::with_capacity(pairs.len());
        for pair in pairs {
            let symbol = pair.to_string();
            let ticker = tickers
                .get(&symbol)
                .ok_or_else(|| ProviderError::TickerNotFound {
                    provider: kind,
                    symbol: symbol.clone(),
                })?;
            out.insert(symbol, ticker.clone());
        }
        Ok(out)
    }

    pub(crate) fn candles_for(
        &self,
        kind: ProviderKind,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>> {
        let candles = self.candles.read().expect("candle cache poisoned");
        let mut out = HashMap::with_capacity(pairs.len());
        for pair in pairs {
            let symbol = pair.to_string();
            let series = candles
                .get(&symbol)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ProviderError::CandleNotFound {
                    provider: kind,
                    symbol: symbol.clone(),
                })?;
            out.insert(symbol, series.clone());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;

    #[test]
    fn normalize_strips_separators() {
        assert_eq!(normalize_symbol("ATOM-USD"), "ATOMUSD");
        assert_eq!(normalize_symbol("atom/usd"), "ATOMUSD");
        assert_eq!(normalize_symbol("ATOM_USDT"), "ATOMUSDT");
    }

    #[test]
    fn provider_kind_parses_from_config_names() {
        let kinds: Vec<ProviderKind> =
            serde_json::from_str(r#"["kraken","binance","binanceus","crypto","mock"]"#).unwrap();
        assert_eq!(
            kinds,
            vec![
                ProviderKind::Kraken,
                ProviderKind::Binance,
                ProviderKind::BinanceUs,
                ProviderKind::Crypto,
                ProviderKind::Mock,
            ]
        );
    }

    #[test]
    fn cache_prunes_old_candles() {
        let cache = PriceCache::default();
        let now = 10_000_000;
        cache.upsert_candle(
            "ATOMUSD".into(),
            CandlePrice {
                price: Decimal::ONE,
                volume: Decimal::ONE,
                timestamp: now - CANDLE_WINDOW_MS - 1,
            },
        );
        cache.upsert_candle(
            "ATOMUSD".into(),
            CandlePrice {
                price: Decimal::TWO,
                volume: Decimal::ONE,
                timestamp: now,
            },
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let candles = cache.candles_for(ProviderKind::Kraken, &pairs).unwrap();
        assert_eq!(candles["ATOMUSD"].len(), 1);
        assert_eq!(candles["ATOMUSD"][0].price, Decimal::TWO);
    }

    #[test]
    fn cache_replaces_same_timestamp_candle() {
        let cache = PriceCache::default();
        cache.upsert_candle(
            "ATOMUSD".into(),
            CandlePrice {
                price: Decimal::ONE,
                volume: Decimal::ONE,
                timestamp: 10_000_000,
            },
        );
        cache.upsert_candle(
            "ATOMUSD".into(),
            CandlePrice {
                price: Decimal::TWO,
                volume: Decimal::TWO,
                timestamp: 10_000_000,
            },
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let candles = cache.candles_for(ProviderKind::Kraken, &pairs).unwrap();
        assert_eq!(candles["ATOMUSD"].len(), 1);
        assert_eq!(candles["ATOMUSD"][0].volume, Decimal::TWO);
    }

    #[test]
    fn missing_pair_surfaces_not_found() {
        let cache = PriceCache::default();
        let pairs = [CurrencyPair::new("FOO", "BAR")];
        let err = cache.tickers_for(ProviderKind::Binance, &pairs).unwrap_err();
        assert_eq!(
            err.to_string(),
            "binance failed to get ticker price for FOOBAR"
        );
    }
}
