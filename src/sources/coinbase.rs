//! Coinbase Exchange websocket adapter.
//!
//! Coinbase has no OHLC stream, so candles are built locally by
//! bucketing `matches` trades into one-minute bars; tickers come from
//! the `ticker` channel.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::sources::websocket::{self, Subscriptions, VenueHandler};
use crate::sources::{normalize_symbol, Endpoint, PriceCache, Provider, ProviderKind};
use crate::types::{CandlePrice, CurrencyPair, Result, TickerPrice};

const COINBASE_WS_HOST: &str = "ws-feed.exchange.coinbase.com";
const CANDLE_BUCKET_MS: i64 = 60_000;

#[derive(Debug, Serialize)]
struct SubscriptionMsg {
    #[serde(rename = "type")]
    kind: &'static str,
    product_ids: Vec<String>,
    channels: Vec<&'static str>,
}

#[derive(Debug, Deserialize)]
struct CoinbaseTicker {
    product_id: String,
    price: String,
    volume_24h: String,
}

#[derive(Debug, Deserialize)]
struct CoinbaseMatch {
    product_id: String,
    price: String,
    size: String,
    time: DateTime<Utc>,
}

pub struct CoinbaseProvider {
    cache: Arc<PriceCache>,
    subs: Subscriptions,
}

impl CoinbaseProvider {
    pub fn new(
        endpoint: Option<&Endpoint>,
        pairs: &[CurrencyPair],
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let host = endpoint
            .map(|e| e.websocket.clone())
            .unwrap_or_else(|| COINBASE_WS_HOST.to_string());

        let cache = Arc::new(PriceCache::default());
        let handler = Arc::new(CoinbaseHandler {
            host,
            cache: Arc::clone(&cache),
            building: Mutex::new(HashMap::new()),
        });
        let subs = websocket::spawn(handler, pairs.to_vec(), shutdown);

        Self { cache, subs }
    }
}

#[async_trait]
impl Provider for CoinbaseProvider {
    async fn subscribe(&self, pairs: &[CurrencyPair]) -> Result<()> {
        self.subs.add(pairs.to_vec());
        Ok(())
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>> {
        self.cache.tickers_for(ProviderKind::Coinbase, pairs)
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>> {
        self.cache.candles_for(ProviderKind::Coinbase, pairs)
    }
}

struct CoinbaseHandler {
    host: String,
    cache: Arc<PriceCache>,
    /// Current one-minute bar per symbol, keyed by canonical symbol.
    building: Mutex<HashMap<String, CandlePrice>>,
}

impl VenueHandler for CoinbaseHandler {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Coinbase
    }

    fn ws_url(&self) -> String {
        format!("wss://{}", self.host)
    }

    fn subscription_frames(&self, pairs: &[CurrencyPair]) -> Vec<Message> {
        let msg = SubscriptionMsg {
            kind: "subscribe",
            product_ids: pairs.iter().map(currency_pair_to_coinbase_pair).collect(),
            channels: vec!["matches", "ticker"],
        };
        vec![Message::Text(
            serde_json::to_string(&msg).expect("static shape").into(),
        )]
    }

    fn on_text(&self, text: &str) -> Option<Message> {
        let kind = serde_json::from_str::<serde_json::Value>(text)
            .ok()?
            .get("type")?
            .as_str()?
            .to_string();
        match kind.as_str() {
            "ticker" => self.handle_ticker(text),
            "match" | "last_match" => self.handle_match(text),
            _ => {}
        }
        None
    }
}

impl CoinbaseHandler {
    fn handle_ticker(&self, text: &str) {
        let Ok(ticker) = serde_json::from_str::<CoinbaseTicker>(text) else {
            return;
        };
        let (Ok(price), Ok(volume)) = (
            Decimal::from_str(&ticker.price),
            Decimal::from_str(&ticker.volume_24h),
        ) else {
            warn!(provider = "coinbase", product = %ticker.product_id, "unparseable ticker decimals");
            return;
        };
        self.cache.set_ticker(
            normalize_symbol(&ticker.product_id),
            TickerPrice { price, volume },
        );
    }

    fn handle_match(&self, text: &str) {
        let Ok(trade) = serde_json::from_str::<CoinbaseMatch>(text) else {
            return;
        };
        let (Ok(price), Ok(size)) = (
            Decimal::from_str(&trade.price),
            Decimal::from_str(&trade.size),
        ) else {
            warn!(provider = "coinbase", product = %trade.product_id, "unparseable match decimals");
            return;
        };

        let symbol = normalize_symbol(&trade.product_id);
        let bucket = trade.time.timestamp_millis() / CANDLE_BUCKET_MS * CANDLE_BUCKET_MS;

        let candle = {
            let mut building = self.building.lock().expect("candle builder poisoned");
            let bar = building.entry(symbol.clone()).or_insert(CandlePrice {
                price,
                volume: Decimal::ZERO,
                timestamp: bucket,
            });
            if bar.timestamp != bucket {
                *bar = CandlePrice {
                    price,
                    volume: Decimal::ZERO,
                    timestamp: bucket,
                };
            }
            bar.price = price;
            bar.volume += size;
            bar.clone()
        };

        self.cache.upsert_candle(symbol, candle);
    }
}

fn currency_pair_to_coinbase_pair(pair: &CurrencyPair) -> String {
    format!("{}-{}", pair.base, pair.quote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> CoinbaseHandler {
        CoinbaseHandler {
            host: COINBASE_WS_HOST.to_string(),
            cache: Arc::new(PriceCache::default()),
            building: Mutex::new(HashMap::new()),
        }
    }

    #[test]
    fn pair_mapping() {
        let cp = CurrencyPair::new("ATOM", "USDT");
        assert_eq!(currency_pair_to_coinbase_pair(&cp), "ATOM-USDT");
        assert_eq!(normalize_symbol("ATOM-USDT"), "ATOMUSDT");
    }

    #[test]
    fn subscription_frame_matches_wire_format() {
        let h = handler();
        let frames = h.subscription_frames(&[CurrencyPair::new("ATOM", "USDT")]);
        assert_eq!(
            frames[0].to_text().unwrap(),
            r#"{"type":"subscribe","product_ids":["ATOM-USDT"],"channels":["matches","ticker"]}"#
        );
    }

    #[test]
    fn ticker_message_updates_cache() {
        let h = handler();
        h.on_text(
            r#"{"type":"ticker","product_id":"ATOM-USD","price":"34.69","volume_24h":"2396974.02"}"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let prices = h.cache.tickers_for(ProviderKind::Coinbase, &pairs).unwrap();
        assert_eq!(prices["ATOMUSD"].price, Decimal::from_str("34.69").unwrap());
    }

    #[test]
    fn matches_accumulate_into_minute_bars() {
        let h = handler();
        h.on_text(
            r#"{"type":"match","product_id":"ATOM-USD","price":"28.20","size":"2.0","time":"2022-08-01T12:00:10Z"}"#,
        );
        h.on_text(
            r#"{"type":"match","product_id":"ATOM-USD","price":"28.30","size":"3.0","time":"2022-08-01T12:00:40Z"}"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let candles = h.cache.candles_for(ProviderKind::Coinbase, &pairs).unwrap();
        assert_eq!(candles["ATOMUSD"].len(), 1);
        assert_eq!(candles["ATOMUSD"][0].price, Decimal::from_str("28.30").unwrap());
        assert_eq!(candles["ATOMUSD"][0].volume, Decimal::from_str("5.0").unwrap());
    }

    #[test]
    fn new_minute_starts_a_new_bar() {
        let h = handler();
        h.on_text(
            r#"{"type":"match","product_id":"ATOM-USD","price":"28.20","size":"2.0","time":"2022-08-01T12:00:10Z"}"#,
        );
        h.on_text(
            r#"{"type":"match","product_id":"ATOM-USD","price":"28.40","size":"1.0","time":"2022-08-01T12:01:05Z"}"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let candles = h.cache.candles_for(ProviderKind::Coinbase, &pairs).unwrap();
        assert_eq!(candles["ATOMUSD"].len(), 2);
        assert!(candles["ATOMUSD"][0].timestamp < candles["ATOMUSD"][1].timestamp);
        assert_eq!(candles["ATOMUSD"][1].volume, Decimal::from_str("1.0").unwrap());
    }
}
