//! Binance (and Binance.US) websocket adapter.
//!
//! Subscribes to the `@ticker` and `@kline_1m` streams on the raw `/ws`
//! endpoint, one SUBSCRIBE frame per stream.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::sources::websocket::{self, Subscriptions, VenueHandler};
use crate::sources::{Endpoint, PriceCache, Provider, ProviderKind};
use crate::types::{CandlePrice, CurrencyPair, Result, TickerPrice};

const BINANCE_WS_HOST: &str = "stream.binance.com:9443";
const BINANCE_US_WS_HOST: &str = "stream.binance.us:9443";

#[derive(Debug, Serialize)]
struct SubscriptionMsg {
    method: &'static str,
    params: Vec<String>,
    id: u32,
}

/// 24hr rolling ticker event.
#[derive(Debug, Deserialize)]
struct BinanceTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c")]
    last_price: String,
    #[serde(rename = "v")]
    volume: String,
}

#[derive(Debug, Deserialize)]
struct BinanceKlineEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "k")]
    kline: BinanceKline,
}

#[derive(Debug, Deserialize)]
struct BinanceKline {
    /// Close time in epoch milliseconds.
    #[serde(rename = "T")]
    close_time: i64,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
}

pub struct BinanceProvider {
    kind: ProviderKind,
    cache: Arc<PriceCache>,
    subs: Subscriptions,
}

impl BinanceProvider {
    pub fn new(
        endpoint: Option<&Endpoint>,
        us: bool,
        pairs: &[CurrencyPair],
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let kind = if us {
            ProviderKind::BinanceUs
        } else {
            ProviderKind::Binance
        };
        let default_host = if us {
            BINANCE_US_WS_HOST
        } else {
            BINANCE_WS_HOST
        };
        let host = endpoint
            .map(|e| e.websocket.clone())
            .unwrap_or_else(|| default_host.to_string());

        let cache = Arc::new(PriceCache::default());
        let handler = Arc::new(BinanceHandler {
            kind,
            host,
            cache: Arc::clone(&cache),
        });
        let subs = websocket::spawn(handler, pairs.to_vec(), shutdown);

        Self { kind, cache, subs }
    }
}

#[async_trait]
impl Provider for BinanceProvider {
    async fn subscribe(&self, pairs: &[CurrencyPair]) -> Result<()> {
        self.subs.add(pairs.to_vec());
        Ok(())
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>> {
        self.cache.tickers_for(self.kind, pairs)
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>> {
        self.cache.candles_for(self.kind, pairs)
    }
}

struct BinanceHandler {
    kind: ProviderKind,
    host: String,
    cache: Arc<PriceCache>,
}

impl BinanceHandler {
    fn handle_ticker(&self, text: &str) {
        let Ok(ticker) = serde_json::from_str::<BinanceTicker>(text) else {
            return;
        };
        let (Ok(price), Ok(volume)) = (
            Decimal::from_str(&ticker.last_price),
            Decimal::from_str(&ticker.volume),
        ) else {
            warn!(provider = %self.kind, symbol = %ticker.symbol, "unparseable ticker decimals");
            return;
        };
        self.cache
            .set_ticker(ticker.symbol, TickerPrice { price, volume });
    }

    fn handle_kline(&self, text: &str) {
        let Ok(event) = serde_json::from_str::<BinanceKlineEvent>(text) else {
            return;
        };
        let (Ok(price), Ok(volume)) = (
            Decimal::from_str(&event.kline.close),
            Decimal::from_str(&event.kline.volume),
        ) else {
            warn!(provider = %self.kind, symbol = %event.symbol, "unparseable kline decimals");
            return;
        };
        // The stream re-emits the forming bar (same close time, growing
        // cumulative volume) until it closes; replace the bucket.
        self.cache.upsert_candle(
            event.symbol,
            CandlePrice {
                price,
                volume,
                timestamp: event.kline.close_time,
            },
        );
    }
}

impl VenueHandler for BinanceHandler {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn ws_url(&self) -> String {
        format!("wss://{}/ws", self.host)
    }

    fn subscription_frames(&self, pairs: &[CurrencyPair]) -> Vec<Message> {
        pairs
            .iter()
            .flat_map(|pair| {
                [
                    currency_pair_to_ticker_stream(pair),
                    currency_pair_to_kline_stream(pair),
                ]
            })
            .map(|stream| SubscriptionMsg {
                method: "SUBSCRIBE",
                params: vec![stream],
                id: 1,
            })
            .map(|msg| Message::Text(serde_json::to_string(&msg).expect("static shape").into()))
            .collect()
    }

    fn on_text(&self, text: &str) -> Option<Message> {
        match serde_json::from_str::<serde_json::Value>(text)
            .ok()?
            .get("e")
            .and_then(|e| e.as_str())
        {
            Some("24hrTicker") => self.handle_ticker(text),
            Some("kline") => self.handle_kline(text),
            // Subscription acks ({"result":null,"id":1}) and anything else.
            _ => {}
        }
        None
    }
}

fn currency_pair_to_ticker_stream(pair: &CurrencyPair) -> String {
    format!("{}@ticker", pair.to_string().to_lowercase())
}

fn currency_pair_to_kline_stream(pair: &CurrencyPair) -> String {
    format!("{}@kline_1m", pair.to_string().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> BinanceHandler {
        BinanceHandler {
            kind: ProviderKind::Binance,
            host: BINANCE_WS_HOST.to_string(),
            cache: Arc::new(PriceCache::default()),
        }
    }

    #[test]
    fn ticker_stream_name() {
        let pair = CurrencyPair::new("ATOM", "USD");
        assert_eq!(currency_pair_to_ticker_stream(&pair), "atomusd@ticker");
    }

    #[test]
    fn subscription_frames_match_wire_format() {
        let h = handler();
        let frames = h.subscription_frames(&[CurrencyPair::new("ATOM", "USD")]);
        assert_eq!(
            frames[0].to_text().unwrap(),
            r#"{"method":"SUBSCRIBE","params":["atomusd@ticker"],"id":1}"#
        );
        assert_eq!(
            frames[1].to_text().unwrap(),
            r#"{"method":"SUBSCRIBE","params":["atomusd@kline_1m"],"id":1}"#
        );
    }

    #[test]
    fn ticker_message_updates_cache() {
        let h = handler();
        h.on_text(r#"{"e":"24hrTicker","s":"ATOMUSD","c":"34.69000000","v":"2396974.02000000"}"#);

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let prices = h.cache.tickers_for(ProviderKind::Binance, &pairs).unwrap();
        assert_eq!(
            prices["ATOMUSD"].price,
            Decimal::from_str("34.69000000").unwrap()
        );
        assert_eq!(
            prices["ATOMUSD"].volume,
            Decimal::from_str("2396974.02000000").unwrap()
        );
    }

    #[test]
    fn kline_message_upserts_bucket() {
        let h = handler();
        // The forming bar is re-emitted with the same close time and a
        // growing cumulative volume; only the latest emit must survive.
        h.on_text(
            r#"{"e":"kline","s":"ATOMUSD","k":{"T":1660000000000,"c":"28.21","v":"1000.5"}}"#,
        );
        h.on_text(
            r#"{"e":"kline","s":"ATOMUSD","k":{"T":1660000000000,"c":"28.30","v":"1400.5"}}"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let candles = h.cache.candles_for(ProviderKind::Binance, &pairs).unwrap();
        assert_eq!(candles["ATOMUSD"].len(), 1);
        assert_eq!(candles["ATOMUSD"][0].timestamp, 1660000000000);
        assert_eq!(
            candles["ATOMUSD"][0].price,
            Decimal::from_str("28.30").unwrap()
        );
        assert_eq!(
            candles["ATOMUSD"][0].volume,
            Decimal::from_str("1400.5").unwrap()
        );
    }

    #[test]
    fn closed_bars_accumulate_as_separate_candles() {
        let h = handler();
        h.on_text(
            r#"{"e":"kline","s":"ATOMUSD","k":{"T":1660000000000,"c":"28.21","v":"1000.5"}}"#,
        );
        h.on_text(
            r#"{"e":"kline","s":"ATOMUSD","k":{"T":1660000060000,"c":"28.25","v":"12.0"}}"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let candles = h.cache.candles_for(ProviderKind::Binance, &pairs).unwrap();
        assert_eq!(candles["ATOMUSD"].len(), 2);
        assert!(candles["ATOMUSD"][0].timestamp < candles["ATOMUSD"][1].timestamp);
    }

    #[test]
    fn unknown_events_are_ignored() {
        let h = handler();
        assert!(h.on_text(r#"{"result":null,"id":1}"#).is_none());
        let pairs = [CurrencyPair::new("ATOM", "USD")];
        assert!(h.cache.tickers_for(ProviderKind::Binance, &pairs).is_err());
    }
}
