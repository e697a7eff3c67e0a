//! Kraken websocket adapter.
//!
//! Kraken streams `ticker` and `ohlc` channels keyed by `BASE/QUOTE`
//! pair names and aliases BTC as XBT; the alias is applied in both
//! directions so the rest of the system only ever sees BTC.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::sources::websocket::{self, Subscriptions, VenueHandler};
use crate::sources::{normalize_symbol, Endpoint, PriceCache, Provider, ProviderKind};
use crate::types::{CandlePrice, CurrencyPair, Result, TickerPrice};

const KRAKEN_WS_HOST: &str = "ws.kraken.com";

#[derive(Debug, Serialize)]
struct SubscriptionMsg {
    event: &'static str,
    pair: Vec<String>,
    subscription: SubscriptionTopic,
}

#[derive(Debug, Serialize)]
struct SubscriptionTopic {
    name: &'static str,
}

pub struct KrakenProvider {
    cache: Arc<PriceCache>,
    subs: Subscriptions,
}

impl KrakenProvider {
    pub fn new(
        endpoint: Option<&Endpoint>,
        pairs: &[CurrencyPair],
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let host = endpoint
            .map(|e| e.websocket.clone())
            .unwrap_or_else(|| KRAKEN_WS_HOST.to_string());

        let cache = Arc::new(PriceCache::default());
        let handler = Arc::new(KrakenHandler {
            host,
            cache: Arc::clone(&cache),
        });
        let subs = websocket::spawn(handler, pairs.to_vec(), shutdown);

        Self { cache, subs }
    }
}

#[async_trait]
impl Provider for KrakenProvider {
    async fn subscribe(&self, pairs: &[CurrencyPair]) -> Result<()> {
        self.subs.add(pairs.to_vec());
        Ok(())
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>> {
        self.cache.tickers_for(ProviderKind::Kraken, pairs)
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>> {
        self.cache.candles_for(ProviderKind::Kraken, pairs)
    }
}

struct KrakenHandler {
    host: String,
    cache: Arc<PriceCache>,
}

impl VenueHandler for KrakenHandler {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Kraken
    }

    fn ws_url(&self) -> String {
        format!("wss://{}", self.host)
    }

    fn subscription_frames(&self, pairs: &[CurrencyPair]) -> Vec<Message> {
        let pair_names: Vec<String> = pairs.iter().map(currency_pair_to_kraken_pair).collect();
        ["ticker", "ohlc"]
            .into_iter()
            .map(|name| SubscriptionMsg {
                event: "subscribe",
                pair: pair_names.clone(),
                subscription: SubscriptionTopic { name },
            })
            .map(|msg| Message::Text(serde_json::to_string(&msg).expect("static shape").into()))
            .collect()
    }

    fn on_text(&self, text: &str) -> Option<Message> {
        let value: Value = serde_json::from_str(text).ok()?;

        // Status, heartbeat and subscription acks arrive as objects;
        // channel data arrives as [chanId, payload, channel, pair].
        let frame = value.as_array()?;
        if frame.len() < 4 {
            return None;
        }
        let channel = frame[frame.len() - 2].as_str()?;
        let pair = frame[frame.len() - 1].as_str()?;
        let symbol = kraken_pair_to_symbol(pair);

        if channel == "ticker" {
            self.handle_ticker(symbol, &frame[1]);
        } else if channel.starts_with("ohlc") {
            self.handle_ohlc(symbol, &frame[1]);
        }
        None
    }
}

impl KrakenHandler {
    /// Ticker payload: `c` = [last price, lot volume], `v` = [today,
    /// 24h volume].
    fn handle_ticker(&self, symbol: String, payload: &Value) {
        let Some(price) = payload["c"][0].as_str().and_then(parse_dec) else {
            warn!(provider = "kraken", %symbol, "malformed ticker payload");
            return;
        };
        let Some(volume) = payload["v"][1].as_str().and_then(parse_dec) else {
            warn!(provider = "kraken", %symbol, "malformed ticker payload");
            return;
        };
        self.cache.set_ticker(symbol, TickerPrice { price, volume });
    }

    /// OHLC payload: [time, etime, open, high, low, close, vwap, volume,
    /// count]; the candle is stamped with its end time. Updates within
    /// an interval share the end time and replace the bucket.
    fn handle_ohlc(&self, symbol: String, payload: &Value) {
        let Some(items) = payload.as_array().filter(|a| a.len() >= 8) else {
            return;
        };
        let end_time = items[1].as_str().and_then(|s| f64::from_str(s).ok());
        let price = items[5].as_str().and_then(parse_dec);
        let volume = items[7].as_str().and_then(parse_dec);
        let (Some(end_time), Some(price), Some(volume)) = (end_time, price, volume) else {
            warn!(provider = "kraken", %symbol, "malformed ohlc payload");
            return;
        };
        self.cache.upsert_candle(
            symbol,
            CandlePrice {
                price,
                volume,
                timestamp: (end_time * 1000.0) as i64,
            },
        );
    }
}

fn parse_dec(s: &str) -> Option<Decimal> {
    Decimal::from_str(s).ok()
}

/// "ATOM/USD" (with XBT aliased back to BTC) -> "ATOMUSD".
fn kraken_pair_to_symbol(pair: &str) -> String {
    normalize_symbol(&normalize_kraken_btc_pair(pair))
}

/// Kraken quotes bitcoin as XBT; everything downstream expects BTC.
fn normalize_kraken_btc_pair(pair: &str) -> String {
    match pair.strip_prefix("XBT/") {
        Some(quote) => format!("BTC/{quote}"),
        None => pair.to_string(),
    }
}

fn currency_pair_to_kraken_pair(pair: &CurrencyPair) -> String {
    let base = if pair.base == "BTC" { "XBT" } else { &pair.base };
    format!("{}/{}", base, pair.quote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> KrakenHandler {
        KrakenHandler {
            host: KRAKEN_WS_HOST.to_string(),
            cache: Arc::new(PriceCache::default()),
        }
    }

    #[test]
    fn pair_mapping_round_trips() {
        let cp = CurrencyPair::new("ATOM", "USD");
        assert_eq!(currency_pair_to_kraken_pair(&cp), "ATOM/USD");
        assert_eq!(kraken_pair_to_symbol("ATOM/USD"), "ATOMUSD");
    }

    #[test]
    fn btc_alias_applied_both_directions() {
        let cp = CurrencyPair::new("BTC", "USD");
        assert_eq!(currency_pair_to_kraken_pair(&cp), "XBT/USD");
        assert_eq!(kraken_pair_to_symbol("XBT/USD"), "BTCUSD");
        assert_eq!(normalize_kraken_btc_pair("OSMO/USD"), "OSMO/USD");
    }

    #[test]
    fn subscription_frames_match_wire_format() {
        let h = handler();
        let frames = h.subscription_frames(&[CurrencyPair::new("ATOM", "USD")]);
        assert_eq!(
            frames[0].to_text().unwrap(),
            r#"{"event":"subscribe","pair":["ATOM/USD"],"subscription":{"name":"ticker"}}"#
        );
        assert_eq!(
            frames[1].to_text().unwrap(),
            r#"{"event":"subscribe","pair":["ATOM/USD"],"subscription":{"name":"ohlc"}}"#
        );
    }

    #[test]
    fn ticker_frame_updates_cache() {
        let h = handler();
        h.on_text(
            r#"[42,{"c":["34.69000000","0.1"],"v":["1000.0","2396974.02000000"]},"ticker","ATOM/USD"]"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let prices = h.cache.tickers_for(ProviderKind::Kraken, &pairs).unwrap();
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
    fn ohlc_updates_replace_the_interval_bucket() {
        let h = handler();
        h.on_text(
            r#"[42,["1660000000.000000","1660000060.000000","28.0","28.5","27.9","28.21","28.1","1000.5",12],"ohlc-1","ATOM/USD"]"#,
        );
        // Same interval (same etime), later trade: replaces, not appends.
        h.on_text(
            r#"[42,["1660000030.000000","1660000060.000000","28.0","28.5","27.9","28.30","28.1","1400.5",19],"ohlc-1","ATOM/USD"]"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USD")];
        let candles = h.cache.candles_for(ProviderKind::Kraken, &pairs).unwrap();
        assert_eq!(candles["ATOMUSD"].len(), 1);
        assert_eq!(candles["ATOMUSD"][0].timestamp, 1660000060000);
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
    fn event_objects_are_ignored() {
        let h = handler();
        assert!(h
            .on_text(r#"{"event":"systemStatus","status":"online"}"#)
            .is_none());
        assert!(h.on_text(r#"{"event":"heartbeat"}"#).is_none());
    }
}
