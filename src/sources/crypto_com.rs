//! Crypto.com Exchange websocket adapter.
//!
//! Streams `ticker` and `candlestick` channels; the venue pushes
//! `public/heartbeat` requests that must be answered or it drops the
//! connection.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::sources::websocket::{self, Subscriptions, VenueHandler};
use crate::sources::{normalize_symbol, Endpoint, PriceCache, Provider, ProviderKind};
use crate::types::{CandlePrice, CurrencyPair, Result, TickerPrice};

const CRYPTO_WS_HOST: &str = "stream.crypto.com";

pub struct CryptoProvider {
    cache: Arc<PriceCache>,
    subs: Subscriptions,
}

impl CryptoProvider {
    pub fn new(
        endpoint: Option<&Endpoint>,
        pairs: &[CurrencyPair],
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let host = endpoint
            .map(|e| e.websocket.clone())
            .unwrap_or_else(|| CRYPTO_WS_HOST.to_string());

        let cache = Arc::new(PriceCache::default());
        let handler = Arc::new(CryptoHandler {
            host,
            cache: Arc::clone(&cache),
        });
        let subs = websocket::spawn(handler, pairs.to_vec(), shutdown);

        Self { cache, subs }
    }
}

#[async_trait]
impl Provider for CryptoProvider {
    async fn subscribe(&self, pairs: &[CurrencyPair]) -> Result<()> {
        self.subs.add(pairs.to_vec());
        Ok(())
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>> {
        self.cache.tickers_for(ProviderKind::Crypto, pairs)
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>> {
        self.cache.candles_for(ProviderKind::Crypto, pairs)
    }
}

struct CryptoHandler {
    host: String,
    cache: Arc<PriceCache>,
}

impl VenueHandler for CryptoHandler {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Crypto
    }

    fn ws_url(&self) -> String {
        format!("wss://{}/v2/market", self.host)
    }

    fn subscription_frames(&self, pairs: &[CurrencyPair]) -> Vec<Message> {
        let channels: Vec<String> = pairs
            .iter()
            .flat_map(|pair| {
                let instrument = currency_pair_to_instrument(pair);
                [
                    format!("ticker.{instrument}"),
                    format!("candlestick.5m.{instrument}"),
                ]
            })
            .collect();
        let msg = json!({
            "id": 1,
            "method": "subscribe",
            "params": { "channels": channels },
        });
        vec![Message::Text(msg.to_string().into())]
    }

    fn on_text(&self, text: &str) -> Option<Message> {
        let value: Value = serde_json::from_str(text).ok()?;

        if value["method"] == "public/heartbeat" {
            let reply = json!({
                "id": value["id"],
                "method": "public/respond-heartbeat",
            });
            return Some(Message::Text(reply.to_string().into()));
        }

        let result = value.get("result")?;
        let instrument = result["instrument_name"].as_str()?;
        let symbol = normalize_symbol(instrument);
        match result["channel"].as_str()? {
            "ticker" => self.handle_ticker(symbol, result),
            "candlestick" => self.handle_candlestick(symbol, result),
            _ => {}
        }
        None
    }
}

impl CryptoHandler {
    /// Ticker data: `a` = latest trade price, `v` = 24h volume.
    fn handle_ticker(&self, symbol: String, result: &Value) {
        let Some(data) = result["data"].as_array() else {
            return;
        };
        for item in data {
            let (Some(price), Some(volume)) = (dec_from(&item["a"]), dec_from(&item["v"])) else {
                warn!(provider = "crypto", %symbol, "malformed ticker data");
                continue;
            };
            self.cache
                .set_ticker(symbol.clone(), TickerPrice { price, volume });
        }
    }

    fn handle_candlestick(&self, symbol: String, result: &Value) {
        let Some(data) = result["data"].as_array() else {
            return;
        };
        for item in data {
            let timestamp = item["t"].as_i64();
            let price = dec_from(&item["c"]);
            let volume = dec_from(&item["v"]);
            let (Some(timestamp), Some(price), Some(volume)) = (timestamp, price, volume) else {
                warn!(provider = "crypto", %symbol, "malformed candlestick data");
                continue;
            };
            self.cache.upsert_candle(
                symbol.clone(),
                CandlePrice {
                    price,
                    volume,
                    timestamp,
                },
            );
        }
    }
}

/// Crypto.com renders numbers as either JSON strings or floats depending
/// on the channel.
fn dec_from(value: &Value) -> Option<Decimal> {
    match value {
        Value::String(s) => Decimal::from_str(s).ok(),
        Value::Number(n) => Decimal::try_from(n.as_f64()?).ok(),
        _ => None,
    }
}

fn currency_pair_to_instrument(pair: &CurrencyPair) -> String {
    format!("{}_{}", pair.base, pair.quote)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> CryptoHandler {
        CryptoHandler {
            host: CRYPTO_WS_HOST.to_string(),
            cache: Arc::new(PriceCache::default()),
        }
    }

    #[test]
    fn instrument_mapping() {
        let cp = CurrencyPair::new("ATOM", "USDT");
        assert_eq!(currency_pair_to_instrument(&cp), "ATOM_USDT");
        assert_eq!(normalize_symbol("ATOM_USDT"), "ATOMUSDT");
    }

    #[test]
    fn subscription_frame_lists_both_channels() {
        let h = handler();
        let frames = h.subscription_frames(&[CurrencyPair::new("ATOM", "USDT")]);
        let text = frames[0].to_text().unwrap();
        assert!(text.contains("ticker.ATOM_USDT"));
        assert!(text.contains("candlestick.5m.ATOM_USDT"));
    }

    #[test]
    fn heartbeat_is_answered() {
        let h = handler();
        let reply = h
            .on_text(r#"{"id":1660000000,"method":"public/heartbeat"}"#)
            .expect("heartbeat reply");
        let text = reply.to_text().unwrap();
        assert!(text.contains("public/respond-heartbeat"));
        assert!(text.contains("1660000000"));
    }

    #[test]
    fn ticker_data_updates_cache() {
        let h = handler();
        h.on_text(
            r#"{"method":"subscribe","result":{"channel":"ticker","instrument_name":"ATOM_USDT","data":[{"a":"28.21","v":"12345.6","t":1660000000000}]}}"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USDT")];
        let prices = h.cache.tickers_for(ProviderKind::Crypto, &pairs).unwrap();
        assert_eq!(prices["ATOMUSDT"].price, Decimal::from_str("28.21").unwrap());
    }

    #[test]
    fn candlestick_data_upserts_bucket() {
        let h = handler();
        h.on_text(
            r#"{"method":"subscribe","result":{"channel":"candlestick","instrument_name":"ATOM_USDT","data":[{"t":1660000000000,"c":"28.21","v":"10.0"}]}}"#,
        );
        h.on_text(
            r#"{"method":"subscribe","result":{"channel":"candlestick","instrument_name":"ATOM_USDT","data":[{"t":1660000000000,"c":"28.30","v":"12.0"}]}}"#,
        );

        let pairs = [CurrencyPair::new("ATOM", "USDT")];
        let candles = h.cache.candles_for(ProviderKind::Crypto, &pairs).unwrap();
        assert_eq!(candles["ATOMUSDT"].len(), 1);
        assert_eq!(
            candles["ATOMUSDT"][0].price,
            Decimal::from_str("28.30").unwrap()
        );
    }
}
