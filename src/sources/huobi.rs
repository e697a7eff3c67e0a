//! Huobi websocket adapter.
//!
//! Huobi compresses every frame with gzip and expects `{"ping": n}`
//! messages to be answered with `{"pong": n}` on the same connection.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::read::GzDecoder;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message;
use tracing::warn;

use crate::sources::websocket::{self, Subscriptions, VenueHandler};
use crate::sources::{Endpoint, PriceCache, Provider, ProviderKind};
use crate::types::{CandlePrice, CurrencyPair, Result, TickerPrice};

const HUOBI_WS_HOST: &str = "api.huobi.pro";

pub struct HuobiProvider {
    cache: Arc<PriceCache>,
    subs: Subscriptions,
}

impl HuobiProvider {
    pub fn new(
        endpoint: Option<&Endpoint>,
        pairs: &[CurrencyPair],
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let host = endpoint
            .map(|e| e.websocket.clone())
            .unwrap_or_else(|| HUOBI_WS_HOST.to_string());

        let cache = Arc::new(PriceCache::default());
        let handler = Arc::new(HuobiHandler {
            host,
            cache: Arc::clone(&cache),
        });
        let subs = websocket::spawn(handler, pairs.to_vec(), shutdown);

        Self { cache, subs }
    }
}

#[async_trait]
impl Provider for HuobiProvider {
    async fn subscribe(&self, pairs: &[CurrencyPair]) -> Result<()> {
        self.subs.add(pairs.to_vec());
        Ok(())
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>> {
        self.cache.tickers_for(ProviderKind::Huobi, pairs)
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>> {
        self.cache.candles_for(ProviderKind::Huobi, pairs)
    }
}

struct HuobiHandler {
    host: String,
    cache: Arc<PriceCache>,
}

impl VenueHandler for HuobiHandler {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Huobi
    }

    fn ws_url(&self) -> String {
        format!("wss://{}/ws", self.host)
    }

    fn subscription_frames(&self, pairs: &[CurrencyPair]) -> Vec<Message> {
        pairs
            .iter()
            .flat_map(|pair| {
                let symbol = pair.to_string().to_lowercase();
                [
                    json!({ "sub": format!("market.{symbol}.ticker") }),
                    json!({ "sub": format!("market.{symbol}.kline.1min") }),
                ]
            })
            .map(|msg| Message::Text(msg.to_string().into()))
            .collect()
    }

    fn decode_binary(&self, payload: &[u8]) -> Option<String> {
        let mut text = String::new();
        match GzDecoder::new(payload).read_to_string(&mut text) {
            Ok(_) => Some(text),
            Err(err) => {
                warn!(provider = "huobi", error = %err, "failed to gunzip frame");
                None
            }
        }
    }

    fn on_text(&self, text: &str) -> Option<Message> {
        let value: Value = serde_json::from_str(text).ok()?;

        if let Some(ping) = value.get("ping").and_then(Value::as_i64) {
            return Some(Message::Text(json!({ "pong": ping }).to_string().into()));
        }

        let channel = value["ch"].as_str()?;
        let symbol = channel_symbol(channel)?;
        let tick = value.get("tick")?;

        if channel.ends_with(".ticker") {
            self.handle_ticker(symbol, tick);
        } else if channel.contains(".kline.") {
            self.handle_kline(symbol, tick);
        }
        None
    }
}

impl HuobiHandler {
    fn handle_ticker(&self, symbol: String, tick: &Value) {
        let price = tick["lastPrice"].as_f64().and_then(dec_from_f64);
        let volume = tick["vol"].as_f64().and_then(dec_from_f64);
        let (Some(price), Some(volume)) = (price, volume) else {
            warn!(provider = "huobi", %symbol, "malformed ticker tick");
            return;
        };
        self.cache.set_ticker(symbol, TickerPrice { price, volume });
    }

    /// Kline tick: `id` is the bucket open time in epoch seconds; the
    /// bucket is re-emitted as it fills.
    fn handle_kline(&self, symbol: String, tick: &Value) {
        let bucket = tick["id"].as_i64();
        let price = tick["close"].as_f64().and_then(dec_from_f64);
        let volume = tick["vol"].as_f64().and_then(dec_from_f64);
        let (Some(bucket), Some(price), Some(volume)) = (bucket, price, volume) else {
            warn!(provider = "huobi", %symbol, "malformed kline tick");
            return;
        };
        self.cache.upsert_candle(
            symbol,
            CandlePrice {
                price,
                volume,
                timestamp: bucket * 1000,
            },
        );
    }
}

/// "market.atomusdt.ticker" -> "ATOMUSDT".
fn channel_symbol(channel: &str) -> Option<String> {
    channel
        .split('.')
        .nth(1)
        .map(|symbol| symbol.to_uppercase())
}

fn dec_from_f64(f: f64) -> Option<Decimal> {
    Decimal::try_from(f).ok()
}
