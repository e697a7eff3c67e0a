//! Osmosis adapter. The DEX has no websocket feed; a background task
//! polls the Imperator REST API for tickers and 5-minute chart candles.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::sources::{Endpoint, PriceCache, Provider, ProviderKind};
use crate::types::{CandlePrice, CurrencyPair, Result, TickerPrice};

const OSMOSIS_REST_HOST: &str = "api-osmosis.imperator.co";
const POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct OsmosisToken {
    symbol: String,
    price: f64,
    volume_24h: f64,
}

#[derive(Debug, Deserialize)]
struct OsmosisCandle {
    /// Bucket open time, epoch seconds.
    time: i64,
    close: f64,
    volume: f64,
}

pub struct OsmosisProvider {
    cache: Arc<PriceCache>,
    pairs: Arc<std::sync::RwLock<Vec<CurrencyPair>>>,
}

impl OsmosisProvider {
    pub fn new(
        endpoint: Option<&Endpoint>,
        pairs: &[CurrencyPair],
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let host = endpoint
            .map(|e| e.rest.clone())
            .unwrap_or_else(|| OSMOSIS_REST_HOST.to_string());

        let cache = Arc::new(PriceCache::default());
        let pairs = Arc::new(std::sync::RwLock::new(pairs.to_vec()));

        tokio::spawn(poll_loop(
            host,
            Arc::clone(&cache),
            Arc::clone(&pairs),
            shutdown,
        ));

        Self { cache, pairs }
    }
}

#[async_trait]
impl Provider for OsmosisProvider {
    async fn subscribe(&self, pairs: &[CurrencyPair]) -> Result<()> {
        let mut subscribed = self.pairs.write().expect("pair set poisoned");
        for pair in pairs {
            if !subscribed.contains(pair) {
                subscribed.push(pair.clone());
            }
        }
        Ok(())
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>> {
        self.cache.tickers_for(ProviderKind::Osmosis, pairs)
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>> {
        self.cache.candles_for(ProviderKind::Osmosis, pairs)
    }
}

async fn poll_loop(
    host: String,
    cache: Arc<PriceCache>,
    pairs: Arc<std::sync::RwLock<Vec<CurrencyPair>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let client = match reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(err) => {
            warn!(provider = "osmosis", error = %err, "failed to build http client");
            return;
        }
    };

    while !*shutdown.borrow() {
        let snapshot = pairs.read().expect("pair set poisoned").clone();
        if let Err(err) = poll_once(&client, &host, &cache, &snapshot).await {
            warn!(provider = "osmosis", error = %err, "poll failed");
        }

        tokio::select! {
            _ = shutdown.changed() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

async fn poll_once(
    client: &reqwest::Client,
    host: &str,
    cache: &PriceCache,
    pairs: &[CurrencyPair],
) -> std::result::Result<(), reqwest::Error> {
    let tokens: Vec<OsmosisToken> = client
        .get(format!("https://{host}/tokens/v2/all"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let by_symbol: HashMap<String, &OsmosisToken> = tokens
        .iter()
        .map(|t| (t.symbol.to_uppercase(), t))
        .collect();

    for pair in pairs {
        let Some(token) = by_symbol.get(&pair.base.to_uppercase()) else {
            debug!(provider = "osmosis", base = %pair.base, "token not listed");
            continue;
        };
        let (Ok(price), Ok(volume)) = (
            Decimal::try_from(token.price),
            Decimal::try_from(token.volume_24h),
        ) else {
            continue;
        };
        cache.set_ticker(pair.to_string(), TickerPrice { price, volume });

        match fetch_chart(client, host, &pair.base).await {
            Ok(candles) => {
                for candle in candles {
                    cache.upsert_candle(pair.to_string(), candle);
                }
            }
            Err(err) => {
                debug!(provider = "osmosis", base = %pair.base, error = %err, "chart fetch failed");
            }
        }
    }

    Ok(())
}

async fn fetch_chart(
    client: &reqwest::Client,
    host: &str,
    base: &str,
) -> std::result::Result<Vec<CandlePrice>, reqwest::Error> {
    let raw: Vec<OsmosisCandle> = client
        .get(format!("https://{host}/tokens/v2/historical/{base}/chart"))
        .query(&[("tf", "5")])
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    Ok(raw
        .into_iter()
        .filter_map(|c| {
            Some(CandlePrice {
                price: Decimal::try_from(c.close).ok()?,
                volume: Decimal::try_from(c.volume).ok()?,
                timestamp: c.time * 1000,
            })
        })
        .collect())
}
