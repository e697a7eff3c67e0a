//! Mock provider backed by a published spreadsheet of fake rates,
//! fetched once at startup as CSV and replayed row by row.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;

use crate::sources::{Endpoint, Provider, ProviderKind};
use crate::types::{CandlePrice, CurrencyPair, ProviderError, Result, TickerPrice};

// Published Google Sheets document containing mock exchange rates.
const MOCK_BASE_URL: &str = "https://docs.google.com/spreadsheets/d/e/2PACX-1vQwfo4t2r3CGoVtyzvVfk_th_t8Domm_su1VKYJJ14Qxs63qbj6gFYpFtJF_RDXydijQk5KZh7-cmft/pub?output=csv";

struct TickerRotation {
    items: Vec<TickerPrice>,
    index: usize,
    /// Last ticker handed out, so ticker and candle reads agree.
    last: Option<TickerPrice>,
}

pub struct MockProvider {
    prices: Mutex<HashMap<String, TickerRotation>>,
}

impl MockProvider {
    pub async fn new(endpoint: Option<&Endpoint>) -> Result<Self> {
        let url = endpoint
            .map(|e| e.rest.clone())
            .unwrap_or_else(|| MOCK_BASE_URL.to_string());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ProviderError::Api(e.to_string()))?;

        let body = client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProviderError::Api(e.to_string()))?
            .error_for_status()
            .map_err(|e| ProviderError::Api(e.to_string()))?
            .text()
            .await
            .map_err(|e| ProviderError::Api(e.to_string()))?;

        Ok(Self {
            prices: Mutex::new(parse_rates_csv(&body)?),
        })
    }
}

/// Rows are `base,quote,price,volume` with a header line.
fn parse_rates_csv(body: &str) -> Result<HashMap<String, TickerRotation>> {
    let mut prices: HashMap<String, TickerRotation> = HashMap::new();

    for (i, line) in body.lines().skip(1).enumerate() {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            continue;
        }
        let ticker = format!("{}{}", fields[0], fields[1]).to_uppercase();
        let price = Decimal::from_str(fields[2]).map_err(|_| {
            ProviderError::InvalidResponse(format!(
                "failed to read mock price ({}) for {} at row {}",
                fields[2], ticker, i
            ))
        })?;
        let volume = Decimal::from_str(fields[3]).map_err(|_| {
            ProviderError::InvalidResponse(format!(
                "failed to read mock volume ({}) for {}",
                fields[3], ticker
            ))
        })?;

        prices
            .entry(ticker)
            .or_insert_with(|| TickerRotation {
                items: Vec::new(),
                index: 0,
                last: None,
            })
            .items
            .push(TickerPrice { price, volume });
    }

    Ok(prices)
}

#[async_trait]
impl Provider for MockProvider {
    async fn subscribe(&self, _pairs: &[CurrencyPair]) -> Result<()> {
        // No live feed to amend; the sheet was loaded at startup.
        Ok(())
    }

    async fn get_ticker_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, TickerPrice>> {
        let mut prices = self.prices.lock().expect("mock prices poisoned");
        let mut out = HashMap::with_capacity(pairs.len());

        for pair in pairs {
            let symbol = pair.to_string().to_uppercase();
            let rotation =
                prices
                    .get_mut(&symbol)
                    .ok_or_else(|| ProviderError::TickerNotFound {
                        provider: ProviderKind::Mock,
                        symbol: symbol.clone(),
                    })?;

            if rotation.index >= rotation.items.len() {
                rotation.index = 0;
            }
            let ticker = rotation.items[rotation.index].clone();
            rotation.index += 1;
            rotation.last = Some(ticker.clone());
            out.insert(symbol, ticker);
        }

        Ok(out)
    }

    async fn get_candle_prices(
        &self,
        pairs: &[CurrencyPair],
    ) -> Result<HashMap<String, Vec<CandlePrice>>> {
        let prices = self.prices.lock().expect("mock prices poisoned");
        let mut out = HashMap::with_capacity(pairs.len());
        let timestamp = Utc::now().timestamp_millis() - 60_000;

        for pair in pairs {
            let symbol = pair.to_string().to_uppercase();
            let rotation = prices
                .get(&symbol)
                .ok_or_else(|| ProviderError::CandleNotFound {
                    provider: ProviderKind::Mock,
                    symbol: symbol.clone(),
                })?;

            // Mirror the last ticker so both reads tell the same story.
            let ticker = rotation
                .last
                .clone()
                .or_else(|| rotation.items.first().cloned())
                .ok_or_else(|| ProviderError::CandleNotFound {
                    provider: ProviderKind::Mock,
                    symbol: symbol.clone(),
                })?;

            out.insert(
                symbol,
                vec![CandlePrice {
                    price: ticker.price,
                    volume: ticker.volume,
                    timestamp,
                }],
            );
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CSV: &str = "base,quote,price,volume\nATOM,USD,28.21,1000.5\nATOM,USD,28.35,1001.5\nOSMO,USD,0.98,500.0\n";

    fn provider() -> MockProvider {
        MockProvider {
            prices: Mutex::new(parse_rates_csv(CSV).unwrap()),
        }
    }

    #[tokio::test]
    async fn tickers_rotate_through_rows() {
        let p = provider();
        let pairs = [CurrencyPair::new("ATOM", "USD")];

        let first = p.get_ticker_prices(&pairs).await.unwrap();
        assert_eq!(first["ATOMUSD"].price, Decimal::from_str("28.21").unwrap());

        let second = p.get_ticker_prices(&pairs).await.unwrap();
        assert_eq!(second["ATOMUSD"].price, Decimal::from_str("28.35").unwrap());

        // Wraps around.
        let third = p.get_ticker_prices(&pairs).await.unwrap();
        assert_eq!(third["ATOMUSD"].price, Decimal::from_str("28.21").unwrap());
    }

    #[tokio::test]
    async fn candles_mirror_last_ticker() {
        let p = provider();
        let pairs = [CurrencyPair::new("ATOM", "USD")];

        p.get_ticker_prices(&pairs).await.unwrap();
        let candles = p.get_candle_prices(&pairs).await.unwrap();
        assert_eq!(candles["ATOMUSD"].len(), 1);
        assert_eq!(
            candles["ATOMUSD"][0].price,
            Decimal::from_str("28.21").unwrap()
        );
    }

    #[tokio::test]
    async fn unknown_pair_errors() {
        let p = provider();
        let pairs = [CurrencyPair::new("FOO", "BAR")];
        let err = p.get_ticker_prices(&pairs).await.unwrap_err();
        assert_eq!(err.to_string(), "mock failed to get ticker price for FOOBAR");
    }

    #[test]
    fn malformed_price_is_rejected() {
        let bad = "base,quote,price,volume\nATOM,USD,notanumber,1\n";
        assert!(parse_rates_csv(bad).is_err());
    }
}
