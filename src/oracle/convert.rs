//! Conversion of non-USD-quoted observations into USD.
//!
//! Conversion is strictly per-provider: a venue's `BASE/QUOTE` price is
//! bridged with that same venue's `QUOTE/USD` rate, keeping each
//! provider's books coherent instead of mixing venues. Observations a
//! provider cannot bridge itself are dropped.

use std::collections::HashSet;

use tracing::debug;

use crate::oracle::aggregators::compute_tvwap;
use crate::oracle::AggregationError;
use crate::sources::ProviderKind;
use crate::types::{
    AggregatedProviderCandles, AggregatedProviderPrices, CurrencyPair, ProviderPairs,
};

const DENOM_USD: &str = "USD";

/// The quotes (other than USD) appearing in `pairs`, after verifying each
/// one has at least one `(quote, USD)` feed somewhere in the config.
fn required_quotes(pairs: &ProviderPairs) -> Result<HashSet<String>, AggregationError> {
    let mut quotes = HashSet::new();
    for pair in pairs.values().flatten() {
        if pair.quote != DENOM_USD {
            quotes.insert(pair.quote.clone());
        }
    }

    for quote in &quotes {
        let convertible = pairs
            .values()
            .flatten()
            .any(|p| p.base == *quote && p.quote == DENOM_USD);
        if !convertible {
            return Err(AggregationError::NoUsdConversion(quote.clone()));
        }
    }

    Ok(quotes)
}

fn provider_sources_usd_pair(pairs: &ProviderPairs, provider: ProviderKind, base: &str) -> bool {
    pairs
        .get(&provider)
        .map(|ps| ps.contains(&CurrencyPair::new(base, DENOM_USD)))
        .unwrap_or(false)
}

/// Rewrite candle prices into USD terms using each provider's own quote
/// feed; the quote rate is the provider's single-venue TVWAP.
pub fn convert_candles_to_usd(
    mut candles: AggregatedProviderCandles,
    pairs: &ProviderPairs,
    now_ms: i64,
) -> Result<AggregatedProviderCandles, AggregationError> {
    required_quotes(pairs)?;

    for (provider, provider_pairs) in pairs {
        for pair in provider_pairs {
            if pair.quote == DENOM_USD {
                continue;
            }

            let rate = if provider_sources_usd_pair(pairs, *provider, &pair.quote) {
                candles
                    .get(provider)
                    .and_then(|pc| pc.get(&pair.quote))
                    .map(|series| {
                        let single = AggregatedProviderCandles::from([(
                            *provider,
                            std::collections::HashMap::from([(
                                pair.quote.clone(),
                                series.clone(),
                            )]),
                        )]);
                        compute_tvwap(&single, now_ms)
                    })
                    .transpose()?
                    .and_then(|tvwap| tvwap.get(&pair.quote).copied())
            } else {
                None
            };

            let Some(provider_candles) = candles.get_mut(provider) else {
                continue;
            };
            match rate {
                Some(rate) => {
                    if let Some(series) = provider_candles.get_mut(&pair.base) {
                        for candle in series {
                            candle.price *= rate;
                        }
                    }
                }
                None => {
                    if provider_candles.remove(&pair.base).is_some() {
                        debug!(
                            provider = %provider,
                            base = %pair.base,
                            quote = %pair.quote,
                            "dropping candles without an in-venue USD bridge"
                        );
                    }
                }
            }
        }
    }

    Ok(candles)
}

/// Rewrite ticker prices into USD terms using each provider's own quote
/// ticker.
pub fn convert_tickers_to_usd(
    mut prices: AggregatedProviderPrices,
    pairs: &ProviderPairs,
) -> Result<AggregatedProviderPrices, AggregationError> {
    required_quotes(pairs)?;

    for (provider, provider_pairs) in pairs {
        for pair in provider_pairs {
            if pair.quote == DENOM_USD {
                continue;
            }

            let rate = if provider_sources_usd_pair(pairs, *provider, &pair.quote) {
                prices
                    .get(provider)
                    .and_then(|pp| pp.get(&pair.quote))
                    .map(|t| t.price)
            } else {
                None
            };

            let Some(provider_prices) = prices.get_mut(provider) else {
                continue;
            };
            match rate {
                Some(rate) => {
                    if let Some(ticker) = provider_prices.get_mut(&pair.base) {
                        ticker.price *= rate;
                    }
                }
                None => {
                    if provider_prices.remove(&pair.base).is_some() {
                        debug!(
                            provider = %provider,
                            base = %pair.base,
                            quote = %pair.quote,
                            "dropping ticker without an in-venue USD bridge"
                        );
                    }
                }
            }
        }
    }

    Ok(prices)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandlePrice, TickerPrice};
    use rust_decimal::Decimal;
    use std::collections::HashMap;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn pairs_with_bridge() -> ProviderPairs {
        ProviderPairs::from([(
            ProviderKind::Binance,
            vec![
                CurrencyPair::new("ATOM", "OSMO"),
                CurrencyPair::new("OSMO", "USD"),
            ],
        )])
    }

    #[test]
    fn ticker_bridged_through_same_provider() {
        let prices = AggregatedProviderPrices::from([(
            ProviderKind::Binance,
            HashMap::from([
                (
                    "ATOM".to_string(),
                    TickerPrice {
                        price: dec("29.93"),
                        volume: dec("894123.00"),
                    },
                ),
                (
                    "OSMO".to_string(),
                    TickerPrice {
                        price: dec("0.98"),
                        volume: dec("894123.00"),
                    },
                ),
            ]),
        )]);

        let converted = convert_tickers_to_usd(prices, &pairs_with_bridge()).unwrap();
        assert_eq!(
            converted[&ProviderKind::Binance]["ATOM"].price,
            dec("29.3314")
        );
        // The quote's own USD feed is untouched.
        assert_eq!(converted[&ProviderKind::Binance]["OSMO"].price, dec("0.98"));
    }

    #[test]
    fn candles_bridged_through_same_provider() {
        let now_ms = 1_660_000_000_000;
        let candle = |price: &str| CandlePrice {
            price: dec(price),
            volume: dec("894123.00"),
            timestamp: now_ms - 60_000,
        };

        let candles = AggregatedProviderCandles::from([(
            ProviderKind::Binance,
            HashMap::from([
                ("ATOM".to_string(), vec![candle("29.93")]),
                ("OSMO".to_string(), vec![candle("0.98")]),
            ]),
        )]);

        let converted = convert_candles_to_usd(candles, &pairs_with_bridge(), now_ms).unwrap();
        assert_eq!(
            converted[&ProviderKind::Binance]["ATOM"][0].price,
            dec("29.3314")
        );
    }

    #[test]
    fn observation_without_in_venue_bridge_is_dropped() {
        // Binance sources ATOM/OSMO but not OSMO/USD; Kraken carries the
        // OSMO/USD feed. Binance's ATOM cannot be bridged in-venue.
        let pairs = ProviderPairs::from([
            (
                ProviderKind::Binance,
                vec![CurrencyPair::new("ATOM", "OSMO")],
            ),
            (ProviderKind::Kraken, vec![CurrencyPair::new("OSMO", "USD")]),
        ]);

        let prices = AggregatedProviderPrices::from([
            (
                ProviderKind::Binance,
                HashMap::from([(
                    "ATOM".to_string(),
                    TickerPrice {
                        price: dec("29.93"),
                        volume: dec("1"),
                    },
                )]),
            ),
            (
                ProviderKind::Kraken,
                HashMap::from([(
                    "OSMO".to_string(),
                    TickerPrice {
                        price: dec("0.98"),
                        volume: dec("1"),
                    },
                )]),
            ),
        ]);

        let converted = convert_tickers_to_usd(prices, &pairs).unwrap();
        assert!(!converted[&ProviderKind::Binance].contains_key("ATOM"));
        assert!(converted[&ProviderKind::Kraken].contains_key("OSMO"));
    }

    #[test]
    fn unconvertible_quote_is_an_error() {
        let pairs = ProviderPairs::from([(
            ProviderKind::Binance,
            vec![CurrencyPair::new("ATOM", "OSMO")],
        )]);

        let err = convert_tickers_to_usd(AggregatedProviderPrices::new(), &pairs).unwrap_err();
        assert_eq!(err.to_string(), "no USD conversion providers for quote OSMO");
    }
}
