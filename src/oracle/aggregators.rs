//! Volume- and time-volume-weighted average price computation.

use std::collections::HashMap;

use rust_decimal::{Decimal, MathematicalOps};

use crate::oracle::AggregationError;
use crate::sources::ProviderKind;
use crate::types::{AggregatedProviderCandles, AggregatedProviderPrices, PricesByProvider};

/// Time period candles participate in the TVWAP, in milliseconds.
pub const TVWAP_WINDOW_MS: i64 = 5 * 60 * 1000;

/// Weight floor so the oldest in-window candle still contributes.
fn minimum_time_weight() -> Decimal {
    Decimal::new(2, 1) // 0.2
}

/// Volume floor for low-liquidity venues, so a zero-volume candle does
/// not erase its price signal.
fn minimum_candle_volume() -> Decimal {
    Decimal::new(1, 4) // 0.0001
}

/// Final step shared by VWAP and TVWAP: Σ{P·V} / Σ{V} per base, skipping
/// bases whose volume sum is zero.
fn vwap(
    weighted_prices: HashMap<String, Decimal>,
    volume_sum: &HashMap<String, Decimal>,
) -> HashMap<String, Decimal> {
    weighted_prices
        .into_iter()
        .filter_map(|(base, weighted)| {
            let volume = volume_sum.get(&base)?;
            if volume.is_zero() {
                return None;
            }
            Some((base, weighted / volume))
        })
        .collect()
}

/// Volume-weighted average price across all providers for each base.
///
/// Ref: https://en.wikipedia.org/wiki/Volume-weighted_average_price
pub fn compute_vwap(prices: &AggregatedProviderPrices) -> HashMap<String, Decimal> {
    let mut weighted_prices: HashMap<String, Decimal> = HashMap::new();
    let mut volume_sum: HashMap<String, Decimal> = HashMap::new();

    for provider_prices in prices.values() {
        for (base, ticker) in provider_prices {
            *weighted_prices.entry(base.clone()).or_default() += ticker.price * ticker.volume;
            *volume_sum.entry(base.clone()).or_default() += ticker.volume;
        }
    }

    vwap(weighted_prices, &volume_sum)
}

/// Time-volume-weighted average price across providers, over candles
/// observed within the last [`TVWAP_WINDOW_MS`] before `now_ms`.
///
/// Candle weight decays linearly with age down to the minimum time
/// weight; the decay slope is anchored at each provider's oldest candle.
pub fn compute_tvwap(
    candles: &AggregatedProviderCandles,
    now_ms: i64,
) -> Result<HashMap<String, Decimal>, AggregationError> {
    let mut weighted_prices: HashMap<String, Decimal> = HashMap::new();
    let mut volume_sum: HashMap<String, Decimal> = HashMap::new();
    let window_start = now_ms - TVWAP_WINDOW_MS;

    for provider_candles in candles.values() {
        for (base, series) in provider_candles {
            if series.is_empty() {
                continue;
            }

            let mut series = series.clone();
            series.sort_by_key(|c| c.timestamp);

            let period = Decimal::from(now_ms - series[0].timestamp);
            if period.is_zero() {
                return Err(AggregationError::ZeroTvwapPeriod);
            }
            // weightUnit = (1 - minimumTimeWeight) / period
            let weight_unit = (Decimal::ONE - minimum_time_weight()) / period;

            for candle in &series {
                if candle.timestamp <= window_start {
                    continue;
                }
                let time_diff = Decimal::from(now_ms - candle.timestamp);
                let volume = candle.volume.max(minimum_candle_volume());

                // volume' = volume * (weightUnit * (period - timeDiff) + minimumTimeWeight)
                let weighted_volume =
                    volume * (weight_unit * (period - time_diff) + minimum_time_weight());

                *volume_sum.entry(base.clone()).or_default() += weighted_volume;
                *weighted_prices.entry(base.clone()).or_default() +=
                    candle.price * weighted_volume;
            }
        }
    }

    Ok(vwap(weighted_prices, &volume_sum))
}

/// Standard deviation and mean per base. Bases quoted by fewer than
/// three providers are skipped.
pub fn stddevs_and_means(
    prices: &HashMap<ProviderKind, HashMap<String, Decimal>>,
) -> (HashMap<String, Decimal>, HashMap<String, Decimal>) {
    let mut samples: HashMap<String, Vec<Decimal>> = HashMap::new();
    for provider_prices in prices.values() {
        for (base, price) in provider_prices {
            samples.entry(base.clone()).or_default().push(*price);
        }
    }

    let mut stddevs = HashMap::new();
    let mut means = HashMap::new();

    for (base, prices) in samples {
        if prices.len() < 3 {
            continue;
        }

        let count = Decimal::from(prices.len());
        let mean = prices.iter().sum::<Decimal>() / count;
        let variance = prices
            .iter()
            .map(|p| (p - mean) * (p - mean))
            .sum::<Decimal>()
            / count;

        if let Some(stddev) = variance.sqrt() {
            stddevs.insert(base.clone(), stddev);
            means.insert(base, mean);
        }
    }

    (stddevs, means)
}

/// TVWAP computed over each provider's candles in isolation.
pub fn tvwaps_by_provider(
    candles: &AggregatedProviderCandles,
    now_ms: i64,
) -> Result<PricesByProvider, AggregationError> {
    let mut out = PricesByProvider::new();
    for (provider, provider_candles) in candles {
        let single = AggregatedProviderCandles::from([(*provider, provider_candles.clone())]);
        out.insert(*provider, compute_tvwap(&single, now_ms)?);
    }
    Ok(out)
}

/// VWAP computed over each provider's tickers in isolation.
pub fn vwaps_by_provider(prices: &AggregatedProviderPrices) -> PricesByProvider {
    prices
        .iter()
        .map(|(provider, provider_prices)| {
            let single = AggregatedProviderPrices::from([(*provider, provider_prices.clone())]);
            (*provider, compute_vwap(&single))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{CandlePrice, TickerPrice};
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    fn ticker(price: &str, volume: &str) -> TickerPrice {
        TickerPrice {
            price: dec(price),
            volume: dec(volume),
        }
    }

    #[test]
    fn vwap_of_two_providers_weights_by_volume() {
        let prices = AggregatedProviderPrices::from([
            (
                ProviderKind::Binance,
                HashMap::from([("ATOM".to_string(), ticker("28.21", "2749102.78"))]),
            ),
            (
                ProviderKind::Kraken,
                HashMap::from([("ATOM".to_string(), ticker("28.268700", "178277.53314385"))]),
            ),
        ]);

        let vwap = compute_vwap(&prices);
        let atom = vwap["ATOM"].round_dp(6);
        assert!(atom > dec("28.213") && atom < dec("28.214"), "got {atom}");
    }

    #[test]
    fn vwap_multi_asset_multi_provider() {
        let prices = AggregatedProviderPrices::from([
            (
                ProviderKind::Binance,
                HashMap::from([
                    ("ATOM".to_string(), ticker("28.21000000", "2749102.78000000")),
                    ("XPRT".to_string(), ticker("1.13000000", "249102.38000000")),
                    ("OSMO".to_string(), ticker("64.87000000", "7854934.69000000")),
                ]),
            ),
            (
                ProviderKind::Kraken,
                HashMap::from([
                    ("ATOM".to_string(), ticker("28.268700", "178277.53314385")),
                    ("OSMO".to_string(), ticker("64.87853000", "458917.46353577")),
                ]),
            ),
            (
                ProviderKind::Osmosis,
                HashMap::from([("ATOM".to_string(), ticker("28.168700", "4749102.53314385"))]),
            ),
        ]);

        let vwap = compute_vwap(&prices);
        assert_eq!(vwap.len(), 3);
        assert_eq!(vwap["ATOM"].round_dp(12), dec("28.185812745610"));
        assert_eq!(vwap["XPRT"], dec("1.13000000"));
        assert_eq!(vwap["OSMO"].round_dp(12), dec("64.870470848638"));
    }

    #[test]
    fn vwap_of_agreeing_providers_is_their_price() {
        let prices = AggregatedProviderPrices::from([
            (
                ProviderKind::Binance,
                HashMap::from([("ATOM".to_string(), ticker("28.21", "1000"))]),
            ),
            (
                ProviderKind::Kraken,
                HashMap::from([("ATOM".to_string(), ticker("28.21", "1000"))]),
            ),
            (
                ProviderKind::Coinbase,
                HashMap::from([("ATOM".to_string(), ticker("28.21", "1000"))]),
            ),
        ]);

        assert_eq!(compute_vwap(&prices)["ATOM"], dec("28.21"));
    }

    #[test]
    fn vwap_skips_zero_volume() {
        let prices = AggregatedProviderPrices::from([(
            ProviderKind::Binance,
            HashMap::from([("ATOM".to_string(), ticker("28.21", "0"))]),
        )]);
        assert!(compute_vwap(&prices).is_empty());
    }

    #[test]
    fn tvwap_single_fresh_candle_is_its_price() {
        // period = 60s, timeDiff = 0 => weight = 0.8 + 0.2 = 1.0
        let now_ms = 1_660_000_000_000;
        let candles = AggregatedProviderCandles::from([(
            ProviderKind::Binance,
            HashMap::from([(
                "ATOM".to_string(),
                vec![CandlePrice {
                    price: dec("30.00"),
                    volume: dec("1000"),
                    timestamp: now_ms - 60_000,
                }],
            )]),
        )]);

        let tvwap = compute_tvwap(&candles, now_ms).unwrap();
        assert_eq!(tvwap["ATOM"], dec("30.00"));
    }

    #[test]
    fn tvwap_decay_is_monotonic_in_age() {
        // Identical price/volume candles at different ages: the older
        // one must carry strictly less weight. Observed through the pull
        // the candle exerts against a fixed old anchor.
        let now_ms = 1_660_000_000_000;
        let mixed = |age_ms: i64| {
            let candles = AggregatedProviderCandles::from([(
                ProviderKind::Binance,
                HashMap::from([(
                    "ATOM".to_string(),
                    vec![
                        CandlePrice {
                            price: dec("10.00"),
                            volume: dec("1000"),
                            timestamp: now_ms - 240_000,
                        },
                        CandlePrice {
                            price: dec("30.00"),
                            volume: dec("1000"),
                            timestamp: now_ms - age_ms,
                        },
                    ],
                )]),
            )]);
            compute_tvwap(&candles, now_ms).unwrap()["ATOM"]
        };

        // The fresher the 30.00 candle, the closer the mix pulls to 30.
        assert!(mixed(30_000) > mixed(120_000));
        assert!(mixed(120_000) > mixed(200_000));
    }

    #[test]
    fn tvwap_ignores_expired_candles() {
        let now_ms = 1_660_000_000_000;
        let candles = AggregatedProviderCandles::from([(
            ProviderKind::Kraken,
            HashMap::from([(
                "ATOM".to_string(),
                vec![
                    CandlePrice {
                        price: dec("20.00"),
                        volume: dec("1000"),
                        timestamp: now_ms - TVWAP_WINDOW_MS - 10_000,
                    },
                    CandlePrice {
                        price: dec("30.00"),
                        volume: dec("1000"),
                        timestamp: now_ms - 60_000,
                    },
                ],
            )]),
        )]);

        let tvwap = compute_tvwap(&candles, now_ms).unwrap();
        assert_eq!(tvwap["ATOM"], dec("30.00"));
    }

    #[test]
    fn tvwap_all_candles_expired_is_empty() {
        let now_ms = 1_660_000_000_000;
        let candles = AggregatedProviderCandles::from([(
            ProviderKind::Kraken,
            HashMap::from([(
                "ATOM".to_string(),
                vec![CandlePrice {
                    price: dec("20.00"),
                    volume: dec("1000"),
                    timestamp: now_ms - TVWAP_WINDOW_MS - 10_000,
                }],
            )]),
        )]);

        assert!(compute_tvwap(&candles, now_ms).unwrap().is_empty());
    }

    #[test]
    fn tvwap_zero_period_fails() {
        let now_ms = 1_660_000_000_000;
        let candles = AggregatedProviderCandles::from([(
            ProviderKind::Kraken,
            HashMap::from([(
                "ATOM".to_string(),
                vec![CandlePrice {
                    price: dec("20.00"),
                    volume: dec("1000"),
                    timestamp: now_ms,
                }],
            )]),
        )]);

        assert!(matches!(
            compute_tvwap(&candles, now_ms),
            Err(AggregationError::ZeroTvwapPeriod)
        ));
    }

    #[test]
    fn zero_volume_candle_gets_floor_weight() {
        let now_ms = 1_660_000_000_000;
        let candles = AggregatedProviderCandles::from([(
            ProviderKind::Kraken,
            HashMap::from([(
                "ATOM".to_string(),
                vec![CandlePrice {
                    price: dec("30.00"),
                    volume: Decimal::ZERO,
                    timestamp: now_ms - 60_000,
                }],
            )]),
        )]);

        let tvwap = compute_tvwap(&candles, now_ms).unwrap();
        assert_eq!(tvwap["ATOM"], dec("30.00"));
    }

    #[test]
    fn stddev_skips_bases_with_few_providers() {
        let prices = HashMap::from([
            (
                ProviderKind::Binance,
                HashMap::from([
                    ("ATOM".to_string(), dec("28.21")),
                    ("XPRT".to_string(), dec("1.13")),
                ]),
            ),
            (
                ProviderKind::Kraken,
                HashMap::from([("ATOM".to_string(), dec("28.23"))]),
            ),
            (
                ProviderKind::Coinbase,
                HashMap::from([("ATOM".to_string(), dec("31.50"))]),
            ),
        ]);

        let (stddevs, means) = stddevs_and_means(&prices);
        assert!(stddevs.contains_key("ATOM"));
        assert!(!stddevs.contains_key("XPRT"));
        assert_eq!(means["ATOM"].round_dp(3), dec("29.313"));
        assert_eq!(stddevs["ATOM"].round_dp(3), dec("1.546"));
    }

    #[test]
    fn by_provider_breakdowns_are_isolated() {
        let prices = AggregatedProviderPrices::from([
            (
                ProviderKind::Binance,
                HashMap::from([("ATOM".to_string(), ticker("28.00", "100"))]),
            ),
            (
                ProviderKind::Kraken,
                HashMap::from([("ATOM".to_string(), ticker("30.00", "100"))]),
            ),
        ]);

        let by_provider = vwaps_by_provider(&prices);
        assert_eq!(by_provider[&ProviderKind::Binance]["ATOM"], dec("28.00"));
        assert_eq!(by_provider[&ProviderKind::Kraken]["ATOM"], dec("30.00"));
    }
}
