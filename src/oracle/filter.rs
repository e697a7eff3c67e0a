//! Cross-provider deviation filtering.

use std::collections::HashMap;

use rust_decimal::Decimal;
use tracing::warn;

use crate::oracle::aggregators::{compute_tvwap, stddevs_and_means};
use crate::oracle::AggregationError;
use crate::sources::ProviderKind;
use crate::types::{AggregatedProviderCandles, AggregatedProviderPrices};

/// How many σ a provider may sit from the mean before it is considered
/// faulty. Overridable per base in the config, capped at 3.0.
fn default_deviation_threshold() -> Decimal {
    Decimal::ONE
}

fn is_between(price: Decimal, mean: Decimal, margin: Decimal) -> bool {
    price >= mean - margin && price <= mean + margin
}

fn threshold_for(base: &str, thresholds: &HashMap<String, Decimal>) -> Decimal {
    thresholds
        .get(base)
        .copied()
        .unwrap_or_else(default_deviation_threshold)
}

/// Drop ticker observations from providers whose raw price sits outside
/// `threshold·σ` of the cross-provider mean. Bases without a σ (fewer
/// than three providers) pass through untouched.
pub fn filter_ticker_deviations(
    prices: AggregatedProviderPrices,
    thresholds: &HashMap<String, Decimal>,
) -> AggregatedProviderPrices {
    let mut price_map: HashMap<ProviderKind, HashMap<String, Decimal>> = HashMap::new();
    for (provider, tickers) in &prices {
        let entry = price_map.entry(*provider).or_default();
        for (base, ticker) in tickers {
            entry.insert(base.clone(), ticker.price);
        }
    }

    let (stddevs, means) = stddevs_and_means(&price_map);

    let mut filtered = AggregatedProviderPrices::new();
    for (provider, tickers) in prices {
        for (base, ticker) in tickers {
            let keep = match stddevs.get(&base) {
                Some(stddev) => is_between(
                    ticker.price,
                    means[&base],
                    stddev * threshold_for(&base, thresholds),
                ),
                None => true,
            };

            if keep {
                filtered
                    .entry(provider)
                    .or_default()
                    .insert(base, ticker);
            } else {
                warn!(
                    provider = %provider,
                    %base,
                    price = %ticker.price,
                    "provider deviating from other prices"
                );
            }
        }
    }

    filtered
}

/// Drop a provider's candles for a base when its single-venue TVWAP sits
/// outside `threshold·σ` of the cross-provider mean of those TVWAPs.
pub fn filter_candle_deviations(
    candles: AggregatedProviderCandles,
    thresholds: &HashMap<String, Decimal>,
    now_ms: i64,
) -> Result<AggregatedProviderCandles, AggregationError> {
    let mut tvwaps: HashMap<ProviderKind, HashMap<String, Decimal>> = HashMap::new();
    for (provider, provider_candles) in &candles {
        let single = AggregatedProviderCandles::from([(*provider, provider_candles.clone())]);
        tvwaps.insert(*provider, compute_tvwap(&single, now_ms)?);
    }

    let (stddevs, means) = stddevs_and_means(&tvwaps);

    let mut filtered = AggregatedProviderCandles::new();
    for (provider, provider_tvwaps) in &tvwaps {
        for (base, tvwap) in provider_tvwaps {
            let keep = match stddevs.get(base) {
                Some(stddev) => is_between(
                    *tvwap,
                    means[base],
                    stddev * threshold_for(base, thresholds),
                ),
                None => true,
            };

            if keep {
                if let Some(series) = candles.get(provider).and_then(|pc| pc.get(base)) {
                    filtered
                        .entry(*provider)
                        .or_default()
                        .insert(base.clone(), series.clone());
                }
            } else {
                warn!(
                    provider = %provider,
                    %base,
                    price = %tvwap,
                    "provider deviating from other candles"
                );
            }
        }
    }

    Ok(filtered)
}
