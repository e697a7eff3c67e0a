//! Read-only status API handlers.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use serde::Serialize;

use crate::oracle::{Oracle, TICK_INTERVAL};
use crate::sources::ProviderKind;

pub struct AppState {
    pub oracle: Arc<Oracle>,
}

#[derive(Debug, Serialize)]
pub struct PricesResponse {
    /// Rates rendered with the chain's 18 fractional digits.
    pub prices: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
pub struct ProviderPricesResponse {
    pub tvwaps_by_provider: HashMap<String, HashMap<String, String>>,
    pub vwaps_by_provider: HashMap<String, HashMap<String, String>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub last_sync: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn render_prices(
    prices: HashMap<String, rust_decimal::Decimal>,
) -> HashMap<String, String> {
    prices
        .into_iter()
        .map(|(base, price)| {
            let mut price = price;
            price.rescale(18);
            (base, price.to_string())
        })
        .collect()
}

fn render_by_provider(
    breakdown: HashMap<ProviderKind, HashMap<String, rust_decimal::Decimal>>,
) -> HashMap<String, HashMap<String, String>> {
    breakdown
        .into_iter()
        .map(|(provider, prices)| (provider.to_string(), render_prices(prices)))
        .collect()
}

/// GET /api/v1/prices
pub async fn get_prices(
    State(state): State<Arc<AppState>>,
) -> Result<Json<PricesResponse>, (StatusCode, Json<ErrorResponse>)> {
    let prices = state.oracle.prices();
    if prices.is_empty() {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "no prices available yet".to_string(),
            }),
        ));
    }

    Ok(Json(PricesResponse {
        prices: render_prices(prices),
    }))
}

/// GET /api/v1/prices/providers
pub async fn get_provider_prices(
    State(state): State<Arc<AppState>>,
) -> Json<ProviderPricesResponse> {
    Json(ProviderPricesResponse {
        tvwaps_by_provider: render_by_provider(state.oracle.tvwap_prices()),
        vwaps_by_provider: render_by_provider(state.oracle.vwap_prices()),
    })
}

/// GET /api/v1/healthz — healthy while the last successful tick is
/// within two tick intervals.
pub async fn healthz(
    State(state): State<Arc<AppState>>,
) -> Result<Json<HealthResponse>, (StatusCode, Json<ErrorResponse>)> {
    let last_sync = state.oracle.last_price_sync();
    let stale = match last_sync {
        Some(ts) => {
            let age = Utc::now().signed_duration_since(ts);
            age.num_milliseconds() > 2 * TICK_INTERVAL.as_millis() as i64
        }
        None => true,
    };

    if stale {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorResponse {
                error: "price sync is stale".to_string(),
            }),
        ));
    }

    Ok(Json(HealthResponse {
        status: "ok",
        last_sync: last_sync.map(|ts| ts.to_rfc3339()),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn prices_render_with_eighteen_digits() {
        let prices = HashMap::from([("ATOM".to_string(), Decimal::from_str("28.21").unwrap())]);
        let rendered = render_prices(prices);
        assert_eq!(rendered["ATOM"], "28.210000000000000000");
    }

    #[test]
    fn provider_breakdown_keys_are_provider_names() {
        let breakdown = HashMap::from([(
            ProviderKind::Kraken,
            HashMap::from([("ATOM".to_string(), Decimal::ONE)]),
        )]);
        let rendered = render_by_provider(breakdown);
        assert!(rendered.contains_key("kraken"));
    }
}
