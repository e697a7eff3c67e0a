//! The oracle engine: periodically aggregates provider snapshots into
//! canonical USD rates and drives the on-chain commit-reveal vote.

pub mod aggregators;
pub mod convert;
pub mod filter;
pub mod param_cache;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::RngCore;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::chain::msgs::{
    aggregate_vote_hash, to_any, MsgAggregateExchangeRatePrevote, MsgAggregateExchangeRateVote,
    PREVOTE_TYPE_URL, VOTE_TYPE_URL,
};
use crate::chain::{ChainClient, ChainError, OracleParams};
use crate::oracle::param_cache::ParamCache;
use crate::sources::{new_provider, Endpoint, Provider, ProviderKind};
use crate::types::{
    AggregatedProviderCandles, AggregatedProviderPrices, PricesByProvider, ProviderError,
    ProviderPairs,
};

/// Minimum time between oracle ticks: enough to collect exchange rates
/// and land a prevote and vote inside each voting period.
pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum AggregationError {
    #[error("no USD conversion providers for quote {0}")]
    NoUsdConversion(String),

    #[error("unable to divide by zero tvwap period")]
    ZeroTvwapPeriod,
}

#[derive(Debug, thiserror::Error)]
pub enum OracleError {
    #[error("expected positive block height")]
    NonPositiveBlockHeight,

    #[error("price is not available")]
    NoPriceAvailable,

    #[error("oracle vote period is zero")]
    ZeroVotePeriod,

    #[error("failed to generate salt: zero length")]
    ZeroSaltLength,

    #[error("malformed exchange rates string")]
    MalformedExchangeRates,

    #[error(transparent)]
    Chain(#[from] ChainError),

    #[error(transparent)]
    Aggregation(#[from] AggregationError),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// The previous prevote submitted on-chain, owed a reveal vote in the
/// following voting period.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousPrevote {
    pub exchange_rates: String,
    pub salt: String,
    pub submit_block_height: i64,
}

/// Commit-reveal progress. At most one prevote is outstanding at any
/// time; both fields are cleared together on reveal or period miss.
#[derive(Debug, Default)]
struct VoteState {
    previous_prevote: Option<PreviousPrevote>,
    previous_vote_period: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteAction {
    /// Already voted this period, or too close to the boundary to land
    /// a tx.
    Skip,
    /// The reveal window was missed; drop the outstanding prevote.
    ResetMissed,
    Prevote,
    Reveal,
}

/// The pure transition function of the vote state machine.
fn plan_vote_action(
    state: &VoteState,
    current_period: i64,
    vote_period: i64,
    index_in_period: i64,
) -> VoteAction {
    let same_period = state
        .previous_vote_period
        .is_some_and(|previous| previous == current_period);
    if same_period || vote_period - index_in_period < 2 {
        return VoteAction::Skip;
    }

    if let Some(previous) = state.previous_vote_period {
        if current_period - previous != 1 {
            return VoteAction::ResetMissed;
        }
    }

    if state.previous_prevote.is_none() {
        VoteAction::Prevote
    } else {
        VoteAction::Reveal
    }
}

struct PriceState {
    prices: HashMap<String, Decimal>,
    last_sync: Option<DateTime<Utc>>,
}

pub struct Oracle {
    chain: Arc<ChainClient>,
    provider_pairs: ProviderPairs,
    provider_timeout: Duration,
    deviations: HashMap<String, Decimal>,
    endpoints: HashMap<ProviderKind, Endpoint>,
    shutdown: watch::Receiver<bool>,

    /// Adapters created lazily the first tick their name is referenced.
    providers: tokio::sync::Mutex<HashMap<ProviderKind, Arc<dyn Provider>>>,
    param_cache: Mutex<ParamCache>,
    vote_state: Mutex<VoteState>,

    price_state: RwLock<PriceState>,
    tvwaps_by_provider: RwLock<PricesByProvider>,
    vwaps_by_provider: RwLock<PricesByProvider>,
}

impl Oracle {
    pub fn new(
        chain: Arc<ChainClient>,
        provider_pairs: ProviderPairs,
        provider_timeout: Duration,
        deviations: HashMap<String, Decimal>,
        endpoints: HashMap<ProviderKind, Endpoint>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            chain,
            provider_pairs,
            provider_timeout,
            deviations,
            endpoints,
            shutdown,
            providers: tokio::sync::Mutex::new(HashMap::new()),
            param_cache: Mutex::new(ParamCache::new()),
            vote_state: Mutex::new(VoteState::default()),
            price_state: RwLock::new(PriceState {
                prices: HashMap::new(),
                last_sync: None,
            }),
            tvwaps_by_provider: RwLock::new(PricesByProvider::new()),
            vwaps_by_provider: RwLock::new(PricesByProvider::new()),
        }
    }

    /// Run oracle ticks until the shutdown signal fires. Tick failures
    /// are logged and the loop carries on.
    pub async fn run(&self) {
        let mut shutdown = self.shutdown.clone();
        info!("starting oracle");

        while !*shutdown.borrow() {
            debug!("starting oracle tick");
            if let Err(err) = self.execute_tick().await {
                error!(error = %err, "oracle tick failed");
            }

            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tokio::time::sleep(TICK_INTERVAL) => {}
            }
        }

        info!("oracle stopped");
    }

    /// Copy of the current canonical prices.
    pub fn prices(&self) -> HashMap<String, Decimal> {
        self.price_state
            .read()
            .expect("price state poisoned")
            .prices
            .clone()
    }

    /// When prices were last synced from the providers.
    pub fn last_price_sync(&self) -> Option<DateTime<Utc>> {
        self.price_state
            .read()
            .expect("price state poisoned")
            .last_sync
    }

    pub fn tvwap_prices(&self) -> PricesByProvider {
        self.tvwaps_by_provider
            .read()
            .expect("tvwap state poisoned")
            .clone()
    }

    pub fn vwap_prices(&self) -> PricesByProvider {
        self.vwaps_by_provider
            .read()
            .expect("vwap state poisoned")
            .clone()
    }

    async fn execute_tick(&self) -> Result<(), OracleError> {
        let block_height = self.chain.chain_height()?;
        if block_height < 1 {
            return Err(OracleError::NonPositiveBlockHeight);
        }

        let params = self.params_for(block_height).await?;
        let vote_period = params.vote_period as i64;
        if vote_period < 1 {
            return Err(OracleError::ZeroVotePeriod);
        }

        self.set_prices().await?;

        let next_height = block_height + 1;
        let current_period = next_height / vote_period;
        let index_in_period = next_height % vote_period;

        let action = {
            let state = self.vote_state.lock().expect("vote state poisoned");
            plan_vote_action(&state, current_period, vote_period, index_in_period)
        };

        match action {
            VoteAction::Skip => {
                info!(
                    vote_period,
                    current_vote_period = current_period,
                    "skipping until next voting period"
                );
                Ok(())
            }
            VoteAction::ResetMissed => {
                info!(
                    vote_period,
                    current_vote_period = current_period,
                    "missing vote during voting period"
                );
                let mut state = self.vote_state.lock().expect("vote state poisoned");
                *state = VoteState::default();
                Ok(())
            }
            VoteAction::Prevote => self.broadcast_prevote(next_height, vote_period).await,
            VoteAction::Reveal => {
                self.broadcast_vote(next_height, vote_period, index_in_period)
                    .await
            }
        }
    }

    /// Commit: hash the rates with a fresh salt and submit the prevote.
    async fn broadcast_prevote(
        &self,
        next_height: i64,
        vote_period: i64,
    ) -> Result<(), OracleError> {
        let exchange_rates = generate_exchange_rates_string(&self.prices())?;
        let salt = generate_salt(32)?;
        let hash = aggregate_vote_hash(&salt, &exchange_rates, &self.chain.validator_address);

        let msg = MsgAggregateExchangeRatePrevote {
            hash: hash.clone(),
            feeder: self.chain.feeder_address.clone(),
            validator: self.chain.validator_address.clone(),
        };

        info!(
            %hash,
            validator = %msg.validator,
            feeder = %msg.feeder,
            "broadcasting pre-vote"
        );
        // The reveal window is the next period; double the period leaves
        // slack for the commit to land.
        self.chain
            .broadcast_tx(next_height, vote_period * 2, vec![to_any(PREVOTE_TYPE_URL, &msg)])
            .await?;

        let current_height = self.chain.chain_height()?;
        let mut state = self.vote_state.lock().expect("vote state poisoned");
        state.previous_vote_period = Some(current_height / vote_period);
        state.previous_prevote = Some(PreviousPrevote {
            exchange_rates,
            salt,
            submit_block_height: current_height,
        });
        Ok(())
    }

    /// Reveal: submit the vote matching the outstanding prevote.
    async fn broadcast_vote(
        &self,
        next_height: i64,
        vote_period: i64,
        index_in_period: i64,
    ) -> Result<(), OracleError> {
        let Some(prevote) = self
            .vote_state
            .lock()
            .expect("vote state poisoned")
            .previous_prevote
            .clone()
        else {
            return Ok(());
        };

        let msg = MsgAggregateExchangeRateVote {
            salt: prevote.salt,
            exchange_rates: prevote.exchange_rates,
            feeder: self.chain.feeder_address.clone(),
            validator: self.chain.validator_address.clone(),
        };

        info!(
            exchange_rates = %msg.exchange_rates,
            validator = %msg.validator,
            feeder = %msg.feeder,
            "broadcasting vote"
        );
        self.chain
            .broadcast_tx(
                next_height,
                vote_period - index_in_period,
                vec![to_any(VOTE_TYPE_URL, &msg)],
            )
            .await?;

        let mut state = self.vote_state.lock().expect("vote state poisoned");
        *state = VoteState::default();
        Ok(())
    }

    /// Oracle module params for the given height, fetched at most once
    /// per voting-period bucket.
    async fn params_for(&self, block_height: i64) -> Result<OracleParams, OracleError> {
        {
            let cache = self.param_cache.lock().expect("param cache poisoned");
            if let Some(params) = cache.get(block_height) {
                return Ok(params.clone());
            }
        }

        let params = self.chain.oracle_params().await?;
        self.check_accept_list(&params);

        let mut cache = self.param_cache.lock().expect("param cache poisoned");
        cache.update(block_height, params.clone());
        Ok(params)
    }

    fn check_accept_list(&self, params: &OracleParams) {
        let prices = self.prices();
        for symbol in &params.accept_list {
            if !prices.contains_key(symbol) {
                warn!(denom = %symbol, "price missing for required denom");
            }
        }
    }

    /// Fan out snapshot reads to every provider, aggregate, and publish
    /// the result atomically.
    async fn set_prices(&self) -> Result<(), OracleError> {
        let mut join_set = JoinSet::new();
        let mut required_rates: HashSet<String> = HashSet::new();

        for (kind, pairs) in &self.provider_pairs {
            let provider = self.provider_for(*kind).await?;
            for pair in pairs {
                required_rates.insert(pair.base.clone());
            }

            let kind = *kind;
            let pairs = pairs.clone();
            let timeout = self.provider_timeout;
            join_set.spawn(async move {
                let tickers =
                    tokio::time::timeout(timeout, provider.get_ticker_prices(&pairs)).await;
                let candles =
                    tokio::time::timeout(timeout, provider.get_candle_prices(&pairs)).await;
                (kind, pairs, tickers, candles)
            });
        }

        let mut provider_prices = AggregatedProviderPrices::new();
        let mut provider_candles = AggregatedProviderCandles::new();

        while let Some(joined) = join_set.join_next().await {
            let Ok((kind, pairs, tickers, candles)) = joined else {
                continue;
            };

            // A provider that errors or misses the snapshot deadline is
            // simply absent this tick.
            let tickers = match tickers {
                Ok(Ok(tickers)) => Some(tickers),
                Ok(Err(err)) => {
                    warn!(provider = %kind, error = %err, "failed to get ticker prices from provider");
                    None
                }
                Err(_) => {
                    warn!(provider = %kind, "provider timed out during snapshot");
                    None
                }
            };
            let candles = match candles {
                Ok(Ok(candles)) => Some(candles),
                Ok(Err(err)) => {
                    warn!(provider = %kind, error = %err, "failed to get candle prices from provider");
                    None
                }
                Err(_) => None,
            };

            for pair in &pairs {
                let symbol = pair.to_string();
                if let Some(ticker) = tickers.as_ref().and_then(|t| t.get(&symbol)) {
                    provider_prices
                        .entry(kind)
                        .or_default()
                        .insert(pair.base.clone(), ticker.clone());
                }
                if let Some(series) = candles.as_ref().and_then(|c| c.get(&symbol)) {
                    provider_candles
                        .entry(kind)
                        .or_default()
                        .insert(pair.base.clone(), series.clone());
                }
            }
        }

        let computed = self.computed_prices(provider_candles, provider_prices)?;

        for base in &required_rates {
            if !computed.contains_key(base) {
                warn!(asset = %base, "unable to report price for expected asset");
            }
        }

        let mut state = self.price_state.write().expect("price state poisoned");
        state.prices = computed;
        state.last_sync = Some(Utc::now());
        Ok(())
    }

    /// The aggregation pipeline: bridge to USD, filter deviants, TVWAP
    /// over candles, falling back to ticker VWAP when no candle survived
    /// the window.
    fn computed_prices(
        &self,
        provider_candles: AggregatedProviderCandles,
        provider_prices: AggregatedProviderPrices,
    ) -> Result<HashMap<String, Decimal>, OracleError> {
        let now_ms = Utc::now().timestamp_millis();

        let converted_candles =
            convert::convert_candles_to_usd(provider_candles, &self.provider_pairs, now_ms)?;
        let filtered_candles =
            filter::filter_candle_deviations(converted_candles, &self.deviations, now_ms)?;

        *self
            .tvwaps_by_provider
            .write()
            .expect("tvwap state poisoned") =
            aggregators::tvwaps_by_provider(&filtered_candles, now_ms)?;

        let tvwap_prices = aggregators::compute_tvwap(&filtered_candles, now_ms)?;
        if !tvwap_prices.is_empty() {
            return Ok(tvwap_prices);
        }

        let converted_tickers =
            convert::convert_tickers_to_usd(provider_prices, &self.provider_pairs)?;
        let filtered_tickers =
            filter::filter_ticker_deviations(converted_tickers, &self.deviations);

        *self.vwaps_by_provider.write().expect("vwap state poisoned") =
            aggregators::vwaps_by_provider(&filtered_tickers);

        Ok(aggregators::compute_vwap(&filtered_tickers))
    }

    async fn provider_for(&self, kind: ProviderKind) -> Result<Arc<dyn Provider>, OracleError> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&kind) {
            return Ok(Arc::clone(provider));
        }

        let pairs = self.provider_pairs.get(&kind).cloned().unwrap_or_default();
        let provider = new_provider(
            kind,
            self.endpoints.get(&kind),
            &pairs,
            self.shutdown.clone(),
        )
        .await?;
        providers.insert(kind, Arc::clone(&provider));
        Ok(provider)
    }
}

/// A random salt of `length` bytes, hex-encoded.
fn generate_salt(length: usize) -> Result<String, OracleError> {
    if length == 0 {
        return Err(OracleError::ZeroSaltLength);
    }
    let mut salt = vec![0u8; length];
    rand::thread_rng().fill_bytes(&mut salt);
    Ok(hex::encode(salt))
}

/// Render a rate with the chain's fixed 18 fractional digits.
fn format_rate(rate: Decimal) -> String {
    let mut rate = rate;
    rate.rescale(18);
    rate.to_string()
}

/// Canonical `BASE:price` list, comma-joined after lexicographic sort.
pub fn generate_exchange_rates_string(
    prices: &HashMap<String, Decimal>,
) -> Result<String, OracleError> {
    if prices.is_empty() {
        return Err(OracleError::NoPriceAvailable);
    }

    let mut exchange_rates: Vec<String> = prices
        .iter()
        .map(|(base, price)| format!("{base}:{}", format_rate(*price)))
        .collect();
    exchange_rates.sort();

    Ok(exchange_rates.join(","))
}

/// Parse an exchange-rates string back into a price map. Used by tests
/// and operators inspecting submitted votes.
pub fn parse_exchange_rates_string(
    input: &str,
) -> Result<HashMap<String, Decimal>, OracleError> {
    use std::str::FromStr;

    let mut out = HashMap::new();
    for entry in input.split(',') {
        let (base, price) = entry
            .split_once(':')
            .ok_or(OracleError::MalformedExchangeRates)?;
        let price =
            Decimal::from_str(price).map_err(|_| OracleError::MalformedExchangeRates)?;
        out.insert(base.to_string(), price);
    }
    Ok(out)
}
