//! Contract selection: one signal, one chain, exactly one contract.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use thiserror::Error;
use tracing::{debug, warn};

use delta_bridge_core::config::{ContractSelectionConfig, RightMapping, SpreadConfig};
use delta_bridge_core::pricing::is_spread_reasonable;
use delta_bridge_core::signal::TradeStrategy;
use delta_bridge_core::types::{OptionContract, OptionRight, OrderSide, QuoteSnapshot};
use delta_bridge_gateway::{BrokerGateway, Chain, ChainEntry, GatewayError};

#[derive(Debug, Error)]
pub enum SelectError {
    #[error("no suitable contract for {underlying}")]
    NoSuitableContract { underlying: String },

    #[error("spread on {instrument_id} is unreasonable")]
    UnreasonableSpread { instrument_id: String },

    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// The selector's answer: the contract, its fresh quote, and the side the
/// engine should trade.
#[derive(Debug, Clone)]
pub struct SelectedContract {
    pub contract: OptionContract,
    pub quote: QuoteSnapshot,
    pub order_side: OrderSide,
}

pub struct ContractSelector {
    gateway: Arc<dyn BrokerGateway>,
    selection: ContractSelectionConfig,
    spread: SpreadConfig,
    /// Delay before the single spread-gate retry.
    retry_delay: Duration,
}

impl ContractSelector {
    #[must_use]
    pub fn new(
        gateway: Arc<dyn BrokerGateway>,
        selection: ContractSelectionConfig,
        spread: SpreadConfig,
    ) -> Self {
        Self {
            gateway,
            selection,
            spread,
            retry_delay: Duration::from_millis(500),
        }
    }

    #[must_use]
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    /// Picks the single contract for a signal. Deterministic given identical
    /// chain and quote inputs.
    ///
    /// `allow_wide_spread` lets a close that cannot wait proceed past a
    /// failed spread gate; the wide quote is still returned for pricing.
    pub async fn select(
        &self,
        underlying: &str,
        strategy: TradeStrategy,
        signal_side: delta_bridge_core::signal::SignalSide,
        today: NaiveDate,
        allow_wide_spread: bool,
    ) -> Result<SelectedContract, SelectError> {
        let right = self.right_for(strategy, signal_side);
        let chain = self.gateway.option_chain(underlying, None).await?;

        let expiry = self.pick_expiry(&chain, right, today).ok_or_else(|| {
            SelectError::NoSuitableContract {
                underlying: underlying.to_string(),
            }
        })?;

        let underlying_price = if chain.underlying_price > Decimal::ZERO {
            chain.underlying_price
        } else {
            chain
                .entries
                .iter()
                .filter_map(|e| e.quote.as_ref())
                .map(|q| q.underlying_price)
                .find(|p| *p > Decimal::ZERO)
                .unwrap_or_default()
        };

        let candidates: Vec<&ChainEntry> = chain
            .entries
            .iter()
            .filter(|e| e.contract.right == right && e.contract.expiry == expiry)
            .collect();

        let chosen = self
            .pick_strike(&candidates, strategy, underlying_price)
            .ok_or_else(|| SelectError::NoSuitableContract {
                underlying: underlying.to_string(),
            })?;

        debug!(
            instrument = %chosen.contract.instrument_id,
            strike = %chosen.contract.strike,
            expiry = %chosen.contract.expiry,
            %right,
            "contract selected"
        );

        let quote = self.gated_quote(&chosen.contract, allow_wide_spread).await?;
        let order_side = order_side_for(strategy);

        Ok(SelectedContract {
            contract: chosen.contract.clone(),
            quote,
            order_side,
        })
    }

    fn right_for(
        &self,
        strategy: TradeStrategy,
        side: delta_bridge_core::signal::SignalSide,
    ) -> OptionRight {
        use delta_bridge_core::signal::SignalSide;
        let standard = match strategy {
            // Long entries and short exits trade calls.
            TradeStrategy::OpenLong | TradeStrategy::CloseShort => OptionRight::Call,
            // Short entries and long exits trade puts.
            TradeStrategy::OpenShort | TradeStrategy::CloseLong => OptionRight::Put,
            TradeStrategy::Roll => match side {
                SignalSide::Buy => OptionRight::Call,
                SignalSide::Sell => OptionRight::Put,
            },
        };
        match self.selection.right_mapping {
            RightMapping::Standard => standard,
            RightMapping::Inverted => match standard {
                OptionRight::Call => OptionRight::Put,
                OptionRight::Put => OptionRight::Call,
            },
        }
    }

    /// Expiry inside the configured window closest to the target tenor.
    fn pick_expiry(&self, chain: &Chain, right: OptionRight, today: NaiveDate) -> Option<NaiveDate> {
        let mut expiries: Vec<NaiveDate> = chain
            .entries
            .iter()
            .filter(|e| e.contract.right == right)
            .map(|e| e.contract.expiry)
            .filter(|expiry| {
                let dte = (*expiry - today).num_days();
                dte >= self.selection.min_days_to_expiry && dte <= self.selection.max_days_to_expiry
            })
            .collect();
        expiries.sort_unstable();
        expiries.dedup();

        expiries.into_iter().min_by_key(|expiry| {
            ((*expiry - today).num_days() - self.selection.target_days_to_expiry).abs()
        })
    }

    /// Strike choice: opens target |delta|, closes target ATM. Ties prefer
    /// higher open interest, then higher volume, then tighter spread.
    fn pick_strike<'a>(
        &self,
        candidates: &[&'a ChainEntry],
        strategy: TradeStrategy,
        underlying_price: Decimal,
    ) -> Option<&'a ChainEntry> {
        let closeness = |entry: &ChainEntry| -> f64 {
            if strategy.is_opening() || strategy == TradeStrategy::Roll {
                let delta = entry
                    .quote
                    .as_ref()
                    .and_then(|q| q.delta)
                    .unwrap_or_else(|| approx_delta(&entry.contract, entry.quote.as_ref(), underlying_price));
                (delta.abs() - self.selection.target_delta_open).abs()
            } else {
                let diff: f64 = (entry.contract.strike - underlying_price)
                    .abs()
                    .try_into()
                    .unwrap_or(f64::MAX);
                diff
            }
        };

        let mut best: Option<(&&ChainEntry, f64)> = None;
        for entry in candidates {
            let score = closeness(entry);
            match best {
                None => best = Some((entry, score)),
                Some((current, current_score)) => {
                    if score < current_score - f64::EPSILON {
                        best = Some((entry, score));
                    } else if (score - current_score).abs() <= f64::EPSILON
                        && tie_break(entry, current)
                    {
                        best = Some((entry, score));
                    }
                }
            }
        }
        best.map(|(entry, _)| *entry)
    }

    /// Fresh quote gated on spread quality, with a single retry.
    async fn gated_quote(
        &self,
        contract: &OptionContract,
        allow_wide_spread: bool,
    ) -> Result<QuoteSnapshot, SelectError> {
        let quote = self.gateway.quote(&contract.instrument_id).await?;
        if self.spread_ok(contract, &quote) {
            return Ok(quote);
        }

        warn!(
            instrument = %contract.instrument_id,
            bid = %quote.bid,
            ask = %quote.ask,
            "spread unreasonable, retrying once"
        );
        tokio::time::sleep(self.retry_delay).await;

        let quote = self.gateway.quote(&contract.instrument_id).await?;
        if self.spread_ok(contract, &quote) {
            Ok(quote)
        } else if allow_wide_spread {
            warn!(
                instrument = %contract.instrument_id,
                "spread still wide, proceeding anyway (close cannot wait)"
            );
            Ok(quote)
        } else {
            Err(SelectError::UnreasonableSpread {
                instrument_id: contract.instrument_id.clone(),
            })
        }
    }

    fn spread_ok(&self, contract: &OptionContract, quote: &QuoteSnapshot) -> bool {
        is_spread_reasonable(
            quote.bid,
            quote.ask,
            contract.tick_size,
            self.spread.ratio_threshold,
            self.spread.tick_multiple_threshold,
        )
    }
}

/// Opens buy the selected option, closes sell it. A single-order roll buys
/// the option on the target side.
#[must_use]
pub fn order_side_for(strategy: TradeStrategy) -> OrderSide {
    match strategy {
        TradeStrategy::OpenLong | TradeStrategy::OpenShort | TradeStrategy::Roll => OrderSide::Buy,
        TradeStrategy::CloseLong | TradeStrategy::CloseShort => OrderSide::Sell,
    }
}

/// True when `a` beats `b` on the tie-break chain.
fn tie_break(a: &ChainEntry, b: &ChainEntry) -> bool {
    let oi = |e: &ChainEntry| e.quote.as_ref().map_or(0, |q| q.open_interest);
    let volume = |e: &ChainEntry| e.quote.as_ref().map_or(0, |q| q.volume);
    let spread = |e: &ChainEntry| {
        e.quote
            .as_ref()
            .map_or(Decimal::MAX, |q| (q.ask - q.bid).abs())
    };

    (oi(a), volume(a), std::cmp::Reverse(spread(a)))
        > (oi(b), volume(b), std::cmp::Reverse(spread(b)))
}

/// Black-Scholes delta approximation for chains without Greeks.
///
/// Backs the volatility term out of the mark with the ATM approximation
/// `mark ~= 0.4 * S * sigma * sqrt(T)`, then evaluates `N(d1)`.
fn approx_delta(
    contract: &OptionContract,
    quote: Option<&QuoteSnapshot>,
    underlying_price: Decimal,
) -> f64 {
    let spot: f64 = underlying_price.try_into().unwrap_or(0.0);
    let strike: f64 = contract.strike.try_into().unwrap_or(0.0);
    if spot <= 0.0 || strike <= 0.0 {
        return 0.0;
    }
    let mark: f64 = quote
        .map(|q| q.mark)
        .unwrap_or_default()
        .try_into()
        .unwrap_or(0.0);

    // sigma * sqrt(T); floored so deep ITM/OTM contracts still order sanely.
    let vol_time = (mark / (0.4 * spot)).max(1e-3);
    let d1 = (spot / strike).ln() / vol_time + vol_time / 2.0;
    let call_delta = normal_cdf(d1);
    match contract.right {
        OptionRight::Call => call_delta,
        OptionRight::Put => call_delta - 1.0,
    }
}

/// Abramowitz-Stegun approximation of the standard normal CDF.
fn normal_cdf(x: f64) -> f64 {
    let t = 1.0 / (1.0 + 0.2316419 * x.abs());
    let poly = t
        * (0.319_381_530
            + t * (-0.356_563_782 + t * (1.781_477_937 + t * (-1.821_255_978 + t * 1.330_274_429))));
    let pdf = (-x * x / 2.0).exp() / (2.0 * std::f64::consts::PI).sqrt();
    let tail = pdf * poly;
    if x >= 0.0 {
        1.0 - tail
    } else {
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal_macros::dec;

    use delta_bridge_core::signal::SignalSide;
    use delta_bridge_gateway::mock::{sample_quote, MockGateway};
    use delta_bridge_gateway::Chain;

    fn contract(strike: Decimal, right: OptionRight, dte: i64) -> OptionContract {
        let expiry = Utc::now().date_naive() + ChronoDuration::days(dte);
        let suffix = if right == OptionRight::Call { "C" } else { "P" };
        OptionContract {
            instrument_id: format!("XYZ-{}-{}-{}", expiry.format("%y%m%d"), strike, suffix),
            underlying: "XYZ".to_string(),
            expiry,
            strike,
            right,
            tick_size: dec!(0.05),
            multiplier: 100,
        }
    }

    fn entry(strike: Decimal, right: OptionRight, dte: i64, delta: f64) -> ChainEntry {
        let contract = contract(strike, right, dte);
        let mut quote = sample_quote(&contract.instrument_id, dec!(1.00), dec!(1.10), delta);
        quote.underlying_price = dec!(100);
        ChainEntry {
            contract,
            quote: Some(quote),
        }
    }

    fn chain(entries: Vec<ChainEntry>) -> Chain {
        Chain {
            underlying: "XYZ".to_string(),
            underlying_price: dec!(100),
            entries,
            fetched_at: Utc::now(),
        }
    }

    fn selector(gateway: Arc<MockGateway>) -> ContractSelector {
        ContractSelector::new(
            gateway,
            ContractSelectionConfig::default(),
            SpreadConfig::default(),
        )
        .with_retry_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn open_long_picks_call_near_target_delta() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_chain(chain(vec![
            entry(dec!(90), OptionRight::Call, 30, 0.70),
            entry(dec!(100), OptionRight::Call, 30, 0.50),
            entry(dec!(110), OptionRight::Call, 30, 0.31),
            entry(dec!(120), OptionRight::Call, 30, 0.12),
            entry(dec!(110), OptionRight::Put, 30, -0.69),
        ]));

        let selected = selector(gateway)
            .select("XYZ", TradeStrategy::OpenLong, SignalSide::Buy, Utc::now().date_naive(), false)
            .await
            .unwrap();

        assert_eq!(selected.contract.right, OptionRight::Call);
        assert_eq!(selected.contract.strike, dec!(110));
        assert_eq!(selected.order_side, OrderSide::Buy);
    }

    #[tokio::test]
    async fn close_long_picks_atm_put_and_sells() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_chain(chain(vec![
            entry(dec!(90), OptionRight::Put, 30, -0.30),
            entry(dec!(100), OptionRight::Put, 30, -0.50),
            entry(dec!(110), OptionRight::Put, 30, -0.70),
        ]));

        let selected = selector(gateway)
            .select("XYZ", TradeStrategy::CloseLong, SignalSide::Sell, Utc::now().date_naive(), false)
            .await
            .unwrap();

        assert_eq!(selected.contract.right, OptionRight::Put);
        assert_eq!(selected.contract.strike, dec!(100));
        assert_eq!(selected.order_side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn expiry_window_filters_and_targets_tenor() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_chain(chain(vec![
            // Too near and too far fall outside [7, 45].
            entry(dec!(100), OptionRight::Call, 3, 0.30),
            entry(dec!(100), OptionRight::Call, 60, 0.30),
            entry(dec!(100), OptionRight::Call, 14, 0.30),
            entry(dec!(100), OptionRight::Call, 28, 0.30),
        ]));

        let selected = selector(gateway)
            .select("XYZ", TradeStrategy::OpenLong, SignalSide::Buy, Utc::now().date_naive(), false)
            .await
            .unwrap();

        // 28 DTE is closest to the 30-day target.
        let dte = selected.contract.days_to_expiry(Utc::now().date_naive());
        assert_eq!(dte, 28);
    }

    #[tokio::test]
    async fn empty_window_is_no_suitable_contract() {
        let gateway = Arc::new(MockGateway::new());
        gateway.set_chain(chain(vec![entry(dec!(100), OptionRight::Call, 2, 0.30)]));

        let error = selector(gateway)
            .select("XYZ", TradeStrategy::OpenLong, SignalSide::Buy, Utc::now().date_naive(), false)
            .await
            .unwrap_err();
        assert!(matches!(error, SelectError::NoSuitableContract { .. }));
    }

    #[tokio::test]
    async fn spread_gate_retries_once_then_succeeds() {
        let gateway = Arc::new(MockGateway::new());
        let e = entry(dec!(110), OptionRight::Call, 30, 0.30);
        let instrument = e.contract.instrument_id.clone();
        gateway.set_chain(chain(vec![e]));

        // First quote is unacceptably wide, second is fine.
        gateway.push_quote(sample_quote(&instrument, dec!(0.50), dec!(1.50), 0.30));
        gateway.push_quote(sample_quote(&instrument, dec!(1.00), dec!(1.05), 0.30));

        let selected = selector(gateway)
            .select("XYZ", TradeStrategy::OpenLong, SignalSide::Buy, Utc::now().date_naive(), false)
            .await
            .unwrap();
        assert_eq!(selected.quote.ask, dec!(1.05));
    }

    #[tokio::test]
    async fn persistent_wide_spread_fails() {
        let gateway = Arc::new(MockGateway::new());
        let e = entry(dec!(110), OptionRight::Call, 30, 0.30);
        let instrument = e.contract.instrument_id.clone();
        gateway.set_chain(chain(vec![e]));
        gateway.push_quote(sample_quote(&instrument, dec!(0.50), dec!(1.50), 0.30));

        let error = selector(gateway)
            .select("XYZ", TradeStrategy::OpenLong, SignalSide::Buy, Utc::now().date_naive(), false)
            .await
            .unwrap_err();
        assert!(matches!(error, SelectError::UnreasonableSpread { .. }));
    }

    #[tokio::test]
    async fn ties_prefer_higher_open_interest() {
        let gateway = Arc::new(MockGateway::new());
        let mut a = entry(dec!(105), OptionRight::Call, 30, 0.30);
        let mut b = entry(dec!(115), OptionRight::Call, 30, 0.30);
        if let Some(q) = a.quote.as_mut() {
            q.open_interest = 10;
        }
        if let Some(q) = b.quote.as_mut() {
            q.open_interest = 900;
        }
        gateway.set_chain(chain(vec![a, b]));

        let selected = selector(gateway)
            .select("XYZ", TradeStrategy::OpenLong, SignalSide::Buy, Utc::now().date_naive(), false)
            .await
            .unwrap();
        assert_eq!(selected.contract.strike, dec!(115));
    }

    #[test]
    fn normal_cdf_symmetry() {
        assert!((normal_cdf(0.0) - 0.5).abs() < 1e-6);
        assert!((normal_cdf(1.0) + normal_cdf(-1.0) - 1.0).abs() < 1e-6);
        assert!(normal_cdf(3.0) > 0.99);
    }

    #[test]
    fn approx_delta_orders_by_moneyness() {
        let itm = contract(dec!(80), OptionRight::Call, 30);
        let otm = contract(dec!(120), OptionRight::Call, 30);
        let q = sample_quote("x", dec!(1.9), dec!(2.1), 0.0);
        let d_itm = approx_delta(&itm, Some(&q), dec!(100));
        let d_otm = approx_delta(&otm, Some(&q), dec!(100));
        assert!(d_itm > d_otm);
        assert!(d_itm > 0.5);
        assert!(d_otm < 0.5);
    }
}
