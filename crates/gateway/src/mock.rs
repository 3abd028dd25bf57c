//! In-memory broker simulator.
//!
//! Selected by `mock_mode`; every other component is oblivious to which
//! gateway it holds. The simulator is also the standard test harness for
//! the selector, engine, poller and dispatcher: quotes are scripted as a
//! sequence per instrument, and fill behavior follows marketability against
//! the most recently served quote.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;

use delta_bridge_core::types::{OptionContract, OptionRight, OrderSide, QuoteSnapshot};

use crate::error::{GatewayError, GatewayResult};
use crate::types::{
    CancelOutcome, Chain, ChainEntry, InstrumentKind, OpenOrder, OrderKind, OrderRequest,
    OrderState, OrderStatus, Position, Symbol,
};
use crate::BrokerGateway;

/// Simulator-side order record.
#[derive(Debug, Clone)]
pub struct MockOrder {
    pub order_id: String,
    pub account_id: String,
    pub instrument_id: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub price: Option<Decimal>,
    pub state: OrderState,
}

#[derive(Default)]
struct MockState {
    quotes: HashMap<String, VecDeque<QuoteSnapshot>>,
    last_served: HashMap<String, QuoteSnapshot>,
    chains: HashMap<String, Chain>,
    positions: HashMap<String, Vec<Position>>,
    orders: HashMap<String, MockOrder>,
    place_errors: VecDeque<GatewayError>,
    cancel_errors: VecDeque<GatewayError>,
    positions_errors: VecDeque<GatewayError>,
    open_orders_errors: VecDeque<GatewayError>,
    /// Per-instrument cap on how much a single placement may fill.
    partial_caps: HashMap<String, Decimal>,
    next_order_id: u64,
    place_count: usize,
}

pub struct MockGateway {
    state: Mutex<MockState>,
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl MockGateway {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockState::default()),
        }
    }

    // ---- scripting helpers -------------------------------------------------

    /// Appends a quote to the instrument's script. Each `quote()` call
    /// serves the front and advances while more than one remains, so the
    /// last quote repeats forever.
    pub fn push_quote(&self, quote: QuoteSnapshot) {
        let mut state = self.state.lock();
        state
            .quotes
            .entry(quote.instrument_id.clone())
            .or_default()
            .push_back(quote);
    }

    pub fn set_chain(&self, chain: Chain) {
        self.state.lock().chains.insert(chain.underlying.clone(), chain);
    }

    pub fn set_positions(&self, account_id: &str, positions: Vec<Position>) {
        self.state.lock().positions.insert(account_id.to_string(), positions);
    }

    pub fn fail_next_place(&self, error: GatewayError) {
        self.state.lock().place_errors.push_back(error);
    }

    pub fn fail_next_cancel(&self, error: GatewayError) {
        self.state.lock().cancel_errors.push_back(error);
    }

    pub fn fail_next_positions(&self, error: GatewayError) {
        self.state.lock().positions_errors.push_back(error);
    }

    pub fn fail_next_open_orders(&self, error: GatewayError) {
        self.state.lock().open_orders_errors.push_back(error);
    }

    /// Caps how much any single placement on `instrument_id` may fill.
    pub fn set_partial_cap(&self, instrument_id: &str, cap: Decimal) {
        self.state.lock().partial_caps.insert(instrument_id.to_string(), cap);
    }

    /// Makes an order disappear from the broker without a terminal state,
    /// as if external activity removed it.
    pub fn vanish_order(&self, order_id: &str) {
        self.state.lock().orders.remove(order_id);
    }

    /// Forces a resting order to fill at its limit price.
    pub fn fill_open_order(&self, order_id: &str) {
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(order_id) {
            if order.state == OrderState::Open {
                let price = order.price.unwrap_or_default();
                order.avg_fill_price = Some(price);
                order.filled_qty = order.size;
                order.state = OrderState::Filled;
            }
        }
    }

    #[must_use]
    pub fn order(&self, order_id: &str) -> Option<MockOrder> {
        self.state.lock().orders.get(order_id).cloned()
    }

    /// Total placements seen, across all accounts.
    #[must_use]
    pub fn placements(&self) -> usize {
        self.state.lock().place_count
    }

    #[must_use]
    pub fn open_order_ids(&self, account_id: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .orders
            .values()
            .filter(|o| o.account_id == account_id && o.state == OrderState::Open)
            .map(|o| o.order_id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ---- internals ---------------------------------------------------------

    fn serve_quote(state: &mut MockState, instrument_id: &str) -> Option<QuoteSnapshot> {
        let script = state.quotes.get_mut(instrument_id)?;
        let quote = if script.len() > 1 {
            script.pop_front()?
        } else {
            script.front()?.clone()
        };
        state.last_served.insert(instrument_id.to_string(), quote.clone());
        Some(quote)
    }

    fn market_for(state: &MockState, instrument_id: &str) -> Option<QuoteSnapshot> {
        state
            .last_served
            .get(instrument_id)
            .or_else(|| state.quotes.get(instrument_id).and_then(VecDeque::front))
            .cloned()
    }

    /// Fill price when the request crosses the current book, if it does.
    fn crossing_price(quote: &QuoteSnapshot, side: OrderSide, kind: OrderKind) -> Option<Decimal> {
        match (side, kind) {
            (OrderSide::Buy, OrderKind::Limit(price)) => {
                (quote.ask > Decimal::ZERO && price >= quote.ask).then_some(quote.ask)
            }
            (OrderSide::Sell, OrderKind::Limit(price)) => {
                (quote.bid > Decimal::ZERO && price <= quote.bid).then_some(quote.bid)
            }
            (OrderSide::Buy, OrderKind::Market) => {
                if quote.ask > Decimal::ZERO {
                    Some(quote.ask)
                } else {
                    Some(quote.mark)
                }
            }
            (OrderSide::Sell, OrderKind::Market) => {
                if quote.bid > Decimal::ZERO {
                    Some(quote.bid)
                } else {
                    Some(quote.mark)
                }
            }
        }
    }

    /// Deterministic demo chain for underlyings no test has scripted;
    /// keeps mock mode usable end-to-end without seeding.
    fn demo_chain(underlying: &str) -> Chain {
        let today = Utc::now().date_naive();
        let underlying_price = Decimal::new(100, 0);
        let expiries = [
            today + ChronoDuration::days(14),
            today + ChronoDuration::days(30),
        ];
        let mut entries = Vec::new();
        for expiry in expiries {
            for strike_step in 0..9u32 {
                let strike = Decimal::new(80, 0) + Decimal::new(5, 0) * Decimal::from(strike_step);
                for right in [OptionRight::Call, OptionRight::Put] {
                    let contract = demo_contract(underlying, expiry, strike, right);
                    let quote = demo_quote(&contract, underlying_price);
                    entries.push(ChainEntry {
                        contract,
                        quote: Some(quote),
                    });
                }
            }
        }
        Chain {
            underlying: underlying.to_string(),
            underlying_price,
            entries,
            fetched_at: Utc::now(),
        }
    }
}

fn demo_contract(
    underlying: &str,
    expiry: NaiveDate,
    strike: Decimal,
    right: OptionRight,
) -> OptionContract {
    let suffix = match right {
        OptionRight::Call => "C",
        OptionRight::Put => "P",
    };
    OptionContract {
        instrument_id: format!("{}-{}-{}-{}", underlying, expiry.format("%y%m%d"), strike, suffix),
        underlying: underlying.to_string(),
        expiry,
        strike,
        right,
        tick_size: Decimal::new(5, 2),
        multiplier: 100,
    }
}

fn demo_quote(contract: &OptionContract, underlying_price: Decimal) -> QuoteSnapshot {
    // Crude but deterministic: delta from moneyness, price from intrinsic
    // value plus a flat time premium, a two-tick spread around the mark.
    let moneyness: f64 = ((underlying_price - contract.strike) / underlying_price)
        .try_into()
        .unwrap_or(0.0);
    let raw_delta = match contract.right {
        OptionRight::Call => 0.5 + moneyness * 2.5,
        OptionRight::Put => -0.5 + moneyness * 2.5,
    };
    let delta = raw_delta.clamp(-0.99, 0.99);
    let intrinsic = match contract.right {
        OptionRight::Call => (underlying_price - contract.strike).max(Decimal::ZERO),
        OptionRight::Put => (contract.strike - underlying_price).max(Decimal::ZERO),
    };
    let mark = intrinsic + Decimal::new(2, 0);
    let half_spread = contract.tick_size;
    QuoteSnapshot {
        instrument_id: contract.instrument_id.clone(),
        bid: mark - half_spread,
        ask: mark + half_spread,
        last: mark,
        mark,
        underlying_price,
        delta: Some(delta),
        open_interest: 500,
        volume: 100,
        ts: Utc::now(),
    }
}

#[async_trait]
impl BrokerGateway for MockGateway {
    async fn option_chain(&self, underlying: &str, expiry: Option<NaiveDate>) -> GatewayResult<Chain> {
        let mut state = self.state.lock();
        let chain = state
            .chains
            .entry(underlying.to_string())
            .or_insert_with(|| Self::demo_chain(underlying))
            .clone();
        drop(state);

        let chain = match expiry {
            None => chain,
            Some(expiry) => Chain {
                entries: chain
                    .entries
                    .into_iter()
                    .filter(|e| e.contract.expiry == expiry)
                    .collect(),
                ..chain
            },
        };
        Ok(chain)
    }

    async fn quote(&self, instrument_id: &str) -> GatewayResult<QuoteSnapshot> {
        let mut state = self.state.lock();
        if let Some(quote) = Self::serve_quote(&mut state, instrument_id) {
            return Ok(quote);
        }
        // Fall back to the chain's inline quote for unscripted instruments.
        let inline = state
            .chains
            .values()
            .flat_map(|c| &c.entries)
            .find(|e| e.contract.instrument_id == instrument_id)
            .and_then(|e| e.quote.clone());
        inline.ok_or_else(|| GatewayError::NotFound(instrument_id.to_string()))
    }

    async fn positions(&self, account_id: &str, _currency: &str) -> GatewayResult<Vec<Position>> {
        let mut state = self.state.lock();
        if let Some(error) = state.positions_errors.pop_front() {
            return Err(error);
        }
        Ok(state.positions.get(account_id).cloned().unwrap_or_default())
    }

    async fn open_orders(&self, account_id: &str) -> GatewayResult<Vec<OpenOrder>> {
        let mut state = self.state.lock();
        if let Some(error) = state.open_orders_errors.pop_front() {
            return Err(error);
        }
        let orders = state
            .orders
            .values()
            .filter(|o| o.account_id == account_id && o.state == OrderState::Open)
            .map(|o| OpenOrder {
                order_id: o.order_id.clone(),
                instrument_id: o.instrument_id.clone(),
                side: o.side,
                size: o.size,
                filled_qty: o.filled_qty,
                price: o.price,
                created_at: Utc::now(),
            })
            .collect();
        Ok(orders)
    }

    async fn place_order(&self, account_id: &str, request: OrderRequest) -> GatewayResult<String> {
        let mut state = self.state.lock();
        if let Some(error) = state.place_errors.pop_front() {
            return Err(error);
        }
        state.place_count += 1;
        state.next_order_id += 1;
        let order_id = format!("mock-{}", state.next_order_id);

        let quote = Self::market_for(&state, &request.instrument_id);
        let crossing = quote
            .as_ref()
            .and_then(|q| Self::crossing_price(q, request.side, request.kind));
        let cap = state.partial_caps.get(&request.instrument_id).copied();

        let mut order = MockOrder {
            order_id: order_id.clone(),
            account_id: account_id.to_string(),
            instrument_id: request.instrument_id,
            side: request.side,
            size: request.size,
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            price: request.kind.limit_price(),
            state: OrderState::Open,
        };

        if let Some(price) = crossing {
            let fill_qty = cap.map_or(request.size, |c| c.min(request.size));
            order.filled_qty = fill_qty;
            order.avg_fill_price = Some(price);
            if fill_qty >= request.size {
                order.state = OrderState::Filled;
            }
        }

        state.orders.insert(order_id.clone(), order);
        Ok(order_id)
    }

    async fn order_status(&self, _account_id: &str, order_id: &str) -> GatewayResult<OrderStatus> {
        let state = self.state.lock();
        let order = state
            .orders
            .get(order_id)
            .ok_or_else(|| GatewayError::NotFound(order_id.to_string()))?;
        Ok(OrderStatus {
            order_id: order.order_id.clone(),
            state: order.state,
            filled_qty: order.filled_qty,
            avg_fill_price: order.avg_fill_price,
        })
    }

    async fn cancel_order(&self, _account_id: &str, order_id: &str) -> GatewayResult<CancelOutcome> {
        let mut state = self.state.lock();
        if let Some(error) = state.cancel_errors.pop_front() {
            return Err(error);
        }
        match state.orders.get_mut(order_id) {
            None => Ok(CancelOutcome::NotFound),
            Some(order) if order.state == OrderState::Filled => Ok(CancelOutcome::AlreadyFilled),
            Some(order) => {
                order.state = OrderState::Cancelled;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    async fn us_symbols(&self) -> GatewayResult<Vec<Symbol>> {
        Ok(vec![
            Symbol {
                symbol: "XYZ".to_string(),
                name: "XYZ Corp".to_string(),
            },
            Symbol {
                symbol: "ABC".to_string(),
                name: "ABC Inc".to_string(),
            },
        ])
    }
}

/// Quote builder used across the workspace's tests.
#[must_use]
pub fn sample_quote(instrument_id: &str, bid: Decimal, ask: Decimal, delta: f64) -> QuoteSnapshot {
    let mark = if bid > Decimal::ZERO && ask > Decimal::ZERO {
        (bid + ask) / Decimal::TWO
    } else {
        bid.max(ask)
    };
    QuoteSnapshot {
        instrument_id: instrument_id.to_string(),
        bid,
        ask,
        last: mark,
        mark,
        underlying_price: Decimal::new(100, 0),
        delta: Some(delta),
        open_interest: 100,
        volume: 50,
        ts: Utc::now(),
    }
}

/// Position builder used across the workspace's tests.
#[must_use]
pub fn sample_position(instrument_id: &str, size: Decimal, delta: f64) -> Position {
    Position {
        instrument_id: instrument_id.to_string(),
        kind: InstrumentKind::Option,
        size,
        average_price: Decimal::ONE,
        mark_price: Decimal::ONE,
        delta,
        gamma: 0.01,
        theta: -0.02,
        vega: 0.05,
        unrealized_pnl: Decimal::ZERO,
        realized_pnl: Decimal::ZERO,
    }
}
