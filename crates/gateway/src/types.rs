//! Broker-facing request/response types.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use delta_bridge_core::types::{OptionContract, OrderSide, QuoteSnapshot};

/// One contract in a chain snapshot, with its latest quote when the broker
/// returned one inline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainEntry {
    pub contract: OptionContract,
    pub quote: Option<QuoteSnapshot>,
}

/// Option chain snapshot for one underlying.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chain {
    pub underlying: String,
    pub underlying_price: Decimal,
    pub entries: Vec<ChainEntry>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    Option,
    Equity,
}

/// Broker-reported position with Greeks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub instrument_id: String,
    pub kind: InstrumentKind,
    /// Signed contracts (negative = short).
    pub size: Decimal,
    pub average_price: Decimal,
    pub mark_price: Decimal,
    pub delta: f64,
    pub gamma: f64,
    pub theta: f64,
    pub vega: f64,
    pub unrealized_pnl: Decimal,
    pub realized_pnl: Decimal,
}

impl Position {
    /// Position delta: per-contract delta scaled by signed size.
    #[must_use]
    pub fn position_delta(&self) -> f64 {
        let size: f64 = self.size.try_into().unwrap_or(0.0);
        self.delta * size
    }
}

/// Broker-side view of a working order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub instrument_id: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub filled_qty: Decimal,
    pub price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Terminal/working state of a broker order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    Open,
    Filled,
    Cancelled,
    Rejected,
}

/// Point-in-time status of one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatus {
    pub order_id: String,
    pub state: OrderState,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
}

/// Limit-or-market shape of an order request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "type", content = "price")]
pub enum OrderKind {
    Limit(Decimal),
    Market,
}

impl OrderKind {
    #[must_use]
    pub const fn limit_price(self) -> Option<Decimal> {
        match self {
            Self::Limit(price) => Some(price),
            Self::Market => None,
        }
    }
}

/// Order submission request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub instrument_id: String,
    pub side: OrderSide,
    pub size: Decimal,
    pub kind: OrderKind,
}

/// Outcome of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFilled,
    NotFound,
}

/// Listed symbol from the bulk US symbols endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Symbol {
    pub symbol: String,
    pub name: String,
}
