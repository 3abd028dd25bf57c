//! Domain types shared across the bridge — contracts, quotes, trade intents.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Call/put side of an option contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Call => write!(f, "call"),
            Self::Put => write!(f, "put"),
        }
    }
}

/// Buy/sell side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Buy => write!(f, "buy"),
            Self::Sell => write!(f, "sell"),
        }
    }
}

/// A single option contract as the broker describes it.
///
/// Transient: fetched from the broker chain and cached with a short TTL,
/// never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptionContract {
    /// Broker-scoped instrument symbol, e.g. `XYZ-250117-100-C`.
    pub instrument_id: String,
    pub underlying: String,
    pub expiry: NaiveDate,
    pub strike: Decimal,
    pub right: OptionRight,
    pub tick_size: Decimal,
    /// Contract multiplier, typically 100 for US equity options.
    pub multiplier: u32,
}

impl OptionContract {
    /// Calendar days from `today` until expiry (negative if already expired).
    #[must_use]
    pub fn days_to_expiry(&self, today: NaiveDate) -> i64 {
        (self.expiry - today).num_days()
    }
}

/// Point-in-time quote for one instrument. Never persisted.
///
/// Invariant: when both sides are positive, `ask >= bid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteSnapshot {
    pub instrument_id: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub mark: Decimal,
    pub underlying_price: Decimal,
    /// Broker-reported option delta, when the feed carries Greeks.
    pub delta: Option<f64>,
    pub open_interest: u64,
    pub volume: u64,
    pub ts: DateTime<Utc>,
}

impl QuoteSnapshot {
    /// True when both sides of the book are populated and ordered.
    #[must_use]
    pub fn has_two_sided_book(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask > Decimal::ZERO && self.ask >= self.bid
    }
}

/// Immutable trade intent handed from the dispatcher to the execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    pub account_id: String,
    pub instrument_id: String,
    pub side: OrderSide,
    /// Contracts to trade; always positive.
    pub size: Decimal,
    pub correlation_id: String,
    pub strategy: crate::signal::TradeStrategy,
    /// Correlation key from the originating alert, if any.
    pub tv_signal_id: Option<String>,
    pub created_at: DateTime<Utc>,
}
