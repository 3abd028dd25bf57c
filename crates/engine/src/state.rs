//! Managed-order state machine.
//!
//! The engine drives every order through these phases; the transition table
//! here is the single source of truth, and the driver asserts against it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use delta_bridge_core::types::OrderIntent;

/// Lifecycle phase of a managed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderPhase {
    Idle,
    Placing,
    Working,
    Stepping,
    Cancelling,
    MarketFallback,
    MarketPlaced,
    Filled,
    Cancelled,
    Failed,
}

impl OrderPhase {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Filled | Self::Cancelled | Self::Failed)
    }

    /// Legal transitions, straight from the design table.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use OrderPhase::{
            Cancelled, Cancelling, Failed, Filled, Idle, MarketFallback, MarketPlaced, Placing,
            Stepping, Working,
        };
        match (self, next) {
            (Idle, Placing)
            // Place retries loop in Placing.
            | (Placing, Placing)
            | (Placing, Working)
            | (Placing, Failed)
            | (Placing, MarketFallback)
            | (Working, Stepping)
            | (Working, Filled)
            | (Working, Working)
            | (Stepping, Filled)
            | (Stepping, Placing)
            | (Stepping, MarketFallback)
            // Cancel rejected by the broker: the order is still working.
            | (Stepping, Working)
            | (MarketFallback, MarketPlaced)
            | (MarketPlaced, Filled)
            | (Cancelling, Cancelled)
            | (Cancelling, Filled) => true,
            // External cancel is honored from any non-terminal phase.
            (from, Cancelling) => !from.is_terminal(),
            // Failure is reachable from any non-terminal phase (rejections,
            // persisted bad spreads, exhausted budgets).
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Placing => "placing",
            Self::Working => "working",
            Self::Stepping => "stepping",
            Self::Cancelling => "cancelling",
            Self::MarketFallback => "market_fallback",
            Self::MarketPlaced => "market_placed",
            Self::Filled => "filled",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// An order the engine owns, from intent to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagedOrder {
    pub intent: OrderIntent,
    pub broker_order_id: Option<String>,
    pub phase: OrderPhase,
    pub current_limit: Option<Decimal>,
    pub step_index: u32,
    pub placed_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    pub filled_qty: Decimal,
    pub avg_fill_price: Option<Decimal>,
    pub cancel_reason: Option<String>,
    /// Placement attempts, across retries and steps.
    pub attempts: u32,
    /// Fill notional accumulated so far; keeps the running size-weighted
    /// average exact across partial fills from successive placements.
    filled_notional: Decimal,
}

impl ManagedOrder {
    #[must_use]
    pub fn new(intent: OrderIntent) -> Self {
        Self {
            intent,
            broker_order_id: None,
            phase: OrderPhase::Idle,
            current_limit: None,
            step_index: 0,
            placed_at: None,
            last_transition_at: Utc::now(),
            filled_qty: Decimal::ZERO,
            avg_fill_price: None,
            cancel_reason: None,
            attempts: 0,
            filled_notional: Decimal::ZERO,
        }
    }

    /// Moves to `next`, panicking in debug builds on an illegal transition.
    pub fn transition(&mut self, next: OrderPhase) {
        debug_assert!(
            self.phase.can_transition_to(next),
            "illegal transition {} -> {}",
            self.phase,
            next
        );
        self.phase = next;
        self.last_transition_at = Utc::now();
    }

    /// Size still to be worked.
    #[must_use]
    pub fn remaining(&self) -> Decimal {
        (self.intent.size - self.filled_qty).max(Decimal::ZERO)
    }

    #[must_use]
    pub fn is_fully_filled(&self) -> bool {
        self.filled_qty >= self.intent.size
    }

    /// Folds `qty` filled at `price` into the running totals.
    ///
    /// `filled_qty` is monotonically non-decreasing; the average fill price
    /// is the size-weighted mean over every partial fill.
    pub fn record_fill(&mut self, qty: Decimal, price: Decimal) {
        if qty <= Decimal::ZERO {
            return;
        }
        self.filled_qty += qty;
        self.filled_notional += qty * price;
        self.avg_fill_price = Some(self.filled_notional / self.filled_qty);
    }

    /// Advances the step counter; never decreases.
    pub fn advance_step(&mut self, step: u32) {
        debug_assert!(step >= self.step_index, "step index must not decrease");
        self.step_index = step.max(self.step_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use delta_bridge_core::signal::TradeStrategy;
    use delta_bridge_core::types::OrderSide;
    use rust_decimal_macros::dec;

    fn intent(size: Decimal) -> OrderIntent {
        OrderIntent {
            account_id: "a".to_string(),
            instrument_id: "XYZ-250117-100-C".to_string(),
            side: OrderSide::Buy,
            size,
            correlation_id: "s1".to_string(),
            strategy: TradeStrategy::OpenLong,
            tv_signal_id: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn happy_path_transitions_are_legal() {
        use OrderPhase::{Filled, Placing, Stepping, Working};
        assert!(OrderPhase::Idle.can_transition_to(Placing));
        assert!(Placing.can_transition_to(Working));
        assert!(Working.can_transition_to(Stepping));
        assert!(Stepping.can_transition_to(Placing));
        assert!(Working.can_transition_to(Filled));
        assert!(Stepping.can_transition_to(Filled));
    }

    #[test]
    fn market_fallback_path_is_legal() {
        use OrderPhase::{Filled, MarketFallback, MarketPlaced, Placing, Stepping};
        assert!(Placing.can_transition_to(MarketFallback));
        assert!(Stepping.can_transition_to(MarketFallback));
        assert!(MarketFallback.can_transition_to(MarketPlaced));
        assert!(MarketPlaced.can_transition_to(Filled));
    }

    #[test]
    fn terminal_phases_admit_nothing() {
        use OrderPhase::{Cancelled, Cancelling, Failed, Filled, Placing};
        for terminal in [Filled, Cancelled, Failed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(Placing));
            assert!(!terminal.can_transition_to(Cancelling));
            assert!(!terminal.can_transition_to(Failed));
        }
    }

    #[test]
    fn external_cancel_reachable_from_working_and_placing() {
        use OrderPhase::{Cancelling, Placing, Working};
        assert!(Working.can_transition_to(Cancelling));
        assert!(Placing.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(OrderPhase::Cancelled));
        assert!(Cancelling.can_transition_to(OrderPhase::Filled));
    }

    #[test]
    fn working_cannot_jump_back_to_placing() {
        assert!(!OrderPhase::Working.can_transition_to(OrderPhase::Placing));
    }

    #[test]
    fn fills_accumulate_size_weighted_average() {
        let mut order = ManagedOrder::new(intent(dec!(3)));
        order.record_fill(dec!(1), dec!(1.00));
        order.record_fill(dec!(2), dec!(1.15));
        assert_eq!(order.filled_qty, dec!(3));
        assert_eq!(order.avg_fill_price, Some(dec!(1.10)));
        assert_eq!(order.remaining(), Decimal::ZERO);
        assert!(order.is_fully_filled());
    }

    #[test]
    fn zero_qty_fill_is_ignored() {
        let mut order = ManagedOrder::new(intent(dec!(1)));
        order.record_fill(Decimal::ZERO, dec!(1.00));
        assert_eq!(order.filled_qty, Decimal::ZERO);
        assert_eq!(order.avg_fill_price, None);
    }

    #[test]
    fn remaining_never_negative() {
        let mut order = ManagedOrder::new(intent(dec!(1)));
        order.record_fill(dec!(1), dec!(1.00));
        order.record_fill(dec!(1), dec!(1.00));
        assert_eq!(order.remaining(), Decimal::ZERO);
    }
}
