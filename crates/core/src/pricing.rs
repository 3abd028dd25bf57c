//! Tick and spread arithmetic for the execution engine.
//!
//! Pure functions over `Decimal`. The only failure mode is a non-positive
//! tick size; everything else is total on its inputs.

use rust_decimal::{Decimal, RoundingStrategy};
use thiserror::Error;

use crate::types::OrderSide;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PricingError {
    #[error("tick size must be positive")]
    InvalidTick,
}

/// Rounding direction for [`round_to_tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundMode {
    /// Nearest tick; exact half-tick ties resolve to the even tick count.
    Nearest,
    Floor,
    Ceil,
}

/// Rounds `price` to a multiple of `tick`.
pub fn round_to_tick(price: Decimal, tick: Decimal, mode: RoundMode) -> Result<Decimal, PricingError> {
    if tick <= Decimal::ZERO {
        return Err(PricingError::InvalidTick);
    }
    let ticks = price / tick;
    let rounded = match mode {
        RoundMode::Nearest => ticks.round_dp_with_strategy(0, RoundingStrategy::MidpointNearestEven),
        RoundMode::Floor => ticks.floor(),
        RoundMode::Ceil => ticks.ceil(),
    };
    Ok((rounded * tick).normalize())
}

/// Mid price, or `None` when either side of the book is missing.
#[must_use]
pub fn mid_price(bid: Decimal, ask: Decimal) -> Option<Decimal> {
    if bid <= Decimal::ZERO || ask <= Decimal::ZERO {
        return None;
    }
    Some((bid + ask) / Decimal::TWO)
}

/// Spread as a fraction of the mid price.
///
/// `None` when either side is missing or the book is crossed; callers must
/// treat that as an unreasonable spread.
#[must_use]
pub fn spread_ratio(bid: Decimal, ask: Decimal) -> Option<Decimal> {
    if bid <= Decimal::ZERO || ask <= Decimal::ZERO || ask < bid {
        return None;
    }
    let mid = (ask + bid) / Decimal::TWO;
    Some((ask - bid) / mid)
}

/// Spread width expressed in whole ticks (rounded to nearest).
pub fn spread_in_ticks(bid: Decimal, ask: Decimal, tick: Decimal) -> Result<i64, PricingError> {
    if tick <= Decimal::ZERO {
        return Err(PricingError::InvalidTick);
    }
    let ticks = (ask - bid) / tick;
    let rounded = ticks.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    Ok(rounded.try_into().unwrap_or(i64::MAX))
}

/// Gate on quote quality: both sides present, ratio and tick-width within
/// thresholds.
///
/// Monotone in both thresholds — tightening either can only reject more.
#[must_use]
pub fn is_spread_reasonable(
    bid: Decimal,
    ask: Decimal,
    tick: Decimal,
    max_ratio: Decimal,
    max_ticks: i64,
) -> bool {
    let Some(ratio) = spread_ratio(bid, ask) else {
        return false;
    };
    let Ok(ticks) = spread_in_ticks(bid, ask, tick) else {
        return false;
    };
    ratio <= max_ratio && ticks <= max_ticks
}

/// Limit price for step `step_index` of `max_steps`, walking from the
/// passive touch toward the aggressive touch.
///
/// Step 0 rests on the order's own side of the book; step `max_steps`
/// crosses to the opposite touch. Intermediate buy steps round up to the
/// tick (sell steps round down) so the walk never regresses, and every
/// price is clamped to the aggressive touch.
pub fn step_price(
    bid: Decimal,
    ask: Decimal,
    tick: Decimal,
    step_index: u32,
    max_steps: u32,
    side: OrderSide,
) -> Result<Decimal, PricingError> {
    if tick <= Decimal::ZERO {
        return Err(PricingError::InvalidTick);
    }
    let (own, opposite) = match side {
        OrderSide::Buy => (bid, ask),
        OrderSide::Sell => (ask, bid),
    };
    if max_steps == 0 || step_index >= max_steps {
        return round_to_tick(opposite, tick, RoundMode::Nearest);
    }
    if step_index == 0 {
        return round_to_tick(own, tick, RoundMode::Nearest);
    }

    let ratio = Decimal::from(step_index) / Decimal::from(max_steps);
    match side {
        OrderSide::Buy => {
            let target = own + (opposite - own) * ratio;
            let price = round_to_tick(target, tick, RoundMode::Ceil)?;
            Ok(price.min(round_to_tick(opposite, tick, RoundMode::Nearest)?))
        }
        OrderSide::Sell => {
            let target = own - (own - opposite) * ratio;
            let price = round_to_tick(target, tick, RoundMode::Floor)?;
            Ok(price.max(round_to_tick(opposite, tick, RoundMode::Nearest)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn round_to_tick_nearest_floor_ceil() {
        let tick = dec!(0.05);
        assert_eq!(round_to_tick(dec!(1.12), tick, RoundMode::Nearest).unwrap(), dec!(1.10));
        assert_eq!(round_to_tick(dec!(1.13), tick, RoundMode::Nearest).unwrap(), dec!(1.15));
        assert_eq!(round_to_tick(dec!(1.12), tick, RoundMode::Floor).unwrap(), dec!(1.10));
        assert_eq!(round_to_tick(dec!(1.11), tick, RoundMode::Ceil).unwrap(), dec!(1.15));
    }

    #[test]
    fn round_to_tick_ties_go_to_even_tick() {
        let tick = dec!(0.10);
        // 1.15 is exactly 11.5 ticks: rounds to 12 (even), not 11.
        assert_eq!(round_to_tick(dec!(1.15), tick, RoundMode::Nearest).unwrap(), dec!(1.2));
        // 1.25 is exactly 12.5 ticks: rounds to 12 (even).
        assert_eq!(round_to_tick(dec!(1.25), tick, RoundMode::Nearest).unwrap(), dec!(1.2));
    }

    #[test]
    fn round_to_tick_is_idempotent() {
        let tick = dec!(0.05);
        let once = round_to_tick(dec!(1.1234), tick, RoundMode::Nearest).unwrap();
        let twice = round_to_tick(once, tick, RoundMode::Nearest).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn round_to_tick_rejects_bad_tick() {
        assert_eq!(
            round_to_tick(dec!(1.0), Decimal::ZERO, RoundMode::Nearest),
            Err(PricingError::InvalidTick)
        );
        assert_eq!(
            round_to_tick(dec!(1.0), dec!(-0.01), RoundMode::Floor),
            Err(PricingError::InvalidTick)
        );
    }

    #[test]
    fn spread_ratio_basic() {
        // (1.20 - 1.00) / 1.10
        let ratio = spread_ratio(dec!(1.00), dec!(1.20)).unwrap();
        assert!((ratio - dec!(0.1818)).abs() < dec!(0.0001));
    }

    #[test]
    fn spread_ratio_undefined_on_one_sided_or_crossed_book() {
        assert_eq!(spread_ratio(Decimal::ZERO, dec!(1.20)), None);
        assert_eq!(spread_ratio(dec!(1.00), Decimal::ZERO), None);
        assert_eq!(spread_ratio(dec!(1.30), dec!(1.20)), None);
    }

    #[test]
    fn equal_bid_ask_is_zero_ratio_and_always_reasonable() {
        assert_eq!(spread_ratio(dec!(1.00), dec!(1.00)), Some(Decimal::ZERO));
        assert!(is_spread_reasonable(dec!(1.00), dec!(1.00), dec!(0.05), dec!(0.15), 2));
    }

    #[test]
    fn spread_in_ticks_rounds() {
        assert_eq!(spread_in_ticks(dec!(1.00), dec!(1.10), dec!(0.05)).unwrap(), 2);
        assert_eq!(spread_in_ticks(dec!(1.00), dec!(1.12), dec!(0.05)).unwrap(), 2);
        assert_eq!(spread_in_ticks(dec!(1.00), dec!(1.13), dec!(0.05)).unwrap(), 3);
    }

    #[test]
    fn reasonable_spread_thresholds_are_monotone() {
        let (bid, ask, tick) = (dec!(1.00), dec!(1.10), dec!(0.05));
        // Reasonable at loose thresholds.
        assert!(is_spread_reasonable(bid, ask, tick, dec!(0.15), 3));
        // Tightening the ratio threshold can only reject.
        assert!(!is_spread_reasonable(bid, ask, tick, dec!(0.05), 3));
        // Tightening the tick threshold can only reject.
        assert!(!is_spread_reasonable(bid, ask, tick, dec!(0.15), 1));
    }

    #[test]
    fn unreasonable_when_either_side_missing() {
        assert!(!is_spread_reasonable(Decimal::ZERO, dec!(1.10), dec!(0.05), dec!(1), 100));
        assert!(!is_spread_reasonable(dec!(1.00), Decimal::ZERO, dec!(0.05), dec!(1), 100));
    }

    #[test]
    fn buy_steps_walk_from_bid_to_ask() {
        let (bid, ask, tick) = (dec!(1.00), dec!(1.20), dec!(0.05));
        assert_eq!(step_price(bid, ask, tick, 0, 2, OrderSide::Buy).unwrap(), dec!(1.00));
        assert_eq!(step_price(bid, ask, tick, 1, 2, OrderSide::Buy).unwrap(), dec!(1.10));
        assert_eq!(step_price(bid, ask, tick, 2, 2, OrderSide::Buy).unwrap(), dec!(1.20));
    }

    #[test]
    fn sell_steps_mirror_buy_steps() {
        let (bid, ask, tick) = (dec!(1.00), dec!(1.20), dec!(0.05));
        assert_eq!(step_price(bid, ask, tick, 0, 2, OrderSide::Sell).unwrap(), dec!(1.20));
        assert_eq!(step_price(bid, ask, tick, 1, 2, OrderSide::Sell).unwrap(), dec!(1.10));
        assert_eq!(step_price(bid, ask, tick, 2, 2, OrderSide::Sell).unwrap(), dec!(1.00));
    }

    #[test]
    fn intermediate_buy_steps_round_up() {
        // 1/3 between 1.00 and 1.20 is ~1.0667 -> ceil to 1.10.
        let price = step_price(dec!(1.00), dec!(1.20), dec!(0.05), 1, 3, OrderSide::Buy).unwrap();
        assert_eq!(price, dec!(1.10));
    }

    #[test]
    fn final_step_equals_opposite_touch() {
        let (bid, ask, tick) = (dec!(1.05), dec!(1.15), dec!(0.05));
        assert_eq!(step_price(bid, ask, tick, 5, 5, OrderSide::Buy).unwrap(), dec!(1.15));
        assert_eq!(step_price(bid, ask, tick, 5, 5, OrderSide::Sell).unwrap(), dec!(1.05));
    }

    #[test]
    fn zero_max_steps_goes_straight_to_aggressive_touch() {
        let price = step_price(dec!(1.00), dec!(1.20), dec!(0.05), 0, 0, OrderSide::Buy).unwrap();
        assert_eq!(price, dec!(1.20));
    }

    #[test]
    fn step_price_never_crosses_the_aggressive_touch() {
        let (bid, ask, tick) = (dec!(0.98), dec!(1.02), dec!(0.05));
        for step in 0..=4u32 {
            let buy = step_price(bid, ask, tick, step, 4, OrderSide::Buy).unwrap();
            assert!(buy <= dec!(1.00), "step {step} buy price {buy} crossed");
        }
    }
}
