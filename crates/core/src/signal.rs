//! Inbound trade signals and their mapping onto trade strategies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::config::RollPolicy;

/// Direction carried by the alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalSide {
    Buy,
    Sell,
}

/// Market position as the alert source reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketPosition {
    Long,
    Short,
    Flat,
}

impl std::str::FromStr for MarketPosition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "long" => Ok(Self::Long),
            "short" => Ok(Self::Short),
            "flat" => Ok(Self::Flat),
            other => Err(format!("unknown market position: {other}")),
        }
    }
}

/// Transition between the previous and current market position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionTransition {
    FlatToLong,
    LongToFlat,
    FlatToShort,
    ShortToFlat,
    LongToShort,
    ShortToLong,
    LongToLong,
    ShortToShort,
}

impl PositionTransition {
    /// Builds the transition from the alert's previous/current position pair.
    ///
    /// `flat -> flat` carries no trade and is rejected.
    pub fn from_positions(prev: MarketPosition, current: MarketPosition) -> Result<Self, String> {
        use MarketPosition::{Flat, Long, Short};
        match (prev, current) {
            (Flat, Long) => Ok(Self::FlatToLong),
            (Long, Flat) => Ok(Self::LongToFlat),
            (Flat, Short) => Ok(Self::FlatToShort),
            (Short, Flat) => Ok(Self::ShortToFlat),
            (Long, Short) => Ok(Self::LongToShort),
            (Short, Long) => Ok(Self::ShortToLong),
            (Long, Long) => Ok(Self::LongToLong),
            (Short, Short) => Ok(Self::ShortToShort),
            (Flat, Flat) => Err("flat -> flat carries no trade".to_string()),
        }
    }

    /// True for transitions that establish a fresh position.
    #[must_use]
    pub const fn is_entry(self) -> bool {
        matches!(self, Self::FlatToLong | Self::FlatToShort)
    }

    /// True for transitions that flatten an existing position.
    #[must_use]
    pub const fn is_exit(self) -> bool {
        matches!(self, Self::LongToFlat | Self::ShortToFlat)
    }

    /// True for the reversal transitions governed by the roll policy.
    #[must_use]
    pub const fn is_reversal(self) -> bool {
        matches!(self, Self::LongToShort | Self::ShortToLong)
    }
}

/// Strategy attached to an order intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeStrategy {
    OpenLong,
    CloseLong,
    OpenShort,
    CloseShort,
    Roll,
}

impl TradeStrategy {
    /// Whether this strategy opens exposure (used for contract selection).
    #[must_use]
    pub const fn is_opening(self) -> bool {
        matches!(self, Self::OpenLong | Self::OpenShort)
    }

    /// Whether this strategy closes exposure.
    #[must_use]
    pub const fn is_closing(self) -> bool {
        matches!(self, Self::CloseLong | Self::CloseShort)
    }
}

impl std::fmt::Display for TradeStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::OpenLong => "open_long",
            Self::CloseLong => "close_long",
            Self::OpenShort => "open_short",
            Self::CloseShort => "close_short",
            Self::Roll => "roll",
        };
        write!(f, "{s}")
    }
}

impl PositionTransition {
    /// Maps a transition (plus the alert's side) onto the strategies to
    /// execute, in order.
    ///
    /// Same-direction transitions add or reduce depending on the side; the
    /// reversal transitions expand per the configured roll policy, either
    /// into a close-then-open pair or a single roll order.
    #[must_use]
    pub fn strategies(self, side: SignalSide, roll_policy: RollPolicy) -> Vec<TradeStrategy> {
        use TradeStrategy::{CloseLong, CloseShort, OpenLong, OpenShort, Roll};
        match self {
            Self::FlatToLong => vec![OpenLong],
            Self::LongToFlat => vec![CloseLong],
            Self::FlatToShort => vec![OpenShort],
            Self::ShortToFlat => vec![CloseShort],
            Self::LongToLong => match side {
                SignalSide::Buy => vec![OpenLong],
                SignalSide::Sell => vec![CloseLong],
            },
            Self::ShortToShort => match side {
                SignalSide::Sell => vec![OpenShort],
                SignalSide::Buy => vec![CloseShort],
            },
            Self::LongToShort => match roll_policy {
                RollPolicy::CloseThenOpen => vec![CloseLong, OpenShort],
                RollPolicy::SingleOrder => vec![Roll],
            },
            Self::ShortToLong => match roll_policy {
                RollPolicy::CloseThenOpen => vec![CloseShort, OpenLong],
                RollPolicy::SingleOrder => vec![Roll],
            },
        }
    }
}

/// An inbound trade alert after ingress validation.
///
/// Immutable once constructed; `received_at` is stamped at ingress and
/// `correlation_id` is synthesized when the caller did not supply one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub account_id: String,
    pub side: SignalSide,
    pub transition: PositionTransition,
    /// Contracts; must be positive.
    pub size: Decimal,
    pub underlying: String,
    pub correlation_id: String,
    pub tv_signal_id: Option<String>,
    pub comment: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl Signal {
    /// True when the alert comment marks this as a stop-loss close.
    #[must_use]
    pub fn is_stop(&self) -> bool {
        self.comment
            .as_deref()
            .is_some_and(|c| c.to_ascii_lowercase().contains("stop"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_from_positions_covers_all_pairs() {
        use MarketPosition::{Flat, Long, Short};
        assert_eq!(
            PositionTransition::from_positions(Flat, Long).unwrap(),
            PositionTransition::FlatToLong
        );
        assert_eq!(
            PositionTransition::from_positions(Short, Long).unwrap(),
            PositionTransition::ShortToLong
        );
        assert!(PositionTransition::from_positions(Flat, Flat).is_err());
    }

    #[test]
    fn same_direction_transitions_split_on_side() {
        let add = PositionTransition::LongToLong
            .strategies(SignalSide::Buy, RollPolicy::CloseThenOpen);
        assert_eq!(add, vec![TradeStrategy::OpenLong]);

        let reduce = PositionTransition::LongToLong
            .strategies(SignalSide::Sell, RollPolicy::CloseThenOpen);
        assert_eq!(reduce, vec![TradeStrategy::CloseLong]);
    }

    #[test]
    fn reversal_follows_roll_policy() {
        let pair = PositionTransition::LongToShort
            .strategies(SignalSide::Sell, RollPolicy::CloseThenOpen);
        assert_eq!(pair, vec![TradeStrategy::CloseLong, TradeStrategy::OpenShort]);

        let single = PositionTransition::LongToShort
            .strategies(SignalSide::Sell, RollPolicy::SingleOrder);
        assert_eq!(single, vec![TradeStrategy::Roll]);
    }

    #[test]
    fn stop_marker_detected_in_comment() {
        let mut signal = Signal {
            account_id: "main".to_string(),
            side: SignalSide::Sell,
            transition: PositionTransition::LongToFlat,
            size: Decimal::ONE,
            underlying: "XYZ".to_string(),
            correlation_id: "s1".to_string(),
            tv_signal_id: None,
            comment: Some("Stop loss hit".to_string()),
            received_at: Utc::now(),
        };
        assert!(signal.is_stop());
        signal.comment = Some("take profit".to_string());
        assert!(!signal.is_stop());
    }
}
