//! Structured events published to the notifier sink.
//!
//! Producers (engine, poller, dispatcher) push these into an mpsc channel;
//! the notifier drains it. No component holds the notifier directly.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::OrderSide;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NotifyEvent {
    OrderPlaced {
        account_id: String,
        instrument_id: String,
        side: OrderSide,
        size: Decimal,
        limit_price: Option<Decimal>,
        step_index: u32,
        correlation_id: String,
    },
    OrderFilled {
        account_id: String,
        instrument_id: String,
        side: OrderSide,
        filled_qty: Decimal,
        avg_fill_price: Decimal,
        steps_used: u32,
        observed_delta: Option<f64>,
        correlation_id: String,
    },
    OrderFailed {
        account_id: String,
        instrument_id: String,
        reason: String,
        correlation_id: String,
    },
    PollingDisabled {
        loop_name: String,
        consecutive_errors: u32,
        last_error: String,
    },
    DeltaBreach {
        account_id: String,
        instrument_id: String,
        target_delta: f64,
        observed_delta: f64,
        at: DateTime<Utc>,
    },
}

impl NotifyEvent {
    /// Account the event belongs to; `None` for service-wide events.
    #[must_use]
    pub fn account(&self) -> Option<&str> {
        match self {
            Self::OrderPlaced { account_id, .. }
            | Self::OrderFilled { account_id, .. }
            | Self::OrderFailed { account_id, .. }
            | Self::DeltaBreach { account_id, .. } => Some(account_id),
            Self::PollingDisabled { .. } => None,
        }
    }

    /// Short label used in logs and notification titles.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::OrderPlaced { .. } => "order placed",
            Self::OrderFilled { .. } => "order filled",
            Self::OrderFailed { .. } => "order failed",
            Self::PollingDisabled { .. } => "polling disabled",
            Self::DeltaBreach { .. } => "delta breach",
        }
    }
}
