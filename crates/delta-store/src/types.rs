//! Delta ledger row types and query shapes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a Delta record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeltaAction {
    Open,
    Close,
    Adjust,
    Observe,
    Target,
}

impl DeltaAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Close => "close",
            Self::Adjust => "adjust",
            Self::Observe => "observe",
            Self::Target => "target",
        }
    }
}

impl std::str::FromStr for DeltaAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "close" => Ok(Self::Close),
            "adjust" => Ok(Self::Adjust),
            "observe" => Ok(Self::Observe),
            "target" => Ok(Self::Target),
            other => Err(format!("unknown delta action: {other}")),
        }
    }
}

impl std::fmt::Display for DeltaAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One row of the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaRecord {
    pub id: i64,
    pub account_id: String,
    pub instrument_id: String,
    pub correlation_id: Option<String>,
    pub tv_signal_id: Option<String>,
    pub action: DeltaAction,
    pub target_delta: Option<f64>,
    pub move_position_delta: Option<f64>,
    pub observed_delta: Option<f64>,
    pub order_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Insert payload; `created_at` is stamped by the store.
#[derive(Debug, Clone)]
pub struct NewDeltaRecord {
    pub account_id: String,
    pub instrument_id: String,
    pub correlation_id: Option<String>,
    pub tv_signal_id: Option<String>,
    pub action: DeltaAction,
    pub target_delta: Option<f64>,
    pub move_position_delta: Option<f64>,
    pub observed_delta: Option<f64>,
    pub order_id: Option<String>,
}

impl NewDeltaRecord {
    /// At least one delta column must be populated; enforced before the
    /// database CHECK so callers get a typed error.
    #[must_use]
    pub fn has_delta(&self) -> bool {
        self.target_delta.is_some()
            || self.move_position_delta.is_some()
            || self.observed_delta.is_some()
    }
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// A new row was appended.
    Inserted(i64),
    /// A row with identical logical content already existed.
    Unchanged(i64),
}

impl UpsertOutcome {
    #[must_use]
    pub const fn id(self) -> i64 {
        match self {
            Self::Inserted(id) | Self::Unchanged(id) => id,
        }
    }
}

/// Filter for [`DeltaStore::by_account`].
#[derive(Debug, Clone, Default)]
pub struct DeltaQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub actions: Vec<DeltaAction>,
    pub limit: Option<u32>,
    pub offset: Option<u32>,
}

/// Aggregate view over one account's records in a time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaSummary {
    pub count_by_action: Vec<(DeltaAction, u64)>,
    /// Sum of the latest observed delta per instrument in the range.
    pub net_observed_delta: f64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Whole-store statistics for the operator surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_records: u64,
    pub count_by_action: Vec<(DeltaAction, u64)>,
    pub accounts: Vec<String>,
    pub instruments: Vec<String>,
}
