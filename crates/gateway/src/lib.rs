//! Broker gateway: the request/response contract the rest of the bridge
//! trades through.
//!
//! The gateway is an interface; `RestGateway` speaks the broker's HTTP
//! contract and `MockGateway` is the in-memory simulator selected by
//! `mock_mode`. All operations are I/O and may fail with a
//! [`GatewayError`] the caller can branch on.

pub mod cache;
pub mod error;
pub mod mock;
pub mod rate_limiter;
pub mod rest;
pub mod session;
pub mod types;

use async_trait::async_trait;
use chrono::NaiveDate;

use delta_bridge_core::types::QuoteSnapshot;

pub use error::{GatewayError, GatewayResult};
pub use mock::MockGateway;
pub use rest::RestGateway;
pub use session::{BrokerSession, EnvSession};
pub use types::{
    CancelOutcome, Chain, ChainEntry, InstrumentKind, OpenOrder, OrderKind, OrderRequest,
    OrderState, OrderStatus, Position, Symbol,
};

/// Broker operations the bridge needs.
///
/// Implementations rate-limit per account and enforce a per-call timeout;
/// callers must assume any call may suspend briefly, and no call blocks an
/// unrelated account.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Option chain for an underlying, optionally restricted to one expiry.
    /// Cached with a short TTL per `(underlying, expiry)` key.
    async fn option_chain(&self, underlying: &str, expiry: Option<NaiveDate>)
        -> GatewayResult<Chain>;

    /// Single-shot live quote.
    async fn quote(&self, instrument_id: &str) -> GatewayResult<QuoteSnapshot>;

    /// Authoritative positions with Greeks for one account.
    async fn positions(&self, account_id: &str, currency: &str) -> GatewayResult<Vec<Position>>;

    async fn open_orders(&self, account_id: &str) -> GatewayResult<Vec<OpenOrder>>;

    /// Submits an order and returns the broker order id. At-most-once is the
    /// caller's responsibility via `open_orders` reconciliation.
    async fn place_order(&self, account_id: &str, request: OrderRequest) -> GatewayResult<String>;

    async fn order_status(&self, account_id: &str, order_id: &str) -> GatewayResult<OrderStatus>;

    async fn cancel_order(&self, account_id: &str, order_id: &str) -> GatewayResult<CancelOutcome>;

    /// Bulk US symbol listing, cached for 24 h.
    async fn us_symbols(&self) -> GatewayResult<Vec<Symbol>>;
}
