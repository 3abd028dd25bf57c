//! REST implementation of the broker gateway.
//!
//! Speaks the broker's JSON-over-HTTP contract (`get_instruments`,
//! `ticker`, `get_positions`, `buy`/`sell`, `cancel`, `get_order_state`,
//! `get_open_orders`). The SDK itself stays outside this crate; only the
//! message-level contract is encoded here.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use async_trait::async_trait;
use delta_bridge_core::types::{OptionContract, OptionRight, OrderSide, QuoteSnapshot};

use crate::cache::TtlCache;
use crate::error::{GatewayError, GatewayResult};
use crate::rate_limiter::{AccountRateLimiters, RateBudget};
use crate::session::BrokerSession;
use crate::types::{
    CancelOutcome, Chain, ChainEntry, InstrumentKind, OpenOrder, OrderKind, OrderRequest,
    OrderState, OrderStatus, Position, Symbol,
};
use crate::BrokerGateway;

const CHAIN_CACHE_TTL: Duration = Duration::from_secs(60);
const SYMBOLS_CACHE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

pub struct RestGateway {
    http: reqwest::Client,
    base_url: String,
    session: Arc<dyn BrokerSession>,
    limiters: AccountRateLimiters,
    call_timeout: Duration,
    chain_cache: TtlCache<(String, Option<NaiveDate>), Chain>,
    symbols_cache: TtlCache<(), Vec<Symbol>>,
}

impl RestGateway {
    #[must_use]
    pub fn new(
        base_url: impl Into<String>,
        session: Arc<dyn BrokerSession>,
        budget: RateBudget,
        call_timeout: Duration,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            session,
            limiters: AccountRateLimiters::new(budget),
            call_timeout,
            chain_cache: TtlCache::new(CHAIN_CACHE_TTL),
            symbols_cache: TtlCache::new(SYMBOLS_CACHE_TTL),
        }
    }

    async fn request<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<serde_json::Value>,
    ) -> GatewayResult<T> {
        let token = self.session.bearer_token().await?;
        let url = format!("{}{}", self.base_url, path);
        let mut builder = self
            .http
            .request(method, &url)
            .bearer_auth(token)
            .query(query);
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let response = tokio::time::timeout(self.call_timeout, builder.send())
            .await
            .map_err(|_| GatewayError::Transport(format!("timeout calling {path}")))?
            .map_err(|e| GatewayError::Transport(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(GatewayError::RateLimited { retry_after });
        }
        if status == reqwest::StatusCode::UNAUTHORIZED {
            return Err(GatewayError::AuthExpired);
        }
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(GatewayError::NotFound(path.to_string()));
        }

        let envelope: Envelope<T> = tokio::time::timeout(self.call_timeout, response.json())
            .await
            .map_err(|_| GatewayError::Transport(format!("timeout reading {path}")))?
            .map_err(|e| GatewayError::Malformed(e.to_string()))?;

        match envelope {
            Envelope {
                result: Some(result),
                ..
            } => Ok(result),
            Envelope {
                error: Some(error), ..
            } => Err(error.into_gateway_error()),
            _ => Err(GatewayError::Malformed(format!(
                "response for {path} had neither result nor error"
            ))),
        }
    }

    /// Runs a request, refreshing the session once on an expired token.
    async fn get_with_refresh<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> GatewayResult<T> {
        match self.request(reqwest::Method::GET, path, query, None).await {
            Err(GatewayError::AuthExpired) => {
                debug!(path, "session expired, refreshing");
                self.session.refresh().await?;
                self.request(reqwest::Method::GET, path, query, None).await
            }
            other => other,
        }
    }

    async fn post_with_refresh<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> GatewayResult<T> {
        match self
            .request(reqwest::Method::POST, path, &[], Some(body.clone()))
            .await
        {
            Err(GatewayError::AuthExpired) => {
                debug!(path, "session expired, refreshing");
                self.session.refresh().await?;
                self.request(reqwest::Method::POST, path, &[], Some(body)).await
            }
            other => other,
        }
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: Option<T>,
    error: Option<WireError>,
}

#[derive(Deserialize)]
struct WireError {
    code: i64,
    message: String,
}

impl WireError {
    fn into_gateway_error(self) -> GatewayError {
        match self.code {
            10028 | 10044 => GatewayError::RateLimited { retry_after: None },
            13009 | 13010 => GatewayError::AuthExpired,
            11044 | 10041 => GatewayError::NotFound(self.message),
            code if (10000..11000).contains(&code) => GatewayError::RejectedByBroker {
                reason: self.message,
            },
            _ => GatewayError::RejectedByBroker {
                reason: format!("{} (code {})", self.message, self.code),
            },
        }
    }
}

#[derive(Deserialize)]
struct InstrumentDto {
    instrument_name: String,
    underlying: String,
    expiry: NaiveDate,
    strike: Decimal,
    option_type: String,
    tick_size: Decimal,
    contract_multiplier: Option<u32>,
    ticker: Option<TickerDto>,
}

impl InstrumentDto {
    fn into_entry(self) -> GatewayResult<ChainEntry> {
        let right = match self.option_type.as_str() {
            "call" => OptionRight::Call,
            "put" => OptionRight::Put,
            other => {
                return Err(GatewayError::Malformed(format!("unknown option type: {other}")))
            }
        };
        let contract = OptionContract {
            instrument_id: self.instrument_name.clone(),
            underlying: self.underlying,
            expiry: self.expiry,
            strike: self.strike,
            right,
            tick_size: self.tick_size,
            multiplier: self.contract_multiplier.unwrap_or(100),
        };
        let quote = self.ticker.map(|t| t.into_quote(&contract.instrument_id));
        Ok(ChainEntry { contract, quote })
    }
}

#[derive(Deserialize)]
struct TickerDto {
    best_bid_price: Option<Decimal>,
    best_ask_price: Option<Decimal>,
    last_price: Option<Decimal>,
    mark_price: Option<Decimal>,
    underlying_price: Option<Decimal>,
    delta: Option<f64>,
    open_interest: Option<u64>,
    volume: Option<u64>,
}

impl TickerDto {
    fn into_quote(self, instrument_id: &str) -> QuoteSnapshot {
        QuoteSnapshot {
            instrument_id: instrument_id.to_string(),
            bid: self.best_bid_price.unwrap_or_default(),
            ask: self.best_ask_price.unwrap_or_default(),
            last: self.last_price.unwrap_or_default(),
            mark: self.mark_price.unwrap_or_default(),
            underlying_price: self.underlying_price.unwrap_or_default(),
            delta: self.delta,
            open_interest: self.open_interest.unwrap_or_default(),
            volume: self.volume.unwrap_or_default(),
            ts: Utc::now(),
        }
    }
}

#[derive(Deserialize)]
struct PositionDto {
    instrument_name: String,
    kind: String,
    size: Decimal,
    average_price: Decimal,
    mark_price: Decimal,
    delta: Option<f64>,
    gamma: Option<f64>,
    theta: Option<f64>,
    vega: Option<f64>,
    floating_profit_loss: Option<Decimal>,
    realized_profit_loss: Option<Decimal>,
}

impl From<PositionDto> for Position {
    fn from(dto: PositionDto) -> Self {
        Self {
            instrument_id: dto.instrument_name,
            kind: if dto.kind == "option" {
                InstrumentKind::Option
            } else {
                InstrumentKind::Equity
            },
            size: dto.size,
            average_price: dto.average_price,
            mark_price: dto.mark_price,
            delta: dto.delta.unwrap_or(0.0),
            gamma: dto.gamma.unwrap_or(0.0),
            theta: dto.theta.unwrap_or(0.0),
            vega: dto.vega.unwrap_or(0.0),
            unrealized_pnl: dto.floating_profit_loss.unwrap_or_default(),
            realized_pnl: dto.realized_profit_loss.unwrap_or_default(),
        }
    }
}

#[derive(Deserialize)]
struct OrderDto {
    order_id: String,
    instrument_name: String,
    direction: String,
    amount: Decimal,
    filled_amount: Decimal,
    price: Option<Decimal>,
    average_price: Option<Decimal>,
    order_state: String,
}

impl OrderDto {
    fn state(&self) -> GatewayResult<OrderState> {
        match self.order_state.as_str() {
            "open" => Ok(OrderState::Open),
            "filled" | "closed" => Ok(OrderState::Filled),
            "cancelled" => Ok(OrderState::Cancelled),
            "rejected" => Ok(OrderState::Rejected),
            other => Err(GatewayError::Malformed(format!("unknown order state: {other}"))),
        }
    }

    fn side(&self) -> GatewayResult<OrderSide> {
        match self.direction.as_str() {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(GatewayError::Malformed(format!("unknown direction: {other}"))),
        }
    }
}

#[derive(Deserialize)]
struct PlaceResultDto {
    order: OrderDto,
}

#[derive(Deserialize)]
struct CancelResultDto {
    order_state: Option<String>,
}

#[derive(Deserialize)]
struct SymbolDto {
    symbol: String,
    name: String,
}

#[async_trait]
impl BrokerGateway for RestGateway {
    async fn option_chain(&self, underlying: &str, expiry: Option<NaiveDate>) -> GatewayResult<Chain> {
        let key = (underlying.to_string(), expiry);
        if let Some(chain) = self.chain_cache.get(&key) {
            return Ok(chain);
        }

        self.limiters.wait_for_read("public").await;
        let mut query = vec![
            ("underlying", underlying.to_string()),
            ("kind", "option".to_string()),
        ];
        if let Some(expiry) = expiry {
            query.push(("expiry", expiry.to_string()));
        }
        let instruments: Vec<InstrumentDto> = self
            .get_with_refresh("/public/get_instruments", &query)
            .await?;

        let mut entries = Vec::with_capacity(instruments.len());
        for dto in instruments {
            entries.push(dto.into_entry()?);
        }
        let underlying_price = entries
            .iter()
            .filter_map(|e| e.quote.as_ref())
            .map(|q| q.underlying_price)
            .find(|p| *p > Decimal::ZERO)
            .unwrap_or_default();

        let chain = Chain {
            underlying: underlying.to_string(),
            underlying_price,
            entries,
            fetched_at: Utc::now(),
        };
        self.chain_cache.insert(key, chain.clone());
        Ok(chain)
    }

    async fn quote(&self, instrument_id: &str) -> GatewayResult<QuoteSnapshot> {
        self.limiters.wait_for_read("public").await;
        let ticker: TickerDto = self
            .get_with_refresh(
                "/public/ticker",
                &[("instrument_name", instrument_id.to_string())],
            )
            .await?;
        Ok(ticker.into_quote(instrument_id))
    }

    async fn positions(&self, account_id: &str, currency: &str) -> GatewayResult<Vec<Position>> {
        self.limiters.wait_for_read(account_id).await;
        let positions: Vec<PositionDto> = self
            .get_with_refresh(
                "/private/get_positions",
                &[
                    ("account", account_id.to_string()),
                    ("currency", currency.to_string()),
                ],
            )
            .await?;
        Ok(positions.into_iter().map(Position::from).collect())
    }

    async fn open_orders(&self, account_id: &str) -> GatewayResult<Vec<OpenOrder>> {
        self.limiters.wait_for_read(account_id).await;
        let orders: Vec<OrderDto> = self
            .get_with_refresh(
                "/private/get_open_orders",
                &[("account", account_id.to_string())],
            )
            .await?;

        let mut open = Vec::with_capacity(orders.len());
        for dto in orders {
            let side = dto.side()?;
            open.push(OpenOrder {
                order_id: dto.order_id,
                instrument_id: dto.instrument_name,
                side,
                size: dto.amount,
                filled_qty: dto.filled_amount,
                price: dto.price,
                created_at: Utc::now(),
            });
        }
        Ok(open)
    }

    async fn place_order(&self, account_id: &str, request: OrderRequest) -> GatewayResult<String> {
        self.limiters.wait_for_order(account_id).await;
        let path = match request.side {
            OrderSide::Buy => "/private/buy",
            OrderSide::Sell => "/private/sell",
        };
        let mut body = json!({
            "account": account_id,
            "instrument_name": request.instrument_id,
            "amount": request.size,
        });
        match request.kind {
            OrderKind::Limit(price) => {
                body["type"] = json!("limit");
                body["price"] = json!(price);
            }
            OrderKind::Market => {
                body["type"] = json!("market");
            }
        }

        let placed: PlaceResultDto = self.post_with_refresh(path, body).await?;
        debug!(
            account = account_id,
            order_id = %placed.order.order_id,
            instrument = %placed.order.instrument_name,
            "order accepted by broker"
        );
        Ok(placed.order.order_id)
    }

    async fn order_status(&self, account_id: &str, order_id: &str) -> GatewayResult<OrderStatus> {
        self.limiters.wait_for_read(account_id).await;
        let dto: OrderDto = self
            .get_with_refresh(
                "/private/get_order_state",
                &[
                    ("account", account_id.to_string()),
                    ("order_id", order_id.to_string()),
                ],
            )
            .await?;
        let state = dto.state()?;
        Ok(OrderStatus {
            order_id: dto.order_id,
            state,
            filled_qty: dto.filled_amount,
            avg_fill_price: dto.average_price,
        })
    }

    async fn cancel_order(&self, account_id: &str, order_id: &str) -> GatewayResult<CancelOutcome> {
        self.limiters.wait_for_cancel(account_id).await;
        let body = json!({ "account": account_id, "order_id": order_id });
        let result: GatewayResult<CancelResultDto> =
            self.post_with_refresh("/private/cancel", body).await;
        match result {
            Ok(dto) => match dto.order_state.as_deref() {
                Some("filled" | "closed") => Ok(CancelOutcome::AlreadyFilled),
                _ => Ok(CancelOutcome::Cancelled),
            },
            Err(GatewayError::NotFound(_)) => Ok(CancelOutcome::NotFound),
            Err(GatewayError::RejectedByBroker { reason })
                if reason.contains("already_filled") =>
            {
                Ok(CancelOutcome::AlreadyFilled)
            }
            Err(error) => {
                warn!(order_id, %error, "cancel failed");
                Err(error)
            }
        }
    }

    async fn us_symbols(&self) -> GatewayResult<Vec<Symbol>> {
        if let Some(symbols) = self.symbols_cache.get(&()) {
            return Ok(symbols);
        }
        self.limiters.wait_for_read("public").await;
        let symbols: Vec<SymbolDto> = self
            .get_with_refresh("/public/get_us_symbols", &[])
            .await?;
        let symbols: Vec<Symbol> = symbols
            .into_iter()
            .map(|s| Symbol {
                symbol: s.symbol,
                name: s.name,
            })
            .collect();
        self.symbols_cache.insert((), symbols.clone());
        Ok(symbols)
    }
}
