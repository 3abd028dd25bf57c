//! Webhook ingress and operator read/control endpoints.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use delta_bridge_core::signal::{MarketPosition, PositionTransition, Signal, SignalSide};
use delta_bridge_delta_store::{DeltaAction, DeltaQuery};
use delta_bridge_dispatcher::SignalError;
use delta_bridge_gateway::BrokerGateway;
use delta_bridge_poller::LoopKind;

use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

fn error_body(kind: &str, message: &str, retryable: Option<bool>) -> Json<Value> {
    let mut body = json!({ "error_kind": kind, "message": message });
    if let Some(retryable) = retryable {
        body["retryable"] = json!(retryable);
    }
    Json(body)
}

// ---- webhook ingress -------------------------------------------------------

/// Inbound TradingView-style alert body. `size` arrives as a number or a
/// numeric string depending on the alert template.
#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub account_name: String,
    pub side: String,
    pub size: NumberOrString,
    pub market_position: String,
    pub prev_market_position: String,
    pub underlying: String,
    #[serde(default)]
    pub tv_id: Option<String>,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum NumberOrString {
    Number(Decimal),
    Text(String),
}

impl NumberOrString {
    fn as_decimal(&self) -> Result<Decimal, String> {
        match self {
            Self::Number(n) => Ok(*n),
            Self::Text(s) => s.trim().parse().map_err(|_| format!("invalid size: {s}")),
        }
    }
}

/// Converts a webhook body into the immutable ingress signal.
pub fn signal_from_webhook(body: &WebhookBody) -> Result<Signal, String> {
    let side = match body.side.to_ascii_lowercase().as_str() {
        "buy" => SignalSide::Buy,
        "sell" => SignalSide::Sell,
        other => return Err(format!("unknown side: {other}")),
    };
    let current: MarketPosition = body.market_position.parse()?;
    let previous: MarketPosition = body.prev_market_position.parse()?;
    let transition = PositionTransition::from_positions(previous, current)?;
    let size = body.size.as_decimal()?;

    // Missing correlation ids are synthesized so every signal stays
    // traceable through the ledger.
    let correlation_id = body
        .tv_id
        .clone()
        .filter(|id| !id.trim().is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    Ok(Signal {
        account_id: body.account_name.clone(),
        side,
        transition,
        size,
        underlying: body.underlying.to_uppercase(),
        correlation_id,
        tv_signal_id: body.tv_id.clone(),
        comment: body.comment.clone(),
        received_at: Utc::now(),
    })
}

pub async fn webhook_signal(
    State(state): State<Arc<AppState>>,
    Json(body): Json<WebhookBody>,
) -> Result<Json<Value>, ApiError> {
    let signal = signal_from_webhook(&body).map_err(|message| {
        (
            StatusCode::BAD_REQUEST,
            error_body("bad_signal", &message, None),
        )
    })?;

    match state.dispatcher.dispatch(signal).await {
        Ok(ack) => Ok(Json(json!({
            "accepted": true,
            "correlation_id": ack.correlation_id,
            "instrument_id": ack.instrument_id,
        }))),
        Err(error) => {
            warn!(kind = error.kind(), %error, "signal rejected");
            let status = if matches!(error, SignalError::BadSignal(_)) {
                StatusCode::BAD_REQUEST
            } else if error.is_validation() {
                StatusCode::UNPROCESSABLE_ENTITY
            } else {
                StatusCode::BAD_GATEWAY
            };
            let retryable = (!error.is_validation()).then(|| error.is_retryable());
            Err((status, error_body(error.kind(), &error.to_string(), retryable)))
        }
    }
}

// ---- health & status -------------------------------------------------------

pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let store_ok = state.store.stats().await.is_ok();
    let status = if store_ok { "ok" } else { "degraded" };
    Json(json!({
        "status": status,
        "checks": { "delta_store": store_ok },
    }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "accounts": state.accounts,
        "mock_mode": state.mock_mode,
        "polling": {
            "positions": state.poller.status(LoopKind::Positions),
            "orders": state.poller.status(LoopKind::Orders),
        },
    }))
}

// ---- positions -------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PositionsQuery {
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

pub async fn positions(
    State(state): State<Arc<AppState>>,
    Path(account): Path<String>,
    Query(query): Query<PositionsQuery>,
) -> Result<Json<Value>, ApiError> {
    let cache_key = format!("{account}/{}", query.currency);
    let positions = match state.positions_cache.get(&cache_key) {
        Some(cached) => cached,
        None => {
            let fresh = state
                .gateway
                .positions(&account, &query.currency)
                .await
                .map_err(|e| {
                    (
                        StatusCode::BAD_GATEWAY,
                        error_body("gateway", &e.to_string(), Some(e.is_retryable())),
                    )
                })?;
            state.positions_cache.insert(cache_key, fresh.clone());
            fresh
        }
    };

    let totals = positions.iter().fold(
        json!({ "delta": 0.0, "gamma": 0.0, "theta": 0.0, "vega": 0.0 }),
        |mut acc, p| {
            let size: f64 = p.size.try_into().unwrap_or(0.0);
            for (key, greek) in [
                ("delta", p.delta),
                ("gamma", p.gamma),
                ("theta", p.theta),
                ("vega", p.vega),
            ] {
                let sum = acc[key].as_f64().unwrap_or(0.0) + greek * size;
                acc[key] = json!(sum);
            }
            acc
        },
    );

    Ok(Json(json!({
        "account": account,
        "positions": positions,
        "greek_totals": totals,
    })))
}

// ---- delta ledger ----------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct DeltaRecordsQuery {
    pub account: String,
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

pub async fn delta_records(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeltaRecordsQuery>,
) -> Result<Json<Value>, ApiError> {
    let actions = match &query.action {
        None => Vec::new(),
        Some(raw) => {
            let action: DeltaAction = raw.parse().map_err(|e: String| {
                (StatusCode::BAD_REQUEST, error_body("bad_query", &e, None))
            })?;
            vec![action]
        }
    };

    let records = state
        .store
        .by_account(
            &query.account,
            &DeltaQuery {
                from: query.from,
                to: query.to,
                actions,
                limit: query.limit,
                offset: query.offset,
            },
        )
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("storage", &e.to_string(), Some(true)),
            )
        })?;

    Ok(Json(json!({ "account": query.account, "records": records })))
}

#[derive(Debug, Deserialize)]
pub struct DeltaSummaryQuery {
    pub account: String,
    /// Look-back window in days.
    #[serde(default = "default_period_days")]
    pub period: i64,
}

fn default_period_days() -> i64 {
    1
}

pub async fn delta_summary(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DeltaSummaryQuery>,
) -> Result<Json<Value>, ApiError> {
    let to = Utc::now();
    let from = to - ChronoDuration::days(query.period.max(0));
    let summary = state
        .store
        .summary(&query.account, from, to)
        .await
        .map_err(|e| {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                error_body("storage", &e.to_string(), Some(true)),
            )
        })?;

    Ok(Json(json!({
        "account": query.account,
        "period_days": query.period,
        "summary": summary,
    })))
}

pub async fn delta_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let stats = state.store.stats().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            error_body("storage", &e.to_string(), Some(true)),
        )
    })?;
    Ok(Json(serde_json::to_value(stats).unwrap_or_default()))
}

// ---- polling control -------------------------------------------------------

fn loop_kind(name: &str) -> Result<LoopKind, ApiError> {
    match name {
        "positions" => Ok(LoopKind::Positions),
        "orders" => Ok(LoopKind::Orders),
        other => Err((
            StatusCode::NOT_FOUND,
            error_body("bad_query", &format!("unknown polling loop: {other}"), None),
        )),
    }
}

pub async fn polling_start(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind = loop_kind(&name)?;
    let ok = state.poller.start(kind).await;
    Ok(Json(json!({ "started": ok, "status": state.poller.status(kind) })))
}

pub async fn polling_stop(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind = loop_kind(&name)?;
    let ok = state.poller.stop(kind).await;
    Ok(Json(json!({ "stopped": ok, "status": state.poller.status(kind) })))
}

pub async fn polling_tick(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let kind = loop_kind(&name)?;
    let started = Utc::now();
    let ok = state.poller.tick_now(kind).await;
    Ok(Json(json!({
        "ticked": ok,
        "started_at": started,
        "ended_at": Utc::now(),
        "status": state.poller.status(kind),
    })))
}

// ---- chain pass-through ----------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ChainQuery {
    pub underlying: String,
    #[serde(default)]
    pub expiry: Option<NaiveDate>,
}

pub async fn chain(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ChainQuery>,
) -> Result<Json<Value>, ApiError> {
    let chain = state
        .gateway
        .option_chain(&query.underlying.to_uppercase(), query.expiry)
        .await
        .map_err(|e| {
            (
                StatusCode::BAD_GATEWAY,
                error_body("gateway", &e.to_string(), Some(e.is_retryable())),
            )
        })?;
    Ok(Json(serde_json::to_value(chain).unwrap_or_default()))
}
