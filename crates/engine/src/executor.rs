//! Progressive limit-order execution.
//!
//! One engine per account. Intents for the same instrument are serialized
//! through a worker task; distinct instruments run concurrently. Each order
//! is driven by a single owning task, so its state transitions are totally
//! ordered.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use delta_bridge_core::config::AppConfig;
use delta_bridge_core::events::NotifyEvent;
use delta_bridge_core::pricing::{is_spread_reasonable, step_price};
use delta_bridge_core::signal::TradeStrategy;
use delta_bridge_core::types::{OrderIntent, QuoteSnapshot};
use delta_bridge_delta_store::{DeltaAction, DeltaStore, NewDeltaRecord};
use delta_bridge_gateway::{
    BrokerGateway, CancelOutcome, GatewayError, OrderKind, OrderRequest, OrderState, OrderStatus,
};

use crate::state::{ManagedOrder, OrderPhase};

/// Engine knobs; durations are real `Duration`s so tests can run at
/// millisecond scale.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub max_steps: u32,
    pub step_interval: Duration,
    pub enable_market_fallback: bool,
    pub max_place_retries: u32,
    pub hold_budget: u32,
    pub force_progress: bool,
    pub spread_ratio_threshold: Decimal,
    pub spread_tick_threshold: i64,
    /// Best-effort cancel budget during shutdown.
    pub cancel_grace: Duration,
    /// Base delay for transport/rate-limit backoff.
    pub retry_base_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_steps: 5,
            step_interval: Duration::from_secs(8),
            enable_market_fallback: false,
            max_place_retries: 3,
            hold_budget: 3,
            force_progress: false,
            spread_ratio_threshold: Decimal::new(15, 2),
            spread_tick_threshold: 2,
            cancel_grace: Duration::from_secs(3),
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

impl EngineConfig {
    #[must_use]
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            max_steps: config.execution.max_steps,
            step_interval: Duration::from_secs(config.execution.step_interval_seconds),
            enable_market_fallback: config.execution.enable_market_fallback,
            max_place_retries: config.execution.max_place_retries,
            hold_budget: config.execution.hold_budget,
            force_progress: config.execution.force_progress,
            spread_ratio_threshold: config.spread.ratio_threshold,
            spread_tick_threshold: config.spread.tick_multiple_threshold,
            cancel_grace: Duration::from_secs(3),
            retry_base_delay: Duration::from_millis(200),
        }
    }
}

/// Commands an in-flight order accepts from outside its owning task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderCommand {
    /// External cancel request; honored from any non-terminal phase.
    Cancel,
    /// Reconcile nudge from the order poller: re-check broker state now.
    Reconcile,
}

/// Live view of one in-flight order.
#[derive(Clone)]
pub struct ActiveOrder {
    pub snapshot: watch::Receiver<ManagedOrder>,
    control: mpsc::Sender<OrderCommand>,
}

/// Completion handle returned by [`AccountEngine::submit`]. The dispatcher
/// drops it (fills are asynchronous); tests await it.
pub struct OrderTicket {
    pub completion: oneshot::Receiver<ManagedOrder>,
}

struct Job {
    intent: OrderIntent,
    tick_size: Decimal,
    done: oneshot::Sender<ManagedOrder>,
}

struct EngineInner {
    account_id: String,
    gateway: Arc<dyn BrokerGateway>,
    store: DeltaStore,
    events: mpsc::Sender<NotifyEvent>,
    config: EngineConfig,
    shutdown: watch::Receiver<bool>,
    workers: Mutex<HashMap<String, mpsc::Sender<Job>>>,
    active: Arc<RwLock<HashMap<u64, ActiveOrder>>>,
    next_ticket: AtomicU64,
}

/// Per-account progressive execution engine.
#[derive(Clone)]
pub struct AccountEngine {
    inner: Arc<EngineInner>,
}

impl AccountEngine {
    #[must_use]
    pub fn new(
        account_id: impl Into<String>,
        gateway: Arc<dyn BrokerGateway>,
        store: DeltaStore,
        events: mpsc::Sender<NotifyEvent>,
        config: EngineConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                account_id: account_id.into(),
                gateway,
                store,
                events,
                config,
                shutdown,
                workers: Mutex::new(HashMap::new()),
                active: Arc::new(RwLock::new(HashMap::new())),
                next_ticket: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn account_id(&self) -> &str {
        &self.inner.account_id
    }

    /// Hands an intent to the instrument's worker. Ownership of the intent
    /// transfers to the engine; the ticket resolves when the order reaches a
    /// terminal state.
    pub async fn submit(&self, intent: OrderIntent, tick_size: Decimal) -> Result<OrderTicket, SubmitError> {
        if *self.inner.shutdown.borrow() {
            return Err(SubmitError::ShuttingDown);
        }
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            intent,
            tick_size,
            done: done_tx,
        };
        let worker = self.worker_for(&job.intent.instrument_id);
        worker
            .send(job)
            .await
            .map_err(|_| SubmitError::ShuttingDown)?;
        Ok(OrderTicket {
            completion: done_rx,
        })
    }

    /// Read-only handle for the order poller's reconciliation pass.
    #[must_use]
    pub fn handle(&self) -> EngineHandle {
        EngineHandle {
            account_id: self.inner.account_id.clone(),
            active: self.inner.active.clone(),
        }
    }

    fn worker_for(&self, instrument_id: &str) -> mpsc::Sender<Job> {
        let mut workers = self.inner.workers.lock();
        workers
            .entry(instrument_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel::<Job>(16);
                let inner = self.inner.clone();
                tokio::spawn(run_worker(inner, rx));
                tx
            })
            .clone()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("engine is shutting down")]
    ShuttingDown,
}

/// Snapshot surface the poller reconciles against.
#[derive(Clone)]
pub struct EngineHandle {
    pub account_id: String,
    active: Arc<RwLock<HashMap<u64, ActiveOrder>>>,
}

impl EngineHandle {
    /// Snapshots of every non-terminal order the engine owns.
    #[must_use]
    pub fn known_orders(&self) -> Vec<ManagedOrder> {
        self.active
            .read()
            .values()
            .map(|a| a.snapshot.borrow().clone())
            .collect()
    }

    #[must_use]
    pub fn has_broker_order(&self, broker_order_id: &str) -> bool {
        self.active
            .read()
            .values()
            .any(|a| a.snapshot.borrow().broker_order_id.as_deref() == Some(broker_order_id))
    }

    /// Asks the owning task of `broker_order_id` to re-check broker state.
    pub async fn nudge_reconcile(&self, broker_order_id: &str) -> bool {
        let control = {
            let active = self.active.read();
            active
                .values()
                .find(|a| a.snapshot.borrow().broker_order_id.as_deref() == Some(broker_order_id))
                .map(|a| a.control.clone())
        };
        match control {
            Some(control) => control.send(OrderCommand::Reconcile).await.is_ok(),
            None => false,
        }
    }

    /// External cancel by correlation id. Returns false when no live order
    /// matches.
    pub async fn cancel(&self, correlation_id: &str) -> bool {
        let control = {
            let active = self.active.read();
            active
                .values()
                .find(|a| a.snapshot.borrow().intent.correlation_id == correlation_id)
                .map(|a| a.control.clone())
        };
        match control {
            Some(control) => control.send(OrderCommand::Cancel).await.is_ok(),
            None => false,
        }
    }
}

async fn run_worker(inner: Arc<EngineInner>, mut jobs: mpsc::Receiver<Job>) {
    while let Some(job) = jobs.recv().await {
        let ticket = inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (control_tx, control_rx) = mpsc::channel(4);
        let (snapshot_tx, snapshot_rx) = watch::channel(ManagedOrder::new(job.intent.clone()));

        inner.active.write().insert(
            ticket,
            ActiveOrder {
                snapshot: snapshot_rx,
                control: control_tx,
            },
        );

        let driver = OrderDriver {
            inner: inner.clone(),
            order: ManagedOrder::new(job.intent),
            tick_size: job.tick_size,
            snapshot_tx,
            control_rx,
            shutdown: inner.shutdown.clone(),
            spread_holds: 0,
            exhaust_holds: 0,
            seen_filled: Decimal::ZERO,
            seen_notional: Decimal::ZERO,
            last_quote_delta: None,
            pending_quote: None,
        };
        let final_order = driver.run().await;

        inner.active.write().remove(&ticket);
        let _ = job.done.send(final_order);
    }
}

enum Wake {
    Timer,
    Reconcile,
    Cancel,
    Shutdown,
}

enum PlaceOutcome {
    Placed,
    Rejected(String),
    BudgetExhausted,
    Interrupted(Wake),
}

struct OrderDriver {
    inner: Arc<EngineInner>,
    order: ManagedOrder,
    tick_size: Decimal,
    snapshot_tx: watch::Sender<ManagedOrder>,
    control_rx: mpsc::Receiver<OrderCommand>,
    shutdown: watch::Receiver<bool>,
    spread_holds: u32,
    exhaust_holds: u32,
    /// Fill quantity/notional already folded from the current broker order.
    seen_filled: Decimal,
    seen_notional: Decimal,
    last_quote_delta: Option<f64>,
    /// Quote fetched by the pre-advance gate, reused to price the next
    /// placement so each step works from one snapshot.
    pending_quote: Option<QuoteSnapshot>,
}

impl OrderDriver {
    async fn run(mut self) -> ManagedOrder {
        info!(
            account = %self.inner.account_id,
            instrument = %self.order.intent.instrument_id,
            correlation = %self.order.intent.correlation_id,
            size = %self.order.intent.size,
            side = %self.order.intent.side,
            "order accepted"
        );
        self.drive().await;
        self.publish();
        info!(
            account = %self.inner.account_id,
            correlation = %self.order.intent.correlation_id,
            phase = %self.order.phase,
            filled = %self.order.filled_qty,
            steps = self.order.step_index,
            "order finished"
        );
        self.order
    }

    fn publish(&self) {
        let _ = self.snapshot_tx.send(self.order.clone());
    }

    fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    fn is_shutdown(&self) -> bool {
        *self.shutdown.borrow()
    }

    fn spread_ok(&self, quote: &QuoteSnapshot) -> bool {
        is_spread_reasonable(
            quote.bid,
            quote.ask,
            self.tick_size,
            self.config().spread_ratio_threshold,
            self.config().spread_tick_threshold,
        )
    }

    async fn drive(&mut self) {
        let mut step: u32 = 0;

        'place: loop {
            if self.is_shutdown() {
                self.graceful_shutdown().await;
                return;
            }
            if self.order.is_fully_filled() {
                self.finish_filled().await;
                return;
            }

            if self.order.phase != OrderPhase::Placing {
                self.order.transition(OrderPhase::Placing);
                self.publish();
            }
            self.order.advance_step(step);

            // Step budget exhausted: market fallback when configured.
            if step >= self.config().max_steps && self.config().enable_market_fallback {
                self.order.transition(OrderPhase::MarketFallback);
                self.publish();
                match self.place(OrderKind::Market).await {
                    PlaceOutcome::Placed => {
                        self.work_market().await;
                        return;
                    }
                    PlaceOutcome::Rejected(reason) => {
                        self.fail(&reason).await;
                        return;
                    }
                    PlaceOutcome::BudgetExhausted => {
                        self.fail("market placement retries exhausted").await;
                        return;
                    }
                    PlaceOutcome::Interrupted(wake) => {
                        self.handle_interrupt(wake).await;
                        return;
                    }
                }
            }

            let quote = match self.pending_quote.take() {
                Some(quote) => quote,
                None => match self.quote_with_retries().await {
                    Some(quote) => quote,
                    None => {
                        // Quote unavailable after retries: treat the step as
                        // tried.
                        step += 1;
                        if step > self.config().max_steps {
                            self.fail("quotes unavailable").await;
                            return;
                        }
                        continue 'place;
                    }
                },
            };

            // Spread gate before the first placement (scenario: hold with no
            // resting order). Later steps are gated in the work loop, while
            // the previous order still rests.
            if self.order.attempts == 0 && !self.spread_ok(&quote) {
                self.spread_holds += 1;
                if self.spread_holds > self.config().hold_budget {
                    if !self.config().force_progress {
                        self.fail("unreasonable spread persisted").await;
                        return;
                    }
                } else {
                    debug!(
                        instrument = %self.order.intent.instrument_id,
                        holds = self.spread_holds,
                        "spread unreasonable, holding before first placement"
                    );
                    match self.wait_interval().await {
                        Wake::Timer | Wake::Reconcile => continue 'place,
                        wake => {
                            self.handle_interrupt(wake).await;
                            return;
                        }
                    }
                }
            }

            let price = match step_price(
                quote.bid,
                quote.ask,
                self.tick_size,
                step,
                self.config().max_steps,
                self.order.intent.side,
            ) {
                Ok(price) => price,
                Err(e) => {
                    self.fail(&format!("price computation failed: {e}")).await;
                    return;
                }
            };

            match self.place(OrderKind::Limit(price)).await {
                PlaceOutcome::Placed => {}
                PlaceOutcome::Rejected(reason) => {
                    self.fail(&reason).await;
                    return;
                }
                PlaceOutcome::BudgetExhausted => {
                    // Conservative: the step counts as tried.
                    step += 1;
                    if step > self.config().max_steps && !self.config().enable_market_fallback {
                        self.fail("placement retries exhausted").await;
                        return;
                    }
                    continue 'place;
                }
                PlaceOutcome::Interrupted(wake) => {
                    self.handle_interrupt(wake).await;
                    return;
                }
            }

            // Work the resting order.
            'work: loop {
                match self.wait_interval().await {
                    Wake::Timer | Wake::Reconcile => {}
                    wake => {
                        self.handle_interrupt(wake).await;
                        return;
                    }
                }

                let Some(status) = self.status_with_retries().await else {
                    // Status unavailable; reconcile via open orders next tick.
                    continue 'work;
                };
                self.fold_status(&status);
                self.publish();

                if status.state == OrderState::Filled || self.order.is_fully_filled() {
                    self.finish_filled().await;
                    return;
                }
                if matches!(status.state, OrderState::Cancelled | OrderState::Rejected) {
                    // The broker lost the order (external activity); re-place
                    // the remainder at the next step.
                    warn!(
                        order_id = ?self.order.broker_order_id,
                        state = ?status.state,
                        "broker order vanished, re-placing remainder"
                    );
                    step += 1;
                    if step > self.config().max_steps && !self.config().enable_market_fallback {
                        self.fail("order lost at final step").await;
                        return;
                    }
                    continue 'place;
                }

                let next = step + 1;
                if next > self.config().max_steps && !self.config().enable_market_fallback {
                    // Out of steps: the aggressive order stays working for a
                    // bounded number of extra intervals, then the order fails.
                    self.exhaust_holds += 1;
                    if self.exhaust_holds <= self.config().hold_budget {
                        continue 'work;
                    }
                    if self.cancel_and_check_filled("steps exhausted").await {
                        return;
                    }
                    self.fail("unreasonable spread persisted").await;
                    return;
                }

                // Pre-advance spread gate: hold at the current step while the
                // market is too wide. A passing quote is reused to price the
                // next placement.
                if let Some(fresh) = self.quote_with_retries().await {
                    if self.spread_ok(&fresh) {
                        self.pending_quote = Some(fresh);
                    } else {
                        self.spread_holds += 1;
                        if self.spread_holds <= self.config().hold_budget {
                            debug!(
                                instrument = %self.order.intent.instrument_id,
                                holds = self.spread_holds,
                                "spread unreasonable, holding at current step"
                            );
                            continue 'work;
                        }
                        if !self.config().force_progress {
                            if self.cancel_and_check_filled("unreasonable spread persisted").await {
                                return;
                            }
                            self.fail("unreasonable spread persisted").await;
                            return;
                        }
                        self.pending_quote = Some(fresh);
                    }
                }

                // Cancel/replace at the next step price.
                self.order.transition(OrderPhase::Stepping);
                self.publish();
                match self.cancel_with_retries().await {
                    Some(CancelOutcome::AlreadyFilled) => {
                        self.refresh_final_status().await;
                        self.finish_filled().await;
                        return;
                    }
                    Some(CancelOutcome::Cancelled | CancelOutcome::NotFound) => {
                        self.refresh_final_status().await;
                        step = next;
                        continue 'place;
                    }
                    None => {
                        // Cancel rejected outright; re-read open orders to
                        // reconcile rather than guessing, then keep working.
                        self.reconcile_open_orders().await;
                        self.pending_quote = None;
                        self.order.transition(OrderPhase::Working);
                        self.publish();
                        continue 'work;
                    }
                }
            }
        }
    }

    /// Waits out the market order; market orders are expected to fill fast,
    /// so this loop only observes and never replaces.
    async fn work_market(&mut self) {
        loop {
            match self.wait_interval().await {
                Wake::Timer | Wake::Reconcile => {}
                wake => {
                    self.handle_interrupt(wake).await;
                    return;
                }
            }
            let Some(status) = self.status_with_retries().await else {
                continue;
            };
            self.fold_status(&status);
            self.publish();
            if status.state == OrderState::Filled || self.order.is_fully_filled() {
                self.finish_filled().await;
                return;
            }
            if status.state == OrderState::Rejected {
                self.fail("market order rejected").await;
                return;
            }
        }
    }

    async fn handle_interrupt(&mut self, wake: Wake) {
        match wake {
            Wake::Cancel => self.external_cancel().await,
            Wake::Shutdown => self.graceful_shutdown().await,
            Wake::Timer | Wake::Reconcile => {}
        }
    }

    /// Suspends until the step timer fires, a command arrives, or shutdown.
    async fn wait_interval(&mut self) -> Wake {
        if self.is_shutdown() {
            return Wake::Shutdown;
        }
        tokio::select! {
            () = tokio::time::sleep(self.config().step_interval) => Wake::Timer,
            cmd = self.control_rx.recv() => match cmd {
                Some(OrderCommand::Cancel) => Wake::Cancel,
                Some(OrderCommand::Reconcile) => Wake::Reconcile,
                None => Wake::Timer,
            },
            _ = self.shutdown.changed() => Wake::Shutdown,
        }
    }

    /// Places the remaining size; retries transient failures with
    /// exponential backoff inside the configured budget.
    async fn place(&mut self, kind: OrderKind) -> PlaceOutcome {
        let request = OrderRequest {
            instrument_id: self.order.intent.instrument_id.clone(),
            side: self.order.intent.side,
            size: self.order.remaining(),
            kind,
        };

        let mut attempt: u32 = 0;
        loop {
            if self.is_shutdown() {
                return PlaceOutcome::Interrupted(Wake::Shutdown);
            }
            attempt += 1;
            self.order.attempts += 1;

            match self
                .inner
                .gateway
                .place_order(&self.inner.account_id, request.clone())
                .await
            {
                Ok(order_id) => {
                    self.order.broker_order_id = Some(order_id.clone());
                    self.order.current_limit = kind.limit_price();
                    self.order.placed_at = Some(chrono::Utc::now());
                    self.seen_filled = Decimal::ZERO;
                    self.seen_notional = Decimal::ZERO;
                    let next_phase = if self.order.phase == OrderPhase::MarketFallback {
                        OrderPhase::MarketPlaced
                    } else {
                        OrderPhase::Working
                    };
                    self.order.transition(next_phase);
                    self.publish();
                    debug!(
                        order_id,
                        price = ?kind.limit_price(),
                        step = self.order.step_index,
                        size = %request.size,
                        "order placed"
                    );
                    self.emit(NotifyEvent::OrderPlaced {
                        account_id: self.inner.account_id.clone(),
                        instrument_id: self.order.intent.instrument_id.clone(),
                        side: self.order.intent.side,
                        size: request.size,
                        limit_price: kind.limit_price(),
                        step_index: self.order.step_index,
                        correlation_id: self.order.intent.correlation_id.clone(),
                    });
                    return PlaceOutcome::Placed;
                }
                Err(GatewayError::RejectedByBroker { reason }) => {
                    return PlaceOutcome::Rejected(reason);
                }
                Err(error) if error.is_retryable() => {
                    if attempt > self.config().max_place_retries {
                        warn!(%error, attempt, "place retries exhausted");
                        return PlaceOutcome::BudgetExhausted;
                    }
                    let delay = match &error {
                        GatewayError::RateLimited {
                            retry_after: Some(hint),
                        } => *hint,
                        _ => self.config().retry_base_delay * 2u32.saturating_pow(attempt - 1),
                    };
                    debug!(%error, attempt, ?delay, "place failed, backing off");
                    if let Some(wake) = self.interruptible_sleep(delay).await {
                        return PlaceOutcome::Interrupted(wake);
                    }
                }
                Err(error) => {
                    warn!(%error, "place failed");
                    return PlaceOutcome::Rejected(error.to_string());
                }
            }
        }
    }

    /// Sleeps, returning early with the interrupt cause if one arrives.
    async fn interruptible_sleep(&mut self, delay: Duration) -> Option<Wake> {
        tokio::select! {
            () = tokio::time::sleep(delay) => None,
            cmd = self.control_rx.recv() => match cmd {
                Some(OrderCommand::Cancel) => Some(Wake::Cancel),
                _ => None,
            },
            _ = self.shutdown.changed() => Some(Wake::Shutdown),
        }
    }

    async fn quote_with_retries(&mut self) -> Option<QuoteSnapshot> {
        for attempt in 1..=3u32 {
            match self
                .inner
                .gateway
                .quote(&self.order.intent.instrument_id)
                .await
            {
                Ok(quote) => {
                    if quote.delta.is_some() {
                        self.last_quote_delta = quote.delta;
                    }
                    return Some(quote);
                }
                Err(error) if error.is_retryable() && attempt < 3 => {
                    debug!(%error, attempt, "quote failed, retrying");
                    tokio::time::sleep(self.config().retry_base_delay * attempt).await;
                }
                Err(error) => {
                    warn!(%error, "quote unavailable");
                    return None;
                }
            }
        }
        None
    }

    async fn status_with_retries(&mut self) -> Option<OrderStatus> {
        let order_id = self.order.broker_order_id.clone()?;
        for attempt in 1..=3u32 {
            match self
                .inner
                .gateway
                .order_status(&self.inner.account_id, &order_id)
                .await
            {
                Ok(status) => return Some(status),
                Err(GatewayError::NotFound(_)) => {
                    return Some(OrderStatus {
                        order_id,
                        state: OrderState::Cancelled,
                        filled_qty: self.seen_filled,
                        avg_fill_price: None,
                    });
                }
                Err(error) if error.is_retryable() && attempt < 3 => {
                    debug!(%error, attempt, "status failed, retrying");
                    tokio::time::sleep(self.config().retry_base_delay * attempt).await;
                }
                Err(error) => {
                    warn!(%error, "status unavailable");
                    return None;
                }
            }
        }
        None
    }

    /// Cancels the current broker order with retries. `None` means the
    /// cancel was rejected outright.
    async fn cancel_with_retries(&mut self) -> Option<CancelOutcome> {
        let order_id = self.order.broker_order_id.clone()?;
        for attempt in 1..=3u32 {
            match self
                .inner
                .gateway
                .cancel_order(&self.inner.account_id, &order_id)
                .await
            {
                Ok(outcome) => return Some(outcome),
                Err(GatewayError::RejectedByBroker { reason }) => {
                    warn!(order_id, reason, "cancel rejected by broker");
                    return None;
                }
                Err(error) if error.is_retryable() && attempt < 3 => {
                    debug!(%error, attempt, "cancel failed, retrying");
                    tokio::time::sleep(self.config().retry_base_delay * attempt).await;
                }
                Err(error) => {
                    warn!(%error, "cancel failed");
                    return None;
                }
            }
        }
        None
    }

    /// Folds the broker's cumulative per-order fill state into the managed
    /// order's running totals.
    fn fold_status(&mut self, status: &OrderStatus) {
        let new_qty = status.filled_qty;
        if new_qty <= self.seen_filled {
            return;
        }
        let price = status
            .avg_fill_price
            .or(self.order.current_limit)
            .unwrap_or_default();
        let new_notional = new_qty * price;
        let diff_qty = new_qty - self.seen_filled;
        let diff_notional = new_notional - self.seen_notional;
        self.order.record_fill(diff_qty, diff_notional / diff_qty);
        self.seen_filled = new_qty;
        self.seen_notional = new_notional;
        debug!(
            filled = %self.order.filled_qty,
            avg = ?self.order.avg_fill_price,
            "fill folded"
        );
    }

    /// Reads the final status of the just-cancelled order so late partial
    /// fills are not lost.
    async fn refresh_final_status(&mut self) {
        if let Some(status) = self.status_with_retries().await {
            self.fold_status(&status);
            self.publish();
        }
    }

    /// After a rejected cancel the broker's book is the truth; log whether
    /// our order is still there so operators can follow the divergence.
    async fn reconcile_open_orders(&mut self) {
        match self.inner.gateway.open_orders(&self.inner.account_id).await {
            Ok(orders) => {
                let present = self
                    .order
                    .broker_order_id
                    .as_deref()
                    .is_some_and(|id| orders.iter().any(|o| o.order_id == id));
                debug!(present, "open-order reconciliation after rejected cancel");
            }
            Err(error) => warn!(%error, "open-order reconciliation failed"),
        }
    }

    /// Cancels the current order on a failure path; returns true when the
    /// cancel discovered a complete fill and the order terminated.
    async fn cancel_and_check_filled(&mut self, reason: &str) -> bool {
        self.order.cancel_reason = Some(reason.to_string());
        match self.cancel_with_retries().await {
            Some(CancelOutcome::AlreadyFilled) => {
                self.refresh_final_status().await;
                self.finish_filled().await;
                true
            }
            _ => {
                self.refresh_final_status().await;
                false
            }
        }
    }

    async fn external_cancel(&mut self) {
        info!(
            correlation = %self.order.intent.correlation_id,
            "external cancel requested"
        );
        self.order.transition(OrderPhase::Cancelling);
        self.publish();
        match self.cancel_with_retries().await {
            Some(CancelOutcome::AlreadyFilled) => {
                self.refresh_final_status().await;
                self.finish_filled().await;
            }
            _ => {
                self.refresh_final_status().await;
                self.order.cancel_reason = Some("external cancel".to_string());
                self.order.transition(OrderPhase::Cancelled);
                self.publish();
            }
        }
    }

    /// Shutdown: stop advancing, best-effort cancel inside the grace
    /// budget, leave the broker as the source of truth.
    async fn graceful_shutdown(&mut self) {
        info!(
            correlation = %self.order.intent.correlation_id,
            "shutdown: stopping order"
        );
        if self.order.phase.is_terminal() {
            return;
        }
        self.order.transition(OrderPhase::Cancelling);
        self.publish();
        if let Some(order_id) = self.order.broker_order_id.clone() {
            let cancel = self
                .inner
                .gateway
                .cancel_order(&self.inner.account_id, &order_id);
            match tokio::time::timeout(self.config().cancel_grace, cancel).await {
                Ok(Ok(CancelOutcome::AlreadyFilled)) => {
                    self.refresh_final_status().await;
                    self.finish_filled().await;
                    return;
                }
                Ok(_) => {}
                Err(_) => warn!(order_id, "cancel timed out during shutdown"),
            }
        }
        self.order.cancel_reason = Some("shutdown".to_string());
        self.order.transition(OrderPhase::Cancelled);
        self.publish();
    }

    async fn fail(&mut self, reason: &str) {
        warn!(
            correlation = %self.order.intent.correlation_id,
            reason,
            "order failed"
        );
        self.order.cancel_reason = Some(reason.to_string());
        self.order.transition(OrderPhase::Failed);
        self.publish();

        // In-flight failures leave an `adjust` marker: nothing moved, the
        // next alert is authoritative.
        let record = NewDeltaRecord {
            account_id: self.inner.account_id.clone(),
            instrument_id: self.order.intent.instrument_id.clone(),
            correlation_id: Some(self.order.intent.correlation_id.clone()),
            tv_signal_id: self.order.intent.tv_signal_id.clone(),
            action: DeltaAction::Adjust,
            target_delta: None,
            move_position_delta: Some(0.0),
            observed_delta: self.last_quote_delta,
            order_id: self.order.broker_order_id.clone(),
        };
        if let Err(error) = self.inner.store.upsert(record).await {
            error!(%error, "failed to record order failure");
        }

        self.emit(NotifyEvent::OrderFailed {
            account_id: self.inner.account_id.clone(),
            instrument_id: self.order.intent.instrument_id.clone(),
            reason: reason.to_string(),
            correlation_id: self.order.intent.correlation_id.clone(),
        });
    }

    /// Terminal fill: observe the resulting delta, write the ledger record,
    /// notify. Atomic from the engine's perspective, best-effort in
    /// practice.
    async fn finish_filled(&mut self) {
        self.order.transition(OrderPhase::Filled);
        self.publish();

        let observed = self.observe_position_delta().await;
        self.write_fill_record(observed).await;

        self.emit(NotifyEvent::OrderFilled {
            account_id: self.inner.account_id.clone(),
            instrument_id: self.order.intent.instrument_id.clone(),
            side: self.order.intent.side,
            filled_qty: self.order.filled_qty,
            avg_fill_price: self.order.avg_fill_price.unwrap_or_default(),
            steps_used: self.order.step_index,
            observed_delta: observed,
            correlation_id: self.order.intent.correlation_id.clone(),
        });
    }

    async fn observe_position_delta(&self) -> Option<f64> {
        match self
            .inner
            .gateway
            .positions(&self.inner.account_id, "USD")
            .await
        {
            Ok(positions) => positions
                .iter()
                .find(|p| p.instrument_id == self.order.intent.instrument_id)
                .map(|p| p.delta)
                .or(self.last_quote_delta),
            Err(error) => {
                warn!(%error, "position fetch after fill failed");
                self.last_quote_delta
            }
        }
    }

    async fn write_fill_record(&self, observed: Option<f64>) {
        let action = match self.order.intent.strategy {
            TradeStrategy::OpenLong | TradeStrategy::OpenShort => DeltaAction::Open,
            TradeStrategy::CloseLong | TradeStrategy::CloseShort => DeltaAction::Close,
            TradeStrategy::Roll => DeltaAction::Adjust,
        };
        let record = NewDeltaRecord {
            account_id: self.inner.account_id.clone(),
            instrument_id: self.order.intent.instrument_id.clone(),
            correlation_id: Some(self.order.intent.correlation_id.clone()),
            tv_signal_id: self.order.intent.tv_signal_id.clone(),
            action,
            target_delta: None,
            move_position_delta: None,
            // Best available snapshot, even when the position read failed.
            observed_delta: Some(observed.unwrap_or(0.0)),
            order_id: self.order.broker_order_id.clone(),
        };

        for attempt in 1..=3u32 {
            match self.inner.store.upsert(record.clone()).await {
                Ok(_) => return,
                Err(error) => {
                    error!(%error, attempt, "delta record write failed");
                    if attempt < 3 {
                        tokio::time::sleep(self.config().retry_base_delay * attempt).await;
                    }
                }
            }
        }
    }

    fn emit(&self, event: NotifyEvent) {
        if let Err(e) = self.inner.events.try_send(event) {
            warn!(error = %e, "notification sink full, event dropped");
        }
    }
}
