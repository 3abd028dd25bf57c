//! Signal dispatch pipeline.
//!
//! Entry point for webhook signals: validate, dedupe, serialize per
//! account, select the contract, write the `target` ledger row, and hand
//! the intent to the execution engine. The synchronous answer is an
//! acknowledgement; fills arrive asynchronously through the ledger and the
//! notifier.

pub mod dedupe;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

use delta_bridge_core::config::{AppConfig, RollPolicy};
use delta_bridge_core::signal::{Signal, TradeStrategy};
use delta_bridge_core::types::OrderIntent;
use delta_bridge_delta_store::{DeltaAction, DeltaStore, NewDeltaRecord};
use delta_bridge_engine::selector::SelectError;
use delta_bridge_engine::{AccountEngine, ContractSelector};

use crate::dedupe::DedupeCache;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalError {
    #[error("bad signal: {0}")]
    BadSignal(String),

    #[error("no suitable contract: {0}")]
    NoSuitableContract(String),

    #[error("unreasonable spread on {0}")]
    UnreasonableSpread(String),

    #[error("signal processing timed out")]
    Timeout,

    #[error("broker unavailable: {0}")]
    Gateway(String),

    #[error("ledger unavailable: {0}")]
    Storage(String),

    #[error("engine unavailable: {0}")]
    Engine(String),
}

impl SignalError {
    /// Stable machine-readable kind for the HTTP surface.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::BadSignal(_) => "bad_signal",
            Self::NoSuitableContract(_) => "no_suitable_contract",
            Self::UnreasonableSpread(_) => "unreasonable_spread",
            Self::Timeout => "timeout",
            Self::Gateway(_) => "gateway",
            Self::Storage(_) => "storage",
            Self::Engine(_) => "engine",
        }
    }

    /// True when the caller may usefully retry the same signal later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout | Self::Gateway(_) | Self::Storage(_))
    }

    /// Validation failures map to 4xx, the rest to 5xx.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::BadSignal(_) | Self::NoSuitableContract(_) | Self::UnreasonableSpread(_)
        )
    }
}

/// Synchronous acknowledgement returned to the webhook caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalAck {
    pub accepted: bool,
    pub correlation_id: String,
    pub instrument_id: String,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub dedupe_window: Duration,
    pub signal_timeout: Duration,
    pub roll_policy: RollPolicy,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            dedupe_window: Duration::from_secs(60),
            signal_timeout: Duration::from_secs(60),
            roll_policy: RollPolicy::default(),
        }
    }
}

impl DispatcherConfig {
    #[must_use]
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            dedupe_window: Duration::from_secs(config.dispatch.dedupe_window_seconds),
            signal_timeout: Duration::from_secs(config.dispatch.signal_timeout_seconds),
            roll_policy: config.dispatch.roll_policy,
        }
    }
}

struct WorkItem {
    signal: Signal,
    reply: oneshot::Sender<Result<SignalAck, SignalError>>,
}

struct DispatcherInner {
    config: DispatcherConfig,
    selector: ContractSelector,
    store: DeltaStore,
    engines: HashMap<String, AccountEngine>,
    /// Account name -> enabled flag, from the frozen configuration.
    accounts: HashMap<String, bool>,
    workers: Mutex<HashMap<String, mpsc::Sender<WorkItem>>>,
    shutdown: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct SignalDispatcher {
    inner: Arc<DispatcherInner>,
}

impl SignalDispatcher {
    #[must_use]
    pub fn new(
        config: DispatcherConfig,
        selector: ContractSelector,
        store: DeltaStore,
        engines: Vec<AccountEngine>,
        accounts: Vec<(String, bool)>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                selector,
                store,
                engines: engines
                    .into_iter()
                    .map(|e| (e.account_id().to_string(), e))
                    .collect(),
                accounts: accounts.into_iter().collect(),
                workers: Mutex::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Validates the signal and runs it through its account's worker in
    /// arrival order. Returns when processing finishes or the signal budget
    /// elapses.
    pub async fn dispatch(&self, signal: Signal) -> Result<SignalAck, SignalError> {
        self.validate(&signal)?;

        let worker = self.worker_for(&signal.account_id);
        let (reply_tx, reply_rx) = oneshot::channel();
        worker
            .send(WorkItem {
                signal,
                reply: reply_tx,
            })
            .await
            .map_err(|_| SignalError::Engine("dispatcher worker stopped".to_string()))?;

        reply_rx
            .await
            .map_err(|_| SignalError::Engine("dispatcher worker dropped reply".to_string()))?
    }

    fn validate(&self, signal: &Signal) -> Result<(), SignalError> {
        match self.inner.accounts.get(&signal.account_id) {
            None => {
                return Err(SignalError::BadSignal(format!(
                    "unknown account: {}",
                    signal.account_id
                )))
            }
            Some(false) => {
                return Err(SignalError::BadSignal(format!(
                    "account disabled: {}",
                    signal.account_id
                )))
            }
            Some(true) => {}
        }
        if signal.size <= Decimal::ZERO {
            return Err(SignalError::BadSignal("size must be positive".to_string()));
        }
        if signal.underlying.trim().is_empty() {
            return Err(SignalError::BadSignal("underlying is required".to_string()));
        }
        if !self.inner.engines.contains_key(&signal.account_id) {
            return Err(SignalError::Engine(format!(
                "no engine for account {}",
                signal.account_id
            )));
        }
        Ok(())
    }

    fn worker_for(&self, account_id: &str) -> mpsc::Sender<WorkItem> {
        let mut workers = self.inner.workers.lock();
        workers
            .entry(account_id.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel::<WorkItem>(32);
                let inner = self.inner.clone();
                let account = account_id.to_string();
                tokio::spawn(run_account_worker(inner, account, rx));
                tx
            })
            .clone()
    }
}

/// One worker per account: signals are processed strictly in arrival
/// order, with the dedupe cache confined to this task.
async fn run_account_worker(
    inner: Arc<DispatcherInner>,
    account: String,
    mut items: mpsc::Receiver<WorkItem>,
) {
    let mut dedupe: DedupeCache<Result<SignalAck, SignalError>> =
        DedupeCache::new(inner.config.dedupe_window);
    info!(account, "signal worker started");

    while let Some(item) = items.recv().await {
        if *inner.shutdown.borrow() {
            let _ = item
                .reply
                .send(Err(SignalError::Engine("shutting down".to_string())));
            continue;
        }

        let correlation_id = item.signal.correlation_id.clone();
        if let Some(prior) = dedupe.get(&correlation_id) {
            info!(account, correlation = %correlation_id, "duplicate signal, replaying outcome");
            let _ = item.reply.send(prior);
            continue;
        }

        let outcome = match tokio::time::timeout(
            inner.config.signal_timeout,
            process_signal(&inner, &account, &item.signal),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                // Orchestration is abandoned; any already-placed order keeps
                // running autonomously in the engine.
                warn!(account, correlation = %correlation_id, "signal processing timed out");
                Err(SignalError::Timeout)
            }
        };

        dedupe.put(&correlation_id, outcome.clone());
        let _ = item.reply.send(outcome);
    }
}

async fn process_signal(
    inner: &Arc<DispatcherInner>,
    account: &str,
    signal: &Signal,
) -> Result<SignalAck, SignalError> {
    let strategies = signal
        .transition
        .strategies(signal.side, inner.config.roll_policy);
    let today = Utc::now().date_naive();
    let engine = inner
        .engines
        .get(account)
        .ok_or_else(|| SignalError::Engine(format!("no engine for account {account}")))?;

    info!(
        account,
        correlation = %signal.correlation_id,
        underlying = %signal.underlying,
        transition = ?signal.transition,
        strategies = ?strategies,
        stop = signal.is_stop(),
        "processing signal"
    );

    let mut first_instrument: Option<String> = None;

    for strategy in strategies {
        // A close cannot wait on a clean spread; an open can.
        let allow_wide = strategy.is_closing();
        let selected = inner
            .selector
            .select(&signal.underlying, strategy, signal.side, today, allow_wide)
            .await
            .map_err(|e| match e {
                SelectError::NoSuitableContract { underlying } => {
                    SignalError::NoSuitableContract(underlying)
                }
                SelectError::UnreasonableSpread { instrument_id } => {
                    SignalError::UnreasonableSpread(instrument_id)
                }
                SelectError::Gateway(e) => SignalError::Gateway(e.to_string()),
            })?;

        // The intent timestamp: exactly one `target` row per signal, written
        // before any order is placed.
        if first_instrument.is_none() {
            let target_delta = selected.quote.delta.unwrap_or_else(|| {
                signed_default_target(strategy, &selected)
            });
            inner
                .store
                .upsert(NewDeltaRecord {
                    account_id: account.to_string(),
                    instrument_id: selected.contract.instrument_id.clone(),
                    correlation_id: Some(signal.correlation_id.clone()),
                    tv_signal_id: signal.tv_signal_id.clone(),
                    action: DeltaAction::Target,
                    target_delta: Some(target_delta),
                    move_position_delta: None,
                    observed_delta: None,
                    order_id: None,
                })
                .await
                .map_err(|e| SignalError::Storage(e.to_string()))?;
        }

        let intent = OrderIntent {
            account_id: account.to_string(),
            instrument_id: selected.contract.instrument_id.clone(),
            side: selected.order_side,
            size: signal.size,
            correlation_id: signal.correlation_id.clone(),
            strategy,
            tv_signal_id: signal.tv_signal_id.clone(),
            created_at: Utc::now(),
        };

        engine
            .submit(intent, selected.contract.tick_size)
            .await
            .map_err(|e| SignalError::Engine(e.to_string()))?;

        first_instrument.get_or_insert(selected.contract.instrument_id);
    }

    let instrument_id = first_instrument
        .ok_or_else(|| SignalError::BadSignal("transition carries no trade".to_string()))?;

    Ok(SignalAck {
        accepted: true,
        correlation_id: signal.correlation_id.clone(),
        instrument_id,
    })
}

/// Fallback intended delta when the chain carried no Greeks: the configured
/// open target, signed by the option's exposure direction.
fn signed_default_target(
    strategy: TradeStrategy,
    selected: &delta_bridge_engine::SelectedContract,
) -> f64 {
    use delta_bridge_core::types::OptionRight;
    let magnitude = 0.30;
    let sign = match (selected.contract.right, strategy) {
        (OptionRight::Call, _) => 1.0,
        (OptionRight::Put, _) => -1.0,
    };
    sign * magnitude
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use rust_decimal_macros::dec;

    use delta_bridge_core::config::{ContractSelectionConfig, SpreadConfig};
    use delta_bridge_core::signal::{MarketPosition, PositionTransition, SignalSide};
    use delta_bridge_core::types::{OptionContract, OptionRight};
    use delta_bridge_delta_store::DeltaQuery;
    use delta_bridge_engine::executor::EngineConfig;
    use delta_bridge_gateway::mock::{sample_quote, MockGateway};
    use delta_bridge_gateway::{Chain, ChainEntry};

    struct Harness {
        gateway: Arc<MockGateway>,
        store: DeltaStore,
        dispatcher: SignalDispatcher,
        _shutdown: watch::Sender<bool>,
    }

    async fn harness() -> Harness {
        let gateway: Arc<MockGateway> = Arc::new(MockGateway::new());
        let store = DeltaStore::connect_in_memory().await.unwrap();
        let (events_tx, _events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut engine_config = EngineConfig::default();
        engine_config.step_interval = Duration::from_millis(20);
        engine_config.retry_base_delay = Duration::from_millis(5);
        let engine = AccountEngine::new(
            "main",
            gateway.clone(),
            store.clone(),
            events_tx,
            engine_config,
            shutdown_rx.clone(),
        );

        let selector = ContractSelector::new(
            gateway.clone(),
            ContractSelectionConfig::default(),
            SpreadConfig::default(),
        )
        .with_retry_delay(Duration::from_millis(5));

        let dispatcher = SignalDispatcher::new(
            DispatcherConfig {
                dedupe_window: Duration::from_secs(10),
                signal_timeout: Duration::from_secs(5),
                roll_policy: RollPolicy::CloseThenOpen,
            },
            selector,
            store.clone(),
            vec![engine],
            vec![("main".to_string(), true), ("dark".to_string(), false)],
            shutdown_rx,
        );

        Harness {
            gateway,
            store,
            dispatcher,
            _shutdown: shutdown_tx,
        }
    }

    fn entry(strike: Decimal, right: OptionRight, dte: i64, delta: f64) -> ChainEntry {
        let expiry = Utc::now().date_naive() + ChronoDuration::days(dte);
        let suffix = if right == OptionRight::Call { "C" } else { "P" };
        let contract = OptionContract {
            instrument_id: format!("XYZ-{}-{}-{}", expiry.format("%y%m%d"), strike, suffix),
            underlying: "XYZ".to_string(),
            expiry,
            strike,
            right,
            tick_size: dec!(0.05),
            multiplier: 100,
        };
        // One-tick book: engine placements cross immediately, keeping the
        // placement counts deterministic for the assertions below.
        let mut quote = sample_quote(&contract.instrument_id, dec!(1.05), dec!(1.05), delta);
        quote.underlying_price = dec!(100);
        ChainEntry {
            contract,
            quote: Some(quote),
        }
    }

    fn seed_chain(gateway: &MockGateway) {
        gateway.set_chain(Chain {
            underlying: "XYZ".to_string(),
            underlying_price: dec!(100),
            entries: vec![
                entry(dec!(100), OptionRight::Call, 30, 0.50),
                entry(dec!(110), OptionRight::Call, 30, 0.30),
                entry(dec!(100), OptionRight::Put, 30, -0.50),
                entry(dec!(90), OptionRight::Put, 30, -0.30),
            ],
            fetched_at: Utc::now(),
        });
    }

    fn signal(correlation: &str, prev: MarketPosition, current: MarketPosition, side: SignalSide) -> Signal {
        Signal {
            account_id: "main".to_string(),
            side,
            transition: PositionTransition::from_positions(prev, current).unwrap(),
            size: dec!(1),
            underlying: "XYZ".to_string(),
            correlation_id: correlation.to_string(),
            tv_signal_id: Some(format!("tv-{correlation}")),
            comment: None,
            received_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_signal_acks_with_selected_instrument() {
        let h = harness().await;
        seed_chain(&h.gateway);

        let ack = h
            .dispatcher
            .dispatch(signal("s1", MarketPosition::Flat, MarketPosition::Long, SignalSide::Buy))
            .await
            .unwrap();

        assert!(ack.accepted);
        assert_eq!(ack.correlation_id, "s1");
        assert!(ack.instrument_id.ends_with("110-C"));

        // Exactly one target row, stamped before any order.
        let targets = h
            .store
            .by_account(
                "main",
                &DeltaQuery {
                    actions: vec![DeltaAction::Target],
                    ..DeltaQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].correlation_id.as_deref(), Some("s1"));
        assert_eq!(targets[0].target_delta, Some(0.30));
    }

    #[tokio::test]
    async fn unknown_and_disabled_accounts_are_rejected() {
        let h = harness().await;
        seed_chain(&h.gateway);

        let mut bad = signal("s2", MarketPosition::Flat, MarketPosition::Long, SignalSide::Buy);
        bad.account_id = "ghost".to_string();
        let error = h.dispatcher.dispatch(bad).await.unwrap_err();
        assert!(matches!(error, SignalError::BadSignal(_)));

        let mut disabled = signal("s3", MarketPosition::Flat, MarketPosition::Long, SignalSide::Buy);
        disabled.account_id = "dark".to_string();
        let error = h.dispatcher.dispatch(disabled).await.unwrap_err();
        assert!(matches!(error, SignalError::BadSignal(_)));
    }

    #[tokio::test]
    async fn zero_size_is_a_validation_error() {
        let h = harness().await;
        let mut bad = signal("s4", MarketPosition::Flat, MarketPosition::Long, SignalSide::Buy);
        bad.size = Decimal::ZERO;
        let error = h.dispatcher.dispatch(bad).await.unwrap_err();
        assert!(matches!(error, SignalError::BadSignal(_)));
        assert!(error.is_validation());
        assert_eq!(error.kind(), "bad_signal");
    }

    #[tokio::test]
    async fn duplicate_signal_replays_without_new_orders() {
        let h = harness().await;
        seed_chain(&h.gateway);

        let first = h
            .dispatcher
            .dispatch(signal("s5", MarketPosition::Flat, MarketPosition::Long, SignalSide::Buy))
            .await
            .unwrap();
        let placements_after_first = h.gateway.placements();

        let second = h
            .dispatcher
            .dispatch(signal("s5", MarketPosition::Flat, MarketPosition::Long, SignalSide::Buy))
            .await
            .unwrap();

        assert_eq!(first.instrument_id, second.instrument_id);
        assert_eq!(first.correlation_id, second.correlation_id);
        // No additional orders or target rows from the replay.
        assert_eq!(h.gateway.placements(), placements_after_first);
        let targets = h
            .store
            .by_account(
                "main",
                &DeltaQuery {
                    actions: vec![DeltaAction::Target],
                    ..DeltaQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn empty_chain_is_no_suitable_contract() {
        let h = harness().await;
        h.gateway.set_chain(Chain {
            underlying: "XYZ".to_string(),
            underlying_price: dec!(100),
            entries: vec![entry(dec!(100), OptionRight::Call, 2, 0.50)],
            fetched_at: Utc::now(),
        });

        let error = h
            .dispatcher
            .dispatch(signal("s6", MarketPosition::Flat, MarketPosition::Long, SignalSide::Buy))
            .await
            .unwrap_err();
        assert!(matches!(error, SignalError::NoSuitableContract(_)));
    }

    #[tokio::test]
    async fn close_proceeds_despite_wide_spread() {
        let h = harness().await;
        seed_chain(&h.gateway);

        // The ATM put's live quote is persistently wide.
        let atm_put = format!(
            "XYZ-{}-100-P",
            (Utc::now().date_naive() + ChronoDuration::days(30)).format("%y%m%d")
        );
        h.gateway.push_quote(sample_quote(&atm_put, dec!(0.20), dec!(2.00), -0.50));

        let ack = h
            .dispatcher
            .dispatch(signal("s7", MarketPosition::Long, MarketPosition::Flat, SignalSide::Sell))
            .await
            .unwrap();
        assert_eq!(ack.instrument_id, atm_put);
    }

    #[tokio::test]
    async fn reversal_expands_to_close_then_open() {
        let h = harness().await;
        seed_chain(&h.gateway);

        let ack = h
            .dispatcher
            .dispatch(signal("s8", MarketPosition::Long, MarketPosition::Short, SignalSide::Sell))
            .await
            .unwrap();
        assert!(ack.accepted);

        // Give both serialized intents time to place.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(h.gateway.placements() >= 2, "close and open legs both placed");

        // Still exactly one target row for the signal.
        let targets = h
            .store
            .by_account(
                "main",
                &DeltaQuery {
                    actions: vec![DeltaAction::Target],
                    ..DeltaQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(targets.len(), 1);
    }
}
