//! The polling loops and their control surface.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::stream::{self, StreamExt};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use delta_bridge_core::config::AppConfig;
use delta_bridge_core::events::NotifyEvent;
use delta_bridge_delta_store::{DeltaAction, DeltaStore, NewDeltaRecord};
use delta_bridge_engine::EngineHandle;
use delta_bridge_gateway::{BrokerGateway, InstrumentKind};

use crate::status::PollingStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopKind {
    Positions,
    Orders,
}

impl LoopKind {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Positions => "positions",
            Self::Orders => "orders",
        }
    }
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub position_interval: Duration,
    pub order_interval: Duration,
    pub max_consecutive_errors: u32,
    /// Per-tick account fan-out bound.
    pub concurrency: usize,
    pub delta_change_threshold: f64,
    pub auto_start: bool,
    pub shutdown_grace: Duration,
    /// Cap on the shortened post-error delay.
    pub error_backoff_cap: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            position_interval: Duration::from_secs(15 * 60),
            order_interval: Duration::from_secs(5 * 60),
            max_consecutive_errors: 5,
            concurrency: 4,
            delta_change_threshold: 0.01,
            auto_start: true,
            shutdown_grace: Duration::from_secs(5),
            error_backoff_cap: Duration::from_secs(30),
        }
    }
}

impl PollerConfig {
    #[must_use]
    pub fn from_app(config: &AppConfig) -> Self {
        Self {
            position_interval: Duration::from_secs(config.polling.position_interval_minutes * 60),
            order_interval: Duration::from_secs(config.polling.order_interval_minutes * 60),
            max_consecutive_errors: config.polling.max_consecutive_errors,
            concurrency: config.polling_concurrency(),
            delta_change_threshold: config.delta.change_threshold,
            auto_start: config.polling.auto_start,
            shutdown_grace: Duration::from_secs(config.shutdown_grace_seconds),
            error_backoff_cap: Duration::from_secs(30),
        }
    }
}

enum LoopControl {
    Start,
    Stop,
    TickNow(oneshot::Sender<()>),
}

struct Inner {
    gateway: Arc<dyn BrokerGateway>,
    store: DeltaStore,
    events: mpsc::Sender<NotifyEvent>,
    accounts: Vec<String>,
    engines: HashMap<String, EngineHandle>,
    config: PollerConfig,
}

/// Spawns and controls the two polling loops.
pub struct PollingManager {
    position_status: watch::Receiver<PollingStatus>,
    order_status: watch::Receiver<PollingStatus>,
    position_control: mpsc::Sender<LoopControl>,
    order_control: mpsc::Sender<LoopControl>,
}

impl PollingManager {
    /// Spawns both loops. When `auto_start` is set each loop runs an initial
    /// tick immediately, before entering its interval schedule.
    #[must_use]
    pub fn spawn(
        gateway: Arc<dyn BrokerGateway>,
        store: DeltaStore,
        events: mpsc::Sender<NotifyEvent>,
        accounts: Vec<String>,
        engines: Vec<EngineHandle>,
        config: PollerConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let inner = Arc::new(Inner {
            gateway,
            store,
            events,
            accounts,
            engines: engines
                .into_iter()
                .map(|e| (e.account_id.clone(), e))
                .collect(),
            config: config.clone(),
        });

        let spawn_loop = |kind: LoopKind| {
            let interval = match kind {
                LoopKind::Positions => config.position_interval,
                LoopKind::Orders => config.order_interval,
            };
            let (status_tx, status_rx) = watch::channel(PollingStatus::new(
                kind.name(),
                interval.as_secs(),
                config.auto_start,
            ));
            let (control_tx, control_rx) = mpsc::channel(8);
            tokio::spawn(run_loop(
                inner.clone(),
                kind,
                status_tx,
                control_rx,
                shutdown.clone(),
            ));
            (status_rx, control_tx)
        };

        let (position_status, position_control) = spawn_loop(LoopKind::Positions);
        let (order_status, order_control) = spawn_loop(LoopKind::Orders);

        Self {
            position_status,
            order_status,
            position_control,
            order_control,
        }
    }

    #[must_use]
    pub fn status(&self, kind: LoopKind) -> PollingStatus {
        match kind {
            LoopKind::Positions => self.position_status.borrow().clone(),
            LoopKind::Orders => self.order_status.borrow().clone(),
        }
    }

    fn control(&self, kind: LoopKind) -> &mpsc::Sender<LoopControl> {
        match kind {
            LoopKind::Positions => &self.position_control,
            LoopKind::Orders => &self.order_control,
        }
    }

    /// Re-enables a loop (also the operator action after a budget trip).
    pub async fn start(&self, kind: LoopKind) -> bool {
        self.control(kind).send(LoopControl::Start).await.is_ok()
    }

    pub async fn stop(&self, kind: LoopKind) -> bool {
        self.control(kind).send(LoopControl::Stop).await.is_ok()
    }

    /// Runs one tick now, regardless of the loop's enabled state, and waits
    /// for it to finish.
    pub async fn tick_now(&self, kind: LoopKind) -> bool {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .control(kind)
            .send(LoopControl::TickNow(ack_tx))
            .await
            .is_err()
        {
            return false;
        }
        ack_rx.await.is_ok()
    }
}

async fn run_loop(
    inner: Arc<Inner>,
    kind: LoopKind,
    status_tx: watch::Sender<PollingStatus>,
    mut control: mpsc::Receiver<LoopControl>,
    mut shutdown: watch::Receiver<bool>,
) {
    let interval = match kind {
        LoopKind::Positions => inner.config.position_interval,
        LoopKind::Orders => inner.config.order_interval,
    };
    let mut enabled = inner.config.auto_start;
    let mut pending_tick = enabled;
    let mut next_delay = interval;

    info!(loop_name = kind.name(), enabled, "polling loop started");

    loop {
        if *shutdown.borrow() {
            info!(loop_name = kind.name(), "polling loop stopped");
            return;
        }

        if pending_tick && enabled {
            pending_tick = false;
            let started = std::time::Instant::now();
            match tick_with_grace(&inner, kind, &status_tx, &mut shutdown).await {
                TickRun::Abandoned => {
                    info!(loop_name = kind.name(), "in-flight tick abandoned at shutdown");
                    return;
                }
                TickRun::Completed(errors) => {
                    let failed = !errors.is_empty();
                    finish_tick(&status_tx, &errors);
                    if failed {
                        let tripped = status_tx.borrow().consecutive_errors
                            >= inner.config.max_consecutive_errors;
                        if tripped {
                            enabled = false;
                            status_tx.send_modify(|s| s.enabled = false);
                            let last_error = errors.last().cloned().unwrap_or_default();
                            warn!(
                                loop_name = kind.name(),
                                errors = status_tx.borrow().consecutive_errors,
                                "error budget exhausted, disabling loop"
                            );
                            let _ = inner.events.try_send(NotifyEvent::PollingDisabled {
                                loop_name: kind.name().to_string(),
                                consecutive_errors: status_tx.borrow().consecutive_errors,
                                last_error,
                            });
                        }
                        // Shortened delay to speed recovery.
                        next_delay = interval.min(inner.config.error_backoff_cap);
                    } else {
                        // An overrunning tick triggers the next one
                        // immediately, with no intervening sleep.
                        next_delay = interval.saturating_sub(started.elapsed());
                    }
                }
            }
        }

        tokio::select! {
            () = tokio::time::sleep(next_delay), if enabled => {
                pending_tick = true;
                next_delay = interval;
            }
            cmd = control.recv() => match cmd {
                Some(LoopControl::Start) => {
                    info!(loop_name = kind.name(), "loop enabled");
                    enabled = true;
                    pending_tick = true;
                    status_tx.send_modify(|s| {
                        s.enabled = true;
                        s.consecutive_errors = 0;
                        s.last_error = None;
                    });
                }
                Some(LoopControl::Stop) => {
                    info!(loop_name = kind.name(), "loop disabled");
                    enabled = false;
                    status_tx.send_modify(|s| s.enabled = false);
                }
                Some(LoopControl::TickNow(ack)) => {
                    match tick_with_grace(&inner, kind, &status_tx, &mut shutdown).await {
                        TickRun::Abandoned => return,
                        TickRun::Completed(errors) => finish_tick(&status_tx, &errors),
                    }
                    let _ = ack.send(());
                }
                None => return,
            },
            _ = shutdown.changed() => {}
        }
    }
}

enum TickRun {
    Completed(Vec<String>),
    Abandoned,
}

/// Runs one tick; when shutdown arrives mid-tick the in-flight work gets a
/// bounded grace window to finish, after which it is abandoned.
async fn tick_with_grace(
    inner: &Arc<Inner>,
    kind: LoopKind,
    status_tx: &watch::Sender<PollingStatus>,
    shutdown: &mut watch::Receiver<bool>,
) -> TickRun {
    status_tx.send_modify(|s| s.last_tick_started_at = Some(Utc::now()));

    let tick = run_tick(inner, kind);
    let mut tick = std::pin::pin!(tick);

    tokio::select! {
        errors = &mut tick => TickRun::Completed(errors),
        _ = shutdown.changed() => {
            if !*shutdown.borrow() {
                return TickRun::Completed(tick.await);
            }
            match tokio::time::timeout(inner.config.shutdown_grace, &mut tick).await {
                Ok(errors) => TickRun::Completed(errors),
                Err(_) => TickRun::Abandoned,
            }
        }
    }
}

fn finish_tick(status_tx: &watch::Sender<PollingStatus>, errors: &[String]) {
    status_tx.send_modify(|s| {
        s.last_tick_ended_at = Some(Utc::now());
        s.tick_count += 1;
        if errors.is_empty() {
            s.consecutive_errors = 0;
            s.last_error = None;
        } else {
            s.consecutive_errors += 1;
            s.last_error = errors.last().cloned();
        }
    });
}

/// Fans the tick's per-account work out with bounded concurrency and
/// collects per-account failures; one account's error never stops the
/// others.
async fn run_tick(inner: &Arc<Inner>, kind: LoopKind) -> Vec<String> {
    let concurrency = inner.config.concurrency.max(1);
    let accounts = inner.accounts.clone();
    debug!(loop_name = kind.name(), accounts = accounts.len(), "tick started");

    stream::iter(accounts)
        .map(|account| {
            let inner = inner.clone();
            async move {
                let result = match kind {
                    LoopKind::Positions => poll_account_positions(&inner, &account).await,
                    LoopKind::Orders => poll_account_orders(&inner, &account).await,
                };
                result.err().map(|e| format!("{account}: {e}"))
            }
        })
        .buffer_unordered(concurrency)
        .filter_map(|e| async move { e })
        .collect()
        .await
}

async fn poll_account_positions(inner: &Arc<Inner>, account: &str) -> Result<(), String> {
    let positions = inner
        .gateway
        .positions(account, "USD")
        .await
        .map_err(|e| e.to_string())?;

    let options: Vec<_> = positions
        .iter()
        .filter(|p| p.kind == InstrumentKind::Option)
        .collect();
    let total_delta: f64 = options.iter().map(|p| p.position_delta()).sum();
    debug!(
        account,
        option_positions = options.len(),
        total_delta,
        "positions polled"
    );

    for position in options {
        let observed = position.delta;
        let previous = inner
            .store
            .latest_observed_delta(account, &position.instrument_id)
            .await
            .map_err(|e| e.to_string())?;

        let moved = previous
            .map_or(true, |prev| (observed - prev).abs() > inner.config.delta_change_threshold);
        if !moved {
            continue;
        }

        inner
            .store
            .upsert(NewDeltaRecord {
                account_id: account.to_string(),
                instrument_id: position.instrument_id.clone(),
                correlation_id: None,
                tv_signal_id: None,
                action: DeltaAction::Observe,
                target_delta: None,
                move_position_delta: None,
                observed_delta: Some(observed),
                order_id: None,
            })
            .await
            .map_err(|e| e.to_string())?;

        // Breach = the observation crossed the recorded target. The record
        // stays an `observe`; escalation to `adjust` is reserved for
        // engine-initiated compensation.
        if let (Some(prev), Ok(Some(target))) = (
            previous,
            inner
                .store
                .latest_target_delta(account, &position.instrument_id)
                .await,
        ) {
            let crossed = (prev - target).signum() != (observed - target).signum()
                && (prev - target).abs() > f64::EPSILON;
            if crossed {
                let _ = inner.events.try_send(NotifyEvent::DeltaBreach {
                    account_id: account.to_string(),
                    instrument_id: position.instrument_id.clone(),
                    target_delta: target,
                    observed_delta: observed,
                    at: Utc::now(),
                });
            }
        }
    }

    Ok(())
}

async fn poll_account_orders(inner: &Arc<Inner>, account: &str) -> Result<(), String> {
    let open = inner
        .gateway
        .open_orders(account)
        .await
        .map_err(|e| e.to_string())?;

    let Some(engine) = inner.engines.get(account) else {
        debug!(account, "no engine registered, skipping order reconciliation");
        return Ok(());
    };

    let known = engine.known_orders();
    let known_ids: HashSet<&str> = known
        .iter()
        .filter(|o| !o.phase.is_terminal())
        .filter_map(|o| o.broker_order_id.as_deref())
        .collect();
    let broker_ids: HashSet<&str> = open.iter().map(|o| o.order_id.as_str()).collect();

    // Broker-side orders we do not own: log only (possible external
    // activity); adopting or cancelling them is deliberately out of scope.
    for order in &open {
        if !known_ids.contains(order.order_id.as_str()) {
            info!(
                account,
                order_id = %order.order_id,
                instrument = %order.instrument_id,
                "open order unknown to engine (external activity?)"
            );
        }
    }

    // Engine orders the broker no longer reports: nudge the owning task to
    // reconcile.
    for order_id in known_ids.difference(&broker_ids) {
        debug!(account, order_id, "nudging engine to reconcile missing order");
        engine.nudge_reconcile(order_id).await;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use delta_bridge_delta_store::DeltaQuery;
    use delta_bridge_gateway::mock::{sample_position, MockGateway};
    use delta_bridge_gateway::GatewayError;

    fn fast_config() -> PollerConfig {
        PollerConfig {
            position_interval: Duration::from_millis(40),
            order_interval: Duration::from_millis(40),
            max_consecutive_errors: 3,
            concurrency: 2,
            delta_change_threshold: 0.01,
            auto_start: true,
            shutdown_grace: Duration::from_millis(200),
            error_backoff_cap: Duration::from_millis(40),
        }
    }

    async fn setup(
        config: PollerConfig,
    ) -> (
        Arc<MockGateway>,
        DeltaStore,
        PollingManager,
        watch::Sender<bool>,
        mpsc::Receiver<NotifyEvent>,
    ) {
        let gateway = Arc::new(MockGateway::new());
        let store = DeltaStore::connect_in_memory().await.unwrap();
        let (events_tx, events_rx) = mpsc::channel(64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = PollingManager::spawn(
            gateway.clone(),
            store.clone(),
            events_tx,
            vec!["acct".to_string()],
            Vec::new(),
            config,
            shutdown_rx,
        );
        (gateway, store, manager, shutdown_tx, events_rx)
    }

    #[tokio::test]
    async fn initial_tick_runs_immediately() {
        let (_gateway, _store, manager, shutdown, _events) = setup(fast_config()).await;

        tokio::time::sleep(Duration::from_millis(25)).await;
        let status = manager.status(LoopKind::Positions);
        assert!(status.tick_count >= 1, "initial tick should not wait an interval");
        assert!(status.last_tick_ended_at >= status.last_tick_started_at);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn observe_written_only_when_delta_moves() {
        let (gateway, store, manager, shutdown, _events) = setup(fast_config()).await;
        gateway.set_positions("acct", vec![sample_position("XYZ-250117-100-C", dec!(1), 0.30)]);

        assert!(manager.tick_now(LoopKind::Positions).await);
        assert!(manager.tick_now(LoopKind::Positions).await);

        let records = store
            .by_account(
                "acct",
                &DeltaQuery {
                    actions: vec![DeltaAction::Observe],
                    ..DeltaQuery::default()
                },
            )
            .await
            .unwrap();
        // A second tick with an unchanged delta writes nothing new.
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].observed_delta, Some(0.30));

        // A move beyond the threshold is recorded.
        gateway.set_positions("acct", vec![sample_position("XYZ-250117-100-C", dec!(1), 0.35)]);
        assert!(manager.tick_now(LoopKind::Positions).await);
        let records = store
            .by_account(
                "acct",
                &DeltaQuery {
                    actions: vec![DeltaAction::Observe],
                    ..DeltaQuery::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(records.len(), 2);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn error_budget_disables_position_loop_only() {
        let (gateway, _store, manager, shutdown, mut events) = setup(fast_config()).await;
        for _ in 0..10 {
            gateway.fail_next_positions(GatewayError::Transport("down".to_string()));
        }

        // Three consecutive failing ticks trip the budget.
        let mut waited = 0;
        while manager.status(LoopKind::Positions).enabled && waited < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
        }

        let position = manager.status(LoopKind::Positions);
        assert!(!position.enabled);
        assert_eq!(position.consecutive_errors, 3);
        assert!(position.last_error.as_deref().unwrap().contains("down"));

        // The order loop is unaffected.
        assert!(manager.status(LoopKind::Orders).enabled);

        let mut disabled_event = false;
        while let Ok(event) = events.try_recv() {
            if let NotifyEvent::PollingDisabled { loop_name, consecutive_errors, .. } = event {
                assert_eq!(loop_name, "positions");
                assert_eq!(consecutive_errors, 3);
                disabled_event = true;
            }
        }
        assert!(disabled_event);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn operator_restart_reenables_after_trip() {
        let (gateway, _store, manager, shutdown, _events) = setup(fast_config()).await;
        // Exactly enough failures to trip the budget; the post-restart tick
        // then succeeds.
        for _ in 0..3 {
            gateway.fail_next_positions(GatewayError::Transport("down".to_string()));
        }

        let mut waited = 0;
        while manager.status(LoopKind::Positions).enabled && waited < 100 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            waited += 1;
        }
        assert!(!manager.status(LoopKind::Positions).enabled);

        assert!(manager.start(LoopKind::Positions).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        let status = manager.status(LoopKind::Positions);
        assert!(status.enabled);
        assert_eq!(status.consecutive_errors, 0);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn stop_halts_scheduling_but_manual_tick_still_works() {
        let mut config = fast_config();
        config.auto_start = false;
        let (gateway, store, manager, shutdown, _events) = setup(config).await;
        gateway.set_positions("acct", vec![sample_position("XYZ-250117-100-C", dec!(1), 0.30)]);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(manager.status(LoopKind::Positions).tick_count, 0);

        // Manual trigger works while the schedule is stopped.
        assert!(manager.tick_now(LoopKind::Positions).await);
        assert_eq!(manager.status(LoopKind::Positions).tick_count, 1);
        let records = store.by_account("acct", &DeltaQuery::default()).await.unwrap();
        assert_eq!(records.len(), 1);

        shutdown.send(true).unwrap();
    }

    #[tokio::test]
    async fn breach_emitted_when_observation_crosses_target() {
        let (gateway, store, manager, shutdown, mut events) = setup(fast_config()).await;

        // Target at 0.30; first observation above it, second below.
        store
            .upsert(NewDeltaRecord {
                account_id: "acct".to_string(),
                instrument_id: "XYZ-250117-100-C".to_string(),
                correlation_id: Some("s1".to_string()),
                tv_signal_id: None,
                action: DeltaAction::Target,
                target_delta: Some(0.30),
                move_position_delta: None,
                observed_delta: None,
                order_id: None,
            })
            .await
            .unwrap();

        gateway.set_positions("acct", vec![sample_position("XYZ-250117-100-C", dec!(1), 0.40)]);
        assert!(manager.tick_now(LoopKind::Positions).await);

        gateway.set_positions("acct", vec![sample_position("XYZ-250117-100-C", dec!(1), 0.20)]);
        assert!(manager.tick_now(LoopKind::Positions).await);

        let mut breach = None;
        while let Ok(event) = events.try_recv() {
            if let NotifyEvent::DeltaBreach { target_delta, observed_delta, .. } = event {
                breach = Some((target_delta, observed_delta));
            }
        }
        let (target, observed) = breach.expect("crossing should raise a breach");
        assert!((target - 0.30).abs() < 1e-9);
        assert!((observed - 0.20).abs() < 1e-9);

        shutdown.send(true).unwrap();
    }
}
