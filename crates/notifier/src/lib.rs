//! Best-effort operator notifications.
//!
//! Events flow from the engine, poller and dispatcher into an mpsc sink;
//! the router task drains it and posts markdown cards to each account's
//! WeCom-style webhook channel. Delivery failures are logged and retried a
//! few times, never propagated, and never block trading.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use delta_bridge_core::events::NotifyEvent;

/// Outbound sink. Implementations swallow their own failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Delivers one event to one channel, best-effort.
    async fn send(&self, channel: &str, event: &NotifyEvent);
}

/// Notifier for tests and accounts without a configured channel.
#[derive(Debug, Default)]
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn send(&self, _channel: &str, event: &NotifyEvent) {
        debug!(event = event.label(), "notification dropped (no channel)");
    }
}

/// Posts markdown cards to a WeCom group-bot webhook.
pub struct WecomNotifier {
    http: reqwest::Client,
    max_retries: u32,
    retry_delay: Duration,
}

impl Default for WecomNotifier {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

impl WecomNotifier {
    #[must_use]
    pub fn new(max_retries: u32, retry_delay: Duration) -> Self {
        Self {
            http: reqwest::Client::new(),
            max_retries,
            retry_delay,
        }
    }

    async fn post_once(&self, channel: &str, content: &str) -> Result<(), String> {
        let body = json!({
            "msgtype": "markdown",
            "markdown": { "content": content },
        });
        let response = self
            .http
            .post(channel)
            .json(&body)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("webhook returned {}", response.status()))
        }
    }
}

#[async_trait]
impl Notifier for WecomNotifier {
    async fn send(&self, channel: &str, event: &NotifyEvent) {
        let content = render_markdown(event);
        for attempt in 1..=self.max_retries {
            match self.post_once(channel, &content).await {
                Ok(()) => {
                    debug!(event = event.label(), attempt, "notification delivered");
                    return;
                }
                Err(error) => {
                    warn!(event = event.label(), attempt, error, "notification attempt failed");
                    if attempt < self.max_retries {
                        // Linear backoff between attempts.
                        tokio::time::sleep(self.retry_delay * attempt).await;
                    }
                }
            }
        }
        warn!(event = event.label(), "notification dropped after retries");
    }
}

/// Renders an event as the markdown card body.
#[must_use]
pub fn render_markdown(event: &NotifyEvent) -> String {
    match event {
        NotifyEvent::OrderPlaced {
            account_id,
            instrument_id,
            side,
            size,
            limit_price,
            step_index,
            correlation_id,
        } => {
            let price = limit_price.map_or_else(|| "market".to_string(), |p| p.to_string());
            format!(
                "**Order placed**\n\n- account: {account_id}\n- instrument: {instrument_id}\n\
                 - side: {side}\n- size: {size}\n- price: {price}\n- step: {step_index}\n\
                 - correlation: {correlation_id}"
            )
        }
        NotifyEvent::OrderFilled {
            account_id,
            instrument_id,
            side,
            filled_qty,
            avg_fill_price,
            steps_used,
            observed_delta,
            correlation_id,
        } => {
            let delta = observed_delta.map_or_else(|| "n/a".to_string(), |d| format!("{d:.4}"));
            format!(
                "**Order filled**\n\n- account: {account_id}\n- instrument: {instrument_id}\n\
                 - side: {side}\n- filled: {filled_qty} @ {avg_fill_price}\n\
                 - steps: {steps_used}\n- delta: {delta}\n- correlation: {correlation_id}"
            )
        }
        NotifyEvent::OrderFailed {
            account_id,
            instrument_id,
            reason,
            correlation_id,
        } => format!(
            "**Order failed**\n\n- account: {account_id}\n- instrument: {instrument_id}\n\
             - reason: {reason}\n- correlation: {correlation_id}"
        ),
        NotifyEvent::PollingDisabled {
            loop_name,
            consecutive_errors,
            last_error,
        } => format!(
            "**Polling disabled**\n\n- loop: {loop_name}\n\
             - consecutive errors: {consecutive_errors}\n- last error: {last_error}"
        ),
        NotifyEvent::DeltaBreach {
            account_id,
            instrument_id,
            target_delta,
            observed_delta,
            at,
        } => format!(
            "**Delta breach**\n\n- account: {account_id}\n- instrument: {instrument_id}\n\
             - target: {target_delta:.4}\n- observed: {observed_delta:.4}\n- at: {at}"
        ),
    }
}

/// Drains the event sink and routes each event to its account's channel.
///
/// Service-wide events (polling disabled) fan out to every configured
/// channel so no operator misses them.
pub async fn run_event_router(
    mut events: mpsc::Receiver<NotifyEvent>,
    channels: HashMap<String, String>,
    notifier: Arc<dyn Notifier>,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(channels = channels.len(), "notification router started");
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    info!("notification sink closed");
                    return;
                };
                match event.account() {
                    Some(account) => {
                        if let Some(channel) = channels.get(account) {
                            notifier.send(channel, &event).await;
                        } else {
                            debug!(account, event = event.label(), "no channel configured");
                        }
                    }
                    None => {
                        for channel in channels.values() {
                            notifier.send(channel, &event).await;
                        }
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("notification router stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use rust_decimal_macros::dec;

    use delta_bridge_core::types::OrderSide;

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send(&self, channel: &str, event: &NotifyEvent) {
            self.sent.lock().push((channel.to_string(), event.label().to_string()));
        }
    }

    fn filled_event(account: &str) -> NotifyEvent {
        NotifyEvent::OrderFilled {
            account_id: account.to_string(),
            instrument_id: "XYZ-250117-100-C".to_string(),
            side: OrderSide::Buy,
            filled_qty: dec!(1),
            avg_fill_price: dec!(1.15),
            steps_used: 2,
            observed_delta: Some(0.30),
            correlation_id: "s1".to_string(),
        }
    }

    #[test]
    fn markdown_carries_fill_details() {
        let content = render_markdown(&filled_event("main"));
        assert!(content.contains("main"));
        assert!(content.contains("1.15"));
        assert!(content.contains("0.3000"));
    }

    #[tokio::test]
    async fn router_targets_the_account_channel() {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notifier = Arc::new(RecordingNotifier::default());

        let mut channels = HashMap::new();
        channels.insert("main".to_string(), "https://hook/main".to_string());
        channels.insert("other".to_string(), "https://hook/other".to_string());

        let router = tokio::spawn(run_event_router(
            rx,
            channels,
            notifier.clone(),
            shutdown_rx,
        ));

        tx.send(filled_event("main")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        router.await.unwrap();

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "https://hook/main");
    }

    #[tokio::test]
    async fn service_wide_events_fan_out() {
        let (tx, rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let notifier = Arc::new(RecordingNotifier::default());

        let mut channels = HashMap::new();
        channels.insert("a".to_string(), "https://hook/a".to_string());
        channels.insert("b".to_string(), "https://hook/b".to_string());

        let router = tokio::spawn(run_event_router(
            rx,
            channels,
            notifier.clone(),
            shutdown_rx,
        ));

        tx.send(NotifyEvent::PollingDisabled {
            loop_name: "positions".to_string(),
            consecutive_errors: 5,
            last_error: "transport".to_string(),
        })
        .await
        .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        router.await.unwrap();

        assert_eq!(notifier.sent.lock().len(), 2);
    }
}
