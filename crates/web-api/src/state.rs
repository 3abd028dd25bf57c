//! Shared state behind the HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use delta_bridge_delta_store::DeltaStore;
use delta_bridge_dispatcher::SignalDispatcher;
use delta_bridge_gateway::cache::TtlCache;
use delta_bridge_gateway::{BrokerGateway, Position};
use delta_bridge_poller::PollingManager;

/// Read-through cache TTL for the positions view.
const POSITIONS_CACHE_TTL: Duration = Duration::from_secs(10);

pub struct AppState {
    pub dispatcher: SignalDispatcher,
    pub store: DeltaStore,
    pub poller: Arc<PollingManager>,
    pub gateway: Arc<dyn BrokerGateway>,
    pub accounts: Vec<String>,
    pub mock_mode: bool,
    pub positions_cache: TtlCache<String, Vec<Position>>,
}

impl AppState {
    #[must_use]
    pub fn new(
        dispatcher: SignalDispatcher,
        store: DeltaStore,
        poller: Arc<PollingManager>,
        gateway: Arc<dyn BrokerGateway>,
        accounts: Vec<String>,
        mock_mode: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            dispatcher,
            store,
            poller,
            gateway,
            accounts,
            mock_mode,
            positions_cache: TtlCache::new(POSITIONS_CACHE_TTL),
        })
    }
}
