use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::AppState;

/// HTTP surface: the signal webhook plus the operator read/control views.
pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    #[must_use]
    pub const fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Builds the router with all routes.
    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        Router::new()
            .route("/webhook/signal", post(handlers::webhook_signal))
            .route("/health", get(handlers::health))
            .route("/status", get(handlers::status))
            .route("/positions/:account", get(handlers::positions))
            .route("/delta/records", get(handlers::delta_records))
            .route("/delta/summary", get(handlers::delta_summary))
            .route("/delta/stats", get(handlers::delta_stats))
            .route("/polling/:loop/start", post(handlers::polling_start))
            .route("/polling/:loop/stop", post(handlers::polling_stop))
            .route("/polling/:loop/tick", post(handlers::polling_tick))
            .route("/chain", get(handlers::chain))
            .with_state(self.state.clone())
            .layer(cors)
            .layer(TraceLayer::new_for_http())
    }

    /// Serves until the shutdown signal flips.
    ///
    /// # Errors
    /// Returns an error if the listener cannot bind or the server fails.
    pub async fn serve(self, addr: &str, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!(addr, "HTTP surface listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move {
                // Either a real signal or a dropped sender ends the server.
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            })
            .await?;

        Ok(())
    }
}
