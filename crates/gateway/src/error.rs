//! Gateway error taxonomy.
//!
//! Each failure class is a distinct variant so callers can branch on it:
//! retry transports, back off on rate limits, refresh on expired sessions,
//! and treat broker rejections as terminal.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("rate limited by broker")]
    RateLimited {
        /// Backoff hint from the broker, when it sent one.
        retry_after: Option<Duration>,
    },

    #[error("broker session expired")]
    AuthExpired,

    #[error("rejected by broker: {reason}")]
    RejectedByBroker { reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("malformed broker response: {0}")]
    Malformed(String),
}

impl GatewayError {
    /// Whether a retry (after backoff / session refresh) can succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::RateLimited { .. } | Self::AuthExpired
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;
