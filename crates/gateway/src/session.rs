//! Opaque broker session capability.
//!
//! Credential storage and the broker's auth handshake live outside this
//! service; the gateway only needs something that can mint a bearer token
//! and refresh it once when the broker reports it expired.

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::GatewayResult;

#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Current bearer token for outbound calls.
    async fn bearer_token(&self) -> GatewayResult<String>;

    /// Re-authenticates after the broker rejected the current token.
    async fn refresh(&self) -> GatewayResult<()>;
}

/// Session backed by a token resolved from the environment at startup.
///
/// The credentials reference from the account config names an environment
/// variable holding the token; `refresh` re-reads it, which covers rotated
/// tokens written by an external credential agent.
pub struct EnvSession {
    credentials_ref: String,
    token: RwLock<Option<String>>,
}

impl EnvSession {
    #[must_use]
    pub fn new(credentials_ref: impl Into<String>) -> Self {
        Self {
            credentials_ref: credentials_ref.into(),
            token: RwLock::new(None),
        }
    }

    fn read_env(&self) -> GatewayResult<String> {
        std::env::var(&self.credentials_ref).map_err(|_| {
            crate::error::GatewayError::AuthExpired
        })
    }
}

#[async_trait]
impl BrokerSession for EnvSession {
    async fn bearer_token(&self) -> GatewayResult<String> {
        if let Some(token) = self.token.read().clone() {
            return Ok(token);
        }
        let token = self.read_env()?;
        *self.token.write() = Some(token.clone());
        Ok(token)
    }

    async fn refresh(&self) -> GatewayResult<()> {
        let token = self.read_env()?;
        *self.token.write() = Some(token);
        Ok(())
    }
}
