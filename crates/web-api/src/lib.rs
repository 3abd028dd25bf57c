//! HTTP surface: webhook ingress and the operator query/control API.

pub mod handlers;
pub mod server;
pub mod state;

pub use server::ApiServer;
pub use state::AppState;
