//! Durable ledger of Delta observations.
//!
//! The only shared persistent resource in the bridge: the dispatcher writes
//! `target` rows before any order is placed, the execution engine writes
//! `open`/`close`/`adjust` rows after fills, and the position poller writes
//! `observe` rows. Writes are idempotent so concurrent writers converge.

pub mod retention;
pub mod store;
pub mod types;

pub use retention::run_retention_task;
pub use store::{DeltaStore, StoreError, StoreResult};
pub use types::{
    DeltaAction, DeltaQuery, DeltaRecord, DeltaSummary, NewDeltaRecord, StoreStats, UpsertOutcome,
};
