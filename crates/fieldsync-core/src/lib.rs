//! fieldsync-core - Offline-first sync engine for field data collection
//!
//! This crate contains the durable per-domain write queue, the dispatcher
//! that drains it, the read-through cache with change-summary reconciliation
//! and the orchestrator that ties them to connectivity.

pub mod auth;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod dispatch;
pub mod domain;
pub mod error;
pub mod http;
mod keyed_lock;
pub mod notice;
pub mod orchestrator;
pub mod queue;
pub mod reconcile;
pub mod state;
pub mod store;
mod util;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use domain::{FormDomain, SyncDomain};
pub use error::{Error, Result};
pub use orchestrator::{OrchestratorHandle, SubmitOutcome, SyncOrchestrator};
pub use state::SyncState;
