//! Vault Relayer - Library interface
//!
//! Relays lock-and-mint and burn-and-release transfers between a vault chain
//! and a wrapped token chain. Re-exports internal modules for use in
//! integration tests.

pub mod api;
pub mod chain;
pub mod config;
pub mod db;
pub mod dispatcher;
pub mod error;
pub mod hash;
pub mod ledger;
pub mod metrics;
pub mod orchestrator;
pub mod quorum;
pub mod reader;
pub mod retry;
pub mod state;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod testing;
