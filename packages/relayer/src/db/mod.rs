//! Durable relay state
//!
//! Everything the pipeline persists goes through [`RelayStore`]: reader
//! cursors, the idempotency ledger, transfer records and validator
//! attestations. [`PgStore`] is the production implementation.

use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::Result;

pub mod models;
mod postgres;

#[cfg(any(test, feature = "testing"))]
mod memory;

pub use models::*;
pub use postgres::{create_pool, run_migrations, PgStore};

#[cfg(any(test, feature = "testing"))]
pub use memory::MemoryStore;

use crate::types::{
    Attestation, Dedup, Direction, EventId, StatusCount, Transfer, TransferId, TransferStatus,
};

/// Statuses a dispatch worker still has to act on
pub const ACTIVE_STATUSES: [TransferStatus; 4] = [
    TransferStatus::Observed,
    TransferStatus::CollectingSignatures,
    TransferStatus::Dispatching,
    TransferStatus::Failed,
];

#[async_trait]
pub trait RelayStore: Send + Sync {
    /// Last fully processed block for a reader, if any
    async fn load_cursor(&self, chain_id: u64, direction: Direction) -> Result<Option<u64>>;

    async fn save_cursor(&self, chain_id: u64, direction: Direction, block: u64) -> Result<()>;

    /// Atomically record an event identity and, when fresh, its transfer
    ///
    /// Concurrent callers with the same identity see exactly one `Fresh`.
    /// When `transfer` is `None` only the ledger entry is written.
    async fn record_event(&self, id: &EventId, transfer: Option<&Transfer>) -> Result<Dedup>;

    /// Transfer whose originating event has this (chain, tx, log index), at any block
    async fn find_transfer_by_origin(
        &self,
        chain_id: u64,
        tx_hash: B256,
        log_index: u64,
    ) -> Result<Option<Transfer>>;

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>>;

    /// Persist `transfer` only if the stored status still equals `expected`
    async fn update_transfer(&self, expected: TransferStatus, transfer: &Transfer) -> Result<bool>;

    /// Transfers in any of `statuses`, oldest event first (block, then log index)
    async fn transfers_with_status(
        &self,
        direction: Option<Direction>,
        statuses: &[TransferStatus],
        limit: usize,
    ) -> Result<Vec<Transfer>>;

    async fn status_counts(&self) -> Result<Vec<StatusCount>>;

    /// Store an attestation; false if this validator already attested the transfer
    async fn record_attestation(&self, attestation: &Attestation) -> Result<bool>;

    async fn attestations(&self, id: TransferId) -> Result<Vec<Attestation>>;
}
