//! Idempotency ledger
//!
//! The single gate that turns at-least-once event delivery into at-most-once
//! transfer creation. Entries are permanent.

use eyre::Result;
use std::sync::Arc;
use tracing::debug;

use crate::db::RelayStore;
use crate::types::{Dedup, EventId, Transfer};

#[derive(Clone)]
pub struct IdempotencyLedger {
    store: Arc<dyn RelayStore>,
}

impl IdempotencyLedger {
    pub fn new(store: Arc<dyn RelayStore>) -> Self {
        Self { store }
    }

    /// Record an event identity without creating a transfer
    pub async fn record_if_new(&self, id: &EventId) -> Result<Dedup> {
        let outcome = self.store.record_event(id, None).await?;
        debug!(event = %id, ?outcome, "Ledger check");
        Ok(outcome)
    }

    /// Record an event identity and create its transfer in the same atomic step
    pub async fn record_transfer(&self, transfer: &Transfer) -> Result<Dedup> {
        let id = &transfer.event.id;
        let outcome = self.store.record_event(id, Some(transfer)).await?;
        debug!(
            event = %id,
            transfer_id = %transfer.transfer_id,
            ?outcome,
            "Ledger check"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::types::sample_event;

    #[tokio::test]
    async fn test_second_record_is_already_seen() {
        let ledger = IdempotencyLedger::new(Arc::new(MemoryStore::new()));
        let id = sample_event(4, 0, 1).id;

        assert_eq!(ledger.record_if_new(&id).await.unwrap(), Dedup::Fresh);
        assert_eq!(ledger.record_if_new(&id).await.unwrap(), Dedup::AlreadySeen);
    }

    #[tokio::test]
    async fn test_transfer_created_once() {
        let store = Arc::new(MemoryStore::new());
        let ledger = IdempotencyLedger::new(store.clone());
        let transfer = Transfer::observed(sample_event(4, 0, 100));

        assert_eq!(ledger.record_transfer(&transfer).await.unwrap(), Dedup::Fresh);
        assert_eq!(ledger.record_transfer(&transfer).await.unwrap(), Dedup::AlreadySeen);
        assert_eq!(store.all_transfers().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_see_one_fresh() {
        let store = Arc::new(MemoryStore::new());
        let ledger = IdempotencyLedger::new(store.clone());
        let transfer = Transfer::observed(sample_event(8, 2, 100));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let ledger = ledger.clone();
            let transfer = transfer.clone();
            handles.push(tokio::spawn(async move {
                ledger.record_transfer(&transfer).await.unwrap()
            }));
        }

        let mut fresh = 0;
        for handle in handles {
            if handle.await.unwrap() == Dedup::Fresh {
                fresh += 1;
            }
        }
        assert_eq!(fresh, 1);
        assert_eq!(store.all_transfers().len(), 1);
        assert_eq!(store.ledger_len(), 1);
    }
}
