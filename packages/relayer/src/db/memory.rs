use alloy::primitives::{Address, B256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use super::RelayStore;
use crate::types::{
    Attestation, Dedup, Direction, EventId, StatusCount, Transfer, TransferId, TransferStatus,
};

#[derive(Default)]
struct Inner {
    cursors: HashMap<(u64, Direction), u64>,
    ledger: HashSet<EventId>,
    transfers: HashMap<TransferId, Transfer>,
    attestations: BTreeMap<(TransferId, Address), Attestation>,
}

/// In-process store used by tests and the simulated pipeline
///
/// Every operation takes one lock, so each call is atomic in the same way a
/// single database transaction is.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| eyre!("memory store lock poisoned"))
    }

    /// Number of ledger entries
    pub fn ledger_len(&self) -> usize {
        self.lock().map(|inner| inner.ledger.len()).unwrap_or(0)
    }

    /// Every stored transfer, oldest event first
    pub fn all_transfers(&self) -> Vec<Transfer> {
        let mut transfers: Vec<Transfer> = self
            .lock()
            .map(|inner| inner.transfers.values().cloned().collect())
            .unwrap_or_default();
        transfers.sort_by_key(|t| (t.event.id.block_number, t.event.id.log_index));
        transfers
    }

    /// Lose every reader cursor, as after a crash before the cursor write
    pub fn forget_cursors(&self) {
        if let Ok(mut inner) = self.lock() {
            inner.cursors.clear();
        }
    }
}

#[async_trait]
impl RelayStore for MemoryStore {
    async fn load_cursor(&self, chain_id: u64, direction: Direction) -> Result<Option<u64>> {
        Ok(self.lock()?.cursors.get(&(chain_id, direction)).copied())
    }

    async fn save_cursor(&self, chain_id: u64, direction: Direction, block: u64) -> Result<()> {
        let mut inner = self.lock()?;
        let entry = inner.cursors.entry((chain_id, direction)).or_insert(block);
        *entry = (*entry).max(block);
        Ok(())
    }

    async fn record_event(&self, id: &EventId, transfer: Option<&Transfer>) -> Result<Dedup> {
        let mut inner = self.lock()?;
        if !inner.ledger.insert(*id) {
            return Ok(Dedup::AlreadySeen);
        }
        if let Some(t) = transfer {
            inner.transfers.insert(t.transfer_id, t.clone());
        }
        Ok(Dedup::Fresh)
    }

    async fn find_transfer_by_origin(
        &self,
        chain_id: u64,
        tx_hash: B256,
        log_index: u64,
    ) -> Result<Option<Transfer>> {
        Ok(self
            .lock()?
            .transfers
            .values()
            .filter(|t| {
                let id = &t.event.id;
                id.chain_id == chain_id && id.tx_hash == tx_hash && id.log_index == log_index
            })
            .min_by_key(|t| t.created_at)
            .cloned())
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>> {
        Ok(self.lock()?.transfers.get(&id).cloned())
    }

    async fn update_transfer(&self, expected: TransferStatus, transfer: &Transfer) -> Result<bool> {
        let mut inner = self.lock()?;
        match inner.transfers.get_mut(&transfer.transfer_id) {
            Some(stored) if stored.status == expected => {
                *stored = transfer.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transfers_with_status(
        &self,
        direction: Option<Direction>,
        statuses: &[TransferStatus],
        limit: usize,
    ) -> Result<Vec<Transfer>> {
        let inner = self.lock()?;
        let mut matching: Vec<Transfer> = inner
            .transfers
            .values()
            .filter(|t| direction.map_or(true, |d| t.direction == d))
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect();
        matching.sort_by_key(|t| (t.event.id.block_number, t.event.id.log_index));
        matching.truncate(limit);
        Ok(matching)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let inner = self.lock()?;
        let mut counts: BTreeMap<(&'static str, &'static str), StatusCount> = BTreeMap::new();
        for t in inner.transfers.values() {
            counts
                .entry((t.direction.as_str(), t.status.as_str()))
                .or_insert(StatusCount {
                    direction: t.direction,
                    status: t.status,
                    count: 0,
                })
                .count += 1;
        }
        Ok(counts.into_values().collect())
    }

    async fn record_attestation(&self, attestation: &Attestation) -> Result<bool> {
        let mut inner = self.lock()?;
        let key = (attestation.transfer_id, attestation.validator);
        if inner.attestations.contains_key(&key) {
            return Ok(false);
        }
        inner.attestations.insert(key, attestation.clone());
        Ok(true)
    }

    async fn attestations(&self, id: TransferId) -> Result<Vec<Attestation>> {
        Ok(self
            .lock()?
            .attestations
            .values()
            .filter(|a| a.transfer_id == id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::sample_event;

    #[tokio::test]
    async fn test_cursor_is_monotonic() {
        let store = MemoryStore::new();
        assert_eq!(store.load_cursor(1, Direction::LockToMint).await.unwrap(), None);

        store.save_cursor(1, Direction::LockToMint, 50).await.unwrap();
        store.save_cursor(1, Direction::LockToMint, 40).await.unwrap();
        assert_eq!(store.load_cursor(1, Direction::LockToMint).await.unwrap(), Some(50));
        assert_eq!(store.load_cursor(1, Direction::BurnToRelease).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_update_is_compare_and_set() {
        let store = MemoryStore::new();
        let transfer = Transfer::observed(sample_event(3, 0, 10));
        store.record_event(&transfer.event.id, Some(&transfer)).await.unwrap();

        let mut next = transfer.clone();
        next.status = TransferStatus::Dispatching;
        assert!(store.update_transfer(TransferStatus::Observed, &next).await.unwrap());
        // stale writer still believes the transfer is Observed
        assert!(!store.update_transfer(TransferStatus::Observed, &next).await.unwrap());
    }

    #[tokio::test]
    async fn test_transfers_listed_in_event_order() {
        let store = MemoryStore::new();
        for (block, log) in [(9, 1), (3, 2), (9, 0), (3, 0)] {
            let t = Transfer::observed(sample_event(block, log, 1));
            store.record_event(&t.event.id, Some(&t)).await.unwrap();
        }
        let listed = store
            .transfers_with_status(None, &[TransferStatus::Observed], 10)
            .await
            .unwrap();
        let order: Vec<(u64, u64)> = listed
            .iter()
            .map(|t| (t.event.id.block_number, t.event.id.log_index))
            .collect();
        assert_eq!(order, vec![(3, 0), (3, 2), (9, 0), (9, 1)]);
    }
}
