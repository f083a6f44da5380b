//! Chain log reader
//!
//! Cursor-driven polling of one event kind on one chain. Events shallower than
//! the confirmation depth are withheld, and the cursor only moves once the
//! consumer acknowledges a batch, so delivery is at-least-once across restarts.

use eyre::Result;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chain::ChainClient;
use crate::db::RelayStore;
use crate::metrics;
use crate::retry::RetryConfig;
use crate::types::{ChainEvent, Direction, EventKind};

/// Events from an inclusive block range, in block then log-index order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventBatch {
    pub from_block: u64,
    pub to_block: u64,
    pub events: Vec<ChainEvent>,
}

pub struct ChainLogReader {
    client: Arc<dyn ChainClient>,
    store: Arc<dyn RelayStore>,
    kind: EventKind,
    genesis_block: u64,
    confirmation_depth: u64,
    max_block_range: u64,
    retry: RetryConfig,
    consecutive_failures: AtomicU32,
}

impl ChainLogReader {
    pub fn new(
        client: Arc<dyn ChainClient>,
        store: Arc<dyn RelayStore>,
        kind: EventKind,
        genesis_block: u64,
        confirmation_depth: u64,
        max_block_range: u64,
        retry: RetryConfig,
    ) -> Self {
        Self {
            client,
            store,
            kind,
            genesis_block,
            confirmation_depth,
            max_block_range: max_block_range.max(1),
            retry,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn direction(&self) -> Direction {
        self.kind.direction()
    }

    pub fn chain_name(&self) -> &str {
        self.client.name()
    }

    /// First block not yet covered by the persisted cursor
    pub async fn next_block(&self) -> Result<u64> {
        let cursor = self
            .store
            .load_cursor(self.client.chain_id(), self.direction())
            .await?;
        Ok(cursor.map_or(self.genesis_block, |c| c.saturating_add(1).max(self.genesis_block)))
    }

    /// Highest block deep enough to act on, if any
    fn safe_tip(&self, latest: u64) -> Option<u64> {
        latest.checked_sub(self.confirmation_depth)
    }

    /// Read the next range of final blocks, or `None` when caught up
    pub async fn poll_batch(&self) -> Result<Option<EventBatch>> {
        let from_block = self.next_block().await?;
        let latest = self.client.latest_block().await?;

        let Some(safe_tip) = self.safe_tip(latest) else {
            return Ok(None);
        };
        if from_block > safe_tip {
            return Ok(None);
        }
        let to_block = safe_tip.min(from_block.saturating_add(self.max_block_range - 1));

        let fetched = self.client.fetch_events(self.kind, from_block, to_block).await?;
        let mut events = Vec::with_capacity(fetched.len());
        for event in fetched {
            let block = event.id.block_number;
            if block < from_block || block > to_block || event.kind != self.kind {
                warn!(chain = %self.client.name(), event = %event.id, "Discarding event outside requested range");
                continue;
            }
            if let Err(e) = event.validate() {
                warn!(chain = %self.client.name(), event = %event.id, error = %e, "Discarding invalid event");
                metrics::record_error(self.client.name(), "invalid_event");
                continue;
            }
            events.push(event);
        }
        events.sort_by_key(|e| (e.id.block_number, e.id.log_index));

        debug!(
            chain = %self.client.name(),
            direction = %self.direction(),
            from_block,
            to_block,
            latest,
            events = events.len(),
            "Read event batch"
        );

        Ok(Some(EventBatch {
            from_block,
            to_block,
            events,
        }))
    }

    /// Poll until a batch is available, backing off on failures without limit
    ///
    /// Returns `None` when the reader is caught up with the safe tip. Dropping
    /// the future during a backoff leaves the cursor untouched.
    pub async fn next_batch(&self) -> Option<EventBatch> {
        loop {
            match self.poll_batch().await {
                Ok(batch) => {
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    return batch;
                }
                Err(e) => {
                    let attempt = self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
                    let backoff = self.retry.jittered_backoff(attempt);
                    warn!(
                        chain = %self.client.name(),
                        direction = %self.direction(),
                        attempt = attempt + 1,
                        ?backoff,
                        error = %e,
                        "Event poll failed, retrying"
                    );
                    metrics::record_error(self.client.name(), "poll");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    /// Persist the cursor once every event of `batch` has been ingested
    pub async fn acknowledge(&self, batch: &EventBatch) -> Result<()> {
        self.store
            .save_cursor(self.client.chain_id(), self.direction(), batch.to_block)
            .await?;
        metrics::record_cursor(self.client.name(), self.direction().as_str(), batch.to_block);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::testing::{SimulatedChain, USER};
    use alloy::primitives::U256;
    use std::time::Duration;

    fn reader(chain: &Arc<SimulatedChain>, store: &Arc<MemoryStore>, depth: u64) -> ChainLogReader {
        ChainLogReader::new(
            chain.clone(),
            store.clone(),
            EventKind::Locked,
            0,
            depth,
            100,
            RetryConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_withholds_events_until_confirmation_depth() {
        let chain = Arc::new(SimulatedChain::source(1, 2));
        let store = Arc::new(MemoryStore::new());
        let reader = reader(&chain, &store, 5);

        chain.fund(USER, U256::from(1_000u64));
        chain.mine(10);
        chain.lock(USER, U256::from(100u64), USER).unwrap();
        chain.mine(1); // lock lands in block 11

        // tip 11, safe tip 6: scanned range excludes the lock
        let batch = reader.poll_batch().await.unwrap().unwrap();
        assert_eq!(batch.to_block, 6);
        assert!(batch.events.is_empty());
        reader.acknowledge(&batch).await.unwrap();

        chain.mine(4); // tip 15, lock is 4 deep
        let batch = reader.poll_batch().await.unwrap().unwrap();
        assert!(batch.events.is_empty());
        reader.acknowledge(&batch).await.unwrap();

        chain.mine(1); // tip 16, lock is 5 deep
        let batch = reader.poll_batch().await.unwrap().unwrap();
        assert_eq!(batch.events.len(), 1);
        assert_eq!(batch.events[0].id.block_number, 11);
    }

    #[tokio::test]
    async fn test_cursor_only_moves_on_acknowledge() {
        let chain = Arc::new(SimulatedChain::source(1, 2));
        let store = Arc::new(MemoryStore::new());
        let reader = reader(&chain, &store, 1);
        chain.mine(5);

        let first = reader.poll_batch().await.unwrap().unwrap();
        let again = reader.poll_batch().await.unwrap().unwrap();
        assert_eq!(first, again);

        reader.acknowledge(&first).await.unwrap();
        assert_eq!(reader.next_block().await.unwrap(), first.to_block + 1);
        assert!(reader.poll_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_retries_without_advancing() {
        let chain = Arc::new(SimulatedChain::source(1, 2));
        let store = Arc::new(MemoryStore::new());
        let reader = reader(&chain, &store, 1);
        chain.mine(5);
        chain.set_unreachable(true);

        let stalled = tokio::time::timeout(Duration::from_millis(30), reader.next_batch()).await;
        assert!(stalled.is_err());
        assert_eq!(store.load_cursor(1, Direction::LockToMint).await.unwrap(), None);

        chain.set_unreachable(false);
        let batch = reader.next_batch().await.unwrap();
        assert_eq!(batch.from_block, 0);
    }

    #[tokio::test]
    async fn test_batches_respect_max_block_range() {
        let chain = Arc::new(SimulatedChain::source(1, 2));
        let store = Arc::new(MemoryStore::new());
        let reader = ChainLogReader::new(
            chain.clone(),
            store.clone(),
            EventKind::Locked,
            3,
            1,
            4,
            RetryConfig::default(),
        );
        chain.mine(20);

        let batch = reader.poll_batch().await.unwrap().unwrap();
        assert_eq!((batch.from_block, batch.to_block), (3, 6));
    }
}
