//! PostgreSQL store tests
//!
//! Run with: cargo test --test integration_test -- --ignored --nocapture
//!
//! Prerequisites:
//! - PostgreSQL reachable through DATABASE_URL (migrations are applied here)

use std::sync::Arc;

use alloy::primitives::{Address, B256, U256};
use chrono::Utc;
use rand::Rng;

use vault_relayer::db::{self, PgStore, RelayStore};
use vault_relayer::ledger::IdempotencyLedger;
use vault_relayer::types::{
    Attestation, ChainEvent, Dedup, Direction, EventId, EventKind, Submission, Transfer,
    TransferStatus,
};

mod helpers {
    use super::*;

    pub async fn store() -> Option<Arc<PgStore>> {
        let url = match std::env::var("DATABASE_URL") {
            Ok(url) => url,
            Err(_) => {
                eprintln!("DATABASE_URL not set, skipping");
                return None;
            }
        };
        let pool = db::create_pool(&url).await.ok()?;
        db::run_migrations(&pool).await.ok()?;
        Some(Arc::new(PgStore::new(pool)))
    }

    /// A chain id no other run has used, so tests never see each other's rows
    pub fn unique_chain_id() -> u64 {
        rand::thread_rng().gen_range(1_000_000..i64::MAX as u64)
    }

    pub fn event(chain_id: u64, block_number: u64) -> ChainEvent {
        ChainEvent {
            id: EventId {
                chain_id,
                block_number,
                tx_hash: B256::from(rand::thread_rng().gen::<[u8; 32]>()),
                log_index: 0,
            },
            kind: EventKind::Locked,
            user: Address::repeat_byte(0xaa),
            amount: U256::from(10u64).pow(U256::from(30u64)),
            destination: Address::repeat_byte(0xbb),
            source_chain: chain_id,
            dest_chain: chain_id + 1,
        }
    }
}

#[tokio::test]
#[ignore]
async fn test_pg_ledger_admits_one_concurrent_writer() {
    let Some(store) = helpers::store().await else {
        return;
    };
    let ledger = IdempotencyLedger::new(store.clone());
    let transfer = Transfer::observed(helpers::event(helpers::unique_chain_id(), 10));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let ledger = ledger.clone();
        let transfer = transfer.clone();
        handles.push(tokio::spawn(async move { ledger.record_transfer(&transfer).await }));
    }
    let mut fresh = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap() == Dedup::Fresh {
            fresh += 1;
        }
    }
    assert_eq!(fresh, 1);

    let stored = store.get_transfer(transfer.transfer_id).await.unwrap().unwrap();
    assert_eq!(stored.amount, transfer.amount);
    assert_eq!(stored.event, transfer.event);
}

#[tokio::test]
#[ignore]
async fn test_pg_transfer_update_is_compare_and_set() {
    let Some(store) = helpers::store().await else {
        return;
    };
    let transfer = Transfer::observed(helpers::event(helpers::unique_chain_id(), 5));
    store.record_event(&transfer.event.id, Some(&transfer)).await.unwrap();

    let mut next = transfer.clone();
    next.status = TransferStatus::Dispatching;
    next.submission = Some(Submission {
        nonce: 7,
        tx_hash: B256::repeat_byte(7),
        raw_tx: vec![1, 2, 3],
        submitted_at: Utc::now(),
    });
    assert!(store.update_transfer(TransferStatus::Observed, &next).await.unwrap());
    assert!(!store.update_transfer(TransferStatus::Observed, &next).await.unwrap());

    let stored = store.get_transfer(transfer.transfer_id).await.unwrap().unwrap();
    assert_eq!(stored.status, TransferStatus::Dispatching);
    let submission = stored.submission.unwrap();
    assert_eq!(submission.nonce, 7);
    assert_eq!(submission.raw_tx, vec![1, 2, 3]);

    let by_origin = store
        .find_transfer_by_origin(transfer.event.id.chain_id, transfer.event.id.tx_hash, 0)
        .await
        .unwrap();
    assert_eq!(by_origin.map(|t| t.transfer_id), Some(transfer.transfer_id));
}

#[tokio::test]
#[ignore]
async fn test_pg_cursor_never_moves_backwards() {
    let Some(store) = helpers::store().await else {
        return;
    };
    let chain_id = helpers::unique_chain_id();
    store.save_cursor(chain_id, Direction::LockToMint, 100).await.unwrap();
    store.save_cursor(chain_id, Direction::LockToMint, 90).await.unwrap();
    assert_eq!(
        store.load_cursor(chain_id, Direction::LockToMint).await.unwrap(),
        Some(100)
    );
    assert_eq!(
        store.load_cursor(chain_id, Direction::BurnToRelease).await.unwrap(),
        None
    );
}

#[tokio::test]
#[ignore]
async fn test_pg_attestation_per_validator_once() {
    let Some(store) = helpers::store().await else {
        return;
    };
    let transfer = Transfer::observed(helpers::event(helpers::unique_chain_id(), 3));
    store.record_event(&transfer.event.id, Some(&transfer)).await.unwrap();

    let attestation = Attestation {
        transfer_id: transfer.transfer_id,
        validator: Address::repeat_byte(0x11),
        signature: vec![0u8; 65],
    };
    assert!(store.record_attestation(&attestation).await.unwrap());
    assert!(!store.record_attestation(&attestation).await.unwrap());
    assert_eq!(store.attestations(transfer.transfer_id).await.unwrap().len(), 1);
}
