//! Action dispatcher
//!
//! Submits the destination call for a transfer and waits for it to reach
//! confirmation depth. A transaction is always signed and persisted before it
//! is broadcast; a later attempt inspects that exact hash and only signs a new
//! transaction once the old one provably can never execute.

use alloy::primitives::B256;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::chain::{ChainClient, TxStatus};
use crate::error::DispatchError;
use crate::metrics;
use crate::state::TransferStateMachine;
use crate::types::{FailureKind, Submission, Transfer, TransferStatus};

fn store_failure(context: &str, e: eyre::Report) -> DispatchError {
    DispatchError::Transient(format!("{}: {:#}", context, e))
}

pub struct ActionDispatcher {
    /// Chain the destination action executes on
    target: Arc<dyn ChainClient>,
    /// Chain the originating events are read from
    origin: Arc<dyn ChainClient>,
    machine: TransferStateMachine,
    /// Serializes nonce assignment for the relayer account on `target`
    nonce_lock: Arc<Mutex<()>>,
    confirmation_depth: u64,
    confirmation_timeout: Duration,
    poll_interval: Duration,
}

impl ActionDispatcher {
    pub fn new(
        target: Arc<dyn ChainClient>,
        origin: Arc<dyn ChainClient>,
        machine: TransferStateMachine,
        nonce_lock: Arc<Mutex<()>>,
        confirmation_depth: u64,
        confirmation_timeout: Duration,
        poll_interval: Duration,
    ) -> Self {
        Self {
            target,
            origin,
            machine,
            nonce_lock,
            confirmation_depth,
            confirmation_timeout,
            poll_interval,
        }
    }

    pub fn target(&self) -> &Arc<dyn ChainClient> {
        &self.target
    }

    /// Get the transfer's destination transaction into the chain
    ///
    /// Returns the hash to wait on. An existing submission that is pending or
    /// included is returned as is; one the node has lost is rebroadcast byte
    /// for byte. A reverted submission fails as a rejection, unless the
    /// operator requeued the transfer after that rejection, in which case a
    /// fresh transaction is signed. The transfer must be `Dispatching`.
    pub async fn submit(&self, transfer: &mut Transfer) -> Result<B256, DispatchError> {
        if transfer.status != TransferStatus::Dispatching {
            return Err(DispatchError::Transient(format!(
                "transfer {} is {}, not dispatching",
                transfer.transfer_id, transfer.status
            )));
        }

        if let Some(submission) = transfer.submission.clone() {
            if let Some(tx_hash) = self.resume(transfer, &submission).await? {
                return Ok(tx_hash);
            }
        }

        let source_event = &transfer.event;
        if !self.origin.event_exists(source_event).await? {
            return Err(DispatchError::Reorganization(format!(
                "event {} no longer present on {}",
                source_event.id,
                self.origin.name()
            )));
        }

        self.sign_and_broadcast(transfer).await
    }

    /// Follow up on a recorded submission; `None` means it was discarded
    async fn resume(
        &self,
        transfer: &mut Transfer,
        submission: &Submission,
    ) -> Result<Option<B256>, DispatchError> {
        let chain = self.target.name().to_string();
        match self.target.transaction_status(submission.tx_hash).await? {
            TxStatus::Included {
                success: false,
                block_number,
            } => {
                // a revert already dead-lettered as a rejection is only seen again after a requeue
                if transfer.failure_kind != Some(FailureKind::ChainRejection) {
                    return Err(DispatchError::Rejected(format!(
                        "transaction {} reverted in block {}",
                        submission.tx_hash, block_number
                    )));
                }
                info!(
                    transfer_id = %transfer.transfer_id,
                    tx_hash = %submission.tx_hash,
                    block_number,
                    "Requeued transfer's reverted submission discarded, re-signing"
                );
                self.machine
                    .clear_submission(transfer)
                    .await
                    .map_err(|e| store_failure("clear submission", e))?;
                return Ok(None);
            }
            TxStatus::Pending | TxStatus::Included { .. } => {
                debug!(
                    transfer_id = %transfer.transfer_id,
                    tx_hash = %submission.tx_hash,
                    "Prior submission still live, waiting instead of resubmitting"
                );
                metrics::record_submission(&chain, "awaited");
                return Ok(Some(submission.tx_hash));
            }
            TxStatus::NotFound => {}
        }

        match self.target.broadcast(&submission.raw_tx).await {
            Ok(_) => {
                info!(
                    transfer_id = %transfer.transfer_id,
                    tx_hash = %submission.tx_hash,
                    nonce = submission.nonce,
                    "Rebroadcast lost submission"
                );
                metrics::record_submission(&chain, "rebroadcast");
                Ok(Some(submission.tx_hash))
            }
            Err(DispatchError::NonceConsumed(reason)) => {
                // The nonce is used; if it was not used by this transaction, it never will be
                match self.target.transaction_status(submission.tx_hash).await? {
                    TxStatus::NotFound => {
                        warn!(
                            transfer_id = %transfer.transfer_id,
                            tx_hash = %submission.tx_hash,
                            nonce = submission.nonce,
                            reason = %reason,
                            "Submission nonce consumed elsewhere, discarding and re-signing"
                        );
                        self.machine
                            .clear_submission(transfer)
                            .await
                            .map_err(|e| store_failure("clear submission", e))?;
                        Ok(None)
                    }
                    _ => Ok(Some(submission.tx_hash)),
                }
            }
            Err(e) => {
                metrics::record_submission(&chain, "failed");
                Err(e)
            }
        }
    }

    async fn sign_and_broadcast(&self, transfer: &mut Transfer) -> Result<B256, DispatchError> {
        let chain = self.target.name().to_string();
        let _nonce_guard = self.nonce_lock.lock().await;

        let nonce = self.target.pending_nonce().await?;
        let prepared = self.target.prepare(&transfer.action(), nonce).await?;

        self.machine
            .record_submission(
                transfer,
                Submission {
                    nonce,
                    tx_hash: prepared.tx_hash,
                    raw_tx: prepared.raw.clone(),
                    submitted_at: Utc::now(),
                },
            )
            .await
            .map_err(|e| store_failure("persist submission", e))?;

        match self.target.broadcast(&prepared.raw).await {
            Ok(_) => {
                info!(
                    transfer_id = %transfer.transfer_id,
                    chain = %chain,
                    action = transfer.direction.action_name(),
                    recipient = %transfer.destination,
                    amount = %transfer.amount,
                    nonce,
                    tx_hash = %prepared.tx_hash,
                    "Submitted destination action"
                );
                metrics::record_submission(&chain, "broadcast");
                Ok(prepared.tx_hash)
            }
            Err(e) => {
                // The signed bytes stay recorded; the next attempt rebroadcasts them
                metrics::record_submission(&chain, "failed");
                Err(e)
            }
        }
    }

    /// Wait until `tx_hash` is included and buried under the confirmation depth
    pub async fn await_confirmation(&self, tx_hash: B256) -> Result<u64, DispatchError> {
        let deadline = Instant::now() + self.confirmation_timeout;
        loop {
            match self.target.transaction_status(tx_hash).await {
                Ok(TxStatus::Included {
                    success: false,
                    block_number,
                }) => {
                    return Err(DispatchError::Rejected(format!(
                        "transaction {} reverted in block {}",
                        tx_hash, block_number
                    )));
                }
                Ok(TxStatus::Included {
                    success: true,
                    block_number,
                }) => match self.target.latest_block().await {
                    Ok(latest) if latest >= block_number.saturating_add(self.confirmation_depth) => {
                        return Ok(block_number);
                    }
                    Ok(_) => {}
                    Err(e) => debug!(tx_hash = %tx_hash, error = %e, "Head query failed"),
                },
                Ok(TxStatus::NotFound) => {
                    return Err(DispatchError::Transient(format!(
                        "transaction {} dropped before inclusion",
                        tx_hash
                    )));
                }
                Ok(TxStatus::Pending) => {}
                Err(e) if e.is_transient() => {
                    debug!(tx_hash = %tx_hash, error = %e, "Receipt query failed");
                }
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Err(DispatchError::Transient(format!(
                    "timed out waiting for {} to reach depth {}",
                    tx_hash, self.confirmation_depth
                )));
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Wait for a submitted transfer and record the outcome
    pub async fn finalize(&self, transfer: &mut Transfer, tx_hash: B256) -> eyre::Result<()> {
        match self.await_confirmation(tx_hash).await {
            Ok(_) => self.machine.confirm(transfer, tx_hash).await,
            Err(e) => self.machine.fail(transfer, &e).await,
        }
    }

    /// Submit and finalize in one call
    pub async fn dispatch(&self, transfer: &mut Transfer) -> eyre::Result<()> {
        match self.submit(transfer).await {
            Ok(tx_hash) => self.finalize(transfer, tx_hash).await,
            Err(e) => self.machine.fail(transfer, &e).await,
        }
    }
}
