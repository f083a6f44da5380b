//! Transfer state machine
//!
//! Owns every status change of a transfer. Each change is checked against the
//! legal transition table and persisted as a compare-and-set on the prior
//! status, so a stale writer can never overwrite a newer state.

use alloy::primitives::B256;
use chrono::Utc;
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::RelayStore;
use crate::error::{DispatchError, TransitionError};
use crate::ledger::IdempotencyLedger;
use crate::metrics;
use crate::retry::RetryConfig;
use crate::types::{ChainEvent, Dedup, FailureKind, Submission, Transfer, TransferId, TransferStatus};

/// Result of ingesting one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Observation {
    /// First sighting; the transfer was created in `Observed`
    Created(Transfer),
    /// Identity already recorded
    Duplicate,
    /// Same transaction and log index seen at a different block
    Relocated { existing: TransferId },
}

#[derive(Clone)]
pub struct TransferStateMachine {
    store: Arc<dyn RelayStore>,
    ledger: IdempotencyLedger,
    retry: RetryConfig,
}

impl TransferStateMachine {
    pub fn new(store: Arc<dyn RelayStore>, retry: RetryConfig) -> Self {
        Self {
            ledger: IdempotencyLedger::new(store.clone()),
            store,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn RelayStore> {
        &self.store
    }

    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Ingest an event: create its transfer exactly once
    pub async fn observe(&self, event: ChainEvent) -> Result<Observation> {
        let direction = event.kind.direction();
        let id = event.id;

        if let Some(existing) = self
            .store
            .find_transfer_by_origin(id.chain_id, id.tx_hash, id.log_index)
            .await?
        {
            if existing.event.id == id {
                metrics::record_duplicate(direction.as_str());
                return Ok(Observation::Duplicate);
            }
            return self.handle_relocation(existing, &event).await;
        }

        let transfer = Transfer::observed(event);
        match self.ledger.record_transfer(&transfer).await? {
            Dedup::Fresh => {
                info!(
                    transfer_id = %transfer.transfer_id,
                    direction = %direction,
                    chain_id = id.chain_id,
                    block_number = id.block_number,
                    tx_hash = %id.tx_hash,
                    log_index = id.log_index,
                    amount = %transfer.amount,
                    "Transfer observed"
                );
                metrics::record_observed(direction.as_str());
                Ok(Observation::Created(transfer))
            }
            Dedup::AlreadySeen => {
                metrics::record_duplicate(direction.as_str());
                Ok(Observation::Duplicate)
            }
        }
    }

    async fn handle_relocation(
        &self,
        mut existing: Transfer,
        event: &ChainEvent,
    ) -> Result<Observation> {
        if self.ledger.record_if_new(&event.id).await? == Dedup::AlreadySeen {
            return Ok(Observation::Duplicate);
        }

        error!(
            transfer_id = %existing.transfer_id,
            status = %existing.status,
            recorded_block = existing.event.id.block_number,
            observed_block = event.id.block_number,
            tx_hash = %event.id.tx_hash,
            "Originating event relocated by a reorganization; manual reconciliation required"
        );

        if existing.status.can_transition_to(TransferStatus::Flagged) {
            let reason = format!(
                "originating event moved from block {} to block {}",
                existing.event.id.block_number, event.id.block_number
            );
            self.flag(&mut existing, &reason).await?;
        }

        Ok(Observation::Relocated {
            existing: existing.transfer_id,
        })
    }

    /// Apply a status change, persisting it only if nobody else moved the transfer first
    pub async fn transition<F>(&self, transfer: &mut Transfer, next: TransferStatus, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut Transfer),
    {
        let from = transfer.status;
        if from != next && !from.can_transition_to(next) {
            return Err(TransitionError::Illegal { from, to: next }.into());
        }

        let mut updated = transfer.clone();
        mutate(&mut updated);
        updated.status = next;
        updated.updated_at = Utc::now();

        let applied = self
            .store
            .update_transfer(from, &updated)
            .await
            .wrap_err_with(|| format!("Failed to persist {} -> {} for {}", from, next, transfer.transfer_id))?;
        if !applied {
            return Err(TransitionError::Conflict {
                expected: from,
                id: transfer.transfer_id,
            }
            .into());
        }

        *transfer = updated;
        Ok(())
    }

    pub async fn begin_collecting(&self, transfer: &mut Transfer) -> Result<()> {
        self.transition(transfer, TransferStatus::CollectingSignatures, |_| {})
            .await
    }

    /// Accept a transfer for submission; any recorded submission is kept
    pub async fn begin_dispatch(&self, transfer: &mut Transfer) -> Result<()> {
        self.transition(transfer, TransferStatus::Dispatching, |t| {
            t.next_attempt_at = None;
        })
        .await
    }

    /// Persist a signed transaction before it is broadcast
    pub async fn record_submission(&self, transfer: &mut Transfer, submission: Submission) -> Result<()> {
        self.transition(transfer, TransferStatus::Dispatching, |t| {
            t.submission = Some(submission);
        })
        .await
    }

    /// Drop a submission whose nonce was consumed by another transaction
    pub async fn clear_submission(&self, transfer: &mut Transfer) -> Result<()> {
        self.transition(transfer, TransferStatus::Dispatching, |t| {
            t.submission = None;
        })
        .await
    }

    pub async fn confirm(&self, transfer: &mut Transfer, tx_hash: B256) -> Result<()> {
        self.transition(transfer, TransferStatus::Confirmed, |t| {
            t.resulting_tx_hash = Some(tx_hash);
            t.failure_kind = None;
            t.next_attempt_at = None;
        })
        .await?;

        info!(
            transfer_id = %transfer.transfer_id,
            direction = %transfer.direction,
            tx_hash = %tx_hash,
            retries = transfer.retry_count,
            "Transfer confirmed"
        );
        metrics::record_confirmed(transfer.direction.as_str());
        Ok(())
    }

    /// Record a failed attempt and pick the next status from the failure kind
    ///
    /// Transient failures back off and retry until `max_retries`; rejections and
    /// funding failures dead-letter at once; reorganizations are flagged.
    pub async fn fail(&self, transfer: &mut Transfer, cause: &DispatchError) -> Result<()> {
        let kind = cause.failure_kind();
        let attempts = transfer.retry_count.saturating_add(1);

        let next = match kind {
            FailureKind::Reorganization => TransferStatus::Flagged,
            FailureKind::ChainRejection | FailureKind::ResourceExhaustion => {
                TransferStatus::DeadLettered
            }
            FailureKind::TransientInfra if self.retry.should_retry(attempts) => {
                TransferStatus::Failed
            }
            FailureKind::TransientInfra => TransferStatus::DeadLettered,
        };
        let next_attempt_at = (next == TransferStatus::Failed)
            .then(|| self.retry.next_retry_after(attempts - 1));
        let message = cause.to_string();

        self.transition(transfer, next, |t| {
            t.retry_count = attempts;
            t.last_error = Some(message);
            t.failure_kind = Some(kind);
            t.next_attempt_at = next_attempt_at;
        })
        .await?;

        match next {
            TransferStatus::Failed => warn!(
                transfer_id = %transfer.transfer_id,
                attempt = attempts,
                max = self.retry.max_retries,
                retry_at = ?next_attempt_at,
                error = %cause,
                "Transfer attempt failed, will retry"
            ),
            TransferStatus::DeadLettered => {
                error!(
                    transfer_id = %transfer.transfer_id,
                    event = %transfer.event.id,
                    kind = %kind,
                    attempts,
                    error = %cause,
                    "Transfer dead-lettered; operator action required"
                );
                metrics::record_dead_lettered(transfer.direction.as_str(), kind.as_str());
            }
            _ => {
                error!(
                    transfer_id = %transfer.transfer_id,
                    event = %transfer.event.id,
                    error = %cause,
                    "Transfer flagged for manual reconciliation"
                );
                metrics::record_flagged(transfer.direction.as_str());
            }
        }
        Ok(())
    }

    /// Move a transfer to `Flagged` (suspected reorganization)
    pub async fn flag(&self, transfer: &mut Transfer, reason: &str) -> Result<()> {
        let reason = reason.to_string();
        self.transition(transfer, TransferStatus::Flagged, |t| {
            t.last_error = Some(reason);
            t.failure_kind = Some(FailureKind::Reorganization);
            t.next_attempt_at = None;
        })
        .await?;
        metrics::record_flagged(transfer.direction.as_str());
        Ok(())
    }

    /// Operator re-drive of a dead-lettered transfer
    ///
    /// Resets the retry counter and keeps any recorded submission, so the
    /// next attempt checks that transaction before signing a new one.
    pub async fn requeue(&self, id: TransferId) -> Result<Transfer> {
        let mut transfer = self
            .store
            .get_transfer(id)
            .await?
            .ok_or(TransitionError::NotFound(id))?;
        if transfer.status != TransferStatus::DeadLettered {
            return Err(TransitionError::Illegal {
                from: transfer.status,
                to: TransferStatus::Failed,
            }
            .into());
        }

        self.transition(&mut transfer, TransferStatus::Failed, |t| {
            t.retry_count = 0;
            t.next_attempt_at = None;
        })
        .await?;

        info!(transfer_id = %id, "Dead-lettered transfer requeued");
        Ok(transfer)
    }
}
