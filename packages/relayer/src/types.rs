//! Domain types shared by every stage of the relay pipeline
//!
//! A `ChainEvent` is what a reader observes; a `Transfer` is the durable unit of
//! cross-chain work derived from exactly one event.

use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::hash;

/// Kind of bridge event emitted on a ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    /// `Locked(user, amount, destination)` on the source vault
    Locked,
    /// `Burned(user, amount, destination)` on the destination bridge
    Burned,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Locked => "locked",
            EventKind::Burned => "burned",
        }
    }

    /// The transfer direction this event triggers
    pub fn direction(&self) -> Direction {
        match self {
            EventKind::Locked => Direction::LockToMint,
            EventKind::Burned => Direction::BurnToRelease,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Direction of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Source lock observed, mint on destination
    LockToMint,
    /// Destination burn observed, release on source
    BurnToRelease,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::LockToMint, Direction::BurnToRelease];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::LockToMint => "lock_to_mint",
            Direction::BurnToRelease => "burn_to_release",
        }
    }

    /// Event kind that triggers transfers in this direction
    pub fn trigger(&self) -> EventKind {
        match self {
            Direction::LockToMint => EventKind::Locked,
            Direction::BurnToRelease => EventKind::Burned,
        }
    }

    /// Name of the destination entry point
    pub fn action_name(&self) -> &'static str {
        match self {
            Direction::LockToMint => "mint",
            Direction::BurnToRelease => "release",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Direction {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lock_to_mint" => Ok(Direction::LockToMint),
            "burn_to_release" => Ok(Direction::BurnToRelease),
            other => Err(eyre::eyre!("unknown direction: {}", other)),
        }
    }
}

/// Canonical identity of a log entry: (chain, block, transaction, log index)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId {
    pub chain_id: u64,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
}

impl EventId {
    /// Deterministic transfer id derived from this identity
    pub fn transfer_id(&self) -> TransferId {
        TransferId(B256::from(hash::compute_transfer_id(self)))
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}:{}",
            self.chain_id, self.block_number, self.tx_hash, self.log_index
        )
    }
}

/// A decoded, immutable bridge event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainEvent {
    pub id: EventId,
    pub kind: EventKind,
    pub user: Address,
    pub amount: U256,
    pub destination: Address,
    pub source_chain: u64,
    pub dest_chain: u64,
}

impl ChainEvent {
    /// Structural checks applied before an event may become a transfer
    pub fn validate(&self) -> eyre::Result<()> {
        if self.amount.is_zero() {
            return Err(eyre::eyre!("event {} has zero amount", self.id));
        }
        if self.id.chain_id != self.source_chain {
            return Err(eyre::eyre!(
                "event {} emitted on chain {} but claims source chain {}",
                self.id,
                self.id.chain_id,
                self.source_chain
            ));
        }
        if self.destination == Address::ZERO {
            return Err(eyre::eyre!("event {} has zero destination", self.id));
        }
        Ok(())
    }
}

/// Deterministic id of a transfer (keccak of the originating event identity)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransferId(pub B256);

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        B256::from_str(s)
            .map(TransferId)
            .map_err(|e| eyre::eyre!("invalid transfer id {}: {}", s, e))
    }
}

/// Lifecycle status of a transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Observed,
    CollectingSignatures,
    Dispatching,
    Failed,
    Confirmed,
    DeadLettered,
    /// Needs manual reconciliation (reorganization suspected)
    Flagged,
}

impl TransferStatus {
    pub const ALL: [TransferStatus; 7] = [
        TransferStatus::Observed,
        TransferStatus::CollectingSignatures,
        TransferStatus::Dispatching,
        TransferStatus::Failed,
        TransferStatus::Confirmed,
        TransferStatus::DeadLettered,
        TransferStatus::Flagged,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Observed => "observed",
            TransferStatus::CollectingSignatures => "collecting_signatures",
            TransferStatus::Dispatching => "dispatching",
            TransferStatus::Failed => "failed",
            TransferStatus::Confirmed => "confirmed",
            TransferStatus::DeadLettered => "dead_lettered",
            TransferStatus::Flagged => "flagged",
        }
    }

    /// No automatic transition leaves a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferStatus::Confirmed | TransferStatus::DeadLettered | TransferStatus::Flagged
        )
    }

    pub fn can_transition_to(&self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Observed, CollectingSignatures)
                | (Observed, Dispatching)
                | (Observed, Flagged)
                | (CollectingSignatures, Dispatching)
                | (CollectingSignatures, Failed)
                | (CollectingSignatures, DeadLettered)
                | (CollectingSignatures, Flagged)
                | (Dispatching, Confirmed)
                | (Dispatching, Failed)
                | (Dispatching, DeadLettered)
                | (Dispatching, Flagged)
                | (Failed, Dispatching)
                | (Failed, CollectingSignatures)
                | (Failed, DeadLettered)
                | (Failed, Flagged)
                | (DeadLettered, Failed)
        )
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TransferStatus {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransferStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| eyre::eyre!("unknown transfer status: {}", s))
    }
}

/// Failure taxonomy persisted with a failed, dead-lettered or flagged transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientInfra,
    ChainRejection,
    Reorganization,
    ResourceExhaustion,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::TransientInfra => "transient_infra",
            FailureKind::ChainRejection => "chain_rejection",
            FailureKind::Reorganization => "reorganization",
            FailureKind::ResourceExhaustion => "resource_exhaustion",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FailureKind {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient_infra" => Ok(FailureKind::TransientInfra),
            "chain_rejection" => Ok(FailureKind::ChainRejection),
            "reorganization" => Ok(FailureKind::Reorganization),
            "resource_exhaustion" => Ok(FailureKind::ResourceExhaustion),
            other => Err(eyre::eyre!("unknown failure kind: {}", other)),
        }
    }
}

/// A signed destination transaction recorded before broadcast
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Submission {
    pub nonce: u64,
    pub tx_hash: B256,
    #[serde(skip)]
    pub raw_tx: Vec<u8>,
    pub submitted_at: DateTime<Utc>,
}

/// The destination call a transfer resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationAction {
    pub transfer_id: TransferId,
    pub direction: Direction,
    pub recipient: Address,
    pub amount: U256,
}

/// The unit of cross-chain work
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Transfer {
    pub transfer_id: TransferId,
    pub direction: Direction,
    pub amount: U256,
    pub user: Address,
    pub destination: Address,
    pub status: TransferStatus,
    pub event: ChainEvent,
    pub resulting_tx_hash: Option<B256>,
    pub submission: Option<Submission>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transfer {
    /// Create the `Observed` record for a freshly recorded event
    pub fn observed(event: ChainEvent) -> Self {
        let now = Utc::now();
        Self {
            transfer_id: event.id.transfer_id(),
            direction: event.kind.direction(),
            amount: event.amount,
            user: event.user,
            destination: event.destination,
            status: TransferStatus::Observed,
            event,
            resulting_tx_hash: None,
            submission: None,
            retry_count: 0,
            last_error: None,
            failure_kind: None,
            next_attempt_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// The destination call that settles this transfer
    pub fn action(&self) -> DestinationAction {
        DestinationAction {
            transfer_id: self.transfer_id,
            direction: self.direction,
            recipient: self.destination,
            amount: self.amount,
        }
    }

    /// Whether the retry backoff (if any) has elapsed
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_attempt_at.map_or(true, |at| now >= at)
    }
}

/// Outcome of an idempotency check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dedup {
    Fresh,
    AlreadySeen,
}

/// A validator's signature over a transfer digest
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attestation {
    pub transfer_id: TransferId,
    pub validator: Address,
    #[serde(serialize_with = "serialize_hex")]
    pub signature: Vec<u8>,
}

fn serialize_hex<S: serde::Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
}

/// Transfer count for one (direction, status) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusCount {
    pub direction: Direction,
    pub status: TransferStatus,
    pub count: i64,
}

#[cfg(test)]
pub(crate) fn sample_event(block_number: u64, log_index: u64, amount: u64) -> ChainEvent {
    ChainEvent {
        id: EventId {
            chain_id: 1,
            block_number,
            tx_hash: B256::repeat_byte(block_number as u8),
            log_index,
        },
        kind: EventKind::Locked,
        user: Address::repeat_byte(0xaa),
        amount: U256::from(amount),
        destination: Address::repeat_byte(0xaa),
        source_chain: 1,
        dest_chain: 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in TransferStatus::ALL {
            assert_eq!(status.as_str().parse::<TransferStatus>().unwrap(), status);
        }
        assert!("pending".parse::<TransferStatus>().is_err());
    }

    #[test]
    fn test_terminal_statuses_have_no_automatic_exit() {
        for from in TransferStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            for to in TransferStatus::ALL {
                if from == TransferStatus::DeadLettered && to == TransferStatus::Failed {
                    // operator requeue
                    continue;
                }
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_retry_loop_transitions() {
        use TransferStatus::*;
        assert!(Observed.can_transition_to(Dispatching));
        assert!(Dispatching.can_transition_to(Failed));
        assert!(Failed.can_transition_to(Dispatching));
        assert!(Failed.can_transition_to(DeadLettered));
        assert!(Dispatching.can_transition_to(Confirmed));
        assert!(!Observed.can_transition_to(Confirmed));
        assert!(!Failed.can_transition_to(Confirmed));
    }

    #[test]
    fn test_transfer_id_is_deterministic_per_event() {
        let a = sample_event(10, 0, 100);
        let b = sample_event(10, 1, 100);
        assert_eq!(a.id.transfer_id(), a.id.transfer_id());
        assert_ne!(a.id.transfer_id(), b.id.transfer_id());
    }

    #[test]
    fn test_event_validation() {
        let event = sample_event(1, 0, 100);
        assert!(event.validate().is_ok());

        let mut zero = event.clone();
        zero.amount = U256::ZERO;
        assert!(zero.validate().is_err());

        let mut wrong_chain = event;
        wrong_chain.source_chain = 9;
        assert!(wrong_chain.validate().is_err());
    }

    #[test]
    fn test_observed_transfer_conserves_event_fields() {
        let event = sample_event(7, 3, 250);
        let transfer = Transfer::observed(event.clone());
        assert_eq!(transfer.status, TransferStatus::Observed);
        assert_eq!(transfer.amount, event.amount);
        assert_eq!(transfer.direction, Direction::LockToMint);
        assert_eq!(transfer.action().recipient, event.destination);
        assert_eq!(transfer.transfer_id, event.id.transfer_id());
        assert!(transfer.is_due(Utc::now()));
    }
}
