//! Typed errors at component seams

use thiserror::Error;

use crate::retry::{classify_error, ErrorClass};
use crate::types::{FailureKind, TransferId, TransferStatus};

/// Failure of a chain read or write, as surfaced to the orchestrator
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Endpoint timeout, dropped connection, nonce contention
    #[error("transient: {0}")]
    Transient(String),

    /// Contract-level revert, e.g. caller not authorized
    #[error("rejected: {0}")]
    Rejected(String),

    /// Relayer cannot pay for the submission
    #[error("insufficient funds: {0}")]
    InsufficientFunds(String),

    /// The nonce of a signed transaction was used by another transaction
    #[error("nonce consumed: {0}")]
    NonceConsumed(String),

    /// The originating event is no longer on the canonical chain
    #[error("reorganization: {0}")]
    Reorganization(String),
}

impl DispatchError {
    /// Build a typed error from a raw RPC error message
    pub fn from_rpc(message: impl Into<String>) -> Self {
        let message = message.into();
        match classify_error(&message) {
            ErrorClass::Rejected => DispatchError::Rejected(message),
            ErrorClass::InsufficientFunds => DispatchError::InsufficientFunds(message),
            ErrorClass::NonceConsumed => DispatchError::NonceConsumed(message),
            ErrorClass::Transient | ErrorClass::Unknown => DispatchError::Transient(message),
        }
    }

    pub fn failure_kind(&self) -> FailureKind {
        match self {
            DispatchError::Transient(_) | DispatchError::NonceConsumed(_) => {
                FailureKind::TransientInfra
            }
            DispatchError::Rejected(_) => FailureKind::ChainRejection,
            DispatchError::InsufficientFunds(_) => FailureKind::ResourceExhaustion,
            DispatchError::Reorganization(_) => FailureKind::Reorganization,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.failure_kind() == FailureKind::TransientInfra
    }
}

/// Rejected status change on a transfer
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal transition {from} -> {to}")]
    Illegal {
        from: TransferStatus,
        to: TransferStatus,
    },

    /// Another writer changed the transfer first
    #[error("transfer {id} is no longer {expected}")]
    Conflict {
        expected: TransferStatus,
        id: TransferId,
    },

    #[error("transfer {0} not found")]
    NotFound(TransferId),
}
