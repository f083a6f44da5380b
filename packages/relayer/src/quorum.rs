//! Quorum-gated dispatch
//!
//! With a threshold configured, a transfer must carry `threshold` valid
//! attestations from distinct configured validators before it may be
//! dispatched. Each attestation is a recoverable ECDSA signature over
//! [`attestation_digest`].

use alloy::primitives::{Address, PrimitiveSignature, B256};
use alloy::signers::local::PrivateKeySigner;
use alloy::signers::SignerSync;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chain::ChainClient;
use crate::db::RelayStore;
use crate::error::DispatchError;
use crate::hash::attestation_digest;
use crate::types::{Attestation, Transfer};

/// A validator able to vouch for a transfer
#[async_trait]
pub trait Attestor: Send + Sync {
    fn validator(&self) -> Address;

    /// 65-byte signature over the transfer's attestation digest
    async fn attest(&self, transfer: &Transfer) -> Result<Vec<u8>, DispatchError>;
}

/// Validator whose key is held by this process
///
/// Signs only after independently confirming the originating event on its
/// own view of the chain.
pub struct LocalAttestor {
    signer: PrivateKeySigner,
    chains: Vec<Arc<dyn ChainClient>>,
}

impl LocalAttestor {
    pub fn new(signer: PrivateKeySigner, chains: Vec<Arc<dyn ChainClient>>) -> Self {
        Self { signer, chains }
    }
}

#[async_trait]
impl Attestor for LocalAttestor {
    fn validator(&self) -> Address {
        self.signer.address()
    }

    async fn attest(&self, transfer: &Transfer) -> Result<Vec<u8>, DispatchError> {
        let origin = transfer.event.id.chain_id;
        let chain = self
            .chains
            .iter()
            .find(|c| c.chain_id() == origin)
            .ok_or_else(|| DispatchError::Rejected(format!("no client for chain {}", origin)))?;

        if !chain.event_exists(&transfer.event).await? {
            return Err(DispatchError::Reorganization(format!(
                "event {} not found by validator {}",
                transfer.event.id,
                self.validator()
            )));
        }

        let digest = B256::from(attestation_digest(transfer));
        let signature = self
            .signer
            .sign_hash_sync(&digest)
            .map_err(|e| DispatchError::Transient(format!("signing failed: {}", e)))?;
        Ok(signature.as_bytes().to_vec())
    }
}

/// k-of-n acceptance rule
#[derive(Debug, Clone)]
pub struct QuorumPolicy {
    pub threshold: usize,
    pub validators: Vec<Address>,
}

impl QuorumPolicy {
    pub fn is_validator(&self, address: &Address) -> bool {
        self.validators.contains(address)
    }

    /// Signature recovers to `attestation.validator` over the transfer digest
    pub fn verify(&self, transfer: &Transfer, attestation: &Attestation) -> bool {
        if attestation.transfer_id != transfer.transfer_id || !self.is_validator(&attestation.validator) {
            return false;
        }
        let Ok(signature) = PrimitiveSignature::try_from(attestation.signature.as_slice()) else {
            return false;
        };
        let digest = B256::from(attestation_digest(transfer));
        signature
            .recover_address_from_prehash(&digest)
            .map(|signer| signer == attestation.validator)
            .unwrap_or(false)
    }
}

pub struct SignatureCollector {
    store: Arc<dyn RelayStore>,
    attestors: Vec<Arc<dyn Attestor>>,
    policy: QuorumPolicy,
}

impl SignatureCollector {
    pub fn new(store: Arc<dyn RelayStore>, attestors: Vec<Arc<dyn Attestor>>, policy: QuorumPolicy) -> Self {
        Self {
            store,
            attestors,
            policy,
        }
    }

    pub fn threshold(&self) -> usize {
        self.policy.threshold
    }

    /// Distinct validators with a valid stored attestation for `transfer`
    async fn attested_by(&self, transfer: &Transfer) -> Result<HashSet<Address>, DispatchError> {
        let stored = self
            .store
            .attestations(transfer.transfer_id)
            .await
            .map_err(|e| DispatchError::Transient(format!("attestation store: {:#}", e)))?;
        Ok(stored
            .iter()
            .filter(|a| self.policy.verify(transfer, a))
            .map(|a| a.validator)
            .collect())
    }

    /// Request missing attestations and return the number of valid ones
    ///
    /// A validator that no longer finds the originating event aborts the
    /// collection with [`DispatchError::Reorganization`].
    pub async fn collect(&self, transfer: &Transfer) -> Result<usize, DispatchError> {
        let mut attested = self.attested_by(transfer).await?;

        for attestor in &self.attestors {
            if attested.len() >= self.policy.threshold {
                break;
            }
            let validator = attestor.validator();
            if attested.contains(&validator) {
                continue;
            }
            if !self.policy.is_validator(&validator) {
                debug!(validator = %validator, "Skipping attestor outside the validator set");
                continue;
            }

            let signature = match attestor.attest(transfer).await {
                Ok(signature) => signature,
                Err(e @ DispatchError::Reorganization(_)) => {
                    warn!(
                        transfer_id = %transfer.transfer_id,
                        validator = %validator,
                        error = %e,
                        "Validator cannot find the originating event"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        transfer_id = %transfer.transfer_id,
                        validator = %validator,
                        error = %e,
                        "Validator declined to attest"
                    );
                    continue;
                }
            };
            let attestation = Attestation {
                transfer_id: transfer.transfer_id,
                validator,
                signature,
            };
            if !self.policy.verify(transfer, &attestation) {
                warn!(
                    transfer_id = %transfer.transfer_id,
                    validator = %validator,
                    "Discarding attestation with invalid signature"
                );
                continue;
            }
            self.store
                .record_attestation(&attestation)
                .await
                .map_err(|e| DispatchError::Transient(format!("attestation store: {:#}", e)))?;
            attested.insert(validator);
        }

        if attested.len() >= self.policy.threshold {
            info!(
                transfer_id = %transfer.transfer_id,
                attestations = attested.len(),
                threshold = self.policy.threshold,
                "Quorum reached"
            );
        }
        Ok(attested.len())
    }
}
