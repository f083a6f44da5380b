//! Chain access
//!
//! [`ChainClient`] is the only place chain RPC is touched. The EVM
//! implementation lives in [`evm`]; tests use `testing::SimulatedChain`.

use alloy::primitives::{Address, B256};
use async_trait::async_trait;

use crate::error::DispatchError;
use crate::types::{ChainEvent, DestinationAction, EventKind};

pub mod contracts;
pub mod evm;

pub use evm::EvmChainClient;

/// Inclusion state of a transaction hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Known to the node but not yet in a block
    Pending,
    Included { block_number: u64, success: bool },
    /// Neither mined nor in the node's mempool
    NotFound,
}

/// A signed transaction ready for broadcast
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedSubmission {
    pub tx_hash: B256,
    pub raw: Vec<u8>,
}

#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_id(&self) -> u64;

    fn name(&self) -> &str;

    /// Address the local signer submits from
    fn relayer_address(&self) -> Address;

    async fn latest_block(&self) -> Result<u64, DispatchError>;

    /// Decoded bridge events of `kind` in `[from, to]`, in block then log-index order
    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainEvent>, DispatchError>;

    /// Whether `event` is still present at its recorded block and position
    async fn event_exists(&self, event: &ChainEvent) -> Result<bool, DispatchError>;

    /// Relayer identity the bridge contract currently accepts
    async fn authorized_relayer(&self) -> Result<Address, DispatchError>;

    /// Next nonce for the relayer account, counting pending transactions
    async fn pending_nonce(&self) -> Result<u64, DispatchError>;

    /// Sign the call settling `action` with `nonce`, without broadcasting
    async fn prepare(
        &self,
        action: &DestinationAction,
        nonce: u64,
    ) -> Result<PreparedSubmission, DispatchError>;

    async fn broadcast(&self, raw: &[u8]) -> Result<B256, DispatchError>;

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, DispatchError>;
}
