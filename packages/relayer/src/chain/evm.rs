use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::types::{Filter, Log, TransactionRequest};
use alloy::signers::local::PrivateKeySigner;
use alloy::sol_types::{SolCall, SolEvent};
use alloy::transports::http::{Client, Http};
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use tracing::{debug, warn};

use super::contracts::{DestinationBridge, SourceVault};
use super::{ChainClient, PreparedSubmission, TxStatus};
use crate::config::ChainConfig;
use crate::error::DispatchError;
use crate::hash::keccak256;
use crate::retry::{classify_error, ErrorClass};
use crate::types::{ChainEvent, DestinationAction, Direction, EventId, EventKind};

/// Which contract a chain hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeSide {
    /// Vault: emits `Locked`, accepts `release`
    Source,
    /// Wrapped token bridge: emits `Burned`, accepts `mint`
    Destination,
}

fn rpc_err(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::from_rpc(e.to_string())
}

/// Gas limit headroom over the node's estimate, in percent
const GAS_BUFFER_PERCENT: u64 = 20;

/// EVM chain client backed by an HTTP provider
pub struct EvmChainClient {
    provider: RootProvider<Http<Client>>,
    wallet: EthereumWallet,
    signer_address: Address,
    bridge_address: Address,
    side: BridgeSide,
    chain_id: u64,
    /// Chain on the other side of the bridge
    counterparty_chain_id: u64,
    name: String,
}

impl EvmChainClient {
    pub fn new(
        config: &ChainConfig,
        side: BridgeSide,
        counterparty_chain_id: u64,
        signer: PrivateKeySigner,
    ) -> Result<Self> {
        let url = config.rpc_url.parse().wrap_err("Failed to parse RPC URL")?;
        let provider = ProviderBuilder::new().on_http(url);
        let signer_address = signer.address();

        Ok(Self {
            provider,
            wallet: EthereumWallet::from(signer),
            signer_address,
            bridge_address: config.bridge_address()?,
            side,
            chain_id: config.chain_id,
            counterparty_chain_id,
            name: config.name.clone(),
        })
    }

    /// Check the endpoint serves the configured chain
    pub async fn verify_chain_id(&self) -> Result<()> {
        let reported = self
            .provider
            .get_chain_id()
            .await
            .wrap_err_with(|| format!("{}: failed to query chain id", self.name))?;
        if reported != self.chain_id {
            return Err(eyre::eyre!(
                "{}: endpoint reports chain id {}, configured {}",
                self.name,
                reported,
                self.chain_id
            ));
        }
        Ok(())
    }

    fn event_signature(kind: EventKind) -> B256 {
        match kind {
            EventKind::Locked => SourceVault::Locked::SIGNATURE_HASH,
            EventKind::Burned => DestinationBridge::Burned::SIGNATURE_HASH,
        }
    }

    fn emitted_kind(&self) -> EventKind {
        match self.side {
            BridgeSide::Source => EventKind::Locked,
            BridgeSide::Destination => EventKind::Burned,
        }
    }

    fn parse_log(&self, kind: EventKind, log: &Log) -> Result<ChainEvent> {
        let (user, amount, destination) = match kind {
            EventKind::Locked => {
                let decoded = log
                    .log_decode::<SourceVault::Locked>()
                    .wrap_err("Failed to decode Locked")?;
                let data = decoded.inner.data;
                (data.user, data.amount, data.destination)
            }
            EventKind::Burned => {
                let decoded = log
                    .log_decode::<DestinationBridge::Burned>()
                    .wrap_err("Failed to decode Burned")?;
                let data = decoded.inner.data;
                (data.user, data.amount, data.destination)
            }
        };

        Ok(ChainEvent {
            id: EventId {
                chain_id: self.chain_id,
                block_number: log.block_number.ok_or_else(|| eyre::eyre!("log without block"))?,
                tx_hash: log
                    .transaction_hash
                    .ok_or_else(|| eyre::eyre!("log without transaction hash"))?,
                log_index: log.log_index.ok_or_else(|| eyre::eyre!("log without index"))?,
            },
            kind,
            user,
            amount,
            destination,
            source_chain: self.chain_id,
            dest_chain: self.counterparty_chain_id,
        })
    }

    fn calldata(&self, action: &DestinationAction) -> Result<Bytes, DispatchError> {
        let encoded = match (self.side, action.direction) {
            (BridgeSide::Destination, Direction::LockToMint) => DestinationBridge::mintCall {
                user: action.recipient,
                amount: action.amount,
            }
            .abi_encode(),
            (BridgeSide::Source, Direction::BurnToRelease) => SourceVault::releaseCall {
                user: action.recipient,
                amount: action.amount,
            }
            .abi_encode(),
            (side, direction) => {
                return Err(DispatchError::Rejected(format!(
                    "{} cannot settle {} on the {:?} side",
                    self.name, direction, side
                )))
            }
        };
        Ok(Bytes::from(encoded))
    }
}

#[async_trait]
impl ChainClient for EvmChainClient {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn relayer_address(&self) -> Address {
        self.signer_address
    }

    async fn latest_block(&self) -> Result<u64, DispatchError> {
        self.provider.get_block_number().await.map_err(rpc_err)
    }

    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainEvent>, DispatchError> {
        if kind != self.emitted_kind() {
            return Ok(Vec::new());
        }

        let filter = Filter::new()
            .address(self.bridge_address)
            .event_signature(Self::event_signature(kind))
            .from_block(from)
            .to_block(to);

        let logs = self.provider.get_logs(&filter).await.map_err(rpc_err)?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs.iter().filter(|l| !l.removed) {
            match self.parse_log(kind, log) {
                Ok(event) => events.push(event),
                Err(e) => warn!(
                    chain = %self.name,
                    tx_hash = ?log.transaction_hash,
                    error = %e,
                    "Skipping undecodable bridge log"
                ),
            }
        }
        events.sort_by_key(|e| (e.id.block_number, e.id.log_index));
        Ok(events)
    }

    async fn event_exists(&self, event: &ChainEvent) -> Result<bool, DispatchError> {
        let block = event.id.block_number;
        let found = self.fetch_events(event.kind, block, block).await?;
        Ok(found.iter().any(|e| e == event))
    }

    async fn authorized_relayer(&self) -> Result<Address, DispatchError> {
        let relayer = match self.side {
            BridgeSide::Source => {
                SourceVault::new(self.bridge_address, &self.provider)
                    .relayer()
                    .call()
                    .await
                    .map_err(rpc_err)?
                    ._0
            }
            BridgeSide::Destination => {
                DestinationBridge::new(self.bridge_address, &self.provider)
                    .relayer()
                    .call()
                    .await
                    .map_err(rpc_err)?
                    ._0
            }
        };
        Ok(relayer)
    }

    async fn pending_nonce(&self) -> Result<u64, DispatchError> {
        self.provider
            .get_transaction_count(self.signer_address)
            .pending()
            .await
            .map_err(rpc_err)
    }

    async fn prepare(
        &self,
        action: &DestinationAction,
        nonce: u64,
    ) -> Result<PreparedSubmission, DispatchError> {
        let request = TransactionRequest::default()
            .with_from(self.signer_address)
            .with_to(self.bridge_address)
            .with_input(self.calldata(action)?)
            .with_chain_id(self.chain_id)
            .with_nonce(nonce);

        // Reverts (e.g. unauthorized caller) and funding problems surface here
        let gas = self.provider.estimate_gas(&request).await.map_err(rpc_err)?;
        let fees = self
            .provider
            .estimate_eip1559_fees(None)
            .await
            .map_err(rpc_err)?;

        let envelope = request
            .with_gas_limit(gas + gas * GAS_BUFFER_PERCENT / 100)
            .with_max_fee_per_gas(fees.max_fee_per_gas)
            .with_max_priority_fee_per_gas(fees.max_priority_fee_per_gas)
            .build(&self.wallet)
            .await
            .map_err(|e| DispatchError::Transient(format!("failed to sign transaction: {}", e)))?;

        let tx_hash = *envelope.tx_hash();
        debug!(
            chain = %self.name,
            transfer_id = %action.transfer_id,
            nonce,
            tx_hash = %tx_hash,
            "Signed {}",
            action.direction.action_name()
        );

        Ok(PreparedSubmission {
            tx_hash,
            raw: envelope.encoded_2718(),
        })
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<B256, DispatchError> {
        match self.provider.send_raw_transaction(raw).await {
            Ok(pending) => Ok(*pending.tx_hash()),
            Err(e) => {
                let message = e.to_string();
                // Identical bytes already in the node's mempool
                if message.to_lowercase().contains("already known") {
                    return Ok(B256::from(keccak256(raw)));
                }
                match classify_error(&message) {
                    ErrorClass::NonceConsumed => Err(DispatchError::NonceConsumed(message)),
                    _ => Err(DispatchError::from_rpc(message)),
                }
            }
        }
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, DispatchError> {
        if let Some(receipt) = self
            .provider
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(rpc_err)?
        {
            return Ok(match receipt.block_number {
                Some(block_number) => TxStatus::Included {
                    block_number,
                    success: receipt.status(),
                },
                None => TxStatus::Pending,
            });
        }

        let known = self
            .provider
            .get_transaction_by_hash(tx_hash)
            .await
            .map_err(rpc_err)?;
        Ok(if known.is_some() {
            TxStatus::Pending
        } else {
            TxStatus::NotFound
        })
    }
}
