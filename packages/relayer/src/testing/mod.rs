//! Simulated bridge ledgers
//!
//! [`SimulatedChain`] implements [`ChainClient`] over an in-memory chain with a
//! vault or wrapped-token bridge, an append-only event log, a mempool, relayer
//! authorization and fault injection. Blocks are produced explicitly with
//! [`SimulatedChain::mine`], or on every head/receipt query with auto-mining.

use alloy::primitives::{Address, B256, U256};
use async_trait::async_trait;
use eyre::{eyre, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::chain::evm::BridgeSide;
use crate::chain::{ChainClient, PreparedSubmission, TxStatus};
use crate::error::DispatchError;
use crate::hash::keccak256;
use crate::types::{ChainEvent, DestinationAction, Direction, EventId, EventKind};

/// Contract owner allowed to rotate the relayer
pub const OWNER: Address = Address::repeat_byte(0x01);
/// Relayer identity the contracts authorize by default
pub const RELAYER: Address = Address::repeat_byte(0x42);
/// An end user
pub const USER: Address = Address::repeat_byte(0xaa);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
enum SimCall {
    Mint { user: Address, amount: U256 },
    Release { user: Address, amount: U256 },
}

/// Wire form of a simulated signed transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SimTx {
    chain_id: u64,
    from: Address,
    nonce: u64,
    call: SimCall,
}

struct QueuedLog {
    kind: EventKind,
    user: Address,
    amount: U256,
    destination: Address,
}

struct SimState {
    head: u64,
    logs: Vec<ChainEvent>,
    queued_logs: Vec<QueuedLog>,
    mempool: Vec<(B256, SimTx)>,
    receipts: HashMap<B256, (u64, bool)>,
    nonces: HashMap<Address, u64>,
    relayer: Address,
    signer: Address,
    balances: HashMap<Address, U256>,
    vault_locked: U256,
    total_supply: U256,
    relayer_funded: bool,
    unreachable: bool,
    auto_mine: bool,
    failing_broadcasts: u32,
    broadcasts: usize,
    log_seq: u64,
}

pub struct SimulatedChain {
    chain_id: u64,
    counterparty_chain_id: u64,
    side: BridgeSide,
    name: String,
    signer: Address,
    state: Mutex<SimState>,
}

impl SimulatedChain {
    fn new(chain_id: u64, counterparty_chain_id: u64, side: BridgeSide, name: &str) -> Self {
        Self {
            chain_id,
            counterparty_chain_id,
            side,
            name: name.to_string(),
            signer: RELAYER,
            state: Mutex::new(SimState {
                head: 0,
                logs: Vec::new(),
                queued_logs: Vec::new(),
                mempool: Vec::new(),
                receipts: HashMap::new(),
                nonces: HashMap::new(),
                relayer: RELAYER,
                signer: RELAYER,
                balances: HashMap::new(),
                vault_locked: U256::ZERO,
                total_supply: U256::ZERO,
                relayer_funded: true,
                unreachable: false,
                auto_mine: false,
                failing_broadcasts: 0,
                broadcasts: 0,
                log_seq: 0,
            }),
        }
    }

    /// Chain hosting the vault
    pub fn source(chain_id: u64, counterparty_chain_id: u64) -> Self {
        Self::new(chain_id, counterparty_chain_id, BridgeSide::Source, "sim-source")
    }

    /// Chain hosting the wrapped token bridge
    pub fn destination(chain_id: u64, counterparty_chain_id: u64) -> Self {
        Self::new(chain_id, counterparty_chain_id, BridgeSide::Destination, "sim-destination")
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        // a panicking test thread must not hide the state from other assertions
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_reachable(state: &SimState) -> Result<(), DispatchError> {
        if state.unreachable {
            return Err(DispatchError::Transient(
                "connection refused: endpoint unreachable".to_string(),
            ));
        }
        Ok(())
    }

    fn mine_block(&self, state: &mut SimState) {
        state.head += 1;
        let block = state.head;

        for (log_index, queued) in std::mem::take(&mut state.queued_logs).into_iter().enumerate() {
            state.log_seq += 1;
            let mut seed = self.chain_id.to_be_bytes().to_vec();
            seed.extend_from_slice(&state.log_seq.to_be_bytes());
            state.logs.push(ChainEvent {
                id: EventId {
                    chain_id: self.chain_id,
                    block_number: block,
                    tx_hash: B256::from(keccak256(&seed)),
                    log_index: log_index as u64,
                },
                kind: queued.kind,
                user: queued.user,
                amount: queued.amount,
                destination: queued.destination,
                source_chain: self.chain_id,
                dest_chain: self.counterparty_chain_id,
            });
        }

        // include executable transactions in nonce order
        loop {
            let next = state.mempool.iter().position(|(_, tx)| {
                tx.nonce == state.nonces.get(&tx.from).copied().unwrap_or(0)
            });
            let Some(position) = next else { break };
            let (hash, tx) = state.mempool.remove(position);
            *state.nonces.entry(tx.from).or_insert(0) += 1;
            let success = self.execute(state, &tx);
            state.receipts.insert(hash, (block, success));
        }

        // transactions whose nonce was taken can never be included
        let nonces = state.nonces.clone();
        state
            .mempool
            .retain(|(_, tx)| tx.nonce >= nonces.get(&tx.from).copied().unwrap_or(0));
    }

    fn execute(&self, state: &mut SimState, tx: &SimTx) -> bool {
        if tx.from != state.relayer || tx.chain_id != self.chain_id {
            return false;
        }
        match (&tx.call, self.side) {
            (SimCall::Mint { user, amount }, BridgeSide::Destination) => {
                state.total_supply += *amount;
                *state.balances.entry(*user).or_default() += *amount;
                true
            }
            (SimCall::Release { user, amount }, BridgeSide::Source) => {
                if state.vault_locked < *amount {
                    return false;
                }
                state.vault_locked -= *amount;
                *state.balances.entry(*user).or_default() += *amount;
                true
            }
            _ => false,
        }
    }

    pub fn mine(&self, blocks: u64) {
        let mut state = self.state();
        for _ in 0..blocks {
            self.mine_block(&mut state);
        }
    }

    pub fn head(&self) -> u64 {
        self.state().head
    }

    /// Mine one block on every head or receipt query
    pub fn set_auto_mine(&self, enabled: bool) {
        self.state().auto_mine = enabled;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state().unreachable = unreachable;
    }

    pub fn set_relayer_funded(&self, funded: bool) {
        self.state().relayer_funded = funded;
    }

    /// Fail the next `count` broadcasts after they leave the relayer
    pub fn fail_next_broadcasts(&self, count: u32) {
        self.state().failing_broadcasts = count;
    }

    /// Another transaction from `account` is mined, using up its next nonce
    pub fn consume_nonce(&self, account: Address) {
        *self.state().nonces.entry(account).or_insert(0) += 1;
    }

    /// A reorganization erases the event
    pub fn remove_event(&self, id: &EventId) {
        self.state().logs.retain(|e| e.id != *id);
    }

    /// A reorganization re-includes the event's transaction at another block
    pub fn relocate_event(&self, id: &EventId, block_number: u64) -> Option<ChainEvent> {
        let mut state = self.state();
        let event = state.logs.iter_mut().find(|e| e.id == *id)?;
        event.id.block_number = block_number;
        Some(event.clone())
    }

    /// Owner-only rotation of the authorized relayer
    pub fn set_relayer(&self, caller: Address, relayer: Address) -> Result<()> {
        let mut state = self.state();
        if caller != OWNER {
            return Err(eyre!("setRelayer: caller is not the owner"));
        }
        state.relayer = relayer;
        Ok(())
    }

    pub fn fund(&self, user: Address, amount: U256) {
        *self.state().balances.entry(user).or_default() += amount;
    }

    /// User locks funds in the vault; the event lands in the next block
    pub fn lock(&self, user: Address, amount: U256, destination: Address) -> Result<()> {
        if self.side != BridgeSide::Source {
            return Err(eyre!("lock is only available on the vault chain"));
        }
        let mut state = self.state();
        let balance = state.balances.entry(user).or_default();
        if *balance < amount || amount.is_zero() {
            return Err(eyre!("lock: insufficient balance"));
        }
        *balance -= amount;
        state.vault_locked += amount;
        state.queued_logs.push(QueuedLog {
            kind: EventKind::Locked,
            user,
            amount,
            destination,
        });
        Ok(())
    }

    /// User burns wrapped tokens; the event lands in the next block
    pub fn burn(&self, user: Address, amount: U256, destination: Address) -> Result<()> {
        if self.side != BridgeSide::Destination {
            return Err(eyre!("burn is only available on the wrapped token chain"));
        }
        let mut state = self.state();
        let balance = state.balances.entry(user).or_default();
        if *balance < amount || amount.is_zero() {
            return Err(eyre!("burn: insufficient balance"));
        }
        *balance -= amount;
        state.total_supply -= amount;
        state.queued_logs.push(QueuedLog {
            kind: EventKind::Burned,
            user,
            amount,
            destination,
        });
        Ok(())
    }

    pub fn balance_of(&self, user: Address) -> U256 {
        self.state().balances.get(&user).copied().unwrap_or_default()
    }

    /// Wrapped tokens in circulation (destination side)
    pub fn total_supply(&self) -> U256 {
        self.state().total_supply
    }

    /// Funds held by the vault (source side)
    pub fn vault_locked(&self) -> U256 {
        self.state().vault_locked
    }

    /// Broadcast attempts received, including failed ones
    pub fn broadcast_count(&self) -> usize {
        self.state().broadcasts
    }

    pub fn mempool_len(&self) -> usize {
        self.state().mempool.len()
    }
}

#[async_trait]
impl ChainClient for SimulatedChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn relayer_address(&self) -> Address {
        self.signer
    }

    async fn latest_block(&self) -> Result<u64, DispatchError> {
        let mut state = self.state();
        Self::ensure_reachable(&state)?;
        if state.auto_mine {
            self.mine_block(&mut state);
        }
        Ok(state.head)
    }

    async fn fetch_events(
        &self,
        kind: EventKind,
        from: u64,
        to: u64,
    ) -> Result<Vec<ChainEvent>, DispatchError> {
        let state = self.state();
        Self::ensure_reachable(&state)?;
        let mut events: Vec<ChainEvent> = state
            .logs
            .iter()
            .filter(|e| e.kind == kind && e.id.block_number >= from && e.id.block_number <= to)
            .cloned()
            .collect();
        events.sort_by_key(|e| (e.id.block_number, e.id.log_index));
        Ok(events)
    }

    async fn event_exists(&self, event: &ChainEvent) -> Result<bool, DispatchError> {
        let state = self.state();
        Self::ensure_reachable(&state)?;
        Ok(state.logs.contains(event))
    }

    async fn authorized_relayer(&self) -> Result<Address, DispatchError> {
        let state = self.state();
        Self::ensure_reachable(&state)?;
        Ok(state.relayer)
    }

    async fn pending_nonce(&self) -> Result<u64, DispatchError> {
        let state = self.state();
        Self::ensure_reachable(&state)?;
        let confirmed = state.nonces.get(&state.signer).copied().unwrap_or(0);
        let queued = state
            .mempool
            .iter()
            .filter(|(_, tx)| tx.from == state.signer)
            .count() as u64;
        Ok(confirmed + queued)
    }

    async fn prepare(
        &self,
        action: &DestinationAction,
        nonce: u64,
    ) -> Result<PreparedSubmission, DispatchError> {
        let state = self.state();
        Self::ensure_reachable(&state)?;

        // gas estimation runs the call against current state
        if state.signer != state.relayer {
            return Err(DispatchError::from_rpc("execution reverted: caller is not the relayer"));
        }
        if !state.relayer_funded {
            return Err(DispatchError::from_rpc("insufficient funds for gas * price + value"));
        }
        let call = match (action.direction, self.side) {
            (Direction::LockToMint, BridgeSide::Destination) => SimCall::Mint {
                user: action.recipient,
                amount: action.amount,
            },
            (Direction::BurnToRelease, BridgeSide::Source) => {
                if state.vault_locked < action.amount {
                    return Err(DispatchError::from_rpc("execution reverted: vault balance too low"));
                }
                SimCall::Release {
                    user: action.recipient,
                    amount: action.amount,
                }
            }
            _ => return Err(DispatchError::from_rpc("execution reverted: unknown function")),
        };

        let tx = SimTx {
            chain_id: self.chain_id,
            from: state.signer,
            nonce,
            call,
        };
        let raw = serde_json::to_vec(&tx)
            .map_err(|e| DispatchError::Transient(format!("encode transaction: {}", e)))?;
        Ok(PreparedSubmission {
            tx_hash: B256::from(keccak256(&raw)),
            raw,
        })
    }

    async fn broadcast(&self, raw: &[u8]) -> Result<B256, DispatchError> {
        let mut state = self.state();
        Self::ensure_reachable(&state)?;
        state.broadcasts += 1;
        if state.failing_broadcasts > 0 {
            state.failing_broadcasts -= 1;
            return Err(DispatchError::Transient("connection reset by peer".to_string()));
        }

        let tx: SimTx = serde_json::from_slice(raw)
            .map_err(|e| DispatchError::Rejected(format!("invalid transaction: {}", e)))?;
        let hash = B256::from(keccak256(raw));

        if state.mempool.iter().any(|(h, _)| *h == hash) {
            return Ok(hash);
        }
        let account_nonce = state.nonces.get(&tx.from).copied().unwrap_or(0);
        if state.receipts.contains_key(&hash) || tx.nonce < account_nonce {
            return Err(DispatchError::from_rpc("nonce too low"));
        }
        if state
            .mempool
            .iter()
            .any(|(_, queued)| queued.from == tx.from && queued.nonce == tx.nonce)
        {
            return Err(DispatchError::from_rpc("replacement transaction underpriced"));
        }
        state.mempool.push((hash, tx));
        Ok(hash)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, DispatchError> {
        let mut state = self.state();
        Self::ensure_reachable(&state)?;
        if state.auto_mine {
            self.mine_block(&mut state);
        }
        if let Some((block_number, success)) = state.receipts.get(&tx_hash) {
            return Ok(TxStatus::Included {
                block_number: *block_number,
                success: *success,
            });
        }
        if state.mempool.iter().any(|(h, _)| *h == tx_hash) {
            return Ok(TxStatus::Pending);
        }
        Ok(TxStatus::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lock_event_lands_in_next_block() {
        let chain = SimulatedChain::source(1, 2);
        chain.fund(USER, U256::from(50u64));
        chain.lock(USER, U256::from(50u64), USER).unwrap();
        assert!(chain.fetch_events(EventKind::Locked, 0, 10).await.unwrap().is_empty());

        chain.mine(1);
        let events = chain.fetch_events(EventKind::Locked, 0, 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id.block_number, 1);
        assert_eq!(chain.vault_locked(), U256::from(50u64));
        assert!(chain.lock(USER, U256::from(1u64), USER).is_err());
    }

    #[tokio::test]
    async fn test_only_owner_rotates_relayer() {
        let chain = SimulatedChain::destination(2, 1);
        assert!(chain.set_relayer(USER, USER).is_err());
        chain.set_relayer(OWNER, USER).unwrap();
        assert_eq!(chain.authorized_relayer().await.unwrap(), USER);
    }

    #[tokio::test]
    async fn test_unauthorized_transaction_reverts() {
        let chain = SimulatedChain::destination(2, 1);
        let action = DestinationAction {
            transfer_id: crate::types::TransferId(B256::ZERO),
            direction: Direction::LockToMint,
            recipient: USER,
            amount: U256::from(5u64),
        };
        let prepared = chain.prepare(&action, 0).await.unwrap();
        chain.broadcast(&prepared.raw).await.unwrap();
        chain.set_relayer(OWNER, USER).unwrap();
        chain.mine(1);

        assert_eq!(
            chain.transaction_status(prepared.tx_hash).await.unwrap(),
            TxStatus::Included {
                block_number: 1,
                success: false
            }
        );
        assert_eq!(chain.total_supply(), U256::ZERO);
    }
}
