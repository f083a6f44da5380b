//! Hash computation for transfer identities and validator attestations
//!
//! Both hashes use the abi.encode word layout so an on-chain verifier can
//! recompute them with `keccak256(abi.encode(...))`.

use tiny_keccak::{Hasher, Keccak};

use crate::types::{Direction, EventId, Transfer};

/// Compute keccak256 hash of data
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut output = [0u8; 32];
    hasher.finalize(&mut output);
    output
}

fn put_u64(word: &mut [u8], value: u64) {
    word[24..32].copy_from_slice(&value.to_be_bytes());
}

/// Transfer id for an event identity
///
/// keccak256(abi.encode(uint64 chainId, uint64 blockNumber, bytes32 txHash, uint64 logIndex))
pub fn compute_transfer_id(id: &EventId) -> [u8; 32] {
    let mut data = [0u8; 128];
    put_u64(&mut data[0..32], id.chain_id);
    put_u64(&mut data[32..64], id.block_number);
    data[64..96].copy_from_slice(id.tx_hash.as_slice());
    put_u64(&mut data[96..128], id.log_index);
    keccak256(&data)
}

/// Digest a validator signs to attest a transfer
///
/// keccak256(abi.encode(bytes32 transferId, uint8 direction, uint64 destChain,
/// address recipient, uint256 amount))
pub fn attestation_digest(transfer: &Transfer) -> [u8; 32] {
    let mut data = [0u8; 160];
    data[0..32].copy_from_slice(transfer.transfer_id.0.as_slice());
    data[63] = match transfer.direction {
        Direction::LockToMint => 0,
        Direction::BurnToRelease => 1,
    };
    put_u64(&mut data[64..96], transfer.event.dest_chain);
    data[108..128].copy_from_slice(transfer.destination.as_slice());
    data[128..160].copy_from_slice(&transfer.amount.to_be_bytes::<32>());
    keccak256(&data)
}
