use alloy::primitives::{Address, B256, U256};
use chrono::{DateTime, Utc};
use eyre::{eyre, Result, WrapErr};
use sqlx::FromRow;
use std::str::FromStr;

use crate::types::{
    Attestation, ChainEvent, EventId, EventKind, FailureKind, Submission, Transfer, TransferId,
    TransferStatus,
};

// Amounts are stored as NUMERIC(78,0). Inserts cast text with `$n::NUMERIC`;
// reads select `amount::TEXT as amount`. Hashes and addresses are 0x-hex text.

/// Row of the `transfers` table
#[derive(Debug, Clone, FromRow)]
pub struct TransferRow {
    pub transfer_id: String,
    pub direction: String,
    pub status: String,
    pub amount: String,
    pub user_address: String,
    pub destination: String,
    pub event_kind: String,
    pub src_chain_id: i64,
    pub dest_chain_id: i64,
    pub event_chain_id: i64,
    pub event_block_number: i64,
    pub event_tx_hash: String,
    pub event_log_index: i64,
    pub submission_nonce: Option<i64>,
    pub submission_tx_hash: Option<String>,
    pub submission_raw: Option<Vec<u8>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub resulting_tx_hash: Option<String>,
    pub retry_count: i32,
    pub last_error: Option<String>,
    pub failure_kind: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Column list matching [`TransferRow`]
pub const TRANSFER_COLUMNS: &str = r#"transfer_id, direction, status, amount::TEXT as amount,
    user_address, destination, event_kind, src_chain_id, dest_chain_id, event_chain_id,
    event_block_number, event_tx_hash, event_log_index, submission_nonce, submission_tx_hash,
    submission_raw, submitted_at, resulting_tx_hash, retry_count, last_error, failure_kind,
    next_attempt_at, created_at, updated_at"#;

/// Row of the `transfer_attestations` table
#[derive(Debug, Clone, FromRow)]
pub struct AttestationRow {
    pub transfer_id: String,
    pub validator: String,
    pub signature: Vec<u8>,
}

fn event_kind_from_str(s: &str) -> Result<EventKind> {
    match s {
        "locked" => Ok(EventKind::Locked),
        "burned" => Ok(EventKind::Burned),
        other => Err(eyre!("unknown event kind: {}", other)),
    }
}

fn parse_b256(s: &str) -> Result<B256> {
    B256::from_str(s).wrap_err_with(|| format!("invalid hash {}", s))
}

fn parse_address(s: &str) -> Result<Address> {
    Address::from_str(s).wrap_err_with(|| format!("invalid address {}", s))
}

pub fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| eyre!("{} does not fit in BIGINT", value))
}

fn to_u64(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| eyre!("negative value {} in unsigned column", value))
}

impl TryFrom<TransferRow> for Transfer {
    type Error = eyre::Report;

    fn try_from(row: TransferRow) -> Result<Self> {
        let amount = U256::from_str_radix(&row.amount, 10)
            .wrap_err_with(|| format!("invalid amount {}", row.amount))?;
        let user = parse_address(&row.user_address)?;
        let destination = parse_address(&row.destination)?;

        let event = ChainEvent {
            id: EventId {
                chain_id: to_u64(row.event_chain_id)?,
                block_number: to_u64(row.event_block_number)?,
                tx_hash: parse_b256(&row.event_tx_hash)?,
                log_index: to_u64(row.event_log_index)?,
            },
            kind: event_kind_from_str(&row.event_kind)?,
            user,
            amount,
            destination,
            source_chain: to_u64(row.src_chain_id)?,
            dest_chain: to_u64(row.dest_chain_id)?,
        };

        let submission = match (row.submission_nonce, row.submission_tx_hash, row.submitted_at) {
            (Some(nonce), Some(tx_hash), Some(submitted_at)) => Some(Submission {
                nonce: to_u64(nonce)?,
                tx_hash: parse_b256(&tx_hash)?,
                raw_tx: row.submission_raw.unwrap_or_default(),
                submitted_at,
            }),
            _ => None,
        };

        Ok(Transfer {
            transfer_id: TransferId::from_str(&row.transfer_id)?,
            direction: row.direction.parse()?,
            amount,
            user,
            destination,
            status: TransferStatus::from_str(&row.status)?,
            event,
            resulting_tx_hash: row.resulting_tx_hash.as_deref().map(parse_b256).transpose()?,
            submission,
            retry_count: u32::try_from(row.retry_count).unwrap_or(0),
            last_error: row.last_error,
            failure_kind: row.failure_kind.as_deref().map(FailureKind::from_str).transpose()?,
            next_attempt_at: row.next_attempt_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

impl TryFrom<AttestationRow> for Attestation {
    type Error = eyre::Report;

    fn try_from(row: AttestationRow) -> Result<Self> {
        Ok(Attestation {
            transfer_id: TransferId::from_str(&row.transfer_id)?,
            validator: parse_address(&row.validator)?,
            signature: row.signature,
        })
    }
}
