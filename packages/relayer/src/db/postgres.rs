use alloy::primitives::B256;
use async_trait::async_trait;
use eyre::{Result, WrapErr};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::error;

use super::models::{to_i64, AttestationRow, TransferRow, TRANSFER_COLUMNS};
use super::RelayStore;
use crate::types::{
    Attestation, Dedup, Direction, EventId, StatusCount, Transfer, TransferId, TransferStatus,
};

/// Create a database connection pool
pub async fn create_pool(database_url: &str) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(10)
        .connect(database_url)
        .await
        .wrap_err("Failed to connect to database")
}

/// Run pending migrations (uses the migration files in migrations/)
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .wrap_err("Failed to run database migrations")?;
    Ok(())
}

/// PostgreSQL-backed relay store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

type SubmissionColumns = (
    Option<i64>,
    Option<String>,
    Option<Vec<u8>>,
    Option<chrono::DateTime<chrono::Utc>>,
);

fn submission_columns(transfer: &Transfer) -> Result<SubmissionColumns> {
    Ok(match &transfer.submission {
        Some(s) => (
            Some(to_i64(s.nonce)?),
            Some(s.tx_hash.to_string()),
            Some(s.raw_tx.clone()),
            Some(s.submitted_at),
        ),
        None => (None, None, None, None),
    })
}

#[async_trait]
impl RelayStore for PgStore {
    async fn load_cursor(&self, chain_id: u64, direction: Direction) -> Result<Option<u64>> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"SELECT last_processed_block FROM chain_cursors WHERE chain_id = $1 AND direction = $2"#,
        )
        .bind(to_i64(chain_id)?)
        .bind(direction.as_str())
        .fetch_optional(&self.pool)
        .await
        .wrap_err("Failed to get chain cursor")?;

        Ok(row.map(|r| r.0.max(0) as u64))
    }

    async fn save_cursor(&self, chain_id: u64, direction: Direction, block: u64) -> Result<()> {
        // GREATEST keeps the cursor monotonic if an older batch is acknowledged late
        sqlx::query(
            r#"
            INSERT INTO chain_cursors (chain_id, direction, last_processed_block)
            VALUES ($1, $2, $3)
            ON CONFLICT (chain_id, direction) DO UPDATE
            SET last_processed_block = GREATEST(chain_cursors.last_processed_block, $3),
                updated_at = NOW()
            "#,
        )
        .bind(to_i64(chain_id)?)
        .bind(direction.as_str())
        .bind(to_i64(block)?)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to update cursor for chain {}", chain_id))?;

        Ok(())
    }

    async fn record_event(&self, id: &EventId, transfer: Option<&Transfer>) -> Result<Dedup> {
        let mut tx = self
            .pool
            .begin()
            .await
            .wrap_err("Failed to begin ledger transaction")?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO processed_events (chain_id, block_number, tx_hash, log_index, transfer_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(to_i64(id.chain_id)?)
        .bind(to_i64(id.block_number)?)
        .bind(id.tx_hash.to_string())
        .bind(to_i64(id.log_index)?)
        .bind(transfer.map(|t| t.transfer_id.to_string()))
        .execute(&mut *tx)
        .await
        .wrap_err("Failed to record processed event")?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await.wrap_err("Failed to roll back ledger transaction")?;
            return Ok(Dedup::AlreadySeen);
        }

        if let Some(t) = transfer {
            let (nonce, sub_hash, raw, submitted_at) = submission_columns(t)?;
            sqlx::query(
                r#"
                INSERT INTO transfers (transfer_id, direction, status, amount, user_address,
                    destination, event_kind, src_chain_id, dest_chain_id, event_chain_id,
                    event_block_number, event_tx_hash, event_log_index, submission_nonce,
                    submission_tx_hash, submission_raw, submitted_at, resulting_tx_hash,
                    retry_count, last_error, failure_kind, next_attempt_at, created_at, updated_at)
                VALUES ($1, $2, $3, $4::NUMERIC, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19, $20, $21, $22, $23, $24)
                "#,
            )
            .bind(t.transfer_id.to_string())
            .bind(t.direction.as_str())
            .bind(t.status.as_str())
            .bind(t.amount.to_string())
            .bind(t.user.to_string())
            .bind(t.destination.to_string())
            .bind(t.event.kind.as_str())
            .bind(to_i64(t.event.source_chain)?)
            .bind(to_i64(t.event.dest_chain)?)
            .bind(to_i64(t.event.id.chain_id)?)
            .bind(to_i64(t.event.id.block_number)?)
            .bind(t.event.id.tx_hash.to_string())
            .bind(to_i64(t.event.id.log_index)?)
            .bind(nonce)
            .bind(sub_hash)
            .bind(raw)
            .bind(submitted_at)
            .bind(t.resulting_tx_hash.map(|h| h.to_string()))
            .bind(t.retry_count as i32)
            .bind(&t.last_error)
            .bind(t.failure_kind.map(|k| k.as_str()))
            .bind(t.next_attempt_at)
            .bind(t.created_at)
            .bind(t.updated_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                error!("SQL error inserting transfer: {:?}", e);
                e
            })
            .wrap_err("Failed to insert transfer")?;
        }

        tx.commit().await.wrap_err("Failed to commit ledger transaction")?;
        Ok(Dedup::Fresh)
    }

    async fn find_transfer_by_origin(
        &self,
        chain_id: u64,
        tx_hash: B256,
        log_index: u64,
    ) -> Result<Option<Transfer>> {
        let sql = format!(
            "SELECT {} FROM transfers WHERE event_chain_id = $1 AND event_tx_hash = $2 AND event_log_index = $3 ORDER BY created_at LIMIT 1",
            TRANSFER_COLUMNS
        );
        let row = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(to_i64(chain_id)?)
            .bind(tx_hash.to_string())
            .bind(to_i64(log_index)?)
            .fetch_optional(&self.pool)
            .await
            .wrap_err("Failed to look up transfer by origin")?;

        row.map(Transfer::try_from).transpose()
    }

    async fn get_transfer(&self, id: TransferId) -> Result<Option<Transfer>> {
        let sql = format!("SELECT {} FROM transfers WHERE transfer_id = $1", TRANSFER_COLUMNS);
        let row = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .wrap_err_with(|| format!("Failed to get transfer {}", id))?;

        row.map(Transfer::try_from).transpose()
    }

    async fn update_transfer(&self, expected: TransferStatus, t: &Transfer) -> Result<bool> {
        let (nonce, sub_hash, raw, submitted_at) = submission_columns(t)?;
        let updated = sqlx::query(
            r#"
            UPDATE transfers
            SET status = $3, submission_nonce = $4, submission_tx_hash = $5,
                submission_raw = $6, submitted_at = $7, resulting_tx_hash = $8,
                retry_count = $9, last_error = $10, failure_kind = $11,
                next_attempt_at = $12, updated_at = $13
            WHERE transfer_id = $1 AND status = $2
            "#,
        )
        .bind(t.transfer_id.to_string())
        .bind(expected.as_str())
        .bind(t.status.as_str())
        .bind(nonce)
        .bind(sub_hash)
        .bind(raw)
        .bind(submitted_at)
        .bind(t.resulting_tx_hash.map(|h| h.to_string()))
        .bind(t.retry_count as i32)
        .bind(&t.last_error)
        .bind(t.failure_kind.map(|k| k.as_str()))
        .bind(t.next_attempt_at)
        .bind(t.updated_at)
        .execute(&self.pool)
        .await
        .wrap_err_with(|| format!("Failed to update transfer {}", t.transfer_id))?
        .rows_affected();

        Ok(updated == 1)
    }

    async fn transfers_with_status(
        &self,
        direction: Option<Direction>,
        statuses: &[TransferStatus],
        limit: usize,
    ) -> Result<Vec<Transfer>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            r#"SELECT {} FROM transfers
               WHERE status = ANY($1) AND ($2::TEXT IS NULL OR direction = $2)
               ORDER BY event_block_number, event_log_index
               LIMIT $3"#,
            TRANSFER_COLUMNS
        );
        let rows = sqlx::query_as::<_, TransferRow>(&sql)
            .bind(&statuses)
            .bind(direction.map(|d| d.as_str()))
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                error!("SQL error listing transfers: {:?}", e);
                e
            })
            .wrap_err("Failed to list transfers")?;

        rows.into_iter().map(Transfer::try_from).collect()
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows: Vec<(String, String, i64)> = sqlx::query_as(
            r#"SELECT direction, status, COUNT(*) FROM transfers GROUP BY direction, status ORDER BY direction, status"#,
        )
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to count transfers")?;

        rows.into_iter()
            .map(|(direction, status, count)| {
                Ok(StatusCount {
                    direction: direction.parse()?,
                    status: status.parse()?,
                    count,
                })
            })
            .collect()
    }

    async fn record_attestation(&self, attestation: &Attestation) -> Result<bool> {
        let inserted = sqlx::query(
            r#"
            INSERT INTO transfer_attestations (transfer_id, validator, signature)
            VALUES ($1, $2, $3)
            ON CONFLICT (transfer_id, validator) DO NOTHING
            "#,
        )
        .bind(attestation.transfer_id.to_string())
        .bind(attestation.validator.to_string())
        .bind(&attestation.signature)
        .execute(&self.pool)
        .await
        .wrap_err("Failed to record attestation")?
        .rows_affected();

        Ok(inserted == 1)
    }

    async fn attestations(&self, id: TransferId) -> Result<Vec<Attestation>> {
        let rows = sqlx::query_as::<_, AttestationRow>(
            r#"SELECT transfer_id, validator, signature FROM transfer_attestations WHERE transfer_id = $1 ORDER BY created_at"#,
        )
        .bind(id.to_string())
        .fetch_all(&self.pool)
        .await
        .wrap_err("Failed to get attestations")?;

        rows.into_iter().map(Attestation::try_from).collect()
    }
}
