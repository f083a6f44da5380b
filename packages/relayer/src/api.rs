//! Operator HTTP surface
//!
//! - GET /health - Liveness
//! - GET /metrics - Prometheus metrics
//! - GET /status - Transfer counts per direction and status
//! - GET /transfers/dead-letter - Transfers waiting on an operator
//! - POST /transfers/{id}/requeue - Re-drive a dead-lettered transfer

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::db::RelayStore;
use crate::error::TransitionError;
use crate::metrics;
use crate::state::TransferStateMachine;
use crate::types::{
    Direction, EventId, FailureKind, StatusCount, Transfer, TransferId, TransferStatus,
};

/// Dead-letter listing is capped; the oldest events come first
const DEAD_LETTER_LIMIT: usize = 500;

#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<dyn RelayStore>,
    pub machine: TransferStateMachine,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(machine: TransferStateMachine) -> Self {
        Self {
            store: machine.store().clone(),
            machine,
            started_at: Instant::now(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
    pub uptime_seconds: u64,
    pub transfers: Vec<StatusCount>,
}

/// Enough context to diagnose a stuck transfer without rescanning the chain
#[derive(Debug, Serialize)]
pub struct DeadLetterEntry {
    pub transfer_id: TransferId,
    pub direction: Direction,
    pub status: TransferStatus,
    pub event: EventId,
    pub destination: String,
    pub amount: String,
    pub retry_count: u32,
    pub failure_kind: Option<FailureKind>,
    pub last_error: Option<String>,
    pub submitted_tx: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl From<&Transfer> for DeadLetterEntry {
    fn from(t: &Transfer) -> Self {
        Self {
            transfer_id: t.transfer_id,
            direction: t.direction,
            status: t.status,
            event: t.event.id,
            destination: t.destination.to_string(),
            amount: t.amount.to_string(),
            retry_count: t.retry_count,
            failure_kind: t.failure_kind,
            last_error: t.last_error.clone(),
            submitted_tx: t.submission.as_ref().map(|s| s.tx_hash.to_string()),
            updated_at: t.updated_at,
        }
    }
}

/// Handler error rendered as a status code and plain message
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn internal(e: eyre::Report) -> Self {
        warn!(error = %e, "API request failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn prometheus_metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match Response::builder()
        .header(header::CONTENT_TYPE, encoder.format_type())
        .body(axum::body::Body::from(buffer))
    {
        Ok(resp) => resp,
        Err(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to build metrics response",
        )
            .into_response(),
    }
}

async fn status(State(state): State<ApiState>) -> Result<Json<StatusResponse>, ApiError> {
    let transfers = state.store.status_counts().await.map_err(ApiError::internal)?;
    Ok(Json(StatusResponse {
        status: "healthy".to_string(),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        transfers,
    }))
}

async fn dead_letter(State(state): State<ApiState>) -> Result<Json<Vec<DeadLetterEntry>>, ApiError> {
    let transfers = state
        .store
        .transfers_with_status(
            None,
            &[TransferStatus::DeadLettered, TransferStatus::Flagged],
            DEAD_LETTER_LIMIT,
        )
        .await
        .map_err(ApiError::internal)?;
    Ok(Json(transfers.iter().map(DeadLetterEntry::from).collect()))
}

async fn requeue(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<DeadLetterEntry>, ApiError> {
    let id: TransferId = id
        .parse()
        .map_err(|e| ApiError::new(StatusCode::BAD_REQUEST, format!("invalid transfer id: {}", e)))?;

    match state.machine.requeue(id).await {
        Ok(transfer) => {
            info!(transfer_id = %id, "Transfer requeued by operator");
            Ok(Json(DeadLetterEntry::from(&transfer)))
        }
        Err(e) => match e.downcast_ref::<TransitionError>() {
            Some(TransitionError::NotFound(_)) => Err(ApiError::new(StatusCode::NOT_FOUND, e.to_string())),
            Some(TransitionError::Illegal { .. }) | Some(TransitionError::Conflict { .. }) => {
                Err(ApiError::new(StatusCode::CONFLICT, e.to_string()))
            }
            None => Err(ApiError::internal(e)),
        },
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(prometheus_metrics))
        .route("/status", get(status))
        .route("/transfers/dead-letter", get(dead_letter))
        .route("/transfers/{id}/requeue", post(requeue))
        .with_state(state)
}

/// Serve the operator API until the listener fails
pub async fn start_api_server(addr: SocketAddr, state: ApiState) -> eyre::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server started");
    metrics::UP.set(1.0);

    axum::serve(listener, router(state)).await?;
    Ok(())
}
