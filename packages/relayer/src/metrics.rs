//! Prometheus metrics for the vault relayer
//!
//! Exposed on the /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, CounterVec, Gauge, GaugeVec,
};

lazy_static! {
    // Transfer lifecycle
    pub static ref TRANSFERS_OBSERVED: CounterVec = register_counter_vec!(
        "relayer_transfers_observed_total",
        "Transfers created from newly observed events",
        &["direction"]
    ).unwrap();

    pub static ref TRANSFERS_CONFIRMED: CounterVec = register_counter_vec!(
        "relayer_transfers_confirmed_total",
        "Transfers whose destination action reached confirmation depth",
        &["direction"]
    ).unwrap();

    pub static ref TRANSFERS_DEAD_LETTERED: CounterVec = register_counter_vec!(
        "relayer_transfers_dead_lettered_total",
        "Transfers moved to the dead-letter state",
        &["direction", "kind"]
    ).unwrap();

    pub static ref TRANSFERS_FLAGGED: CounterVec = register_counter_vec!(
        "relayer_transfers_flagged_total",
        "Transfers flagged for manual reconciliation",
        &["direction"]
    ).unwrap();

    pub static ref DUPLICATE_EVENTS: CounterVec = register_counter_vec!(
        "relayer_duplicate_events_total",
        "Events dropped by the idempotency ledger",
        &["direction"]
    ).unwrap();

    // Submissions
    pub static ref SUBMISSIONS: CounterVec = register_counter_vec!(
        "relayer_submissions_total",
        "Destination submissions by outcome",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref IN_FLIGHT: GaugeVec = register_gauge_vec!(
        "relayer_in_flight_submissions",
        "Submissions awaiting confirmation",
        &["chain"]
    ).unwrap();

    // Readers
    pub static ref CURSOR_HEIGHT: GaugeVec = register_gauge_vec!(
        "relayer_cursor_block",
        "Last fully processed block per reader",
        &["chain", "direction"]
    ).unwrap();

    pub static ref LAST_SUCCESSFUL_POLL: GaugeVec = register_gauge_vec!(
        "relayer_last_successful_poll_timestamp",
        "Unix timestamp of last successful poll",
        &["chain"]
    ).unwrap();

    // Errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();

    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();
}

pub fn record_observed(direction: &str) {
    TRANSFERS_OBSERVED.with_label_values(&[direction]).inc();
}

pub fn record_duplicate(direction: &str) {
    DUPLICATE_EVENTS.with_label_values(&[direction]).inc();
}

pub fn record_confirmed(direction: &str) {
    TRANSFERS_CONFIRMED.with_label_values(&[direction]).inc();
}

pub fn record_dead_lettered(direction: &str, kind: &str) {
    TRANSFERS_DEAD_LETTERED
        .with_label_values(&[direction, kind])
        .inc();
}

pub fn record_flagged(direction: &str) {
    TRANSFERS_FLAGGED.with_label_values(&[direction]).inc();
}

/// Record a submission outcome ("broadcast", "rebroadcast", "awaited", "failed")
pub fn record_submission(chain: &str, outcome: &str) {
    SUBMISSIONS.with_label_values(&[chain, outcome]).inc();
}

pub fn set_in_flight(chain: &str, count: usize) {
    IN_FLIGHT.with_label_values(&[chain]).set(count as f64);
}

/// Record a persisted cursor and the time of the poll that produced it
pub fn record_cursor(chain: &str, direction: &str, block_number: u64) {
    CURSOR_HEIGHT
        .with_label_values(&[chain, direction])
        .set(block_number as f64);
    LAST_SUCCESSFUL_POLL
        .with_label_values(&[chain])
        .set(chrono::Utc::now().timestamp() as f64);
}

pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}
