//! Prometheus metrics for the anchor relayer
//!
//! Exposed on the /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

use crate::health::{ChainStatus, Role};

lazy_static! {
    // Sync loops
    pub static ref BLOCKS_PROCESSED: CounterVec = register_counter_vec!(
        "relayer_blocks_processed_total",
        "Total number of blocks processed",
        &["chain", "role"]
    ).unwrap();

    pub static ref LATEST_BLOCK: GaugeVec = register_gauge_vec!(
        "relayer_latest_block",
        "Latest block number processed",
        &["chain", "role"]
    ).unwrap();

    pub static ref SYNCED_HEIGHT: GaugeVec = register_gauge_vec!(
        "relayer_synced_height",
        "Header height confirmed on the destination light client",
        &["chain"]
    ).unwrap();

    pub static ref EVENTS_DETECTED: CounterVec = register_counter_vec!(
        "relayer_events_detected_total",
        "Total number of cross-chain events detected",
        &["chain"]
    ).unwrap();

    // Messages
    pub static ref MESSAGES_ROUTED: CounterVec = register_counter_vec!(
        "relayer_messages_routed_total",
        "Total number of messages handed to a writer",
        &["destination", "kind"]
    ).unwrap();

    pub static ref MESSAGES_UNROUTABLE: CounterVec = register_counter_vec!(
        "relayer_messages_unroutable_total",
        "Total number of events naming a destination chain without a writer",
        &["chain", "destination"]
    ).unwrap();

    pub static ref MESSAGES_COMPLETED: CounterVec = register_counter_vec!(
        "relayer_messages_completed_total",
        "Total number of messages completed by a writer",
        &["chain", "kind", "outcome"]
    ).unwrap();

    pub static ref TRANSACTIONS_SUBMITTED: CounterVec = register_counter_vec!(
        "relayer_transactions_submitted_total",
        "Total number of transactions broadcast",
        &["chain", "status"]
    ).unwrap();

    pub static ref DELIVERY_LATENCY: HistogramVec = register_histogram_vec!(
        "relayer_delivery_latency_seconds",
        "Time from writer pickup to confirmed effect",
        &["chain", "kind"],
        vec![1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 900.0]
    ).unwrap();

    // Errors
    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "relayer_errors_total",
        "Total number of errors",
        &["chain", "type"]
    ).unwrap();

    pub static ref CONSECUTIVE_FAILURES: GaugeVec = register_gauge_vec!(
        "relayer_consecutive_failures",
        "Number of consecutive failures",
        &["chain", "role"]
    ).unwrap();

    // Health
    pub static ref UP: Gauge = register_gauge!(
        "relayer_up",
        "Whether the relayer is up and running"
    ).unwrap();

    pub static ref CHAIN_STATUS: GaugeVec = register_gauge_vec!(
        "relayer_chain_status",
        "Chain role status: 0 running, 1 alarming, 2 dead, 3 stopped",
        &["chain", "role"]
    ).unwrap();

    pub static ref ALARMS_RAISED: CounterVec = register_counter_vec!(
        "relayer_alarms_raised_total",
        "Total number of operator alarms raised",
        &["chain"]
    ).unwrap();
}

/// Record a block processed by a sync loop
pub fn record_block_processed(chain: &str, role: Role, block_number: u64) {
    BLOCKS_PROCESSED
        .with_label_values(&[chain, role.as_str()])
        .inc();
    LATEST_BLOCK
        .with_label_values(&[chain, role.as_str()])
        .set(block_number as f64);
}

pub fn set_synced_height(chain: &str, height: u64) {
    SYNCED_HEIGHT.with_label_values(&[chain]).set(height as f64);
}

pub fn record_events_detected(chain: &str, count: usize) {
    EVENTS_DETECTED
        .with_label_values(&[chain])
        .inc_by(count as f64);
}

pub fn record_message_routed(destination: &str, kind: &str) {
    MESSAGES_ROUTED.with_label_values(&[destination, kind]).inc();
}

pub fn record_unroutable(chain: &str, destination: &str) {
    MESSAGES_UNROUTABLE
        .with_label_values(&[chain, destination])
        .inc();
}

/// Record a writer outcome: `applied`, `duplicate` or `ignored`
pub fn record_message_completed(chain: &str, kind: &str, outcome: &str, seconds: f64) {
    MESSAGES_COMPLETED
        .with_label_values(&[chain, kind, outcome])
        .inc();
    DELIVERY_LATENCY
        .with_label_values(&[chain, kind])
        .observe(seconds);
}

pub fn record_transaction_submitted(chain: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    TRANSACTIONS_SUBMITTED
        .with_label_values(&[chain, status])
        .inc();
}

/// Record an error
pub fn record_error(chain: &str, error_type: &str) {
    ERRORS.with_label_values(&[chain, error_type]).inc();
}

pub fn set_consecutive_failures(chain: &str, role: Role, count: u64) {
    CONSECUTIVE_FAILURES
        .with_label_values(&[chain, role.as_str()])
        .set(count as f64);
}

pub fn set_chain_status(chain: &str, role: Role, status: ChainStatus) {
    let value = match status {
        ChainStatus::Running => 0.0,
        ChainStatus::Alarming => 1.0,
        ChainStatus::Dead => 2.0,
        ChainStatus::Stopped => 3.0,
    };
    CHAIN_STATUS
        .with_label_values(&[chain, role.as_str()])
        .set(value);
}

pub fn record_alarm(chain: &str) {
    ALARMS_RAISED.with_label_values(&[chain]).inc();
}
