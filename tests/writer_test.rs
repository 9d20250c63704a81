//! Writer submission loop against the in-memory chain client
//!
//! Run with: cargo test --test writer_test

use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use tokio_util::sync::CancellationToken;

use anchor_relayer::adapters::AdapterError;
use anchor_relayer::connection::ClientError;
use anchor_relayer::health::{ChainHealth, ChainStatus, Role};
use anchor_relayer::testing::{
    delivery_message, mock_connection, MockAdapter, RecordingAlarm, TxStatus,
};
use anchor_relayer::types::CompletionCounter;
use anchor_relayer::writers::{MessageWriter, RetryPolicy, Writer, WriterConfig};

const ANCHOR: u64 = 22776;

mod helpers {
    use super::*;
    use anchor_relayer::connection::Connection;
    use anchor_relayer::testing::MockClient;

    pub struct Harness {
        pub conn: Arc<Connection<MockClient>>,
        pub adapter: Arc<MockAdapter>,
        pub alarm: Arc<RecordingAlarm>,
        pub health: Arc<ChainHealth>,
        pub stop: CancellationToken,
        pub writer: Arc<Writer<MockClient>>,
    }

    pub fn harness() -> Harness {
        let conn = mock_connection(ANCHOR, "anchor");
        let adapter = Arc::new(MockAdapter::default());
        let alarm = Arc::new(RecordingAlarm::default());
        let health = Arc::new(ChainHealth::new());
        let stop = CancellationToken::new();
        let config = WriterConfig {
            retry: RetryPolicy {
                retry_interval: Duration::from_secs(1),
                alarm_threshold: 3,
                max_receipt_polls: 2,
                receipt_poll_interval: Duration::from_millis(500),
            },
            ..Default::default()
        };
        let writer = Arc::new(Writer::new(
            conn.clone(),
            adapter.clone(),
            config,
            alarm.clone(),
            health.clone(),
            stop.clone(),
        ));
        Harness {
            conn,
            adapter,
            alarm,
            health,
            stop,
            writer,
        }
    }

    /// True when no further completion arrives within a minute of paused time
    pub async fn no_more_signals(counter: &mut CompletionCounter) -> bool {
        tokio::time::timeout(
            Duration::from_secs(60),
            counter.wait_for(1, &CancellationToken::new()),
        )
        .await
        .is_err()
    }
}

use helpers::{harness, no_more_signals};

#[tokio::test(start_paused = true)]
async fn test_applied_message_completes_once() {
    let h = harness();
    let mut counter = CompletionCounter::new();

    h.writer
        .write(delivery_message(56, ANCHOR, B256::repeat_byte(1), counter.handle()))
        .await;

    tokio_test::assert_ok!(counter.wait_for(1, &h.stop).await);
    assert_eq!(h.conn.client().sent().len(), 1);
    assert!(no_more_signals(&mut counter).await);
}

#[tokio::test(start_paused = true)]
async fn test_already_applied_sends_nothing() {
    let h = harness();
    let order = B256::repeat_byte(2);
    h.adapter.mark_applied(order);
    let mut counter = CompletionCounter::new();

    h.writer
        .write(delivery_message(56, ANCHOR, order, counter.handle()))
        .await;

    tokio_test::assert_ok!(counter.wait_for(1, &h.stop).await);
    assert!(h.conn.client().sent().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_is_deduplicated() {
    let h = harness();
    let order = B256::repeat_byte(3);
    let mut counter = CompletionCounter::new();

    h.writer
        .write(delivery_message(56, ANCHOR, order, counter.handle()))
        .await;
    h.writer
        .write(delivery_message(56, ANCHOR, order, counter.handle()))
        .await;

    tokio_test::assert_ok!(counter.wait_for(2, &h.stop).await);
    assert_eq!(h.conn.client().sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_nonce_too_low_refreshes_nonce() {
    let h = harness();
    h.conn.client().set_pending_nonce(5);
    h.conn.client().push_send_error(ClientError::NonceTooLow);
    let mut counter = CompletionCounter::new();

    h.writer
        .write(delivery_message(56, ANCHOR, B256::repeat_byte(4), counter.handle()))
        .await;

    tokio_test::assert_ok!(counter.wait_for(1, &h.stop).await);
    // first lease plus the forced refresh
    assert_eq!(h.conn.client().nonce_reads(), 2);
    assert_eq!(h.conn.client().sent_nonces(), vec![5]);
}

#[tokio::test(start_paused = true)]
async fn test_ignorable_revert_completes_without_transaction() {
    let h = harness();
    h.conn
        .client()
        .push_estimate_error(ClientError::Reverted("Order Exist".into()));
    let mut counter = CompletionCounter::new();

    h.writer
        .write(delivery_message(56, ANCHOR, B256::repeat_byte(5), counter.handle()))
        .await;

    tokio_test::assert_ok!(counter.wait_for(1, &h.stop).await);
    assert!(h.conn.client().sent().is_empty());
    assert!(no_more_signals(&mut counter).await);
}

#[tokio::test(start_paused = true)]
async fn test_reverted_receipt_is_retried() {
    let h = harness();
    h.conn.client().set_tx_status(TxStatus::Reverted);
    let mut counter = CompletionCounter::new();

    let writer = h.writer.clone();
    let message = delivery_message(56, ANCHOR, B256::repeat_byte(6), counter.handle());
    let task = tokio::spawn(async move { writer.write(message).await });

    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!h.conn.client().sent().is_empty());
    h.conn.client().set_tx_status(TxStatus::Success);

    tokio_test::assert_ok!(counter.wait_for(1, &h.stop).await);
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_pending_transaction_is_never_replaced() {
    let h = harness();
    h.conn.client().set_pending_nonce(5);
    h.conn.client().set_tx_status(TxStatus::Pending);
    let mut counter = CompletionCounter::new();

    let writer = h.writer.clone();
    let message = delivery_message(56, ANCHOR, B256::repeat_byte(10), counter.handle());
    let task = tokio::spawn(async move { writer.write(message).await });

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(h.conn.client().sent_nonces(), vec![5]);
    assert!(!h.alarm.alarms().is_empty());
    assert_eq!(
        h.health.status(ANCHOR, Role::Writer),
        Some(ChainStatus::Alarming)
    );

    h.conn.client().set_tx_status(TxStatus::Success);
    tokio_test::assert_ok!(counter.wait_for(1, &h.stop).await);
    task.await.unwrap();
    assert_eq!(h.conn.client().sent().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_pending_transaction_abandoned_on_shutdown() {
    let h = harness();
    h.conn.client().set_tx_status(TxStatus::Pending);
    let mut counter = CompletionCounter::new();

    let writer = h.writer.clone();
    let message = delivery_message(56, ANCHOR, B256::repeat_byte(11), counter.handle());
    let task = tokio::spawn(async move { writer.write(message).await });

    tokio::time::sleep(Duration::from_secs(4)).await;
    h.stop.cancel();
    task.await.unwrap();

    assert_eq!(h.conn.client().sent().len(), 1);
    assert!(no_more_signals(&mut counter).await);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_abandons_without_signal() {
    let h = harness();
    for _ in 0..100 {
        h.conn
            .client()
            .push_send_error(ClientError::Transport("connection reset".into()));
    }
    let mut counter = CompletionCounter::new();

    let writer = h.writer.clone();
    let message = delivery_message(56, ANCHOR, B256::repeat_byte(7), counter.handle());
    let task = tokio::spawn(async move { writer.write(message).await });

    tokio::time::sleep(Duration::from_millis(2500)).await;
    h.stop.cancel();
    task.await.unwrap();

    assert!(h.conn.client().sent().is_empty());
    assert!(no_more_signals(&mut counter).await);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_raise_alarm_then_recover() {
    let h = harness();
    for _ in 0..3 {
        h.conn
            .client()
            .push_send_error(ClientError::Transport("eof".into()));
    }
    let mut counter = CompletionCounter::new();

    let writer = h.writer.clone();
    let message = delivery_message(56, ANCHOR, B256::repeat_byte(8), counter.handle());
    let task = tokio::spawn(async move { writer.write(message).await });

    // three failures one retry interval apart
    tokio::time::sleep(Duration::from_millis(2500)).await;
    assert_eq!(h.alarm.alarms().len(), 1);
    assert_eq!(
        h.health.status(ANCHOR, Role::Writer),
        Some(ChainStatus::Alarming)
    );

    tokio_test::assert_ok!(counter.wait_for(1, &h.stop).await);
    task.await.unwrap();
    assert_eq!(
        h.health.status(ANCHOR, Role::Writer),
        Some(ChainStatus::Running)
    );
}

#[tokio::test(start_paused = true)]
async fn test_unencodable_message_is_abandoned_with_alarm() {
    let h = harness();
    h.adapter.fail_encode(AdapterError::Encode {
        kind: "deliver_with_proof",
        reason: "empty proof".into(),
    });
    let mut counter = CompletionCounter::new();

    h.writer
        .write(delivery_message(56, ANCHOR, B256::repeat_byte(9), counter.handle()))
        .await;

    assert!(no_more_signals(&mut counter).await);
    assert_eq!(h.alarm.alarms().len(), 1);
    assert_eq!(h.alarm.alarms()[0].0, "anchor");
    assert!(h.conn.client().sent().is_empty());
}
