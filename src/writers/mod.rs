//! Transaction writer
//!
//! One [`Writer`] per destination chain. Every routed message runs its own
//! submission loop on a spawned task:
//!
//! 1. check whether the effect already exists (local order cache, then the
//!    destination contract),
//! 2. take the connection's gas lease, sign and broadcast,
//! 3. poll for the receipt until the transaction leaves the mempool,
//! 4. on failure classify, sleep and start again.
//!
//! The completion handle is signalled only after a successful receipt, a
//! detected duplicate or an ignorable revert.

pub mod retry;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use alloy::primitives::B256;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use retry::{AlarmCounter, Classifier, ErrorClass, RetryPolicy, IGNORABLE_REASONS};

use crate::adapters::{AdapterError, WriteAdapter};
use crate::alarm::Alarm;
use crate::bounded_cache::OrderCache;
use crate::connection::{ChainClient, ClientError, Connection, TxCall};
use crate::health::{ChainHealth, Role};
use crate::metrics;
use crate::types::Message;

/// Consumer side of the router
#[async_trait]
pub trait MessageWriter: Send + Sync + 'static {
    /// Drive `message` to completion or abandonment
    async fn write(&self, message: Message);
}

/// How one submission round ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Applied(B256),
    Duplicate,
    Stopped,
}

/// Writer settings besides the connection
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub retry: RetryPolicy,
    /// Revert reasons treated as success in addition to the built-in ones
    pub ignorable_reasons: Vec<String>,
    pub order_cache_size: usize,
    pub order_cache_ttl_secs: u64,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            ignorable_reasons: Vec::new(),
            order_cache_size: crate::bounded_cache::DEFAULT_ORDER_CACHE_SIZE,
            order_cache_ttl_secs: crate::bounded_cache::DEFAULT_ORDER_CACHE_TTL_SECS,
        }
    }
}

pub struct Writer<C: ChainClient> {
    conn: Arc<Connection<C>>,
    adapter: Arc<dyn WriteAdapter<C>>,
    classifier: Classifier,
    policy: RetryPolicy,
    alarm: Arc<dyn Alarm>,
    health: Arc<ChainHealth>,
    stop: CancellationToken,
    completed: Mutex<OrderCache>,
}

impl<C: ChainClient> Writer<C> {
    pub fn new(
        conn: Arc<Connection<C>>,
        adapter: Arc<dyn WriteAdapter<C>>,
        config: WriterConfig,
        alarm: Arc<dyn Alarm>,
        health: Arc<ChainHealth>,
        stop: CancellationToken,
    ) -> Self {
        health.register(conn.chain_id(), conn.name(), Role::Writer);
        Self {
            classifier: Classifier::new(config.ignorable_reasons),
            policy: config.retry,
            completed: Mutex::new(OrderCache::new(
                config.order_cache_size,
                config.order_cache_ttl_secs,
            )),
            conn,
            adapter,
            alarm,
            health,
            stop,
        }
    }

    pub fn connection(&self) -> &Arc<Connection<C>> {
        &self.conn
    }

    fn chain(&self) -> &str {
        self.conn.name()
    }

    fn cached(&self, order_id: Option<B256>) -> bool {
        let Some(id) = order_id else {
            return false;
        };
        self.completed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&id)
    }

    fn remember(&self, order_id: Option<B256>) {
        if let Some(id) = order_id {
            self.completed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(id);
        }
    }

    /// Sleep for `duration`; false when the stop signal fired first
    async fn sleep(&self, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// One pass through CheckDuplicate, AcquireNonceAndGas, Submit and
    /// PollConfirmation
    async fn attempt(
        &self,
        message: &Message,
        call: &TxCall,
        refresh_nonce: bool,
        alarms: &mut AlarmCounter,
    ) -> Result<Outcome, ClientError> {
        if self.cached(message.kind.order_id()) {
            return Ok(Outcome::Duplicate);
        }
        match self.adapter.already_applied(&self.conn, message).await {
            Ok(true) => return Ok(Outcome::Duplicate),
            Ok(false) => {}
            Err(AdapterError::Client(e)) => return Err(e),
            Err(e) => return Err(ClientError::Decode(e.to_string())),
        }

        let tx = {
            let mut lease = self.conn.lock_and_update_gas(refresh_nonce).await?;
            let tx = lease.send(call).await?;
            lease.unlock();
            tx
        };
        metrics::record_transaction_submitted(self.chain(), true);
        info!(
            chain = %self.chain(),
            kind = %message.kind,
            tx_hash = %tx.hash,
            nonce = tx.nonce,
            gas_limit = tx.gas_limit,
            max_gas_price = tx.fees.max_price(),
            "Transaction submitted"
        );

        self.await_receipt(message, call, tx.hash, alarms).await
    }

    /// PollConfirmation. A broadcast transaction is never replaced by one at
    /// a new nonce, so this polls until the hash leaves the mempool.
    async fn await_receipt(
        &self,
        message: &Message,
        call: &TxCall,
        hash: B256,
        alarms: &mut AlarmCounter,
    ) -> Result<Outcome, ClientError> {
        let mut polls: u32 = 0;
        loop {
            if !self.sleep(self.policy.receipt_poll_interval).await {
                return Ok(Outcome::Stopped);
            }
            polls += 1;
            match self.conn.client().transaction_receipt(hash).await {
                Ok(Some(receipt)) if receipt.success => {
                    debug!(
                        chain = %self.chain(),
                        tx_hash = %hash,
                        block = receipt.block_number,
                        "Transaction mined"
                    );
                    return Ok(Outcome::Applied(hash));
                }
                Ok(Some(receipt)) => {
                    warn!(
                        chain = %self.chain(),
                        tx_hash = %hash,
                        block = receipt.block_number,
                        "Transaction reverted, replaying for reason"
                    );
                    return Err(self.revert_reason(call, hash).await);
                }
                Ok(None) => {}
                Err(e) => debug!(chain = %self.chain(), polls, error = %e, "Receipt poll failed"),
            }

            if polls % self.policy.max_receipt_polls.max(1) == 0 {
                warn!(
                    chain = %self.chain(),
                    kind = %message.kind,
                    tx_hash = %hash,
                    polls,
                    "Transaction still pending"
                );
                metrics::record_error(self.chain(), "pending");
                if alarms.record_failure() {
                    self.raise_alarm(format!(
                        "{} transaction {} pending after {} polls",
                        message.kind, hash, polls
                    ))
                    .await;
                }
            }
        }
    }

    async fn revert_reason(&self, call: &TxCall, hash: B256) -> ClientError {
        match self.conn.client().call(self.conn.sender(), call).await {
            Err(e) => e,
            Ok(_) => ClientError::Reverted(format!("transaction {} reverted", hash)),
        }
    }

    async fn raise_alarm(&self, text: String) {
        self.health.mark_alarming(self.conn.chain_id(), Role::Writer);
        self.alarm.notify(self.chain(), &text).await;
    }

    fn finish(&self, message: Message, outcome: &str, started: Instant) {
        let order_id = message.kind.order_id();
        metrics::record_message_completed(
            self.chain(),
            message.kind.name(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        self.remember(order_id);
        self.health.record_success(self.conn.chain_id(), Role::Writer);
        message.complete();
    }
}

#[async_trait]
impl<C: ChainClient> MessageWriter for Writer<C> {
    async fn write(&self, message: Message) {
        let started = Instant::now();
        let chain_id = self.conn.chain_id();

        let call = match self.adapter.encode(&message) {
            Ok(call) => call,
            Err(e) => {
                error!(
                    chain = %self.chain(),
                    source = message.source,
                    kind = %message.kind,
                    error = %e,
                    "Cannot encode message, abandoning"
                );
                metrics::record_error(self.chain(), "encode");
                self.raise_alarm(format!("abandoned {} from {}: {}", message.kind, message.source, e))
                    .await;
                message.abandon();
                return;
            }
        };

        let mut refresh_nonce = false;
        let mut alarms = AlarmCounter::new(self.policy.alarm_threshold);
        loop {
            if self.stop.is_cancelled() {
                info!(chain = %self.chain(), kind = %message.kind, "Stop signal, abandoning message");
                message.abandon();
                return;
            }

            let error = match self.attempt(&message, &call, refresh_nonce, &mut alarms).await {
                Ok(Outcome::Applied(hash)) => {
                    info!(chain = %self.chain(), kind = %message.kind, tx_hash = %hash, "Message applied");
                    self.finish(message, "applied", started);
                    return;
                }
                Ok(Outcome::Duplicate) => {
                    info!(chain = %self.chain(), kind = %message.kind, "Already applied, skipping");
                    self.finish(message, "duplicate", started);
                    return;
                }
                Ok(Outcome::Stopped) => continue,
                Err(e) => e,
            };

            match self.classifier.classify(&error) {
                ErrorClass::Ignorable => {
                    info!(chain = %self.chain(), kind = %message.kind, error = %error, "Ignorable failure, completing");
                    self.finish(message, "ignored", started);
                    return;
                }
                ErrorClass::Fatal => {
                    error!(chain = %self.chain(), kind = %message.kind, error = %error, "Fatal failure, abandoning");
                    metrics::record_error(self.chain(), "fatal");
                    self.raise_alarm(format!("abandoned {}: {}", message.kind, error))
                        .await;
                    message.abandon();
                    return;
                }
                ErrorClass::Retryable { refresh_nonce: refresh } => {
                    refresh_nonce = refresh;
                    metrics::record_error(self.chain(), "submit");
                    let consecutive = self.health.record_failure(chain_id, Role::Writer, &error.to_string());
                    warn!(
                        chain = %self.chain(),
                        kind = %message.kind,
                        error = %error,
                        refresh_nonce,
                        consecutive,
                        "Submission failed, retrying"
                    );
                    if alarms.record_failure() {
                        self.raise_alarm(format!(
                            "{} failed {} times in a row, last: {}",
                            message.kind, self.policy.alarm_threshold, error
                        ))
                        .await;
                    }
                }
            }

            if !self.sleep(self.policy.retry_interval).await {
                info!(chain = %self.chain(), kind = %message.kind, "Stop signal, abandoning message");
                message.abandon();
                return;
            }
        }
    }
}
