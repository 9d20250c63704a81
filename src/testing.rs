//! In-memory doubles for unit and integration tests
//!
//! Compiled for `cfg(test)` and behind the `testing` feature so the tests/
//! directory can drive whole loops without a node.

use std::collections::{HashMap, VecDeque};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use alloy::consensus::{Transaction, TxEnvelope};
use alloy::eips::eip2718::Decodable2718;
use alloy::primitives::{keccak256, Address, Bytes, B256};
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;

use crate::adapters::{AdapterError, EventAdapter, EventContext, HeaderAdapter, WriteAdapter};
use crate::alarm::Alarm;
use crate::connection::{
    BlockHeader, ChainClient, ChainLog, ClientError, Connection, LogFilter, TxCall, TxReceipt,
};
use crate::proof::Receipt;
use crate::types::{ChainId, Completion, HeaderBatch, Message, MessageKind, ProofDelivery};
use crate::writers::MessageWriter;

/// Well-known development key (anvil account #0)
pub const TEST_PRIVATE_KEY: &str =
    "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80";

pub fn test_signer() -> PrivateKeySigner {
    TEST_PRIVATE_KEY
        .parse()
        .expect("test key is a valid secp256k1 scalar")
}

/// How mined transactions are reported by [`MockClient`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    Success,
    Reverted,
    /// Never mined
    Pending,
}

#[derive(Debug)]
struct MockState {
    latest: u64,
    block_number_errors: VecDeque<ClientError>,
    pending_nonce: u64,
    gas_price: u128,
    base_fee: Option<u128>,
    tip: u128,
    headers: HashMap<u64, BlockHeader>,
    receipts: HashMap<u64, Vec<Receipt>>,
    logs: Vec<ChainLog>,
    code: HashMap<Address, Bytes>,
    calls: HashMap<(Address, [u8; 4]), Result<Bytes, ClientError>>,
    estimate_errors: VecDeque<ClientError>,
    send_errors: VecDeque<ClientError>,
    tx_status: TxStatus,
    sent: Vec<Bytes>,
    nonces_seen: Vec<u64>,
}

/// Scriptable [`ChainClient`]
#[derive(Debug)]
pub struct MockClient {
    chain_id: u64,
    state: Mutex<MockState>,
    nonce_reads: AtomicUsize,
}

impl MockClient {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(MockState {
                latest: 0,
                block_number_errors: VecDeque::new(),
                pending_nonce: 0,
                gas_price: 1_000_000_000,
                base_fee: None,
                tip: 0,
                headers: HashMap::new(),
                receipts: HashMap::new(),
                logs: Vec::new(),
                code: HashMap::new(),
                calls: HashMap::new(),
                estimate_errors: VecDeque::new(),
                send_errors: VecDeque::new(),
                tx_status: TxStatus::Success,
                sent: Vec::new(),
                nonces_seen: Vec::new(),
            }),
            nonce_reads: AtomicUsize::new(0),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_latest(&self, block: u64) {
        self.state().latest = block;
    }

    /// Fail the next `times` block number queries with `error`
    pub fn fail_block_number(&self, times: usize, error: ClientError) {
        let mut state = self.state();
        for _ in 0..times {
            state.block_number_errors.push_back(error.clone());
        }
    }

    pub fn set_pending_nonce(&self, nonce: u64) {
        self.state().pending_nonce = nonce;
    }

    /// Number of pending-nonce reads so far
    pub fn nonce_reads(&self) -> usize {
        self.nonce_reads.load(Ordering::SeqCst)
    }

    pub fn set_fees(&self, gas_price: u128, base_fee: Option<u128>, tip: u128) {
        let mut state = self.state();
        state.gas_price = gas_price;
        state.base_fee = base_fee;
        state.tip = tip;
    }

    pub fn set_code(&self, address: Address, code: Bytes) {
        self.state().code.insert(address, code);
    }

    pub fn set_header(&self, header: BlockHeader) {
        self.state().headers.insert(header.number, header);
    }

    pub fn set_receipts(&self, block: u64, receipts: Vec<Receipt>) {
        self.state().receipts.insert(block, receipts);
    }

    pub fn push_log(&self, log: ChainLog) {
        self.state().logs.push(log);
    }

    /// Script the `eth_call` result for `selector` on `to`
    pub fn set_call(&self, to: Address, selector: [u8; 4], result: Result<Bytes, ClientError>) {
        self.state().calls.insert((to, selector), result);
    }

    pub fn push_estimate_error(&self, error: ClientError) {
        self.state().estimate_errors.push_back(error);
    }

    pub fn push_send_error(&self, error: ClientError) {
        self.state().send_errors.push_back(error);
    }

    pub fn set_tx_status(&self, status: TxStatus) {
        self.state().tx_status = status;
    }

    /// Raw transactions accepted so far
    pub fn sent(&self) -> Vec<Bytes> {
        self.state().sent.clone()
    }

    /// Nonces of the accepted transactions, in send order
    pub fn sent_nonces(&self) -> Vec<u64> {
        self.state().nonces_seen.clone()
    }
}

#[async_trait]
impl ChainClient for MockClient {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        Ok(self.chain_id)
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        let mut state = self.state();
        match state.block_number_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(state.latest),
        }
    }

    async fn header(&self, number: u64) -> Result<BlockHeader, ClientError> {
        let state = self.state();
        Ok(state.headers.get(&number).cloned().unwrap_or(BlockHeader {
            number,
            hash: keccak256(number.to_be_bytes()),
            ..Default::default()
        }))
    }

    async fn block_receipts(&self, number: u64) -> Result<Vec<Receipt>, ClientError> {
        Ok(self.state().receipts.get(&number).cloned().unwrap_or_default())
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>, ClientError> {
        let state = self.state();
        Ok(state
            .logs
            .iter()
            .filter(|log| (filter.from_block..=filter.to_block).contains(&log.block_number))
            .filter(|log| filter.addresses.is_empty() || filter.addresses.contains(&log.address))
            .filter(|log| {
                filter.topics.is_empty()
                    || log.topics.first().is_some_and(|t| filter.topics.contains(t))
            })
            .cloned()
            .collect())
    }

    async fn pending_nonce(&self, _address: Address) -> Result<u64, ClientError> {
        self.nonce_reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.state().pending_nonce)
    }

    async fn gas_price(&self) -> Result<u128, ClientError> {
        Ok(self.state().gas_price)
    }

    async fn base_fee(&self) -> Result<Option<u128>, ClientError> {
        Ok(self.state().base_fee)
    }

    async fn max_priority_fee(&self) -> Result<u128, ClientError> {
        Ok(self.state().tip)
    }

    async fn estimate_gas(&self, _from: Address, _call: &TxCall) -> Result<u64, ClientError> {
        match self.state().estimate_errors.pop_front() {
            Some(e) => Err(e),
            None => Ok(100_000),
        }
    }

    async fn call(&self, _from: Address, call: &TxCall) -> Result<Bytes, ClientError> {
        let state = self.state();
        let selector = call
            .data
            .get(..4)
            .and_then(|s| <[u8; 4]>::try_from(s).ok())
            .unwrap_or_default();
        state
            .calls
            .get(&(call.to, selector))
            .cloned()
            .unwrap_or_else(|| Ok(Bytes::new()))
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ClientError> {
        let mut state = self.state();
        if let Some(e) = state.send_errors.pop_front() {
            return Err(e);
        }
        let envelope = TxEnvelope::decode_2718(&mut raw.as_ref())
            .map_err(|e| ClientError::Decode(e.to_string()))?;
        state.nonces_seen.push(envelope.nonce());
        state.pending_nonce = state.pending_nonce.max(envelope.nonce() + 1);
        let hash = keccak256(&raw);
        state.sent.push(raw);
        Ok(hash)
    }

    async fn transaction_receipt(&self, _hash: B256) -> Result<Option<TxReceipt>, ClientError> {
        let state = self.state();
        Ok(match state.tx_status {
            TxStatus::Pending => None,
            status => Some(TxReceipt {
                block_number: state.latest,
                success: status == TxStatus::Success,
            }),
        })
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ClientError> {
        Ok(self.state().code.get(&address).cloned().unwrap_or_default())
    }
}

pub fn mock_connection(chain_id: ChainId, name: &str) -> Arc<Connection<MockClient>> {
    Arc::new(Connection::new(
        chain_id,
        name,
        MockClient::new(chain_id),
        test_signer(),
        Default::default(),
    ))
}

/// A header batch message covering blocks 1..=12
pub fn header_message(source: ChainId, destination: ChainId, completion: Completion) -> Message {
    Message::new(
        source,
        destination,
        MessageKind::SyncToAnchor(HeaderBatch {
            first_block: 1,
            last_block: 12,
            payload: Bytes::new(),
        }),
        completion,
    )
}

/// A proof delivery message carrying `order_id`
pub fn delivery_message(
    source: ChainId,
    destination: ChainId,
    order_id: B256,
    completion: Completion,
) -> Message {
    Message::new(
        source,
        destination,
        MessageKind::DeliverWithProof(ProofDelivery {
            proof: Default::default(),
            order_id,
            block_number: 1,
            tx_hash: B256::ZERO,
            log_index: 0,
            payload: Bytes::from_static(&[0x01]),
            method: None,
        }),
        completion,
    )
}

/// What a [`RecordingWriter`] saw of one message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeenMessage {
    pub source: ChainId,
    pub destination: ChainId,
    pub kind: MessageKind,
}

/// Writer that records every message and completes it immediately
#[derive(Debug, Default)]
pub struct RecordingWriter {
    seen: Mutex<Vec<SeenMessage>>,
    /// Hold messages instead of completing them
    hold: bool,
    held: Mutex<Vec<Message>>,
}

impl RecordingWriter {
    /// A writer that keeps messages pending until [`RecordingWriter::release`]
    pub fn holding() -> Self {
        Self {
            hold: true,
            ..Default::default()
        }
    }

    pub fn seen(&self) -> Vec<SeenMessage> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn held(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Complete every held message
    pub fn release(&self) {
        let held: Vec<_> = self
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for message in held {
            message.complete();
        }
    }
}

#[async_trait]
impl MessageWriter for RecordingWriter {
    async fn write(&self, message: Message) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(SeenMessage {
                source: message.source,
                destination: message.destination,
                kind: message.kind.clone(),
            });
        if self.hold {
            self.held
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(message);
        } else {
            message.complete();
        }
    }
}

/// Alarm sink that keeps every alarm
#[derive(Debug, Default)]
pub struct RecordingAlarm {
    alarms: Mutex<Vec<(String, String)>>,
}

impl RecordingAlarm {
    pub fn alarms(&self) -> Vec<(String, String)> {
        self.alarms.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait]
impl Alarm for RecordingAlarm {
    async fn notify(&self, chain: &str, message: &str) {
        self.alarms
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((chain.to_string(), message.to_string()));
    }
}

/// Scriptable adapter for all three hooks
#[derive(Debug)]
pub struct MockAdapter {
    synced_height: Mutex<HashMap<ChainId, u64>>,
    verifiable: Mutex<RangeInclusive<u64>>,
    applied: Mutex<Vec<B256>>,
    encode_error: Mutex<Option<AdapterError>>,
    batches: Mutex<Vec<RangeInclusive<u64>>>,
    updates: Mutex<Vec<(ChainId, u64)>>,
    target: Address,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self {
            synced_height: Mutex::new(HashMap::new()),
            verifiable: Mutex::new(0..=u64::MAX),
            applied: Mutex::new(Vec::new()),
            encode_error: Mutex::new(None),
            batches: Mutex::new(Vec::new()),
            updates: Mutex::new(Vec::new()),
            target: Address::repeat_byte(0xcc),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MockAdapter {
    /// Height the light client on `destination` reports for any source
    pub fn set_synced_height(&self, destination: ChainId, height: u64) {
        lock(&self.synced_height).insert(destination, height);
    }

    pub fn set_verifiable_range(&self, range: RangeInclusive<u64>) {
        *lock(&self.verifiable) = range;
    }

    /// Report `order_id` as already applied on every destination
    pub fn mark_applied(&self, order_id: B256) {
        lock(&self.applied).push(order_id);
    }

    pub fn fail_encode(&self, error: AdapterError) {
        *lock(&self.encode_error) = Some(error);
    }

    /// Ranges passed to `build_batch`
    pub fn batches(&self) -> Vec<RangeInclusive<u64>> {
        lock(&self.batches).clone()
    }

    /// (destination, block) pairs passed to `build_anchor_update`
    pub fn updates(&self) -> Vec<(ChainId, u64)> {
        lock(&self.updates).clone()
    }
}

#[async_trait]
impl<C: ChainClient> HeaderAdapter<C> for MockAdapter {
    async fn synced_height(
        &self,
        _source: &Connection<C>,
        destination: &Connection<C>,
    ) -> Result<u64, AdapterError> {
        Ok(lock(&self.synced_height)
            .get(&destination.chain_id())
            .copied()
            .unwrap_or(0))
    }

    async fn build_batch(
        &self,
        _source: &Connection<C>,
        range: RangeInclusive<u64>,
    ) -> Result<HeaderBatch, AdapterError> {
        lock(&self.batches).push(range.clone());
        Ok(HeaderBatch {
            first_block: *range.start(),
            last_block: *range.end(),
            payload: Bytes::from_static(&[0xbb]),
        })
    }

    async fn build_anchor_update(
        &self,
        _anchor: &Connection<C>,
        destination: ChainId,
        block: u64,
    ) -> Result<HeaderBatch, AdapterError> {
        lock(&self.updates).push((destination, block));
        Ok(HeaderBatch {
            first_block: block,
            last_block: block,
            payload: Bytes::from_static(&[0xbb]),
        })
    }
}

#[async_trait]
impl<C: ChainClient> EventAdapter<C> for MockAdapter {
    async fn fetch_logs(
        &self,
        source: &Connection<C>,
        block: u64,
    ) -> Result<Vec<ChainLog>, AdapterError> {
        let filter = LogFilter {
            from_block: block,
            to_block: block,
            ..Default::default()
        };
        Ok(source.client().logs(&filter).await?)
    }

    /// Destination is the low 8 bytes of topic 1
    fn destination(&self, log: &ChainLog) -> Result<ChainId, AdapterError> {
        let topic = log
            .topics
            .get(1)
            .ok_or_else(|| AdapterError::InvalidEvent("missing destination topic".into()))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&topic[24..]);
        Ok(u64::from_be_bytes(raw))
    }

    async fn verifiable_range(
        &self,
        _source: ChainId,
        _destination: &Connection<C>,
    ) -> Result<RangeInclusive<u64>, AdapterError> {
        Ok(lock(&self.verifiable).clone())
    }

    fn assemble(&self, event: EventContext<'_>) -> Result<MessageKind, AdapterError> {
        let delivery = ProofDelivery {
            proof: event.proof,
            order_id: keccak256(
                [event.log.tx_hash.as_slice(), &event.log.log_index.to_be_bytes()].concat(),
            ),
            block_number: event.header.number,
            tx_hash: event.log.tx_hash,
            log_index: event.log.log_index,
            payload: event.receipt,
            method: None,
        };
        Ok(if event.from_anchor {
            MessageKind::DeliverWithAnchorProof(delivery)
        } else {
            MessageKind::DeliverWithProof(delivery)
        })
    }
}

#[async_trait]
impl<C: ChainClient> WriteAdapter<C> for MockAdapter {
    fn encode(&self, message: &Message) -> Result<TxCall, AdapterError> {
        if let Some(e) = lock(&self.encode_error).clone() {
            return Err(e);
        }
        Ok(TxCall {
            to: self.target,
            data: Bytes::from(message.kind.name().as_bytes().to_vec()),
            ..Default::default()
        })
    }

    async fn already_applied(
        &self,
        _destination: &Connection<C>,
        message: &Message,
    ) -> Result<bool, AdapterError> {
        Ok(message
            .kind
            .order_id()
            .is_some_and(|id| lock(&self.applied).contains(&id)))
    }
}
