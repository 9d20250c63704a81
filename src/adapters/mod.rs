//! Per-chain hooks consumed by the sync loops and the writer
//!
//! The engine never encodes chain-specific data itself. Header batches,
//! message payloads and destination calls all come from these traits.

pub mod evm;

use std::ops::RangeInclusive;

use alloy::primitives::Bytes;
use async_trait::async_trait;

pub use evm::{ChainContracts, EvmAdapter};

use crate::connection::{BlockHeader, ChainClient, ChainLog, ClientError, Connection, TxCall};
use crate::proof::{InclusionProof, ProofError};
use crate::types::{ChainId, HeaderBatch, Message, MessageKind};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AdapterError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Proof(#[from] ProofError),
    #[error("cannot encode {kind}: {reason}")]
    Encode { kind: &'static str, reason: String },
    #[error("invalid event: {0}")]
    InvalidEvent(String),
    #[error("chain {0} is not configured")]
    UnknownChain(ChainId),
}

/// Everything the event adapter needs to turn one log into a message
#[derive(Debug, Clone)]
pub struct EventContext<'a> {
    pub source: ChainId,
    pub destination: ChainId,
    pub log: &'a ChainLog,
    pub header: &'a BlockHeader,
    pub proof: InclusionProof,
    /// Encoded receipt proven by `proof`
    pub receipt: Bytes,
    pub from_anchor: bool,
}

#[async_trait]
pub trait HeaderAdapter<C: ChainClient>: Send + Sync + 'static {
    /// Height of `source` headers accepted by the light client on
    /// `destination`
    async fn synced_height(
        &self,
        source: &Connection<C>,
        destination: &Connection<C>,
    ) -> Result<u64, AdapterError>;

    /// Encode the headers of `range` for the anchor chain's light client
    async fn build_batch(
        &self,
        source: &Connection<C>,
        range: RangeInclusive<u64>,
    ) -> Result<HeaderBatch, AdapterError>;

    /// Anchor-chain update for the light client on `destination`
    async fn build_anchor_update(
        &self,
        anchor: &Connection<C>,
        destination: ChainId,
        block: u64,
    ) -> Result<HeaderBatch, AdapterError>;
}

#[async_trait]
pub trait EventAdapter<C: ChainClient>: Send + Sync + 'static {
    /// Cross-chain events emitted in `block`, in log order
    async fn fetch_logs(
        &self,
        source: &Connection<C>,
        block: u64,
    ) -> Result<Vec<ChainLog>, AdapterError>;

    /// Final destination encoded in the event
    fn destination(&self, log: &ChainLog) -> Result<ChainId, AdapterError>;

    /// Blocks of `source` the light client on `destination` can verify
    async fn verifiable_range(
        &self,
        source: ChainId,
        destination: &Connection<C>,
    ) -> Result<RangeInclusive<u64>, AdapterError>;

    fn assemble(&self, event: EventContext<'_>) -> Result<MessageKind, AdapterError>;
}

#[async_trait]
pub trait WriteAdapter<C: ChainClient>: Send + Sync + 'static {
    /// Contract call that applies `message` on its destination
    fn encode(&self, message: &Message) -> Result<TxCall, AdapterError>;

    /// True when the destination already carries the effect of `message`
    async fn already_applied(
        &self,
        destination: &Connection<C>,
        message: &Message,
    ) -> Result<bool, AdapterError>;
}
