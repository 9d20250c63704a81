//! Generic EVM adapter
//!
//! Relays headers into a light client manager on the anchor chain and anchor
//! headers into a light node on every other chain. Events are `MessageOut`
//! logs of each chain's message contract; deliveries call `transferIn` with
//! an ABI-encoded receipt proof.

use std::collections::HashMap;
use std::ops::RangeInclusive;

use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::sol;
use alloy::sol_types::{SolCall, SolEvent, SolValue};
use async_trait::async_trait;
use tracing::debug;

use super::{AdapterError, EventAdapter, EventContext, HeaderAdapter, WriteAdapter};
use crate::connection::{BlockHeader, ChainClient, ChainLog, Connection, LogFilter, TxCall};
use crate::types::{ChainId, HeaderBatch, Message, MessageKind, Proposal, ProofDelivery};

sol! {
    /// Header as submitted to light clients
    struct HeaderData {
        bytes32 parentHash;
        bytes32 stateRoot;
        bytes32 receiptsRoot;
        uint256 number;
        uint256 timestamp;
        bytes32 blockHash;
    }

    /// Receipt inclusion proof as verified by the message contract
    struct ReceiptProof {
        HeaderData header;
        uint256 txIndex;
        uint256 logIndex;
        bytes receipt;
        bytes keyIndex;
        bytes[] proof;
    }

    /// Light client of the anchor chain, deployed on every other chain
    interface ILightNode {
        function headerHeight() external view returns (uint256 height);
        function verifiableHeaderRange() external view returns (uint256 min, uint256 max);
        function updateBlockHeader(bytes calldata headers) external;
    }

    /// Light clients of every chain, deployed on the anchor chain
    interface ILightClientManager {
        function headerHeight(uint256 chainId) external view returns (uint256 height);
        function verifiableHeaderRange(uint256 chainId) external view returns (uint256 min, uint256 max);
        function updateBlockHeader(uint256 chainId, bytes calldata headers) external;
    }

    interface IMessageContract {
        event MessageOut(bytes32 indexed orderId, uint256 indexed fromChain, uint256 indexed toChain, bytes payload);

        function transferIn(uint256 chainId, bytes calldata receiptProof) external;
        function orderList(bytes32 orderId) external view returns (bool applied);
    }

    /// Receipts-root oracle for destinations without a light client
    interface IReceiptOracle {
        function propose(uint256 chainId, uint256 blockNumber, bytes32 receiptsRoot) external;
    }
}

/// Contract addresses of one chain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainContracts {
    pub message_contract: Address,
    /// Light node of the anchor chain; unused on the anchor itself
    pub light_node: Option<Address>,
    /// Set when deliveries to this chain go through a receipts-root oracle
    pub oracle: Option<Address>,
}

pub struct EvmAdapter {
    anchor: ChainId,
    light_client_manager: Address,
    chains: HashMap<ChainId, ChainContracts>,
}

impl EvmAdapter {
    pub fn new(anchor: ChainId, light_client_manager: Address) -> Self {
        Self {
            anchor,
            light_client_manager,
            chains: HashMap::new(),
        }
    }

    pub fn with_chain(mut self, chain_id: ChainId, contracts: ChainContracts) -> Self {
        self.chains.insert(chain_id, contracts);
        self
    }

    fn contracts(&self, chain_id: ChainId) -> Result<&ChainContracts, AdapterError> {
        self.chains
            .get(&chain_id)
            .ok_or(AdapterError::UnknownChain(chain_id))
    }

    fn light_node(&self, chain_id: ChainId) -> Result<Address, AdapterError> {
        self.contracts(chain_id)?
            .light_node
            .ok_or(AdapterError::UnknownChain(chain_id))
    }

    async fn view<C, T>(
        &self,
        conn: &Connection<C>,
        to: Address,
        call: T,
    ) -> Result<T::Return, AdapterError>
    where
        C: ChainClient,
        T: SolCall + Send,
        T::Return: Send,
    {
        let request = TxCall {
            to,
            data: call.abi_encode().into(),
            value: U256::ZERO,
        };
        let output = conn.client().call(conn.sender(), &request).await?;
        T::abi_decode_returns(&output, true).map_err(|e| AdapterError::Encode {
            kind: "view",
            reason: e.to_string(),
        })
    }

    async fn headers<C: ChainClient>(
        &self,
        conn: &Connection<C>,
        range: RangeInclusive<u64>,
    ) -> Result<Vec<HeaderData>, AdapterError> {
        let mut headers = Vec::new();
        for number in range {
            headers.push(header_data(&conn.client().header(number).await?));
        }
        Ok(headers)
    }
}

fn header_data(header: &BlockHeader) -> HeaderData {
    HeaderData {
        parentHash: header.parent_hash,
        stateRoot: header.state_root,
        receiptsRoot: header.receipts_root,
        number: U256::from(header.number),
        timestamp: U256::from(header.timestamp),
        blockHash: header.hash,
    }
}

fn to_u64(value: U256, what: &str) -> Result<u64, AdapterError> {
    u64::try_from(value)
        .map_err(|_| AdapterError::InvalidEvent(format!("{} {} overflows u64", what, value)))
}

fn encode_headers(headers: Vec<HeaderData>) -> Bytes {
    headers.abi_encode().into()
}

#[async_trait]
impl<C: ChainClient> HeaderAdapter<C> for EvmAdapter {
    async fn synced_height(
        &self,
        source: &Connection<C>,
        destination: &Connection<C>,
    ) -> Result<u64, AdapterError> {
        let height = if destination.chain_id() == self.anchor {
            self.view(
                destination,
                self.light_client_manager,
                ILightClientManager::headerHeightCall {
                    chainId: U256::from(source.chain_id()),
                },
            )
            .await?
            .height
        } else {
            self.view(
                destination,
                self.light_node(destination.chain_id())?,
                ILightNode::headerHeightCall {},
            )
            .await?
            .height
        };
        to_u64(height, "header height")
    }

    async fn build_batch(
        &self,
        source: &Connection<C>,
        range: RangeInclusive<u64>,
    ) -> Result<HeaderBatch, AdapterError> {
        let (first_block, last_block) = (*range.start(), *range.end());
        let headers = self.headers(source, range).await?;
        debug!(
            chain = %source.name(),
            first_block,
            last_block,
            "Built header batch"
        );
        Ok(HeaderBatch {
            first_block,
            last_block,
            payload: encode_headers(headers),
        })
    }

    async fn build_anchor_update(
        &self,
        anchor: &Connection<C>,
        destination: ChainId,
        block: u64,
    ) -> Result<HeaderBatch, AdapterError> {
        self.light_node(destination)?;
        let headers = self.headers(anchor, block..=block).await?;
        Ok(HeaderBatch {
            first_block: block,
            last_block: block,
            payload: encode_headers(headers),
        })
    }
}

#[async_trait]
impl<C: ChainClient> EventAdapter<C> for EvmAdapter {
    async fn fetch_logs(
        &self,
        source: &Connection<C>,
        block: u64,
    ) -> Result<Vec<ChainLog>, AdapterError> {
        let contracts = self.contracts(source.chain_id())?;
        let filter = LogFilter {
            from_block: block,
            to_block: block,
            addresses: vec![contracts.message_contract],
            topics: vec![IMessageContract::MessageOut::SIGNATURE_HASH],
        };
        let mut logs = source.client().logs(&filter).await?;
        logs.sort_by_key(|log| log.log_index);
        Ok(logs)
    }

    fn destination(&self, log: &ChainLog) -> Result<ChainId, AdapterError> {
        let topic = log
            .topics
            .get(3)
            .ok_or_else(|| AdapterError::InvalidEvent("MessageOut without toChain".into()))?;
        to_u64(U256::from_be_bytes(topic.0), "toChain")
    }

    async fn verifiable_range(
        &self,
        source: ChainId,
        destination: &Connection<C>,
    ) -> Result<RangeInclusive<u64>, AdapterError> {
        let (min, max) = if destination.chain_id() == self.anchor {
            let range = self
                .view(
                    destination,
                    self.light_client_manager,
                    ILightClientManager::verifiableHeaderRangeCall {
                        chainId: U256::from(source),
                    },
                )
                .await?;
            (range.min, range.max)
        } else {
            let range = self
                .view(
                    destination,
                    self.light_node(destination.chain_id())?,
                    ILightNode::verifiableHeaderRangeCall {},
                )
                .await?;
            (range.min, range.max)
        };
        Ok(to_u64(min, "range min")?..=to_u64(max, "range max")?)
    }

    fn assemble(&self, event: EventContext<'_>) -> Result<MessageKind, AdapterError> {
        let order_id = event
            .log
            .topics
            .get(1)
            .copied()
            .ok_or_else(|| AdapterError::InvalidEvent("MessageOut without orderId".into()))?;

        if let Some(oracle_target) = self
            .chains
            .get(&event.destination)
            .and_then(|c| c.oracle)
        {
            debug!(oracle = %oracle_target, order_id = %order_id, "Proposing receipts root");
            return Ok(MessageKind::Proposal(Proposal {
                block_number: event.header.number,
                receipts_root: event.header.receipts_root,
                payload: Bytes::new(),
            }));
        }

        let proof = ReceiptProof {
            header: header_data(event.header),
            txIndex: U256::from(event.log.tx_index),
            logIndex: U256::from(event.log.log_index),
            receipt: event.receipt.clone(),
            keyIndex: event.proof.key_path.clone(),
            proof: event.proof.nodes.clone(),
        };
        let delivery = ProofDelivery {
            order_id,
            block_number: event.log.block_number,
            tx_hash: event.log.tx_hash,
            log_index: event.log.log_index,
            payload: proof.abi_encode().into(),
            method: Some("transferIn".to_string()),
            proof: event.proof,
        };
        Ok(if event.from_anchor {
            MessageKind::DeliverWithAnchorProof(delivery)
        } else {
            MessageKind::DeliverWithProof(delivery)
        })
    }
}

#[async_trait]
impl<C: ChainClient> WriteAdapter<C> for EvmAdapter {
    fn encode(&self, message: &Message) -> Result<TxCall, AdapterError> {
        let source = U256::from(message.source);
        let (to, data) = match &message.kind {
            MessageKind::SyncToAnchor(batch) => (
                self.light_client_manager,
                ILightClientManager::updateBlockHeaderCall {
                    chainId: source,
                    headers: batch.payload.clone(),
                }
                .abi_encode(),
            ),
            MessageKind::SyncFromAnchor(batch) => (
                self.light_node(message.destination)?,
                ILightNode::updateBlockHeaderCall {
                    headers: batch.payload.clone(),
                }
                .abi_encode(),
            ),
            MessageKind::DeliverWithProof(delivery)
            | MessageKind::DeliverWithAnchorProof(delivery) => {
                if delivery.payload.is_empty() {
                    return Err(AdapterError::Encode {
                        kind: message.kind.name(),
                        reason: "empty proof payload".into(),
                    });
                }
                (
                    self.contracts(message.destination)?.message_contract,
                    IMessageContract::transferInCall {
                        chainId: source,
                        receiptProof: delivery.payload.clone(),
                    }
                    .abi_encode(),
                )
            }
            MessageKind::Proposal(proposal) => {
                let oracle = self
                    .contracts(message.destination)?
                    .oracle
                    .ok_or_else(|| AdapterError::Encode {
                        kind: message.kind.name(),
                        reason: format!("chain {} has no oracle", message.destination),
                    })?;
                (
                    oracle,
                    IReceiptOracle::proposeCall {
                        chainId: source,
                        blockNumber: U256::from(proposal.block_number),
                        receiptsRoot: proposal.receipts_root,
                    }
                    .abi_encode(),
                )
            }
        };
        Ok(TxCall {
            to,
            data: data.into(),
            value: U256::ZERO,
        })
    }

    async fn already_applied(
        &self,
        destination: &Connection<C>,
        message: &Message,
    ) -> Result<bool, AdapterError> {
        match &message.kind {
            MessageKind::DeliverWithProof(delivery)
            | MessageKind::DeliverWithAnchorProof(delivery) => {
                let target = self.contracts(destination.chain_id())?.message_contract;
                Ok(self
                    .view(
                        destination,
                        target,
                        IMessageContract::orderListCall {
                            orderId: delivery.order_id,
                        },
                    )
                    .await?
                    .applied)
            }
            MessageKind::SyncToAnchor(batch) => {
                let height = self
                    .view(
                        destination,
                        self.light_client_manager,
                        ILightClientManager::headerHeightCall { chainId: U256::from(message.source) },
                    )
                    .await?
                    .height;
                Ok(height >= U256::from(batch.last_block))
            }
            MessageKind::SyncFromAnchor(batch) => {
                let height = self
                    .view(
                        destination,
                        self.light_node(destination.chain_id())?,
                        ILightNode::headerHeightCall {},
                    )
                    .await?
                    .height;
                Ok(height >= U256::from(batch.last_block))
            }
            MessageKind::Proposal(_) => Ok(false),
        }
    }
}

/// Topic of `MessageOut`, for tests and tooling that emit synthetic logs
pub fn message_out_topic() -> B256 {
    IMessageContract::MessageOut::SIGNATURE_HASH
}
