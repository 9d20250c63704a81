//! Chain connection: a `ChainClient` handle plus the nonce/gas critical
//! section every transaction submission goes through.
//!
//! Exactly one [`GasLease`] can exist per connection at a time. The lease
//! holds the connection's async mutex from nonce/fee acquisition until the
//! signed transaction has been broadcast, so concurrent writers targeting the
//! same chain never race on a nonce.

pub mod error;
pub mod evm;
pub mod gas;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy::eips::eip2718::Encodable2718;
use alloy::network::{EthereumWallet, TransactionBuilder};
use alloy::primitives::{Address, Bytes, B256, U256};
use alloy::rpc::types::TransactionRequest;
use alloy::signers::local::PrivateKeySigner;
use async_trait::async_trait;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

pub use error::ClientError;
pub use gas::{FeeQuote, GasPolicy};

use crate::proof::Receipt;
use crate::types::ChainId;

/// Header fields the relayer needs from a block
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub number: u64,
    pub hash: B256,
    pub parent_hash: B256,
    pub receipts_root: B256,
    pub state_root: B256,
    pub timestamp: u64,
    pub base_fee_per_gas: Option<u128>,
}

/// Log query over an inclusive block range
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LogFilter {
    pub from_block: u64,
    pub to_block: u64,
    pub addresses: Vec<Address>,
    /// Accepted values for topic 0; empty matches any
    pub topics: Vec<B256>,
}

/// A log together with its position in the chain
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChainLog {
    pub address: Address,
    pub topics: Vec<B256>,
    pub data: Bytes,
    pub block_number: u64,
    pub tx_hash: B256,
    pub tx_index: u64,
    pub log_index: u64,
}

/// Contract call target
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TxCall {
    pub to: Address,
    pub data: Bytes,
    pub value: U256,
}

/// Mined transaction outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxReceipt {
    pub block_number: u64,
    pub success: bool,
}

/// A signed and broadcast transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxAttempt {
    pub nonce: u64,
    pub fees: FeeQuote,
    pub gas_limit: u64,
    pub raw: Bytes,
    pub hash: B256,
}

/// Node access used by the sync loops and the writer
#[async_trait]
pub trait ChainClient: Send + Sync + 'static {
    async fn chain_id(&self) -> Result<u64, ClientError>;

    async fn block_number(&self) -> Result<u64, ClientError>;

    async fn header(&self, number: u64) -> Result<BlockHeader, ClientError>;

    /// Receipts of every transaction in the block, in transaction order
    async fn block_receipts(&self, number: u64) -> Result<Vec<Receipt>, ClientError>;

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>, ClientError>;

    async fn pending_nonce(&self, address: Address) -> Result<u64, ClientError>;

    async fn gas_price(&self) -> Result<u128, ClientError>;

    /// Latest base fee, `None` on chains without EIP-1559
    async fn base_fee(&self) -> Result<Option<u128>, ClientError>;

    async fn max_priority_fee(&self) -> Result<u128, ClientError>;

    async fn estimate_gas(&self, from: Address, call: &TxCall) -> Result<u64, ClientError>;

    /// `eth_call` against the latest block
    async fn call(&self, from: Address, call: &TxCall) -> Result<Bytes, ClientError>;

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ClientError>;

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ClientError>;

    async fn code_at(&self, address: Address) -> Result<Bytes, ClientError>;
}

/// Nonce cache guarded by the connection mutex
#[derive(Debug, Default)]
struct TxOpts {
    nonce: Option<u64>,
}

/// One chain's client, signer and gas policy
pub struct Connection<C> {
    chain_id: ChainId,
    name: String,
    client: Arc<C>,
    wallet: EthereumWallet,
    sender: Address,
    gas: GasPolicy,
    opts: Mutex<TxOpts>,
    closed: AtomicBool,
}

impl<C: ChainClient> Connection<C> {
    pub fn new(
        chain_id: ChainId,
        name: impl Into<String>,
        client: C,
        signer: PrivateKeySigner,
        gas: GasPolicy,
    ) -> Self {
        let sender = signer.address();
        Self {
            chain_id,
            name: name.into(),
            client: Arc::new(client),
            wallet: EthereumWallet::from(signer),
            sender,
            gas,
            opts: Mutex::new(TxOpts::default()),
            closed: AtomicBool::new(false),
        }
    }

    /// Verify the node serves the configured chain
    pub async fn connect(&self) -> eyre::Result<()> {
        let remote = self.client.chain_id().await?;
        if remote != self.chain_id {
            eyre::bail!(
                "{}: node reports chain id {} but {} is configured",
                self.name,
                remote,
                self.chain_id
            );
        }
        let latest = self.client.block_number().await?;
        info!(
            chain = %self.name,
            chain_id = self.chain_id,
            signer = %self.sender,
            latest_block = latest,
            "Connected"
        );
        Ok(())
    }

    pub fn chain_id(&self) -> ChainId {
        self.chain_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sender(&self) -> Address {
        self.sender
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    pub async fn latest_block(&self) -> Result<u64, ClientError> {
        self.client.block_number().await
    }

    pub async fn is_contract(&self, address: Address) -> Result<bool, ClientError> {
        Ok(!self.client.code_at(address).await?.is_empty())
    }

    /// Refuse further leases. In-flight leases finish normally.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(chain = %self.name, "Connection closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Enter the nonce/gas critical section.
    ///
    /// The nonce is re-read from the pending count when `refresh_nonce` is set
    /// or nothing is cached yet. Fees are quoted fresh on every call.
    pub async fn lock_and_update_gas(
        &self,
        refresh_nonce: bool,
    ) -> Result<GasLease<'_, C>, ClientError> {
        if self.is_closed() {
            return Err(ClientError::Transport(format!("{} connection closed", self.name)));
        }

        let mut guard = self.opts.lock().await;
        let nonce = match guard.nonce {
            Some(nonce) if !refresh_nonce => nonce,
            cached => {
                let fresh = self.client.pending_nonce(self.sender).await?;
                if cached.is_some() && cached != Some(fresh) {
                    debug!(chain = %self.name, cached = ?cached, fresh, "Nonce refreshed");
                }
                guard.nonce = Some(fresh);
                fresh
            }
        };
        let fees = self.quote_fees().await?;

        Ok(GasLease {
            guard,
            conn: self,
            nonce,
            fees,
        })
    }

    async fn quote_fees(&self) -> Result<FeeQuote, ClientError> {
        if !self.gas.legacy_only {
            if let Some(base_fee) = self.client.base_fee().await? {
                let tip = match self.client.max_priority_fee().await {
                    Ok(tip) => tip,
                    Err(ClientError::Rpc { message, .. }) => {
                        // Nodes without eth_maxPriorityFeePerGas
                        debug!(chain = %self.name, error = %message, "Deriving tip from gas price");
                        self.client.gas_price().await?.saturating_sub(base_fee)
                    }
                    Err(e) => return Err(e),
                };
                return Ok(self.gas.eip1559(base_fee, tip));
            }
        }
        Ok(self.gas.legacy(self.client.gas_price().await?))
    }
}

/// Exclusive nonce/gas lease. Dropping it releases the connection.
pub struct GasLease<'a, C> {
    guard: MutexGuard<'a, TxOpts>,
    conn: &'a Connection<C>,
    nonce: u64,
    fees: FeeQuote,
}

impl<C: ChainClient> GasLease<'_, C> {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    pub fn fees(&self) -> FeeQuote {
        self.fees
    }

    /// Estimate, sign and broadcast `call` with the leased nonce and fees.
    ///
    /// The cached nonce advances only after the node accepted the
    /// transaction.
    pub async fn send(&mut self, call: &TxCall) -> Result<TxAttempt, ClientError> {
        let conn = self.conn;
        let estimate = conn.client.estimate_gas(conn.sender, call).await?;
        let gas_limit = conn.gas.gas_limit(estimate);

        let request = TransactionRequest::default()
            .with_from(conn.sender)
            .with_to(call.to)
            .with_input(call.data.clone())
            .with_value(call.value)
            .with_chain_id(conn.chain_id)
            .with_nonce(self.nonce)
            .with_gas_limit(gas_limit);
        let request = match self.fees {
            FeeQuote::Legacy { gas_price } => request.with_gas_price(gas_price),
            FeeQuote::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => request
                .with_max_fee_per_gas(max_fee_per_gas)
                .with_max_priority_fee_per_gas(max_priority_fee_per_gas),
        };

        let envelope = request
            .build(&conn.wallet)
            .await
            .map_err(|e| ClientError::Signing(e.to_string()))?;
        let raw = Bytes::from(envelope.encoded_2718());
        let hash = *envelope.tx_hash();

        let accepted = conn.client.send_raw_transaction(raw.clone()).await?;
        if accepted != hash {
            warn!(chain = %conn.name, local = %hash, node = %accepted, "Node returned a different tx hash");
        }
        self.guard.nonce = Some(self.nonce + 1);

        Ok(TxAttempt {
            nonce: self.nonce,
            fees: self.fees,
            gas_limit,
            raw,
            hash,
        })
    }

    pub fn unlock(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_signer, MockClient};

    fn connection(client: MockClient) -> Connection<MockClient> {
        Connection::new(7, "test", client, test_signer(), GasPolicy::default())
    }

    fn call() -> TxCall {
        TxCall {
            to: Address::repeat_byte(0x11),
            data: Bytes::from_static(&[0xde, 0xad]),
            value: U256::ZERO,
        }
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_chain() {
        let client = MockClient::new(8);
        assert!(connection(client).connect().await.is_err());

        let client = MockClient::new(7);
        connection(client).connect().await.unwrap();
    }

    #[tokio::test]
    async fn test_lease_commits_nonce_after_broadcast() {
        let client = MockClient::new(7);
        client.set_pending_nonce(5);
        let conn = connection(client);

        let mut lease = conn.lock_and_update_gas(false).await.unwrap();
        assert_eq!(lease.nonce(), 5);
        let attempt = lease.send(&call()).await.unwrap();
        assert_eq!(attempt.nonce, 5);
        lease.unlock();

        let lease = conn.lock_and_update_gas(false).await.unwrap();
        assert_eq!(lease.nonce(), 6);
    }

    #[tokio::test]
    async fn test_failed_broadcast_keeps_nonce() {
        let client = MockClient::new(7);
        client.set_pending_nonce(3);
        client.push_send_error(ClientError::Transport("eof".into()));
        let conn = connection(client);

        let mut lease = conn.lock_and_update_gas(false).await.unwrap();
        assert!(lease.send(&call()).await.is_err());
        drop(lease);

        let lease = conn.lock_and_update_gas(false).await.unwrap();
        assert_eq!(lease.nonce(), 3);
    }

    #[tokio::test]
    async fn test_refresh_rereads_pending_nonce() {
        let client = MockClient::new(7);
        client.set_pending_nonce(1);
        let conn = connection(client);

        conn.lock_and_update_gas(false).await.unwrap().unlock();
        conn.client().set_pending_nonce(9);
        assert_eq!(conn.lock_and_update_gas(false).await.unwrap().nonce(), 1);
        assert_eq!(conn.lock_and_update_gas(true).await.unwrap().nonce(), 9);
    }

    #[tokio::test]
    async fn test_quote_uses_base_fee_when_available() {
        let client = MockClient::new(7);
        client.set_fees(10, Some(30), 2);
        let conn = connection(client);
        assert_eq!(
            conn.lock_and_update_gas(false).await.unwrap().fees(),
            FeeQuote::Eip1559 {
                max_fee_per_gas: 62,
                max_priority_fee_per_gas: 2,
            }
        );

        conn.client().set_fees(10, None, 2);
        assert_eq!(
            conn.lock_and_update_gas(false).await.unwrap().fees(),
            FeeQuote::Legacy { gas_price: 10 }
        );
    }

    #[tokio::test]
    async fn test_closed_connection_refuses_lease() {
        let conn = connection(MockClient::new(7));
        conn.close();
        assert!(conn.lock_and_update_gas(false).await.is_err());
    }

    #[tokio::test]
    async fn test_is_contract() {
        let client = MockClient::new(7);
        client.set_code(Address::repeat_byte(1), Bytes::from_static(&[0x60]));
        let conn = connection(client);
        assert!(conn.is_contract(Address::repeat_byte(1)).await.unwrap());
        assert!(!conn.is_contract(Address::repeat_byte(2)).await.unwrap());
    }
}
