//! EVM chain client over alloy HTTP providers with ordered URL fallback

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use alloy::eips::{BlockId, BlockNumberOrTag};
use alloy::network::TransactionBuilder;
use alloy::primitives::{Address, Bytes, B256};
use alloy::providers::{Provider, ProviderBuilder, RootProvider};
use alloy::rpc::client::RpcClient;
use alloy::rpc::types::{
    Block, BlockTransactionsKind, Filter, Log, TransactionReceipt, TransactionRequest,
};
use alloy::transports::http::{Client, Http};
use alloy::transports::TransportResult;
use async_trait::async_trait;
use eyre::WrapErr;
use tracing::{debug, warn};

use super::{BlockHeader, ChainClient, ChainLog, ClientError, LogFilter, TxCall, TxReceipt};
use crate::proof::{Receipt, ReceiptLog};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const METHOD_NOT_FOUND: i64 = -32601;

type HttpProvider = RootProvider<Http<Client>>;

/// Parse a comma-separated RPC URL string into individual trimmed URLs.
pub fn parse_rpc_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Create alloy HTTP providers for each RPC URL.
pub fn create_providers(urls: &[String]) -> eyre::Result<Vec<HttpProvider>> {
    if urls.is_empty() {
        return Err(eyre::eyre!("At least one RPC URL is required"));
    }
    let http = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
    urls.iter()
        .map(|url| {
            let parsed = url
                .parse()
                .wrap_err_with(|| format!("Invalid RPC URL: {}", url))?;
            let transport = Http::with_client(http.clone(), parsed);
            Ok(ProviderBuilder::new().on_client(RpcClient::new(transport, false)))
        })
        .collect()
}

/// Chain client over one provider per RPC URL. Calls go to the preferred
/// provider first and fall through the list on transport failures.
pub struct EvmClient {
    urls: Vec<String>,
    providers: Vec<HttpProvider>,
    preferred: AtomicUsize,
}

impl EvmClient {
    pub fn new(urls: Vec<String>) -> eyre::Result<Self> {
        let providers = create_providers(&urls)?;
        Ok(Self {
            urls,
            providers,
            preferred: AtomicUsize::new(0),
        })
    }

    pub fn urls(&self) -> &[String] {
        &self.urls
    }

    async fn with_fallback<'a, T, F, Fut>(&'a self, method: &str, op: F) -> Result<T, ClientError>
    where
        F: Fn(&'a HttpProvider) -> Fut,
        Fut: Future<Output = TransportResult<T>>,
    {
        let start = self.preferred.load(Ordering::Relaxed);
        let mut last_err = ClientError::Transport("no rpc url".to_string());

        for offset in 0..self.providers.len() {
            let idx = (start + offset) % self.providers.len();
            match op(&self.providers[idx]).await.map_err(ClientError::from) {
                Err(ClientError::Transport(e)) => {
                    warn!(url = %self.urls[idx], method, error = %e, "RPC endpoint failed");
                    last_err = ClientError::Transport(e);
                }
                other => {
                    if idx != start {
                        debug!(url = %self.urls[idx], "Switching preferred RPC endpoint");
                        self.preferred.store(idx, Ordering::Relaxed);
                    }
                    return other;
                }
            }
        }
        Err(last_err)
    }

    async fn block(&self, number: BlockNumberOrTag) -> Result<Block, ClientError> {
        self.with_fallback("eth_getBlockByNumber", |p| async move {
            p.get_block_by_number(number, BlockTransactionsKind::Hashes)
                .await
        })
        .await?
        .ok_or_else(|| ClientError::Decode(format!("block {} not found", number)))
    }

    /// Receipts one by one, for nodes without `eth_getBlockReceipts`
    async fn receipts_by_hash(&self, number: u64) -> Result<Vec<TransactionReceipt>, ClientError> {
        let block = self.block(BlockNumberOrTag::Number(number)).await?;
        let hashes = block.transactions.as_hashes().unwrap_or_default().to_vec();
        let mut receipts = Vec::with_capacity(hashes.len());
        for hash in hashes {
            let receipt = self
                .with_fallback("eth_getTransactionReceipt", |p| async move {
                    p.get_transaction_receipt(hash).await
                })
                .await?
                .ok_or_else(|| ClientError::Decode(format!("no receipt for {}", hash)))?;
            receipts.push(receipt);
        }
        Ok(receipts)
    }
}

#[async_trait]
impl ChainClient for EvmClient {
    async fn chain_id(&self) -> Result<u64, ClientError> {
        self.with_fallback("eth_chainId", |p| async move { p.get_chain_id().await })
            .await
    }

    async fn block_number(&self) -> Result<u64, ClientError> {
        self.with_fallback("eth_blockNumber", |p| async move { p.get_block_number().await })
            .await
    }

    async fn header(&self, number: u64) -> Result<BlockHeader, ClientError> {
        let block = self.block(BlockNumberOrTag::Number(number)).await?;
        let header = &block.header.inner;
        Ok(BlockHeader {
            number: header.number,
            hash: block.header.hash,
            parent_hash: header.parent_hash,
            receipts_root: header.receipts_root,
            state_root: header.state_root,
            timestamp: header.timestamp,
            base_fee_per_gas: header.base_fee_per_gas.map(u128::from),
        })
    }

    async fn block_receipts(&self, number: u64) -> Result<Vec<Receipt>, ClientError> {
        let fetched = self
            .with_fallback("eth_getBlockReceipts", |p| async move {
                p.get_block_receipts(BlockId::number(number)).await
            })
            .await;
        let raw = match fetched {
            Ok(Some(receipts)) => receipts,
            Ok(None) => return Err(ClientError::Decode(format!("no receipts for block {}", number))),
            Err(ClientError::Rpc { code, .. }) if code == METHOD_NOT_FOUND => {
                self.receipts_by_hash(number).await?
            }
            Err(e) => return Err(e),
        };

        let mut indexed = Vec::with_capacity(raw.len());
        for receipt in raw {
            if let Some(block) = receipt.block_number {
                if block != number {
                    return Err(ClientError::Decode(format!(
                        "receipt of block {} returned for block {}",
                        block, number
                    )));
                }
            }
            let index = receipt
                .transaction_index
                .ok_or_else(|| ClientError::Decode("receipt without transactionIndex".into()))?;
            indexed.push((index, receipt));
        }
        indexed.sort_by_key(|(index, _)| *index);

        indexed
            .into_iter()
            .map(|(_, receipt)| convert_receipt(&receipt))
            .collect()
    }

    async fn logs(&self, filter: &LogFilter) -> Result<Vec<ChainLog>, ClientError> {
        let mut query = Filter::new()
            .from_block(filter.from_block)
            .to_block(filter.to_block);
        if !filter.addresses.is_empty() {
            query = query.address(filter.addresses.clone());
        }
        if !filter.topics.is_empty() {
            query = query.event_signature(filter.topics.clone());
        }

        let query = &query;
        let logs = self
            .with_fallback("eth_getLogs", |p| async move { p.get_logs(query).await })
            .await?;
        logs.iter().map(convert_log).collect()
    }

    async fn pending_nonce(&self, address: Address) -> Result<u64, ClientError> {
        self.with_fallback("eth_getTransactionCount", |p| async move {
            p.get_transaction_count(address).pending().await
        })
        .await
    }

    async fn gas_price(&self) -> Result<u128, ClientError> {
        self.with_fallback("eth_gasPrice", |p| async move { p.get_gas_price().await })
            .await
    }

    async fn base_fee(&self) -> Result<Option<u128>, ClientError> {
        let block = self.block(BlockNumberOrTag::Latest).await?;
        Ok(block.header.inner.base_fee_per_gas.map(u128::from))
    }

    async fn max_priority_fee(&self) -> Result<u128, ClientError> {
        self.with_fallback("eth_maxPriorityFeePerGas", |p| async move {
            p.get_max_priority_fee_per_gas().await
        })
        .await
    }

    async fn estimate_gas(&self, from: Address, call: &TxCall) -> Result<u64, ClientError> {
        let request = &call_request(from, call);
        let gas = self
            .with_fallback("eth_estimateGas", |p| async move { p.estimate_gas(request).await })
            .await?;
        u64::try_from(gas).map_err(|_| ClientError::Decode("gas estimate overflows u64".into()))
    }

    async fn call(&self, from: Address, call: &TxCall) -> Result<Bytes, ClientError> {
        let request = &call_request(from, call);
        self.with_fallback("eth_call", |p| async move { p.call(request).await })
            .await
    }

    async fn send_raw_transaction(&self, raw: Bytes) -> Result<B256, ClientError> {
        let raw = &raw[..];
        self.with_fallback("eth_sendRawTransaction", |p| async move {
            p.send_raw_transaction(raw)
                .await
                .map(|pending| *pending.tx_hash())
        })
        .await
    }

    async fn transaction_receipt(&self, hash: B256) -> Result<Option<TxReceipt>, ClientError> {
        let receipt = self
            .with_fallback("eth_getTransactionReceipt", |p| async move {
                p.get_transaction_receipt(hash).await
            })
            .await?;
        // Some nodes return a receipt for a pending tx with a null block
        Ok(receipt.and_then(|receipt| {
            receipt.block_number.map(|block_number| TxReceipt {
                block_number,
                success: receipt.inner.status(),
            })
        }))
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ClientError> {
        self.with_fallback("eth_getCode", |p| async move { p.get_code_at(address).await })
            .await
    }
}

fn call_request(from: Address, call: &TxCall) -> TransactionRequest {
    TransactionRequest::default()
        .with_from(from)
        .with_to(call.to)
        .with_input(call.data.clone())
        .with_value(call.value)
}

fn convert_receipt(receipt: &TransactionReceipt) -> Result<Receipt, ClientError> {
    let envelope = &receipt.inner;
    let cumulative_gas_used = u64::try_from(envelope.cumulative_gas_used())
        .map_err(|_| ClientError::Decode("cumulative gas overflows u64".into()))?;
    Ok(Receipt {
        tx_type: envelope.tx_type() as u8,
        success: envelope.status(),
        cumulative_gas_used,
        logs_bloom: *envelope.logs_bloom(),
        logs: envelope
            .logs()
            .iter()
            .map(|log| ReceiptLog {
                address: log.inner.address,
                topics: log.inner.data.topics().to_vec(),
                data: log.inner.data.data.clone(),
            })
            .collect(),
    })
}

fn convert_log(log: &Log) -> Result<ChainLog, ClientError> {
    let position = |field: Option<u64>, name: &str| {
        field.ok_or_else(|| ClientError::Decode(format!("log without {}", name)))
    };
    Ok(ChainLog {
        block_number: position(log.block_number, "blockNumber")?,
        tx_index: position(log.transaction_index, "transactionIndex")?,
        log_index: position(log.log_index, "logIndex")?,
        tx_hash: log
            .transaction_hash
            .ok_or_else(|| ClientError::Decode("log without transactionHash".to_string()))?,
        address: log.inner.address,
        topics: log.inner.data.topics().to_vec(),
        data: log.inner.data.data.clone(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rpc_log() -> serde_json::Value {
        json!({
            "address": "0x1111111111111111111111111111111111111111",
            "topics": [format!("0x{}", "ab".repeat(32))],
            "data": "0x0102",
            "blockHash": format!("0x{}", "ef".repeat(32)),
            "blockNumber": "0x10",
            "transactionHash": format!("0x{}", "cd".repeat(32)),
            "transactionIndex": "0x3",
            "logIndex": "0x0",
            "removed": false
        })
    }

    #[test]
    fn test_parse_multiple_urls() {
        let urls = parse_rpc_urls(" https://a.com , https://b.com,,https://c.com,");
        assert_eq!(urls, vec!["https://a.com", "https://b.com", "https://c.com"]);
        assert!(parse_rpc_urls("").is_empty());
    }

    #[test]
    fn test_new_rejects_bad_urls() {
        assert!(EvmClient::new(vec![]).is_err());
        assert!(EvmClient::new(vec!["not a url".to_string()]).is_err());
        let client = EvmClient::new(vec![
            "http://localhost:8545".to_string(),
            "http://localhost:8546".to_string(),
        ])
        .unwrap();
        assert_eq!(client.urls().len(), 2);
    }

    #[test]
    fn test_convert_receipt_json() {
        let raw = json!({
            "type": "0x2",
            "status": "0x1",
            "cumulativeGasUsed": "0x5208",
            "logsBloom": format!("0x{}", "00".repeat(256)),
            "logs": [rpc_log()],
            "transactionHash": format!("0x{}", "cd".repeat(32)),
            "transactionIndex": "0x3",
            "blockHash": format!("0x{}", "ef".repeat(32)),
            "blockNumber": "0x10",
            "from": "0x2222222222222222222222222222222222222222",
            "to": "0x1111111111111111111111111111111111111111",
            "gasUsed": "0x5208",
            "effectiveGasPrice": "0x3b9aca00",
            "contractAddress": null
        });
        let receipt: TransactionReceipt = serde_json::from_value(raw).unwrap();
        let converted = convert_receipt(&receipt).unwrap();
        assert_eq!(converted.tx_type, 2);
        assert!(converted.success);
        assert_eq!(converted.cumulative_gas_used, 21_000);
        assert_eq!(converted.logs.len(), 1);
        assert_eq!(converted.logs[0].data, Bytes::from_static(&[1, 2]));
        assert_eq!(converted.logs[0].topics, vec![B256::repeat_byte(0xab)]);
    }

    #[test]
    fn test_convert_log_requires_position() {
        let log: Log = serde_json::from_value(rpc_log()).unwrap();
        let converted = convert_log(&log).unwrap();
        assert_eq!(converted.block_number, 16);
        assert_eq!(converted.tx_index, 3);

        let mut pending = rpc_log();
        pending["transactionHash"] = serde_json::Value::Null;
        let log: Log = serde_json::from_value(pending).unwrap();
        assert!(convert_log(&log).is_err());
    }
}
