//! Event relay loop
//!
//! Scans each confirmed block for cross-chain events, proves every event's
//! receipt against the block's receipts root and routes the resulting
//! messages. The cursor only moves once every message from the block has
//! completed.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::adapters::{EventAdapter, EventContext};
use crate::connection::{ChainClient, Connection};
use crate::db::BlockStore;
use crate::metrics;
use crate::proof::{ProofError, ReceiptTrie};
use crate::router::Router;
use crate::sync::{StepError, SyncContext, SyncCursor, SyncError};
use crate::types::{ChainId, CompletionCounter, Message, MessageKind, Stopped};

#[derive(Debug, Clone, Default)]
pub struct MessengerConfig {
    pub start_block: u64,
    pub confirmations: u64,
}

pub struct Messenger<C: ChainClient> {
    ctx: SyncContext,
    cursor: SyncCursor,
    config: MessengerConfig,
    conn: Arc<Connection<C>>,
    anchor: Arc<Connection<C>>,
    adapter: Arc<dyn EventAdapter<C>>,
    router: Arc<Router>,
    store: Arc<dyn BlockStore>,
    completions: CompletionCounter,
}

impl<C: ChainClient> Messenger<C> {
    pub fn new(
        ctx: SyncContext,
        config: MessengerConfig,
        conn: Arc<Connection<C>>,
        anchor: Arc<Connection<C>>,
        adapter: Arc<dyn EventAdapter<C>>,
        router: Arc<Router>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            cursor: SyncCursor::new(config.start_block, config.confirmations),
            ctx,
            config,
            conn,
            anchor,
            adapter,
            router,
            store,
            completions: CompletionCounter::new(),
        }
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    fn is_anchor(&self) -> bool {
        self.conn.chain_id() == self.router.anchor()
    }

    pub async fn run(mut self) -> Result<(), SyncError> {
        match self
            .store
            .try_load_latest_block(self.ctx.chain_id, self.ctx.role)
            .await
        {
            Ok(Some(stored)) => {
                let start = stored.max(self.config.start_block);
                self.cursor = SyncCursor::new(start, self.config.confirmations);
            }
            Ok(None) => {}
            Err(e) => warn!(chain = %self.ctx.name, error = %e, "Failed to load stored cursor"),
        }
        info!(
            chain = %self.ctx.name,
            current_block = self.cursor.current_block(),
            anchor = self.is_anchor(),
            "Messenger started"
        );

        loop {
            if self.ctx.stopped() {
                return Err(Stopped.into());
            }
            if let Err(e) = self.step().await {
                self.ctx.recover(e).await?;
            }
        }
    }

    async fn step(&mut self) -> Result<(), StepError> {
        let Some(latest) = self.ctx.fetch_latest(&self.conn).await? else {
            return Ok(self.ctx.idle().await?);
        };
        if !self.cursor.ready(latest) {
            return Ok(self.ctx.idle().await?);
        }

        let block = self.cursor.current_block();
        if !self.is_anchor() {
            let range = self
                .adapter
                .verifiable_range(self.conn.chain_id(), &self.anchor)
                .await?;
            if block < *range.start() {
                info!(
                    chain = %self.ctx.name,
                    block,
                    min_verifiable = *range.start(),
                    "Block below verifiable range, skipping ahead"
                );
                self.cursor.clamp_to(*range.start());
                return Ok(());
            }
            if block > *range.end() {
                debug!(
                    chain = %self.ctx.name,
                    block,
                    max_verifiable = *range.end(),
                    "Waiting for light client to reach block"
                );
                return Ok(self.ctx.idle().await?);
            }
        }

        let messages = self.collect(block).await?;
        let pending = messages.len();
        if pending > 0 {
            metrics::record_events_detected(&self.ctx.name, pending);
            for (destination, kind) in messages {
                let message = Message::new(
                    self.conn.chain_id(),
                    destination,
                    kind,
                    self.completions.handle(),
                );
                self.router.send(message)?;
            }
            info!(chain = %self.ctx.name, block, pending, "Dispatched messages, waiting");
            self.completions.wait_for(pending, &self.ctx.stop).await?;
        }

        self.ctx.record_success();
        self.ctx.record_block(block);
        self.cursor.advance(1);
        if let Err(e) = self
            .store
            .store_block(self.ctx.chain_id, self.ctx.role, self.cursor.current_block())
            .await
        {
            warn!(chain = %self.ctx.name, error = %e, "Failed to store cursor");
        }
        Ok(())
    }

    /// Build every message of `block` before any is sent, so a failure
    /// part-way leaves nothing in flight
    async fn collect(&self, block: u64) -> Result<Vec<(ChainId, MessageKind)>, StepError> {
        let logs = self.adapter.fetch_logs(&self.conn, block).await?;
        if logs.is_empty() {
            return Ok(Vec::new());
        }

        let client = self.conn.client();
        let header = client.header(block).await?;
        let receipts = client.block_receipts(block).await?;
        let trie = ReceiptTrie::new(&receipts)?;
        if trie.root() != header.receipts_root {
            return Err(StepError::retry(
                "receipts_root",
                format!(
                    "block {} receipts root {} does not match header {}",
                    block,
                    trie.root(),
                    header.receipts_root
                ),
            ));
        }

        let from_anchor = self.is_anchor();
        let mut messages = Vec::with_capacity(logs.len());
        for log in &logs {
            let destination = if from_anchor {
                self.adapter.destination(log)?
            } else {
                self.router.anchor()
            };
            // Anchor events name their destination in the payload
            if from_anchor && !self.router.is_registered(destination) {
                warn!(
                    chain = %self.ctx.name,
                    block,
                    tx_hash = %log.tx_hash,
                    log_index = log.log_index,
                    destination,
                    "Event names an unsupported destination, skipping"
                );
                metrics::record_unroutable(&self.ctx.name, &destination.to_string());
                continue;
            }
            let index = usize::try_from(log.tx_index)
                .map_err(|_| ProofError::IndexOutOfRange {
                    index: usize::MAX,
                    len: trie.len(),
                })?;
            let proof = trie.prove(index)?;
            let receipt = trie
                .leaf(index)
                .ok_or(ProofError::IndexOutOfRange {
                    index,
                    len: trie.len(),
                })?
                .to_vec()
                .into();

            let kind = self.adapter.assemble(EventContext {
                source: self.conn.chain_id(),
                destination,
                log,
                header: &header,
                proof,
                receipt,
                from_anchor,
            })?;
            debug!(
                chain = %self.ctx.name,
                block,
                tx_index = log.tx_index,
                log_index = log.log_index,
                destination,
                kind = %kind,
                "Assembled message"
            );
            messages.push((destination, kind));
        }
        Ok(messages)
    }
}
