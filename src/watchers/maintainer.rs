//! Header relay loop
//!
//! On a regular chain the Maintainer ships confirmed, epoch-aligned header
//! windows to the anchor chain's light client, one batch in flight at a time.
//! On the anchor chain it fans anchor headers out to the light nodes of every
//! destination that has fallen behind.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::adapters::HeaderAdapter;
use crate::connection::{ChainClient, Connection};
use crate::db::BlockStore;
use crate::metrics;
use crate::router::Router;
use crate::sync::{EpochSchedule, StepError, SyncContext, SyncCursor, SyncError};
use crate::types::{CompletionCounter, Message, MessageKind};

#[derive(Debug, Clone)]
pub struct MaintainerConfig {
    pub start_block: u64,
    pub confirmations: u64,
    /// Blocks advanced per iteration
    pub stride: u64,
    /// Catch-up window past the destination's synced height
    pub lookahead: u64,
    pub schedule: EpochSchedule,
    /// Relay this chain's headers to the anchor chain
    pub sync_headers: bool,
}

impl Default for MaintainerConfig {
    fn default() -> Self {
        Self {
            start_block: 0,
            confirmations: 0,
            stride: 1,
            lookahead: 0,
            schedule: EpochSchedule::disabled(),
            sync_headers: true,
        }
    }
}

pub struct Maintainer<C: ChainClient> {
    ctx: SyncContext,
    cursor: SyncCursor,
    config: MaintainerConfig,
    conn: Arc<Connection<C>>,
    anchor: Arc<Connection<C>>,
    /// Destinations whose light nodes follow the anchor chain
    fan_out: Vec<Arc<Connection<C>>>,
    adapter: Arc<dyn HeaderAdapter<C>>,
    router: Arc<Router>,
    store: Arc<dyn BlockStore>,
    completions: CompletionCounter,
}

impl<C: ChainClient> Maintainer<C> {
    pub fn new(
        ctx: SyncContext,
        config: MaintainerConfig,
        conn: Arc<Connection<C>>,
        anchor: Arc<Connection<C>>,
        adapter: Arc<dyn HeaderAdapter<C>>,
        router: Arc<Router>,
        store: Arc<dyn BlockStore>,
    ) -> Self {
        Self {
            cursor: SyncCursor::new(config.start_block, config.confirmations),
            ctx,
            config,
            conn,
            anchor,
            fan_out: Vec::new(),
            adapter,
            router,
            store,
            completions: CompletionCounter::new(),
        }
    }

    /// Anchor chain only: light-node destinations to keep updated
    pub fn with_fan_out(mut self, destinations: Vec<Arc<Connection<C>>>) -> Self {
        self.fan_out = destinations;
        self
    }

    pub fn cursor(&self) -> &SyncCursor {
        &self.cursor
    }

    fn is_anchor(&self) -> bool {
        self.conn.chain_id() == self.router.anchor()
    }

    /// Run until the stop signal or a fatal error
    pub async fn run(mut self) -> Result<(), SyncError> {
        self.start().await?;
        info!(
            chain = %self.ctx.name,
            current_block = self.cursor.current_block(),
            synced_height = self.cursor.synced_height(),
            anchor = self.is_anchor(),
            "Maintainer started"
        );

        loop {
            if self.ctx.stopped() {
                return Err(crate::types::Stopped.into());
            }
            if let Err(e) = self.step().await {
                self.ctx.recover(e).await?;
            }
        }
    }

    /// Resume from the stored cursor and reconcile with the light client
    async fn start(&mut self) -> Result<(), SyncError> {
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

        if !self.is_anchor() && self.config.sync_headers {
            let synced = loop {
                match self.adapter.synced_height(&self.conn, &self.anchor).await {
                    Ok(height) => break height,
                    Err(e) => self.ctx.recover(e.into()).await?,
                }
            };
            let local = self.cursor.current_block();
            if self.cursor.catch_up(synced, self.config.lookahead) {
                info!(
                    chain = %self.ctx.name,
                    local,
                    synced_height = synced,
                    current_block = self.cursor.current_block(),
                    "Catch-up sync moved cursor"
                );
            }
            metrics::set_synced_height(&self.ctx.name, synced);
        }

        // Strided walks only visit aligned blocks when they start on one
        if self.config.stride > 1 {
            let local = self.cursor.current_block();
            if self.cursor.align(&self.config.schedule) {
                info!(
                    chain = %self.ctx.name,
                    local,
                    current_block = self.cursor.current_block(),
                    stride = self.config.stride,
                    "Aligned cursor to epoch"
                );
            }
        }
        Ok(())
    }

    /// One CheckConfirmation → CheckEpochAlignment → BuildAndSend → Advance pass
    async fn step(&mut self) -> Result<(), StepError> {
        let Some(latest) = self.ctx.fetch_latest(&self.conn).await? else {
            return Ok(self.ctx.idle().await?);
        };
        if !self.cursor.ready(latest) {
            debug!(
                chain = %self.ctx.name,
                latest,
                current_block = self.cursor.current_block(),
                confirmations = self.cursor.confirmations(),
                "Waiting for confirmations"
            );
            return Ok(self.ctx.idle().await?);
        }

        let block = self.cursor.current_block();
        if self.config.schedule.is_aligned(block) {
            if self.is_anchor() {
                self.fan_out(block).await?;
            } else if self.config.sync_headers && self.cursor.needs_header() {
                self.sync_to_anchor(block).await?;
            }
        }

        self.ctx.record_success();
        self.ctx.record_block(block);
        self.cursor.advance(self.config.stride);
        if let Err(e) = self
            .store
            .store_block(self.ctx.chain_id, self.ctx.role, self.cursor.current_block())
            .await
        {
            warn!(chain = %self.ctx.name, error = %e, "Failed to store cursor");
        }
        Ok(())
    }

    /// Send the header window ending at `block` and wait for it to land
    async fn sync_to_anchor(&mut self, block: u64) -> Result<(), StepError> {
        let range = self.config.schedule.batch_range(block);
        let batch = self.adapter.build_batch(&self.conn, range).await?;
        info!(
            chain = %self.ctx.name,
            first_block = batch.first_block,
            last_block = batch.last_block,
            "Sending header batch"
        );

        let message = Message::new(
            self.conn.chain_id(),
            self.router.anchor(),
            MessageKind::SyncToAnchor(batch),
            self.completions.handle(),
        );
        self.router.send(message)?;
        self.completions.wait_for(1, &self.ctx.stop).await?;

        self.cursor.mark_synced();
        metrics::set_synced_height(&self.ctx.name, block);
        Ok(())
    }

    /// Update every lagging destination light node, then wait for all
    async fn fan_out(&mut self, block: u64) -> Result<(), StepError> {
        let mut updates = Vec::new();
        for destination in &self.fan_out {
            let synced = self.adapter.synced_height(&self.conn, destination).await?;
            if synced >= block {
                continue;
            }
            let update = self
                .adapter
                .build_anchor_update(&self.conn, destination.chain_id(), block)
                .await?;
            updates.push((destination.chain_id(), update));
        }
        if updates.is_empty() {
            return Ok(());
        }

        let pending = updates.len();
        for (destination, update) in updates {
            let message = Message::new(
                self.conn.chain_id(),
                destination,
                MessageKind::SyncFromAnchor(update),
                self.completions.handle(),
            );
            self.router.send(message)?;
        }
        debug!(chain = %self.ctx.name, block, pending, "Waiting for anchor header updates");
        self.completions.wait_for(pending, &self.ctx.stop).await?;
        Ok(())
    }
}
