//! Common types for cross-chain messages
//!
//! A [`Message`] is produced by a watcher loop (Maintainer or Messenger),
//! routed by the [`crate::router::Router`] and consumed exactly once by a
//! writer. Its [`Completion`] handle travels with it and is the only way the
//! originating loop learns that the effect is durable.

use alloy::primitives::{Bytes, B256};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::proof::InclusionProof;

/// Opaque chain identifier
pub type ChainId = u64;

/// Raised when a wait is interrupted by the chain's stop signal
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stop signal received")]
pub struct Stopped;

/// A contiguous batch of headers (or a light-client update) ready for the
/// destination chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderBatch {
    pub first_block: u64,
    pub last_block: u64,
    /// Adapter-encoded header representation
    pub payload: Bytes,
}

/// An event relayed together with its receipt inclusion proof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProofDelivery {
    pub proof: InclusionProof,
    pub order_id: B256,
    pub block_number: u64,
    pub tx_hash: B256,
    pub log_index: u64,
    /// Adapter-encoded proof payload submitted on the destination chain
    pub payload: Bytes,
    /// Logical method derived from the log topic, when the adapter knows it
    pub method: Option<String>,
}

/// A receipts-root proposal for oracle-style destinations
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Proposal {
    pub block_number: u64,
    pub receipts_root: B256,
    pub payload: Bytes,
}

/// What a message asks the destination writer to do
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    SyncToAnchor(HeaderBatch),
    SyncFromAnchor(HeaderBatch),
    DeliverWithProof(ProofDelivery),
    DeliverWithAnchorProof(ProofDelivery),
    Proposal(Proposal),
}

impl MessageKind {
    /// Stable label for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::SyncToAnchor(_) => "sync_to_anchor",
            MessageKind::SyncFromAnchor(_) => "sync_from_anchor",
            MessageKind::DeliverWithProof(_) => "deliver_with_proof",
            MessageKind::DeliverWithAnchorProof(_) => "deliver_with_anchor_proof",
            MessageKind::Proposal(_) => "proposal",
        }
    }

    /// Logical id of the cross-chain effect, used for duplicate detection
    pub fn order_id(&self) -> Option<B256> {
        match self {
            MessageKind::DeliverWithProof(d) | MessageKind::DeliverWithAnchorProof(d) => {
                Some(d.order_id)
            }
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// One-shot completion handle.
///
/// `signal` consumes the handle. Dropping it without signalling abandons the
/// message: the waiting loop stalls until shutdown and the effect is
/// re-derived from chain state on restart.
#[derive(Debug)]
pub struct Completion {
    tx: Option<mpsc::UnboundedSender<()>>,
}

impl Completion {
    /// A handle nobody waits on
    pub fn detached() -> Self {
        Self { tx: None }
    }

    pub fn signal(self) {
        if let Some(tx) = self.tx {
            // The receiver is gone only when the originating loop has stopped.
            let _ = tx.send(());
        }
    }
}

/// Receiving side of the completion handles issued by one loop
#[derive(Debug)]
pub struct CompletionCounter {
    tx: mpsc::UnboundedSender<()>,
    rx: mpsc::UnboundedReceiver<()>,
}

impl Default for CompletionCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionCounter {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx }
    }

    /// Issue a new handle counted by this counter
    pub fn handle(&self) -> Completion {
        Completion {
            tx: Some(self.tx.clone()),
        }
    }

    /// Wait until `n` handles have signalled, or the stop token fires
    pub async fn wait_for(&mut self, n: usize, stop: &CancellationToken) -> Result<(), Stopped> {
        let mut received = 0;
        while received < n {
            tokio::select! {
                _ = stop.cancelled() => return Err(Stopped),
                signal = self.rx.recv() => {
                    // `self.tx` keeps the channel open, so `None` is unreachable
                    if signal.is_some() {
                        received += 1;
                    }
                }
            }
        }
        Ok(())
    }
}

/// A cross-chain message
#[derive(Debug)]
pub struct Message {
    pub source: ChainId,
    pub destination: ChainId,
    pub kind: MessageKind,
    completion: Completion,
}

impl Message {
    pub fn new(
        source: ChainId,
        destination: ChainId,
        kind: MessageKind,
        completion: Completion,
    ) -> Self {
        Self {
            source,
            destination,
            kind,
            completion,
        }
    }

    /// Mark the effect as durable (or known harmless) and release the waiter
    pub fn complete(self) {
        self.completion.signal();
    }

    /// Give up on the message without signalling its waiter
    pub fn abandon(self) {
        drop(self.completion);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn batch() -> MessageKind {
        MessageKind::SyncToAnchor(HeaderBatch {
            first_block: 1,
            last_block: 12,
            payload: Bytes::new(),
        })
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(batch().name(), "sync_to_anchor");
        assert_eq!(format!("{}", batch()), "sync_to_anchor");
        assert!(batch().order_id().is_none());
    }

    #[tokio::test]
    async fn test_counter_waits_for_all_handles() {
        let mut counter = CompletionCounter::new();
        let stop = CancellationToken::new();
        let handles: Vec<_> = (0..3).map(|_| counter.handle()).collect();

        for h in handles {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                h.signal();
            });
        }

        counter.wait_for(3, &stop).await.unwrap();
    }

    #[tokio::test]
    async fn test_counter_stops_on_cancel() {
        let mut counter = CompletionCounter::new();
        let stop = CancellationToken::new();
        let msg = Message::new(1, 2, batch(), counter.handle());
        msg.abandon();

        stop.cancel();
        assert_eq!(counter.wait_for(1, &stop).await, Err(Stopped));
    }

    #[tokio::test]
    async fn test_zero_wait_returns_immediately() {
        let mut counter = CompletionCounter::new();
        let stop = CancellationToken::new();
        counter.wait_for(0, &stop).await.unwrap();
    }
}
