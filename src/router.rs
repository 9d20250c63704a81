//! Message router
//!
//! Maps destination chain ids to writers. Traffic between two non-anchor
//! chains is sent to the anchor chain instead and the message's destination
//! is rewritten to the anchor; the original destination is only logged. The
//! registry is filled at startup and read-only afterwards.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error};

use crate::metrics;
use crate::types::{ChainId, Message};
use crate::writers::MessageWriter;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("no writer registered for chain {0}")]
    UnknownDestination(ChainId),
}

pub struct Router {
    anchor: ChainId,
    writers: HashMap<ChainId, Arc<dyn MessageWriter>>,
}

impl Router {
    pub fn new(anchor: ChainId) -> Self {
        Self {
            anchor,
            writers: HashMap::new(),
        }
    }

    pub fn anchor(&self) -> ChainId {
        self.anchor
    }

    pub fn register(&mut self, chain_id: ChainId, writer: Arc<dyn MessageWriter>) {
        if self.writers.insert(chain_id, writer).is_some() {
            debug!(chain_id, "Replaced registered writer");
        }
    }

    pub fn is_registered(&self, chain_id: ChainId) -> bool {
        self.writers.contains_key(&chain_id)
    }

    /// Chain whose writer handles `message`
    pub fn resolve(&self, message: &Message) -> ChainId {
        if message.source != self.anchor && message.destination != self.anchor {
            self.anchor
        } else {
            message.destination
        }
    }

    /// Hand the message to its writer on a new task and return immediately.
    ///
    /// On `UnknownDestination` the message, and with it the completion
    /// handle, is dropped.
    pub fn send(&self, mut message: Message) -> Result<(), RouterError> {
        let destination = self.resolve(&message);
        let Some(writer) = self.writers.get(&destination) else {
            error!(
                source = message.source,
                destination,
                kind = %message.kind,
                "No writer for destination"
            );
            return Err(RouterError::UnknownDestination(destination));
        };

        debug!(
            source = message.source,
            original_destination = message.destination,
            destination,
            kind = %message.kind,
            "Routing message"
        );
        metrics::record_message_routed(&destination.to_string(), message.kind.name());
        message.destination = destination;

        let writer = Arc::clone(writer);
        tokio::spawn(async move {
            writer.write(message).await;
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{header_message, RecordingWriter};
    use crate::types::CompletionCounter;
    use tokio_util::sync::CancellationToken;

    const ANCHOR: ChainId = 22776;

    #[test]
    fn test_resolve_rewrites_non_anchor_traffic() {
        let router = Router::new(ANCHOR);
        let counter = CompletionCounter::new();

        assert_eq!(router.resolve(&header_message(1, 56, counter.handle())), ANCHOR);
        assert_eq!(router.resolve(&header_message(1, ANCHOR, counter.handle())), ANCHOR);
        assert_eq!(router.resolve(&header_message(ANCHOR, 56, counter.handle())), 56);
    }

    #[tokio::test]
    async fn test_send_delivers_to_anchor_writer() {
        let mut router = Router::new(ANCHOR);
        let writer = Arc::new(RecordingWriter::default());
        router.register(ANCHOR, writer.clone());

        let mut counter = CompletionCounter::new();
        router.send(header_message(1, 56, counter.handle())).unwrap();
        counter.wait_for(1, &CancellationToken::new()).await.unwrap();

        let seen = writer.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].destination, ANCHOR);
        assert_eq!(seen[0].source, 1);
    }

    #[tokio::test]
    async fn test_unknown_destination() {
        let router = Router::new(ANCHOR);
        let counter = CompletionCounter::new();
        assert_eq!(
            router.send(header_message(ANCHOR, 56, counter.handle())),
            Err(RouterError::UnknownDestination(56))
        );
    }
}
