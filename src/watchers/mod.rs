//! Per-chain loop supervision
//!
//! Every Maintainer and Messenger runs as its own task. A loop that dies on
//! a fatal error takes its chain down (the chain's stop token is cancelled,
//! which also stops that chain's writer) while every other chain keeps
//! running.

use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub mod maintainer;
pub mod messenger;

pub use maintainer::{Maintainer, MaintainerConfig};
pub use messenger::{Messenger, MessengerConfig};

use crate::health::{ChainHealth, Role};
use crate::metrics;
use crate::sync::SyncError;
use crate::types::ChainId;

/// Why a supervised loop ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopExit {
    pub chain_id: ChainId,
    pub name: String,
    pub role: Role,
    /// `None` on a clean stop
    pub fatal: Option<String>,
}

/// (chain, name, role, fatal reason)
type LoopResult = (ChainId, String, Role, Option<String>);

pub struct ChainSupervisor {
    health: Arc<ChainHealth>,
    tasks: JoinSet<LoopResult>,
    chains: HashMap<ChainId, CancellationToken>,
}

impl ChainSupervisor {
    pub fn new(health: Arc<ChainHealth>) -> Self {
        Self {
            health,
            tasks: JoinSet::new(),
            chains: HashMap::new(),
        }
    }

    /// Stop token of `chain_id`, created as a child of `parent` on first use
    pub fn chain_token(
        &mut self,
        chain_id: ChainId,
        parent: &CancellationToken,
    ) -> CancellationToken {
        self.chains
            .entry(chain_id)
            .or_insert_with(|| parent.child_token())
            .clone()
    }

    pub fn spawn<F>(&mut self, chain_id: ChainId, name: &str, role: Role, task: F)
    where
        F: Future<Output = Result<(), SyncError>> + Send + 'static,
    {
        info!(chain = %name, chain_id, role = %role, "Spawned chain loop");
        let name = name.to_string();
        self.tasks.spawn(async move {
            let fatal = match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => None,
                Ok(Err(e)) if !e.is_fatal() => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some("loop panicked".to_string()),
            };
            (chain_id, name, role, fatal)
        });
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every loop to end, recording how each one ended
    pub async fn run(mut self) -> Vec<LoopExit> {
        let mut exits = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            let (chain_id, name, role, fatal) = match joined {
                Ok(result) => result,
                Err(e) => {
                    error!(error = %e, "Chain loop task aborted");
                    continue;
                }
            };
            match &fatal {
                Some(reason) => self.mark_dead(chain_id, &name, role, reason),
                None => {
                    info!(chain = %name, role = %role, "Chain loop stopped");
                    self.health.mark_stopped(chain_id, role);
                }
            }
            exits.push(LoopExit {
                chain_id,
                name,
                role,
                fatal,
            });
        }
        exits
    }

    fn mark_dead(&self, chain_id: ChainId, name: &str, role: Role, reason: &str) {
        error!(chain = %name, chain_id, role = %role, error = %reason, "Chain loop died");
        metrics::record_error(name, "dead");
        self.health.mark_dead(chain_id, role, reason);
        if let Some(token) = self.chains.get(&chain_id) {
            token.cancel();
        }
    }
}
