//! Per-chain, per-role health registry
//!
//! Owned by the process root and shared with every loop, writer and the
//! status API. Distinguishes chains that are merely slow (`Alarming`) from
//! chains whose loop has stopped for good (`Dead`).

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::metrics;
use crate::types::ChainId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Maintainer,
    Messenger,
    Writer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Maintainer => "maintainer",
            Role::Messenger => "messenger",
            Role::Writer => "writer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChainStatus {
    Running,
    /// Repeated failures, still retrying
    Alarming,
    /// Loop exited on a fatal error
    Dead,
    /// Loop exited on shutdown
    Stopped,
}

#[derive(Debug, Clone)]
struct RoleState {
    name: String,
    status: ChainStatus,
    last_block: Option<u64>,
    consecutive_failures: u64,
    last_error: Option<String>,
    started_at: Instant,
}

/// Serializable view of one chain role
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RoleSnapshot {
    pub chain_id: ChainId,
    pub name: String,
    pub role: Role,
    pub status: ChainStatus,
    pub last_block: Option<u64>,
    pub consecutive_failures: u64,
    pub last_error: Option<String>,
    pub uptime_seconds: u64,
}

#[derive(Debug, Default)]
pub struct ChainHealth {
    roles: RwLock<BTreeMap<(ChainId, Role), RoleState>>,
}

impl ChainHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, chain_id: ChainId, name: &str, role: Role) {
        self.write(|roles| {
            roles.insert(
                (chain_id, role),
                RoleState {
                    name: name.to_string(),
                    status: ChainStatus::Running,
                    last_block: None,
                    consecutive_failures: 0,
                    last_error: None,
                    started_at: Instant::now(),
                },
            );
        });
        metrics::set_chain_status(name, role, ChainStatus::Running);
    }

    pub fn record_block(&self, chain_id: ChainId, role: Role, block: u64) {
        self.update(chain_id, role, |state| {
            state.last_block = Some(block);
        });
    }

    /// Count a failure and return the new consecutive count
    pub fn record_failure(&self, chain_id: ChainId, role: Role, error: &str) -> u64 {
        self.update(chain_id, role, |state| {
            state.consecutive_failures += 1;
            state.last_error = Some(error.to_string());
            metrics::set_consecutive_failures(&state.name, role, state.consecutive_failures);
            state.consecutive_failures
        })
        .unwrap_or(0)
    }

    /// Reset the failure count and clear `Alarming`
    pub fn record_success(&self, chain_id: ChainId, role: Role) {
        self.update(chain_id, role, |state| {
            state.consecutive_failures = 0;
            metrics::set_consecutive_failures(&state.name, role, 0);
            if state.status == ChainStatus::Alarming {
                state.status = ChainStatus::Running;
                metrics::set_chain_status(&state.name, role, ChainStatus::Running);
            }
        });
    }

    pub fn mark_alarming(&self, chain_id: ChainId, role: Role) {
        self.transition(chain_id, role, ChainStatus::Alarming);
    }

    pub fn mark_dead(&self, chain_id: ChainId, role: Role, reason: &str) {
        self.update(chain_id, role, |state| {
            state.last_error = Some(reason.to_string());
        });
        self.transition(chain_id, role, ChainStatus::Dead);
    }

    pub fn mark_stopped(&self, chain_id: ChainId, role: Role) {
        self.transition(chain_id, role, ChainStatus::Stopped);
    }

    pub fn status(&self, chain_id: ChainId, role: Role) -> Option<ChainStatus> {
        self.read(|roles| roles.get(&(chain_id, role)).map(|s| s.status))
    }

    pub fn snapshot(&self) -> Vec<RoleSnapshot> {
        self.read(|roles| {
            roles
                .iter()
                .map(|(&(chain_id, role), state)| RoleSnapshot {
                    chain_id,
                    name: state.name.clone(),
                    role,
                    status: state.status,
                    last_block: state.last_block,
                    consecutive_failures: state.consecutive_failures,
                    last_error: state.last_error.clone(),
                    uptime_seconds: state.started_at.elapsed().as_secs(),
                })
                .collect()
        })
    }

    /// `Dead` is terminal: a dead role never goes back to running or alarming
    fn transition(&self, chain_id: ChainId, role: Role, to: ChainStatus) {
        self.update(chain_id, role, |state| {
            if state.status == ChainStatus::Dead || state.status == to {
                return;
            }
            state.status = to;
            metrics::set_chain_status(&state.name, role, to);
        });
    }

    fn update<T>(
        &self,
        chain_id: ChainId,
        role: Role,
        f: impl FnOnce(&mut RoleState) -> T,
    ) -> Option<T> {
        self.write(|roles| roles.get_mut(&(chain_id, role)).map(f))
    }

    fn write<T>(&self, f: impl FnOnce(&mut BTreeMap<(ChainId, Role), RoleState>) -> T) -> T {
        let mut roles = self.roles.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut roles)
    }

    fn read<T>(&self, f: impl FnOnce(&BTreeMap<(ChainId, Role), RoleState>) -> T) -> T {
        let roles = self.roles.read().unwrap_or_else(PoisonError::into_inner);
        f(&roles)
    }
}
