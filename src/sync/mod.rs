//! Shared plumbing for the per-chain sync loops

pub mod cursor;

use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

pub use cursor::{should_advance, EpochSchedule, SyncCursor};

use crate::adapters::AdapterError;
use crate::connection::{ChainClient, ClientError, Connection};
use crate::health::{ChainHealth, Role};
use crate::metrics;
use crate::proof::ProofError;
use crate::router::RouterError;
use crate::types::{ChainId, Stopped};

/// Errors that end a sync loop
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("{chain}: giving up after {attempts} consecutive failures, last: {last_error}")]
    RetriesExhausted {
        chain: String,
        attempts: u32,
        last_error: String,
    },
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Stopped(#[from] Stopped),
}

impl SyncError {
    /// Shutdown is the only non-fatal way for a loop to end
    pub fn is_fatal(&self) -> bool {
        !matches!(self, SyncError::Stopped(_))
    }
}

/// Failure of one loop iteration
#[derive(Debug)]
pub enum StepError {
    /// Retry the same block after a pause, consuming retry budget
    Retry { op: &'static str, error: String },
    Fatal(SyncError),
}

impl StepError {
    pub fn retry(op: &'static str, error: impl Display) -> Self {
        StepError::Retry {
            op,
            error: error.to_string(),
        }
    }
}

impl From<AdapterError> for StepError {
    fn from(e: AdapterError) -> Self {
        StepError::retry("adapter", e)
    }
}

impl From<ClientError> for StepError {
    fn from(e: ClientError) -> Self {
        StepError::retry("client", e)
    }
}

impl From<ProofError> for StepError {
    fn from(e: ProofError) -> Self {
        StepError::retry("proof", e)
    }
}

impl From<RouterError> for StepError {
    fn from(e: RouterError) -> Self {
        StepError::Fatal(e.into())
    }
}

impl From<Stopped> for StepError {
    fn from(e: Stopped) -> Self {
        StepError::Fatal(e.into())
    }
}

impl From<SyncError> for StepError {
    fn from(e: SyncError) -> Self {
        StepError::Fatal(e)
    }
}

/// State every loop carries besides its cursor
pub struct SyncContext {
    pub chain_id: ChainId,
    pub name: String,
    pub role: Role,
    pub stop: CancellationToken,
    pub poll_interval: Duration,
    pub health: Arc<ChainHealth>,
    retry_limit: u32,
    retries_left: u32,
    /// The budget is being spent by block-fetch failures
    fetch_failing: bool,
}

impl SyncContext {
    pub fn new(
        chain_id: ChainId,
        name: impl Into<String>,
        role: Role,
        stop: CancellationToken,
        poll_interval: Duration,
        retry_limit: u32,
        health: Arc<ChainHealth>,
    ) -> Self {
        let name = name.into();
        health.register(chain_id, &name, role);
        Self {
            chain_id,
            name,
            role,
            stop,
            poll_interval,
            health,
            retry_limit,
            retries_left: retry_limit,
            fetch_failing: false,
        }
    }

    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }

    /// Latest block, or `None` after a failure that still fits the budget.
    ///
    /// A successful fetch restores the budget only when fetching was what
    /// spent it; failures further along the step keep counting until a block
    /// completes.
    pub async fn fetch_latest<C: ChainClient>(
        &mut self,
        conn: &Connection<C>,
    ) -> Result<Option<u64>, SyncError> {
        match conn.latest_block().await {
            Ok(latest) => {
                if self.fetch_failing {
                    self.record_success();
                }
                Ok(Some(latest))
            }
            Err(e) => {
                self.record_failure("fetch_latest", &e)?;
                self.fetch_failing = true;
                Ok(None)
            }
        }
    }

    /// Consume one unit of the retry budget
    pub fn record_failure(&mut self, op: &str, error: &dyn Display) -> Result<(), SyncError> {
        let message = error.to_string();
        metrics::record_error(&self.name, op);
        let consecutive = self.health.record_failure(self.chain_id, self.role, &message);
        self.retries_left = self.retries_left.saturating_sub(1);

        if self.retries_left == 0 {
            return Err(SyncError::RetriesExhausted {
                chain: self.name.clone(),
                attempts: self.retry_limit,
                last_error: message,
            });
        }
        warn!(
            chain = %self.name,
            role = %self.role,
            op,
            error = %message,
            consecutive,
            retries_left = self.retries_left,
            "Sync step failed, retrying"
        );
        Ok(())
    }

    pub fn record_success(&mut self) {
        self.fetch_failing = false;
        if self.retries_left != self.retry_limit {
            self.health.record_success(self.chain_id, self.role);
        }
        self.retries_left = self.retry_limit;
    }

    pub fn record_block(&self, block: u64) {
        self.health.record_block(self.chain_id, self.role, block);
        metrics::record_block_processed(&self.name, self.role, block);
    }

    /// Turn a failed iteration into either a paused retry or the loop's exit
    pub async fn recover(&mut self, error: StepError) -> Result<(), SyncError> {
        match error {
            StepError::Retry { op, error } => {
                self.record_failure(op, &error)?;
                self.idle().await
            }
            StepError::Fatal(e) => Err(e),
        }
    }

    /// `pause` that reports the stop signal as an error
    pub async fn idle(&self) -> Result<(), SyncError> {
        if self.pause().await {
            Ok(())
        } else {
            Err(Stopped.into())
        }
    }

    /// Sleep one poll interval. False once the stop signal fired.
    pub async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(self.poll_interval) => true,
        }
    }

    pub fn stopped(&self) -> bool {
        self.stop.is_cancelled()
    }
}
