//! Per-run state handed to every component.

use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};
use provsync_core::{FailureClass, RunFailure};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::RunConfig;
use crate::cost::SpendLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RunAborted {
    #[error("run cancelled")]
    Cancelled,
    #[error("run deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug)]
pub struct RunContext {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub config: RunConfig,
    pub ledger: Arc<SpendLedger>,
    pub cancel: CancellationToken,
    deadline: Instant,
    failures: Mutex<Vec<RunFailure>>,
}

impl RunContext {
    /// Starts a run: resets the ledger and arms the deadline.
    pub fn new(config: RunConfig, ledger: Arc<SpendLedger>) -> Self {
        ledger.reset();
        let deadline = Instant::now() + config.run_deadline;
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            config,
            ledger,
            cancel: CancellationToken::new(),
            deadline,
            failures: Mutex::new(Vec::new()),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn check_live(&self) -> Result<(), RunAborted> {
        if self.cancel.is_cancelled() {
            return Err(RunAborted::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(RunAborted::DeadlineExceeded);
        }
        Ok(())
    }

    /// Resolves once the run is cancelled or past its deadline.
    pub async fn aborted(&self) -> RunAborted {
        tokio::select! {
            _ = self.cancel.cancelled() => RunAborted::Cancelled,
            _ = tokio::time::sleep_until(self.deadline) => RunAborted::DeadlineExceeded,
        }
    }

    pub fn record_failure(&self, target_id: &str, class: FailureClass, message: impl Into<String>) {
        let message = message.into();
        warn!(run_id = %self.run_id, target_id, ?class, %message, "target failed");
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(RunFailure {
                target_id: target_id.to_string(),
                class,
                message,
            });
    }

    pub fn failures(&self) -> Vec<RunFailure> {
        self.failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
