//! Retry controller for one replication direction.

use crate::config::RetryConfig;
use crate::error::{ErrorClass, SyncError, SyncResult};
use std::time::Duration;

/// Lifecycle state of a direction loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Waiting for work.
    Idle,
    /// Running a cycle.
    Running,
    /// Waiting before retrying a failed cycle.
    Backoff,
    /// Stopped by cancellation.
    Cancelled,
    /// Stopped by fatal escalation.
    Failed,
}

impl LoopState {
    /// Returns true if the loop will never run another cycle.
    pub fn is_terminal(&self) -> bool {
        matches!(self, LoopState::Cancelled | LoopState::Failed)
    }
}

/// What the loop should do after a failed cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Sleep, then run the cycle again.
    Retry {
        /// Backoff delay.
        delay: Duration,
        /// Failures in a row, including this one.
        consecutive_failures: u32,
    },
    /// Stop the direction and report this error as fatal.
    Escalate(SyncError),
    /// Stop quietly.
    Stop,
}

/// Classifies cycle failures and tracks backoff state.
#[derive(Debug)]
pub struct RetryController {
    config: RetryConfig,
    storage_failure_threshold: u32,
    state: LoopState,
    consecutive_failures: u32,
    consecutive_storage_failures: u32,
}

impl RetryController {
    /// Creates a controller.
    pub fn new(config: RetryConfig, storage_failure_threshold: u32) -> Self {
        Self {
            config,
            storage_failure_threshold: storage_failure_threshold.max(1),
            state: LoopState::Idle,
            consecutive_failures: 0,
            consecutive_storage_failures: 0,
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Returns the number of failures in a row.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Moves to `Running`.
    pub fn begin_cycle(&mut self) -> SyncResult<()> {
        if self.state.is_terminal() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", self.state),
                to: "Running".into(),
            });
        }
        self.state = LoopState::Running;
        Ok(())
    }

    /// Records a successful cycle and resets the failure counters.
    pub fn record_success(&mut self) {
        if !self.state.is_terminal() {
            self.state = LoopState::Idle;
        }
        self.consecutive_failures = 0;
        self.consecutive_storage_failures = 0;
    }

    /// Records a failed cycle and decides what happens next.
    pub fn record_failure(&mut self, error: &SyncError) -> RetryDecision {
        match error.class() {
            ErrorClass::Cancelled => {
                self.state = LoopState::Cancelled;
                return RetryDecision::Stop;
            }
            ErrorClass::Fatal | ErrorClass::Lifecycle => {
                self.state = LoopState::Failed;
                return RetryDecision::Escalate(error.clone());
            }
            ErrorClass::Storage => self.consecutive_storage_failures += 1,
            ErrorClass::Transport | ErrorClass::Validation => {
                self.consecutive_storage_failures = 0;
            }
        }

        self.consecutive_failures = self.consecutive_failures.saturating_add(1);

        if self.consecutive_storage_failures >= self.storage_failure_threshold {
            self.state = LoopState::Failed;
            return RetryDecision::Escalate(SyncError::Fatal {
                consecutive: self.consecutive_storage_failures,
                source: Box::new(error.clone()),
            });
        }

        self.state = LoopState::Backoff;
        RetryDecision::Retry {
            delay: self.config.delay_for_failure(self.consecutive_failures),
            consecutive_failures: self.consecutive_failures,
        }
    }

    /// Moves to `Cancelled`.
    pub fn cancel(&mut self) {
        if self.state != LoopState::Failed {
            self.state = LoopState::Cancelled;
        }
    }
}
