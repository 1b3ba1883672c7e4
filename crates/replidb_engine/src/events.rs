//! Observation streams, lifecycle status and statistics.

use crate::error::SyncError;
use parking_lot::RwLock;
use replidb_protocol::{Direction, DocumentState};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, watch};

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// A failure reported on the error stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationErrorEvent {
    /// Direction that failed.
    pub direction: Direction,
    /// The failure.
    pub error: SyncError,
    /// Failures in a row, including this one.
    pub consecutive_failures: u32,
    /// True if the direction stopped.
    pub fatal: bool,
}

/// Phase of one direction loop.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectionPhase {
    /// Direction is not configured.
    Disabled,
    /// Session not started yet.
    Idle,
    /// A cycle is in flight.
    Busy,
    /// Last cycle found nothing more to transfer.
    Drained,
    /// Waiting to retry a failed cycle.
    Backoff,
    /// Stopped by cancellation.
    Cancelled,
    /// Stopped by fatal escalation.
    Failed(SyncError),
}

/// Status of one direction.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectionStatus {
    /// Current phase.
    pub phase: DirectionPhase,
    /// True once the direction drained for the first time.
    pub drained_once: bool,
}

impl DirectionStatus {
    fn new(enabled: bool) -> Self {
        Self {
            phase: if enabled {
                DirectionPhase::Idle
            } else {
                DirectionPhase::Disabled
            },
            drained_once: !enabled,
        }
    }

    /// Returns true if the direction has nothing left to transfer.
    pub fn is_drained(&self) -> bool {
        matches!(self.phase, DirectionPhase::Disabled | DirectionPhase::Drained)
    }
}

/// Combined status of both directions.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationStatus {
    /// Pull direction.
    pub pull: DirectionStatus,
    /// Push direction.
    pub push: DirectionStatus,
}

impl ReplicationStatus {
    /// Creates the status of a session that has not started.
    pub fn new(pull_enabled: bool, push_enabled: bool) -> Self {
        Self {
            pull: DirectionStatus::new(pull_enabled),
            push: DirectionStatus::new(push_enabled),
        }
    }

    /// Returns the status of one direction.
    pub fn direction(&self, direction: Direction) -> &DirectionStatus {
        match direction {
            Direction::Pull => &self.pull,
            Direction::Push => &self.push,
        }
    }

    fn direction_mut(&mut self, direction: Direction) -> &mut DirectionStatus {
        match direction {
            Direction::Pull => &mut self.pull,
            Direction::Push => &mut self.push,
        }
    }

    /// Returns true if both directions are drained right now.
    pub fn is_drained(&self) -> bool {
        self.pull.is_drained() && self.push.is_drained()
    }

    /// Returns true once both directions drained at least once.
    pub fn initial_replication_done(&self) -> bool {
        self.pull.drained_once && self.push.drained_once
    }

    /// Returns true if any cycle is in flight.
    pub fn is_active(&self) -> bool {
        self.pull.phase == DirectionPhase::Busy || self.push.phase == DirectionPhase::Busy
    }

    /// Returns the error that stops completion waiters, if any.
    ///
    /// A fatal failure takes precedence over cancellation.
    pub fn terminal_error(&self) -> Option<SyncError> {
        let phases = [&self.pull.phase, &self.push.phase];
        for phase in phases {
            if let DirectionPhase::Failed(err) = phase {
                return Some(err.clone());
            }
        }
        phases
            .iter()
            .any(|phase| **phase == DirectionPhase::Cancelled)
            .then_some(SyncError::Cancelled)
    }
}

/// Statistics about replication.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Pull cycles completed.
    pub pull_cycles: u64,
    /// Push cycles completed.
    pub push_cycles: u64,
    /// Documents written to the fork from master.
    pub documents_pulled: u64,
    /// Documents master accepted.
    pub documents_pushed: u64,
    /// Conflicts handed to the conflict handler.
    pub conflicts_resolved: u64,
    /// Failed cycles that were scheduled again.
    pub retries: u64,
    /// Last error message.
    pub last_error: Option<String>,
    /// Last successful cycle.
    pub last_sync_time: Option<Instant>,
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CycleReport {
    /// Documents transferred.
    pub documents: usize,
    /// Conflicts resolved.
    pub conflicts: usize,
    /// True if the direction has nothing more to transfer.
    pub drained: bool,
}

struct HubInner {
    errors: broadcast::Sender<ReplicationErrorEvent>,
    sent: broadcast::Sender<DocumentState>,
    received: broadcast::Sender<DocumentState>,
    active: watch::Sender<bool>,
    status: watch::Sender<ReplicationStatus>,
    stats: RwLock<SyncStats>,
}

/// Fan-out point for everything a session reports.
#[derive(Clone)]
pub struct EventHub {
    inner: Arc<HubInner>,
}

impl EventHub {
    /// Creates a hub for a session with the given directions enabled.
    pub fn new(pull_enabled: bool, push_enabled: bool) -> Self {
        let (errors, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (sent, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (received, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (active, _) = watch::channel(false);
        let (status, _) = watch::channel(ReplicationStatus::new(pull_enabled, push_enabled));
        Self {
            inner: Arc::new(HubInner {
                errors,
                sent,
                received,
                active,
                status,
                stats: RwLock::new(SyncStats::default()),
            }),
        }
    }

    /// Subscribes to reported failures.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ReplicationErrorEvent> {
        self.inner.errors.subscribe()
    }

    /// Subscribes to documents master accepted.
    pub fn subscribe_sent(&self) -> broadcast::Receiver<DocumentState> {
        self.inner.sent.subscribe()
    }

    /// Subscribes to documents written to the fork from master.
    pub fn subscribe_received(&self) -> broadcast::Receiver<DocumentState> {
        self.inner.received.subscribe()
    }

    /// Watches whether any cycle is in flight.
    pub fn watch_active(&self) -> watch::Receiver<bool> {
        self.inner.active.subscribe()
    }

    /// Watches the lifecycle status.
    pub fn watch_status(&self) -> watch::Receiver<ReplicationStatus> {
        self.inner.status.subscribe()
    }

    /// Returns the current status.
    pub fn status(&self) -> ReplicationStatus {
        self.inner.status.borrow().clone()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.inner.stats.read().clone()
    }

    pub(crate) fn set_phase(&self, direction: Direction, phase: DirectionPhase) {
        self.inner.status.send_if_modified(|status| {
            let entry = status.direction_mut(direction);
            if entry.phase == DirectionPhase::Disabled || entry.phase == phase {
                return false;
            }
            if phase == DirectionPhase::Drained {
                entry.drained_once = true;
            }
            entry.phase = phase;
            true
        });
        let active = self.inner.status.borrow().is_active();
        self.inner.active.send_if_modified(|current| {
            let changed = *current != active;
            *current = active;
            changed
        });
    }

    pub(crate) fn emit_sent(&self, document: &DocumentState) {
        let _ = self.inner.sent.send(document.clone());
    }

    pub(crate) fn emit_received(&self, document: &DocumentState) {
        let _ = self.inner.received.send(document.clone());
    }

    pub(crate) fn report_error(&self, event: ReplicationErrorEvent) {
        {
            let mut stats = self.inner.stats.write();
            stats.last_error = Some(event.error.to_string());
            if !event.fatal {
                stats.retries += 1;
            }
        }
        let _ = self.inner.errors.send(event);
    }

    pub(crate) fn record_cycle(&self, direction: Direction, report: &CycleReport) {
        let mut stats = self.inner.stats.write();
        match direction {
            Direction::Pull => {
                stats.pull_cycles += 1;
                stats.documents_pulled += report.documents as u64;
            }
            Direction::Push => {
                stats.push_cycles += 1;
                stats.documents_pushed += report.documents as u64;
            }
        }
        stats.conflicts_resolved += report.conflicts as u64;
        stats.last_sync_time = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_directions_count_as_drained() {
        let status = ReplicationStatus::new(true, false);
        assert!(status.push.is_drained());
        assert!(status.push.drained_once);
        assert!(!status.is_drained());
        assert!(!status.initial_replication_done());
    }

    #[test]
    fn drained_once_sticks() {
        let hub = EventHub::new(true, true);
        hub.set_phase(Direction::Pull, DirectionPhase::Drained);
        hub.set_phase(Direction::Push, DirectionPhase::Drained);
        assert!(hub.status().initial_replication_done());

        hub.set_phase(Direction::Pull, DirectionPhase::Busy);
        let status = hub.status();
        assert!(status.initial_replication_done());
        assert!(!status.is_drained());
        assert!(status.is_active());
        assert!(*hub.watch_active().borrow());
    }

    #[test]
    fn disabled_phase_never_changes() {
        let hub = EventHub::new(false, true);
        hub.set_phase(Direction::Pull, DirectionPhase::Busy);
        assert_eq!(hub.status().pull.phase, DirectionPhase::Disabled);
    }

    #[test]
    fn terminal_error_prefers_fatal() {
        let fatal = SyncError::Fatal {
            consecutive: 5,
            source: Box::new(SyncError::storage("disk full")),
        };
        let mut status = ReplicationStatus::new(true, true);
        assert_eq!(status.terminal_error(), None);

        status.pull.phase = DirectionPhase::Cancelled;
        assert_eq!(status.terminal_error(), Some(SyncError::Cancelled));

        status.push.phase = DirectionPhase::Failed(fatal.clone());
        assert_eq!(status.terminal_error(), Some(fatal));
    }

    #[tokio::test]
    async fn errors_reach_subscribers_and_stats() {
        let hub = EventHub::new(true, true);
        let mut errors = hub.subscribe_errors();

        hub.report_error(ReplicationErrorEvent {
            direction: Direction::Push,
            error: SyncError::Timeout,
            consecutive_failures: 1,
            fatal: false,
        });

        let event = errors.recv().await.unwrap();
        assert_eq!(event.direction, Direction::Push);
        assert_eq!(hub.stats().retries, 1);
        assert_eq!(hub.stats().last_error.as_deref(), Some("operation timed out"));
    }

    #[test]
    fn cycle_stats() {
        let hub = EventHub::new(true, true);
        hub.record_cycle(
            Direction::Pull,
            &CycleReport {
                documents: 3,
                conflicts: 1,
                drained: true,
            },
        );
        hub.record_cycle(
            Direction::Push,
            &CycleReport {
                documents: 2,
                conflicts: 0,
                drained: true,
            },
        );

        let stats = hub.stats();
        assert_eq!(stats.pull_cycles, 1);
        assert_eq!(stats.documents_pulled, 3);
        assert_eq!(stats.documents_pushed, 2);
        assert_eq!(stats.conflicts_resolved, 1);
        assert!(stats.last_sync_time.is_some());
    }
}
