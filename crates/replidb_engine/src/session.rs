//! Replication sessions: one pull loop and one push loop per identity.

use crate::checkpoint::CheckpointStore;
use crate::config::ReplicationConfig;
use crate::engine::{DirectionEngine, EngineContext};
use crate::error::{SyncError, SyncResult};
use crate::events::{
    DirectionPhase, EventHub, ReplicationErrorEvent, ReplicationStatus, SyncStats,
};
use crate::fork::ForkAdapter;
use crate::master::MasterAdapter;
use crate::pull::PullEngine;
use crate::push::PushEngine;
use crate::retry::{RetryController, RetryDecision};
use parking_lot::Mutex;
use replidb_protocol::{
    ConflictHandler, ConflictPolicy, Direction, DocumentKey, DocumentState, MasterEvent,
    ReplicationIdentity,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Keeps one fork in sync with one master.
///
/// Sessions are independent of each other; all state for an identity lives in
/// its session. The pull and push loops run as separate tokio tasks, but their
/// cycles never overlap so that a pull never races a push of the same
/// document.
pub struct ReplicationSession<M, F> {
    config: ReplicationConfig,
    ctx: EngineContext<M, F>,
    cancel: watch::Sender<bool>,
    pause: watch::Sender<bool>,
    resync: Arc<Notify>,
    cycle_lock: Arc<AsyncMutex<()>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl<M, F> ReplicationSession<M, F>
where
    M: MasterAdapter + 'static,
    F: ForkAdapter + 'static,
{
    /// Creates a session using the master-wins conflict policy.
    pub fn new(
        config: ReplicationConfig,
        master: Arc<M>,
        fork: Arc<F>,
        checkpoints: Arc<dyn CheckpointStore>,
    ) -> Self {
        let events = EventHub::new(config.pull.is_some(), config.push.is_some());
        let (cancel, _) = watch::channel(false);
        let (pause, _) = watch::channel(false);
        Self {
            ctx: EngineContext {
                identity: config.identity.clone(),
                master,
                fork,
                checkpoints,
                resolver: Arc::new(ConflictPolicy::MasterWins),
                events,
            },
            config,
            cancel,
            pause,
            resync: Arc::new(Notify::new()),
            cycle_lock: Arc::new(AsyncMutex::new(())),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Replaces the conflict handler.
    pub fn with_conflict_handler(mut self, handler: impl ConflictHandler + 'static) -> Self {
        self.ctx.resolver = Arc::new(handler);
        self
    }

    /// Returns the replication identity.
    pub fn identity(&self) -> &ReplicationIdentity {
        &self.ctx.identity
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    /// Spawns the direction loops. Must be called from a tokio runtime.
    pub fn start(&self) -> SyncResult<()> {
        if *self.cancel.borrow() {
            return Err(SyncError::InvalidStateTransition {
                from: "Cancelled".into(),
                to: "Running".into(),
            });
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::InvalidStateTransition {
                from: "Running".into(),
                to: "Running".into(),
            });
        }

        info!(
            identity = %self.ctx.identity,
            live = self.config.live,
            pull = self.config.pull.is_some(),
            push = self.config.push.is_some(),
            "starting replication"
        );

        let mut tasks = self.tasks.lock();
        if let Some(pull) = &self.config.pull {
            let wakeup = Wakeup {
                source: WakeSource::Master(self.ctx.master.change_stream()),
                resync: Some(Arc::clone(&self.resync)),
                poll_interval: self.config.poll_interval,
            };
            let engine = PullEngine::new(self.ctx.clone(), pull.clone());
            tasks.push(tokio::spawn(run_loop(engine, self.loop_context(wakeup))));
        }
        if let Some(push) = &self.config.push {
            let wakeup = Wakeup {
                source: WakeSource::Fork(Some(self.ctx.fork.subscribe_writes())),
                resync: None,
                poll_interval: None,
            };
            let engine = PushEngine::new(self.ctx.clone(), push.clone());
            tasks.push(tokio::spawn(run_loop(engine, self.loop_context(wakeup))));
        }
        Ok(())
    }

    fn loop_context(&self, wakeup: Wakeup) -> LoopContext {
        LoopContext {
            identity: self.ctx.identity.clone(),
            live: self.config.live,
            retry: RetryController::new(
                self.config.retry.clone(),
                self.config.storage_failure_threshold,
            ),
            events: self.ctx.events.clone(),
            cancel: self.cancel.subscribe(),
            pause: self.pause.subscribe(),
            cycle_lock: Arc::clone(&self.cycle_lock),
            wakeup,
        }
    }

    /// Stops scheduling new cycles. An in-flight cycle runs to completion.
    pub fn cancel(&self) {
        info!(identity = %self.ctx.identity, "cancelling replication");
        self.cancel.send_replace(true);
        if !self.started.load(Ordering::SeqCst) {
            self.ctx.events.set_phase(Direction::Pull, DirectionPhase::Cancelled);
            self.ctx.events.set_phase(Direction::Push, DirectionPhase::Cancelled);
        }
    }

    /// Cancels and waits for both loops to stop.
    pub async fn shutdown(&self) {
        self.cancel();
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(identity = %self.ctx.identity, error = %err, "direction task ended abnormally");
            }
        }
    }

    /// Suspends both loops after their in-flight cycles.
    pub fn pause(&self) {
        info!(identity = %self.ctx.identity, "pausing replication");
        self.pause.send_replace(true);
    }

    /// Resumes suspended loops.
    pub fn resume(&self) {
        info!(identity = %self.ctx.identity, "resuming replication");
        self.pause.send_replace(false);
    }

    /// Returns true if the loops are suspended.
    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Wakes a drained pull loop as a master notification would.
    pub fn resync(&self) {
        debug!(identity = %self.ctx.identity, "resync requested");
        self.resync.notify_one();
    }

    /// Returns true while a direction loop is still running.
    pub fn is_running(&self) -> bool {
        self.tasks.lock().iter().any(|task| !task.is_finished())
    }

    /// Deletes this identity's checkpoints. Not allowed while running.
    pub fn reset_checkpoints(&self) -> SyncResult<()> {
        if self.is_running() {
            return Err(SyncError::InvalidStateTransition {
                from: "Running".into(),
                to: "Reset".into(),
            });
        }
        info!(identity = %self.ctx.identity, "resetting checkpoints");
        self.ctx.checkpoints.reset(&self.ctx.identity)
    }

    /// Returns the current lifecycle status.
    pub fn status(&self) -> ReplicationStatus {
        self.ctx.events.status()
    }

    /// Returns a snapshot of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.ctx.events.stats()
    }

    /// Subscribes to reported failures.
    pub fn subscribe_errors(&self) -> broadcast::Receiver<ReplicationErrorEvent> {
        self.ctx.events.subscribe_errors()
    }

    /// Subscribes to documents master accepted.
    pub fn subscribe_sent(&self) -> broadcast::Receiver<DocumentState> {
        self.ctx.events.subscribe_sent()
    }

    /// Subscribes to documents written to the fork from master.
    pub fn subscribe_received(&self) -> broadcast::Receiver<DocumentState> {
        self.ctx.events.subscribe_received()
    }

    /// Watches whether any cycle is in flight.
    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.ctx.events.watch_active()
    }

    /// Resolves once both directions drained for the first time.
    ///
    /// Fails with `Cancelled` if the session stops first, or with the fatal
    /// error if a direction escalated. Retryable failures never fail it.
    pub async fn await_initial_replication(&self) -> SyncResult<()> {
        let mut status = self.ctx.events.watch_status();
        loop {
            let outcome = {
                let current = status.borrow_and_update();
                if current.initial_replication_done() {
                    Some(Ok(()))
                } else {
                    current.terminal_error().map(Err)
                }
            };
            if let Some(outcome) = outcome {
                return outcome;
            }
            if status.changed().await.is_err() {
                return Err(SyncError::Cancelled);
            }
        }
    }

    /// Resolves when both directions are drained and no local write waits to
    /// be pushed. Can be awaited again after later activity.
    pub async fn await_in_sync(&self) -> SyncResult<()> {
        let mut status = self.ctx.events.watch_status();
        loop {
            let (drained, terminal) = {
                let current = status.borrow_and_update();
                (current.is_drained(), current.terminal_error())
            };
            if drained && !self.push_pending().await {
                return Ok(());
            }
            if let Some(err) = terminal {
                return Err(err);
            }
            if status.changed().await.is_err() {
                return Err(SyncError::Cancelled);
            }
        }
    }

    async fn push_pending(&self) -> bool {
        let Some(push) = &self.config.push else {
            return false;
        };
        if !self.config.live {
            return false;
        }
        let engine = PushEngine::new(self.ctx.clone(), push.clone());
        match engine.has_pending().await {
            Ok(pending) => pending,
            Err(err) => {
                debug!(identity = %self.ctx.identity, error = %err, "pending check failed");
                true
            }
        }
    }
}

impl<M, F> Drop for ReplicationSession<M, F> {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

enum WakeSource {
    Master(Option<broadcast::Receiver<MasterEvent>>),
    Fork(Option<broadcast::Receiver<DocumentKey>>),
}

/// What wakes a drained live loop.
struct Wakeup {
    source: WakeSource,
    resync: Option<Arc<Notify>>,
    poll_interval: Option<Duration>,
}

impl Wakeup {
    async fn wait(&mut self) {
        let Wakeup {
            source,
            resync,
            poll_interval,
        } = self;
        tokio::select! {
            _ = next_signal(source) => {}
            _ = notified(resync.as_deref()) => trace!("woken by resync"),
            _ = sleep_or_pending(*poll_interval) => trace!("woken by poll interval"),
        }
    }
}

async fn next_signal(source: &mut WakeSource) {
    match source {
        WakeSource::Master(rx) => {
            if let Some(event) = recv_signal(rx).await {
                trace!(?event, "woken by master");
            }
        }
        WakeSource::Fork(rx) => {
            if let Some(key) = recv_signal(rx).await {
                trace!(key = %key, "woken by local write");
            }
        }
    }
}

/// Waits for the next message. A lagged receiver counts as a wakeup; a closed
/// one is dropped and never wakes again. Messages already buffered behind the
/// first are discarded, since one cycle covers them all.
async fn recv_signal<T: Clone>(rx: &mut Option<broadcast::Receiver<T>>) -> Option<T> {
    let Some(receiver) = rx.as_mut() else {
        return std::future::pending().await;
    };
    let result = receiver.recv().await;
    match result {
        Ok(message) => {
            discard_buffered(receiver);
            Some(message)
        }
        Err(RecvError::Lagged(skipped)) => {
            trace!(skipped, "signal receiver lagged");
            discard_buffered(receiver);
            None
        }
        Err(RecvError::Closed) => {
            *rx = None;
            std::future::pending().await
        }
    }
}

fn discard_buffered<T: Clone>(receiver: &mut broadcast::Receiver<T>) {
    let mut discarded = 0;
    loop {
        match receiver.try_recv() {
            Ok(_) => discarded += 1,
            Err(TryRecvError::Lagged(skipped)) => discarded += skipped as usize,
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
        }
    }
    if discarded > 0 {
        trace!(discarded, "coalesced buffered signals");
    }
}

async fn notified(notify: Option<&Notify>) {
    match notify {
        Some(notify) => notify.notified().await,
        None => std::future::pending().await,
    }
}

async fn sleep_or_pending(interval: Option<Duration>) {
    match interval {
        Some(interval) => tokio::time::sleep(interval).await,
        None => std::future::pending().await,
    }
}

async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    let _ = cancel.wait_for(|cancelled| *cancelled).await;
}

struct LoopContext {
    identity: ReplicationIdentity,
    live: bool,
    retry: RetryController,
    events: EventHub,
    cancel: watch::Receiver<bool>,
    pause: watch::Receiver<bool>,
    cycle_lock: Arc<AsyncMutex<()>>,
    wakeup: Wakeup,
}

impl LoopContext {
    fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Returns false if cancelled while paused.
    async fn wait_while_paused(&mut self) -> bool {
        if !*self.pause.borrow() {
            return true;
        }
        debug!(identity = %self.identity, "loop paused");
        let pause = &mut self.pause;
        tokio::select! {
            resumed = async move { pause.wait_for(|paused| !*paused).await.is_ok() } => resumed,
            _ = cancelled(&mut self.cancel) => false,
        }
    }
}

async fn run_loop<E: DirectionEngine>(engine: E, mut ctx: LoopContext) {
    let direction = engine.direction();
    debug!(identity = %ctx.identity, %direction, "direction loop started");

    loop {
        if ctx.is_cancelled() || !ctx.wait_while_paused().await {
            break;
        }
        if let Err(err) = ctx.retry.begin_cycle() {
            warn!(identity = %ctx.identity, %direction, error = %err, "cannot start cycle");
            break;
        }
        ctx.events.set_phase(direction, DirectionPhase::Busy);

        let result = {
            let _guard = ctx.cycle_lock.lock().await;
            engine.run_cycle().await
        };

        match result {
            Ok(report) => {
                ctx.retry.record_success();
                ctx.events.record_cycle(direction, &report);
                if !report.drained {
                    continue;
                }
                ctx.events.set_phase(direction, DirectionPhase::Drained);
                if !ctx.live {
                    info!(identity = %ctx.identity, %direction, "direction drained");
                    return;
                }
                let woken = tokio::select! {
                    _ = ctx.wakeup.wait() => true,
                    _ = cancelled(&mut ctx.cancel) => false,
                };
                if !woken {
                    break;
                }
            }
            Err(err) => match ctx.retry.record_failure(&err) {
                RetryDecision::Retry {
                    delay,
                    consecutive_failures,
                } => {
                    warn!(
                        identity = %ctx.identity,
                        %direction,
                        error = %err,
                        consecutive_failures,
                        delay_ms = delay.as_millis() as u64,
                        "cycle failed, retrying"
                    );
                    ctx.events.report_error(ReplicationErrorEvent {
                        direction,
                        error: err,
                        consecutive_failures,
                        fatal: false,
                    });
                    ctx.events.set_phase(direction, DirectionPhase::Backoff);
                    let slept = tokio::select! {
                        _ = tokio::time::sleep(delay) => true,
                        _ = cancelled(&mut ctx.cancel) => false,
                    };
                    if !slept {
                        break;
                    }
                }
                RetryDecision::Escalate(fatal) => {
                    error!(identity = %ctx.identity, %direction, error = %fatal, "direction stopped");
                    ctx.events.report_error(ReplicationErrorEvent {
                        direction,
                        error: fatal.clone(),
                        consecutive_failures: ctx.retry.consecutive_failures(),
                        fatal: true,
                    });
                    ctx.events.set_phase(direction, DirectionPhase::Failed(fatal));
                    return;
                }
                RetryDecision::Stop => break,
            },
        }
    }

    ctx.retry.cancel();
    ctx.events.set_phase(direction, DirectionPhase::Cancelled);
    info!(identity = %ctx.identity, %direction, "direction loop stopped");
}
