//! Master adapter abstraction.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use replidb_protocol::{
    Checkpoint, MasterEvent, PullRequest, PullResponse, PushOutcome, PushRequest, PushResponse,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{broadcast, Notify};

/// Access to the authoritative store.
///
/// This trait abstracts the backend, allowing for different implementations
/// (HTTP, WebSocket, an in-process server, mock for testing, etc.).
#[async_trait]
pub trait MasterAdapter: Send + Sync {
    /// Returns changes strictly after the request checkpoint, ascending by
    /// checkpoint. May redeliver, never skips.
    async fn changed_documents_since(&self, request: &PullRequest) -> SyncResult<PullResponse>;

    /// Offers a batch of fork writes. Each row is accepted or rejected on its
    /// own, atomically against the row's assumed master state.
    async fn send_write_batch(&self, request: &PushRequest) -> SyncResult<PushResponse>;

    /// Returns a feed of master activity, if the backend has one.
    fn change_stream(&self) -> Option<broadcast::Receiver<MasterEvent>> {
        None
    }
}

/// A scripted master for testing.
///
/// Queued responses are returned in order. With an empty queue a pull returns
/// an empty batch and every pushed row is accepted.
pub struct MockMaster {
    connected: AtomicBool,
    next_checkpoint: AtomicU64,
    pull_responses: Mutex<VecDeque<SyncResult<PullResponse>>>,
    push_responses: Mutex<VecDeque<SyncResult<PushResponse>>>,
    pull_requests: Mutex<Vec<PullRequest>>,
    push_requests: Mutex<Vec<PushRequest>>,
    events: broadcast::Sender<MasterEvent>,
    hold_pulls: AtomicBool,
    pull_entered: Notify,
    pull_released: Notify,
}

impl MockMaster {
    /// Creates a new mock master.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            connected: AtomicBool::new(true),
            next_checkpoint: AtomicU64::new(1),
            pull_responses: Mutex::new(VecDeque::new()),
            push_responses: Mutex::new(VecDeque::new()),
            pull_requests: Mutex::new(Vec::new()),
            push_requests: Mutex::new(Vec::new()),
            events,
            hold_pulls: AtomicBool::new(false),
            pull_entered: Notify::new(),
            pull_released: Notify::new(),
        }
    }

    /// Queues a pull response.
    pub fn push_pull_response(&self, response: PullResponse) {
        self.pull_responses.lock().push_back(Ok(response));
    }

    /// Queues a pull failure.
    pub fn push_pull_error(&self, error: SyncError) {
        self.pull_responses.lock().push_back(Err(error));
    }

    /// Queues a push response.
    pub fn push_push_response(&self, response: PushResponse) {
        self.push_responses.lock().push_back(Ok(response));
    }

    /// Queues a push failure.
    pub fn push_push_error(&self, error: SyncError) {
        self.push_responses.lock().push_back(Err(error));
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Checks if the mock is connected.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Returns all pull requests received so far.
    pub fn pull_requests(&self) -> Vec<PullRequest> {
        self.pull_requests.lock().clone()
    }

    /// Returns all push requests received so far.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.push_requests.lock().clone()
    }

    /// Makes every following pull block until [`MockMaster::release_pull`].
    pub fn hold_pulls(&self) {
        self.hold_pulls.store(true, Ordering::SeqCst);
    }

    /// Waits until a held pull has been received.
    pub async fn pull_held(&self) {
        self.pull_entered.notified().await;
    }

    /// Lets one held pull continue and stops holding later ones.
    pub fn release_pull(&self) {
        self.hold_pulls.store(false, Ordering::SeqCst);
        self.pull_released.notify_one();
    }

    /// Emits a master event to change stream subscribers.
    pub fn notify(&self, event: MasterEvent) {
        let _ = self.events.send(event);
    }

    fn accept_all(&self, request: &PushRequest) -> PushResponse {
        let outcomes = request
            .rows
            .iter()
            .map(|_| PushOutcome::Accepted {
                checkpoint: Checkpoint::from_sequence(
                    self.next_checkpoint.fetch_add(1, Ordering::SeqCst),
                ),
            })
            .collect();
        PushResponse::new(outcomes)
    }
}

impl Default for MockMaster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MasterAdapter for MockMaster {
    async fn changed_documents_since(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.pull_requests.lock().push(request.clone());
        if self.hold_pulls.load(Ordering::SeqCst) {
            self.pull_entered.notify_one();
            self.pull_released.notified().await;
        }
        self.pull_responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(PullResponse::default()))
    }

    async fn send_write_batch(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        if !self.is_connected() {
            return Err(SyncError::NotConnected);
        }
        self.push_requests.lock().push(request.clone());
        let scripted = self.push_responses.lock().pop_front();
        scripted.unwrap_or_else(|| Ok(self.accept_all(request)))
    }

    fn change_stream(&self) -> Option<broadcast::Receiver<MasterEvent>> {
        Some(self.events.subscribe())
    }
}
