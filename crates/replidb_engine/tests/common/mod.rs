//! Shared helpers for the replication integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use replidb_engine::{
    CheckpointStore, MasterAdapter, MemoryFork, ReplicationConfig, ReplicationSession,
    RetryConfig, SyncError, SyncResult,
};
use replidb_master::MasterServer;
use replidb_protocol::{
    MasterEvent, Payload, PullRequest, PullResponse, PushRequest, PushResponse, SyncMessage,
};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// A master adapter that talks CBOR to an in-process [`MasterServer`].
pub struct LoopbackMaster {
    server: Arc<MasterServer>,
    connected: AtomicBool,
    change_stream: bool,
    failing_pulls: AtomicU32,
    push_batches: Mutex<Vec<usize>>,
}

impl LoopbackMaster {
    pub fn new(server: Arc<MasterServer>) -> Self {
        Self {
            server,
            connected: AtomicBool::new(true),
            change_stream: true,
            failing_pulls: AtomicU32::new(0),
            push_batches: Mutex::new(Vec::new()),
        }
    }

    /// Hides the server's change stream, so only polling or resync wakes pull.
    pub fn without_change_stream(mut self) -> Self {
        self.change_stream = false;
        self
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn fail_next_pulls(&self, count: u32) {
        self.failing_pulls.store(count, Ordering::SeqCst);
    }

    /// Row counts of every push request received.
    pub fn push_batches(&self) -> Vec<usize> {
        self.push_batches.lock().clone()
    }

    fn roundtrip(&self, message: SyncMessage) -> SyncResult<SyncMessage> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }
        let bytes = message.encode()?;
        let reply = self
            .server
            .handle_encoded(&bytes)
            .map_err(|e| SyncError::transport(e.to_string()))?;
        Ok(SyncMessage::decode(&reply)?)
    }
}

#[async_trait]
impl MasterAdapter for LoopbackMaster {
    async fn changed_documents_since(&self, request: &PullRequest) -> SyncResult<PullResponse> {
        let injected = self
            .failing_pulls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(SyncError::transport("injected pull failure"));
        }
        match self.roundtrip(SyncMessage::PullRequest(request.clone()))? {
            SyncMessage::PullResponse(response) => Ok(response),
            other => Err(SyncError::validation(format!(
                "unexpected reply type {}",
                other.type_code()
            ))),
        }
    }

    async fn send_write_batch(&self, request: &PushRequest) -> SyncResult<PushResponse> {
        self.push_batches.lock().push(request.rows.len());
        match self.roundtrip(SyncMessage::PushRequest(request.clone()))? {
            SyncMessage::PushResponse(response) => Ok(response),
            other => Err(SyncError::validation(format!(
                "unexpected reply type {}",
                other.type_code()
            ))),
        }
    }

    fn change_stream(&self) -> Option<broadcast::Receiver<MasterEvent>> {
        self.change_stream.then(|| self.server.subscribe())
    }
}

pub type Session = ReplicationSession<LoopbackMaster, MemoryFork>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn payload(value: serde_json::Value) -> Payload {
    value.as_object().cloned().unwrap()
}

pub fn quick_retry() -> RetryConfig {
    RetryConfig::fixed(Duration::from_millis(10))
}

pub fn one_shot(identity: &str) -> ReplicationConfig {
    ReplicationConfig::new(identity)
        .with_live(false)
        .with_retry(quick_retry())
}

pub fn live(identity: &str) -> ReplicationConfig {
    ReplicationConfig::new(identity).with_retry(quick_retry())
}

pub fn session(config: ReplicationConfig, master: &Arc<LoopbackMaster>, fork: &Arc<MemoryFork>) -> Session {
    ReplicationSession::new(
        config,
        Arc::clone(master),
        Arc::clone(fork),
        Arc::clone(fork) as Arc<dyn CheckpointStore>,
    )
}

/// Runs a one-shot session to completion.
pub async fn sync_once(identity: &str, master: &Arc<LoopbackMaster>, fork: &Arc<MemoryFork>) {
    let session = session(one_shot(identity), master, fork);
    session.start().unwrap();
    within(session.await_in_sync()).await.unwrap();
    session.shutdown().await;
}

/// Fails the test instead of hanging.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(10), future)
        .await
        .expect("timed out")
}
