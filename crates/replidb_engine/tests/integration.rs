//! Integration tests for replication between forks and the reference master.

mod common;

use common::{init_tracing, live, one_shot, payload, session, sync_once, within, LoopbackMaster};
use replidb_engine::{
    CheckpointStore, DirectionConfig, EngineContext, EventHub, FileCheckpointStore, MemoryFork,
    PullEngine, ReplicationSession, SyncError,
};
use replidb_master::MasterServer;
use replidb_protocol::{ConflictPolicy, Direction, DocumentKey, ReplicationIdentity};
use serde_json::json;
use std::sync::Arc;

fn setup() -> (Arc<MasterServer>, Arc<LoopbackMaster>) {
    init_tracing();
    let server = Arc::new(MasterServer::default());
    let master = Arc::new(LoopbackMaster::new(Arc::clone(&server)));
    (server, master)
}

fn key(name: &str) -> DocumentKey {
    DocumentKey::new(name)
}

fn id(name: &str) -> ReplicationIdentity {
    ReplicationIdentity::new(name)
}

#[tokio::test]
async fn two_forks_converge_through_master() {
    let (server, master) = setup();
    let fork_a = Arc::new(MemoryFork::new());
    let fork_b = Arc::new(MemoryFork::new());

    fork_a.upsert("a1", payload(json!({"owner": "a"})));
    fork_a.upsert("shared", payload(json!({"v": 1})));
    sync_once("fork-a", &master, &fork_a).await;

    fork_b.upsert("b1", payload(json!({"owner": "b"})));
    sync_once("fork-b", &master, &fork_b).await;
    assert_eq!(fork_b.get(&key("shared")).unwrap().get("v"), Some(&json!(1)));

    fork_b.upsert("shared", payload(json!({"v": 2})));
    sync_once("fork-b", &master, &fork_b).await;
    sync_once("fork-a", &master, &fork_a).await;

    let master_docs = server.store().live_documents();
    assert_eq!(master_docs.len(), 3);
    assert_eq!(fork_a.all_documents(), master_docs);
    assert_eq!(fork_b.all_documents(), master_docs);
    assert_eq!(fork_a.pending_count(&id("fork-a")), 0);
    assert_eq!(fork_b.pending_count(&id("fork-b")), 0);
}

#[tokio::test]
async fn pulled_batch_can_be_reapplied() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    for i in 0..3 {
        server.upsert(format!("d{i}"), payload(json!({"i": i})));
    }

    let ctx = EngineContext {
        identity: ReplicationIdentity::new("reapply"),
        master,
        fork: Arc::clone(&fork),
        checkpoints: Arc::clone(&fork) as Arc<dyn CheckpointStore>,
        resolver: Arc::new(ConflictPolicy::MasterWins),
        events: EventHub::new(true, false),
    };
    let engine = PullEngine::new(ctx, DirectionConfig::default());
    let rows = server.handle_pull(&replidb_protocol::PullRequest::new(None, 10)).unwrap().documents;

    let first = engine.apply_batch(&rows).await.unwrap();
    assert_eq!(first.written, 3);
    let snapshot = fork.all_documents();

    let second = engine.apply_batch(&rows).await.unwrap();
    assert_eq!(second.written, 0);
    assert_eq!(fork.all_documents(), snapshot);
}

#[tokio::test]
async fn concurrent_edit_resolves_to_master_state() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    server.upsert("p1", payload(json!({"firstName": "a"})));
    sync_once("person", &master, &fork).await;

    fork.upsert("p1", payload(json!({"firstName": "c1"})));
    server.upsert("p1", payload(json!({"firstName": "c2"})));

    let session = session(one_shot("person"), &master, &fork);
    session.start().unwrap();
    within(session.await_in_sync()).await.unwrap();

    let local = fork.get(&key("p1")).unwrap();
    assert_eq!(local.get("firstName"), Some(&json!("c2")));
    assert_eq!(server.get(&key("p1")).unwrap().get("firstName"), Some(&json!("c2")));
    assert_eq!(fork.pending_count(&id("person")), 0);
    assert_eq!(session.stats().conflicts_resolved, 1);
    session.shutdown().await;
}

#[tokio::test]
async fn fork_wins_handler_pushes_local_edit() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    server.upsert("p1", payload(json!({"firstName": "a"})));
    sync_once("person", &master, &fork).await;

    fork.upsert("p1", payload(json!({"firstName": "c1"})));
    server.upsert("p1", payload(json!({"firstName": "c2"})));

    let session = session(one_shot("person"), &master, &fork)
        .with_conflict_handler(ConflictPolicy::ForkWins);
    session.start().unwrap();
    within(session.await_in_sync()).await.unwrap();
    session.shutdown().await;

    assert_eq!(server.get(&key("p1")).unwrap().get("firstName"), Some(&json!("c1")));
    assert_eq!(fork.get(&key("p1")).unwrap().get("firstName"), Some(&json!("c1")));
    assert_eq!(fork.pending_count(&id("person")), 0);
}

#[tokio::test]
async fn independent_creates_of_same_key_resolve_as_update_conflict() {
    // Assumes a create the master already holds is an update conflict.
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    fork.upsert("p1", payload(json!({"n": 1})));
    server.upsert("p1", payload(json!({"n": 2})));

    sync_once("person", &master, &fork).await;

    assert_eq!(fork.get(&key("p1")).unwrap().get("n"), Some(&json!(2)));
    assert_eq!(server.get(&key("p1")).unwrap().get("n"), Some(&json!(2)));
    assert_eq!(fork.pending_count(&id("person")), 0);
}

#[tokio::test]
async fn failed_checkpoint_save_refetches_batch() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    for i in 0..3 {
        server.upsert(format!("d{i}"), payload(json!({"i": i})));
    }
    fork.fail_next_checkpoint_saves(1);

    let session = session(one_shot("crash").pull_only(), &master, &fork);
    let mut errors = session.subscribe_errors();
    session.start().unwrap();
    within(session.await_initial_replication()).await.unwrap();
    session.shutdown().await;

    let event = errors.try_recv().unwrap();
    assert_eq!(event.direction, Direction::Pull);
    assert!(matches!(event.error, SyncError::Storage(_)));
    assert!(!event.fatal);

    assert_eq!(fork.all_documents(), server.store().live_documents());
    let identity = ReplicationIdentity::new("crash");
    assert_eq!(
        fork.load(&identity, Direction::Pull).unwrap(),
        Some(server.checkpoint())
    );
    assert_eq!(session.stats().retries, 1);
}

#[tokio::test]
async fn push_filter_keeps_documents_local() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    fork.upsert("old", payload(json!({"age": 35})));
    fork.upsert("young", payload(json!({"age": 27})));

    let filtered = DirectionConfig::default().with_filter(|doc| {
        doc.get("age")
            .and_then(|age| age.as_i64())
            .is_some_and(|age| age > 30)
    });
    let session = session(one_shot("ages").push_only().with_push(filtered), &master, &fork);
    session.start().unwrap();
    within(session.await_in_sync()).await.unwrap();
    session.shutdown().await;

    let on_master = server.store().live_documents();
    assert_eq!(on_master.len(), 1);
    assert_eq!(on_master[0].key, key("old"));
    assert!(fork.document(&id("ages"), &key("young")).unwrap().needs_push());
}

#[tokio::test]
async fn push_respects_batch_size() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    for i in 0..12 {
        fork.upsert(format!("d{i:02}"), payload(json!({"i": i})));
    }

    let config = one_shot("batches")
        .push_only()
        .with_push(DirectionConfig::new(5));
    let session = session(config, &master, &fork);
    session.start().unwrap();
    within(session.await_in_sync()).await.unwrap();
    session.shutdown().await;

    assert_eq!(master.push_batches(), vec![5, 5, 2]);
    assert_eq!(server.store().len(), 12);
    assert_eq!(fork.pending_count(&id("batches")), 0);
}

#[tokio::test]
async fn rapid_edits_are_pushed_once() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    fork.upsert("p1", payload(json!({"v": 1})));
    fork.upsert("p1", payload(json!({"v": 2})));

    let session = session(one_shot("coalesce").push_only(), &master, &fork);
    let mut sent = session.subscribe_sent();
    session.start().unwrap();
    within(session.await_in_sync()).await.unwrap();
    session.shutdown().await;

    assert_eq!(master.push_batches(), vec![1]);
    assert_eq!(sent.try_recv().unwrap().get("v"), Some(&json!(2)));
    assert!(sent.try_recv().is_err());
    assert_eq!(server.get(&key("p1")).unwrap().get("v"), Some(&json!(2)));
}

#[tokio::test]
async fn repeated_storage_failures_are_fatal() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    server.upsert("p1", payload(json!({"v": 1})));
    fork.fail_next_writes(100);

    let config = live("fatal").pull_only().with_storage_failure_threshold(3);
    let session = session(config, &master, &fork);
    let mut errors = session.subscribe_errors();
    session.start().unwrap();

    let err = within(session.await_initial_replication()).await.unwrap_err();
    assert!(matches!(err, SyncError::Fatal { consecutive: 3, .. }));

    let mut saw_fatal = false;
    while let Ok(event) = errors.try_recv() {
        saw_fatal |= event.fatal;
    }
    assert!(saw_fatal);
    within(session.shutdown()).await;
    assert!(!session.is_running());
}

#[tokio::test]
async fn cancel_rejects_pending_waiters() {
    let (_server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    master.set_connected(false);

    let session = Arc::new(session(live("offline"), &master, &fork));
    session.start().unwrap();

    let waiter = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.await_initial_replication().await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    session.cancel();

    let result = within(waiter).await.unwrap();
    assert_eq!(result, Err(SyncError::Cancelled));
    within(session.shutdown()).await;
    assert_eq!(within(session.await_in_sync()).await, Err(SyncError::Cancelled));
}

#[tokio::test]
async fn transient_pull_failures_recover() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    server.upsert("p1", payload(json!({"v": 1})));
    master.fail_next_pulls(2);

    let session = session(one_shot("flaky").pull_only(), &master, &fork);
    let mut errors = session.subscribe_errors();
    session.start().unwrap();
    within(session.await_initial_replication()).await.unwrap();
    session.shutdown().await;

    assert_eq!(errors.try_recv().unwrap().consecutive_failures, 1);
    assert_eq!(errors.try_recv().unwrap().consecutive_failures, 2);
    assert!(fork.get(&key("p1")).is_some());
}

#[tokio::test]
async fn live_session_follows_both_sides() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());

    let session = session(live("follow"), &master, &fork);
    let mut received = session.subscribe_received();
    let mut sent = session.subscribe_sent();
    session.start().unwrap();
    within(session.await_initial_replication()).await.unwrap();

    server.upsert("remote", payload(json!({"from": "master"})));
    let doc = within(received.recv()).await.unwrap();
    assert_eq!(doc.key, key("remote"));

    fork.upsert("local", payload(json!({"from": "fork"})));
    let doc = within(sent.recv()).await.unwrap();
    assert_eq!(doc.key, key("local"));

    within(session.await_in_sync()).await.unwrap();
    assert_eq!(fork.all_documents(), server.store().live_documents());
    session.shutdown().await;
}

#[tokio::test]
async fn resync_wakes_pull_without_change_stream() {
    init_tracing();
    let server = Arc::new(MasterServer::default());
    let master = Arc::new(LoopbackMaster::new(Arc::clone(&server)).without_change_stream());
    let fork = Arc::new(MemoryFork::new());

    let session = session(live("resync").pull_only(), &master, &fork);
    let mut received = session.subscribe_received();
    session.start().unwrap();
    within(session.await_initial_replication()).await.unwrap();

    server.upsert("late", payload(json!({"v": 1})));
    session.resync();
    let doc = within(received.recv()).await.unwrap();
    assert_eq!(doc.key, key("late"));
    session.shutdown().await;
}

#[tokio::test]
async fn file_checkpoints_survive_restart() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checkpoints.cbor");
    for i in 0..4 {
        server.upsert(format!("d{i}"), payload(json!({"i": i})));
    }

    let store: Arc<dyn CheckpointStore> = Arc::new(FileCheckpointStore::open(&path).unwrap());
    let session = ReplicationSession::new(
        one_shot("durable").pull_only(),
        Arc::clone(&master),
        Arc::clone(&fork),
        store,
    );
    session.start().unwrap();
    within(session.await_initial_replication()).await.unwrap();
    session.shutdown().await;

    let reopened = FileCheckpointStore::open(&path).unwrap();
    let identity = ReplicationIdentity::new("durable");
    assert_eq!(
        reopened.load(&identity, Direction::Pull).unwrap(),
        Some(server.checkpoint())
    );
    assert_eq!(reopened.load(&identity, Direction::Push).unwrap(), None);
}

#[tokio::test]
async fn pull_batch_above_master_cap_drains_everything() {
    let (server, master) = setup();
    let fork = Arc::new(MemoryFork::new());
    for i in 0..150 {
        server.upsert(format!("d{i:03}"), payload(json!({"i": i})));
    }

    let config = one_shot("capped")
        .pull_only()
        .with_pull(DirectionConfig::new(200));
    let session = session(config, &master, &fork);
    session.start().unwrap();
    within(session.await_in_sync()).await.unwrap();
    session.shutdown().await;

    assert_eq!(fork.all_documents().len(), 150);
    assert_eq!(
        fork.load(&id("capped"), Direction::Pull).unwrap(),
        Some(server.checkpoint())
    );
}

#[tokio::test]
async fn one_fork_pushes_to_each_master_independently() {
    init_tracing();
    let server_a = Arc::new(MasterServer::default());
    let server_b = Arc::new(MasterServer::default());
    let master_a = Arc::new(LoopbackMaster::new(Arc::clone(&server_a)));
    let master_b = Arc::new(LoopbackMaster::new(Arc::clone(&server_b)));
    let fork = Arc::new(MemoryFork::new());
    fork.upsert("shared", payload(json!({"v": 1})));

    for (name, master) in [("to-a", &master_a), ("to-b", &master_b)] {
        let session = session(one_shot(name).push_only(), master, &fork);
        session.start().unwrap();
        within(session.await_in_sync()).await.unwrap();
        session.shutdown().await;
    }

    assert_eq!(server_a.get(&key("shared")).unwrap().get("v"), Some(&json!(1)));
    assert_eq!(server_b.get(&key("shared")).unwrap().get("v"), Some(&json!(1)));
    assert_eq!(fork.pending_count(&id("to-a")), 0);
    assert_eq!(fork.pending_count(&id("to-b")), 0);

    fork.upsert("shared", payload(json!({"v": 2})));
    assert_eq!(fork.pending_count(&id("to-a")), 1);
    assert_eq!(fork.pending_count(&id("to-b")), 1);
}

#[tokio::test]
async fn concurrent_live_sessions_converge() {
    let (server, master) = setup();
    let fork_a = Arc::new(MemoryFork::new());
    let fork_b = Arc::new(MemoryFork::new());
    let session_a = session(live("fork-a"), &master, &fork_a);
    let session_b = session(live("fork-b"), &master, &fork_b);
    session_a.start().unwrap();
    session_b.start().unwrap();
    within(session_a.await_initial_replication()).await.unwrap();
    within(session_b.await_initial_replication()).await.unwrap();

    let writer_a = {
        let fork = Arc::clone(&fork_a);
        tokio::spawn(async move {
            for i in 0..20 {
                fork.upsert(format!("a{i:02}"), payload(json!({"i": i})));
                fork.upsert("shared", payload(json!({"by": "a", "i": i})));
                tokio::task::yield_now().await;
            }
        })
    };
    let writer_b = {
        let fork = Arc::clone(&fork_b);
        tokio::spawn(async move {
            for i in 0..20 {
                fork.upsert(format!("b{i:02}"), payload(json!({"i": i})));
                fork.upsert("shared", payload(json!({"by": "b", "i": i})));
                tokio::task::yield_now().await;
            }
        })
    };
    writer_a.await.unwrap();
    writer_b.await.unwrap();

    within(async {
        loop {
            let on_master = server.store().live_documents();
            if on_master.len() == 41
                && fork_a.all_documents() == on_master
                && fork_b.all_documents() == on_master
                && fork_a.pending_count(&id("fork-a")) == 0
                && fork_b.pending_count(&id("fork-b")) == 0
            {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;

    session_a.shutdown().await;
    session_b.shutdown().await;
}
