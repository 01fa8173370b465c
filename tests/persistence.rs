mod common;

use common::*;
use sparkplug_state::config::{Config, StoreConfig};
use sparkplug_state::sparkplug::{JsonPayloadCodec, MessageType, PayloadCodec};
use sparkplug_state::store::{FsStateStore, StatePersistence, StateStore, StoreError, StoreFuture};
use sparkplug_state::time::ManualClock;
use sparkplug_state::{MessageProcessor, NodeKey};
use std::sync::Arc;
use std::time::Duration;

/// Store that is never reachable.
struct DownStore;

impl StateStore for DownStore {
    fn put<'a>(&'a self, _: &'a str, _: Vec<u8>, _: Option<Duration>) -> StoreFuture<'a, ()> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }

    fn get<'a>(&'a self, _: &'a str) -> StoreFuture<'a, Option<Vec<u8>>> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }

    fn delete<'a>(&'a self, _: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }

    fn scan_prefix<'a>(&'a self, _: &'a str) -> StoreFuture<'a, Vec<String>> {
        Box::pin(async { Err(StoreError::Unavailable("connection refused".into())) })
    }
}

#[tokio::test]
async fn unreachable_store_never_blocks_processing() {
    let h = harness_with(Config::default());
    let processor = MessageProcessor::new(
        h.clock.clone(),
        Config::default(),
        h.transport.clone(),
        Arc::new(JsonPayloadCodec),
    )
    .with_persistence(Arc::new(StatePersistence::new(
        Arc::new(DownStore),
        StoreConfig::default(),
    )));

    processor.handle_connect(connect("C1", 10, true, 0)).await;
    processor.handle_publish(nbirth("C1", 0)).await.unwrap();
    processor.handle_publish(ndata("C1", 1)).await.unwrap();
    assert_eq!(processor.registry().node(&NodeKey::new("G1", "N1")).unwrap().seq, 1);
    assert!(processor.metrics().snapshot().persistence_failures >= 3);
}

#[tokio::test]
async fn restart_resumes_sequence_history_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::starting_at(1_700_000_000_000);
    let h = harness_with(Config::default());

    let store: Arc<dyn StateStore> = Arc::new(
        FsStateStore::open_with_clock(dir.path(), clock.clone())
            .await
            .unwrap(),
    );
    let persistence = Arc::new(StatePersistence::new(store.clone(), StoreConfig::default()));
    let first = MessageProcessor::new(
        clock.clone(),
        Config::default(),
        h.transport.clone(),
        Arc::new(JsonPayloadCodec),
    )
    .with_persistence(persistence.clone());
    first.handle_connect(connect("C1", 10, false, 5)).await;
    first.handle_publish(nbirth("C1", 5)).await.unwrap();
    first.handle_publish(dbirth("C1", "D1", 1)).await.unwrap();
    first.handle_publish(ndata("C1", 2)).await.unwrap();
    first.handle_disconnect(disconnect("C1")).await;

    let birth = persistence
        .load_birth(MessageType::NBirth, &NodeKey::new("G1", "N1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(JsonPayloadCodec.decode(&birth).unwrap().bd_seq(), Some(5));

    let second = MessageProcessor::new(
        clock.clone(),
        Config::default(),
        h.transport.clone(),
        Arc::new(JsonPayloadCodec),
    )
    .with_persistence(persistence.clone());
    second.restore().await.unwrap();

    let node = second.registry().node(&NodeKey::new("G1", "N1")).unwrap();
    assert_eq!((node.bd_seq, node.seq), (5, 2));
    assert!(second
        .registry()
        .device(&NodeKey::new("G1", "N1").device("D1"))
        .unwrap()
        .online);
    let session = second.sessions().get_session("C1").unwrap();
    assert!(!session.connected);
    assert_eq!(session.bd_seq, Some(5));
    assert!(second.handle_publish(ndata("C1", 3)).await.is_ok());
}

#[tokio::test]
async fn clean_disconnect_removes_session_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(Config::default());
    let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(dir.path()).await.unwrap());
    let persistence = Arc::new(StatePersistence::new(store, StoreConfig::default()));
    let processor = MessageProcessor::new(
        h.clock.clone(),
        Config::default(),
        h.transport.clone(),
        Arc::new(JsonPayloadCodec),
    )
    .with_persistence(persistence.clone());

    processor.handle_connect(connect("C1", 10, true, 0)).await;
    assert!(persistence.load_session("C1").await.unwrap().is_some());
    processor.handle_disconnect(disconnect("C1")).await;
    assert!(persistence.load_session("C1").await.unwrap().is_none());
}

#[tokio::test]
async fn one_damaged_checkpoint_does_not_abort_restore() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(Config::default());
    let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(dir.path()).await.unwrap());
    let persistence = Arc::new(StatePersistence::new(store, StoreConfig::default()));
    let first = MessageProcessor::new(
        h.clock.clone(),
        Config::default(),
        h.transport.clone(),
        Arc::new(JsonPayloadCodec),
    )
    .with_persistence(persistence.clone());
    first.handle_publish(nbirth("C1", 0)).await.unwrap();
    std::fs::write(dir.path().join("state%3Anodes%3AG1%3Abroken.rec"), b"abc").unwrap();

    let second = MessageProcessor::new(
        h.clock.clone(),
        Config::default(),
        h.transport.clone(),
        Arc::new(JsonPayloadCodec),
    )
    .with_persistence(persistence);
    second.restore().await.unwrap();
    assert!(second.registry().node(&NodeKey::new("G1", "N1")).is_some());
    assert_eq!(second.registry().node_count(), 1);
}
