//! End-to-end tests for fsync-core.
//!
//! Runs listener and initiator engines against each other over loopback TCP:
//! bind, dial, handshake, fingerprint exchange, confirmation and transfer.

use std::time::Duration;

use fsync_core::{
    AutoConfirm, ContentHash, DirectoryScope, InitiatorState, ListenOutcome, ListenerState,
    MemoryPeerStore, PeerAddress, PeerStore, PushOutcome, SyncConfig, SyncEngine, SyncError,
    SyncListener, SyncStep,
};
use tempfile::TempDir;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> SyncConfig {
    SyncConfig {
        io_timeout: Some(Duration::from_secs(5)),
        confirm_timeout: Some(Duration::from_secs(5)),
        ..SyncConfig::default()
    }
}

fn engine_in(dir: &TempDir) -> SyncEngine {
    SyncEngine::new(DirectoryScope::new(dir.path()).unwrap(), config())
}

/// Bind a listener on an ephemeral loopback port.
async fn bind_listener() -> (SyncListener, PeerAddress) {
    let listener = SyncListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, PeerAddress::with_port("127.0.0.1", port).unwrap())
}

/// A loopback port with nothing listening on it.
fn dead_peer() -> PeerAddress {
    let socket = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = socket.local_addr().unwrap().port();
    drop(socket);
    PeerAddress::with_port("127.0.0.1", port).unwrap()
}

#[tokio::test]
async fn test_push_single_file_over_tcp() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    std::fs::write(a_dir.path().join("x.txt"), b"hello").unwrap();

    let (listener, addr) = bind_listener().await;
    let mut b = engine_in(&b_dir);
    let listen = tokio::spawn(async move {
        let outcome = b.await_sync(&listener, &AutoConfirm(true)).await;
        (outcome, b.listener_state())
    });

    let mut a = engine_in(&a_dir);
    let reports = timeout(TEST_TIMEOUT, a.init_sync(&[addr.clone()], &[]))
        .await
        .expect("initiator timed out");

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].peer, addr);
    assert_eq!(
        reports[0].result.as_ref().unwrap(),
        &PushOutcome::Sent { files: 1, bytes: 5 }
    );
    assert_eq!(a.initiator_state(), InitiatorState::Done);

    let (outcome, state) = timeout(TEST_TIMEOUT, listen).await.unwrap().unwrap();
    assert_eq!(outcome.unwrap(), ListenOutcome::Received { files: 1, bytes: 5 });
    assert_eq!(state, ListenerState::Done);

    let received = std::fs::read(b_dir.path().join("x.txt")).unwrap();
    assert_eq!(ContentHash::of(&received), ContentHash::of(b"hello"));
}

#[tokio::test]
async fn test_multi_chunk_files_over_tcp() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    let big: Vec<u8> = (0..200_000u32).map(|i| (i * 7 % 256) as u8).collect();
    std::fs::write(a_dir.path().join("big.bin"), &big).unwrap();
    std::fs::write(a_dir.path().join("empty.txt"), b"").unwrap();

    let (listener, addr) = bind_listener().await;
    let mut b = engine_in(&b_dir);
    let listen =
        tokio::spawn(async move { b.await_sync(&listener, &AutoConfirm(true)).await });

    let mut a = engine_in(&a_dir);
    let reports = timeout(TEST_TIMEOUT, a.init_sync(&[addr], &[]))
        .await
        .unwrap();
    assert!(reports[0].is_ok());

    let outcome = timeout(TEST_TIMEOUT, listen).await.unwrap().unwrap();
    assert_eq!(
        outcome.unwrap(),
        ListenOutcome::Received {
            files: 2,
            bytes: big.len() as u64
        }
    );
    assert_eq!(std::fs::read(b_dir.path().join("big.bin")).unwrap(), big);
    assert_eq!(
        std::fs::read(b_dir.path().join("empty.txt")).unwrap().len(),
        0
    );
}

#[tokio::test]
async fn test_declined_over_tcp() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    std::fs::write(a_dir.path().join("x.txt"), b"hello").unwrap();

    let (listener, addr) = bind_listener().await;
    let mut b = engine_in(&b_dir);
    let listen =
        tokio::spawn(async move { b.await_sync(&listener, &AutoConfirm(false)).await });

    let mut a = engine_in(&a_dir);
    let reports = timeout(TEST_TIMEOUT, a.init_sync(&[addr], &[]))
        .await
        .unwrap();

    assert_eq!(
        reports[0].result.as_ref().unwrap(),
        &PushOutcome::Declined
    );
    let outcome = timeout(TEST_TIMEOUT, listen).await.unwrap().unwrap();
    assert_eq!(outcome.unwrap(), ListenOutcome::Declined);
    assert!(!b_dir.path().join("x.txt").exists());
}

#[tokio::test]
async fn test_failed_peer_does_not_stop_the_next() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    std::fs::write(a_dir.path().join("x.txt"), b"hello").unwrap();

    let (listener, live) = bind_listener().await;
    let mut b = engine_in(&b_dir);
    let listen =
        tokio::spawn(async move { b.await_sync(&listener, &AutoConfirm(true)).await });

    let dead = dead_peer();
    let mut a = engine_in(&a_dir);
    let reports = timeout(TEST_TIMEOUT, a.init_sync(&[dead.clone(), live.clone()], &[]))
        .await
        .unwrap();

    assert_eq!(reports.len(), 2);
    assert_eq!(reports[0].peer, dead);
    assert!(matches!(
        reports[0].result,
        Err(SyncError::Transport {
            step: SyncStep::Connect,
            ..
        })
    ));
    assert_eq!(reports[1].peer, live);
    assert!(reports[1].is_ok());

    timeout(TEST_TIMEOUT, listen).await.unwrap().unwrap().unwrap();
    assert!(b_dir.path().join("x.txt").exists());
}

#[tokio::test]
async fn test_registered_peers_from_store() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    std::fs::write(a_dir.path().join("notes.txt"), b"from the store").unwrap();

    let (listener, addr) = bind_listener().await;
    let mut b = engine_in(&b_dir);
    let listen =
        tokio::spawn(async move { b.await_sync(&listener, &AutoConfirm(true)).await });

    let store = MemoryPeerStore::new();
    store.append(addr).unwrap();

    let mut a = engine_in(&a_dir);
    let reports = timeout(TEST_TIMEOUT, a.init_sync_registered(&store, &[]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_ok());

    timeout(TEST_TIMEOUT, listen).await.unwrap().unwrap().unwrap();
    assert_eq!(
        std::fs::read(b_dir.path().join("notes.txt")).unwrap(),
        b"from the store"
    );
}

#[tokio::test]
async fn test_second_sync_sends_nothing() {
    let a_dir = TempDir::new().unwrap();
    let b_dir = TempDir::new().unwrap();
    std::fs::write(a_dir.path().join("x.txt"), b"hello").unwrap();

    for expected_files in [1, 0] {
        let (listener, addr) = bind_listener().await;
        let mut b = engine_in(&b_dir);
        let listen =
            tokio::spawn(async move { b.await_sync(&listener, &AutoConfirm(true)).await });

        let mut a = engine_in(&a_dir);
        let reports = timeout(TEST_TIMEOUT, a.init_sync(&[addr], &[]))
            .await
            .unwrap();
        match reports[0].result.as_ref().unwrap() {
            PushOutcome::Sent { files, .. } => assert_eq!(*files, expected_files),
            other => panic!("unexpected outcome {other:?}"),
        }
        timeout(TEST_TIMEOUT, listen).await.unwrap().unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_bind_conflict_is_reported() {
    let (listener, addr) = bind_listener().await;

    let err = SyncListener::bind(&addr.to_string()).await.unwrap_err();
    assert!(matches!(err, SyncError::Bind { .. }));
    drop(listener);
}
