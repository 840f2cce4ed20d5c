//! File transfer through device handles

use std::sync::{Arc, Mutex};

use adbridge::client::test_utils::MockAdbServer;
use adbridge::client::{NullSyncProgress, SyncProgress};
use adbridge::core::SyncResultCode;
use adbridge::Error;

use crate::bridge_with_device;

/// Shares observed totals with the test.
#[derive(Clone, Default)]
struct SharedProgress {
    total: Arc<Mutex<Option<u64>>>,
    last: Arc<Mutex<u64>>,
}

impl SyncProgress for SharedProgress {
    fn on_start(&mut self, total_bytes: u64) {
        *self.total.lock().unwrap() = Some(total_bytes);
    }

    fn on_progress(&mut self, transferred: u64) {
        *self.last.lock().unwrap() = transferred;
    }
}

#[tokio::test]
async fn test_push_then_pull_preserves_bytes() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;
    let temp = tempfile::tempdir().unwrap();

    // Spans several DATA chunks
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    let local = temp.path().join("blob.bin");
    std::fs::write(&local, &payload).unwrap();

    let mut progress = SharedProgress::default();
    device
        .push_file(&local, "/sdcard/blob.bin", &mut progress)
        .await
        .unwrap();
    assert_eq!(*progress.total.lock().unwrap(), Some(payload.len() as u64));
    assert_eq!(*progress.last.lock().unwrap(), payload.len() as u64);

    let pulled = temp.path().join("pulled.bin");
    device
        .pull_file("/sdcard/blob.bin", &pulled, &mut NullSyncProgress)
        .await
        .unwrap();
    let roundtrip = std::fs::read(&pulled).unwrap();
    assert_eq!(roundtrip.len(), payload.len());
    assert_eq!(roundtrip, payload);
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_pull_missing_file() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;
    let temp = tempfile::tempdir().unwrap();
    let local = temp.path().join("nothing.txt");

    let err = device
        .pull_file("/sdcard/nothing.txt", &local, &mut NullSyncProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        Error::SyncFailed { code: SyncResultCode::NoRemoteObject, .. }
    ));
    assert!(!local.exists());
    bridge.shutdown().await;
}

#[tokio::test]
async fn test_session_stat_and_list() {
    let server = MockAdbServer::start().await;
    server.set_devices(&[("emulator-5554", "device")]);
    server.put_file("/sdcard/Download/a.txt", b"aaa");
    server.put_file("/sdcard/Download/b.txt", b"bbbbbb");
    let (bridge, device) = bridge_with_device(&server, "emulator-5554").await;

    let mut session = device.sync_session().await.unwrap().expect("sync available");
    let entry = session.stat("/sdcard/Download/b.txt").await.unwrap().unwrap();
    assert!(entry.is_file());
    assert_eq!(entry.size, 6);
    assert!(session.stat("/sdcard/missing").await.unwrap().is_none());

    let mut names: Vec<String> = session
        .list("/sdcard/Download")
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["a.txt", "b.txt"]);
    session.close().await;
    bridge.shutdown().await;
}
